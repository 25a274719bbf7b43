//! Accrual authority client
//!
//! The authority judges each order and reports a reward. The loop only needs
//! `get_verdict`; the HTTP client speaks the `GET /api/orders/{number}` API.

use crate::{types::Verdict, Error, Result};
use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, Client, StatusCode};
use std::fmt::Debug;
use std::time::Duration;

/// External service that decides order validity and reward
#[async_trait]
pub trait AccrualAuthority: Send + Sync + Debug {
    /// Current verdict for `order_number`; `None` while the authority does not
    /// know the order yet
    async fn get_verdict(&self, order_number: &str) -> Result<Option<Verdict>>;
}

/// reqwest-backed accrual authority client
#[derive(Debug, Clone)]
pub struct HttpAccrualClient {
    base_url: String,
    http_client: Client,
    rate_limit_backoff: Duration,
}

impl HttpAccrualClient {
    /// Build a client for `base_url` with a per-request `timeout`
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
            rate_limit_backoff: Duration::from_secs(60),
        })
    }

    /// Back-off used when a 429 carries no usable Retry-After header
    pub fn with_rate_limit_backoff(mut self, backoff: Duration) -> Self {
        self.rate_limit_backoff = backoff;
        self
    }

    /// Base URL requests are sent to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn retry_after(&self, response: &reqwest::Response) -> Duration {
        response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(self.rate_limit_backoff)
    }
}

#[async_trait]
impl AccrualAuthority for HttpAccrualClient {
    async fn get_verdict(&self, order_number: &str) -> Result<Option<Verdict>> {
        let url = format!("{}/api/orders/{}", self.base_url, order_number);

        tracing::debug!(order_number, %url, "Requesting accrual verdict");

        let response = self.http_client.get(&url).send().await?;
        let status = response.status();

        match status {
            StatusCode::OK => {
                let body = response.bytes().await?;
                let verdict: Verdict = serde_json::from_slice(&body)
                    .map_err(|e| Error::AccrualDecode(format!("order {}: {}", order_number, e)))?;
                verdict.accrual_amount()?;
                Ok(Some(verdict))
            }
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = self.retry_after(&response);
                tracing::warn!(
                    order_number,
                    retry_after_secs = retry_after.as_secs(),
                    "Accrual authority rate limit"
                );
                Err(Error::RateLimited { retry_after })
            }
            other => Err(Error::Accrual(format!(
                "unexpected status {} for order {}",
                other, order_number
            ))),
        }
    }
}
