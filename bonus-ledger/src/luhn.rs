//! Luhn checksum validation for order numbers and spend references

use crate::{Error, Result};

/// Whether `number` is a non-empty ASCII digit string with a valid Luhn checksum
pub fn is_valid(number: &str) -> bool {
    if number.is_empty() {
        return false;
    }

    let mut sum = 0u32;
    for (position, byte) in number.bytes().rev().enumerate() {
        if !byte.is_ascii_digit() {
            return false;
        }
        let mut digit = u32::from(byte - b'0');
        if position % 2 == 1 {
            digit *= 2;
            if digit > 9 {
                digit -= 9;
            }
        }
        sum = (sum + digit) % 10;
    }

    sum == 0
}

/// Validate an order number, rejecting it with `InvalidOrderNumber`
pub fn validate(number: &str) -> Result<()> {
    if is_valid(number) {
        Ok(())
    } else {
        Err(Error::InvalidOrderNumber(number.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_valid_numbers() {
        for number in ["79927398713", "12345678903", "9278923470", "2377225624", "0"] {
            assert!(is_valid(number), "{} should pass", number);
        }
    }

    #[test]
    fn test_known_invalid_numbers() {
        for number in ["79927398710", "12345678902", "", "1234 5678 903", "12a45", "-79927398713"] {
            assert!(!is_valid(number), "{:?} should fail", number);
        }
    }

    #[test]
    fn test_very_long_input() {
        let body = "9".repeat(1_000_000);
        let valid: Vec<String> = (0..10)
            .map(|d| format!("{}{}", body, d))
            .filter(|candidate| is_valid(candidate))
            .collect();
        assert_eq!(valid.len(), 1);

        assert!(is_valid(&"0".repeat(2_000_000)));
    }

    #[test]
    fn test_validate_error() {
        let err = validate("12345678902").unwrap_err();
        assert!(matches!(err, Error::InvalidOrderNumber(n) if n == "12345678902"));
        assert!(validate("12345678903").is_ok());
    }
}
