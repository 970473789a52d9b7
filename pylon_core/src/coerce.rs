//! Numeric coercion for console fields.
//!
//! The console prints whatever the firmware has in its buffers, so every
//! conversion here falls back to a default instead of failing.

use crate::constants::frame::{FIELD_DELIMITER, THOUSANDTHS};

/// Parses a signed integer field, returning `0` for empty or non-numeric text.
pub fn to_i64(text: &str) -> i64 {
    text.trim().parse().unwrap_or(0)
}

/// Parses a thousandths-encoded field into engineering units.
///
/// Integers are the normal case. Decimal text is accepted as well since some
/// firmware revisions print a fractional raw value. Anything else maps to `0.0`.
pub fn to_scaled(text: &str) -> f64 {
    let text = text.trim();
    if let Ok(raw) = text.parse::<i64>() {
        return raw as f64 / THOUSANDTHS;
    }
    match text.parse::<f64>() {
        Ok(raw) if raw.is_finite() => raw / THOUSANDTHS,
        _ => 0.0,
    }
}

/// Parses a footer line as a non-negative integer.
///
/// Delimiters are stripped first, so both `150` and `150#` read as 150.
/// Negative, empty, or garbled text maps to `0`.
pub fn to_counter(text: &str) -> u64 {
    let cleaned: String = text
        .chars()
        .filter(|c| *c != FIELD_DELIMITER)
        .collect();
    cleaned.trim().parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_i64_defaults() {
        assert_eq!(to_i64(""), 0);
        assert_eq!(to_i64("abc"), 0);
        assert_eq!(to_i64(" 1000 "), 1000);
        assert_eq!(to_i64("-250"), -250);
    }

    #[test]
    fn test_to_scaled() {
        assert_eq!(to_scaled("51200"), 51.2);
        assert_eq!(to_scaled("-10500"), -10.5);
        assert_eq!(to_scaled("3300.0"), 3.3);
        assert_eq!(to_scaled("NaN"), 0.0);
        assert_eq!(to_scaled("--"), 0.0);
        assert_eq!(to_scaled(""), 0.0);
    }

    #[test]
    fn test_to_counter() {
        assert_eq!(to_counter("150"), 150);
        assert_eq!(to_counter("150#"), 150);
        assert_eq!(to_counter("#0#"), 0);
        assert_eq!(to_counter("-3"), 0);
        assert_eq!(to_counter("x1"), 0);
    }
}
