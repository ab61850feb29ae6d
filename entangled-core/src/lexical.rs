//! Lexical rules shared by the canonicalizer and the compact codec.
//!
//! The encoder marks a string as "forced" exactly when [`classify`] would
//! turn it into something else, and the decoder coerces unforced tokens with
//! the same function, so both sides always agree.

use crate::canonical::Scalar;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Scalar(Scalar),
    Undefined,
}

/// Shortest round-trip form that always carries a `.` or an exponent.
pub(crate) fn format_float(value: f64) -> String {
    format!("{value:?}")
}

/// Interprets `text` as a typed token, or `None` if it is an ordinary string.
pub(crate) fn classify(text: &str) -> Option<Token> {
    match text {
        "true" => return Some(Token::Scalar(Scalar::Bool(true))),
        "false" => return Some(Token::Scalar(Scalar::Bool(false))),
        "null" => return Some(Token::Scalar(Scalar::Null)),
        "undefined" => return Some(Token::Undefined),
        _ => {}
    }

    let unsigned = strip_sign(text);
    if unsigned.is_empty() {
        return None;
    }
    if all_digits(unsigned) {
        return match text.parse::<i64>() {
            Ok(value) => Some(Token::Scalar(Scalar::Int(value))),
            Err(_) => parse_float(text),
        };
    }
    if is_float_literal(unsigned) {
        return parse_float(text);
    }
    None
}

fn strip_sign(text: &str) -> &str {
    text.strip_prefix(|c| c == '+' || c == '-').unwrap_or(text)
}

fn all_digits(text: &str) -> bool {
    text.bytes().all(|b| b.is_ascii_digit())
}

fn is_float_literal(text: &str) -> bool {
    let (mantissa, exponent) = match text.find(|c| c == 'e' || c == 'E') {
        Some(at) => (&text[..at], Some(&text[at + 1..])),
        None => (text, None),
    };
    let (integral, fraction) = match mantissa.split_once('.') {
        Some((integral, fraction)) => (integral, Some(fraction)),
        None => (mantissa, None),
    };

    if !all_digits(integral) || !fraction.map_or(true, all_digits) {
        return false;
    }
    if integral.is_empty() && fraction.map_or(true, str::is_empty) {
        return false;
    }
    if fraction.is_none() && exponent.is_none() {
        return false;
    }
    match exponent {
        Some(exponent) => {
            let digits = strip_sign(exponent);
            !digits.is_empty() && all_digits(digits)
        }
        None => true,
    }
}

fn parse_float(text: &str) -> Option<Token> {
    text.parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .map(|value| Token::Scalar(Scalar::Float(value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar(text: &str) -> Option<Scalar> {
        match classify(text) {
            Some(Token::Scalar(scalar)) => Some(scalar),
            _ => None,
        }
    }

    #[test]
    fn test_literals() {
        assert_eq!(scalar("true"), Some(Scalar::Bool(true)));
        assert_eq!(scalar("false"), Some(Scalar::Bool(false)));
        assert_eq!(scalar("null"), Some(Scalar::Null));
        assert_eq!(classify("undefined"), Some(Token::Undefined));
        assert_eq!(classify("True"), None);
    }

    #[test]
    fn test_integers() {
        assert_eq!(scalar("0"), Some(Scalar::Int(0)));
        assert_eq!(scalar("-42"), Some(Scalar::Int(-42)));
        assert_eq!(scalar("+7"), Some(Scalar::Int(7)));
        assert_eq!(scalar("007"), Some(Scalar::Int(7)));
        assert_eq!(scalar("99999999999999999999"), Some(Scalar::Float(1e20)));
    }

    #[test]
    fn test_floats() {
        assert_eq!(scalar("1.5"), Some(Scalar::Float(1.5)));
        assert_eq!(scalar(".5"), Some(Scalar::Float(0.5)));
        assert_eq!(scalar("1."), Some(Scalar::Float(1.0)));
        assert_eq!(scalar("1e21"), Some(Scalar::Float(1e21)));
        assert_eq!(scalar("-2.5E-3"), Some(Scalar::Float(-2.5e-3)));
        assert_eq!(scalar("1e999"), None);
    }

    #[test]
    fn test_plain_strings() {
        for text in ["", "+", "-", ".", "e5", "1e", "1.2.3", "0x10", "1 ", " 1", "NaN", "inf", "abc"] {
            assert_eq!(classify(text), None, "{text:?}");
        }
    }

    #[test]
    fn test_format_float_is_recognised_as_float() {
        for value in [0.0, -0.0, 1.0, 0.1 + 0.2, 1e16, 1e-7, -123.456, f64::MAX, f64::MIN_POSITIVE] {
            let text = format_float(value);
            assert!(text.contains('.') || text.contains('e'), "{text}");
            assert_eq!(scalar(&text), Some(Scalar::Float(value)));
        }
    }
}
