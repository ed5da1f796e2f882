//! Coercion of raw property values to their declared types.
//!
//! Values arrive as JSON (from JSON tables, parsed documents or graph
//! projections) or as text (CSV/TSV cells, always wrapped as
//! `Value::String`). Numbers use `.` as the decimal point regardless of
//! locale.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Number, Value};

use crate::config::PropertyType;

/// Tokens accepted for booleans (case-insensitive).
const TRUE_TOKENS: [&str; 5] = ["true", "t", "yes", "y", "1"];
const FALSE_TOKENS: [&str; 5] = ["false", "f", "no", "n", "0"];

/// Convert `value` to `property_type`. `None` means the value cannot be
/// represented; the caller records a coercion error.
pub fn coerce(value: &Value, property_type: PropertyType) -> Option<Value> {
    match property_type {
        PropertyType::String => match value {
            Value::String(s) => Some(Value::String(s.clone())),
            Value::Number(n) => Some(Value::String(n.to_string())),
            Value::Bool(b) => Some(Value::String(b.to_string())),
            _ => None,
        },
        PropertyType::Float => {
            let f = match value {
                Value::Number(n) => n.as_f64()?,
                Value::String(s) => s.trim().parse::<f64>().ok()?,
                _ => return None,
            };
            Number::from_f64(f).map(Value::Number)
        }
        PropertyType::Integer => match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(Value::Number(n.clone())),
            Value::Number(n) => integral(n.as_f64()?),
            Value::String(s) => {
                let s = s.trim();
                match s.parse::<i64>() {
                    Ok(i) => Some(Value::from(i)),
                    Err(_) => integral(s.parse::<f64>().ok()?),
                }
            }
            _ => None,
        },
        PropertyType::Boolean => match value {
            Value::Bool(b) => Some(Value::Bool(*b)),
            Value::Number(n) => match n.as_f64()? {
                x if x == 1.0 => Some(Value::Bool(true)),
                x if x == 0.0 => Some(Value::Bool(false)),
                _ => None,
            },
            Value::String(s) => {
                let token = s.trim().to_ascii_lowercase();
                if TRUE_TOKENS.contains(&token.as_str()) {
                    Some(Value::Bool(true))
                } else if FALSE_TOKENS.contains(&token.as_str()) {
                    Some(Value::Bool(false))
                } else {
                    None
                }
            }
            _ => None,
        },
        PropertyType::Timestamp => {
            let text = value.as_str()?;
            parse_timestamp(text.trim())
                .map(|t| Value::String(t.to_rfc3339_opts(SecondsFormat::AutoSi, true)))
        }
        PropertyType::List => match value {
            Value::Array(_) => Some(value.clone()),
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(parsed @ Value::Array(_)) => Some(parsed),
                _ => None,
            },
            _ => None,
        },
        PropertyType::Dictionary => match value {
            Value::Object(_) => Some(value.clone()),
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(parsed @ Value::Object(_)) => Some(parsed),
                _ => None,
            },
            _ => None,
        },
    }
}

fn integral(f: f64) -> Option<Value> {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Some(Value::from(f as i64))
    } else {
        None
    }
}

/// ISO-8601 timestamp: with offset, naive (taken as UTC), or a bare date.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(text) {
        return Some(t.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(text, format) {
            return Some(t.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc())
}

/// Short text form of a value for error messages.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text(s: &str) -> Value {
        Value::String(s.to_string())
    }

    #[test]
    fn floats_use_a_dot() {
        assert_eq!(coerce(&text("-3.25"), PropertyType::Float), Some(json!(-3.25)));
        assert_eq!(coerce(&text(" 1e-3 "), PropertyType::Float), Some(json!(0.001)));
        assert_eq!(coerce(&json!(2), PropertyType::Float), Some(json!(2.0)));
        assert_eq!(coerce(&text("3,25"), PropertyType::Float), None);
        assert_eq!(coerce(&text("NaN"), PropertyType::Float), None);
    }

    #[test]
    fn integers_accept_integral_floats() {
        assert_eq!(coerce(&text("42"), PropertyType::Integer), Some(json!(42)));
        assert_eq!(coerce(&text("3.0"), PropertyType::Integer), Some(json!(3)));
        assert_eq!(coerce(&json!(7.0), PropertyType::Integer), Some(json!(7)));
        assert_eq!(coerce(&text("3.5"), PropertyType::Integer), None);
        assert_eq!(coerce(&text("many"), PropertyType::Integer), None);
    }

    #[test]
    fn boolean_tokens() {
        for token in ["true", "T", "yes", "Y", "1"] {
            assert_eq!(coerce(&text(token), PropertyType::Boolean), Some(json!(true)));
        }
        for token in ["false", "F", "No", "n", "0"] {
            assert_eq!(coerce(&text(token), PropertyType::Boolean), Some(json!(false)));
        }
        assert_eq!(coerce(&text("maybe"), PropertyType::Boolean), None);
        assert_eq!(coerce(&json!(1), PropertyType::Boolean), Some(json!(true)));
    }

    #[test]
    fn timestamps_normalize_to_utc() {
        assert_eq!(
            coerce(&text("2024-03-01T12:00:00+02:00"), PropertyType::Timestamp),
            Some(json!("2024-03-01T10:00:00Z"))
        );
        assert_eq!(
            coerce(&text("2024-03-01 08:30:00"), PropertyType::Timestamp),
            Some(json!("2024-03-01T08:30:00Z"))
        );
        assert_eq!(
            coerce(&text("2024-03-01"), PropertyType::Timestamp),
            Some(json!("2024-03-01T00:00:00Z"))
        );
        assert_eq!(coerce(&text("yesterday"), PropertyType::Timestamp), None);
    }

    #[test]
    fn strings_lists_and_dictionaries() {
        assert_eq!(coerce(&json!(12), PropertyType::String), Some(json!("12")));
        assert_eq!(coerce(&json!([1]), PropertyType::String), None);
        assert_eq!(coerce(&text("[1, 2]"), PropertyType::List), Some(json!([1, 2])));
        assert_eq!(coerce(&text("{\"a\": 1}"), PropertyType::List), None);
        assert_eq!(
            coerce(&text("{\"a\": 1}"), PropertyType::Dictionary),
            Some(json!({"a": 1}))
        );
    }
}
