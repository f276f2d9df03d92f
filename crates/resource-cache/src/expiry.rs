use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, de};
use serde_json::Value;
use thiserror::Error;

/// An expiration as reported by a fetched resource.
///
/// Resources report their expiration in all sorts of ways. Every variant is normalized to
/// an instant in milliseconds via [`Expiry::to_millis`].
#[derive(Clone, Debug, PartialEq)]
pub enum Expiry {
    /// An instant in milliseconds.
    Instant(i64),
    /// A textual instant, either numeric (`"1700000000000"`), RFC 3339
    /// (`"2023-11-14T22:13:20Z"`) or RFC 2822 (`"Tue, 14 Nov 2023 22:13:20 GMT"`).
    Text(String),
    /// A calendar date.
    Date(DateTime<Utc>),
}

/// An error normalizing an [`Expiry`].
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ExpiryError {
    /// The selected field does not exist or is `null`.
    #[error("missing expiration field `{0}`")]
    Missing(String),
    /// The expiration is an empty string.
    #[error("empty expiration")]
    Empty,
    /// The expiration is neither numeric nor a known date format.
    #[error("unrecognized expiration `{0}`")]
    Unrecognized(String),
    /// The expiration is a number that is not a representable instant.
    #[error("expiration `{0}` is out of range")]
    OutOfRange(String),
    /// The selected field holds a value that cannot be an expiration.
    #[error("expiration must be a number or a string, got {0}")]
    UnsupportedType(&'static str),
}

impl Expiry {
    /// Reads an expiration out of a JSON value.
    pub fn from_json(value: &Value) -> Result<Self, ExpiryError> {
        match value {
            Value::Number(number) => {
                if let Some(millis) = number.as_i64() {
                    Ok(Self::Instant(millis))
                } else {
                    number
                        .as_f64()
                        .and_then(float_to_millis)
                        .map(Self::Instant)
                        .ok_or_else(|| ExpiryError::OutOfRange(number.to_string()))
                }
            }
            Value::String(text) => Ok(Self::Text(text.clone())),
            Value::Null => Err(ExpiryError::UnsupportedType("null")),
            Value::Bool(_) => Err(ExpiryError::UnsupportedType("a boolean")),
            Value::Array(_) => Err(ExpiryError::UnsupportedType("an array")),
            Value::Object(_) => Err(ExpiryError::UnsupportedType("an object")),
        }
    }

    /// Normalizes this expiration to an instant in milliseconds.
    pub fn to_millis(&self) -> Result<i64, ExpiryError> {
        match self {
            Self::Instant(millis) => Ok(*millis),
            Self::Date(date) => Ok(date.timestamp_millis()),
            Self::Text(text) => parse_text(text),
        }
    }
}

impl From<i64> for Expiry {
    fn from(millis: i64) -> Self {
        Self::Instant(millis)
    }
}

impl From<DateTime<Utc>> for Expiry {
    fn from(date: DateTime<Utc>) -> Self {
        Self::Date(date)
    }
}

impl From<String> for Expiry {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Expiry {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

fn float_to_millis(value: f64) -> Option<i64> {
    let floored = value.floor();
    // `i64::MAX as f64` rounds up to 2^63, which is already out of range.
    (floored.is_finite() && floored >= i64::MIN as f64 && floored < i64::MAX as f64)
        .then_some(floored as i64)
}

fn parse_text(text: &str) -> Result<i64, ExpiryError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ExpiryError::Empty);
    }

    if let Ok(millis) = text.parse::<i64>() {
        return Ok(millis);
    }
    if let Ok(float) = text.parse::<f64>() {
        return float_to_millis(float).ok_or_else(|| ExpiryError::OutOfRange(text.to_owned()));
    }

    DateTime::parse_from_rfc3339(text)
        .or_else(|_| DateTime::parse_from_rfc2822(text))
        .map(|date| date.timestamp_millis())
        .map_err(|_| ExpiryError::Unrecognized(text.to_owned()))
}

/// Selects the expiration out of a serialized resource.
///
/// A selector starting with `/` is a JSON pointer (`/token/expires_at`), anything else is
/// the name of a top-level field. It defaults to the `expires` field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExpiresSelector {
    /// A top-level field.
    Field(String),
    /// A JSON pointer, as defined by RFC 6901.
    Pointer(String),
}

impl ExpiresSelector {
    /// Parses a selector, treating a leading `/` as a JSON pointer.
    pub fn new(selector: impl Into<String>) -> Self {
        let selector = selector.into();
        if selector.starts_with('/') {
            Self::Pointer(selector)
        } else {
            Self::Field(selector)
        }
    }

    /// Returns the selected, non-null value.
    pub fn select<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        let selected = match self {
            Self::Field(name) => value.get(name),
            Self::Pointer(pointer) => value.pointer(pointer),
        };
        selected.filter(|value| !value.is_null())
    }

    /// Selects and parses the expiration out of `value`.
    pub fn extract(&self, value: &Value) -> Result<Expiry, ExpiryError> {
        let selected = self
            .select(value)
            .ok_or_else(|| ExpiryError::Missing(self.to_string()))?;
        Expiry::from_json(selected)
    }
}

impl Default for ExpiresSelector {
    fn default() -> Self {
        Self::Field("expires".to_owned())
    }
}

impl fmt::Display for ExpiresSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(name) => f.write_str(name),
            Self::Pointer(pointer) => f.write_str(pointer),
        }
    }
}

#[derive(Debug)]
struct ExpiresSelectorVisitor;

impl de::Visitor<'_> for ExpiresSelectorVisitor {
    type Value = ExpiresSelector;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(
            formatter,
            "a field name or a JSON pointer selecting the expiration"
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        if v.is_empty() {
            return Err(E::invalid_value(de::Unexpected::Str(v), &self));
        }
        Ok(ExpiresSelector::new(v))
    }
}

impl<'de> Deserialize<'de> for ExpiresSelector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // `deserialize_any`, so that YAML does not turn `expires: 3` into the field "3".
        deserializer.deserialize_any(ExpiresSelectorVisitor)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_numeric_expirations() {
        assert_eq!(Expiry::Instant(1000).to_millis(), Ok(1000));
        assert_eq!(Expiry::from("1000").to_millis(), Ok(1000));
        assert_eq!(Expiry::from(" 1000.9 ").to_millis(), Ok(1000));
        assert_eq!(Expiry::from("-1.5").to_millis(), Ok(-2));
        assert_eq!(
            Expiry::from_json(&json!(2000.5)).and_then(|e| e.to_millis()),
            Ok(2000)
        );
    }

    #[test]
    fn test_date_expirations() {
        let date = Utc.with_ymd_and_hms(2023, 11, 14, 22, 13, 20).unwrap();
        let millis = 1_700_000_000_000;

        assert_eq!(Expiry::from(date).to_millis(), Ok(millis));
        assert_eq!(Expiry::from("2023-11-14T22:13:20Z").to_millis(), Ok(millis));
        assert_eq!(
            Expiry::from("2023-11-14T23:13:20+01:00").to_millis(),
            Ok(millis)
        );
        assert_eq!(
            Expiry::from("Tue, 14 Nov 2023 22:13:20 GMT").to_millis(),
            Ok(millis)
        );
    }

    #[test]
    fn test_invalid_expirations() {
        assert_eq!(Expiry::from("  ").to_millis(), Err(ExpiryError::Empty));
        assert_eq!(
            Expiry::from("tomorrow").to_millis(),
            Err(ExpiryError::Unrecognized("tomorrow".into()))
        );
        assert_eq!(
            Expiry::from("1e300").to_millis(),
            Err(ExpiryError::OutOfRange("1e300".into()))
        );
        assert_eq!(
            Expiry::from_json(&json!(true)),
            Err(ExpiryError::UnsupportedType("a boolean"))
        );
    }

    #[test]
    fn test_selectors() {
        let value = json!({
            "expires": 1000,
            "notAfter": "2000",
            "token": { "expires_at": 3000 },
            "revoked": null,
        });

        let extract = |selector: &str| {
            ExpiresSelector::new(selector)
                .extract(&value)
                .and_then(|expiry| expiry.to_millis())
        };

        assert_eq!(ExpiresSelector::default().extract(&value), Ok(Expiry::Instant(1000)));
        assert_eq!(extract("notAfter"), Ok(2000));
        assert_eq!(extract("/token/expires_at"), Ok(3000));
        assert_eq!(extract("revoked"), Err(ExpiryError::Missing("revoked".into())));
        assert_eq!(
            extract("/token/nope"),
            Err(ExpiryError::Missing("/token/nope".into()))
        );
    }

    #[test]
    fn test_deserialize_selector() {
        let selector: ExpiresSelector = serde_json::from_value(json!("notAfter")).unwrap();
        assert_eq!(selector, ExpiresSelector::Field("notAfter".into()));

        let selector: ExpiresSelector = serde_json::from_value(json!("/a/b")).unwrap();
        assert_eq!(selector, ExpiresSelector::Pointer("/a/b".into()));

        assert!(serde_json::from_value::<ExpiresSelector>(json!(3)).is_err());
        assert!(serde_json::from_value::<ExpiresSelector>(json!("")).is_err());
    }
}
