//! # Event
//!
//! Login events as they arrive in a queue message body (`RawEvent`) and as they
//! are written to the `user_logins` table (`SanitizedEvent`).
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Maximum number of characters of a message body included in log lines.
pub const BODY_PREVIEW_CHARS: usize = 256;

/// Enumeration of errors raised when a message body cannot be turned into a `RawEvent`.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("message body is not valid JSON: {0}")]
    InvalidJson(serde_json::Error),
    #[error("message body is a JSON {0}, not an object")]
    NotAnObject(&'static str),
    #[error("message body does not match the login event schema: {0}")]
    Schema(serde_json::Error),
}

/// A login event as received. Every field is optional at this stage: eligibility
/// is decided by the validator, not by deserialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RawEvent {
    #[serde(default, deserialize_with = "canonical_scalar")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default, deserialize_with = "canonical_scalar")]
    pub app_version: Option<String>,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub locale: Option<String>,
}

impl RawEvent {
    /// Parse a queue message body. Unknown fields are ignored.
    pub fn from_body(body: &str) -> Result<Self, ParseError> {
        let value: Value = serde_json::from_str(body).map_err(ParseError::InvalidJson)?;
        if !value.is_object() {
            return Err(ParseError::NotAnObject(json_kind(&value)));
        }
        serde_json::from_value(value).map_err(ParseError::Schema)
    }
}

/// A login event with its PII replaced by one-way digests. This is the shape of a
/// `user_logins` row, minus `create_date` which the sink stamps at write time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SanitizedEvent {
    pub user_id: Option<String>,
    pub device_type: Option<String>,
    pub masked_ip: Option<String>,
    pub masked_device_id: Option<String>,
    pub locale: Option<String>,
    pub app_version: Option<String>,
}

/// Accept any JSON scalar and render it as text: strings as is, numbers and
/// booleans with their JSON spelling. `null` is treated as absent.
fn canonical_scalar<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(de::Error::custom(format!(
            "expected a scalar, found a JSON {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// The first `BODY_PREVIEW_CHARS` characters of a message body, for logging.
pub fn body_preview(body: &str) -> &str {
    match body.char_indices().nth(BODY_PREVIEW_CHARS) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
