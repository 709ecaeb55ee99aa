use crate::error::RelayError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// A reference to one stored object, as observed at listing time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectRef {
    pub container: String,
    pub key: String,
    pub size: Option<i64>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Storage finalize notification pushed by the hosting platform.
///
/// The platform delivers these at least once, so handlers must tolerate
/// duplicates.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StorageEvent {
    /// Container (bucket) the object was created in.
    pub bucket: String,
    /// Full object key within the container.
    pub name: String,
}

impl StorageEvent {
    /// Parses an event payload defensively. Push payloads come from outside
    /// the trust boundary, so missing or empty fields are a
    /// [`RelayError::MalformedEvent`], never a panic.
    pub fn from_value(payload: &Value) -> Result<Self, RelayError> {
        let bucket = payload
            .get("bucket")
            .and_then(Value::as_str)
            .ok_or_else(|| RelayError::MalformedEvent("missing field `bucket`".to_string()))?;
        let name = payload
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RelayError::MalformedEvent("missing field `name`".to_string()))?;

        if bucket.is_empty() {
            return Err(RelayError::MalformedEvent("empty `bucket`".to_string()));
        }
        if name.is_empty() {
            return Err(RelayError::MalformedEvent("empty `name`".to_string()));
        }

        Ok(Self {
            bucket: bucket.to_string(),
            name: name.to_string(),
        })
    }
}
