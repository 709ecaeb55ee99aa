use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Failures surfaced by one reassembly invocation.
///
/// The push platform redelivers the triggering event whenever we answer
/// with a 5xx, so retryable conditions map to 503/502 and conditions that
/// need operator attention map to 4xx (which the platform does not retry).
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Cannot derive output key from {0}")]
    NameDerivation(String),

    #[error("Reassembly already in progress: {0}")]
    Locked(String),

    #[error("Staging prefix {0} listed empty")]
    EmptyListing(String),

    #[error("Listing failed: {0}")]
    Listing(String),

    #[error("Compose failed: {0}")]
    Compose(String),

    #[error("Storage error: {0}")]
    Store(#[from] anyhow::Error),
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            RelayError::MalformedEvent(msg) => {
                tracing::warn!("rejected malformed event: {}", msg);
                (StatusCode::BAD_REQUEST, format!("Malformed event: {msg}"))
            }
            RelayError::NameDerivation(key) => {
                // Data that does not follow the export naming convention
                // needs a human, not a redelivery.
                tracing::error!("cannot derive output key from {}", key);
                (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    format!("Cannot derive output key from {key}"),
                )
            }
            RelayError::Locked(lock_key) => {
                tracing::info!("staging prefix locked by {}", lock_key);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Reassembly already in progress".to_string(),
                )
            }
            RelayError::EmptyListing(prefix) => {
                tracing::warn!("staging prefix {} listed empty", prefix);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    format!("Staging prefix {prefix} listed empty"),
                )
            }
            RelayError::Listing(msg) => {
                tracing::error!("listing failed: {}", msg);
                (StatusCode::BAD_GATEWAY, "Listing failed".to_string())
            }
            RelayError::Compose(msg) => {
                tracing::error!("compose failed: {}", msg);
                (StatusCode::BAD_GATEWAY, "Compose failed".to_string())
            }
            RelayError::Store(e) => {
                tracing::error!("storage error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}
