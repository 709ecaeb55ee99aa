use crate::AppState;
use crate::error::RelayError;
use crate::models::StorageEvent;
use crate::services::reassembly::Outcome;
use axum::{Json, extract::State};
use serde::Serialize;
use serde_json::Value;
use tracing::info;
use utoipa::ToSchema;

#[derive(Serialize, ToSchema)]
pub struct EventResponse {
    /// "reassembled" or "ignored"
    pub status: String,
    /// Key of the canonical output, when one was produced
    pub output_key: Option<String>,
    /// Number of staged objects composed into the output
    pub sources: Option<usize>,
}

/// Storage finalize push endpoint. The platform redelivers the event on
/// any 5xx answer, so retryable failures map to 503/502 and permanent ones
/// to 4xx (see [`RelayError`]).
#[utoipa::path(
    post,
    path = "/events",
    request_body = StorageEvent,
    responses(
        (status = 200, description = "Event processed", body = EventResponse),
        (status = 400, description = "Malformed event payload"),
        (status = 422, description = "Key does not follow the export naming convention"),
        (status = 503, description = "Transient condition, safe to redeliver")
    ),
    tag = "events"
)]
pub async fn receive_event(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Json<EventResponse>, RelayError> {
    let event = StorageEvent::from_value(&payload)?;
    info!("processing finalize event for {}/{}", event.bucket, event.name);

    match state.reassembly.handle_event(&event).await? {
        Outcome::Skipped { key } => {
            info!("no action for {}", key);
            Ok(Json(EventResponse {
                status: "ignored".to_string(),
                output_key: None,
                sources: None,
            }))
        }
        Outcome::Reassembled {
            output_key,
            sources,
        } => Ok(Json(EventResponse {
            status: "reassembled".to_string(),
            output_key: Some(output_key),
            sources: Some(sources),
        })),
    }
}
