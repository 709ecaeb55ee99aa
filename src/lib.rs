pub mod config;
pub mod error;
pub mod handlers;
pub mod infrastructure;
pub mod middleware;
pub mod models;
pub mod services;

use crate::config::RelayConfig;
use crate::services::reassembly::ReassemblyService;
use crate::services::storage::ObjectStore;
use axum::{
    Router,
    middleware::from_fn,
    routing::{get, post},
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(handlers::events::receive_event, handlers::health::health_check,),
    components(
        schemas(
            handlers::events::EventResponse,
            handlers::health::HealthResponse,
            models::StorageEvent,
        )
    ),
    tags(
        (name = "events", description = "Storage finalize event intake"),
        (name = "system", description = "Health and diagnostics")
    )
)]
pub struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ObjectStore>,
    pub reassembly: Arc<ReassemblyService>,
    pub config: RelayConfig,
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/events", post(handlers::events::receive_event))
        .route("/health", get(handlers::health::health_check))
        .layer(from_fn(middleware::request_id::request_id_middleware))
        .with_state(state)
}
