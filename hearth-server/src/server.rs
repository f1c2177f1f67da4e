//! Axum router setup.

use crate::config::ServerConfig;
use crate::handlers::{entry, status, transport};
use axum::routing::{get, post, put};
use axum::Router;
use hearth_core::{DeviceStateService, WeatherCache};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub service: Arc<DeviceStateService>,
    pub weather: Arc<WeatherCache>,
}

pub fn build_router(state: AppState) -> Router {
    let max_body = state.config.max_body_bytes;
    Router::new()
        .route("/entry", get(entry::entry))
        .route("/transport/put", put(transport::put))
        .route("/transport/subscribe", post(transport::subscribe))
        .route("/status", get(status::status))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(max_body))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
