//! Device check-in.

use crate::error::ApiError;
use crate::server::AppState;
use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

#[derive(Deserialize)]
pub struct EntryQuery {
    #[serde(default)]
    pub serial: Option<String>,
}

#[derive(Serialize)]
pub struct EntryResponse {
    pub ok: bool,
    /// Assigned parameters the device keeps using after check-in.
    pub transport_url: String,
    pub weather_url: String,
}

pub async fn entry(
    State(state): State<AppState>,
    Query(query): Query<EntryQuery>,
) -> Result<Json<EntryResponse>, ApiError> {
    if let Some(serial) = query.serial.filter(|s| !s.is_empty()) {
        if state.service.store().is_authorized_serial(&serial)? {
            state.service.watchdog().mark_seen(&serial);
        }
    }
    Ok(Json(EntryResponse {
        ok: true,
        transport_url: state.config.transport_url.clone(),
        weather_url: state.config.weather_url.clone(),
    }))
}
