//! Console-facing read endpoint.

use crate::error::ApiError;
use crate::server::AppState;
use axum::extract::{Query, State};
use axum::Json;
use hearth_core::DeviceObject;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

/// Only these object families are exposed to the console.
const STATE_KEY_PREFIXES: [&str; 5] = ["user.", "device.", "shared.", "schedule.", "structure."];

#[derive(Deserialize)]
pub struct StatusQuery {
    #[serde(default)]
    pub serial: Option<String>,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub devices: Vec<String>,
    #[serde(rename = "deviceState")]
    pub device_state: HashMap<String, HashMap<String, DeviceObject>>,
}

pub async fn status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusResponse>, ApiError> {
    let devices = match query.serial.filter(|s| !s.is_empty()) {
        Some(serial) => vec![serial],
        None => state.service.store().known_serials()?,
    };

    let mut device_state = HashMap::new();
    for serial in &devices {
        let mut objects: HashMap<String, DeviceObject> = state
            .service
            .get_all_for_device(serial)?
            .into_iter()
            .filter(|(key, _)| STATE_KEY_PREFIXES.iter().any(|p| key.starts_with(p)))
            .collect();

        if let Some(weather) = weather_object(&state, serial, &objects)? {
            objects.insert(weather.object_key.clone(), weather);
        }
        device_state.insert(serial.clone(), objects);
    }

    Ok(Json(StatusResponse {
        devices,
        device_state,
    }))
}

/// Synthesize a `weather.«serial»` object from the 30-minute cache, keyed
/// off the postal code the device last reported.
fn weather_object(
    state: &AppState,
    serial: &str,
    objects: &HashMap<String, DeviceObject>,
) -> Result<Option<DeviceObject>, ApiError> {
    let Some(device) = objects.get(&format!("device.{}", serial)) else {
        return Ok(None);
    };
    let Some(postal) = device
        .value
        .get("postal_code")
        .and_then(Value::as_str)
        .filter(|p| !p.is_empty())
    else {
        return Ok(None);
    };
    let country = device
        .value
        .get("country")
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .unwrap_or("US");

    let Some(row) = state.weather.get(postal, country)? else {
        return Ok(None);
    };
    Ok(Some(DeviceObject {
        serial: serial.to_string(),
        object_key: format!("weather.{}", serial),
        object_revision: 1,
        object_timestamp: row.fetched_at,
        value: json!({
            "current": row.current,
            "location": row.location,
            "updatedAt": row.fetched_at,
        }),
        updated_at: row.fetched_at,
    }))
}
