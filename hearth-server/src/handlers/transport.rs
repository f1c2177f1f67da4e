//! Object writes and long-poll subscriptions.

use crate::error::ApiError;
use crate::server::AppState;
use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use hearth_core::DeviceObject;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

#[derive(Deserialize)]
pub struct PutObject {
    pub serial: String,
    pub object_key: String,
    #[serde(default)]
    pub object_revision: i64,
    #[serde(default)]
    pub object_timestamp: i64,
    pub value: Value,
}

#[derive(Deserialize)]
pub struct PutRequest {
    pub objects: Vec<PutObject>,
}

#[derive(Serialize)]
pub struct PutResponse {
    pub accepted: usize,
}

/// `PUT /transport/put` — apply a batch of object writes. Authorization is
/// checked for the whole batch before any write lands, so an unauthorized
/// entry has no partial effect.
pub async fn put(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<PutResponse>, ApiError> {
    let req: PutRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid body: {}", e)))?;

    for object in &req.objects {
        authorize(&state, &object.serial)?;
        if object.object_key.is_empty() {
            return Err(ApiError::BadRequest("Missing object_key".to_string()));
        }
    }

    let mut accepted = 0;
    for object in &req.objects {
        state.service.upsert(
            &object.serial,
            &object.object_key,
            object.object_revision,
            object.object_timestamp,
            &object.value,
        )?;
        accepted += 1;
    }
    Ok(Json(PutResponse { accepted }))
}

#[derive(Deserialize)]
pub struct SubscribeRequest {
    pub serial: String,
    #[serde(default)]
    pub keys: Option<Vec<String>>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct SubscribeResponse {
    pub objects: Vec<DeviceObject>,
}

/// `POST /transport/subscribe` — long poll. Responds with the first
/// matching mutation, or an empty list on deadline. Dropping the request
/// (client disconnect) drops the waiter guard, which deregisters it.
pub async fn subscribe(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<SubscribeResponse>, ApiError> {
    let req: SubscribeRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid body: {}", e)))?;
    authorize(&state, &req.serial)?;

    let timeout =
        Duration::from_millis(req.timeout_ms.unwrap_or(state.config.long_poll_timeout_ms));
    let mut waiter =
        state
            .service
            .subscriptions()
            .register(&req.serial, "/transport/subscribe", req.keys);
    state.service.watchdog().mark_seen(&req.serial);

    let objects = match tokio::time::timeout(timeout, waiter.recv()).await {
        Ok(Some(object)) => vec![object],
        _ => Vec::new(),
    };
    Ok(Json(SubscribeResponse { objects }))
}

fn authorize(state: &AppState, serial: &str) -> Result<(), ApiError> {
    if serial.is_empty() {
        return Err(ApiError::Unauthorized("Missing serial".to_string()));
    }
    if !state.service.store().is_authorized_serial(serial)? {
        return Err(ApiError::Forbidden(format!("Unknown serial {}", serial)));
    }
    Ok(())
}
