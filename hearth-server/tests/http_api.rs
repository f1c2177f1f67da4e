//! End-to-end tests for the device protocol surface, driven through the
//! router with an in-memory store — no sockets required.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use hearth_core::store::WeatherRow;
use hearth_core::{
    AvailabilityWatchdog, DeviceStateService, StateStore, SubscriptionManager, WeatherCache,
};
use hearth_server::config::ServerConfig;
use hearth_server::server::{build_router, AppState};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt;

fn fixture() -> (AppState, Router) {
    let store = Arc::new(StateStore::in_memory().unwrap());
    store.add_user("u1").unwrap();
    store.add_owner("u1", "A").unwrap();
    let service = DeviceStateService::new(
        Arc::clone(&store),
        AvailabilityWatchdog::with_defaults(),
        SubscriptionManager::new(),
    );
    let weather = Arc::new(WeatherCache::new(store));
    let state = AppState {
        config: Arc::new(ServerConfig::default()),
        service,
        weather,
    };
    let router = build_router(state.clone());
    (state, router)
}

fn json_request(method: &str, uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_entry_checkin_marks_device_seen() {
    let (state, router) = fixture();
    let response = router
        .oneshot(
            Request::builder()
                .uri("/entry?serial=A")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["ok"], json!(true));
    assert!(body["transport_url"].as_str().is_some());
    assert!(state.service.watchdog().get_availability("A"));
}

#[tokio::test]
async fn test_put_accepts_batch_and_persists() {
    let (state, router) = fixture();
    let request = json_request(
        "PUT",
        "/transport/put",
        &json!({
            "objects": [
                {"serial": "A", "object_key": "device.A", "object_revision": 1,
                 "object_timestamp": 1000, "value": {"temperature": 20}},
                {"serial": "A", "object_key": "shared.A", "object_revision": 1,
                 "object_timestamp": 1000, "value": {"target_temperature": 21.5}},
            ]
        }),
    );
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["accepted"], json!(2));

    let shared = state.service.get("A", "shared.A").unwrap().unwrap();
    assert_eq!(shared.value["target_temperature"], json!(21.5));
}

#[tokio::test]
async fn test_put_unknown_serial_is_forbidden() {
    let (state, router) = fixture();
    let request = json_request(
        "PUT",
        "/transport/put",
        &json!({
            "objects": [
                {"serial": "Z", "object_key": "device.Z", "object_revision": 1,
                 "object_timestamp": 1000, "value": {"temperature": 20}},
            ]
        }),
    );
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    // No partial effect.
    assert!(state.service.get("Z", "device.Z").unwrap().is_none());
}

#[tokio::test]
async fn test_put_missing_serial_is_unauthorized() {
    let (_state, router) = fixture();
    let request = json_request(
        "PUT",
        "/transport/put",
        &json!({
            "objects": [
                {"serial": "", "object_key": "device.A", "value": {}},
            ]
        }),
    );
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let (_state, router) = fixture();
    let request = Request::builder()
        .method("PUT")
        .uri("/transport/put")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_subscribe_times_out_with_empty_objects() {
    let (_state, router) = fixture();
    let request = json_request(
        "POST",
        "/transport/subscribe",
        &json!({"serial": "A", "timeout_ms": 50}),
    );
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["objects"], json!([]));
}

#[tokio::test]
async fn test_subscribe_wakes_on_matching_write() {
    let (state, router) = fixture();

    let poller = {
        let app = router.clone();
        tokio::spawn(async move {
            app.oneshot(json_request(
                "POST",
                "/transport/subscribe",
                &json!({"serial": "A", "keys": ["shared.A"], "timeout_ms": 5000}),
            ))
            .await
            .unwrap()
        })
    };
    let second_poller = {
        let app = router.clone();
        tokio::spawn(async move {
            app.oneshot(json_request(
                "POST",
                "/transport/subscribe",
                &json!({"serial": "A", "keys": ["shared.A"], "timeout_ms": 5000}),
            ))
            .await
            .unwrap()
        })
    };

    // Let both waiters register before the write lands.
    tokio::time::sleep(Duration::from_millis(100)).await;
    state
        .service
        .upsert("A", "shared.A", 5, 2000, &json!({"target_temperature": 22.5}))
        .unwrap();

    for handle in [poller, second_poller] {
        let response = handle.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let objects = body["objects"].as_array().unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0]["object_key"], json!("shared.A"));
        assert!(objects[0]["object_revision"].as_i64().unwrap() >= 5);
        assert_eq!(objects[0]["value"]["target_temperature"], json!(22.5));
    }
}

#[tokio::test]
async fn test_status_filters_keys_and_injects_weather() {
    let (state, router) = fixture();
    state
        .service
        .upsert(
            "A",
            "device.A",
            1,
            1000,
            &json!({"temperature": 20, "postal_code": "94043"}),
        )
        .unwrap();
    state
        .service
        .upsert("A", "shared.A", 1, 1000, &json!({"target_temperature": 21.0}))
        .unwrap();
    state
        .service
        .upsert("A", "device_alert_dialog.A", 1, 1000, &json!({"dialog_id": "x"}))
        .unwrap();
    state
        .service
        .store()
        .put_weather(&WeatherRow {
            postal_code: "94043".to_string(),
            country: "US".to_string(),
            current: json!({"temp_c": 16.0}),
            location: json!({"city": "Mountain View"}),
            fetched_at: 99,
        })
        .unwrap();

    let response = router
        .oneshot(
            Request::builder()
                .uri("/status?serial=A")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;

    assert_eq!(body["devices"], json!(["A"]));
    let objects = &body["deviceState"]["A"];
    assert!(objects.get("device.A").is_some());
    assert!(objects.get("shared.A").is_some());
    // Alert dialogs are not part of the console surface.
    assert!(objects.get("device_alert_dialog.A").is_none());
    assert_eq!(
        objects["weather.A"]["value"]["current"]["temp_c"],
        json!(16.0)
    );
}

#[tokio::test]
async fn test_status_without_serial_lists_owned_devices() {
    let (_state, router) = fixture();
    let response = router
        .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["devices"], json!(["A"]));
}
