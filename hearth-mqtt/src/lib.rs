//! MQTT bridge for the hearth backend.
//!
//! One bridge instance per user: it mirrors the user's devices onto an MQTT
//! broker (raw object topics plus a derived climate surface), publishes
//! Home Assistant discovery payloads, and ingests commands back into the
//! device state service. Registered with the integration manager under the
//! kind `"mqtt"`.

mod bridge;
pub mod climate;
mod config;
pub mod discovery;

pub use bridge::{MqttBridge, MqttBridgeFactory};
pub use config::MqttConfig;
