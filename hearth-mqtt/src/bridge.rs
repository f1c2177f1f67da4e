//! The per-user MQTT bridge.
//!
//! Connects to the user's broker with a Last-Will on `«prefix»/status`,
//! mirrors object state onto raw and derived topics, publishes Home
//! Assistant discovery, and feeds `…/set` commands back through the device
//! state service. The device set is reconciled against ownership on an
//! interval so adds and removals converge without restarts.

use crate::climate::{self, HaState, WriteTarget};
use crate::config::{parse_broker_url, MqttConfig};
use crate::discovery;
use async_trait::async_trait;
use chrono::Utc;
use hearth_core::integration::{Integration, IntegrationFactory};
use hearth_core::service::{DeviceStateService, StateChange};
use hearth_core::value::key_type;
use hearth_core::{CoreError, Result};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;

const EVENT_CHANNEL_CAPACITY: usize = 256;

struct Inner {
    user_id: String,
    cfg: MqttConfig,
    service: Arc<DeviceStateService>,
    client: Mutex<Option<AsyncClient>>,
    devices: Mutex<HashSet<String>>,
}

pub struct MqttBridge {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MqttBridge {
    pub fn new(user_id: &str, cfg: MqttConfig, service: Arc<DeviceStateService>) -> Self {
        Self {
            inner: Arc::new(Inner {
                user_id: user_id.to_string(),
                cfg,
                service,
                client: Mutex::new(None),
                devices: Mutex::new(HashSet::new()),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn spawn_event_loop(&self, mut eventloop: EventLoop) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let connect_timeout = Duration::from_secs(inner.cfg.connect_timeout_secs);
        let reconnect_delay = Duration::from_secs(inner.cfg.reconnect_delay_secs);
        tokio::spawn(async move {
            let mut connected = false;
            loop {
                let polled = if connected {
                    eventloop.poll().await
                } else {
                    match time::timeout(connect_timeout, eventloop.poll()).await {
                        Ok(polled) => polled,
                        Err(_) => {
                            tracing::warn!(
                                "MQTT connect for {} timed out after {:?}",
                                inner.user_id,
                                connect_timeout
                            );
                            time::sleep(reconnect_delay).await;
                            continue;
                        }
                    }
                };
                match polled {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        connected = true;
                        tracing::info!("MQTT connected for {}", inner.user_id);
                    }
                    Ok(Event::Incoming(Packet::Publish(msg))) => {
                        inner.handle_publish(&msg.topic, &msg.payload).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        connected = false;
                        tracing::error!("MQTT event loop error for {}: {}", inner.user_id, e);
                        time::sleep(reconnect_delay).await;
                    }
                }
            }
        })
    }

    fn spawn_reconcile(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut ticker = time::interval(Duration::from_secs(inner.cfg.reconcile_interval_secs));
            loop {
                // First tick fires immediately: the initial device load.
                ticker.tick().await;
                inner.reconcile_devices().await;
            }
        })
    }
}

#[async_trait]
impl Integration for MqttBridge {
    async fn initialize(&self) -> Result<()> {
        let inner = &self.inner;
        let (host, port) = parse_broker_url(&inner.cfg.broker_url)?;

        let mut options = MqttOptions::new(&inner.cfg.client_id, host, port);
        options.set_keep_alive(Duration::from_secs(inner.cfg.keep_alive_secs));
        options.set_last_will(LastWill::new(
            format!("{}/status", inner.cfg.topic_prefix),
            "offline",
            QoS::AtLeastOnce,
            true,
        ));
        if let Some(username) = &inner.cfg.username {
            options.set_credentials(username, inner.cfg.password.as_deref().unwrap_or(""));
        }

        let (client, eventloop) = AsyncClient::new(options, EVENT_CHANNEL_CAPACITY);
        *inner.client.lock().unwrap() = Some(client.clone());

        client
            .subscribe(
                format!("{}/+/+/+/set", inner.cfg.topic_prefix),
                QoS::AtLeastOnce,
            )
            .await
            .map_err(|e| CoreError::Integration(format!("MQTT subscribe failed: {}", e)))?;
        client
            .publish(
                format!("{}/status", inner.cfg.topic_prefix),
                QoS::AtLeastOnce,
                true,
                "online",
            )
            .await
            .map_err(|e| CoreError::Integration(format!("MQTT publish failed: {}", e)))?;

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(self.spawn_event_loop(eventloop));
        tasks.push(self.spawn_reconcile());
        Ok(())
    }

    async fn shutdown(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        let client = self.inner.client.lock().unwrap().take();
        if let Some(client) = client {
            let _ = client
                .publish(
                    format!("{}/status", self.inner.cfg.topic_prefix),
                    QoS::AtLeastOnce,
                    true,
                    "offline",
                )
                .await;
            let _ = client.disconnect().await;
        }
    }

    async fn on_device_state_change(&self, change: &StateChange) {
        let inner = &self.inner;
        if !inner.devices.lock().unwrap().contains(&change.serial) {
            return;
        }
        let object_type = key_type(&change.object_key).to_string();

        if inner.cfg.publish_raw {
            inner.publish_raw_object(&change.serial, &object_type, &change.value).await;
        }
        if object_type == "shared" && inner.cfg.home_assistant_discovery {
            // Mode changes alter the entity schema (single vs range setpoints).
            inner.publish_discovery(&change.serial, &change.value).await;
        }
        if matches!(object_type.as_str(), "device" | "shared" | "user") {
            inner.publish_ha_state(&change.serial).await;
        }
    }

    async fn on_device_connected(&self, serial: &str) {
        if self.inner.devices.lock().unwrap().contains(serial) {
            self.inner.publish_availability(serial, true).await;
        }
    }

    async fn on_device_disconnected(&self, serial: &str) {
        if self.inner.devices.lock().unwrap().contains(serial) {
            self.inner.publish_availability(serial, false).await;
        }
    }
}

impl Inner {
    /// Diff the broker's device set against ownership and converge.
    async fn reconcile_devices(&self) {
        let target: HashSet<String> = match self.service.store().device_set(&self.user_id) {
            Ok(serials) => serials.into_iter().collect(),
            Err(e) => {
                tracing::error!("Device set lookup for {} failed: {}", self.user_id, e);
                return;
            }
        };

        let (added, removed) = {
            let mut devices = self.devices.lock().unwrap();
            let added: Vec<String> = target.difference(&devices).cloned().collect();
            let removed: Vec<String> = devices.difference(&target).cloned().collect();
            *devices = target;
            (added, removed)
        };

        for serial in removed {
            tracing::info!("Device {} left {}'s set, retiring topics", serial, self.user_id);
            if self.cfg.home_assistant_discovery {
                for topic in discovery::config_topics(&self.cfg.discovery_prefix, &serial) {
                    self.publish(topic, String::new(), true).await;
                }
            }
            self.publish_availability(&serial, false).await;
        }

        for serial in added {
            tracing::info!("Device {} joined {}'s set", serial, self.user_id);
            self.publish_device_snapshot(&serial).await;
        }
    }

    /// Discovery, full raw state, derived state and availability for one
    /// device; used when a device enters the set.
    async fn publish_device_snapshot(&self, serial: &str) {
        let shared = self.object_value(serial, &format!("shared.{}", serial));
        if self.cfg.home_assistant_discovery {
            self.publish_discovery(serial, &shared).await;
        }
        if self.cfg.publish_raw {
            match self.service.get_all_for_device(serial) {
                Ok(objects) => {
                    for (object_key, object) in objects {
                        self.publish_raw_object(serial, key_type(&object_key), &object.value)
                            .await;
                    }
                }
                Err(e) => tracing::error!("State read for {} failed: {}", serial, e),
            }
        }
        self.publish_ha_state(serial).await;
        let available = self.service.watchdog().get_availability(serial);
        self.publish_availability(serial, available).await;
    }

    async fn publish_discovery(&self, serial: &str, shared: &Value) {
        for (topic, payload) in discovery::config_payloads(
            &self.cfg.topic_prefix,
            &self.cfg.discovery_prefix,
            serial,
            shared,
        ) {
            self.publish(topic, payload.to_string(), true).await;
        }
    }

    /// Full value on `«prefix»/«serial»/«t»`, each top-level field on
    /// `«prefix»/«serial»/«t»/«field»`, retained.
    async fn publish_raw_object(&self, serial: &str, object_type: &str, value: &Value) {
        let base = format!("{}/{}/{}", self.cfg.topic_prefix, serial, object_type);
        self.publish(base.clone(), value.to_string(), true).await;
        if let Some(fields) = value.as_object() {
            for (field, field_value) in fields {
                self.publish(
                    format!("{}/{}", base, field),
                    scalar_payload(field_value),
                    true,
                )
                .await;
            }
        }
    }

    async fn publish_ha_state(&self, serial: &str) {
        let device = self.object_value(serial, &format!("device.{}", serial));
        let shared = self.object_value(serial, &format!("shared.{}", serial));
        let user_key = format!("user.{}", self.user_id);
        let user = match self.service.get(serial, &user_key) {
            Ok(obj) => obj.map(|o| o.value),
            Err(_) => None,
        };

        let state = HaState::derive(&device, &shared, user.as_ref(), Utc::now().timestamp());
        for (suffix, payload) in state.topic_values() {
            self.publish(
                format!("{}/{}/ha/{}", self.cfg.topic_prefix, serial, suffix),
                payload,
                true,
            )
            .await;
        }
    }

    async fn publish_availability(&self, serial: &str, available: bool) {
        self.publish(
            format!("{}/{}/availability", self.cfg.topic_prefix, serial),
            if available { "online" } else { "offline" }.to_string(),
            true,
        )
        .await;
    }

    async fn handle_publish(&self, topic: &str, payload: &[u8]) {
        let prefix = format!("{}/", self.cfg.topic_prefix);
        let Some(rest) = topic.strip_prefix(&prefix) else {
            return;
        };
        let parts: Vec<&str> = rest.split('/').collect();
        if parts.len() != 4 || parts[3] != "set" {
            return;
        }
        let (serial, object_type, field) = (parts[0], parts[1], parts[2]);

        if !self.devices.lock().unwrap().contains(serial) {
            tracing::warn!(
                "Ignoring command for {} outside {}'s device set",
                serial,
                self.user_id
            );
            return;
        }

        let payload = String::from_utf8_lossy(payload).to_string();
        tracing::info!("MQTT command {}/{}/{} = {}", serial, object_type, field, payload);
        if object_type == "ha" {
            self.handle_ha_command(serial, field, &payload);
        } else {
            // Raw command: set that single field on the «t».«serial» object.
            let value = serde_json::from_str(&payload)
                .unwrap_or_else(|_| Value::String(payload.clone()));
            let object_key = format!("{}.{}", object_type, serial);
            self.write_object(serial, &object_key, serde_json::json!({ field: value }));
        }
    }

    fn handle_ha_command(&self, serial: &str, command: &str, payload: &str) {
        let shared = self.object_value(serial, &format!("shared.{}", serial));
        let now_secs = Utc::now().timestamp();
        match climate::translate_command(command, payload, &shared, now_secs) {
            Some(write) => {
                let object_key = match write.target {
                    WriteTarget::Shared => format!("shared.{}", serial),
                    WriteTarget::Device => format!("device.{}", serial),
                };
                self.write_object(serial, &object_key, write.value);
            }
            None => {
                tracing::warn!(
                    "Rejected MQTT command {} = {} for {}",
                    command,
                    payload,
                    serial
                );
            }
        }
    }

    /// All command writes route through the state service, which re-notifies
    /// subscribers and bounces the resulting change back to this bridge.
    fn write_object(&self, serial: &str, object_key: &str, value: Value) {
        let revision = match self.service.get(serial, object_key) {
            Ok(Some(existing)) => existing.object_revision + 1,
            Ok(None) => 1,
            Err(e) => {
                tracing::error!("Read before write for ({}, {}) failed: {}", serial, object_key, e);
                return;
            }
        };
        let now_ms = Utc::now().timestamp_millis();
        if let Err(e) = self
            .service
            .upsert(serial, object_key, revision, now_ms, &value)
        {
            tracing::error!("Command write for ({}, {}) failed: {}", serial, object_key, e);
        }
    }

    fn object_value(&self, serial: &str, object_key: &str) -> Value {
        match self.service.get(serial, object_key) {
            Ok(Some(object)) => object.value,
            _ => Value::Object(serde_json::Map::new()),
        }
    }

    async fn publish(&self, topic: String, payload: String, retain: bool) {
        let client = self.client.lock().unwrap().clone();
        let Some(client) = client else {
            return;
        };
        if let Err(e) = client
            .publish(topic.as_str(), QoS::AtMostOnce, retain, payload)
            .await
        {
            tracing::error!("MQTT publish to {} failed: {}", topic, e);
        }
    }
}

/// Strings go out bare; everything else as JSON text.
fn scalar_payload(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub struct MqttBridgeFactory {
    service: Arc<DeviceStateService>,
    default_broker_url: String,
}

impl MqttBridgeFactory {
    pub fn new(service: Arc<DeviceStateService>, default_broker_url: impl Into<String>) -> Self {
        Self {
            service,
            default_broker_url: default_broker_url.into(),
        }
    }
}

impl IntegrationFactory for MqttBridgeFactory {
    fn kind(&self) -> &'static str {
        "mqtt"
    }

    fn build(&self, user_id: &str, config: &Value) -> Result<Arc<dyn Integration>> {
        let cfg = MqttConfig::from_value(user_id, config, &self.default_broker_url)?;
        Ok(Arc::new(MqttBridge::new(
            user_id,
            cfg,
            Arc::clone(&self.service),
        )))
    }
}
