//! Device state service: the single mutating path.
//!
//! Every write in the server routes through [`DeviceStateService::upsert`]
//! so the observers fire consistently and in a fixed order: store commit,
//! then watchdog touch, then long-poll delivery, then the change broadcast
//! consumed by the integration dispatcher and the reconciler. Observer
//! failures are logged and never reach the write path.

use crate::store::{DeviceObject, StateStore};
use crate::subscribe::SubscriptionManager;
use crate::watchdog::AvailabilityWatchdog;
use crate::{CoreError, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// A committed mutation, as seen by integrations and the reconciler.
#[derive(Debug, Clone, Serialize)]
pub struct StateChange {
    pub serial: String,
    pub object_key: String,
    pub value: Value,
    pub revision: i64,
    pub timestamp: i64,
}

pub struct DeviceStateService {
    store: Arc<StateStore>,
    watchdog: Arc<AvailabilityWatchdog>,
    subscriptions: Arc<SubscriptionManager>,
    changes: broadcast::Sender<StateChange>,
}

impl DeviceStateService {
    pub fn new(
        store: Arc<StateStore>,
        watchdog: Arc<AvailabilityWatchdog>,
        subscriptions: Arc<SubscriptionManager>,
    ) -> Arc<Self> {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Arc::new(Self {
            store,
            watchdog,
            subscriptions,
            changes,
        })
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn watchdog(&self) -> &Arc<AvailabilityWatchdog> {
        &self.watchdog
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    /// Subscribe to committed changes. Receivers that lag simply miss
    /// entries; consumers treat the store as authoritative.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    pub fn get(&self, serial: &str, object_key: &str) -> Result<Option<DeviceObject>> {
        self.store.get(serial, object_key)
    }

    pub fn get_all_for_device(&self, serial: &str) -> Result<HashMap<String, DeviceObject>> {
        self.store.get_all_for_device(serial)
    }

    /// Commit one write and fan it out. A transient storage failure is
    /// retried once before surfacing; observers never see a failed write.
    pub fn upsert(
        &self,
        serial: &str,
        object_key: &str,
        revision: i64,
        timestamp: i64,
        value: &Value,
    ) -> Result<DeviceObject> {
        let object = match self
            .store
            .upsert(serial, object_key, revision, timestamp, value)
        {
            Ok(object) => object,
            Err(CoreError::Storage(first)) => {
                tracing::warn!("Retrying write for ({}, {}): {}", serial, object_key, first);
                self.store
                    .upsert(serial, object_key, revision, timestamp, value)?
            }
            Err(e) => return Err(e),
        };

        self.watchdog.mark_seen(serial);

        let notified = self.subscriptions.notify(serial, object_key, &object);
        if notified > 0 {
            tracing::debug!(
                "Delivered ({}, {}) rev {} to {} waiter(s)",
                serial,
                object_key,
                object.object_revision,
                notified
            );
        }

        // send() only fails when nobody is listening, which is fine.
        let _ = self.changes.send(StateChange {
            serial: object.serial.clone(),
            object_key: object.object_key.clone(),
            value: object.value.clone(),
            revision: object.object_revision,
            timestamp: object.object_timestamp,
        });

        Ok(object)
    }
}
