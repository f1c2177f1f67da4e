//! Long-poll subscription registry.
//!
//! A waiter is registered when a device opens a long poll and is closed
//! exactly once: on delivery, on cancellation (the guard dropping with the
//! HTTP request), or on the caller's timeout. Delivery uses a oneshot
//! channel, which makes at-most-once a structural property rather than a
//! bookkeeping one.

use crate::store::DeviceObject;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use uuid::Uuid;

struct Waiter {
    session_id: Uuid,
    endpoint: String,
    keys: Option<HashSet<String>>,
    tx: oneshot::Sender<DeviceObject>,
}

impl Waiter {
    fn matches(&self, object_key: &str) -> bool {
        match &self.keys {
            Some(keys) => keys.contains(object_key),
            None => true,
        }
    }
}

#[derive(Default)]
pub struct SubscriptionManager {
    waiters: Mutex<HashMap<String, Vec<Waiter>>>,
}

impl SubscriptionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a waiter for `serial`, optionally restricted to a key set.
    /// The returned guard delivers at most one object and cancels the
    /// registration when dropped.
    pub fn register(
        self: &Arc<Self>,
        serial: &str,
        endpoint: &str,
        keys: Option<Vec<String>>,
    ) -> WaiterGuard {
        let session_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        let waiter = Waiter {
            session_id,
            endpoint: endpoint.to_string(),
            keys: keys.map(|k| k.into_iter().collect()),
            tx,
        };
        self.waiters
            .lock()
            .unwrap()
            .entry(serial.to_string())
            .or_default()
            .push(waiter);
        tracing::debug!("Subscribed {} session {}", serial, session_id);

        WaiterGuard {
            manager: Arc::clone(self),
            serial: serial.to_string(),
            session_id,
            rx: Some(rx),
        }
    }

    /// Deliver `object` to every waiter on `serial` whose key set matches.
    /// Each satisfied waiter is closed and removed. Returns the number of
    /// waiters notified.
    pub fn notify(&self, serial: &str, object_key: &str, object: &DeviceObject) -> usize {
        let matched: Vec<Waiter> = {
            let mut waiters = self.waiters.lock().unwrap();
            let Some(list) = waiters.remove(serial) else {
                return 0;
            };
            let mut kept = Vec::new();
            let mut matched = Vec::new();
            for waiter in list {
                if waiter.matches(object_key) {
                    matched.push(waiter);
                } else {
                    kept.push(waiter);
                }
            }
            if !kept.is_empty() {
                waiters.insert(serial.to_string(), kept);
            }
            matched
        };

        let mut notified = 0;
        for waiter in matched {
            if waiter.tx.send(object.clone()).is_ok() {
                notified += 1;
            } else {
                tracing::debug!(
                    "Waiter {} on {} ({}) gone before delivery",
                    waiter.session_id,
                    serial,
                    waiter.endpoint
                );
            }
        }
        notified
    }

    /// Serials with at least one open waiter; feeds the availability sweep.
    pub fn active_serials(&self) -> HashSet<String> {
        self.waiters
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(serial, _)| serial.clone())
            .collect()
    }

    /// Close every open waiter without delivery (server shutdown). Each
    /// pending long poll completes with an empty object list.
    pub fn cancel_all(&self) {
        let drained: Vec<_> = self.waiters.lock().unwrap().drain().collect();
        let count: usize = drained.iter().map(|(_, l)| l.len()).sum();
        if count > 0 {
            tracing::info!("Cancelled {} open long-poll waiters", count);
        }
    }

    fn remove(&self, serial: &str, session_id: Uuid) {
        let mut waiters = self.waiters.lock().unwrap();
        if let Some(list) = waiters.get_mut(serial) {
            list.retain(|w| w.session_id != session_id);
            if list.is_empty() {
                waiters.remove(serial);
            }
        }
    }
}

/// Handle to a registered waiter. Dropping it cancels the registration;
/// cancellation after delivery is a no-op.
pub struct WaiterGuard {
    manager: Arc<SubscriptionManager>,
    serial: String,
    session_id: Uuid,
    rx: Option<oneshot::Receiver<DeviceObject>>,
}

impl WaiterGuard {
    /// Wait for the single delivery. Returns `None` if the waiter was
    /// cancelled or already consumed.
    pub async fn recv(&mut self) -> Option<DeviceObject> {
        let rx = self.rx.take()?;
        rx.await.ok()
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.manager.remove(&self.serial, self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn object(serial: &str, key: &str, rev: i64) -> DeviceObject {
        DeviceObject {
            serial: serial.to_string(),
            object_key: key.to_string(),
            object_revision: rev,
            object_timestamp: 2000,
            value: json!({"target_temperature": 22.5}),
            updated_at: 2001,
        }
    }

    #[tokio::test]
    async fn test_notify_wakes_matching_waiter() {
        let subs = SubscriptionManager::new();
        let mut guard = subs.register("A", "/transport/subscribe", Some(vec!["shared.A".into()]));

        let obj = object("A", "shared.A", 5);
        assert_eq!(subs.notify("A", "shared.A", &obj), 1);

        let delivered = guard.recv().await.unwrap();
        assert_eq!(delivered.object_key, "shared.A");
        assert_eq!(delivered.value["target_temperature"], json!(22.5));
    }

    #[tokio::test]
    async fn test_key_filter_excludes_other_keys() {
        let subs = SubscriptionManager::new();
        let _guard = subs.register("A", "/transport/subscribe", Some(vec!["shared.A".into()]));
        assert_eq!(subs.notify("A", "device.A", &object("A", "device.A", 1)), 0);
        // No filter matches any key.
        let _any = subs.register("A", "/transport/subscribe", None);
        assert_eq!(subs.notify("A", "device.A", &object("A", "device.A", 2)), 1);
    }

    #[tokio::test]
    async fn test_two_waiters_receive_same_payload() {
        let subs = SubscriptionManager::new();
        let mut g1 = subs.register("A", "/transport/subscribe", None);
        let mut g2 = subs.register("A", "/transport/subscribe", None);

        let obj = object("A", "shared.A", 5);
        assert_eq!(subs.notify("A", "shared.A", &obj), 2);

        assert_eq!(g1.recv().await.unwrap(), obj);
        assert_eq!(g2.recv().await.unwrap(), obj);
    }

    #[tokio::test]
    async fn test_delivery_is_at_most_once() {
        let subs = SubscriptionManager::new();
        let mut guard = subs.register("A", "/transport/subscribe", None);

        assert_eq!(subs.notify("A", "shared.A", &object("A", "shared.A", 1)), 1);
        // The waiter is closed; a second notification finds nobody.
        assert_eq!(subs.notify("A", "shared.A", &object("A", "shared.A", 2)), 0);

        let first = guard.recv().await.unwrap();
        assert_eq!(first.object_revision, 1);
        assert!(guard.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_drop_cancels_registration() {
        let subs = SubscriptionManager::new();
        {
            let _guard = subs.register("A", "/transport/subscribe", None);
            assert!(subs.active_serials().contains("A"));
        }
        assert!(subs.active_serials().is_empty());
        assert_eq!(subs.notify("A", "shared.A", &object("A", "shared.A", 1)), 0);
    }

    #[tokio::test]
    async fn test_cancel_all_yields_empty_delivery() {
        let subs = SubscriptionManager::new();
        let mut guard = subs.register("A", "/transport/subscribe", None);
        subs.cancel_all();
        assert!(guard.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_timeout_path_leaves_registry_clean() {
        let subs = SubscriptionManager::new();
        let mut guard = subs.register("A", "/transport/subscribe", None);
        let out = tokio::time::timeout(Duration::from_millis(20), guard.recv()).await;
        assert!(out.is_err());
        drop(guard);
        assert!(subs.active_serials().is_empty());
    }
}
