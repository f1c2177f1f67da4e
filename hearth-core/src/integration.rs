//! Outbound integration bus.
//!
//! An integration instance is scoped to a user and receives every committed
//! mutation of a serial that user owns or is shared, plus availability
//! transitions. Instances are built by registered factories from rows in
//! the `integrations` table and are started/stopped under a single lock so
//! no two instances for the same user ever run concurrently.

use crate::service::StateChange;
use crate::store::StateStore;
use crate::{CoreError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// A running outbound integration for one user.
#[async_trait]
pub trait Integration: Send + Sync {
    async fn initialize(&self) -> Result<()>;
    async fn shutdown(&self);
    async fn on_device_state_change(&self, change: &StateChange);
    async fn on_device_connected(&self, serial: &str);
    async fn on_device_disconnected(&self, serial: &str);
}

/// Builds integration instances of one kind (`"mqtt"`, …) from per-user
/// configuration.
pub trait IntegrationFactory: Send + Sync {
    fn kind(&self) -> &'static str;
    fn build(&self, user_id: &str, config: &Value) -> Result<Arc<dyn Integration>>;
}

type InstanceKey = (String, String);

pub struct IntegrationManager {
    store: Arc<StateStore>,
    factories: Mutex<HashMap<String, Arc<dyn IntegrationFactory>>>,
    running: tokio::sync::Mutex<HashMap<InstanceKey, Arc<dyn Integration>>>,
    /// Instances whose startup failed; left disabled until reconfigured.
    failed: Mutex<HashSet<InstanceKey>>,
}

impl IntegrationManager {
    pub fn new(store: Arc<StateStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            factories: Mutex::new(HashMap::new()),
            running: tokio::sync::Mutex::new(HashMap::new()),
            failed: Mutex::new(HashSet::new()),
        })
    }

    pub fn register_factory(&self, factory: Arc<dyn IntegrationFactory>) {
        self.factories
            .lock()
            .unwrap()
            .insert(factory.kind().to_string(), factory);
    }

    /// Start every enabled integration from the store. A failure for one
    /// user never affects the others.
    pub async fn start_all(&self) {
        let rows = match self.store.enabled_integrations() {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!("Failed to load integrations: {}", e);
                return;
            }
        };
        let mut running = self.running.lock().await;
        for row in rows {
            self.start_into(&mut running, &row.user_id, &row.kind, &row.config)
                .await;
        }
    }

    pub async fn start(&self, user_id: &str, kind: &str, config: &Value) {
        let mut running = self.running.lock().await;
        self.start_into(&mut running, user_id, kind, config).await;
    }

    pub async fn stop(&self, user_id: &str, kind: &str) {
        let mut running = self.running.lock().await;
        if let Some(instance) = running.remove(&(user_id.to_string(), kind.to_string())) {
            instance.shutdown().await;
            tracing::info!("Stopped {} integration for {}", kind, user_id);
        }
    }

    /// Config change: stop the old instance, then start a fresh one. Both
    /// happen under the running-map lock, so restarts are serialized.
    pub async fn restart(&self, user_id: &str, kind: &str, config: &Value) {
        let mut running = self.running.lock().await;
        if let Some(instance) = running.remove(&(user_id.to_string(), kind.to_string())) {
            instance.shutdown().await;
        }
        self.failed
            .lock()
            .unwrap()
            .remove(&(user_id.to_string(), kind.to_string()));
        self.start_into(&mut running, user_id, kind, config).await;
    }

    pub async fn shutdown_all(&self) {
        let mut running = self.running.lock().await;
        for ((user_id, kind), instance) in running.drain() {
            instance.shutdown().await;
            tracing::info!("Stopped {} integration for {}", kind, user_id);
        }
    }

    async fn start_into(
        &self,
        running: &mut HashMap<InstanceKey, Arc<dyn Integration>>,
        user_id: &str,
        kind: &str,
        config: &Value,
    ) {
        let key = (user_id.to_string(), kind.to_string());
        if running.contains_key(&key) {
            tracing::warn!("{} integration for {} already running", kind, user_id);
            return;
        }
        if self.failed.lock().unwrap().contains(&key) {
            // Stays down until an explicit restart with new config.
            return;
        }

        let factory = self.factories.lock().unwrap().get(kind).cloned();
        let Some(factory) = factory else {
            tracing::warn!("No factory registered for integration kind {}", kind);
            return;
        };

        let instance = match factory.build(user_id, config) {
            Ok(instance) => instance,
            Err(e) => {
                tracing::error!("Failed to build {} integration for {}: {}", kind, user_id, e);
                self.failed.lock().unwrap().insert(key);
                return;
            }
        };
        if let Err(e) = instance.initialize().await {
            tracing::error!("Failed to start {} integration for {}: {}", kind, user_id, e);
            self.failed.lock().unwrap().insert(key);
            return;
        }

        tracing::info!("Started {} integration for {}", kind, user_id);
        running.insert(key, instance);
    }

    /// Forward committed changes and availability transitions to every
    /// instance whose user owns or is shared the serial.
    pub fn spawn_dispatcher(
        self: &Arc<Self>,
        mut changes: broadcast::Receiver<StateChange>,
        mut availability: mpsc::UnboundedReceiver<(String, bool)>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut availability_open = true;
            loop {
                tokio::select! {
                    change = changes.recv() => match change {
                        Ok(change) => manager.dispatch_change(&change).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!("Integration dispatcher lagged, missed {} changes", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    event = availability.recv(), if availability_open => match event {
                        Some((serial, up)) => manager.dispatch_availability(&serial, up).await,
                        None => availability_open = false,
                    },
                }
            }
        })
    }

    async fn dispatch_change(&self, change: &StateChange) {
        for instance in self.instances_for_serial(&change.serial).await {
            instance.on_device_state_change(change).await;
        }
    }

    async fn dispatch_availability(&self, serial: &str, available: bool) {
        for instance in self.instances_for_serial(serial).await {
            if available {
                instance.on_device_connected(serial).await;
            } else {
                instance.on_device_disconnected(serial).await;
            }
        }
    }

    async fn instances_for_serial(&self, serial: &str) -> Vec<Arc<dyn Integration>> {
        let users = match self.store.users_for_serial(serial) {
            Ok(users) => users,
            Err(e) => {
                tracing::error!("User lookup for {} failed: {}", serial, e);
                return Vec::new();
            }
        };
        if users.is_empty() {
            return Vec::new();
        }
        let running = self.running.lock().await;
        running
            .iter()
            .filter(|((user_id, _), _)| users.iter().any(|u| u == user_id))
            .map(|(_, instance)| Arc::clone(instance))
            .collect()
    }
}

impl std::fmt::Debug for IntegrationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrationManager").finish_non_exhaustive()
    }
}

/// A `CoreError::Integration` shorthand used by integration impls.
pub fn integration_error(msg: impl Into<String>) -> CoreError {
    CoreError::Integration(msg.into())
}
