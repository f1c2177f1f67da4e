//! Fleet liveness tracking.
//!
//! Every device touch (check-in, write, open long poll) marks the serial as
//! seen; a periodic sweep flips devices to unavailable after a silent
//! interval and refreshes any serial that currently holds an open long-poll
//! session. Transitions are reported through a single change handler.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time;

pub const DEFAULT_TIMEOUT_MS: u64 = 300_000;
pub const DEFAULT_CHECK_INTERVAL_MS: u64 = 30_000;

type ChangeHandler = Arc<dyn Fn(&str, bool) + Send + Sync>;
type ActiveSource = Box<dyn Fn() -> HashSet<String> + Send + Sync>;

struct Liveness {
    last_seen: Instant,
    available: bool,
}

pub struct AvailabilityWatchdog {
    devices: Mutex<HashMap<String, Liveness>>,
    handler: Mutex<Option<ChangeHandler>>,
    active_source: Mutex<Option<ActiveSource>>,
    timeout: Duration,
    check_interval: Duration,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl AvailabilityWatchdog {
    pub fn new(timeout: Duration, check_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            devices: Mutex::new(HashMap::new()),
            handler: Mutex::new(None),
            active_source: Mutex::new(None),
            timeout,
            check_interval,
            sweep_task: Mutex::new(None),
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(
            Duration::from_millis(DEFAULT_TIMEOUT_MS),
            Duration::from_millis(DEFAULT_CHECK_INTERVAL_MS),
        )
    }

    pub fn set_change_handler<F>(&self, handler: F)
    where
        F: Fn(&str, bool) + Send + Sync + 'static,
    {
        *self.handler.lock().unwrap() = Some(Arc::new(handler));
    }

    /// Source of serials that currently hold an open long-poll session;
    /// the sweep treats these as seen.
    pub fn set_active_serials_source<F>(&self, source: F)
    where
        F: Fn() -> HashSet<String> + Send + Sync + 'static,
    {
        *self.active_source.lock().unwrap() = Some(Box::new(source));
    }

    pub fn mark_seen(&self, serial: &str) {
        let transitioned = {
            let mut devices = self.devices.lock().unwrap();
            match devices.get_mut(serial) {
                Some(entry) => {
                    entry.last_seen = Instant::now();
                    if !entry.available {
                        entry.available = true;
                        true
                    } else {
                        false
                    }
                }
                None => {
                    devices.insert(
                        serial.to_string(),
                        Liveness {
                            last_seen: Instant::now(),
                            available: true,
                        },
                    );
                    true
                }
            }
        };
        if transitioned {
            self.emit(serial, true);
        }
    }

    /// Devices unknown to the watchdog are reported as unavailable.
    pub fn get_availability(&self, serial: &str) -> bool {
        self.devices
            .lock()
            .unwrap()
            .get(serial)
            .map(|d| d.available)
            .unwrap_or(false)
    }

    pub fn force_unavailable(&self, serial: &str) {
        let transitioned = {
            let mut devices = self.devices.lock().unwrap();
            match devices.get_mut(serial) {
                Some(entry) if entry.available => {
                    entry.available = false;
                    true
                }
                _ => false,
            }
        };
        if transitioned {
            self.emit(serial, false);
        }
    }

    pub fn start(self: &Arc<Self>) {
        let watchdog = Arc::clone(self);
        let interval = self.check_interval;
        let task = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                watchdog.sweep();
            }
        });
        if let Some(old) = self.sweep_task.lock().unwrap().replace(task) {
            old.abort();
        }
    }

    pub fn stop(&self) {
        if let Some(task) = self.sweep_task.lock().unwrap().take() {
            task.abort();
        }
    }

    fn sweep(&self) {
        let active: HashSet<String> = {
            let source = self.active_source.lock().unwrap();
            source.as_ref().map(|s| s()).unwrap_or_default()
        };

        let mut transitions: Vec<(String, bool)> = Vec::new();
        {
            let mut devices = self.devices.lock().unwrap();
            let now = Instant::now();

            // A held-open subscription counts as a touch.
            for serial in &active {
                match devices.get_mut(serial) {
                    Some(entry) => {
                        entry.last_seen = now;
                        if !entry.available {
                            entry.available = true;
                            transitions.push((serial.clone(), true));
                        }
                    }
                    None => {
                        devices.insert(
                            serial.clone(),
                            Liveness {
                                last_seen: now,
                                available: true,
                            },
                        );
                        transitions.push((serial.clone(), true));
                    }
                }
            }

            for (serial, entry) in devices.iter_mut() {
                if entry.available && now.duration_since(entry.last_seen) > self.timeout {
                    entry.available = false;
                    transitions.push((serial.clone(), false));
                }
            }
        }

        for (serial, up) in transitions {
            self.emit(&serial, up);
        }
    }

    fn emit(&self, serial: &str, available: bool) {
        let handler = self.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            // Handler panics must not take the sweep down with them.
            if catch_unwind(AssertUnwindSafe(|| handler(serial, available))).is_err() {
                tracing::error!(
                    "Availability handler panicked for {} ({})",
                    serial,
                    if available { "online" } else { "offline" }
                );
            }
        }
    }
}
