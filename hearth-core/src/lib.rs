//! Device State Engine
//!
//! This library provides the core functionality for the hearth backend:
//! the versioned per-device object store, availability tracking, long-poll
//! subscription fan-out, and the state service facade every write routes
//! through so observers fire consistently.

pub mod integration;
pub mod reconcile;
pub mod service;
pub mod store;
pub mod subscribe;
pub mod value;
pub mod watchdog;
pub mod weather;

pub use integration::{Integration, IntegrationFactory, IntegrationManager};
pub use reconcile::Reconciler;
pub use service::{DeviceStateService, StateChange};
pub use store::{DeviceObject, IntegrationRow, StateStore, WeatherRow};
pub use subscribe::{SubscriptionManager, WaiterGuard};
pub use watchdog::AvailabilityWatchdog;
pub use weather::WeatherCache;

use thiserror::Error;

/// Result type for state engine operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// General error type for state engine operations
#[derive(Error, Debug)]
pub enum CoreError {
    /// Backing store unavailable or rejected the operation; retryable.
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("Unknown serial: {0}")]
    UnknownSerial(String),

    #[error("Integration error: {0}")]
    Integration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}
