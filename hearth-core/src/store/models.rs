//! Row types for the backing store.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A versioned sub-document of a device, keyed by `(serial, object_key)`.
///
/// `object_key` is of the form `«type».«id»` (`device.02AA…`, `shared.02AA…`,
/// `user.u-1`, …). The stored value is the left-fold deep merge of every
/// applied write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceObject {
    pub serial: String,
    pub object_key: String,
    pub object_revision: i64,
    /// Device-supplied epoch milliseconds of the originating event.
    pub object_timestamp: i64,
    pub value: Value,
    /// Server-side epoch milliseconds of the last write.
    #[serde(rename = "updatedAt")]
    pub updated_at: i64,
}

/// A per-user outbound integration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationRow {
    pub user_id: String,
    pub kind: String,
    pub enabled: bool,
    pub config: Value,
}

/// A cached weather report for a `(postal_code, country)` location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherRow {
    pub postal_code: String,
    pub country: String,
    pub current: Value,
    pub location: Value,
    /// Epoch milliseconds the report was fetched.
    pub fetched_at: i64,
}
