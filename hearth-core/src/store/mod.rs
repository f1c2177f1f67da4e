//! SQLite storage backend for device state.
//!
//! One logical row per `(serial, object_key)` in `states`; ownership, share,
//! integration, weather and entry-key tables are read by the core for
//! authorization, device-set construction and reconciliation. All writes to
//! a given key go through [`StateStore::upsert`], which applies the deep
//! merge and the fan-timer preservation hook under the connection lock, so
//! no two merges for a key can interleave.

pub mod models;

pub use models::{DeviceObject, IntegrationRow, WeatherRow};

use crate::value;
use crate::{CoreError, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Thread-safe device state storage.
#[derive(Clone)]
pub struct StateStore {
    conn: Arc<Mutex<Connection>>,
}

impl StateStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS states (
                serial TEXT NOT NULL,
                object_key TEXT NOT NULL,
                object_revision INTEGER NOT NULL,
                object_timestamp INTEGER NOT NULL,
                value_json TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (serial, object_key)
            );

            CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                display_name TEXT
            );

            CREATE TABLE IF NOT EXISTS device_owners (
                user_id TEXT NOT NULL,
                serial TEXT NOT NULL,
                PRIMARY KEY (user_id, serial)
            );

            CREATE TABLE IF NOT EXISTS device_shares (
                owner_id TEXT NOT NULL,
                shared_with TEXT NOT NULL,
                serial TEXT NOT NULL,
                permissions TEXT NOT NULL DEFAULT '[]',
                PRIMARY KEY (owner_id, shared_with, serial)
            );

            CREATE TABLE IF NOT EXISTS entry_keys (
                entry_key TEXT PRIMARY KEY,
                serial TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS weather (
                postal_code TEXT NOT NULL,
                country TEXT NOT NULL,
                current_json TEXT NOT NULL,
                location_json TEXT NOT NULL,
                fetched_at INTEGER NOT NULL,
                PRIMARY KEY (postal_code, country)
            );

            CREATE TABLE IF NOT EXISTS api_keys (
                api_key TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                label TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS integrations (
                user_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                config_json TEXT NOT NULL DEFAULT '{}',
                PRIMARY KEY (user_id, kind)
            );

            CREATE INDEX IF NOT EXISTS idx_states_serial ON states(serial);
            CREATE INDEX IF NOT EXISTS idx_owners_serial ON device_owners(serial);
            CREATE INDEX IF NOT EXISTS idx_shares_serial ON device_shares(serial);",
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| CoreError::Storage(format!("Lock error: {}", e)))
    }

    // ── Device objects ──────────────────────────────────────────────

    pub fn get(&self, serial: &str, object_key: &str) -> Result<Option<DeviceObject>> {
        let conn = self.conn()?;
        Self::read_object(&conn, serial, object_key)
    }

    pub fn get_all_for_device(&self, serial: &str) -> Result<HashMap<String, DeviceObject>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT object_key, object_revision, object_timestamp, value_json, updated_at
             FROM states WHERE serial = ?1",
        )?;
        let rows = stmt.query_map([serial], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut out = HashMap::new();
        for row in rows {
            let (object_key, object_revision, object_timestamp, value_json, updated_at) = row?;
            match serde_json::from_str(&value_json) {
                Ok(value) => {
                    out.insert(
                        object_key.clone(),
                        DeviceObject {
                            serial: serial.to_string(),
                            object_key,
                            object_revision,
                            object_timestamp,
                            value,
                            updated_at,
                        },
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "Malformed stored value for ({}, {}): {}",
                        serial,
                        object_key,
                        e
                    );
                }
            }
        }
        Ok(out)
    }

    /// Merge `incoming_value` into the stored value for `(serial, object_key)`
    /// and persist the result.
    ///
    /// The revision never regresses: an unchanged post-merge value records
    /// `max(stored, incoming)`, a changed one at least `stored + 1`. When the
    /// previous value carries an active fan timer and the incoming payload is
    /// not an explicit fan-off, the fan-timer fields are re-injected over the
    /// merge result.
    pub fn upsert(
        &self,
        serial: &str,
        object_key: &str,
        incoming_revision: i64,
        incoming_timestamp: i64,
        incoming_value: &Value,
    ) -> Result<DeviceObject> {
        let conn = self.conn()?;
        let existing = Self::read_object(&conn, serial, object_key)?;
        let now_ms = Utc::now().timestamp_millis();

        let (object_revision, merged) = match existing {
            Some(prev) => {
                let mut merged = value::deep_merge(&prev.value, incoming_value);
                if value::fan_timer_active(&prev.value, now_ms / 1000)
                    && !value::is_explicit_fan_off(incoming_value)
                {
                    value::preserve_fan_timer(&prev.value, &mut merged);
                }
                let revision = if merged == prev.value {
                    prev.object_revision.max(incoming_revision)
                } else {
                    (prev.object_revision + 1).max(incoming_revision)
                };
                (revision, merged)
            }
            None => (incoming_revision.max(1), incoming_value.clone()),
        };

        let value_json = serde_json::to_string(&merged)?;
        conn.execute(
            "INSERT INTO states (serial, object_key, object_revision, object_timestamp,
                                 value_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(serial, object_key) DO UPDATE SET
                object_revision = excluded.object_revision,
                object_timestamp = excluded.object_timestamp,
                value_json = excluded.value_json,
                updated_at = excluded.updated_at",
            params![
                serial,
                object_key,
                object_revision,
                incoming_timestamp,
                value_json,
                now_ms
            ],
        )?;

        Ok(DeviceObject {
            serial: serial.to_string(),
            object_key: object_key.to_string(),
            object_revision,
            object_timestamp: incoming_timestamp,
            value: merged,
            updated_at: now_ms,
        })
    }

    fn read_object(
        conn: &Connection,
        serial: &str,
        object_key: &str,
    ) -> Result<Option<DeviceObject>> {
        let row: Option<(i64, i64, String, i64)> = conn
            .query_row(
                "SELECT object_revision, object_timestamp, value_json, updated_at
                 FROM states WHERE serial = ?1 AND object_key = ?2",
                params![serial, object_key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        let Some((object_revision, object_timestamp, value_json, updated_at)) = row else {
            return Ok(None);
        };

        match serde_json::from_str(&value_json) {
            Ok(value) => Ok(Some(DeviceObject {
                serial: serial.to_string(),
                object_key: object_key.to_string(),
                object_revision,
                object_timestamp,
                value,
                updated_at,
            })),
            Err(e) => {
                // Key behaves as absent; the next write recreates it.
                tracing::warn!(
                    "Malformed stored value for ({}, {}): {}",
                    serial,
                    object_key,
                    e
                );
                Ok(None)
            }
        }
    }

    // ── Ownership & shares ──────────────────────────────────────────

    pub fn add_user(&self, user_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO users (user_id) VALUES (?1)",
            [user_id],
        )?;
        Ok(())
    }

    pub fn add_owner(&self, user_id: &str, serial: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO device_owners (user_id, serial) VALUES (?1, ?2)",
            params![user_id, serial],
        )?;
        Ok(())
    }

    pub fn add_share(
        &self,
        owner_id: &str,
        shared_with: &str,
        serial: &str,
        permissions: &[String],
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO device_shares (owner_id, shared_with, serial, permissions)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                owner_id,
                shared_with,
                serial,
                serde_json::to_string(permissions)?
            ],
        )?;
        Ok(())
    }

    /// A serial is authorized to talk to the transport iff some user owns
    /// it or is shared it.
    pub fn is_authorized_serial(&self, serial: &str) -> Result<bool> {
        let conn = self.conn()?;
        let known: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM device_owners WHERE serial = ?1)
                 OR EXISTS(SELECT 1 FROM device_shares WHERE serial = ?1)",
            [serial],
            |row| row.get(0),
        )?;
        Ok(known)
    }

    pub fn owners_of(&self, serial: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT user_id FROM device_owners WHERE serial = ?1 ORDER BY user_id")?;
        let users = stmt
            .query_map([serial], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(users)
    }

    /// Users who own or are shared the serial, owners first.
    pub fn users_for_serial(&self, serial: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT user_id FROM device_owners WHERE serial = ?1
             UNION
             SELECT shared_with FROM device_shares WHERE serial = ?1",
        )?;
        let users = stmt
            .query_map([serial], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(users)
    }

    pub fn owned_serials(&self, user_id: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT serial FROM device_owners WHERE user_id = ?1 ORDER BY serial")?;
        let serials = stmt
            .query_map([user_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(serials)
    }

    /// Owned plus shared-with serials for a user, deduplicated.
    pub fn device_set(&self, user_id: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT serial FROM device_owners WHERE user_id = ?1
             UNION
             SELECT serial FROM device_shares WHERE shared_with = ?1
             ORDER BY serial",
        )?;
        let serials = stmt
            .query_map([user_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(serials)
    }

    pub fn known_serials(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT DISTINCT serial FROM device_owners ORDER BY serial")?;
        let serials = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(serials)
    }

    // ── Entry keys (pairing contract) ───────────────────────────────

    pub fn insert_entry_key(&self, entry_key: &str, serial: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO entry_keys (entry_key, serial, created_at) VALUES (?1, ?2, ?3)",
            params![entry_key, serial, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    /// Consume an entry key, returning the serial it was allocated for.
    pub fn claim_entry_key(&self, entry_key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let serial: Option<String> = conn
            .query_row(
                "SELECT serial FROM entry_keys WHERE entry_key = ?1",
                [entry_key],
                |row| row.get(0),
            )
            .optional()?;
        if serial.is_some() {
            conn.execute("DELETE FROM entry_keys WHERE entry_key = ?1", [entry_key])?;
        }
        Ok(serial)
    }

    // ── Integrations ────────────────────────────────────────────────

    pub fn enabled_integrations(&self) -> Result<Vec<IntegrationRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, kind, enabled, config_json FROM integrations WHERE enabled = 1",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, bool>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (user_id, kind, enabled, config_json) = row?;
            let config = match serde_json::from_str(&config_json) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!("Malformed integration config for {}/{}: {}", user_id, kind, e);
                    continue;
                }
            };
            out.push(IntegrationRow {
                user_id,
                kind,
                enabled,
                config,
            });
        }
        Ok(out)
    }

    pub fn set_integration(
        &self,
        user_id: &str,
        kind: &str,
        enabled: bool,
        config: &Value,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO integrations (user_id, kind, enabled, config_json)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, kind) DO UPDATE SET
                enabled = excluded.enabled,
                config_json = excluded.config_json",
            params![user_id, kind, enabled, serde_json::to_string(config)?],
        )?;
        Ok(())
    }

    // ── Weather ─────────────────────────────────────────────────────

    pub fn weather_for(&self, postal_code: &str, country: &str) -> Result<Option<WeatherRow>> {
        let conn = self.conn()?;
        let row: Option<(String, String, i64)> = conn
            .query_row(
                "SELECT current_json, location_json, fetched_at
                 FROM weather WHERE postal_code = ?1 AND country = ?2",
                params![postal_code, country],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((current_json, location_json, fetched_at)) = row else {
            return Ok(None);
        };
        let current = match serde_json::from_str(&current_json) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Malformed weather row for {} {}: {}", postal_code, country, e);
                return Ok(None);
            }
        };
        let location = serde_json::from_str(&location_json).unwrap_or(Value::Null);
        Ok(Some(WeatherRow {
            postal_code: postal_code.to_string(),
            country: country.to_string(),
            current,
            location,
            fetched_at,
        }))
    }

    pub fn put_weather(&self, row: &WeatherRow) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO weather (postal_code, country, current_json, location_json, fetched_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(postal_code, country) DO UPDATE SET
                current_json = excluded.current_json,
                location_json = excluded.location_json,
                fetched_at = excluded.fetched_at",
            params![
                row.postal_code,
                row.country,
                serde_json::to_string(&row.current)?,
                serde_json::to_string(&row.location)?,
                row.fetched_at
            ],
        )?;
        Ok(())
    }

    /// Raw connection access for schema-level test setup.
    #[cfg(test)]
    pub(crate) fn raw(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }
}
