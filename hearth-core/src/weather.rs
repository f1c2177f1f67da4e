//! In-memory TTL cache over the `weather` table.
//!
//! Fetching reports is someone else's job; the core only reads whatever a
//! fetcher last stored, holding each location in memory for the TTL so the
//! status endpoint and the reconciler don't hammer the database.

use crate::store::{StateStore, WeatherRow};
use crate::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const DEFAULT_WEATHER_TTL: Duration = Duration::from_secs(30 * 60);

struct CacheEntry {
    fetched: Instant,
    row: Option<WeatherRow>,
}

pub struct WeatherCache {
    store: Arc<StateStore>,
    entries: Mutex<HashMap<(String, String), CacheEntry>>,
    ttl: Duration,
}

impl WeatherCache {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self::with_ttl(store, DEFAULT_WEATHER_TTL)
    }

    pub fn with_ttl(store: Arc<StateStore>, ttl: Duration) -> Self {
        Self {
            store,
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn get(&self, postal_code: &str, country: &str) -> Result<Option<WeatherRow>> {
        let key = (postal_code.to_string(), country.to_string());
        {
            let entries = self.entries.lock().unwrap();
            if let Some(entry) = entries.get(&key) {
                if entry.fetched.elapsed() < self.ttl {
                    return Ok(entry.row.clone());
                }
            }
        }

        let row = self.store.weather_for(postal_code, country)?;
        self.entries.lock().unwrap().insert(
            key,
            CacheEntry {
                fetched: Instant::now(),
                row: row.clone(),
            },
        );
        Ok(row)
    }
}
