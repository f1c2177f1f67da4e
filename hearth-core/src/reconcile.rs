//! Cross-device reconciliation.
//!
//! Whenever a `device.«serial»` object changes, the owning users' fleets
//! are re-summarized: a user is away only when every reporting device says
//! so, vacation mode is sticky across the fleet, and the freshest away and
//! manual-away timestamps win. The summary (plus cached weather for the
//! fleet's location) lands on each owned device as the `user.«userId»`
//! object, written back through the state service so subscribers and
//! integrations see it.

use crate::service::{DeviceStateService, StateChange};
use crate::value;
use crate::weather::WeatherCache;
use crate::Result;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub struct Reconciler {
    service: Arc<DeviceStateService>,
    weather: Arc<WeatherCache>,
}

struct AwaySummary {
    away: bool,
    vacation_mode: bool,
    away_timestamp: Option<i64>,
    away_setter: Option<Value>,
    manual_away_timestamp: Option<i64>,
}

impl AwaySummary {
    fn to_value(&self) -> Value {
        let mut out = json!({
            "away": self.away,
            "vacation_mode": self.vacation_mode,
        });
        if let Some(ts) = self.away_timestamp {
            out["away_timestamp"] = json!(ts);
        }
        if let Some(setter) = &self.away_setter {
            out["away_setter"] = setter.clone();
        }
        if let Some(ts) = self.manual_away_timestamp {
            out["manual_away_timestamp"] = json!(ts);
        }
        out
    }
}

impl Reconciler {
    pub fn new(service: Arc<DeviceStateService>, weather: Arc<WeatherCache>) -> Arc<Self> {
        Arc::new(Self { service, weather })
    }

    /// React to committed `device.*` changes until the service goes away.
    pub fn spawn(self: &Arc<Self>, mut changes: broadcast::Receiver<StateChange>) -> JoinHandle<()> {
        let reconciler = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        if value::key_type(&change.object_key) != "device" {
                            continue;
                        }
                        reconciler.on_device_change(&change.serial);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Reconciler lagged, missed {} changes", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn on_device_change(&self, serial: &str) {
        let owners = match self.service.store().owners_of(serial) {
            Ok(owners) => owners,
            Err(e) => {
                tracing::error!("Owner lookup for {} failed: {}", serial, e);
                return;
            }
        };
        for user_id in owners {
            if let Err(e) = self.reconcile_user(&user_id) {
                tracing::error!("Reconciliation for {} failed: {}", user_id, e);
            }
        }
    }

    /// Recompute and write the `user.«userId»` object on every device the
    /// user owns. A run that derives exactly what is already stored writes
    /// nothing, so back-to-back runs are a fixpoint.
    pub fn reconcile_user(&self, user_id: &str) -> Result<()> {
        let store = self.service.store();
        let serials = store.owned_serials(user_id)?;
        if serials.is_empty() {
            return Ok(());
        }

        let mut devices: Vec<Value> = Vec::new();
        for serial in &serials {
            if let Some(obj) = store.get(serial, &format!("device.{}", serial))? {
                devices.push(obj.value);
            }
        }

        let mut desired = summarize_away(&devices).to_value();
        if let Some(weather) = self.fleet_weather(&devices)? {
            desired["weather"] = weather;
        }

        let user_key = format!("user.{}", user_id);
        let now_ms = Utc::now().timestamp_millis();
        for serial in &serials {
            let existing = self.service.get(serial, &user_key)?;
            match existing {
                Some(prev) if value::deep_merge(&prev.value, &desired) == prev.value => {}
                Some(prev) => {
                    self.service.upsert(
                        serial,
                        &user_key,
                        prev.object_revision + 1,
                        now_ms,
                        &desired,
                    )?;
                }
                None => {
                    self.service.upsert(serial, &user_key, 1, now_ms, &desired)?;
                }
            }
        }
        Ok(())
    }

    /// Weather for the first owned device that reports a postal code.
    fn fleet_weather(&self, devices: &[Value]) -> Result<Option<Value>> {
        let location = devices.iter().find_map(|v| {
            let postal = v.get("postal_code").and_then(Value::as_str)?;
            if postal.is_empty() {
                return None;
            }
            let country = v
                .get("country")
                .and_then(Value::as_str)
                .filter(|c| !c.is_empty())
                .unwrap_or("US");
            Some((postal.to_string(), country.to_string()))
        });
        let Some((postal, country)) = location else {
            return Ok(None);
        };
        let Some(row) = self.weather.get(&postal, &country)? else {
            return Ok(None);
        };
        Ok(Some(json!({
            "current": row.current,
            "location": row.location,
            "updatedAt": row.fetched_at,
        })))
    }
}

fn summarize_away(devices: &[Value]) -> AwaySummary {
    let mut reported = 0usize;
    let mut all_away = true;
    let mut away_timestamp: Option<i64> = None;
    let mut vacation_mode = false;
    let mut manual_away_timestamp: Option<i64> = None;
    let mut away_setter: Option<Value> = None;

    for device in devices {
        if let Some(away) = device.get("away").and_then(Value::as_bool) {
            reported += 1;
            if !away {
                all_away = false;
            }
        }
        if let Some(ts) = device.get("away_timestamp").and_then(Value::as_i64) {
            away_timestamp = Some(away_timestamp.map_or(ts, |cur| cur.max(ts)));
        }
        if device.get("vacation_mode").and_then(Value::as_bool) == Some(true) {
            vacation_mode = true;
        }
        if let Some(ts) = device.get("manual_away_timestamp").and_then(Value::as_i64) {
            if manual_away_timestamp.is_none_or(|cur| ts > cur) {
                manual_away_timestamp = Some(ts);
                away_setter = device.get("away_setter").cloned();
            }
        }
    }

    AwaySummary {
        away: reported > 0 && all_away,
        vacation_mode,
        away_timestamp,
        away_setter,
        manual_away_timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{StateStore, WeatherRow};
    use crate::subscribe::SubscriptionManager;
    use crate::watchdog::AvailabilityWatchdog;
    use std::time::Duration;

    fn fixture() -> (Arc<DeviceStateService>, Arc<Reconciler>) {
        let store = Arc::new(StateStore::in_memory().unwrap());
        store.add_user("U").unwrap();
        store.add_owner("U", "A").unwrap();
        store.add_owner("U", "B").unwrap();
        let service = DeviceStateService::new(
            store,
            AvailabilityWatchdog::with_defaults(),
            SubscriptionManager::new(),
        );
        let weather = Arc::new(WeatherCache::new(Arc::clone(service.store())));
        let reconciler = Reconciler::new(Arc::clone(&service), weather);
        (service, reconciler)
    }

    #[tokio::test]
    async fn test_all_away_with_latest_timestamp() {
        let (svc, rec) = fixture();
        svc.upsert("A", "device.A", 1, 100, &json!({"away": true, "away_timestamp": 100}))
            .unwrap();
        svc.upsert(
            "B",
            "device.B",
            1,
            200,
            &json!({"away": true, "away_timestamp": 200, "vacation_mode": true}),
        )
        .unwrap();

        rec.reconcile_user("U").unwrap();

        for serial in ["A", "B"] {
            let user = svc.get(serial, "user.U").unwrap().unwrap();
            assert_eq!(user.value["away"], json!(true));
            assert_eq!(user.value["vacation_mode"], json!(true));
            assert_eq!(user.value["away_timestamp"], json!(200));
        }
    }

    #[tokio::test]
    async fn test_one_home_device_clears_away() {
        let (svc, rec) = fixture();
        svc.upsert("A", "device.A", 1, 100, &json!({"away": true, "away_timestamp": 100}))
            .unwrap();
        svc.upsert(
            "B",
            "device.B",
            1,
            200,
            &json!({"away": true, "away_timestamp": 200, "vacation_mode": true}),
        )
        .unwrap();
        rec.reconcile_user("U").unwrap();

        svc.upsert("A", "device.A", 2, 300, &json!({"away": false}))
            .unwrap();
        rec.reconcile_user("U").unwrap();

        for serial in ["A", "B"] {
            let user = svc.get(serial, "user.U").unwrap().unwrap();
            assert_eq!(user.value["away"], json!(false));
            assert_eq!(user.value["vacation_mode"], json!(true));
            assert_eq!(user.value["away_timestamp"], json!(200));
        }
    }

    #[tokio::test]
    async fn test_no_reporting_devices_means_home() {
        let (svc, rec) = fixture();
        svc.upsert("A", "device.A", 1, 100, &json!({"temperature": 20}))
            .unwrap();
        rec.reconcile_user("U").unwrap();
        let user = svc.get("A", "user.U").unwrap().unwrap();
        assert_eq!(user.value["away"], json!(false));
    }

    #[tokio::test]
    async fn test_manual_away_setter_follows_latest() {
        let (svc, rec) = fixture();
        svc.upsert(
            "A",
            "device.A",
            1,
            100,
            &json!({"away": true, "manual_away_timestamp": 50, "away_setter": 0}),
        )
        .unwrap();
        svc.upsert(
            "B",
            "device.B",
            1,
            100,
            &json!({"away": true, "manual_away_timestamp": 80, "away_setter": 1}),
        )
        .unwrap();
        rec.reconcile_user("U").unwrap();

        let user = svc.get("A", "user.U").unwrap().unwrap();
        assert_eq!(user.value["manual_away_timestamp"], json!(80));
        assert_eq!(user.value["away_setter"], json!(1));
    }

    #[tokio::test]
    async fn test_second_run_is_fixpoint() {
        let (svc, rec) = fixture();
        svc.upsert("A", "device.A", 1, 100, &json!({"away": true}))
            .unwrap();
        rec.reconcile_user("U").unwrap();
        let first = svc.get("A", "user.U").unwrap().unwrap();
        rec.reconcile_user("U").unwrap();
        let second = svc.get("A", "user.U").unwrap().unwrap();
        assert_eq!(first.object_revision, second.object_revision);
        assert_eq!(first.value, second.value);
    }

    #[tokio::test]
    async fn test_weather_lands_on_user_object() {
        let (svc, rec) = fixture();
        svc.store()
            .put_weather(&WeatherRow {
                postal_code: "94043".to_string(),
                country: "US".to_string(),
                current: json!({"temp_c": 18.5, "condition": "Clear"}),
                location: json!({"city": "Mountain View"}),
                fetched_at: 42,
            })
            .unwrap();
        svc.upsert(
            "A",
            "device.A",
            1,
            100,
            &json!({"away": false, "postal_code": "94043"}),
        )
        .unwrap();

        rec.reconcile_user("U").unwrap();
        let user = svc.get("B", "user.U").unwrap().unwrap();
        assert_eq!(user.value["weather"]["current"]["temp_c"], json!(18.5));
        assert_eq!(user.value["weather"]["updatedAt"], json!(42));
    }

    #[tokio::test]
    async fn test_spawned_reconciler_reacts_to_device_changes() {
        let (svc, rec) = fixture();
        let task = rec.spawn(svc.subscribe_changes());

        svc.upsert("A", "device.A", 1, 100, &json!({"away": true}))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let user = svc.get("A", "user.U").unwrap();
        assert!(user.is_some());
        assert_eq!(user.unwrap().value["away"], json!(true));
        task.abort();
    }
}
