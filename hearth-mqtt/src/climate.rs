//! Mapping between the thermostat's internal object fields and the derived
//! climate surface exposed over MQTT.
//!
//! Internal state is split across two objects: `shared.«serial»` carries
//! temperatures, the target mode and the HVAC relay states; `device.«serial»`
//! carries fan timer, occupancy and eco fields. Everything here is pure so
//! the tables are testable without a broker.

use serde_json::{json, Value};

pub const DEFAULT_SAFETY_TEMP_MIN_C: f64 = 9.0;
pub const DEFAULT_SAFETY_TEMP_MAX_C: f64 = 32.0;

/// Fan-on commands start a one-hour timer, mirroring the thermostat UI.
pub const FAN_COMMAND_DURATION_SECS: i64 = 3600;

/// Internal `target_temperature_type` → derived `mode`.
pub fn mode_from_internal(target_type: &str) -> &'static str {
    match target_type {
        "heat" => "heat",
        "cool" => "cool",
        "range" => "heat_cool",
        _ => "off",
    }
}

/// Derived `mode` → internal `target_temperature_type`.
pub fn mode_to_internal(mode: &str) -> Option<&'static str> {
    match mode {
        "off" => Some("off"),
        "heat" => Some("heat"),
        "cool" => Some("cool"),
        "heat_cool" => Some("range"),
        _ => None,
    }
}

/// Current HVAC action from the relay states.
pub fn derive_action(shared: &Value) -> &'static str {
    if shared.get("hvac_heater_state") == Some(&Value::Bool(true)) {
        "heating"
    } else if shared.get("hvac_ac_state") == Some(&Value::Bool(true)) {
        "cooling"
    } else if shared.get("hvac_fan_state") == Some(&Value::Bool(true)) {
        "fan"
    } else if target_type(shared) == "off" {
        "off"
    } else {
        "idle"
    }
}

/// `on` iff the fan is forced on with a live timer; `auto` otherwise.
pub fn derive_fan_mode(device: &Value, now_secs: i64) -> &'static str {
    let forced = device.get("fan_control_state") == Some(&Value::Bool(true));
    let timer_live = device
        .get("fan_timer_timeout")
        .and_then(Value::as_f64)
        .map(|t| t > now_secs as f64)
        .unwrap_or(false);
    if forced && timer_live {
        "on"
    } else {
        "auto"
    }
}

pub fn eco_active(device: &Value) -> bool {
    matches!(
        device
            .get("eco")
            .and_then(|eco| eco.get("mode"))
            .and_then(Value::as_str),
        Some("manual-eco") | Some("auto-eco")
    )
}

pub fn away_active(device: &Value) -> bool {
    device.get("away") == Some(&Value::Bool(true))
        || device
            .get("auto_away")
            .and_then(Value::as_i64)
            .map(|v| v >= 1)
            .unwrap_or(false)
}

pub fn derive_preset(device: &Value) -> &'static str {
    if eco_active(device) {
        "eco"
    } else if away_active(device) {
        "away"
    } else {
        "home"
    }
}

fn target_type(shared: &Value) -> &str {
    shared
        .get("target_temperature_type")
        .and_then(Value::as_str)
        .unwrap_or("off")
}

/// The derived climate surface for one device. Temperatures are Celsius.
#[derive(Debug, Clone, PartialEq)]
pub struct HaState {
    pub current_temperature: Option<f64>,
    pub current_humidity: Option<f64>,
    pub target_temperature: Option<f64>,
    pub target_temperature_low: Option<f64>,
    pub target_temperature_high: Option<f64>,
    pub mode: &'static str,
    pub action: &'static str,
    pub fan_mode: &'static str,
    pub preset: &'static str,
    pub outdoor_temperature: Option<f64>,
    pub occupancy: bool,
    pub fan_running: bool,
    pub eco: bool,
}

impl HaState {
    /// `user` is the `user.«userId»` object on the device, which carries the
    /// reconciled weather report.
    pub fn derive(device: &Value, shared: &Value, user: Option<&Value>, now_secs: i64) -> Self {
        let mode = mode_from_internal(target_type(shared));
        let in_range = mode == "heat_cool";
        Self {
            current_temperature: shared.get("current_temperature").and_then(Value::as_f64),
            current_humidity: device.get("current_humidity").and_then(Value::as_f64),
            target_temperature: if in_range {
                None
            } else {
                shared.get("target_temperature").and_then(Value::as_f64)
            },
            target_temperature_low: if in_range {
                shared.get("target_temperature_low").and_then(Value::as_f64)
            } else {
                None
            },
            target_temperature_high: if in_range {
                shared.get("target_temperature_high").and_then(Value::as_f64)
            } else {
                None
            },
            mode,
            action: derive_action(shared),
            fan_mode: derive_fan_mode(device, now_secs),
            preset: derive_preset(device),
            outdoor_temperature: user
                .and_then(|u| u.get("weather"))
                .and_then(|w| w.get("current"))
                .and_then(|c| c.get("temp_c"))
                .and_then(Value::as_f64),
            occupancy: !away_active(device),
            fan_running: shared.get("hvac_fan_state") == Some(&Value::Bool(true)),
            eco: eco_active(device),
        }
    }

    /// Topic suffix / payload pairs under `«prefix»/«serial»/ha/`.
    pub fn topic_values(&self) -> Vec<(&'static str, String)> {
        let mut out: Vec<(&'static str, String)> = Vec::new();
        if let Some(t) = self.current_temperature {
            out.push(("current_temperature", t.to_string()));
        }
        if let Some(h) = self.current_humidity {
            out.push(("current_humidity", h.to_string()));
        }
        if let Some(t) = self.target_temperature {
            out.push(("target_temperature", t.to_string()));
        }
        if let Some(t) = self.target_temperature_low {
            out.push(("target_temperature_low", t.to_string()));
        }
        if let Some(t) = self.target_temperature_high {
            out.push(("target_temperature_high", t.to_string()));
        }
        out.push(("mode", self.mode.to_string()));
        out.push(("action", self.action.to_string()));
        out.push(("fan_mode", self.fan_mode.to_string()));
        out.push(("preset", self.preset.to_string()));
        if let Some(t) = self.outdoor_temperature {
            out.push(("outdoor_temperature", t.to_string()));
        }
        out.push(("occupancy", self.occupancy.to_string()));
        out.push(("fan_running", self.fan_running.to_string()));
        out.push(("eco", self.eco.to_string()));
        out
    }
}

/// Which object a translated command writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTarget {
    Device,
    Shared,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandWrite {
    pub target: WriteTarget,
    pub value: Value,
}

/// Translate a derived `ha/«command»/set` payload into an object write.
/// Returns `None` for unknown commands or payloads that fail validation
/// (out-of-range temperatures, unparseable numbers).
pub fn translate_command(
    command: &str,
    payload: &str,
    shared: &Value,
    now_secs: i64,
) -> Option<CommandWrite> {
    match command {
        "mode" => {
            let internal = mode_to_internal(payload.trim())?;
            Some(CommandWrite {
                target: WriteTarget::Shared,
                value: json!({ "target_temperature_type": internal }),
            })
        }
        "target_temperature" | "target_temperature_low" | "target_temperature_high" => {
            let temp: f64 = payload.trim().parse().ok()?;
            if !within_safety_range(shared, temp) {
                return None;
            }
            Some(CommandWrite {
                target: WriteTarget::Shared,
                value: json!({ command: temp }),
            })
        }
        "fan_mode" => match payload.trim() {
            "on" => Some(CommandWrite {
                target: WriteTarget::Device,
                value: json!({
                    "fan_control_state": true,
                    "fan_timer_active": true,
                    "fan_timer_timeout": now_secs + FAN_COMMAND_DURATION_SECS,
                }),
            }),
            "off" | "auto" => Some(CommandWrite {
                target: WriteTarget::Device,
                value: json!({
                    "fan_control_state": false,
                    "fan_timer_active": false,
                    "fan_timer_timeout": 0,
                }),
            }),
            _ => None,
        },
        "preset" => match payload.trim() {
            "away" => Some(CommandWrite {
                target: WriteTarget::Device,
                value: json!({ "auto_away": 2, "away": true }),
            }),
            "home" => Some(CommandWrite {
                target: WriteTarget::Device,
                value: json!({ "auto_away": 0, "away": false }),
            }),
            "eco" => Some(CommandWrite {
                target: WriteTarget::Device,
                value: json!({ "eco": { "mode": "manual-eco", "leaf": true } }),
            }),
            _ => None,
        },
        _ => None,
    }
}

fn within_safety_range(shared: &Value, temp: f64) -> bool {
    let min = shared
        .get("safety_temp_min")
        .and_then(Value::as_f64)
        .unwrap_or(DEFAULT_SAFETY_TEMP_MIN_C);
    let max = shared
        .get("safety_temp_max")
        .and_then(Value::as_f64)
        .unwrap_or(DEFAULT_SAFETY_TEMP_MAX_C);
    temp >= min && temp <= max
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_mapping_roundtrip() {
        for (derived, internal) in [
            ("off", "off"),
            ("heat", "heat"),
            ("cool", "cool"),
            ("heat_cool", "range"),
        ] {
            assert_eq!(mode_to_internal(derived), Some(internal));
            assert_eq!(mode_from_internal(internal), derived);
        }
        assert_eq!(mode_to_internal("dry"), None);
        assert_eq!(mode_from_internal("unknown"), "off");
    }

    #[test]
    fn test_action_priority() {
        assert_eq!(
            derive_action(&json!({"hvac_heater_state": true, "hvac_fan_state": true})),
            "heating"
        );
        assert_eq!(derive_action(&json!({"hvac_ac_state": true})), "cooling");
        assert_eq!(derive_action(&json!({"hvac_fan_state": true})), "fan");
        assert_eq!(
            derive_action(&json!({"target_temperature_type": "off"})),
            "off"
        );
        assert_eq!(
            derive_action(&json!({"target_temperature_type": "heat"})),
            "idle"
        );
    }

    #[test]
    fn test_fan_mode_needs_live_timer() {
        let on = json!({"fan_control_state": true, "fan_timer_timeout": 2_000});
        assert_eq!(derive_fan_mode(&on, 1_000), "on");
        assert_eq!(derive_fan_mode(&on, 3_000), "auto");
        let off = json!({"fan_control_state": false, "fan_timer_timeout": 2_000});
        assert_eq!(derive_fan_mode(&off, 1_000), "auto");
    }

    #[test]
    fn test_preset_precedence() {
        assert_eq!(
            derive_preset(&json!({"eco": {"mode": "manual-eco"}, "away": true})),
            "eco"
        );
        assert_eq!(derive_preset(&json!({"away": true})), "away");
        assert_eq!(derive_preset(&json!({"auto_away": 1})), "away");
        assert_eq!(
            derive_preset(&json!({"eco": {"mode": "schedule"}, "auto_away": 0})),
            "home"
        );
    }

    #[test]
    fn test_ha_state_range_mode_uses_low_high() {
        let shared = json!({
            "target_temperature_type": "range",
            "target_temperature": 21.0,
            "target_temperature_low": 19.0,
            "target_temperature_high": 24.0,
            "current_temperature": 20.5,
        });
        let state = HaState::derive(&json!({}), &shared, None, 0);
        assert_eq!(state.mode, "heat_cool");
        assert_eq!(state.target_temperature, None);
        assert_eq!(state.target_temperature_low, Some(19.0));
        assert_eq!(state.target_temperature_high, Some(24.0));

        let topics: Vec<&str> = state.topic_values().iter().map(|(t, _)| *t).collect();
        assert!(topics.contains(&"target_temperature_low"));
        assert!(!topics.contains(&"target_temperature"));
    }

    #[test]
    fn test_ha_state_outdoor_temperature_from_user_object() {
        let user = json!({"weather": {"current": {"temp_c": 7.5}}});
        let state = HaState::derive(&json!({}), &json!({}), Some(&user), 0);
        assert_eq!(state.outdoor_temperature, Some(7.5));
    }

    #[test]
    fn test_translate_mode_command() {
        let write = translate_command("mode", "heat", &json!({}), 0).unwrap();
        assert_eq!(write.target, WriteTarget::Shared);
        assert_eq!(write.value, json!({"target_temperature_type": "heat"}));

        let write = translate_command("mode", "heat_cool", &json!({}), 0).unwrap();
        assert_eq!(write.value, json!({"target_temperature_type": "range"}));

        assert!(translate_command("mode", "dry", &json!({}), 0).is_none());
    }

    #[test]
    fn test_translate_temperature_respects_safety_range() {
        let shared = json!({"safety_temp_min": 10.0, "safety_temp_max": 28.0});
        let write = translate_command("target_temperature", "21.5", &shared, 0).unwrap();
        assert_eq!(write.value, json!({"target_temperature": 21.5}));

        assert!(translate_command("target_temperature", "35", &shared, 0).is_none());
        assert!(translate_command("target_temperature", "5", &shared, 0).is_none());
        assert!(translate_command("target_temperature", "warm", &shared, 0).is_none());

        // Defaults apply when the device never reported a range.
        assert!(translate_command("target_temperature", "8", &json!({}), 0).is_none());
        assert!(translate_command("target_temperature_low", "19", &json!({}), 0).is_some());
    }

    #[test]
    fn test_translate_fan_commands_are_atomic() {
        let on = translate_command("fan_mode", "on", &json!({}), 1_000).unwrap();
        assert_eq!(on.target, WriteTarget::Device);
        assert_eq!(
            on.value,
            json!({
                "fan_control_state": true,
                "fan_timer_active": true,
                "fan_timer_timeout": 1_000 + FAN_COMMAND_DURATION_SECS,
            })
        );

        let off = translate_command("fan_mode", "off", &json!({}), 1_000).unwrap();
        assert_eq!(
            off.value,
            json!({
                "fan_control_state": false,
                "fan_timer_active": false,
                "fan_timer_timeout": 0,
            })
        );
    }

    #[test]
    fn test_translate_presets() {
        let away = translate_command("preset", "away", &json!({}), 0).unwrap();
        assert_eq!(away.value, json!({"auto_away": 2, "away": true}));
        let home = translate_command("preset", "home", &json!({}), 0).unwrap();
        assert_eq!(home.value, json!({"auto_away": 0, "away": false}));
        let eco = translate_command("preset", "eco", &json!({}), 0).unwrap();
        assert_eq!(eco.value, json!({"eco": {"mode": "manual-eco", "leaf": true}}));
        assert!(translate_command("preset", "party", &json!({}), 0).is_none());
    }

    #[test]
    fn test_unknown_command_ignored() {
        assert!(translate_command("swing_mode", "on", &json!({}), 0).is_none());
    }
}
