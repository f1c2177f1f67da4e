//! Home Assistant discovery payloads.
//!
//! One retained config message per entity under
//! `«discoveryPrefix»/«component»/«serial»/«object»/config`; removing a
//! device is an empty retained payload on the same topics. The climate
//! payload depends on the current mode: range mode swaps the single
//! setpoint topics for the low/high pair.

use crate::climate;
use serde_json::{json, Value};

/// All discovery config topics for a serial, in publish order. Also the
/// tombstone list on device removal.
pub fn config_topics(discovery_prefix: &str, serial: &str) -> Vec<String> {
    vec![
        format!("{}/climate/{}/thermostat/config", discovery_prefix, serial),
        format!("{}/sensor/{}/temperature/config", discovery_prefix, serial),
        format!("{}/sensor/{}/humidity/config", discovery_prefix, serial),
        format!(
            "{}/sensor/{}/outdoor_temperature/config",
            discovery_prefix, serial
        ),
        format!(
            "{}/binary_sensor/{}/occupancy/config",
            discovery_prefix, serial
        ),
    ]
}

/// Discovery payloads keyed by config topic, derived from the current
/// `shared.«serial»` value so the entity schema matches capability.
pub fn config_payloads(
    topic_prefix: &str,
    discovery_prefix: &str,
    serial: &str,
    shared: &Value,
) -> Vec<(String, Value)> {
    let name = shared
        .get("name")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .unwrap_or(serial);
    let base = format!("{}/{}", topic_prefix, serial);
    let availability = format!("{}/availability", base);
    let device = device_info(serial, name);

    let mut climate_cfg = json!({
        "name": name,
        "unique_id": format!("{}_thermostat", serial),
        "modes": supported_modes(shared),
        "mode_state_topic": format!("{}/ha/mode", base),
        "mode_command_topic": format!("{}/ha/mode/set", base),
        "current_temperature_topic": format!("{}/ha/current_temperature", base),
        "action_topic": format!("{}/ha/action", base),
        "fan_modes": ["auto", "on"],
        "fan_mode_state_topic": format!("{}/ha/fan_mode", base),
        "fan_mode_command_topic": format!("{}/ha/fan_mode/set", base),
        "preset_modes": ["home", "away", "eco"],
        "preset_mode_state_topic": format!("{}/ha/preset", base),
        "preset_mode_command_topic": format!("{}/ha/preset/set", base),
        "availability_topic": availability,
        "payload_available": "online",
        "payload_not_available": "offline",
        "min_temp": climate::DEFAULT_SAFETY_TEMP_MIN_C,
        "max_temp": climate::DEFAULT_SAFETY_TEMP_MAX_C,
        "temp_step": 0.5,
        "temperature_unit": "C",
        "device": device,
    });
    let range_mode = shared.get("target_temperature_type").and_then(Value::as_str) == Some("range");
    if range_mode {
        climate_cfg["temperature_low_state_topic"] =
            json!(format!("{}/ha/target_temperature_low", base));
        climate_cfg["temperature_low_command_topic"] =
            json!(format!("{}/ha/target_temperature_low/set", base));
        climate_cfg["temperature_high_state_topic"] =
            json!(format!("{}/ha/target_temperature_high", base));
        climate_cfg["temperature_high_command_topic"] =
            json!(format!("{}/ha/target_temperature_high/set", base));
    } else {
        climate_cfg["temperature_state_topic"] = json!(format!("{}/ha/target_temperature", base));
        climate_cfg["temperature_command_topic"] =
            json!(format!("{}/ha/target_temperature/set", base));
    }

    let topics = config_topics(discovery_prefix, serial);
    vec![
        (topics[0].clone(), climate_cfg),
        (
            topics[1].clone(),
            json!({
                "name": format!("{} Temperature", name),
                "unique_id": format!("{}_temperature", serial),
                "state_topic": format!("{}/ha/current_temperature", base),
                "unit_of_measurement": "°C",
                "device_class": "temperature",
                "availability_topic": format!("{}/availability", base),
                "device": device,
            }),
        ),
        (
            topics[2].clone(),
            json!({
                "name": format!("{} Humidity", name),
                "unique_id": format!("{}_humidity", serial),
                "state_topic": format!("{}/ha/current_humidity", base),
                "unit_of_measurement": "%",
                "device_class": "humidity",
                "availability_topic": format!("{}/availability", base),
                "device": device,
            }),
        ),
        (
            topics[3].clone(),
            json!({
                "name": format!("{} Outdoor Temperature", name),
                "unique_id": format!("{}_outdoor_temperature", serial),
                "state_topic": format!("{}/ha/outdoor_temperature", base),
                "unit_of_measurement": "°C",
                "device_class": "temperature",
                "availability_topic": format!("{}/availability", base),
                "device": device,
            }),
        ),
        (
            topics[4].clone(),
            json!({
                "name": format!("{} Occupancy", name),
                "unique_id": format!("{}_occupancy", serial),
                "state_topic": format!("{}/ha/occupancy", base),
                "payload_on": "true",
                "payload_off": "false",
                "device_class": "occupancy",
                "availability_topic": format!("{}/availability", base),
                "device": device,
            }),
        ),
    ]
}

fn supported_modes(shared: &Value) -> Value {
    let can_heat = shared.get("can_heat").and_then(Value::as_bool).unwrap_or(true);
    let can_cool = shared.get("can_cool").and_then(Value::as_bool).unwrap_or(true);
    let mut modes = vec!["off"];
    if can_heat {
        modes.push("heat");
    }
    if can_cool {
        modes.push("cool");
    }
    if can_heat && can_cool {
        modes.push("heat_cool");
    }
    json!(modes)
}

fn device_info(serial: &str, name: &str) -> Value {
    json!({
        "identifiers": [serial],
        "name": name,
        "manufacturer": "Nest",
        "model": "Learning Thermostat",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_setpoint_topics_in_heat_mode() {
        let shared = json!({"name": "Hallway", "target_temperature_type": "heat"});
        let payloads = config_payloads("nest", "homeassistant", "02AA", &shared);
        let (topic, climate_cfg) = &payloads[0];
        assert_eq!(topic, "homeassistant/climate/02AA/thermostat/config");
        assert_eq!(climate_cfg["name"], json!("Hallway"));
        assert_eq!(
            climate_cfg["temperature_command_topic"],
            json!("nest/02AA/ha/target_temperature/set")
        );
        assert!(climate_cfg.get("temperature_low_command_topic").is_none());
    }

    #[test]
    fn test_range_mode_swaps_setpoint_topics() {
        let shared = json!({"target_temperature_type": "range"});
        let payloads = config_payloads("nest", "homeassistant", "02AA", &shared);
        let climate_cfg = &payloads[0].1;
        assert!(climate_cfg.get("temperature_command_topic").is_none());
        assert_eq!(
            climate_cfg["temperature_high_command_topic"],
            json!("nest/02AA/ha/target_temperature_high/set")
        );
    }

    #[test]
    fn test_capability_limits_modes() {
        let shared = json!({"can_heat": true, "can_cool": false});
        let payloads = config_payloads("nest", "homeassistant", "02AA", &shared);
        assert_eq!(payloads[0].1["modes"], json!(["off", "heat"]));
    }

    #[test]
    fn test_tombstone_topics_match_config_topics() {
        let shared = json!({});
        let payloads = config_payloads("nest", "homeassistant", "02AA", &shared);
        let topics = config_topics("homeassistant", "02AA");
        assert_eq!(payloads.len(), topics.len());
        for (published, expected) in payloads.iter().zip(topics.iter()) {
            assert_eq!(&published.0, expected);
        }
    }
}
