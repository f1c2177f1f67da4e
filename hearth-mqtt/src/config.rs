//! Per-user bridge configuration, deserialized from the `integrations`
//! table's JSON config column.

use hearth_core::{CoreError, Result};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MqttConfig {
    /// `mqtt://host:port`; empty means the server-wide default broker.
    pub broker_url: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Root of all bridge topics, e.g. `nest/«serial»/shared`.
    pub topic_prefix: String,
    pub discovery_prefix: String,
    pub publish_raw: bool,
    pub home_assistant_discovery: bool,
    pub reconcile_interval_secs: u64,
    pub connect_timeout_secs: u64,
    pub reconnect_delay_secs: u64,
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_url: String::new(),
            client_id: String::new(),
            username: None,
            password: None,
            topic_prefix: "nest".to_string(),
            discovery_prefix: "homeassistant".to_string(),
            publish_raw: true,
            home_assistant_discovery: true,
            reconcile_interval_secs: 10,
            connect_timeout_secs: 10,
            reconnect_delay_secs: 5,
            keep_alive_secs: 30,
        }
    }
}

impl MqttConfig {
    pub fn from_value(user_id: &str, config: &Value, default_broker_url: &str) -> Result<Self> {
        let mut cfg: Self = serde_json::from_value(config.clone())?;
        if cfg.broker_url.is_empty() {
            cfg.broker_url = default_broker_url.to_string();
        }
        if cfg.broker_url.is_empty() {
            return Err(CoreError::Integration(format!(
                "No broker URL configured for {}",
                user_id
            )));
        }
        if cfg.client_id.is_empty() {
            cfg.client_id = format!("hearth-{}", user_id);
        }
        Ok(cfg)
    }
}

/// Parse an MQTT URL like "mqtt://host:port" into (host, port).
pub(crate) fn parse_broker_url(url: &str) -> Result<(String, u16)> {
    let stripped = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);

    match stripped.rsplit_once(':') {
        Some((host, port_str)) => {
            let port: u16 = port_str
                .parse()
                .map_err(|_| CoreError::Integration(format!("Invalid MQTT port in {}", url)))?;
            Ok((host.to_string(), port))
        }
        None => Ok((stripped.to_string(), 1883)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_and_fallback_broker() {
        let cfg = MqttConfig::from_value("u1", &json!({}), "mqtt://broker:1883").unwrap();
        assert_eq!(cfg.broker_url, "mqtt://broker:1883");
        assert_eq!(cfg.client_id, "hearth-u1");
        assert_eq!(cfg.topic_prefix, "nest");
        assert!(cfg.publish_raw);
        assert!(cfg.home_assistant_discovery);
    }

    #[test]
    fn test_explicit_config_wins() {
        let cfg = MqttConfig::from_value(
            "u1",
            &json!({
                "brokerUrl": "mqtt://other:1884",
                "clientId": "bridge-1",
                "topicPrefix": "home/thermostat",
                "publishRaw": false
            }),
            "mqtt://broker:1883",
        )
        .unwrap();
        assert_eq!(cfg.broker_url, "mqtt://other:1884");
        assert_eq!(cfg.client_id, "bridge-1");
        assert_eq!(cfg.topic_prefix, "home/thermostat");
        assert!(!cfg.publish_raw);
    }

    #[test]
    fn test_no_broker_anywhere_is_an_error() {
        assert!(MqttConfig::from_value("u1", &json!({}), "").is_err());
    }

    #[test]
    fn test_parse_broker_url() {
        assert_eq!(
            parse_broker_url("mqtt://broker:1884").unwrap(),
            ("broker".to_string(), 1884)
        );
        assert_eq!(
            parse_broker_url("tcp://10.0.0.2:1883").unwrap(),
            ("10.0.0.2".to_string(), 1883)
        );
        assert_eq!(
            parse_broker_url("broker").unwrap(),
            ("broker".to_string(), 1883)
        );
        assert!(parse_broker_url("mqtt://broker:nope").is_err());
    }
}
