use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required config field: {0}")]
    MissingField(&'static str),
    #[error("invalid config value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Explicit client id; derived from the hardware MAC when empty.
    pub client_id: String,
    pub keep_alive_secs: u16,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.100".to_string(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            client_id: String::new(),
            keep_alive_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub base_topic: String,
    pub device_name: String,
    pub firmware_name: String,
    pub firmware_version: String,
    /// Extra node names announced alongside the built-in device node.
    #[serde(default)]
    pub extra_nodes: Vec<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            base_topic: "homie".to_string(),
            device_name: "Homie Device".to_string(),
            firmware_name: "homie-agent".to_string(),
            firmware_version: env!("CARGO_PKG_VERSION").to_string(),
            extra_nodes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OtaConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Firmware image source, fetched when the run command arrives.
    #[serde(default)]
    pub url: String,
    /// Optional TLS trust anchor handed to the firmware source.
    #[serde(default)]
    pub cert_pem: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub mqtt: MqttConfig,
    pub device: DeviceConfig,
    #[serde(default)]
    pub ota: OtaConfig,
    #[serde(default = "default_true")]
    pub reboot_enabled: bool,
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_stats_interval() -> u64 {
    30
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConfig::default(),
            device: DeviceConfig::default(),
            ota: OtaConfig::default(),
            reboot_enabled: true,
            stats_interval_secs: 30,
        }
    }
}

impl AgentConfig {
    /// Startup gate: missing required fields abort before any network
    /// activity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.host.trim().is_empty() {
            return Err(ConfigError::MissingField("mqtt.host"));
        }
        if self.mqtt.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "mqtt.port",
                reason: "must be between 1 and 65535".to_string(),
            });
        }
        if self.device.base_topic.trim().is_empty() {
            return Err(ConfigError::MissingField("device.base_topic"));
        }
        if self.device.firmware_name.trim().is_empty() {
            return Err(ConfigError::MissingField("device.firmware_name"));
        }
        if self.device.firmware_version.trim().is_empty() {
            return Err(ConfigError::MissingField("device.firmware_version"));
        }
        if self.ota.enabled && self.ota.url.trim().is_empty() {
            return Err(ConfigError::MissingField("ota.url"));
        }
        if self.stats_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "stats_interval_secs",
                reason: "must be at least 1 second".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(AgentConfig::default().validate(), Ok(()));
    }

    #[test]
    fn missing_base_topic_is_fatal() {
        let mut config = AgentConfig::default();
        config.device.base_topic = "  ".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::MissingField("device.base_topic"))
        );
    }

    #[test]
    fn ota_enabled_requires_url() {
        let mut config = AgentConfig::default();
        config.ota.enabled = true;
        assert_eq!(config.validate(), Err(ConfigError::MissingField("ota.url")));

        config.ota.url = "https://firmware.example/agent.bin".to_string();
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn deserializes_with_defaults_for_optional_sections() {
        let raw = r#"{
            "mqtt": { "host": "broker.local", "port": 1883,
                      "username": "", "password": "",
                      "client_id": "", "keep_alive_secs": 15 },
            "device": { "base_topic": "homie", "device_name": "Test",
                        "firmware_name": "fw", "firmware_version": "1.0.0" }
        }"#;
        let config: AgentConfig = serde_json::from_str(raw).unwrap();
        assert!(!config.ota.enabled);
        assert!(config.reboot_enabled);
        assert_eq!(config.stats_interval_secs, 30);
    }
}
