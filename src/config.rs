use std::env;
use std::fmt;

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub appliance: ApplianceConfig,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
    pub client_id: String,
}

#[derive(Clone)]
pub struct ApplianceConfig {
    pub listen_host: String,
    pub listen_port: u16,
    /// Echoed as `vId` in every command frame.
    pub device_id: String,
    /// Echoed as `vPin` in every command frame.
    pub device_pin: String,
    pub name: String,
    /// Sanitized name for use in MQTT topics (lowercase, spaces to underscores)
    pub topic_name: String,
}

// Credentials stay out of logs.
impl fmt::Debug for ApplianceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplianceConfig")
            .field("listen_host", &self.listen_host)
            .field("listen_port", &self.listen_port)
            .field("device_id", &"***")
            .field("device_pin", &"***")
            .field("name", &self.name)
            .field("topic_name", &self.topic_name)
            .finish()
    }
}

fn env_required(key: &str) -> Result<String, String> {
    env::var(key).map_err(|_| format!("{key} environment variable is required"))
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let name = env_or_default("LOKALTERM_DEVICE_NAME", "LokalTerm".to_string());
        let topic_name = sanitize_topic_name(&name);

        let config = Self {
            mqtt: MqttConfig {
                broker_host: env_required("MQTT_BROKER_HOST")?,
                broker_port: env_or_default("MQTT_BROKER_PORT", 1883),
                username: env_optional("MQTT_USERNAME"),
                password: env_optional("MQTT_PASSWORD"),
                topic_prefix: env_or_default("MQTT_TOPIC_PREFIX", "lokalterm".to_string()),
                client_id: env_or_default("MQTT_CLIENT_ID", "lokalterm-to-mqtt".to_string()),
            },
            appliance: ApplianceConfig {
                listen_host: env_or_default("LOKALTERM_LISTEN_HOST", "0.0.0.0".to_string()),
                listen_port: env_or_default("LOKALTERM_LISTEN_PORT", 8899),
                device_id: env_required("LOKALTERM_DEVICE_ID")?,
                device_pin: env_required("LOKALTERM_DEVICE_PIN")?,
                name,
                topic_name,
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.mqtt.broker_host.is_empty() {
            return Err("MQTT_BROKER_HOST must not be empty".into());
        }
        if self.appliance.device_id.is_empty() {
            return Err("LOKALTERM_DEVICE_ID must not be empty".into());
        }
        if self.appliance.device_pin.is_empty() {
            return Err("LOKALTERM_DEVICE_PIN must not be empty".into());
        }
        if self.appliance.listen_port == 0 {
            return Err("LOKALTERM_LISTEN_PORT must be > 0".into());
        }
        if self.appliance.topic_name.is_empty() {
            return Err("LOKALTERM_DEVICE_NAME must contain at least one letter or digit".into());
        }
        Ok(())
    }

    pub fn bridge_status_topic(&self) -> String {
        format!(
            "{}/{}/bridge_status",
            self.mqtt.topic_prefix, self.appliance.topic_name
        )
    }

    pub fn command_topic_filter(&self) -> String {
        format!("{}/{}/command/#", self.mqtt.topic_prefix, self.appliance.topic_name)
    }

    pub fn snapshot_topic(&self) -> String {
        format!("{}/{}/status", self.mqtt.topic_prefix, self.appliance.topic_name)
    }

    pub fn state_topic(&self, key: &str) -> String {
        format!(
            "{}/{}/state/{}",
            self.mqtt.topic_prefix, self.appliance.topic_name, key
        )
    }
}

/// Convert a device name into a safe MQTT topic segment.
/// "Piec Elterm" → "piec_elterm"
fn sanitize_topic_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_matches('_')
        .to_string()
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        mqtt: MqttConfig {
            broker_host: "localhost".into(),
            broker_port: 1883,
            username: None,
            password: None,
            topic_prefix: "lokalterm".into(),
            client_id: "lokalterm-to-mqtt".into(),
        },
        appliance: ApplianceConfig {
            listen_host: "127.0.0.1".into(),
            listen_port: 0,
            device_id: "SKZP0001".into(),
            device_pin: "4321".into(),
            name: "LokalTerm".into(),
            topic_name: "lokalterm".into(),
        },
    }
}
