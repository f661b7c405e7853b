use std::path::{Path, PathBuf};
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::DEFAULT_TOPIC_PREFIX;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// mDNS instance name and model
    #[serde(default = "default_bridge_name")]
    pub name: String,
    #[serde(default = "default_manufacturer")]
    pub manufacturer: String,
    #[serde(default = "default_hap_port")]
    pub port: u16,
    /// Restrict mDNS to one interface
    #[serde(default)]
    pub interface: Option<String>,
    /// Advertised address; all interface addresses when unset
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    /// JSON files merged into the built-in service catalog
    #[serde(default)]
    pub catalog_extensions: Vec<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LivenessConfig {
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_unresponsive_after")]
    pub unresponsive_after_secs: u64,
    #[serde(default = "default_remove_after")]
    pub remove_after_secs: u64,
    /// Service types expected to report regularly; only these get flagged
    #[serde(default = "default_must_report")]
    pub must_report: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_bridge_name() -> String {
    "MQTT Bridge".to_string()
}

fn default_manufacturer() -> String {
    "mqtt2homekit".to_string()
}

fn default_hap_port() -> u16 {
    51826
}

fn default_state_path() -> PathBuf {
    PathBuf::from("/var/lib/mqtt2homekit/bridge.state")
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "mqtt2homekit".to_string()
}

fn default_keep_alive() -> u64 {
    60
}

fn default_topic_prefix() -> String {
    DEFAULT_TOPIC_PREFIX.to_string()
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_unresponsive_after() -> u64 {
    3600
}

fn default_remove_after() -> u64 {
    28 * 24 * 3600
}

fn default_must_report() -> Vec<String> {
    [
        "AirQualitySensor",
        "CarbonDioxideSensor",
        "CarbonMonoxideSensor",
        "ContactSensor",
        "HumiditySensor",
        "LeakSensor",
        "LightSensor",
        "MotionSensor",
        "OccupancySensor",
        "SmokeSensor",
        "TemperatureSensor",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_listen() -> String {
    "127.0.0.1:8054".to_string()
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name: default_bridge_name(),
            manufacturer: default_manufacturer(),
            port: default_hap_port(),
            interface: None,
            address: None,
            state_path: default_state_path(),
            catalog_extensions: Vec::new(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            client_id: default_client_id(),
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive(),
            topic_prefix: default_topic_prefix(),
        }
    }
}

impl LivenessConfig {
    pub fn unresponsive_after(&self) -> Option<chrono::Duration> {
        threshold(self.unresponsive_after_secs)
    }

    pub fn remove_after(&self) -> Option<chrono::Duration> {
        threshold(self.remove_after_secs)
    }
}

/// None when the seconds do not fit a signed duration
fn threshold(secs: u64) -> Option<chrono::Duration> {
    i64::try_from(secs).ok().and_then(chrono::Duration::try_seconds)
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            unresponsive_after_secs: default_unresponsive_after(),
            remove_after_secs: default_remove_after(),
            must_report: default_must_report(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config = Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let prefix = &self.mqtt.topic_prefix;
        if prefix.is_empty() || prefix.contains(['/', '+', '#']) {
            anyhow::bail!(
                "mqtt.topic_prefix must be a single topic segment without wildcards, got {:?}",
                prefix
            );
        }
        if self.liveness.sweep_interval_secs == 0 {
            anyhow::bail!("liveness.sweep_interval_secs must be positive");
        }
        if self.liveness.unresponsive_after().is_none() {
            anyhow::bail!(
                "liveness.unresponsive_after_secs is out of range: {}",
                self.liveness.unresponsive_after_secs
            );
        }
        if self.liveness.remove_after().is_none() {
            anyhow::bail!("liveness.remove_after_secs is out of range: {}", self.liveness.remove_after_secs);
        }
        if self.liveness.remove_after_secs < self.liveness.unresponsive_after_secs {
            anyhow::bail!("liveness.remove_after_secs must not be shorter than unresponsive_after_secs");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_file() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.mqtt.topic_prefix, "HomeKit");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.liveness.unresponsive_after_secs, 3600);
        assert_eq!(config.liveness.remove_after_secs, 2_419_200);
        assert!(config.liveness.must_report.contains(&"TemperatureSensor".to_string()));
        assert!(!config.liveness.must_report.contains(&"Lightbulb".to_string()));
        assert_eq!(config.bridge.port, 51826);
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::parse(
            r#"
            [bridge]
            name = "Garage Bridge"
            state_path = "/tmp/garage.state"

            [mqtt]
            host = "broker.lan"
            username = "bridge"
            password = "secret"

            [liveness]
            must_report = ["TemperatureSensor"]
            "#,
        )
        .unwrap();
        assert_eq!(config.bridge.name, "Garage Bridge");
        assert_eq!(config.bridge.manufacturer, "mqtt2homekit");
        assert_eq!(config.mqtt.host, "broker.lan");
        assert_eq!(config.mqtt.username.as_deref(), Some("bridge"));
        assert_eq!(config.liveness.must_report, vec!["TemperatureSensor".to_string()]);
        assert_eq!(config.liveness.sweep_interval_secs, 60);
    }

    #[test]
    fn test_rejects_bad_prefix() {
        for prefix in ["", "Home/Kit", "HomeKit/#", "+"] {
            let toml = format!("[mqtt]\ntopic_prefix = {:?}\n", prefix);
            assert!(Config::parse(&toml).is_err(), "{:?} should be rejected", prefix);
        }
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let toml = "[liveness]\nunresponsive_after_secs = 100\nremove_after_secs = 10\n";
        assert!(Config::parse(toml).is_err());
    }

    #[test]
    fn test_rejects_thresholds_beyond_duration_range() {
        // fits a TOML integer but not a chrono duration
        let toml = "[liveness]\nunresponsive_after_secs = 9000000000000000000\nremove_after_secs = 9000000000000000000\n";
        let err = Config::parse(toml).unwrap_err();
        assert!(err.to_string().contains("out of range"), "{}", err);

        let config = LivenessConfig {
            remove_after_secs: u64::MAX,
            ..LivenessConfig::default()
        };
        assert!(config.remove_after().is_none());
        assert_eq!(config.unresponsive_after(), Some(chrono::Duration::hours(1)));
    }
}
