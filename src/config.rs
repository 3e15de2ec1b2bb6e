//! JSON5 configuration model for the bridge daemon.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Set of errors that can occur while loading a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Syntax errors and missing required keys, as reported by the
    /// JSON5 deserializer.
    #[error("configuration error: {0}")]
    Parse(#[from] json5::Error),
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub vbus: VbusConfig,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
    #[serde(default)]
    pub transfers: Vec<TransferConfig>,
}

/// Loads and parses a JSON5 configuration file.
pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let raw = fs::read_to_string(path)?;
    Ok(json5::from_str(&raw)?)
}

/// Serial port and specification file settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VbusConfig {
    pub serialport: String,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    pub vsf: PathBuf,
}

fn default_baudrate() -> u32 {
    9600
}

/// MQTT broker settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    pub user: String,
    pub pass: String,
    #[serde(default)]
    pub topic_prefix: String,
    pub last_will: Option<LastWillConfig>,
}

fn default_mqtt_port() -> u16 {
    1883
}

/// Last-will topic and its online/offline payloads. The offline payload
/// is registered as the will; the online payload is published on every
/// successful connect.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LastWillConfig {
    pub topic: String,
    pub online: String,
    pub offline: String,
}

/// One plugin instantiation: `module` selects the constructor from the
/// plugin registry, `config` is handed to it verbatim.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginConfig {
    pub name: String,
    pub module: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// One publish job: target, trigger and content template.
#[derive(Debug, Clone, Deserialize)]
pub struct TransferConfig {
    pub mqtt: TransferMqttConfig,
    pub trigger: TriggerConfig,
    #[serde(flatten)]
    pub content: ContentConfig,
}

/// Publish target of a transfer.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransferMqttConfig {
    pub topic: String,
    #[serde(default)]
    pub retain: bool,
    #[serde(default)]
    pub qos: u8,
}

/// When a transfer transmits.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TriggerConfig {
    /// Transmit when fields arrive: any field, or only when `item` is
    /// among the updated keys.
    Update {
        #[serde(default)]
        item: Option<String>,
    },

    /// Transmit every `interval` seconds.
    Interval {
        interval: f64,
        #[serde(default)]
        max_age: Option<f64>,
    },
}

/// What a transfer publishes.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentConfig {
    /// A single item published as a scalar (or as JSON if it renders to
    /// a mapping).
    Direct { field: ItemConfig },

    /// A JSON object over named items.
    Json { fields: Vec<ItemConfig> },
}

/// A content item, distinguished by which key is present.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ItemConfig {
    Group {
        group: String,
        fields: Vec<ItemConfig>,
    },
    Value {
        name: String,
        item: String,
        #[serde(default)]
        max_age: Option<f64>,
    },
    Meta {
        name: String,
        meta: String,
    },
    Plugin {
        name: String,
        plugin: String,
        function: String,
    },
}
