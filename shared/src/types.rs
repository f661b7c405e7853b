use std::collections::BTreeMap;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// A bridged accessory as written to the state file.
/// Restoring a record must reproduce the same aid, service order and
/// characteristic set so that paired controllers keep recognizing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessoryRecord {
    /// Externally assigned id, the second topic segment
    pub accessory_id: String,

    /// Display name, e.g. "Temperature Sensor"
    pub name: String,

    /// Service types in order, run-length encoded.
    /// AccessoryInformation is implied and never listed.
    #[serde(default)]
    pub services: Vec<ServiceCount>,

    /// HAP accessory id
    pub aid: u64,

    /// Last inbound write from the device
    #[serde(default = "Utc::now")]
    pub last_seen: DateTime<Utc>,

    /// Characteristics added after creation, keyed by service name
    /// ("Lightbulb" for instance 0, "Lightbulb/2" for instance 2)
    #[serde(default)]
    pub optional_characteristics: BTreeMap<String, Vec<String>>,
}

/// A run of consecutive service instances of one type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCount {
    pub service_type: String,
    #[serde(default = "default_count")]
    pub count: usize,
}

fn default_count() -> usize {
    1
}
