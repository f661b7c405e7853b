use thiserror::Error;

use crate::catalog::Format;

#[derive(Error, Debug)]
pub enum BridgeError {
    /// Topic does not match `<prefix>/<id>/<service>[/<index>]/<characteristic>`
    #[error("Malformed topic: {0}")]
    MalformedTopic(String),

    /// Service type missing from the catalog
    #[error("Unknown service type: {0}")]
    UnknownServiceType(String),

    /// Characteristic missing from the catalog
    #[error("Unknown characteristic {characteristic} on {service_type}")]
    UnknownCharacteristic {
        service_type: String,
        characteristic: String,
    },

    /// Payload cannot be coerced to the declared format
    #[error("Invalid value {value:?} for {characteristic} ({format})")]
    InvalidCharacteristicValue {
        characteristic: String,
        format: Format,
        value: String,
    },

    /// No live accessory carries this aid
    #[error("Unknown accessory aid: {0}")]
    UnknownAccessory(u64),

    /// No service or characteristic with this iid on the accessory
    #[error("Unknown instance {iid} on accessory {aid}")]
    UnknownInstance { aid: u64, iid: u64 },

    /// Bus unreachable or client queue full at publish time
    #[error("Publish failed: {0}")]
    Publish(String),

    /// Snapshot could not be written or read
    #[error("Persistence failed: {0}")]
    Persistence(String),

    /// The bridge thread has exited
    #[error("Bridge stopped")]
    Stopped,

    #[error("Snapshot encoding error: {0}")]
    Snapshot(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Short code for log lines
    pub fn error_code(&self) -> &'static str {
        match self {
            BridgeError::MalformedTopic(_) => "MALFORMED_TOPIC",
            BridgeError::UnknownServiceType(_) => "UNKNOWN_SERVICE_TYPE",
            BridgeError::UnknownCharacteristic { .. } => "UNKNOWN_CHARACTERISTIC",
            BridgeError::InvalidCharacteristicValue { .. } => "INVALID_CHARACTERISTIC_VALUE",
            BridgeError::UnknownAccessory(_) => "UNKNOWN_ACCESSORY",
            BridgeError::UnknownInstance { .. } => "UNKNOWN_INSTANCE",
            BridgeError::Publish(_) => "PUBLISH_FAILURE",
            BridgeError::Persistence(_) => "PERSISTENCE_FAILURE",
            BridgeError::Stopped => "BRIDGE_STOPPED",
            BridgeError::Snapshot(_) => "SNAPSHOT_ENCODING",
            BridgeError::Io(_) => "IO_ERROR",
        }
    }

    /// True for errors caused by a single bad inbound message
    pub fn is_message_error(&self) -> bool {
        matches!(
            self,
            BridgeError::MalformedTopic(_)
                | BridgeError::UnknownServiceType(_)
                | BridgeError::UnknownCharacteristic { .. }
                | BridgeError::InvalidCharacteristicValue { .. }
        )
    }
}
