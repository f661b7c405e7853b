pub mod advertise;
pub mod hash;

use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use crate::accessory::Accessory;
use crate::codec::CharValue;
use crate::error::BridgeError;
use self::hash::{compute_hash, AccessoryLayout};

/// What the registry needs from the accessory-protocol stack.
pub trait AccessoryServer: Send {
    /// Publish an accessory (its aid must be set)
    fn add_accessory(&mut self, accessory: &Accessory);

    /// Withdraw an accessory by aid
    fn remove_accessory(&mut self, aid: u64);

    /// The accessory/service topology changed. Not for plain value changes.
    fn configuration_changed(&mut self);

    /// A characteristic value changed
    fn notify(&mut self, aid: u64, iid: u64, value: &CharValue);

    /// Identity and pairing data, opaque to the registry
    fn persisted_state(&self) -> Result<Box<RawValue>, BridgeError>;

    fn restore_state(&mut self, state: &RawValue) -> Result<(), BridgeError>;

    fn shutdown(&mut self) {}
}

/// Persistent identity of the bridge as seen by controllers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HapIdentity {
    pub device_id: String,
    #[serde(default = "default_config_number")]
    pub config_number: u16,
    #[serde(default)]
    pub accessories_hash: Option<String>,
    /// Controller pairings keyed by pairing id
    #[serde(default)]
    pub paired_clients: BTreeMap<String, String>,
}

fn default_config_number() -> u16 {
    1
}

impl HapIdentity {
    /// Fresh identity with a random device id ("AA:BB:CC:DD:EE:FF")
    pub fn generate() -> Self {
        let bytes: [u8; 6] = rand::random();
        let device_id = bytes
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":");
        Self {
            device_id,
            config_number: default_config_number(),
            accessories_hash: None,
            paired_clients: BTreeMap::new(),
        }
    }

    pub fn is_paired(&self) -> bool {
        !self.paired_clients.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct AccessoryDatabase {
    identity: HapIdentity,
    layouts: BTreeMap<u64, AccessoryLayout>,
}

impl AccessoryDatabase {
    pub fn new(identity: HapIdentity) -> Self {
        Self {
            identity,
            layouts: BTreeMap::new(),
        }
    }

    pub fn identity(&self) -> &HapIdentity {
        &self.identity
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    pub fn add(&mut self, accessory: &Accessory) {
        match accessory.aid {
            Some(aid) => {
                self.layouts.insert(aid, AccessoryLayout::of(aid, accessory));
            }
            None => tracing::warn!(
                "Ignoring accessory {} without an aid",
                accessory.accessory_id
            ),
        }
    }

    pub fn remove(&mut self, aid: u64) -> bool {
        self.layouts.remove(&aid).is_some()
    }

    /// Recompute the database hash and bump the configuration number if it
    /// moved. The first hash after a fresh identity is recorded as-is.
    /// Returns true when the number changed.
    pub fn refresh_config_number(&mut self) -> bool {
        let layouts: Vec<AccessoryLayout> = self.layouts.values().cloned().collect();
        let hash = compute_hash(&layouts);

        let bumped = match &self.identity.accessories_hash {
            Some(previous) if *previous == hash => false,
            Some(_) => {
                self.identity.config_number = match self.identity.config_number {
                    u16::MAX => 1,
                    n => n + 1,
                };
                true
            }
            None => false,
        };
        self.identity.accessories_hash = Some(hash);
        bumped
    }

    pub fn save(&self) -> Result<Box<RawValue>, BridgeError> {
        let json = serde_json::to_string(&self.identity)?;
        Ok(RawValue::from_string(json)?)
    }

    pub fn restore(&mut self, state: &RawValue) -> Result<(), BridgeError> {
        self.identity = serde_json::from_str(state.get())?;
        Ok(())
    }
}
