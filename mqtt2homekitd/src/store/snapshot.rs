use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use shared::types::AccessoryRecord;
use crate::error::BridgeError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Written back exactly as the accessory server produced it
    pub hap: Box<RawValue>,
    /// Next aid to hand out, so removed aids stay retired across restarts
    #[serde(default)]
    pub next_aid: Option<u64>,
    #[serde(default)]
    pub accessories: Vec<AccessoryRecord>,
}

pub fn encode(snapshot: &Snapshot) -> Result<Vec<u8>, BridgeError> {
    Ok(serde_json::to_vec_pretty(snapshot)?)
}

pub fn decode(bytes: &[u8]) -> Result<Snapshot, BridgeError> {
    Ok(serde_json::from_slice(bytes)?)
}
