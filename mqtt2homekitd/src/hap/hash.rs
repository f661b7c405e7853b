use serde::Serialize;
use sha2::{Sha256, Digest};
use crate::accessory::Accessory;

/// The parts of an accessory a controller caches: ids, types and names.
/// Values and liveness are left out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessoryLayout {
    pub aid: u64,
    pub services: Vec<ServiceLayout>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceLayout {
    pub iid: u64,
    pub service_type: String,
    pub characteristics: Vec<(u64, String)>,
}

impl AccessoryLayout {
    pub fn of(aid: u64, accessory: &Accessory) -> Self {
        let services = accessory
            .services
            .iter()
            .map(|s| ServiceLayout {
                iid: s.iid,
                service_type: s.service_type.clone(),
                characteristics: s
                    .characteristics
                    .iter()
                    .map(|c| (c.iid, c.name.clone()))
                    .collect(),
            })
            .collect();
        Self { aid, services }
    }
}

/// SHA-256 over the accessory database, sorted by aid so that insertion
/// order does not matter.
pub fn compute_hash(layouts: &[AccessoryLayout]) -> String {
    let mut sorted: Vec<&AccessoryLayout> = layouts.iter().collect();
    sorted.sort_by_key(|layout| layout.aid);

    let json = serde_json::to_string(&sorted)
        .expect("Failed to serialize accessory layouts for hashing");

    let hash = Sha256::digest(json.as_bytes());
    hex::encode(hash)
}
