use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use chrono::{DateTime, Duration, Utc};
use shared::protocol::BRIDGE_AID;
use crate::accessory::{Accessory, Information};
use crate::catalog::{is_control_only, Catalog};
use crate::codec::{self, CharValue};
use crate::config::LivenessConfig;
use crate::error::BridgeError;
use crate::hap::AccessoryServer;
use crate::router::{Route, TopicRouter};
use crate::store::file::StateFile;
use crate::store::snapshot::{self, Snapshot};

/// Outbound side of the bus
pub trait Publisher: Send {
    /// Queue a retained publish without waiting for the broker
    fn publish(&self, topic: &str, payload: String) -> Result<(), BridgeError>;
}

/// Handle to one characteristic, used by the outbound path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicRef {
    pub accessory_id: String,
    pub service_type: String,
    pub index: usize,
    pub characteristic: String,
}

#[derive(Debug, Clone)]
pub struct LivenessPolicy {
    pub unresponsive_after: Duration,
    pub remove_after: Duration,
    pub must_report: HashSet<String>,
}

impl LivenessPolicy {
    pub fn from_config(config: &LivenessConfig) -> Self {
        Self {
            unresponsive_after: config.unresponsive_after().unwrap_or_else(Duration::max_value),
            remove_after: config.remove_after().unwrap_or_else(Duration::max_value),
            must_report: config.must_report.iter().cloned().collect(),
        }
    }
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self::from_config(&LivenessConfig::default())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub flagged: usize,
    pub removed: usize,
}

/// Everything the registry talks to, kept apart from the accessory map so a
/// borrowed accessory and the collaborators can be used together.
struct BridgeContext {
    router: TopicRouter,
    catalog: Catalog,
    info: Information,
    liveness: LivenessPolicy,
    server: Box<dyn AccessoryServer>,
    publisher: Box<dyn Publisher>,
    store: Option<StateFile>,
    next_aid: u64,
    /// Topology changed since the last save
    dirty: bool,
    /// Some last_seen moved since the last save
    seen: bool,
    /// Our own retained publishes, by topic, until the broker echoes them back
    echoes: HashMap<String, String>,
}

impl BridgeContext {
    fn allocate_aid(&mut self) -> u64 {
        let aid = self.next_aid;
        self.next_aid += 1;
        aid
    }

    fn forget_echoes(&mut self, accessory_id: &str) {
        let router = &self.router;
        self.echoes.retain(|topic, _| match router.parse(topic) {
            Ok(Route::Characteristic(topic)) => topic.accessory_id != accessory_id,
            _ => true,
        });
    }

    fn topology_changed(&mut self) {
        self.server.configuration_changed();
        self.dirty = true;
    }

    fn get_or_create<'a>(
        &mut self,
        accessories: &'a mut BTreeMap<String, Accessory>,
        accessory_id: &str,
        service_type: &str,
        index: usize,
    ) -> Result<&'a mut Accessory, BridgeError> {
        self.catalog.service(service_type)?;

        match accessories.entry(accessory_id.to_string()) {
            Entry::Vacant(slot) => {
                let mut accessory =
                    Accessory::new(accessory_id, &self.catalog, &self.info, service_type, index + 1)?;
                let aid = self.allocate_aid();
                accessory.aid = Some(aid);
                self.server.add_accessory(&accessory);
                tracing::info!(
                    "Created accessory {} (aid {}) with {} x {}",
                    accessory_id,
                    aid,
                    index + 1,
                    service_type
                );
                self.topology_changed();
                Ok(slot.insert(accessory))
            }
            Entry::Occupied(slot) => {
                let accessory = slot.into_mut();
                if accessory.service_count(service_type) <= index {
                    let added = self.readd(accessory, |acc, catalog| {
                        acc.ensure_services(catalog, service_type, index + 1)
                    })?;
                    tracing::info!("Added {} x {} to accessory {}", added, service_type, accessory_id);
                }
                Ok(accessory)
            }
        }
    }

    /// Withdraw the accessory from the server, mutate it, and add it back
    /// under the same aid. The server cannot grow a published accessory in place.
    fn readd<T>(
        &mut self,
        accessory: &mut Accessory,
        mutate: impl FnOnce(&mut Accessory, &Catalog) -> Result<T, BridgeError>,
    ) -> Result<T, BridgeError> {
        let aid = accessory.aid.take();
        if let Some(aid) = aid {
            self.server.remove_accessory(aid);
        }

        let result = mutate(accessory, &self.catalog);

        accessory.aid = aid;
        self.server.add_accessory(accessory);
        if result.is_ok() {
            self.topology_changed();
        }
        result
    }
}

/// The accessory registry. One thread owns it, which serializes every
/// mutation and the publish that follows it.
pub struct Bridge {
    accessories: BTreeMap<String, Accessory>,
    ctx: BridgeContext,
}

impl Bridge {
    pub fn new(
        router: TopicRouter,
        catalog: Catalog,
        server: Box<dyn AccessoryServer>,
        publisher: Box<dyn Publisher>,
    ) -> Self {
        Self {
            accessories: BTreeMap::new(),
            ctx: BridgeContext {
                router,
                catalog,
                info: Information::default(),
                liveness: LivenessPolicy::default(),
                server,
                publisher,
                store: None,
                next_aid: BRIDGE_AID + 1,
                dirty: false,
                seen: false,
                echoes: HashMap::new(),
            },
        }
    }

    pub fn with_information(mut self, info: Information) -> Self {
        self.ctx.info = info;
        self
    }

    pub fn with_liveness(mut self, liveness: LivenessPolicy) -> Self {
        self.ctx.liveness = liveness;
        self
    }

    pub fn with_store(mut self, store: StateFile) -> Self {
        self.ctx.store = Some(store);
        self
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.accessories.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.accessories.is_empty()
    }

    pub fn accessory(&self, accessory_id: &str) -> Option<&Accessory> {
        self.accessories.get(accessory_id)
    }

    pub fn accessories(&self) -> impl Iterator<Item = &Accessory> {
        self.accessories.values()
    }

    pub fn accessory_by_aid(&self, aid: u64) -> Option<&Accessory> {
        self.accessories.values().find(|a| a.aid == Some(aid))
    }

    /// Look up an accessory, creating it or growing its services so that
    /// instance `index` of `service_type` exists.
    pub fn get_or_create(
        &mut self,
        accessory_id: &str,
        service_type: &str,
        index: usize,
    ) -> Result<&mut Accessory, BridgeError> {
        self.ctx
            .get_or_create(&mut self.accessories, accessory_id, service_type, index)
    }

    /// Remove an accessory. Returns false if it was not there.
    pub fn remove_accessory(&mut self, accessory_id: &str) -> bool {
        match self.accessories.remove(accessory_id) {
            Some(accessory) => {
                if let Some(aid) = accessory.aid {
                    self.ctx.server.remove_accessory(aid);
                }
                tracing::info!("Removed accessory {}", accessory_id);
                self.ctx.forget_echoes(accessory_id);
                self.ctx.topology_changed();
                true
            }
            None => false,
        }
    }

    /// Apply an inbound bus value
    pub fn set_characteristic(
        &mut self,
        accessory_id: &str,
        service_type: &str,
        index: usize,
        characteristic: &str,
        raw: &[u8],
    ) -> Result<(), BridgeError> {
        let ctx = &mut self.ctx;

        // a bad write must not create or grow anything
        ctx.catalog.service(service_type)?;
        let format = ctx.catalog.characteristic(service_type, characteristic)?.format;
        codec::decode(characteristic, format, raw)?;

        let accessory = ctx.get_or_create(&mut self.accessories, accessory_id, service_type, index)?;

        let present = accessory
            .service(service_type, index)
            .is_some_and(|s| s.characteristic(characteristic).is_some());

        if present {
            let update = accessory.set_characteristic(&ctx.catalog, service_type, index, characteristic, raw)?;
            if let Some(aid) = accessory.aid {
                ctx.server.notify(aid, update.iid, &update.value);
            }
        } else {
            let update = ctx.readd(accessory, |acc, catalog| {
                acc.set_characteristic(catalog, service_type, index, characteristic, raw)
            })?;
            if update.added {
                tracing::info!(
                    "Added optional {} (iid {}) to {}/{} on {}",
                    characteristic,
                    update.iid,
                    service_type,
                    index,
                    accessory_id
                );
            }
        }

        accessory.touch(Utc::now());
        ctx.seen = true;
        Ok(())
    }

    /// Route one bus message
    pub fn handle_message(&mut self, topic: &str, payload: &[u8]) -> Result<(), BridgeError> {
        let raw_topic = topic;
        let topic = match self.ctx.router.parse(topic)? {
            Route::Characteristic(topic) => topic,
            Route::Ignored => {
                tracing::debug!("Ignoring information topic {}", topic);
                return Ok(());
            }
        };

        // our own retained publish, handed back once by the broker
        if let Some(echo) = self.ctx.echoes.remove(raw_topic) {
            if echo.as_bytes() == payload {
                tracing::debug!("Ignoring echo of our publish on {}", raw_topic);
                return Ok(());
            }
        }

        if payload.is_empty() {
            if !self.remove_accessory(&topic.accessory_id) {
                tracing::debug!("Removal of unknown accessory {}", topic.accessory_id);
            }
            return Ok(());
        }

        tracing::debug!(
            "SET {} {} {} {} -> {}",
            topic.accessory_id,
            topic.service_type,
            topic.index,
            topic.characteristic,
            String::from_utf8_lossy(payload)
        );

        self.set_characteristic(
            &topic.accessory_id,
            &topic.service_type,
            topic.index,
            &topic.characteristic,
            payload,
        )
    }

    /// A paired controller wrote a characteristic: store, then publish.
    pub fn controller_write(
        &mut self,
        aid: u64,
        iid: u64,
        value: CharValue,
    ) -> Result<CharacteristicRef, BridgeError> {
        let accessory = self
            .accessories
            .values_mut()
            .find(|a| a.aid == Some(aid))
            .ok_or(BridgeError::UnknownAccessory(aid))?;

        let (service_type, index, characteristic) = accessory
            .locate(iid)
            .ok_or(BridgeError::UnknownInstance { aid, iid })?;
        let format = characteristic.format;
        let reference = CharacteristicRef {
            accessory_id: accessory.accessory_id.clone(),
            service_type: service_type.to_string(),
            index,
            characteristic: characteristic.name.clone(),
        };

        let value = codec::coerce(&reference.characteristic, format, value)?;
        accessory.store(iid, value);

        self.send_mqtt_message(&reference);
        Ok(reference)
    }

    /// Publish the current value of a characteristic to its canonical topic
    pub fn send_mqtt_message(&mut self, reference: &CharacteristicRef) {
        if is_control_only(&reference.service_type, &reference.characteristic) {
            tracing::debug!(
                "Not publishing control-only {}/{}",
                reference.service_type,
                reference.characteristic
            );
            return;
        }

        let Some(accessory) = self.accessories.get(&reference.accessory_id) else {
            tracing::warn!("Cannot publish for unknown accessory {}", reference.accessory_id);
            return;
        };

        let Some(characteristic) = accessory
            .service(&reference.service_type, reference.index)
            .and_then(|s| s.characteristic(&reference.characteristic))
        else {
            tracing::warn!("Cannot publish unknown characteristic {:?}", reference);
            return;
        };

        let Some(payload) = codec::encode(&characteristic.value) else {
            tracing::debug!("Not publishing unknown value for {:?}", reference);
            return;
        };

        let index = (accessory.service_count(&reference.service_type) > 1).then_some(reference.index);
        let topic = self.ctx.router.topic_for(
            &reference.accessory_id,
            &reference.service_type,
            index,
            &reference.characteristic,
        );

        match self.ctx.publisher.publish(&topic, payload.clone()) {
            Ok(()) => {
                tracing::debug!("Published {}", topic);
                self.ctx.echoes.insert(topic, payload);
            }
            Err(e) => tracing::error!(code = e.error_code(), "Failed to publish {}: {}", topic, e),
        }
    }

    /// Flag accessories that should report regularly but have gone quiet
    pub fn flag_unseen(&mut self, now: DateTime<Utc>) -> usize {
        let ctx = &mut self.ctx;
        let mut flagged = 0;

        for accessory in self.accessories.values_mut() {
            if accessory.flagged_unreachable || now - accessory.last_seen <= ctx.liveness.unresponsive_after {
                continue;
            }
            let must_report = accessory
                .bridged_services()
                .any(|s| ctx.liveness.must_report.contains(&s.service_type));
            if !must_report {
                continue;
            }

            let cleared = accessory.mark_unreachable();
            if let Some(aid) = accessory.aid {
                for iid in cleared {
                    ctx.server.notify(aid, iid, &CharValue::Null);
                }
            }
            tracing::warn!(
                "Accessory {} not seen since {}, flagged unreachable",
                accessory.accessory_id,
                accessory.last_seen
            );
            flagged += 1;
        }

        flagged
    }

    /// Drop accessories unseen for longer than the retention window
    pub fn remove_missing(&mut self, now: DateTime<Utc>) -> usize {
        let remove_after = self.ctx.liveness.remove_after;
        let missing: Vec<String> = self
            .accessories
            .values()
            .filter(|a| now - a.last_seen > remove_after)
            .map(|a| a.accessory_id.clone())
            .collect();

        for accessory_id in &missing {
            if let Some(accessory) = self.accessories.remove(accessory_id) {
                if let Some(aid) = accessory.aid {
                    self.ctx.server.remove_accessory(aid);
                }
                tracing::info!(
                    "Removed accessory {}, not seen since {}",
                    accessory_id,
                    accessory.last_seen
                );
                self.ctx.forget_echoes(accessory_id);
            }
        }

        if !missing.is_empty() {
            self.ctx.topology_changed();
        }
        missing.len()
    }

    /// Flag, then remove. Liveness that moved since the last save marks the
    /// state dirty.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> SweepReport {
        let report = SweepReport {
            flagged: self.flag_unseen(now),
            removed: self.remove_missing(now),
        };
        if self.ctx.seen {
            self.ctx.dirty = true;
        }
        report
    }

    pub fn snapshot(&self) -> Result<Snapshot, BridgeError> {
        Ok(Snapshot {
            hap: self.ctx.server.persisted_state()?,
            next_aid: Some(self.ctx.next_aid),
            accessories: self.accessories.values().map(Accessory::to_record).collect(),
        })
    }

    /// Rebuild accessories from a snapshot. Records that would break aid or id
    /// uniqueness, or that the catalog cannot describe, are skipped.
    pub fn restore(&mut self, snapshot: Snapshot) -> Result<usize, BridgeError> {
        self.ctx.server.restore_state(&snapshot.hap)?;

        let mut restored = 0;
        for record in &snapshot.accessories {
            if record.aid <= BRIDGE_AID {
                tracing::error!("Skipping {}: reserved aid {}", record.accessory_id, record.aid);
                continue;
            }
            if self.accessories.contains_key(&record.accessory_id) {
                tracing::error!("Skipping duplicate accessory {}", record.accessory_id);
                continue;
            }
            if self.accessory_by_aid(record.aid).is_some() {
                tracing::error!("Skipping {}: aid {} already in use", record.accessory_id, record.aid);
                continue;
            }

            match Accessory::from_record(record, &self.ctx.catalog, &self.ctx.info) {
                Ok(accessory) => {
                    self.ctx.server.add_accessory(&accessory);
                    self.ctx.next_aid = self.ctx.next_aid.max(record.aid + 1);
                    self.accessories.insert(record.accessory_id.clone(), accessory);
                    restored += 1;
                }
                Err(e) => {
                    tracing::error!(code = e.error_code(), "Skipping {}: {}", record.accessory_id, e);
                }
            }
        }

        if let Some(next_aid) = snapshot.next_aid {
            self.ctx.next_aid = self.ctx.next_aid.max(next_aid);
        }
        Ok(restored)
    }

    /// Restore from the state file, if there is one
    pub fn load(&mut self) -> Result<usize, BridgeError> {
        let Some(store) = &self.ctx.store else {
            return Ok(0);
        };
        match store.load()? {
            Some(bytes) => {
                let restored = self.restore(snapshot::decode(&bytes)?)?;
                tracing::info!("Restored {} accessories", restored);
                Ok(restored)
            }
            None => {
                tracing::info!("No state file at {}, starting empty", store.path().display());
                Ok(0)
            }
        }
    }

    pub fn persist(&mut self) -> Result<(), BridgeError> {
        if let Some(store) = &self.ctx.store {
            let bytes = snapshot::encode(&self.snapshot()?)?;
            store.save(&bytes)?;
            tracing::debug!("Saved {} accessories to {}", self.accessories.len(), store.path().display());
        }
        self.ctx.dirty = false;
        self.ctx.seen = false;
        Ok(())
    }

    /// Persist if anything marked the state dirty since the last successful write
    pub fn flush(&mut self) {
        if !self.ctx.dirty {
            return;
        }
        if let Err(e) = self.persist() {
            tracing::error!(
                code = e.error_code(),
                "CRITICAL: failed to save bridge state, running from memory: {}",
                e
            );
        }
    }

    /// Announce the restored topology once at startup
    pub fn start(&mut self) {
        self.ctx.server.configuration_changed();
    }

    pub fn shutdown(&mut self) {
        if let Err(e) = self.persist() {
            tracing::error!(code = e.error_code(), "Failed to save bridge state on shutdown: {}", e);
        }
        self.ctx.server.shutdown();
    }
}
