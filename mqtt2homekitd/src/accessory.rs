use std::collections::BTreeMap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::protocol::INFORMATION_SERVICE;
use shared::types::{AccessoryRecord, ServiceCount};
use crate::catalog::{display_name, Catalog, Category, Format};
use crate::codec::{self, CharValue};
use crate::error::BridgeError;

#[derive(Debug, Clone, Serialize)]
pub struct Characteristic {
    pub iid: u64,
    pub name: String,
    pub format: Format,
    pub value: CharValue,
    /// Added after creation, outside the service's required set
    pub optional: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Service {
    pub iid: u64,
    pub service_type: String,
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    fn from_catalog(catalog: &Catalog, service_type: &str) -> Result<Self, BridgeError> {
        let def = catalog.service(service_type)?;
        let characteristics = def
            .required
            .iter()
            .map(|name| {
                let format = catalog.characteristic(service_type, name)?.format;
                Ok(Characteristic {
                    iid: 0,
                    name: name.clone(),
                    format,
                    value: CharValue::Null,
                    optional: false,
                })
            })
            .collect::<Result<Vec<_>, BridgeError>>()?;

        Ok(Self {
            iid: 0,
            service_type: service_type.to_string(),
            characteristics,
        })
    }

    pub fn characteristic(&self, name: &str) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| c.name == name)
    }

    fn characteristic_mut(&mut self, name: &str) -> Option<&mut Characteristic> {
        self.characteristics.iter_mut().find(|c| c.name == name)
    }

    fn add_optional(&mut self, name: &str, format: Format) {
        self.characteristics.push(Characteristic {
            iid: 0,
            name: name.to_string(),
            format,
            value: CharValue::Null,
            optional: true,
        });
    }
}

/// Fixed fields of the information service
#[derive(Debug, Clone)]
pub struct Information {
    pub manufacturer: String,
    pub firmware_revision: String,
}

impl Default for Information {
    fn default() -> Self {
        Self {
            manufacturer: "mqtt2homekit".to_string(),
            firmware_revision: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Result of a successful inbound write
#[derive(Debug, Clone, PartialEq)]
pub struct CharacteristicUpdate {
    pub iid: u64,
    pub value: CharValue,
    /// The characteristic did not exist before this write
    pub added: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Accessory {
    pub accessory_id: String,
    pub display_name: String,
    pub aid: Option<u64>,
    pub category: Category,
    pub services: Vec<Service>,
    pub last_seen: DateTime<Utc>,
    pub flagged_unreachable: bool,
}

impl Accessory {
    /// A new accessory with `count` instances of `service_type`.
    pub fn new(
        accessory_id: &str,
        catalog: &Catalog,
        info: &Information,
        service_type: &str,
        count: usize,
    ) -> Result<Self, BridgeError> {
        catalog.service(service_type)?;

        let name = display_name(service_type);
        let mut accessory = Self {
            accessory_id: accessory_id.to_string(),
            display_name: name.clone(),
            aid: None,
            category: catalog.category(service_type),
            services: vec![information_service(catalog, accessory_id, &name, service_type, info)?],
            last_seen: Utc::now(),
            flagged_unreachable: false,
        };
        accessory.ensure_services(catalog, service_type, count)?;
        Ok(accessory)
    }

    /// Rebuild from a persisted record. Values start unknown.
    pub fn from_record(
        record: &AccessoryRecord,
        catalog: &Catalog,
        info: &Information,
    ) -> Result<Self, BridgeError> {
        let primary = record
            .services
            .first()
            .map(|s| s.service_type.as_str())
            .unwrap_or(INFORMATION_SERVICE);

        let mut accessory = Self {
            accessory_id: record.accessory_id.clone(),
            display_name: record.name.clone(),
            aid: Some(record.aid),
            category: catalog.category(primary),
            services: vec![information_service(catalog, &record.accessory_id, &record.name, primary, info)?],
            last_seen: record.last_seen,
            flagged_unreachable: false,
        };

        for run in &record.services {
            accessory.append_services(catalog, &run.service_type, run.count)?;
        }

        for (key, names) in &record.optional_characteristics {
            let (service_type, index) = parse_service_key(key);
            for name in names {
                let format = match catalog.characteristic(service_type, name) {
                    Ok(def) => def.format,
                    Err(e) => {
                        tracing::warn!("Dropping optional {} on {}: {}", name, record.accessory_id, e);
                        continue;
                    }
                };
                match accessory.service_mut(service_type, index) {
                    Some(service) if service.characteristic(name).is_none() => {
                        service.add_optional(name, format);
                    }
                    Some(_) => {}
                    None => {
                        tracing::warn!(
                            "Dropping optional {} for missing service {} on {}",
                            name,
                            key,
                            record.accessory_id
                        );
                    }
                }
            }
        }

        accessory.assign_iids();
        Ok(accessory)
    }

    pub fn to_record(&self) -> AccessoryRecord {
        let mut services: Vec<ServiceCount> = Vec::new();
        for service in self.bridged_services() {
            match services.last_mut() {
                Some(run) if run.service_type == service.service_type => run.count += 1,
                _ => services.push(ServiceCount {
                    service_type: service.service_type.clone(),
                    count: 1,
                }),
            }
        }

        AccessoryRecord {
            accessory_id: self.accessory_id.clone(),
            name: self.display_name.clone(),
            services,
            aid: self.aid.unwrap_or_default(),
            last_seen: self.last_seen,
            optional_characteristics: self.optional_characteristics(),
        }
    }

    /// Optional characteristics keyed by service name, index suffixed for N>0
    pub fn optional_characteristics(&self) -> BTreeMap<String, Vec<String>> {
        let mut optional = BTreeMap::new();
        let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
        for service in self.bridged_services() {
            let index = seen.entry(service.service_type.as_str()).or_insert(0);
            let names: Vec<String> = service
                .characteristics
                .iter()
                .filter(|c| c.optional)
                .map(|c| c.name.clone())
                .collect();
            if !names.is_empty() {
                optional.insert(service_key(&service.service_type, *index), names);
            }
            *index += 1;
        }
        optional
    }

    /// Services other than AccessoryInformation
    pub fn bridged_services(&self) -> impl Iterator<Item = &Service> {
        self.services
            .iter()
            .filter(|s| s.service_type != INFORMATION_SERVICE)
    }

    pub fn service_count(&self, service_type: &str) -> usize {
        self.services
            .iter()
            .filter(|s| s.service_type == service_type)
            .count()
    }

    #[cfg(test)]
    pub fn has_service_type(&self, service_type: &str) -> bool {
        self.service_count(service_type) > 0
    }

    pub fn service(&self, service_type: &str, index: usize) -> Option<&Service> {
        self.services
            .iter()
            .filter(|s| s.service_type == service_type)
            .nth(index)
    }

    fn service_mut(&mut self, service_type: &str, index: usize) -> Option<&mut Service> {
        self.services
            .iter_mut()
            .filter(|s| s.service_type == service_type)
            .nth(index)
    }

    /// Append instances of `service_type` until there are at least `count`.
    /// Returns how many were added.
    pub fn ensure_services(
        &mut self,
        catalog: &Catalog,
        service_type: &str,
        count: usize,
    ) -> Result<usize, BridgeError> {
        let missing = count.saturating_sub(self.service_count(service_type));
        self.append_services(catalog, service_type, missing)?;
        Ok(missing)
    }

    /// Append `n` new instances of `service_type`
    pub fn append_services(
        &mut self,
        catalog: &Catalog,
        service_type: &str,
        n: usize,
    ) -> Result<(), BridgeError> {
        let template = Service::from_catalog(catalog, service_type)?;
        if n == 0 {
            return Ok(());
        }
        self.services.extend(std::iter::repeat(template).take(n));
        self.assign_iids();
        Ok(())
    }

    /// Decode and store an inbound value, adding the characteristic as optional
    /// when the service does not carry it yet. Nothing changes on error.
    pub fn set_characteristic(
        &mut self,
        catalog: &Catalog,
        service_type: &str,
        index: usize,
        name: &str,
        raw: &[u8],
    ) -> Result<CharacteristicUpdate, BridgeError> {
        let format = catalog.characteristic(service_type, name)?.format;
        let value = codec::decode(name, format, raw)?;

        let service = self
            .service_mut(service_type, index)
            .ok_or_else(|| BridgeError::UnknownServiceType(format!("{}/{}", service_type, index)))?;

        let added = service.characteristic(name).is_none();
        if added {
            service.add_optional(name, format);
        }
        if let Some(characteristic) = service.characteristic_mut(name) {
            characteristic.value = value.clone();
        }
        if added {
            self.assign_iids();
        }

        let iid = self
            .service(service_type, index)
            .and_then(|s| s.characteristic(name))
            .map(|c| c.iid)
            .unwrap_or_default();

        Ok(CharacteristicUpdate { iid, value, added })
    }

    /// (service type, instance index, characteristic) for an iid
    pub fn locate(&self, iid: u64) -> Option<(&str, usize, &Characteristic)> {
        let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
        for service in &self.services {
            let index = seen.entry(service.service_type.as_str()).or_insert(0);
            if let Some(c) = service.characteristics.iter().find(|c| c.iid == iid) {
                return Some((service.service_type.as_str(), *index, c));
            }
            *index += 1;
        }
        None
    }

    /// Store an already-coerced value by iid
    pub fn store(&mut self, iid: u64, value: CharValue) -> bool {
        for service in &mut self.services {
            if let Some(c) = service.characteristics.iter_mut().find(|c| c.iid == iid) {
                c.value = value;
                return true;
            }
        }
        false
    }

    /// Record an inbound write from the device
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_seen = now;
        self.flagged_unreachable = false;
    }

    /// Clear every non-information value. Returns the cleared iids.
    pub fn mark_unreachable(&mut self) -> Vec<u64> {
        self.flagged_unreachable = true;
        let mut cleared = Vec::new();
        for service in self
            .services
            .iter_mut()
            .filter(|s| s.service_type != INFORMATION_SERVICE)
        {
            for c in &mut service.characteristics {
                if !c.value.is_null() {
                    c.value = CharValue::Null;
                    cleared.push(c.iid);
                }
            }
        }
        cleared
    }

    /// Number services and characteristics 1.. in order
    pub fn assign_iids(&mut self) {
        let mut iid = 1;
        for service in &mut self.services {
            service.iid = iid;
            iid += 1;
            for c in &mut service.characteristics {
                c.iid = iid;
                iid += 1;
            }
        }
    }
}

fn information_service(
    catalog: &Catalog,
    accessory_id: &str,
    name: &str,
    primary: &str,
    info: &Information,
) -> Result<Service, BridgeError> {
    let mut service = Service::from_catalog(catalog, INFORMATION_SERVICE)?;
    let model = format!("MQTT Bridged {}", primary);
    for c in &mut service.characteristics {
        c.value = match c.name.as_str() {
            "Name" => CharValue::String(name.to_string()),
            "Manufacturer" => CharValue::String(info.manufacturer.clone()),
            "Model" => CharValue::String(model.clone()),
            "SerialNumber" => CharValue::String(accessory_id.to_string()),
            "FirmwareRevision" => CharValue::String(info.firmware_revision.clone()),
            _ => CharValue::Null,
        };
    }
    Ok(service)
}

fn service_key(service_type: &str, index: usize) -> String {
    if index == 0 {
        service_type.to_string()
    } else {
        format!("{}/{}", service_type, index)
    }
}

fn parse_service_key(key: &str) -> (&str, usize) {
    match key.split_once('/') {
        Some((service_type, index)) => match index.parse() {
            Ok(index) => (service_type, index),
            Err(_) => (key, 0),
        },
        None => (key, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulb() -> Accessory {
        Accessory::new("bulb-1", &Catalog::builtin(), &Information::default(), "Lightbulb", 1).unwrap()
    }

    #[test]
    fn test_new_accessory_layout() {
        let acc = bulb();
        assert_eq!(acc.display_name, "Lightbulb");
        assert_eq!(acc.category, Category::Lightbulb);
        assert_eq!(acc.services[0].service_type, INFORMATION_SERVICE);
        assert_eq!(acc.service_count("Lightbulb"), 1);

        let info = acc.service(INFORMATION_SERVICE, 0).unwrap();
        assert_eq!(
            info.characteristic("SerialNumber").unwrap().value,
            CharValue::String("bulb-1".to_string())
        );
        assert_eq!(
            info.characteristic("Model").unwrap().value,
            CharValue::String("MQTT Bridged Lightbulb".to_string())
        );

        // information service + 6 characteristics, then Lightbulb service + On
        let on = acc.service("Lightbulb", 0).unwrap().characteristic("On").unwrap();
        assert_eq!(acc.services[1].iid, 8);
        assert_eq!(on.iid, 9);
        assert!(on.value.is_null());
    }

    #[test]
    fn test_new_with_count() {
        let acc = Accessory::new(
            "garage",
            &Catalog::builtin(),
            &Information::default(),
            "GarageDoorOpener",
            3,
        )
        .unwrap();
        assert_eq!(acc.service_count("GarageDoorOpener"), 3);
        assert!(acc.service("GarageDoorOpener", 2).is_some());
        assert!(acc.service("GarageDoorOpener", 3).is_none());
    }

    #[test]
    fn test_unknown_service_type() {
        let err = Accessory::new("x", &Catalog::builtin(), &Information::default(), "Toaster", 1)
            .unwrap_err();
        assert!(matches!(err, BridgeError::UnknownServiceType(_)));
    }

    #[test]
    fn test_set_required_characteristic() {
        let catalog = Catalog::builtin();
        let mut acc = bulb();
        let update = acc.set_characteristic(&catalog, "Lightbulb", 0, "On", b"1").unwrap();
        assert!(!update.added);
        assert_eq!(update.iid, 9);
        assert_eq!(update.value, CharValue::Bool(true));
        assert!(acc.optional_characteristics().is_empty());
    }

    #[test]
    fn test_set_optional_characteristic() {
        let catalog = Catalog::builtin();
        let mut acc = bulb();
        let update = acc
            .set_characteristic(&catalog, "Lightbulb", 0, "Brightness", b"75")
            .unwrap();
        assert!(update.added);
        assert_eq!(update.value, CharValue::Int(75));

        let brightness = acc.service("Lightbulb", 0).unwrap().characteristic("Brightness").unwrap();
        assert!(brightness.optional);
        assert_eq!(brightness.iid, update.iid);
        assert_eq!(
            acc.optional_characteristics().get("Lightbulb"),
            Some(&vec!["Brightness".to_string()])
        );
    }

    #[test]
    fn test_invalid_value_leaves_state() {
        let catalog = Catalog::builtin();
        let mut acc = bulb();
        acc.set_characteristic(&catalog, "Lightbulb", 0, "Brightness", b"40").unwrap();
        let err = acc
            .set_characteristic(&catalog, "Lightbulb", 0, "Brightness", b"dim")
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidCharacteristicValue { .. }));
        let brightness = acc.service("Lightbulb", 0).unwrap().characteristic("Brightness").unwrap();
        assert_eq!(brightness.value, CharValue::Int(40));

        let err = acc.set_characteristic(&catalog, "Lightbulb", 0, "Hue", b"dim").unwrap_err();
        assert!(matches!(err, BridgeError::InvalidCharacteristicValue { .. }));
        assert!(acc.service("Lightbulb", 0).unwrap().characteristic("Hue").is_none());
    }

    #[test]
    fn test_mark_unreachable_keeps_information() {
        let catalog = Catalog::builtin();
        let mut acc = bulb();
        acc.set_characteristic(&catalog, "Lightbulb", 0, "On", b"1").unwrap();
        let cleared = acc.mark_unreachable();
        assert_eq!(cleared, vec![9]);
        assert!(acc.flagged_unreachable);
        let info = acc.service(INFORMATION_SERVICE, 0).unwrap();
        assert!(!info.characteristic("Name").unwrap().value.is_null());

        acc.touch(Utc::now());
        assert!(!acc.flagged_unreachable);
    }

    #[test]
    fn test_locate_and_store() {
        let catalog = Catalog::builtin();
        let mut acc = Accessory::new("sw", &catalog, &Information::default(), "Switch", 2).unwrap();
        let iid = acc.service("Switch", 1).unwrap().characteristic("On").unwrap().iid;

        let (service_type, index, c) = acc.locate(iid).unwrap();
        assert_eq!((service_type, index, c.name.as_str()), ("Switch", 1, "On"));

        assert!(acc.store(iid, CharValue::Bool(true)));
        assert!(!acc.store(999, CharValue::Bool(true)));
        assert!(acc.locate(999).is_none());
    }

    #[test]
    fn test_record_round_trip_preserves_order_and_iids() {
        let catalog = Catalog::builtin();
        let info = Information::default();
        let mut acc = Accessory::new("multi", &catalog, &info, "Lightbulb", 1).unwrap();
        acc.ensure_services(&catalog, "TemperatureSensor", 1).unwrap();
        acc.append_services(&catalog, "Lightbulb", 1).unwrap();
        acc.set_characteristic(&catalog, "Lightbulb", 1, "Brightness", b"10").unwrap();
        acc.aid = Some(7);

        let record = acc.to_record();
        assert_eq!(record.services.len(), 3);
        assert_eq!(
            record.optional_characteristics.get("Lightbulb/1"),
            Some(&vec!["Brightness".to_string()])
        );

        let restored = Accessory::from_record(&record, &catalog, &info).unwrap();
        assert_eq!(restored.aid, Some(7));
        assert_eq!(restored.last_seen, acc.last_seen);
        let original: Vec<(u64, String)> = acc
            .services
            .iter()
            .flat_map(|s| s.characteristics.iter().map(|c| (c.iid, c.name.clone())))
            .collect();
        let reloaded: Vec<(u64, String)> = restored
            .services
            .iter()
            .flat_map(|s| s.characteristics.iter().map(|c| (c.iid, c.name.clone())))
            .collect();
        assert_eq!(original, reloaded);
    }

    #[test]
    fn test_restore_drops_undeclared_optional() {
        let catalog = Catalog::builtin();
        let info = Information::default();
        let mut record = Accessory::new("desk", &catalog, &info, "Lightbulb", 1).unwrap().to_record();
        record.aid = 2;
        record.optional_characteristics.insert(
            "Lightbulb".to_string(),
            vec!["SecuritySystemTargetState".to_string(), "Brightness".to_string()],
        );

        let restored = Accessory::from_record(&record, &catalog, &info).unwrap();
        let bulb = restored.service("Lightbulb", 0).unwrap();
        assert!(bulb.characteristic("SecuritySystemTargetState").is_none());
        assert!(bulb.characteristic("Brightness").is_some());
    }

    #[test]
    fn test_service_key() {
        assert_eq!(service_key("Lightbulb", 0), "Lightbulb");
        assert_eq!(service_key("Lightbulb", 2), "Lightbulb/2");
        assert_eq!(parse_service_key("Lightbulb/2"), ("Lightbulb", 2));
        assert_eq!(parse_service_key("Lightbulb"), ("Lightbulb", 0));
    }
}
