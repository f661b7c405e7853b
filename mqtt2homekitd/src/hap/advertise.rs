use std::collections::HashMap;
use mdns_sd::{ServiceDaemon, ServiceInfo};
use anyhow::{Context, Result};
use serde_json::value::RawValue;
use shared::protocol::{
    HAP_SERVICE_TYPE, TXT_CATEGORY, TXT_CONFIG_NUMBER, TXT_DEVICE_ID, TXT_FEATURE_FLAGS,
    TXT_MODEL, TXT_PROTOCOL_VERSION, TXT_STATE_NUMBER, TXT_STATUS_FLAGS,
};
use crate::accessory::Accessory;
use crate::catalog::Category;
use crate::codec::CharValue;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use super::{AccessoryDatabase, AccessoryServer, HapIdentity};

const PROTOCOL_VERSION: &str = "1.1";

/// Advertises the bridge as a HAP accessory server over mDNS and keeps the
/// `c#` record in step with the accessory database.
pub struct MdnsAccessoryServer {
    daemon: ServiceDaemon,
    config: BridgeConfig,
    database: AccessoryDatabase,
    registered: Option<ServiceInfo>,
}

impl MdnsAccessoryServer {
    pub fn new(daemon: ServiceDaemon, config: BridgeConfig) -> Self {
        Self {
            daemon,
            config,
            database: AccessoryDatabase::new(HapIdentity::generate()),
            registered: None,
        }
    }

    fn readvertise(&mut self) {
        match register_bridge(&self.daemon, &self.config, self.database.identity()) {
            Ok(info) => self.registered = Some(info),
            Err(e) => tracing::error!("Failed to advertise bridge: {:#}", e),
        }
    }
}

impl AccessoryServer for MdnsAccessoryServer {
    fn add_accessory(&mut self, accessory: &Accessory) {
        self.database.add(accessory);
    }

    fn remove_accessory(&mut self, aid: u64) {
        if !self.database.remove(aid) {
            tracing::debug!("Accessory {} was not published", aid);
        }
    }

    fn configuration_changed(&mut self) {
        if self.database.refresh_config_number() {
            tracing::info!(
                "Accessory database changed, configuration number now {}",
                self.database.identity().config_number
            );
        }
        self.readvertise();
    }

    fn notify(&mut self, aid: u64, iid: u64, value: &CharValue) {
        // Event delivery to subscribed controllers happens in the session layer.
        tracing::trace!("Characteristic {}.{} = {:?}", aid, iid, value);
    }

    fn persisted_state(&self) -> Result<Box<RawValue>, BridgeError> {
        self.database.save()
    }

    fn restore_state(&mut self, state: &RawValue) -> Result<(), BridgeError> {
        self.database.restore(state)?;
        tracing::info!(
            "Restored bridge identity {} (c# {})",
            self.database.identity().device_id,
            self.database.identity().config_number
        );
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some(info) = self.registered.take() {
            if let Err(e) = unregister_bridge(&self.daemon, &info) {
                tracing::error!("Failed to unregister mDNS service: {:#}", e);
            }
        }
        if let Err(e) = self.daemon.shutdown() {
            tracing::error!("Failed to shutdown mDNS daemon: {}", e);
        }
    }
}

fn txt_records(config: &BridgeConfig, identity: &HapIdentity) -> HashMap<String, String> {
    let status_flags = if identity.is_paired() { "0" } else { "1" };
    HashMap::from([
        (TXT_CONFIG_NUMBER.to_string(), identity.config_number.to_string()),
        (TXT_FEATURE_FLAGS.to_string(), "0".to_string()),
        (TXT_DEVICE_ID.to_string(), identity.device_id.clone()),
        (TXT_MODEL.to_string(), config.name.clone()),
        (TXT_PROTOCOL_VERSION.to_string(), PROTOCOL_VERSION.to_string()),
        (TXT_STATE_NUMBER.to_string(), "1".to_string()),
        (TXT_STATUS_FLAGS.to_string(), status_flags.to_string()),
        (TXT_CATEGORY.to_string(), Category::Bridge.code().to_string()),
    ])
}

/// Register (or re-register with fresh TXT records) the bridge service
pub fn register_bridge(
    daemon: &ServiceDaemon,
    config: &BridgeConfig,
    identity: &HapIdentity,
) -> Result<ServiceInfo> {
    let hostname = hostname::get()
        .context("Failed to get system hostname")?
        .to_string_lossy()
        .to_string();
    let host = format!("{}.local.", hostname);

    let address = config.address.clone().unwrap_or_default();
    let service_info = ServiceInfo::new(
        HAP_SERVICE_TYPE,
        &config.name,
        &host,
        address.as_str(),
        config.port,
        txt_records(config, identity),
    )
    .context("Failed to create ServiceInfo")?;

    let service_info = if config.address.is_none() {
        service_info.enable_addr_auto()
    } else {
        service_info
    };

    daemon
        .register(service_info.clone())
        .context("Failed to register mDNS service")?;

    tracing::info!(
        "Registered {} as {} on port {} (c# {})",
        HAP_SERVICE_TYPE,
        config.name,
        config.port,
        identity.config_number
    );

    Ok(service_info)
}

pub fn unregister_bridge(daemon: &ServiceDaemon, service_info: &ServiceInfo) -> Result<()> {
    daemon
        .unregister(service_info.get_fullname())
        .context("Failed to unregister mDNS service")?;

    tracing::info!("Unregistered {}", service_info.get_fullname());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_txt_records() {
        let config = BridgeConfig::default();
        let mut identity = HapIdentity::generate();
        identity.config_number = 7;

        let txt = txt_records(&config, &identity);
        assert_eq!(txt[TXT_CONFIG_NUMBER], "7");
        assert_eq!(txt[TXT_DEVICE_ID], identity.device_id);
        assert_eq!(txt[TXT_STATUS_FLAGS], "1");
        assert_eq!(txt[TXT_CATEGORY], "2");

        identity.paired_clients.insert("controller".to_string(), "key".to_string());
        assert_eq!(txt_records(&config, &identity)[TXT_STATUS_FLAGS], "0");
    }
}
