/// Default first topic segment for bridged accessories
pub const DEFAULT_TOPIC_PREFIX: &str = "HomeKit";

/// Read-only metadata service, never written from the bus and never published
pub const INFORMATION_SERVICE: &str = "AccessoryInformation";

/// Control-only characteristic, never published
pub const IDENTIFY_CHARACTERISTIC: &str = "Identify";

/// aid of the bridge accessory itself
pub const BRIDGE_AID: u64 = 1;

/// mDNS service type for HAP accessory servers
pub const HAP_SERVICE_TYPE: &str = "_hap._tcp.local.";

/// TXT record keys used in HAP advertisement
pub const TXT_CONFIG_NUMBER: &str = "c#";
pub const TXT_FEATURE_FLAGS: &str = "ff";
pub const TXT_DEVICE_ID: &str = "id";
pub const TXT_MODEL: &str = "md";
pub const TXT_PROTOCOL_VERSION: &str = "pv";
pub const TXT_STATE_NUMBER: &str = "s#";
pub const TXT_STATUS_FLAGS: &str = "sf";
pub const TXT_CATEGORY: &str = "ci";

/// API path prefix
pub const API_PREFIX: &str = "/v1";
