use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use shared::protocol::{IDENTIFY_CHARACTERISTIC, INFORMATION_SERVICE};
use crate::error::BridgeError;

/// Declared value format of a characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Bool,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Int,
    Float,
    String,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Format::Bool => "bool",
            Format::Uint8 => "uint8",
            Format::Uint16 => "uint16",
            Format::Uint32 => "uint32",
            Format::Uint64 => "uint64",
            Format::Int => "int",
            Format::Float => "float",
            Format::String => "string",
        };
        f.write_str(name)
    }
}

/// HAP accessory category, advertised as `ci`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    Other,
    Bridge,
    Fan,
    GarageDoorOpener,
    Lightbulb,
    DoorLock,
    Outlet,
    Switch,
    Thermostat,
    Sensor,
    AlarmSystem,
    Door,
    Window,
    WindowCovering,
    ProgrammableSwitch,
}

impl Category {
    pub fn code(self) -> u8 {
        match self {
            Category::Other => 1,
            Category::Bridge => 2,
            Category::Fan => 3,
            Category::GarageDoorOpener => 4,
            Category::Lightbulb => 5,
            Category::DoorLock => 6,
            Category::Outlet => 7,
            Category::Switch => 8,
            Category::Thermostat => 9,
            Category::Sensor => 10,
            Category::AlarmSystem => 11,
            Category::Door => 12,
            Category::Window => 13,
            Category::WindowCovering => 14,
            Category::ProgrammableSwitch => 15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicDef {
    pub format: Format,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDef {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub optional: Vec<String>,
    #[serde(default)]
    pub category: Option<Category>,
}

/// Contents of a catalog extension file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogExtension {
    #[serde(default)]
    pub characteristics: HashMap<String, CharacteristicDef>,
    #[serde(default)]
    pub services: HashMap<String, ServiceDef>,
}

/// Schema table for services and characteristics. Extensions are merged
/// once at startup; nothing is inferred from traffic.
#[derive(Debug, Clone)]
pub struct Catalog {
    characteristics: HashMap<String, CharacteristicDef>,
    services: HashMap<String, ServiceDef>,
}

const CHARACTERISTICS: &[(&str, Format)] = &[
    // AccessoryInformation
    ("Identify", Format::Bool),
    ("Manufacturer", Format::String),
    ("Model", Format::String),
    ("Name", Format::String),
    ("SerialNumber", Format::String),
    ("FirmwareRevision", Format::String),
    ("HardwareRevision", Format::String),
    ("ConfiguredName", Format::String),
    // Lighting and power
    ("On", Format::Bool),
    ("Brightness", Format::Int),
    ("Hue", Format::Float),
    ("Saturation", Format::Float),
    ("ColorTemperature", Format::Uint32),
    ("OutletInUse", Format::Bool),
    // Climate
    ("CurrentTemperature", Format::Float),
    ("TargetTemperature", Format::Float),
    ("TemperatureDisplayUnits", Format::Uint8),
    ("CurrentHeatingCoolingState", Format::Uint8),
    ("TargetHeatingCoolingState", Format::Uint8),
    ("CoolingThresholdTemperature", Format::Float),
    ("HeatingThresholdTemperature", Format::Float),
    ("CurrentRelativeHumidity", Format::Float),
    ("TargetRelativeHumidity", Format::Float),
    ("CurrentHeaterCoolerState", Format::Uint8),
    ("TargetHeaterCoolerState", Format::Uint8),
    ("CurrentHumidifierDehumidifierState", Format::Uint8),
    ("TargetHumidifierDehumidifierState", Format::Uint8),
    ("RelativeHumidityDehumidifierThreshold", Format::Float),
    ("RelativeHumidityHumidifierThreshold", Format::Float),
    ("WaterLevel", Format::Float),
    // Doors, locks, coverings
    ("CurrentDoorState", Format::Uint8),
    ("TargetDoorState", Format::Uint8),
    ("ObstructionDetected", Format::Bool),
    ("LockCurrentState", Format::Uint8),
    ("LockTargetState", Format::Uint8),
    ("CurrentPosition", Format::Uint8),
    ("TargetPosition", Format::Uint8),
    ("PositionState", Format::Uint8),
    ("HoldPosition", Format::Bool),
    ("CurrentHorizontalTiltAngle", Format::Int),
    ("TargetHorizontalTiltAngle", Format::Int),
    ("CurrentVerticalTiltAngle", Format::Int),
    ("TargetVerticalTiltAngle", Format::Int),
    ("CurrentTiltAngle", Format::Int),
    ("TargetTiltAngle", Format::Int),
    ("CurrentSlatState", Format::Uint8),
    ("SlatType", Format::Uint8),
    // Sensors
    ("ContactSensorState", Format::Uint8),
    ("MotionDetected", Format::Bool),
    ("OccupancyDetected", Format::Uint8),
    ("LeakDetected", Format::Uint8),
    ("SmokeDetected", Format::Uint8),
    ("CarbonDioxideDetected", Format::Uint8),
    ("CarbonDioxideLevel", Format::Float),
    ("CarbonDioxidePeakLevel", Format::Float),
    ("CarbonMonoxideDetected", Format::Uint8),
    ("CarbonMonoxideLevel", Format::Float),
    ("CarbonMonoxidePeakLevel", Format::Float),
    ("CurrentAmbientLightLevel", Format::Float),
    ("AirQuality", Format::Uint8),
    ("PM2_5Density", Format::Float),
    ("PM10Density", Format::Float),
    ("VOCDensity", Format::Float),
    ("StatusActive", Format::Bool),
    ("StatusFault", Format::Uint8),
    ("StatusTampered", Format::Uint8),
    ("StatusLowBattery", Format::Uint8),
    // Battery
    ("BatteryLevel", Format::Uint8),
    ("ChargingState", Format::Uint8),
    // Fans, purifiers, filters
    ("Active", Format::Uint8),
    ("RotationSpeed", Format::Float),
    ("RotationDirection", Format::Int),
    ("SwingMode", Format::Uint8),
    ("LockPhysicalControls", Format::Uint8),
    ("CurrentFanState", Format::Uint8),
    ("TargetFanState", Format::Uint8),
    ("CurrentAirPurifierState", Format::Uint8),
    ("TargetAirPurifierState", Format::Uint8),
    ("FilterChangeIndication", Format::Uint8),
    ("FilterLifeLevel", Format::Float),
    ("ResetFilterIndication", Format::Uint8),
    // Switches, valves, security
    ("ProgrammableSwitchEvent", Format::Uint8),
    ("ServiceLabelIndex", Format::Uint8),
    ("ServiceLabelNamespace", Format::Uint8),
    ("InUse", Format::Uint8),
    ("ValveType", Format::Uint8),
    ("SetDuration", Format::Uint32),
    ("RemainingDuration", Format::Uint32),
    ("IsConfigured", Format::Uint8),
    ("ProgramMode", Format::Uint8),
    ("SecuritySystemCurrentState", Format::Uint8),
    ("SecuritySystemTargetState", Format::Uint8),
    ("SecuritySystemAlarmType", Format::Uint8),
    ("Mute", Format::Bool),
    ("Volume", Format::Uint8),
];

type ServiceRow = (&'static str, &'static [&'static str], &'static [&'static str], Category);

const SERVICES: &[ServiceRow] = &[
    (
        "AccessoryInformation",
        &["Identify", "Manufacturer", "Model", "Name", "SerialNumber", "FirmwareRevision"],
        &["HardwareRevision"],
        Category::Other,
    ),
    (
        "AirPurifier",
        &["Active", "CurrentAirPurifierState", "TargetAirPurifierState"],
        &["LockPhysicalControls", "Name", "SwingMode", "RotationSpeed"],
        Category::Other,
    ),
    (
        "AirQualitySensor",
        &["AirQuality"],
        &["StatusActive", "StatusFault", "StatusTampered", "StatusLowBattery", "Name",
          "PM2_5Density", "PM10Density", "VOCDensity"],
        Category::Sensor,
    ),
    (
        "BatteryService",
        &["BatteryLevel", "ChargingState", "StatusLowBattery"],
        &["Name"],
        Category::Other,
    ),
    (
        "CarbonDioxideSensor",
        &["CarbonDioxideDetected"],
        &["StatusActive", "StatusFault", "StatusLowBattery", "StatusTampered",
          "CarbonDioxideLevel", "CarbonDioxidePeakLevel", "Name"],
        Category::Sensor,
    ),
    (
        "CarbonMonoxideSensor",
        &["CarbonMonoxideDetected"],
        &["StatusActive", "StatusFault", "StatusLowBattery", "StatusTampered",
          "CarbonMonoxideLevel", "CarbonMonoxidePeakLevel", "Name"],
        Category::Sensor,
    ),
    (
        "ContactSensor",
        &["ContactSensorState"],
        &["StatusActive", "StatusFault", "StatusTampered", "StatusLowBattery", "Name"],
        Category::Sensor,
    ),
    (
        "Door",
        &["CurrentPosition", "PositionState", "TargetPosition"],
        &["HoldPosition", "ObstructionDetected", "Name"],
        Category::Door,
    ),
    (
        "Fan",
        &["On"],
        &["RotationDirection", "RotationSpeed", "Name"],
        Category::Fan,
    ),
    (
        "Fanv2",
        &["Active"],
        &["CurrentFanState", "TargetFanState", "LockPhysicalControls", "Name",
          "RotationDirection", "RotationSpeed", "SwingMode"],
        Category::Fan,
    ),
    (
        "FilterMaintenance",
        &["FilterChangeIndication"],
        &["FilterLifeLevel", "ResetFilterIndication", "Name"],
        Category::Other,
    ),
    (
        "GarageDoorOpener",
        &["CurrentDoorState", "TargetDoorState", "ObstructionDetected"],
        &["LockCurrentState", "LockTargetState", "Name"],
        Category::GarageDoorOpener,
    ),
    (
        "HeaterCooler",
        &["Active", "CurrentHeaterCoolerState", "TargetHeaterCoolerState", "CurrentTemperature"],
        &["LockPhysicalControls", "Name", "SwingMode", "CoolingThresholdTemperature",
          "HeatingThresholdTemperature", "TemperatureDisplayUnits", "RotationSpeed"],
        Category::Thermostat,
    ),
    (
        "HumidifierDehumidifier",
        &["CurrentRelativeHumidity", "CurrentHumidifierDehumidifierState",
          "TargetHumidifierDehumidifierState", "Active"],
        &["LockPhysicalControls", "Name", "SwingMode", "WaterLevel",
          "RelativeHumidityDehumidifierThreshold", "RelativeHumidityHumidifierThreshold",
          "RotationSpeed"],
        Category::Thermostat,
    ),
    (
        "HumiditySensor",
        &["CurrentRelativeHumidity"],
        &["StatusActive", "StatusFault", "StatusTampered", "StatusLowBattery", "Name"],
        Category::Sensor,
    ),
    (
        "IrrigationSystem",
        &["Active", "ProgramMode", "InUse"],
        &["RemainingDuration", "Name", "StatusFault"],
        Category::Other,
    ),
    (
        "LeakSensor",
        &["LeakDetected"],
        &["StatusActive", "StatusFault", "StatusTampered", "StatusLowBattery", "Name"],
        Category::Sensor,
    ),
    (
        "LightSensor",
        &["CurrentAmbientLightLevel"],
        &["StatusActive", "StatusFault", "StatusTampered", "StatusLowBattery", "Name"],
        Category::Sensor,
    ),
    (
        "Lightbulb",
        &["On"],
        &["Brightness", "Hue", "Saturation", "Name", "ColorTemperature"],
        Category::Lightbulb,
    ),
    (
        "LockMechanism",
        &["LockCurrentState", "LockTargetState"],
        &["Name"],
        Category::DoorLock,
    ),
    (
        "MotionSensor",
        &["MotionDetected"],
        &["StatusActive", "StatusFault", "StatusTampered", "StatusLowBattery", "Name"],
        Category::Sensor,
    ),
    (
        "OccupancySensor",
        &["OccupancyDetected"],
        &["StatusActive", "StatusFault", "StatusTampered", "StatusLowBattery", "Name"],
        Category::Sensor,
    ),
    (
        "Outlet",
        &["On", "OutletInUse"],
        &["Name"],
        Category::Outlet,
    ),
    (
        "SecuritySystem",
        &["SecuritySystemCurrentState", "SecuritySystemTargetState"],
        &["StatusFault", "StatusTampered", "SecuritySystemAlarmType", "Name"],
        Category::AlarmSystem,
    ),
    (
        "ServiceLabel",
        &["ServiceLabelNamespace"],
        &["Name"],
        Category::Other,
    ),
    (
        "Slat",
        &["CurrentSlatState", "SlatType"],
        &["Name", "SwingMode", "CurrentTiltAngle", "TargetTiltAngle"],
        Category::WindowCovering,
    ),
    (
        "SmokeSensor",
        &["SmokeDetected"],
        &["StatusActive", "StatusFault", "StatusTampered", "StatusLowBattery", "Name"],
        Category::Sensor,
    ),
    (
        "Speaker",
        &["Mute"],
        &["Name", "Volume"],
        Category::Other,
    ),
    (
        "StatelessProgrammableSwitch",
        &["ProgrammableSwitchEvent"],
        &["Name", "ServiceLabelIndex"],
        Category::ProgrammableSwitch,
    ),
    (
        "Switch",
        &["On"],
        &["Name"],
        Category::Switch,
    ),
    (
        "TemperatureSensor",
        &["CurrentTemperature"],
        &["StatusActive", "StatusFault", "StatusLowBattery", "StatusTampered", "Name"],
        Category::Sensor,
    ),
    (
        "Thermostat",
        &["CurrentHeatingCoolingState", "TargetHeatingCoolingState", "CurrentTemperature",
          "TargetTemperature", "TemperatureDisplayUnits"],
        &["CurrentRelativeHumidity", "TargetRelativeHumidity", "CoolingThresholdTemperature",
          "HeatingThresholdTemperature", "Name"],
        Category::Thermostat,
    ),
    (
        "Valve",
        &["Active", "InUse", "ValveType"],
        &["SetDuration", "RemainingDuration", "IsConfigured", "ServiceLabelIndex",
          "StatusFault", "Name"],
        Category::Other,
    ),
    (
        "Window",
        &["CurrentPosition", "TargetPosition", "PositionState"],
        &["HoldPosition", "ObstructionDetected", "Name"],
        Category::Window,
    ),
    (
        "WindowCovering",
        &["TargetPosition", "CurrentPosition", "PositionState"],
        &["HoldPosition", "TargetHorizontalTiltAngle", "TargetVerticalTiltAngle",
          "CurrentHorizontalTiltAngle", "CurrentVerticalTiltAngle", "ObstructionDetected",
          "Name"],
        Category::WindowCovering,
    ),
];

impl Catalog {
    /// The built-in HAP schema
    pub fn builtin() -> Self {
        let characteristics = CHARACTERISTICS
            .iter()
            .map(|(name, format)| (name.to_string(), CharacteristicDef { format: *format }))
            .collect();

        let services = SERVICES
            .iter()
            .map(|(name, required, optional, category)| {
                let def = ServiceDef {
                    required: required.iter().map(|c| c.to_string()).collect(),
                    optional: optional.iter().map(|c| c.to_string()).collect(),
                    category: Some(*category),
                };
                (name.to_string(), def)
            })
            .collect();

        Self { characteristics, services }
    }

    /// Built-in schema plus every extension file, in order
    pub fn load(extensions: &[impl AsRef<Path>]) -> Result<Self> {
        let mut catalog = Self::builtin();
        for path in extensions {
            let path = path.as_ref();
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read catalog extension: {}", path.display()))?;
            let extension: CatalogExtension = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse catalog extension: {}", path.display()))?;
            catalog.merge(extension)?;
            tracing::info!("Merged catalog extension {}", path.display());
        }
        Ok(catalog)
    }

    /// Merge an extension. Existing services gain any characteristics they lack;
    /// existing characteristics must keep their format.
    pub fn merge(&mut self, extension: CatalogExtension) -> Result<()> {
        for (name, def) in extension.characteristics {
            match self.characteristics.get(&name) {
                Some(existing) if existing.format != def.format => {
                    anyhow::bail!(
                        "Characteristic {} redeclared as {} (catalog has {})",
                        name,
                        def.format,
                        existing.format
                    );
                }
                Some(_) => {}
                None => {
                    self.characteristics.insert(name, def);
                }
            }
        }

        for (name, def) in extension.services {
            for characteristic in def.required.iter().chain(def.optional.iter()) {
                if !self.characteristics.contains_key(characteristic) {
                    anyhow::bail!("Service {} references unknown characteristic {}", name, characteristic);
                }
            }

            match self.services.get_mut(&name) {
                Some(existing) => {
                    for characteristic in def.required {
                        if !existing.required.contains(&characteristic) {
                            tracing::debug!("Added required {} to {}", characteristic, name);
                            existing.required.push(characteristic);
                        }
                    }
                    for characteristic in def.optional {
                        if !existing.optional.contains(&characteristic) {
                            tracing::debug!("Added optional {} to {}", characteristic, name);
                            existing.optional.push(characteristic);
                        }
                    }
                }
                None => {
                    self.services.insert(name, def);
                }
            }
        }

        Ok(())
    }

    pub fn service(&self, service_type: &str) -> Result<&ServiceDef, BridgeError> {
        self.services
            .get(service_type)
            .ok_or_else(|| BridgeError::UnknownServiceType(service_type.to_string()))
    }

    /// A characteristic as declared by the service: it must be in the
    /// service's required or optional list.
    pub fn characteristic(
        &self,
        service_type: &str,
        name: &str,
    ) -> Result<&CharacteristicDef, BridgeError> {
        let service = self.service(service_type)?;
        let declared = service.required.iter().chain(service.optional.iter()).any(|c| c == name);

        self.characteristics
            .get(name)
            .filter(|_| declared)
            .ok_or_else(|| BridgeError::UnknownCharacteristic {
                service_type: service_type.to_string(),
                characteristic: name.to_string(),
            })
    }

    /// Category of an accessory whose first service is `service_type`
    pub fn category(&self, service_type: &str) -> Category {
        self.services
            .get(service_type)
            .and_then(|def| def.category)
            .unwrap_or(Category::Other)
    }
}

/// Whether a characteristic is excluded from outbound publication
pub fn is_control_only(service_type: &str, characteristic: &str) -> bool {
    service_type == INFORMATION_SERVICE || characteristic == IDENTIFY_CHARACTERISTIC
}

/// "TemperatureSensor" -> "Temperature Sensor"
pub fn display_name(service_type: &str) -> String {
    let chars: Vec<char> = service_type.chars().collect();
    let mut name = String::with_capacity(service_type.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        let starts_word = i > 0
            && c.is_uppercase()
            && !chars[i - 1].is_whitespace()
            && chars.get(i + 1).is_some_and(|next| next.is_lowercase());
        if starts_word {
            name.push(' ');
        }
        name.push(c);
    }
    name
}
