use serde::{Deserialize, Serialize};
use crate::catalog::Format;
use crate::error::BridgeError;

/// A characteristic value. `Null` means unknown (never reported, or cleared
/// because the device stopped responding).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CharValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl CharValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CharValue::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CharValue::Int(i) => Some(*i as f64),
            CharValue::Float(f) => Some(*f),
            _ => None,
        }
    }
}

fn integer_range(format: Format) -> Option<(i64, i64)> {
    match format {
        Format::Uint8 => Some((0, u8::MAX as i64)),
        Format::Uint16 => Some((0, u16::MAX as i64)),
        Format::Uint32 => Some((0, u32::MAX as i64)),
        Format::Uint64 => Some((0, i64::MAX)),
        Format::Int => Some((i32::MIN as i64, i32::MAX as i64)),
        _ => None,
    }
}

fn invalid(characteristic: &str, format: Format, value: impl Into<String>) -> BridgeError {
    BridgeError::InvalidCharacteristicValue {
        characteristic: characteristic.to_string(),
        format,
        value: value.into(),
    }
}

/// Decode a bus payload for a characteristic of the given format.
pub fn decode(characteristic: &str, format: Format, raw: &[u8]) -> Result<CharValue, BridgeError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| invalid(characteristic, format, String::from_utf8_lossy(raw)))?;

    if format == Format::String {
        return Ok(CharValue::String(text.to_string()));
    }

    let trimmed = text.trim();
    match format {
        Format::Bool => match trimmed.to_ascii_lowercase().as_str() {
            "1" | "true" => Ok(CharValue::Bool(true)),
            "0" | "false" => Ok(CharValue::Bool(false)),
            _ => Err(invalid(characteristic, format, text)),
        },
        Format::Float => match trimmed.parse::<f64>() {
            Ok(f) if f.is_finite() => Ok(CharValue::Float(f)),
            _ => Err(invalid(characteristic, format, text)),
        },
        _ => {
            let value = trimmed
                .parse::<i64>()
                .map_err(|_| invalid(characteristic, format, text))?;
            coerce(characteristic, format, CharValue::Int(value))
        }
    }
}

/// Coerce an already-typed value (e.g. from a controller write) to the format.
pub fn coerce(characteristic: &str, format: Format, value: CharValue) -> Result<CharValue, BridgeError> {
    let rejected = |value: &CharValue| invalid(characteristic, format, format!("{:?}", value));

    match (format, value) {
        (_, CharValue::Null) => Err(invalid(characteristic, format, "null")),
        (Format::Bool, CharValue::Bool(b)) => Ok(CharValue::Bool(b)),
        (Format::Bool, CharValue::Int(i)) if i == 0 || i == 1 => Ok(CharValue::Bool(i == 1)),
        (Format::Float, v @ (CharValue::Int(_) | CharValue::Float(_))) => match v.as_f64() {
            Some(f) if f.is_finite() => Ok(CharValue::Float(f)),
            _ => Err(rejected(&v)),
        },
        (Format::String, CharValue::String(s)) => Ok(CharValue::String(s)),
        (format, v) => {
            let Some((min, max)) = integer_range(format) else {
                return Err(rejected(&v));
            };
            let int = match &v {
                CharValue::Int(i) => Some(*i),
                CharValue::Bool(b) => Some(*b as i64),
                CharValue::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
                _ => None,
            };
            match int {
                Some(i) if (min..=max).contains(&i) => Ok(CharValue::Int(i)),
                _ => Err(rejected(&v)),
            }
        }
    }
}

/// Bus representation of a value; `None` for unknown values, which are never
/// published (an empty payload would remove the accessory).
pub fn encode(value: &CharValue) -> Option<String> {
    match value {
        CharValue::Null => None,
        CharValue::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        CharValue::Int(i) => Some(i.to_string()),
        CharValue::Float(f) => Some(f.to_string()),
        CharValue::String(s) => Some(s.clone()),
    }
}
