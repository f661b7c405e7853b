use shared::protocol::INFORMATION_SERVICE;
use crate::error::BridgeError;

/// A parsed characteristic topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub accessory_id: String,
    pub service_type: String,
    pub index: usize,
    pub characteristic: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Characteristic(Topic),
    /// AccessoryInformation topics are read-only metadata and never touch state
    Ignored,
}

/// Parses `<prefix>/<id>/<service>[/<index>]/<characteristic>` topics and
/// builds the same shape for outbound publishes.
#[derive(Debug, Clone)]
pub struct TopicRouter {
    prefix: String,
}

impl TopicRouter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    /// Wildcard subscription covering every bridged topic
    pub fn subscription(&self) -> String {
        format!("{}/#", self.prefix)
    }

    pub fn parse(&self, topic: &str) -> Result<Route, BridgeError> {
        let malformed = || BridgeError::MalformedTopic(topic.to_string());
        let parts: Vec<&str> = topic.split('/').collect();

        let (prefix, accessory_id, service_type, index, characteristic) = match parts.as_slice() {
            [prefix, accessory_id, service_type, characteristic] => {
                (*prefix, *accessory_id, *service_type, 0, *characteristic)
            }
            [prefix, accessory_id, service_type, index, characteristic] => {
                // digits only: "+1" and "-0" are not indices
                if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(malformed());
                }
                let index: usize = index.parse().map_err(|_| malformed())?;
                (*prefix, *accessory_id, *service_type, index, *characteristic)
            }
            _ => return Err(malformed()),
        };

        if prefix != self.prefix
            || accessory_id.is_empty()
            || service_type.is_empty()
            || characteristic.is_empty()
        {
            return Err(malformed());
        }

        if service_type == INFORMATION_SERVICE {
            return Ok(Route::Ignored);
        }

        Ok(Route::Characteristic(Topic {
            accessory_id: accessory_id.to_string(),
            service_type: service_type.to_string(),
            index,
            characteristic: characteristic.to_string(),
        }))
    }

    /// Outbound topic. `index` is `None` when the accessory has a single
    /// instance of the service type.
    pub fn topic_for(
        &self,
        accessory_id: &str,
        service_type: &str,
        index: Option<usize>,
        characteristic: &str,
    ) -> String {
        match index {
            Some(index) => format!(
                "{}/{}/{}/{}/{}",
                self.prefix, accessory_id, service_type, index, characteristic
            ),
            None => format!("{}/{}/{}/{}", self.prefix, accessory_id, service_type, characteristic),
        }
    }
}
