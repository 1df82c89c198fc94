//! Wire format of notification records

use serde_json::Value;

use super::error::{BusError, BusResult};
use crate::{CollectorId, Contributor, UveKey};

/// A record as stored in a partition log
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub partition: u32,
    pub offset: u64,

    /// `<table:name>|<struct>|<generator>|<addr>:<port>`
    pub key: String,

    /// JSON struct contents; empty for a deletion
    pub value: Vec<u8>,

    /// Generation of the publishing collector (record header)
    pub generation: String,
}

/// A decoded UVE change notification
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub key: UveKey,
    pub struct_name: String,
    pub generator: String,
    pub collector: CollectorId,
    pub generation: String,

    /// `None` means the contribution is gone
    pub value: Option<Value>,
}

impl Notification {
    pub fn contributor(&self) -> Contributor {
        Contributor::new(self.collector.clone(), self.generation.clone(), self.generator.clone())
    }

    /// Record key for this notification
    pub fn wire_key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.key, self.struct_name, self.generator, self.collector
        )
    }

    /// Record value for this notification
    pub fn wire_value(&self) -> Vec<u8> {
        match &self.value {
            Some(value) => value.to_string().into_bytes(),
            None => Vec::new(),
        }
    }

    /// Decode a raw record
    ///
    /// The UVE key may contain `|`; the last three fields never do.
    pub fn decode(record: &RawRecord) -> BusResult<Self> {
        let mut fields = record.key.rsplitn(4, '|');
        let (Some(collector), Some(generator), Some(struct_name), Some(key)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(BusError::Malformed(format!("bad record key '{}'", record.key)));
        };

        let key: UveKey = key.parse().map_err(BusError::Malformed)?;
        let collector: CollectorId = collector.parse().map_err(BusError::Malformed)?;

        if struct_name.is_empty() || generator.is_empty() {
            return Err(BusError::Malformed(format!("bad record key '{}'", record.key)));
        }

        let value = if record.value.is_empty() {
            None
        } else {
            match serde_json::from_slice::<Value>(&record.value) {
                Ok(Value::Null) => None,
                Ok(value) => Some(value),
                Err(e) => {
                    return Err(BusError::Malformed(format!(
                        "bad value for '{}': {}",
                        record.key, e
                    )));
                }
            }
        };

        Ok(Notification {
            key,
            struct_name: struct_name.to_string(),
            generator: generator.to_string(),
            collector,
            generation: record.generation.clone(),
            value,
        })
    }
}
