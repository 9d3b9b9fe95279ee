//! Control messages: the JSON commands carried on channel 0.
//!
//! Every control message is a JSON object with a `command` discriminator,
//! usually a `channel` target, and command-specific fields. Unknown fields
//! are preserved round-trip in [`ControlMessage::fields`]; close messages
//! in particular carry free-form side-channel options (`exit-status`,
//! `message`, ...).

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use gangwaywire::error::Problem;

/// The only protocol version this implementation speaks.
pub const PROTOCOL_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("couldn't parse control message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid {0:?} field in control message")]
    InvalidField(&'static str),
}

/// One control command, parsed or under construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlMessage {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ControlMessage {
    pub fn new(command: impl Into<String>, channel: Option<&str>) -> Self {
        Self {
            command: command.into(),
            channel: channel.map(|c| c.to_string()),
            fields: Map::new(),
        }
    }

    /// The `init` sent by each side exactly once at startup.
    pub fn init(capabilities: &[String]) -> Self {
        let mut message = Self::new("init", None);
        message
            .fields
            .insert("version".to_string(), Value::from(PROTOCOL_VERSION));
        if !capabilities.is_empty() {
            message
                .fields
                .insert("capabilities".to_string(), Value::from(capabilities.to_vec()));
        }
        message
    }

    pub fn with_field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(serde_json::to_vec(self).expect("control messages are serializable"))
    }

    /// A string field. `Ok(None)` when absent or null, `Err` when present
    /// with the wrong type.
    pub fn str_field(&self, name: &'static str) -> Result<Option<&str>, ProtocolError> {
        match self.fields.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(value)) => Ok(Some(value)),
            Some(_) => Err(ProtocolError::InvalidField(name)),
        }
    }

    pub fn int_field(&self, name: &'static str) -> Result<Option<i64>, ProtocolError> {
        match self.fields.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(value)) => {
                value.as_i64().map(Some).ok_or(ProtocolError::InvalidField(name))
            }
            Some(_) => Err(ProtocolError::InvalidField(name)),
        }
    }

    pub fn bool_field(&self, name: &'static str) -> Result<Option<bool>, ProtocolError> {
        match self.fields.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(value)) => Ok(Some(*value)),
            Some(_) => Err(ProtocolError::InvalidField(name)),
        }
    }

    /// An array-of-strings field.
    pub fn strv_field(&self, name: &'static str) -> Result<Option<Vec<String>>, ProtocolError> {
        match self.fields.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Array(items)) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::String(value) => values.push(value.clone()),
                        _ => return Err(ProtocolError::InvalidField(name)),
                    }
                }
                Ok(Some(values))
            }
            Some(_) => Err(ProtocolError::InvalidField(name)),
        }
    }

    pub fn object_field(
        &self,
        name: &'static str,
    ) -> Result<Option<&Map<String, Value>>, ProtocolError> {
        match self.fields.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Object(value)) => Ok(Some(value)),
            Some(_) => Err(ProtocolError::InvalidField(name)),
        }
    }

    /// The `problem` field of a close message, if any. Unrecognised problem
    /// strings degrade to `internal-error` rather than being dropped.
    pub fn problem(&self) -> Option<Problem> {
        match self.fields.get("problem") {
            Some(Value::String(value)) if !value.is_empty() => {
                Some(value.parse().unwrap_or(Problem::InternalError))
            }
            _ => None,
        }
    }
}
