//! Inbound command records.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;

/// Actions understood by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    RunCode,
    RunFunction,
    Config,
    Stop,
}

impl Action {
    /// Wire name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunCode => "run_code",
            Self::RunFunction => "run_function",
            Self::Config => "config",
            Self::Stop => "stop",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run_code" => Ok(Self::RunCode),
            "run_function" => Ok(Self::RunFunction),
            "config" => Ok(Self::Config),
            "stop" => Ok(Self::Stop),
            other => Err(ProtocolError::UnknownAction(other.to_string())),
        }
    }
}

/// A decoded inbound record: the `action` tag plus its payload fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    /// Action tag as sent by the harness.
    pub action: String,
    /// Remaining top-level fields of the record.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl CommandRecord {
    /// Build a record from an action and a JSON object of fields.
    ///
    /// Non-object `fields` values are ignored.
    pub fn new(action: Action, fields: Value) -> Self {
        let fields = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            action: action.as_str().to_string(),
            fields,
        }
    }

    /// Parse a complete frame (without its delimiter).
    pub fn from_frame(frame: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(frame).map_err(ProtocolError::Malformed)
    }

    /// Resolve the action tag.
    pub fn action(&self) -> Result<Action, ProtocolError> {
        self.action.parse()
    }

    /// Deserialize the payload fields into the action's typed request.
    pub fn payload<T: DeserializeOwned>(&self, action: Action) -> Result<T, ProtocolError> {
        serde_json::from_value(Value::Object(self.fields.clone())).map_err(|source| {
            ProtocolError::InvalidPayload {
                action: action.as_str(),
                source,
            }
        })
    }
}

/// `run_code` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCode {
    /// Source text of one module.
    pub code: String,
}

/// `run_function` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFunction {
    /// Name of the export to invoke.
    pub function_name: String,
    /// Value passed as the sole argument; `null` when omitted.
    #[serde(default)]
    pub function_args: Value,
}

/// `config` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigPayload {
    pub env_config: EnvConfigPatch,
}

/// Partial environment configuration. Absent fields leave the current
/// setting untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_checking: Option<bool>,
    /// Source of an instrumentation hook defining `fn cover(func, data)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_code: Option<String>,
}
