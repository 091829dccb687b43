//! Outbound response records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome reported to the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Fail,
    Connected,
}

/// Response record. Absent optional fields are omitted from the wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl Response {
    /// `{status: "success", result: <value>}`.
    pub fn success(result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::status(Status::Success)
        }
    }

    /// `{status: "success", result: ""}`, the reply to a successful
    /// `run_code`.
    pub fn compiled() -> Self {
        Self::success(Value::String(String::new()))
    }

    /// `{status: "success"}` without a result field.
    pub fn ok() -> Self {
        Self::status(Status::Success)
    }

    /// `{status: "fail"}`. Failure details never cross the protocol.
    pub fn fail() -> Self {
        Self::status(Status::Fail)
    }

    /// Unsolicited greeting sent once the connection is established.
    pub fn connected(environment_id: impl Into<String>, pid: u32) -> Self {
        Self {
            environment_id: Some(environment_id.into()),
            pid: Some(pid),
            ..Self::status(Status::Connected)
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    fn status(status: Status) -> Self {
        Self {
            status,
            result: None,
            environment_id: None,
            pid: None,
        }
    }
}
