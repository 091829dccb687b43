//! scriptbox protocol types
//!
//! Defines the NUL-delimited JSON records exchanged between a harness and a
//! scriptbox worker over the control connection.

pub mod error;
pub mod framing;
pub mod request;
pub mod response;

pub use error::ProtocolError;
pub use framing::{encode_frame, FrameDecoder, DEFAULT_MAX_FRAME_BYTES, DELIMITER};
pub use request::{Action, CommandRecord, ConfigPayload, EnvConfigPatch, RunCode, RunFunction};
pub use response::{Response, Status};

/// Host the worker dials back to.
pub const LOOPBACK_HOST: &str = "127.0.0.1";
