//! Error types for the control protocol.

use thiserror::Error;

/// Errors raised while framing or decoding records.
///
/// None of these are recoverable at the dispatcher level: a record that
/// fails to decode is dropped without a response.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame is not valid UTF-8 JSON, or lacks an `action` tag.
    #[error("malformed record: {0}")]
    Malformed(#[source] serde_json::Error),

    /// The record names an action no handler is registered for.
    #[error("unknown action: {0}")]
    UnknownAction(String),

    /// The action is known but its payload fields do not match.
    #[error("invalid {action} payload: {source}")]
    InvalidPayload {
        action: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// A frame grew beyond the decoder limit before its delimiter arrived.
    #[error("frame exceeds maximum size of {limit} bytes")]
    FrameTooLarge { limit: usize },

    /// An outgoing record could not be rendered.
    #[error("failed to encode record: {0}")]
    Encode(#[source] serde_json::Error),
}
