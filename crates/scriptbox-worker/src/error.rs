//! Worker error taxonomy.

use std::io;

use scriptbox_protocol::ProtocolError;
use thiserror::Error;

use crate::compiler::Diagnostic;
use crate::fault::Trace;

/// Errors raised while serving the control connection.
///
/// Handler-level errors are recoverable and become `{status: "fail"}`;
/// protocol and startup errors are not.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Malformed or unknown record.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The toolchain skipped emission.
    #[error("compilation failed with {} diagnostic(s)", .diagnostics.len())]
    Compile { diagnostics: Vec<Diagnostic> },

    /// The requested export does not exist in the active module.
    #[error("function '{name}' not found; it must be exported from the module (declared without 'private')")]
    NotFound { name: String },

    /// User code raised an error while running.
    #[error("{}", .0.header())]
    RuntimeFault(Trace),

    /// I/O failure while handling a command (module slot, channel).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Privilege drop or connection failure before the loop starts.
    #[error("startup failed: {0}")]
    StartupFatal(String),

    /// Invalid launch configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl WorkerError {
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    /// Whether a handler may convert this error into a `fail` response.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Compile { .. } | Self::NotFound { .. } | Self::RuntimeFault(_) | Self::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;
