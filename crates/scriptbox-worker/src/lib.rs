//! scriptbox worker
//!
//! A worker process dials back to its harness over a single loopback TCP
//! connection and serves NUL-delimited JSON commands: compile a module,
//! call one of its exports, adjust the environment, stop.
//!
//! This crate can be used in two modes:
//! - **Standalone binary**: launched by the harness with a port and an
//!   environment id
//! - **In-process library**: for integration testing against a harness
//!   in the same process

pub mod compiler;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod fault;
pub mod handlers;
pub mod privilege;
pub mod sandbox;

pub use compiler::{Compiler, Diagnostic, Emit};
pub use config::{PrivilegeConfig, ToolchainOptions, WorkerConfig};
pub use connection::{Connection, Transport};
pub use dispatcher::{EnvironmentConfig, Worker, WorkerState};
pub use error::{Result, WorkerError};
pub use fault::{filter_trace, FaultReporter, FilteredTrace, MemoryChannel, Trace};
pub use privilege::{drop_privileges, Identity};
pub use sandbox::{CoverHook, DirectCall, Export, Instrumentation, ModuleUnit, SandboxContext};
