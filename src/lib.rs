//! scriptbox - harness client for script execution workers
//!
//! A harness owns one worker per environment. It listens on the loopback
//! interface, launches `scriptbox-worker <port> <environment_id>`, accepts
//! the worker's connection and drives it with `run_code`, `run_function`,
//! `config` and `stop` records.

pub mod harness;

pub use harness::{Harness, HarnessError, HarnessResult, HarnessSession};
pub use scriptbox_protocol::{
    Action, CommandRecord, EnvConfigPatch, ProtocolError, Response, Status,
};
