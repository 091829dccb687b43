//! `stop` handler.
//!
//! Sends nothing; the control loop closes the connection once the worker
//! reports the stopped state.

use scriptbox_protocol::{CommandRecord, Response};

use crate::dispatcher::Worker;
use crate::error::Result;

pub fn handle(_record: &CommandRecord, worker: &mut Worker) -> Result<Option<Response>> {
    worker.stop();
    Ok(None)
}
