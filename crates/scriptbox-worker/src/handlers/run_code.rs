//! `run_code` handler.

use scriptbox_protocol::{Action, CommandRecord, Response, RunCode};

use crate::dispatcher::Worker;
use crate::error::Result;

/// Compile the record's source into the active module.
pub fn handle(record: &CommandRecord, worker: &mut Worker) -> Result<Option<Response>> {
    let request: RunCode = record.payload(Action::RunCode)?;
    worker.compile(&request.code)?;
    Ok(Some(Response::compiled()))
}
