//! `run_function` handler.

use scriptbox_protocol::{Action, CommandRecord, Response, RunFunction};

use crate::dispatcher::Worker;
use crate::error::Result;

/// Invoke an export and return its value as `result`.
pub fn handle(record: &CommandRecord, worker: &mut Worker) -> Result<Option<Response>> {
    let request: RunFunction = record.payload(Action::RunFunction)?;
    let value = worker.invoke(&request.function_name, &request.function_args)?;
    Ok(Some(Response::success(value)))
}
