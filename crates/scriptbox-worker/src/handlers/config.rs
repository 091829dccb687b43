//! `config` handler.

use scriptbox_protocol::{Action, CommandRecord, ConfigPayload, Response};

use crate::dispatcher::Worker;
use crate::error::Result;

pub fn handle(record: &CommandRecord, worker: &mut Worker) -> Result<Option<Response>> {
    let request: ConfigPayload = record.payload(Action::Config)?;
    worker.configure(request.env_config)?;
    Ok(Some(Response::ok()))
}
