//! Command handlers.
//!
//! Each action has its own handler module. A handler decodes its payload,
//! drives the worker context and returns the response to send, if any.

pub mod config;
pub mod run_code;
pub mod run_function;
pub mod stop;
