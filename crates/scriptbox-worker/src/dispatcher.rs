//! Command dispatcher and control loop.
//!
//! [`Worker`] owns everything a command can touch: the active module, the
//! environment configuration, the compiler and the fault reporter. Records
//! are handled strictly one at a time, in arrival order.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::rc::Rc;

use scriptbox_protocol::{Action, CommandRecord, EnvConfigPatch, ProtocolError, Response};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::compiler::Compiler;
use crate::config::WorkerConfig;
use crate::connection::{Connection, Transport};
use crate::error::{Result, WorkerError};
use crate::fault::{FaultReporter, Trace};
use crate::handlers;
use crate::privilege;
use crate::sandbox::{self, DirectCall, Instrumentation, ModuleUnit, SandboxContext};

/// Lifecycle of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Booting,
    Connecting,
    Ready,
    Compiling,
    Invoking,
    Configuring,
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Booting => "booting",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Compiling => "compiling",
            Self::Invoking => "invoking",
            Self::Configuring => "configuring",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Settings that shape how user code runs.
pub struct EnvironmentConfig {
    /// Exposed to module code as `is_checking` and to functions as
    /// `this.is_checking`.
    pub is_checking: bool,
    pub hook: Box<dyn Instrumentation>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            is_checking: false,
            hook: Box::new(DirectCall),
        }
    }
}

/// Worker context.
pub struct Worker {
    config: WorkerConfig,
    state: WorkerState,
    env: EnvironmentConfig,
    compiler: Compiler,
    active: Option<Rc<ModuleUnit>>,
    reporter: FaultReporter,
}

impl Worker {
    pub fn new(config: WorkerConfig, reporter: FaultReporter) -> Self {
        let compiler = Compiler::new(config.toolchain.clone());
        Self {
            config,
            state: WorkerState::Booting,
            env: EnvironmentConfig::default(),
            compiler,
            active: None,
            reporter,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn environment(&self) -> &EnvironmentConfig {
        &self.env
    }

    pub fn active_module(&self) -> Option<&ModuleUnit> {
        self.active.as_deref()
    }

    fn transition(&mut self, next: WorkerState) {
        if self.state == WorkerState::Stopped || self.state == next {
            return;
        }
        debug!(from = %self.state, to = %next, "state transition");
        self.state = next;
    }

    /// Drop privileges, dial the harness and serve until `stop` or end of
    /// stream.
    pub fn start(&mut self) -> Result<()> {
        self.config.validate()?;
        privilege::drop_privileges(&self.config.privileges)?;

        self.transition(WorkerState::Connecting);
        let addr = self.config.harness_addr();
        info!(%addr, "connecting to harness");
        let mut conn = Connection::connect(addr, self.config.max_frame_bytes)?;
        self.serve(&mut conn)
    }

    /// Run the control loop over an established connection.
    pub fn serve<T: Transport>(&mut self, conn: &mut Connection<T>) -> Result<()> {
        // Greet the harness
        conn.send(&Response::connected(
            self.config.environment_id.clone(),
            process::id(),
        ))?;
        self.transition(WorkerState::Ready);
        info!(peer = %conn.peer(), environment_id = %self.config.environment_id, "connected");

        // Read whatever complete records have arrived
        while let Some(frames) = conn.receive()? {
            for frame in frames {
                // Handle the record and answer it, if it warrants an answer
                if let Some(response) = self.guarded(frame) {
                    conn.send(&response)?;
                }
                // Records after stop are never processed
                if self.state == WorkerState::Stopped {
                    conn.close();
                    info!("stopped by harness");
                    return Ok(());
                }
            }
        }

        info!("harness closed the connection");
        self.transition(WorkerState::Stopped);
        Ok(())
    }

    /// Handle one frame inside the top-level recovery boundary.
    fn guarded(&mut self, frame: std::result::Result<Vec<u8>, ProtocolError>) -> Option<Response> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.handle_frame(frame))) {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                self.reporter.report(&err);
                error!(error = %err, "record dropped");
                None
            }
            Err(payload) => {
                let trace = Trace::from_panic(payload.as_ref());
                self.reporter.trace(&trace);
                error!(error = %trace.header(), "command aborted");
                self.transition(WorkerState::Ready);
                Some(Response::fail())
            }
        }
    }

    /// Decode and dispatch one frame.
    pub fn handle_frame(
        &mut self,
        frame: std::result::Result<Vec<u8>, ProtocolError>,
    ) -> Result<Option<Response>> {
        let record = CommandRecord::from_frame(&frame?)?;
        self.dispatch(&record)
    }

    /// Route a record to its handler.
    ///
    /// Recoverable handler errors are reported on the error channel and
    /// answered with `fail`; protocol errors are returned.
    pub fn dispatch(&mut self, record: &CommandRecord) -> Result<Option<Response>> {
        let action = record.action()?;
        debug!(%action, "dispatching");

        // Dispatch to the action handler
        let outcome = match action {
            Action::RunCode => handlers::run_code::handle(record, self),
            Action::RunFunction => handlers::run_function::handle(record, self),
            Action::Config => handlers::config::handle(record, self),
            Action::Stop => handlers::stop::handle(record, self),
        };
        self.transition(WorkerState::Ready);

        match outcome {
            Ok(response) => Ok(response),
            Err(err) if err.is_recoverable() => {
                let from_user_code = self.reporter.report(&err);
                warn!(%action, from_user_code, error = %err, "command failed");
                Ok(Some(Response::fail()))
            }
            Err(err) => Err(err),
        }
    }

    /// Persist, compile and emit a module; swap it in on success.
    pub fn compile(&mut self, code: &str) -> Result<()> {
        self.transition(WorkerState::Compiling);

        // Write the source to the module slot
        let slot = self.compiler.persist(code)?;

        // Compile and emit
        let emit = self.compiler.build(self.env.is_checking)?;
        for diagnostic in &emit.diagnostics {
            self.reporter.diagnostic(diagnostic);
        }

        // Swap in the new module only if emission produced one
        match emit.module {
            Some(module) => {
                info!(
                    slot = %slot.display(),
                    digest = %module.digest(),
                    exports = module.exports().count(),
                    "module activated"
                );
                self.active = Some(Rc::new(module));
                Ok(())
            }
            None => Err(WorkerError::Compile {
                diagnostics: emit.diagnostics,
            }),
        }
    }

    /// Call an export of the active module.
    pub fn invoke(&mut self, function: &str, args: &Value) -> Result<Value> {
        self.transition(WorkerState::Invoking);
        let module = self
            .active
            .clone()
            .ok_or_else(|| WorkerError::not_found(function))?;
        let context = SandboxContext {
            environment_id: self.config.environment_id.clone(),
            is_checking: self.env.is_checking,
        };
        debug!(function, hook = self.env.hook.name(), "invoking");
        sandbox::invoke(&module, self.env.hook.as_ref(), function, args, &context)
    }

    /// Apply a partial environment configuration.
    ///
    /// A hook that fails to compile leaves every setting unchanged.
    pub fn configure(&mut self, patch: EnvConfigPatch) -> Result<()> {
        self.transition(WorkerState::Configuring);
        let hook = match &patch.cover_code {
            Some(code) => match self.compiler.compile_hook(code) {
                Ok(hook) => Some(hook),
                Err(err) => {
                    if let WorkerError::Compile { diagnostics } = &err {
                        for diagnostic in diagnostics {
                            self.reporter.diagnostic(diagnostic);
                        }
                    }
                    return Err(err);
                }
            },
            None => None,
        };

        if let Some(is_checking) = patch.is_checking {
            self.env.is_checking = is_checking;
        }
        if let Some(hook) = hook {
            self.env.hook = Box::new(hook);
        }
        info!(is_checking = self.env.is_checking, hook = self.env.hook.name(), "environment configured");
        Ok(())
    }

    /// Enter the terminal state.
    pub fn stop(&mut self) {
        self.transition(WorkerState::Stopped);
    }
}
