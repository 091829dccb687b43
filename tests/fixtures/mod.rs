//! Test fixtures for control loop tests
//!
//! Starts an in-process worker on its own thread, connected to a harness
//! listening on an ephemeral loopback port.

use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use scriptbox::{Harness, HarnessSession};
use scriptbox_worker::{FaultReporter, MemoryChannel, Worker, WorkerConfig, WorkerError};
use tempfile::TempDir;

/// Upper bound for any single wait on the worker.
pub const TIMEOUT: Duration = Duration::from_secs(10);

pub const ENVIRONMENT_ID: &str = "env-integration";

/// A worker thread plus the harness session talking to it.
pub struct RunningWorker {
    pub session: HarnessSession,
    /// Everything the worker wrote to its error channel.
    pub errors: MemoryChannel,
    dir: TempDir,
    handle: Option<JoinHandle<Result<(), WorkerError>>>,
}

impl RunningWorker {
    pub fn start() -> Self {
        Self::start_with(false)
    }

    pub fn start_verbose() -> Self {
        Self::start_with(true)
    }

    fn start_with(verbose: bool) -> Self {
        let dir = TempDir::new().expect("create module dir");
        let harness = Harness::bind().expect("bind harness");

        let mut config = WorkerConfig::default();
        config.port = harness.port().expect("harness port");
        config.environment_id = ENVIRONMENT_ID.to_string();
        config.verbose = verbose;
        config.toolchain.module_dir = dir.path().to_path_buf();
        config.privileges.enabled = false;

        let errors = MemoryChannel::new();
        let channel = errors.clone();
        let handle = thread::spawn(move || {
            let reporter = FaultReporter::new(
                Box::new(channel),
                config.toolchain.module_name.clone(),
                config.verbose,
            );
            Worker::new(config, reporter).start()
        });

        let session = harness.accept(TIMEOUT).expect("worker connects");
        Self {
            session,
            errors,
            dir,
            handle: Some(handle),
        }
    }

    /// Path of the worker's module slot.
    pub fn slot(&self) -> PathBuf {
        self.dir.path().join("module.rhai")
    }

    /// Wait for the worker thread to finish.
    pub fn join(&mut self) -> Result<(), WorkerError> {
        self.handle
            .take()
            .expect("worker already joined")
            .join()
            .expect("worker thread panicked")
    }
}
