//! Worker binary tests
//!
//! Launches the real `scriptbox-worker` executable through the harness and
//! checks the command line and TOML override paths.

use std::path::Path;
use std::process::{Child, Stdio};
use std::time::Duration;

use scriptbox::{Harness, HarnessSession, Response};
use serde_json::json;
use tempfile::TempDir;

const TIMEOUT: Duration = Duration::from_secs(20);

const ENVIRONMENT_ID: &str = "env-binary";

/// Kills the worker if a test fails before it exits.
struct WorkerProcess(Option<Child>);

impl WorkerProcess {
    fn wait_stderr(mut self) -> (bool, String) {
        let child = self.0.take().expect("worker already reaped");
        let output = child.wait_with_output().expect("wait for worker");
        (
            output.status.success(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        )
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if let Some(child) = self.0.as_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

fn launch(workdir: &Path, extra: &[&str]) -> (WorkerProcess, HarnessSession) {
    let harness = Harness::bind().unwrap();
    let mut command = harness
        .worker_command(Path::new(env!("CARGO_BIN_EXE_scriptbox-worker")), ENVIRONMENT_ID)
        .unwrap();
    command
        .arg("--keep-privileges")
        .arg("--workdir")
        .arg(workdir)
        .args(extra)
        .env_remove("RUST_LOG")
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    let process = WorkerProcess(Some(command.spawn().unwrap()));
    let session = harness.accept(TIMEOUT).unwrap();
    (process, session)
}

#[test]
fn test_binary_greets_and_serves() {
    let dir = TempDir::new().unwrap();
    let (process, mut session) = launch(dir.path(), &[]);

    assert_eq!(session.environment_id(), ENVIRONMENT_ID);
    assert_ne!(session.pid(), std::process::id());

    assert_eq!(session.run_code("fn add(a) { a.x + a.y }").unwrap(), Response::compiled());
    assert_eq!(
        session.run_function("add", json!({"x": 2, "y": 3})).unwrap(),
        Response::success(json!(5))
    );
    assert!(dir.path().join("module.rhai").exists());

    session.stop().unwrap();
    let (success, _) = process.wait_stderr();
    assert!(success);
}

#[test]
fn test_binary_reports_diagnostics_on_stderr() {
    let dir = TempDir::new().unwrap();
    let (process, mut session) = launch(dir.path(), &[]);

    assert_eq!(session.run_code("fn broken(a) {").unwrap(), Response::fail());
    session.close().unwrap();

    let (success, stderr) = process.wait_stderr();
    assert!(success);
    assert!(stderr.lines().any(|l| l.starts_with("1,")), "unexpected stderr: {}", stderr);
}

#[test]
fn test_binary_applies_toml_config() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("worker.toml");
    std::fs::write(&config, "[toolchain]\nmodule_name = \"entry.rhai\"\n").unwrap();

    let (process, mut session) = launch(dir.path(), &["--config", config.to_str().unwrap()]);

    session.run_code("fn id(a) { a }").unwrap();
    assert!(dir.path().join("entry.rhai").exists());
    assert!(!dir.path().join("module.rhai").exists());

    session.stop().unwrap();
    let (success, _) = process.wait_stderr();
    assert!(success);
}
