//! Harness side of the control connection.
//!
//! The harness listens on the loopback interface, launches a worker with
//! the listening port, and accepts the worker's connection. Every session
//! starts with the worker's `connected` greeting.

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::path::Path;
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use scriptbox_protocol::{
    encode_frame, Action, CommandRecord, EnvConfigPatch, FrameDecoder, ProtocolError, Response,
    Status, LOOPBACK_HOST,
};
use serde_json::{json, Value};
use tracing::{debug, trace};

const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Harness errors
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Invalid response JSON: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Worker did not connect within {0:?}")]
    Timeout(Duration),

    #[error("Expected connected greeting, got {0:?}")]
    UnexpectedGreeting(Status),

    #[error("Connection closed by worker")]
    Closed,
}

pub type HarnessResult<T> = Result<T, HarnessError>;

/// Listening endpoint a worker dials back to.
pub struct Harness {
    listener: TcpListener,
}

impl Harness {
    /// Listen on an ephemeral loopback port.
    pub fn bind() -> HarnessResult<Self> {
        Self::bind_port(0)
    }

    pub fn bind_port(port: u16) -> HarnessResult<Self> {
        let listener = TcpListener::bind((LOOPBACK_HOST, port))?;
        Ok(Self { listener })
    }

    pub fn port(&self) -> HarnessResult<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Command line launching `binary` against this harness.
    pub fn worker_command(&self, binary: &Path, environment_id: &str) -> HarnessResult<Command> {
        let mut command = Command::new(binary);
        command.arg(self.port()?.to_string()).arg(environment_id);
        Ok(command)
    }

    /// Wait for a worker to connect and read its greeting.
    ///
    /// `timeout` bounds the wait for the connection and every later read
    /// on the session.
    pub fn accept(&self, timeout: Duration) -> HarnessResult<HarnessSession> {
        self.listener.set_nonblocking(true)?;
        let started = Instant::now();
        let stream = loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "worker connected");
                    break stream;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if started.elapsed() >= timeout {
                        return Err(HarnessError::Timeout(timeout));
                    }
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => return Err(e.into()),
            }
        };
        self.listener.set_nonblocking(false)?;

        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;

        let mut session = HarnessSession {
            stream,
            decoder: FrameDecoder::new(),
            pending: VecDeque::new(),
            environment_id: String::new(),
            pid: 0,
        };
        let greeting = session.recv()?;
        if greeting.status != Status::Connected {
            return Err(HarnessError::UnexpectedGreeting(greeting.status));
        }
        session.environment_id = greeting.environment_id.unwrap_or_default();
        session.pid = greeting.pid.unwrap_or_default();
        Ok(session)
    }
}

/// One accepted worker connection.
pub struct HarnessSession {
    stream: TcpStream,
    decoder: FrameDecoder,
    pending: VecDeque<Vec<u8>>,
    environment_id: String,
    pid: u32,
}

impl HarnessSession {
    /// Environment id from the greeting.
    pub fn environment_id(&self) -> &str {
        &self.environment_id
    }

    /// Worker process id from the greeting.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Send one command record.
    pub fn send(&mut self, record: &CommandRecord) -> HarnessResult<()> {
        let bytes = encode_frame(record)?;
        self.send_raw(&bytes)
    }

    /// Write bytes verbatim.
    pub fn send_raw(&mut self, bytes: &[u8]) -> HarnessResult<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()?;
        trace!(bytes = bytes.len(), "sent");
        Ok(())
    }

    /// Read the next response.
    pub fn recv(&mut self) -> HarnessResult<Response> {
        let mut buffer = [0u8; 8192];
        while self.pending.is_empty() {
            let n = match self.stream.read(&mut buffer) {
                Ok(0) => return Err(HarnessError::Closed),
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::ConnectionReset => return Err(HarnessError::Closed),
                Err(e) => return Err(e.into()),
            };
            for frame in self.decoder.feed(&buffer[..n]) {
                self.pending.push_back(frame?);
            }
        }
        match self.pending.pop_front() {
            Some(frame) => serde_json::from_slice(&frame).map_err(HarnessError::Decode),
            None => Err(HarnessError::Closed),
        }
    }

    /// Send a record and read its response.
    pub fn request(&mut self, record: &CommandRecord) -> HarnessResult<Response> {
        self.send(record)?;
        self.recv()
    }

    /// Replace the worker's module.
    pub fn run_code(&mut self, code: &str) -> HarnessResult<Response> {
        self.request(&CommandRecord::new(Action::RunCode, json!({ "code": code })))
    }

    /// Call an export of the worker's module.
    pub fn run_function(&mut self, name: &str, args: Value) -> HarnessResult<Response> {
        self.request(&CommandRecord::new(
            Action::RunFunction,
            json!({ "function_name": name, "function_args": args }),
        ))
    }

    /// Apply a partial environment configuration.
    pub fn configure(&mut self, env_config: EnvConfigPatch) -> HarnessResult<Response> {
        self.request(&CommandRecord::new(
            Action::Config,
            json!({ "env_config": env_config }),
        ))
    }

    /// Ask the worker to stop. No response is sent back.
    pub fn stop(&mut self) -> HarnessResult<()> {
        self.send(&CommandRecord::new(Action::Stop, json!({})))
    }

    /// Close the sending side; the worker sees end of stream.
    pub fn close(&self) -> HarnessResult<()> {
        self.stream.shutdown(Shutdown::Write)?;
        Ok(())
    }
}
