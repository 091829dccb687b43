//! Fault reporting and stack trace filtering.
//!
//! Every failure that reaches the harness does so through the error channel
//! as plain text: a header line followed by `at <function> (<location>)`
//! frame lines. Frames located in the user module are always shown; other
//! frames only in verbose mode.

use std::any::Any;
use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, OnceLock};

use regex_lite::Regex;
use rhai::{EvalAltResult, Position};
use tracing::warn;

use crate::compiler::Diagnostic;
use crate::error::WorkerError;

/// Location label of the native frame that enters user code.
pub const WORKER_LOCATION: &str = "<worker>";

/// One stack frame of a rendered trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub function: String,
    /// `file:line:column`, `file`, or a bracketed native label.
    pub location: String,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "    at {} ({})", self.function, self.location)
    }
}

/// A captured stack trace, innermost frame first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trace {
    header: String,
    frames: Vec<Frame>,
}

impl Trace {
    /// A trace with a message and no frames.
    pub fn new(message: impl fmt::Display) -> Self {
        Self {
            header: format!("Error: {}", message),
            frames: Vec::new(),
        }
    }

    pub fn with_frame(mut self, function: impl Into<String>, location: impl Into<String>) -> Self {
        self.frames.push(Frame {
            function: function.into(),
            location: location.into(),
        });
        self
    }

    /// Render an engine error.
    ///
    /// Nested function-call errors are unwound into frames. `entry` is the
    /// function the engine was entered through and always forms the outermost
    /// frame; `locate` maps a function name to the file it was compiled from.
    pub fn from_eval(err: &EvalAltResult, entry: &str, locate: &dyn Fn(&str) -> String) -> Self {
        // (function, file, position of the call made from the caller)
        let mut calls: Vec<(String, String, Position)> = Vec::new();
        let mut leaf = err;
        loop {
            match leaf {
                EvalAltResult::ErrorInFunctionCall(name, _, inner, pos) => {
                    calls.push((name.clone(), locate(name), *pos));
                    leaf = &**inner;
                }
                EvalAltResult::ErrorInModule(path, inner, pos) => {
                    calls.push(("<import>".to_string(), path.clone(), *pos));
                    leaf = &**inner;
                }
                _ => break,
            }
        }
        if calls.first().map_or(true, |(name, _, _)| name != entry) {
            calls.insert(0, (entry.to_string(), locate(entry), Position::NONE));
        }

        let mut trace = Self::new(leaf);
        for i in (0..calls.len()).rev() {
            let (function, file, _) = &calls[i];
            // A frame's position is where execution was inside it: the next
            // call site, or the failing expression for the innermost frame.
            let pos = match calls.get(i + 1) {
                Some((_, _, call_site)) => *call_site,
                None => leaf.position(),
            };
            trace = trace.with_frame(function.clone(), locate_position(file, pos));
        }
        trace.with_frame("invoke", WORKER_LOCATION)
    }

    /// Render a caught panic payload.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::new(format!("worker panicked: {}", message)).with_frame("dispatch", WORKER_LOCATION)
    }

    pub fn header(&self) -> &str {
        &self.header
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.header)?;
        for frame in &self.frames {
            write!(f, "\n{}", frame)?;
        }
        Ok(())
    }
}

fn locate_position(file: &str, pos: Position) -> String {
    match (pos.line(), pos.position()) {
        (Some(line), Some(column)) => format!("{}:{}:{}", file, line, column),
        (Some(line), None) => format!("{}:{}", file, line),
        _ => file.to_string(),
    }
}

/// Result of filtering a trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilteredTrace {
    pub lines: Vec<String>,
    /// Whether any frame was located in the user module.
    pub from_user_code: bool,
}

fn frame_regex() -> &'static Regex {
    static FRAME_RE: OnceLock<Regex> = OnceLock::new();
    FRAME_RE.get_or_init(|| Regex::new(r"^at\s+\S.*\((?P<file>[^()]*?)(?::\d+){0,2}\)$").unwrap())
}

fn is_user_frame(frame: &str, module_marker: &str) -> bool {
    match frame_regex().captures(frame) {
        Some(caps) => {
            let file = &caps["file"];
            file == module_marker
                || file
                    .strip_suffix(module_marker)
                    .is_some_and(|dir| dir.ends_with('/'))
        }
        None => frame.contains(module_marker),
    }
}

/// Keep the lines of `text` the harness should see.
///
/// Non-frame lines are always kept. A frame line (one that starts with
/// `at ` once trimmed) is kept when it is located in the user module, or
/// when `verbose` is set.
pub fn filter_trace(text: &str, module_marker: &str, verbose: bool) -> FilteredTrace {
    let mut lines = Vec::new();
    let mut from_user_code = false;

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("at ") {
            if is_user_frame(trimmed, module_marker) {
                from_user_code = true;
                lines.push(line.to_string());
            } else if verbose {
                lines.push(line.to_string());
            }
        } else {
            lines.push(line.to_string());
        }
    }

    FilteredTrace {
        lines,
        from_user_code,
    }
}

/// Writes diagnostics and filtered traces to the error channel.
pub struct FaultReporter {
    channel: Box<dyn Write>,
    module_marker: String,
    verbose: bool,
}

impl FaultReporter {
    pub fn new(channel: Box<dyn Write>, module_marker: impl Into<String>, verbose: bool) -> Self {
        Self {
            channel,
            module_marker: module_marker.into(),
            verbose,
        }
    }

    /// Reporter writing to the process stderr.
    pub fn stderr(module_marker: impl Into<String>, verbose: bool) -> Self {
        Self::new(Box::new(io::stderr()), module_marker, verbose)
    }

    /// Write one compiler diagnostic.
    pub fn diagnostic(&mut self, diagnostic: &Diagnostic) {
        self.write_lines(&[diagnostic.to_string()]);
    }

    /// Write a filtered trace; returns whether it passed through user code.
    pub fn trace(&mut self, trace: &Trace) -> bool {
        let filtered = filter_trace(&trace.to_string(), &self.module_marker, self.verbose);
        self.write_lines(&filtered.lines);
        filtered.from_user_code
    }

    /// Report a handler error.
    ///
    /// Compile errors have already been written as diagnostics and add
    /// nothing here.
    pub fn report(&mut self, err: &WorkerError) -> bool {
        match err {
            WorkerError::Compile { .. } => false,
            WorkerError::RuntimeFault(trace) => self.trace(trace),
            other => self.trace(&Trace::new(other)),
        }
    }

    fn write_lines(&mut self, lines: &[String]) {
        let result = lines
            .iter()
            .try_for_each(|line| writeln!(self.channel, "{}", line))
            .and_then(|()| self.channel.flush());
        if let Err(e) = result {
            warn!(error = %e, "failed to write to error channel");
        }
    }
}

/// In-memory error channel, shareable across threads.
#[derive(Debug, Clone, Default)]
pub struct MemoryChannel {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, lossily decoded.
    pub fn contents(&self) -> String {
        let buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Write for MemoryChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
