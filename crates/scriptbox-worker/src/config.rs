//! Worker configuration.
//!
//! Launch parameters come from the command line; everything else may be
//! supplied in an optional TOML file. Missing keys fall back to defaults.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use scriptbox_protocol::DEFAULT_MAX_FRAME_BYTES;
use serde::Deserialize;

use crate::error::{Result, WorkerError};

/// Worker configuration settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Harness host to dial back to.
    pub host: IpAddr,
    /// Harness port (launch parameter).
    pub port: u16,
    /// Opaque environment identifier echoed in the greeting.
    pub environment_id: String,
    /// Show every stack frame instead of only user-module frames.
    pub verbose: bool,
    /// Largest inbound record accepted by the framing layer.
    pub max_frame_bytes: usize,
    pub toolchain: ToolchainOptions,
    pub privileges: PrivilegeConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            environment_id: String::new(),
            verbose: false,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            toolchain: ToolchainOptions::default(),
            privileges: PrivilegeConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            WorkerError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| WorkerError::Config(e.to_string()))
    }

    /// Address of the harness endpoint.
    pub fn harness_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Reject configurations the worker cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(WorkerError::Config("harness port must be non-zero".to_string()));
        }
        if self.toolchain.module_name.is_empty() {
            return Err(WorkerError::Config("toolchain.module_name must not be empty".to_string()));
        }
        if self.max_frame_bytes == 0 {
            return Err(WorkerError::Config("max_frame_bytes must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Fixed toolchain options applied to every compilation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolchainOptions {
    /// Directory holding the module slot.
    pub module_dir: PathBuf,
    /// File name of the module slot. Stack frames naming this file are
    /// treated as user frames.
    pub module_name: String,
    /// Reject references to undeclared variables at compile time.
    pub strict_variables: bool,
    /// Skip emission when module evaluation reports an error.
    pub no_emit_on_error: bool,
    /// Tag compiled units with the module file name so runtime positions
    /// map back to the slot.
    pub inline_source_names: bool,
    /// Root directory for resolving `import` statements.
    pub base_path: Option<PathBuf>,
    /// Maximum function call nesting.
    pub max_call_levels: Option<usize>,
    /// Maximum operations per evaluation; unlimited when unset.
    pub max_operations: Option<u64>,
}

impl Default for ToolchainOptions {
    fn default() -> Self {
        Self {
            module_dir: PathBuf::from("."),
            module_name: "module.rhai".to_string(),
            strict_variables: true,
            no_emit_on_error: true,
            inline_source_names: true,
            base_path: None,
            max_call_levels: None,
            max_operations: None,
        }
    }
}

impl ToolchainOptions {
    /// Path of the module slot.
    pub fn module_slot(&self) -> PathBuf {
        self.module_dir.join(&self.module_name)
    }
}

/// Identity the worker drops to before touching user code.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrivilegeConfig {
    /// Disabling the drop is only meant for local development.
    pub enabled: bool,
    pub user: String,
    pub group: String,
}

impl Default for PrivilegeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            user: "nobody".to_string(),
            group: "nogroup".to_string(),
        }
    }
}
