//! Error types
//!
//! Per-connection failures ([`BridgeError`]) are logged and dropped. Supervisor
//! and listener failures bubble up through [`ProxyError`] and end the process.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use nix::errno::Errno;
use thiserror::Error;

use crate::proxy::backend::{BackendState, ExitReason};

/// Configuration could not be loaded or is invalid
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("invalid backend endpoint {input:?}: {reason}")]
    Endpoint { input: String, reason: String },
}

/// Failures of the child supervisor
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("backend command is empty")]
    EmptyCommand,

    #[error("failed to launch backend `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("backend did not become ready within {timeout:?} (state: {state}, restarts: {restarts})")]
    StartupTimeout {
        timeout: Duration,
        state: BackendState,
        restarts: u32,
    },

    #[error("backend exited before becoming ready with {reason} (state: {state}, restarts: {restarts})")]
    BackendExited {
        reason: ExitReason,
        state: BackendState,
        restarts: u32,
    },

    #[error("restart budget exhausted after {restarts} restarts, last exit: {last_exit} (state: {state})")]
    RestartBudgetExhausted {
        restarts: u32,
        last_exit: ExitReason,
        state: BackendState,
    },

    #[error("backend is already running")]
    AlreadyRunning,

    #[error("backend startup aborted by shutdown")]
    Aborted,

    #[error("failed to signal backend: {0}")]
    Signal(#[from] Errno),

    #[error("I/O error while supervising backend: {0}")]
    Io(#[from] io::Error),
}

impl SupervisorError {
    /// Whether this error should terminate the proxy
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SupervisorError::Aborted)
    }
}

/// Failure of a single forwarded connection
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("backend {endpoint} unavailable after waiting {waited:?}")]
    BackendUnavailable { endpoint: String, waited: Duration },

    #[error("proxy is shutting down, backend was never reached")]
    ShuttingDown,

    #[error("forwarding failed: {0}")]
    Io(#[from] io::Error),
}

/// Top-level proxy error
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to bind listener on {addr}: {source}")]
    ListenerBind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("listener failed: {0}")]
    Accept(#[source] io::Error),

    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T, E = ProxyError> = std::result::Result<T, E>;
