//! Backend state tracking
//!
//! The supervisor is the only writer of backend state. It holds the
//! [`StatusPublisher`]; everything else gets a [`BackendStatus`], a cheap
//! read-only view that can be cloned into each forwarding task.

use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use tokio::sync::watch;

/// Lifecycle state of the supervised backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    /// Launched, waiting for the endpoint to accept connections
    Starting,
    /// Accepting connections
    Ready,
    /// Exited and will not be restarted
    Crashed,
    /// Termination requested by the proxy
    Stopping,
    /// No backend process
    Stopped,
}

impl BackendState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendState::Starting => "starting",
            BackendState::Ready => "ready",
            BackendState::Crashed => "crashed",
            BackendState::Stopping => "stopping",
            BackendState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a backend process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Code(i32),
    Signal(i32),
}

impl ExitReason {
    pub fn success(&self) -> bool {
        matches!(self, ExitReason::Code(0))
    }
}

impl From<ExitStatus> for ExitReason {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ExitReason::Code(code),
            (None, Some(signal)) => ExitReason::Signal(signal),
            (None, None) => ExitReason::Code(-1),
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Code(code) => write!(f, "exit code {}", code),
            ExitReason::Signal(signal) => write!(f, "signal {}", signal),
        }
    }
}

/// Point-in-time view of the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSnapshot {
    pub state: BackendState,
    /// Automatic restarts performed so far
    pub restarts: u32,
    pub last_exit: Option<ExitReason>,
    pub pid: Option<u32>,
}

impl BackendSnapshot {
    /// The backend exited and the supervisor will not bring it back
    ///
    /// A `Stopped` state with no exit recorded means nothing was launched yet.
    pub fn is_settled(&self) -> bool {
        match self.state {
            BackendState::Crashed => true,
            BackendState::Stopped => self.last_exit.is_some(),
            _ => false,
        }
    }
}

impl Default for BackendSnapshot {
    fn default() -> Self {
        Self {
            state: BackendState::Stopped,
            restarts: 0,
            last_exit: None,
            pid: None,
        }
    }
}

/// Create a publisher and its first reader
pub fn status_channel() -> (StatusPublisher, BackendStatus) {
    let (tx, rx) = watch::channel(BackendSnapshot::default());
    (StatusPublisher { tx }, BackendStatus { rx })
}

/// Write side of the backend status, owned by the supervisor
#[derive(Debug)]
pub struct StatusPublisher {
    tx: watch::Sender<BackendSnapshot>,
}

impl StatusPublisher {
    pub fn snapshot(&self) -> BackendSnapshot {
        self.tx.borrow().clone()
    }

    pub fn state(&self) -> BackendState {
        self.tx.borrow().state
    }

    pub fn subscribe(&self) -> BackendStatus {
        BackendStatus {
            rx: self.tx.subscribe(),
        }
    }

    pub fn set_state(&self, state: BackendState) {
        self.tx.send_if_modified(|snap| {
            let changed = snap.state != state;
            snap.state = state;
            changed
        });
    }

    /// A fresh process was launched
    pub fn mark_starting(&self, pid: Option<u32>) {
        self.tx.send_modify(|snap| {
            snap.state = BackendState::Starting;
            snap.pid = pid;
        });
    }

    /// The process is gone; `state` is where it settles
    pub fn mark_exited(&self, reason: ExitReason, state: BackendState) {
        self.tx.send_modify(|snap| {
            snap.state = state;
            snap.pid = None;
            snap.last_exit = Some(reason);
        });
    }

    pub fn set_restarts(&self, restarts: u32) {
        self.tx.send_modify(|snap| snap.restarts = restarts);
    }
}

/// Read-only backend status handed to the socket bridge
#[derive(Debug, Clone)]
pub struct BackendStatus {
    rx: watch::Receiver<BackendSnapshot>,
}

impl BackendStatus {
    pub fn is_ready(&self) -> bool {
        self.rx.borrow().state == BackendState::Ready
    }

    pub fn state(&self) -> BackendState {
        self.rx.borrow().state
    }

    pub fn snapshot(&self) -> BackendSnapshot {
        self.rx.borrow().clone()
    }

    /// Wait until the backend is ready
    ///
    /// Returns `false` without waiting further once the backend has settled
    /// for good, or if the supervisor went away.
    pub async fn wait_ready(&mut self) -> bool {
        match self
            .rx
            .wait_for(|snap| snap.state == BackendState::Ready || snap.is_settled())
            .await
        {
            Ok(snap) => snap.state == BackendState::Ready,
            Err(_) => false,
        }
    }

    /// Wait for the next state change of any kind
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}
