//! Proxy runtime
//!
//! [`Server`] wires the listener, socket bridge, supervisor and shutdown
//! coordinator together and drives them until shutdown or a fatal error.

pub mod listener;
pub mod shutdown;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::proxy::backend::{BackendSnapshot, BackendStatus};
use crate::proxy::bridge::Bridge;
use crate::supervisor::Supervisor;

pub use listener::Listener;
pub use shutdown::{DrainReport, ShutdownHandle, ShutdownState, watch_signals};

/// Summary of a clean run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub drain: DrainReport,
    pub backend: BackendSnapshot,
}

pub struct Server {
    listener: Listener,
    supervisor: Supervisor,
    status: BackendStatus,
    shutdown: ShutdownHandle,
}

impl Server {
    /// Bind the public address and prepare the supervisor
    ///
    /// The backend is not launched until [`Server::run`].
    pub async fn bind(config: ProxyConfig) -> Result<Self> {
        let config = Arc::new(config);
        let shutdown = ShutdownHandle::new();

        let (supervisor, status) = Supervisor::new(Arc::clone(&config), shutdown.drain_token());
        let supervisor = supervisor.with_force_token(shutdown.force_token());
        let bridge = Bridge::new(
            config.backend.clone(),
            status.clone(),
            config.connect_retry,
            shutdown.drain_token(),
        );
        let listener = Listener::bind(
            &config.listen_addr,
            Arc::new(bridge),
            shutdown.clone(),
            config.shutdown_grace,
        )
        .await?;

        Ok(Self {
            listener,
            supervisor,
            status,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn status(&self) -> BackendStatus {
        self.status.clone()
    }

    /// Serve until shutdown completes
    ///
    /// A termination request drains the listener, then stops the backend. A
    /// second request skips the remaining grace of either phase. A fatal
    /// supervisor error tears down connections at once and is returned
    /// after the backend has been cleaned up.
    pub async fn run(self) -> Result<RunReport> {
        let Self {
            listener,
            supervisor,
            shutdown,
            ..
        } = self;

        let halt = supervisor.halt_token();
        let mut serve = tokio::spawn(listener.serve());
        let mut supervise = tokio::spawn(supervisor.run());

        let (drain, backend) = tokio::select! {
            served = &mut serve => {
                halt.cancel();
                let backend = flatten(supervise.await);
                (flatten(served), backend)
            }
            supervised = &mut supervise => {
                let backend = flatten(supervised);
                if backend.is_err() {
                    shutdown.force();
                }
                (flatten(serve.await), backend)
            }
        };

        shutdown.mark_stopped();

        let backend = backend?;
        let drain = drain?;
        tracing::info!(
            completed = drain.completed,
            forced = drain.forced,
            backend = %backend.state,
            restarts = backend.restarts,
            "Shutdown complete"
        );

        Ok(RunReport { drain, backend })
    }
}

fn flatten<T, E>(joined: std::result::Result<std::result::Result<T, E>, tokio::task::JoinError>) -> Result<T>
where
    ProxyError: From<E>,
{
    match joined {
        Ok(result) => result.map_err(ProxyError::from),
        Err(e) => Err(ProxyError::Task(e)),
    }
}
