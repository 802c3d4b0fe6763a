//! Child supervisor
//!
//! Owns the single backend process: launches it, waits until its endpoint
//! accepts connections, restarts it according to the restart policy and
//! stops it on shutdown. Backend state is published through a
//! [`StatusPublisher`]; nothing else writes it.

pub mod process;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::config::{ProxyConfig, RestartPolicy};
use crate::error::SupervisorError;
use crate::proxy::backend::{BackendSnapshot, BackendState, BackendStatus, ExitReason, StatusPublisher, status_channel};

pub use process::BackendProcess;

/// Timeout of a single connect-probe
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(250);

/// Result of one launch attempt
enum Launch {
    Ready,
    Exited(ExitReason),
    Aborted,
}

/// Result of handling an exit
enum Recovery {
    Restarted,
    Settled,
    Aborted,
}

pub struct Supervisor {
    config: Arc<ProxyConfig>,
    publisher: StatusPublisher,
    current: Option<BackendProcess>,
    restarts: u32,
    /// Cancelled when the proxy starts draining
    draining: CancellationToken,
    /// Cancelled when the backend should be stopped
    halt: CancellationToken,
    /// Cancelled when stopping must skip the grace period
    force: CancellationToken,
}

impl Supervisor {
    pub fn new(config: Arc<ProxyConfig>, draining: CancellationToken) -> (Self, BackendStatus) {
        let (publisher, status) = status_channel();
        let supervisor = Self {
            config,
            publisher,
            current: None,
            restarts: 0,
            draining,
            halt: CancellationToken::new(),
            force: CancellationToken::new(),
        };
        (supervisor, status)
    }

    pub fn status(&self) -> BackendStatus {
        self.publisher.subscribe()
    }

    pub fn snapshot(&self) -> BackendSnapshot {
        self.publisher.snapshot()
    }

    /// Token that ends [`Supervisor::monitor`] when cancelled
    pub fn halt_token(&self) -> CancellationToken {
        self.halt.clone()
    }

    /// Share the token that cuts [`Supervisor::stop`]'s grace period short
    pub fn with_force_token(mut self, force: CancellationToken) -> Self {
        self.force = force;
        self
    }

    /// Launch the backend and wait until it accepts connections
    ///
    /// A backend that dies before becoming ready goes through the restart
    /// policy like any other exit.
    pub async fn start(&mut self) -> Result<(), SupervisorError> {
        if self.current.is_some() {
            return Err(SupervisorError::AlreadyRunning);
        }

        let reason = match self.launch().await? {
            Launch::Ready => return Ok(()),
            Launch::Aborted => return Err(SupervisorError::Aborted),
            Launch::Exited(reason) => reason,
        };

        match self.recover(reason).await? {
            Recovery::Restarted => Ok(()),
            Recovery::Aborted => Err(SupervisorError::Aborted),
            Recovery::Settled => {
                let snap = self.publisher.snapshot();
                Err(SupervisorError::BackendExited {
                    reason: snap.last_exit.unwrap_or(reason),
                    state: snap.state,
                    restarts: snap.restarts,
                })
            }
        }
    }

    /// Watch the backend until halted, restarting it on unexpected exits
    ///
    /// Returns an error only when the backend cannot be kept alive: restart
    /// budget exhausted or a restart that never became ready.
    pub async fn monitor(&mut self) -> Result<(), SupervisorError> {
        loop {
            let Some(process) = self.current.as_mut() else {
                // nothing left to watch
                self.halt.cancelled().await;
                return Ok(());
            };

            let status = tokio::select! {
                _ = self.halt.cancelled() => return Ok(()),
                status = process.wait() => status?,
            };

            let reason = ExitReason::from(status);
            match self.recover(reason).await? {
                Recovery::Restarted => continue,
                Recovery::Settled => {
                    self.halt.cancelled().await;
                    return Ok(());
                }
                Recovery::Aborted => return Ok(()),
            }
        }
    }

    /// Terminate the backend: SIGTERM, grace period, then SIGKILL
    ///
    /// Idempotent.
    pub async fn stop(&mut self) -> Result<(), SupervisorError> {
        let Some(mut process) = self.current.take() else {
            if self.publisher.state() != BackendState::Crashed {
                self.publisher.set_state(BackendState::Stopped);
            }
            self.cleanup_socket();
            return Ok(());
        };

        self.publisher.set_state(BackendState::Stopping);
        tracing::info!(
            pid = process.pid(),
            grace_ms = self.config.shutdown_grace.as_millis() as u64,
            "Stopping backend"
        );

        let result = process.terminate(self.config.shutdown_grace, &self.force).await;
        match &result {
            Ok(reason) => {
                self.publisher.mark_exited(*reason, BackendState::Stopped);
                tracing::info!(exit = %reason, uptime_ms = process.uptime().as_millis() as u64, "Backend stopped");
            }
            Err(_) => self.publisher.set_state(BackendState::Stopped),
        }
        // process is dropped here, which kills it if terminate failed midway
        drop(process);

        self.cleanup_socket();
        result.map(|_| ())
    }

    /// Full lifecycle: start, monitor until halted, stop
    ///
    /// The backend is stopped even when starting or monitoring fails.
    pub async fn run(mut self) -> Result<BackendSnapshot, SupervisorError> {
        let outcome = match self.start().await {
            Ok(()) => self.monitor().await,
            Err(e) if !e.is_fatal() => {
                tracing::info!(reason = %e, "Backend startup interrupted");
                Ok(())
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &outcome {
            let snap = self.publisher.snapshot();
            tracing::error!(
                error = %e,
                state = %snap.state,
                restarts = snap.restarts,
                "Supervisor giving up"
            );
        }

        if let Err(e) = self.stop().await {
            tracing::warn!(error = %e, "Failed to stop backend cleanly");
        }

        outcome.map(|()| self.publisher.snapshot())
    }

    /// Spawn a backend instance and probe its endpoint until ready
    async fn launch(&mut self) -> Result<Launch, SupervisorError> {
        self.cleanup_socket();

        let process = BackendProcess::spawn(&self.config)?;
        self.publisher.mark_starting(process.pid());
        tracing::info!(
            pid = process.pid(),
            command = %self.config.command_line(),
            endpoint = %self.config.backend,
            "Backend launched"
        );

        let process = self.current.insert(process);
        let deadline = Instant::now() + self.config.startup_timeout;

        loop {
            if self.config.backend.probe(PROBE_TIMEOUT).await {
                self.publisher.set_state(BackendState::Ready);
                tracing::info!(pid = process.pid(), endpoint = %self.config.backend, "Backend ready");
                return Ok(Launch::Ready);
            }

            tokio::select! {
                biased;
                _ = self.halt.cancelled() => return Ok(Launch::Aborted),
                _ = self.draining.cancelled() => return Ok(Launch::Aborted),
                status = process.wait() => return Ok(Launch::Exited(status?.into())),
                _ = sleep_until(deadline) => {
                    return Err(SupervisorError::StartupTimeout {
                        timeout: self.config.startup_timeout,
                        state: self.publisher.state(),
                        restarts: self.restarts,
                    });
                }
                _ = sleep(self.config.probe_interval) => {}
            }
        }
    }

    /// Apply the restart policy to an exit, relaunching as needed
    async fn recover(&mut self, mut reason: ExitReason) -> Result<Recovery, SupervisorError> {
        loop {
            self.current = None;

            if self.draining.is_cancelled() || self.halt.is_cancelled() {
                self.publisher.mark_exited(reason, BackendState::Stopped);
                tracing::info!(exit = %reason, "Backend exited during shutdown");
                return Ok(Recovery::Settled);
            }

            let policy = self.config.restart_policy;
            if !policy.should_restart(&reason) {
                let state = if policy == RestartPolicy::Never || !reason.success() {
                    BackendState::Crashed
                } else {
                    BackendState::Stopped
                };
                self.publisher.mark_exited(reason, state);
                tracing::warn!(
                    exit = %reason,
                    policy = %policy,
                    state = %state,
                    "Backend exited and will not be restarted, no longer routing connections"
                );
                return Ok(Recovery::Settled);
            }

            if self.restarts >= self.config.max_restarts {
                self.publisher.mark_exited(reason, BackendState::Crashed);
                return Err(SupervisorError::RestartBudgetExhausted {
                    restarts: self.restarts,
                    last_exit: reason,
                    state: BackendState::Crashed,
                });
            }

            self.restarts += 1;
            self.publisher.mark_exited(reason, BackendState::Starting);
            self.publisher.set_restarts(self.restarts);
            tracing::warn!(
                exit = %reason,
                restart = self.restarts,
                max_restarts = self.config.max_restarts,
                backoff_ms = self.config.restart_backoff.as_millis() as u64,
                "Backend exited, restarting"
            );

            tokio::select! {
                biased;
                _ = self.halt.cancelled() => return Ok(Recovery::Aborted),
                _ = self.draining.cancelled() => return Ok(Recovery::Aborted),
                _ = sleep(self.config.restart_backoff) => {}
            }

            match self.launch().await? {
                Launch::Ready => return Ok(Recovery::Restarted),
                Launch::Aborted => return Ok(Recovery::Aborted),
                Launch::Exited(next) => reason = next,
            }
        }
    }

    fn cleanup_socket(&self) {
        match self.config.backend.remove_stale_socket() {
            Ok(true) => tracing::debug!(endpoint = %self.config.backend, "Removed backend socket file"),
            Ok(false) => {}
            Err(e) => tracing::warn!(endpoint = %self.config.backend, error = %e, "Failed to remove backend socket file"),
        }
    }
}

