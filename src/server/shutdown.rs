//! Shutdown coordination
//!
//! `Running -> Draining -> Stopped`. The first termination request starts a
//! drain: the listener stops accepting and in-flight connections get the
//! grace period to finish. A second request while draining cuts the grace
//! period short.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for ShutdownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShutdownState::Running => "running",
            ShutdownState::Draining => "draining",
            ShutdownState::Stopped => "stopped",
        })
    }
}

/// Outcome of draining in-flight connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Connections open when the drain began
    pub in_flight: usize,
    /// Connections that finished on their own
    pub completed: usize,
    /// Connections closed by force
    pub forced: usize,
    pub elapsed: Duration,
}

#[derive(Debug)]
struct Inner {
    state: watch::Sender<ShutdownState>,
    drain: CancellationToken,
    force: CancellationToken,
}

/// Cloneable handle to the shutdown state machine
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    inner: Arc<Inner>,
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ShutdownState::Running);
        Self {
            inner: Arc::new(Inner {
                state,
                drain: CancellationToken::new(),
                force: CancellationToken::new(),
            }),
        }
    }

    pub fn state(&self) -> ShutdownState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.inner.state.subscribe()
    }

    /// Token cancelled once draining begins
    pub fn drain_token(&self) -> CancellationToken {
        self.inner.drain.clone()
    }

    /// Token cancelled once teardown is forced
    pub fn force_token(&self) -> CancellationToken {
        self.inner.force.clone()
    }

    pub fn is_forced(&self) -> bool {
        self.inner.force.is_cancelled()
    }

    /// Handle a termination request
    ///
    /// Running starts a drain; a request while already draining forces
    /// immediate teardown. Returns the state after the request.
    pub fn trigger(&self) -> ShutdownState {
        let mut previous = ShutdownState::Running;
        self.inner.state.send_modify(|state| {
            previous = *state;
            if *state == ShutdownState::Running {
                *state = ShutdownState::Draining;
            }
        });

        match previous {
            ShutdownState::Running => {
                tracing::info!("Termination requested, draining connections");
                self.inner.drain.cancel();
            }
            ShutdownState::Draining => {
                tracing::warn!("Second termination request, forcing shutdown");
                self.inner.force.cancel();
            }
            ShutdownState::Stopped => {}
        }

        self.state()
    }

    /// Tear down without a grace period
    pub fn force(&self) {
        self.inner.state.send_if_modified(|state| {
            if *state == ShutdownState::Running {
                *state = ShutdownState::Draining;
                true
            } else {
                false
            }
        });
        self.inner.drain.cancel();
        self.inner.force.cancel();
    }

    pub fn mark_stopped(&self) {
        self.inner.state.send_replace(ShutdownState::Stopped);
        // anything still waiting on the drain must not block past this point
        self.inner.drain.cancel();
    }

    /// Resolves once draining has begun
    pub async fn draining(&self) {
        self.inner.drain.cancelled().await
    }

    /// Let in-flight tasks finish within `grace`, then abort the rest
    ///
    /// Returns early when every task is done or teardown is forced.
    pub async fn drain<T: 'static>(&self, tasks: &mut JoinSet<T>, grace: Duration) -> DrainReport {
        let started = Instant::now();
        let in_flight = tasks.len();
        let mut completed = 0;

        if in_flight > 0 {
            tracing::info!(in_flight, grace_ms = grace.as_millis() as u64, "Waiting for connections to finish");
        }

        let deadline = sleep(grace);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = self.inner.force.cancelled() => break,
                _ = &mut deadline => break,
                next = tasks.join_next() => match next {
                    Some(Err(e)) if e.is_panic() => {
                        tracing::error!(error = %e, "Connection task panicked");
                        completed += 1;
                    }
                    Some(_) => completed += 1,
                    None => break,
                },
            }
        }

        let forced = tasks.len();
        if forced > 0 {
            tracing::warn!(forced, "Force-closing connections still open");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        DrainReport {
            in_flight,
            completed,
            forced,
            elapsed: started.elapsed(),
        }
    }
}

/// Feed SIGINT and SIGTERM into the coordinator until it stops
pub async fn watch_signals(handle: ShutdownHandle) -> std::io::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    loop {
        let name = tokio::select! {
            _ = terminate.recv() => "SIGTERM",
            _ = interrupt.recv() => "SIGINT",
        };
        tracing::info!(signal = name, "Termination signal received");

        if handle.trigger() == ShutdownState::Stopped {
            return Ok(());
        }
    }
}
