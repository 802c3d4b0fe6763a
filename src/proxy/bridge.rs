//! Socket bridge
//!
//! Dials the backend for each accepted client and splices the two sockets.
//! A client that shows up while the backend is still starting is held until
//! the backend is ready or the connect-retry window runs out. Once the
//! supervisor has given up on the backend, clients are turned away at once.

use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{sleep, sleep_until, timeout_at};
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;
use crate::proxy::backend::BackendStatus;
use crate::proxy::connection::{Connection, ConnectionStats};
use crate::proxy::endpoint::{BackendStream, Endpoint};

/// Pause between dial attempts when the backend reports ready but refuses
const DIAL_RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// Forwards client connections to the backend endpoint
#[derive(Debug, Clone)]
pub struct Bridge {
    endpoint: Endpoint,
    status: BackendStatus,
    connect_retry: Duration,
    abort: CancellationToken,
}

impl Bridge {
    /// Create a bridge
    ///
    /// `abort` is cancelled when the proxy starts draining; dials still
    /// waiting for the backend give up at that point.
    pub fn new(
        endpoint: Endpoint,
        status: BackendStatus,
        connect_retry: Duration,
        abort: CancellationToken,
    ) -> Self {
        Self {
            endpoint,
            status,
            connect_retry,
            abort,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Forward one client connection for its whole lifetime
    ///
    /// If the backend cannot be reached the client is dropped, which closes
    /// its socket.
    pub async fn forward<S>(&self, id: u64, peer: &str, client: S) -> Result<ConnectionStats, BridgeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let backend = self.dial().await?;

        tracing::debug!(conn = id, peer, backend = %self.endpoint, "Connected to backend");

        let stats = Connection::new(id, peer, client, backend).run().await?;
        Ok(stats)
    }

    /// Open a backend connection, waiting for readiness within the retry window
    async fn dial(&self) -> Result<BackendStream, BridgeError> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.connect_retry;
        let mut status = self.status.clone();

        let unavailable = || BridgeError::BackendUnavailable {
            endpoint: self.endpoint.to_string(),
            waited: started.elapsed(),
        };

        loop {
            if !status.is_ready() {
                tracing::debug!(state = %status.state(), "Backend not ready, holding connection");
            }

            let ready = tokio::select! {
                biased;
                _ = self.abort.cancelled() => return Err(BridgeError::ShuttingDown),
                _ = sleep_until(deadline) => return Err(unavailable()),
                ready = status.wait_ready() => ready,
            };
            if !ready {
                return Err(unavailable());
            }

            match timeout_at(deadline, self.endpoint.connect()).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => {
                    tracing::debug!(backend = %self.endpoint, error = %e, "Backend dial failed, retrying");
                }
                Err(_) => return Err(unavailable()),
            }

            tokio::select! {
                biased;
                _ = self.abort.cancelled() => return Err(BridgeError::ShuttingDown),
                _ = sleep_until(deadline) => return Err(unavailable()),
                _ = sleep(DIAL_RETRY_INTERVAL) => {}
            }
        }
    }
}
