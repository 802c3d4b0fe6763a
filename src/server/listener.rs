use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::info;

use crate::error::{BridgeError, ProxyError};
use crate::proxy::bridge::Bridge;
use crate::server::shutdown::{DrainReport, ShutdownHandle};

/// Pause after a transient accept error
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct Listener {
    inner: TcpListener,
    bridge: Arc<Bridge>,
    shutdown: ShutdownHandle,
    grace: Duration,
}

impl Listener {
    pub async fn bind(
        addr: &str,
        bridge: Arc<Bridge>,
        shutdown: ShutdownHandle,
        grace: Duration,
    ) -> Result<Self, ProxyError> {
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::ListenerBind {
                addr: addr.to_string(),
                source,
            })?;

        Ok(Self {
            inner,
            bridge,
            shutdown,
            grace,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accept until draining begins, then drain in-flight connections
    ///
    /// Each connection is forwarded on its own task. A fatal accept error
    /// forces shutdown and is returned once connections are torn down.
    pub async fn serve(self) -> Result<DrainReport, ProxyError> {
        let Self {
            inner,
            bridge,
            shutdown,
            grace,
        } = self;

        let draining = shutdown.drain_token();
        let mut tasks = JoinSet::new();
        let mut next_id: u64 = 0;

        if let Ok(addr) = inner.local_addr() {
            info!("Listening on {}, forwarding to {}", addr, bridge.endpoint());
        }

        let failure = loop {
            while let Some(result) = tasks.try_join_next() {
                if let Err(e) = result {
                    tracing::error!("Connection task error: {}", e);
                }
            }

            let accepted = tokio::select! {
                biased;
                _ = draining.cancelled() => break None,
                accepted = inner.accept() => accepted,
            };

            match accepted {
                Ok((socket, peer)) => {
                    next_id += 1;
                    let id = next_id;
                    let bridge = Arc::clone(&bridge);
                    if let Err(e) = socket.set_nodelay(true) {
                        tracing::debug!(conn = id, %peer, error = %e, "Failed to set TCP_NODELAY");
                    }

                    tracing::debug!(conn = id, %peer, "Accepted connection");

                    tasks.spawn(async move {
                        let peer = peer.to_string();
                        match bridge.forward(id, &peer, socket).await {
                            Ok(stats) => info!(
                                conn = id,
                                peer = %peer,
                                up = stats.client_to_backend,
                                down = stats.backend_to_client,
                                elapsed_ms = stats.duration.as_millis() as u64,
                                "Connection closed"
                            ),
                            Err(BridgeError::ShuttingDown) => {
                                tracing::debug!(conn = id, peer = %peer, "Connection dropped during shutdown");
                            }
                            Err(e) => tracing::warn!(conn = id, peer = %peer, error = %e, "Connection failed"),
                        }
                    });
                }
                Err(e) if is_transient(&e) => {
                    tracing::warn!(error = %e, backoff_ms = ACCEPT_BACKOFF.as_millis() as u64, "Transient accept error");
                    tokio::select! {
                        _ = draining.cancelled() => break None,
                        _ = sleep(ACCEPT_BACKOFF) => {}
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Listener failed");
                    shutdown.force();
                    break Some(e);
                }
            }
        };

        // stop accepting before waiting on connections
        drop(inner);

        let report = shutdown.drain(&mut tasks, grace).await;
        info!(
            completed = report.completed,
            forced = report.forced,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Listener drained"
        );

        match failure {
            Some(e) => Err(ProxyError::Accept(e)),
            None => Ok(report),
        }
    }
}

/// Accept errors worth retrying: per-connection failures and resource exhaustion
pub fn is_transient(err: &io::Error) -> bool {
    let by_kind = matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    );

    by_kind
        || err.raw_os_error().map(Errno::from_raw).is_some_and(|errno| {
            matches!(
                errno,
                Errno::EMFILE | Errno::ENFILE | Errno::ENOBUFS | Errno::ENOMEM | Errno::EPROTO | Errno::EPERM
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_transient() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient(&io::Error::from_raw_os_error(Errno::EMFILE as i32)));
        assert!(is_transient(&io::Error::from_raw_os_error(Errno::ENOBUFS as i32)));
        assert!(!is_transient(&io::Error::from_raw_os_error(Errno::EBADF as i32)));
        assert!(!is_transient(&io::Error::from_raw_os_error(Errno::EINVAL as i32)));
    }
}
