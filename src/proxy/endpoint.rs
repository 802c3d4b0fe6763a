//! Backend endpoints
//!
//! A backend listens either on a Unix domain socket or on a TCP address. The
//! proxy only needs to open stream connections to it.

use std::fmt;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::time::timeout;

use crate::error::ConfigError;

/// Any bidirectional byte stream the bridge can splice
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// An open connection to the backend
pub type BackendStream = Box<dyn AsyncStream>;

/// Where the backend accepts connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Unix domain socket path
    Unix(PathBuf),
    /// TCP `host:port`
    Tcp { host: String, port: u16 },
}

impl Endpoint {
    /// Parse an endpoint
    ///
    /// Accepted forms: `unix:/path`, `unix:///path`, a bare path starting with
    /// `/` or `.`, `tcp://host:port` and bare `host:port`.
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let input = input.trim();
        let invalid = |reason: &str| ConfigError::Endpoint {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        if input.is_empty() {
            return Err(invalid("endpoint is empty"));
        }

        if let Some(rest) = input.strip_prefix("unix:") {
            let path = rest.strip_prefix("//").unwrap_or(rest);
            if path.is_empty() {
                return Err(invalid("socket path is empty"));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }

        if input.starts_with('/') || input.starts_with('.') {
            return Ok(Endpoint::Unix(PathBuf::from(input)));
        }

        let with_scheme = if input.contains("://") {
            input.to_string()
        } else {
            format!("tcp://{}", input)
        };

        let url = url::Url::parse(&with_scheme).map_err(|e| invalid(&e.to_string()))?;
        if url.scheme() != "tcp" {
            return Err(invalid(&format!("unsupported scheme {:?}", url.scheme())));
        }
        if url.path() != "" && url.path() != "/" {
            return Err(invalid("tcp endpoint must not have a path"));
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host"))?;
        let port = url.port().ok_or_else(|| invalid("missing port"))?;

        Ok(Endpoint::Tcp {
            host: host.to_string(),
            port,
        })
    }

    pub fn socket_path(&self) -> Option<&Path> {
        match self {
            Endpoint::Unix(path) => Some(path),
            Endpoint::Tcp { .. } => None,
        }
    }

    /// Open a stream connection
    pub async fn connect(&self) -> io::Result<BackendStream> {
        match self {
            Endpoint::Unix(path) => {
                let stream = UnixStream::connect(path).await?;
                Ok(Box::new(stream))
            }
            Endpoint::Tcp { host, port } => {
                let stream = TcpStream::connect((host.trim_matches(['[', ']']), *port)).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
        }
    }

    /// Connect-probe: true if the endpoint accepted a connection in time
    ///
    /// The probe connection is closed right away and never carries traffic.
    pub async fn probe(&self, limit: Duration) -> bool {
        matches!(timeout(limit, self.connect()).await, Ok(Ok(_)))
    }

    /// Remove a leftover socket file so the backend can bind again
    ///
    /// Only socket files are removed. Returns whether something was removed.
    pub fn remove_stale_socket(&self) -> io::Result<bool> {
        let Some(path) = self.socket_path() else {
            return Ok(false);
        };

        match std::fs::symlink_metadata(path) {
            Ok(meta) if meta.file_type().is_socket() => {
                std::fs::remove_file(path)?;
                Ok(true)
            }
            Ok(_) => Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} exists and is not a socket", path.display()),
            )),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Environment telling the child where it is expected to listen
    pub fn launch_env(&self) -> Vec<(String, String)> {
        let mut env = vec![("PORTHOLD_ENDPOINT".to_string(), self.to_string())];
        match self {
            Endpoint::Unix(path) => {
                env.push(("PORTHOLD_SOCKET".to_string(), path.display().to_string()));
            }
            Endpoint::Tcp { port, .. } => {
                env.push(("PORTHOLD_PORT".to_string(), port.to_string()));
            }
        }
        env
    }
}

impl FromStr for Endpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}
