//! Porthold - supervising socket proxy
//!
//! Listens on a public address and forwards raw connections to a child
//! process bound to a Unix socket or loopback port, keeping that child
//! alive across crashes and stopping it on shutdown.

pub mod config;
pub mod error;
pub mod proxy;
pub mod server;
pub mod supervisor;

pub use config::{PartialConfig, ProxyConfig, RestartPolicy};
pub use error::{BridgeError, ConfigError, ProxyError, Result, SupervisorError};
pub use server::{RunReport, Server, ShutdownHandle};
