//! Byte forwarding between clients and the backend
//!
//! This module holds the backend endpoint and status types and the socket
//! bridge that splices each client connection to the backend.

pub mod backend;
pub mod bridge;
pub mod connection;
pub mod endpoint;

pub use backend::{BackendSnapshot, BackendState, BackendStatus, ExitReason, StatusPublisher, status_channel};
pub use bridge::Bridge;
pub use connection::{Connection, ConnectionStats};
pub use endpoint::{BackendStream, Endpoint};
