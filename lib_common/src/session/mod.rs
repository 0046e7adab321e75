//! # Session Module
//!
//! The device session engine: registration, the persistent WebSocket
//! connection, inbound message routing, per-viewer stream workers, keepalive
//! loops and the supervisor that ties them into a reconnecting cohort.
//!
//! ```text
//! SessionSupervisor ── register/connect ──► ControlPlane
//!        │ owns
//!        ├── ConnectionHandle (Arc, shared send / single receive)
//!        └── cohort (TaskTracker + CancellationToken)
//!              ├── MessageRouter ──► StreamRegistry ──► StreamWorker × N
//!              └── ping / status / camera health loops
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod connection;
pub mod envelope;
pub mod keepalive;
pub mod registration;
pub mod registry;
pub mod router;
pub mod stream_worker;
pub mod supervisor;

mod context;
#[cfg(test)]
pub(crate) mod testing;

use thiserror::Error;

pub use connection::{ConnectionHandle, ConnectionState, Incoming};
pub use context::SessionContext;
pub use envelope::{Inbound, Outbound};
pub use registration::{ControlPlane, DeviceMetadata, HttpControlPlane, Registration};
pub use registry::{StreamControl, StreamLease, StreamRegistry};
pub use supervisor::{SessionSupervisor, SupervisorState};

/// Session-level failures. None of them is fatal to the process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("device registration failed: {0}")]
    RegistrationFailed(String),

    #[error("timed out waiting for connection confirmation")]
    ConnectTimeout,

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}
