//! Error types for the relay.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Failures that prevent a listener group from starting.
#[derive(Debug, Error)]
pub enum SetupError {
    /// Port list and descriptor list of a group differ in length.
    #[error("mismatched_listeners: group {group}: {ports} ports, {listeners} descriptors")]
    MismatchedListeners {
        group: &'static str,
        ports: usize,
        listeners: usize,
    },

    /// A group has listening ports but nothing to relay to.
    #[error("empty_backend_pool: group {group}")]
    EmptyBackendPool { group: &'static str },

    /// A pre-opened descriptor could not be handed to the runtime.
    #[error("wrap_listener_failed: port {port}: {source}")]
    WrapListener {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// A listening socket could not be bound.
    #[error("bind_failed: {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

impl SetupError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            SetupError::MismatchedListeners { .. } => "mismatched_listeners",
            SetupError::EmptyBackendPool { .. } => "empty_backend_pool",
            SetupError::WrapListener { .. } => "wrap_listener_failed",
            SetupError::Bind { .. } => "bind_failed",
        }
    }
}

/// Terminal conditions of a single session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Selection found no backend at all.
    #[error("no_backend: listener pool is empty")]
    NoBackend,

    /// Outbound connect to the chosen backend failed.
    #[error("backend_connect_failed: port {port}: {source}")]
    BackendConnect {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// Read or write failure on the backend-to-client direction.
    #[error("relay_failed: {0}")]
    Relay(#[from] io::Error),
}

impl SessionError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            SessionError::NoBackend => "no_backend",
            SessionError::BackendConnect { .. } => "backend_connect_failed",
            SessionError::Relay(_) => "relay_failed",
        }
    }
}
