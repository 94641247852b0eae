//! Error types for the measurement engine.

use crate::IpVersion;
use std::net::IpAddr;
use thiserror::Error;

/// Main error type for engine, socket, and route discovery operations.
///
/// Measurement outcomes are never reported through this type; every probe
/// produces a result record, and only construction and control operations
/// can fail.
#[derive(Error, Debug)]
pub enum EngineError {
    // Socket/IO errors
    #[error("Failed to create {version} socket: {source}")]
    SocketCreation {
        version: IpVersion,
        #[source]
        source: std::io::Error,
    },

    #[error("Raw ICMP requires elevated privileges on this platform: {0}")]
    PrivilegeRequired(#[source] std::io::Error),

    #[error("Failed to bind to address {addr}: {source}")]
    SocketBind {
        addr: IpAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to set socket option {option}: {source}")]
    SocketOption {
        option: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    #[error("Read timeout exceeded")]
    ReadTimeout,

    // DNS errors
    #[error("Failed to resolve hostname {hostname}: {source}")]
    ResolveFailed {
        hostname: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("No {version} address found for {hostname}")]
    NoAddress {
        hostname: String,
        version: IpVersion,
    },

    #[error("Address {addr} does not match engine version {version}")]
    VersionMismatch { addr: IpAddr, version: IpVersion },

    // Engine errors
    #[error("Engine backend {0} is not available on this platform")]
    BackendUnavailable(&'static str),

    #[error("{0} worker failed to stop within the shutdown deadline")]
    WorkerStalled(&'static str),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Returns true for send-time conditions that should be logged and left
    /// for the timeout scanner rather than torn down: the probe record stays
    /// in the request table and ages out as a lost sample.
    pub fn is_transient_send(&self) -> bool {
        match self {
            EngineError::SendFailed(source) => matches!(
                source.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::NetworkUnreachable
                    | std::io::ErrorKind::HostUnreachable
            ),
            _ => false,
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                EngineError::ReadTimeout
            }
            _ => EngineError::Internal(err.to_string()),
        }
    }
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
