//! Capstan Error Types
//!
//! Comprehensive error handling for all capstan operations.

use std::io;
use thiserror::Error;

/// Main error type for capstan operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// IO error during socket operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Operation cannot complete without blocking
    #[error("Operation would block")]
    WouldBlock,

    /// The owning context has been terminated
    #[error("Context terminated")]
    Terminated,

    /// Peer violated the wire protocol
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Invalid greeting received
    #[error("Invalid greeting: {0}")]
    InvalidGreeting(String),

    /// Invalid frame format
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Handshake timeout
    #[error("Handshake timeout after {0:?}")]
    HandshakeTimeout(std::time::Duration),

    /// Endpoint string could not be parsed or resolved
    #[error("Address unresolvable: {0}")]
    AddressUnresolvable(String),

    /// Endpoint already bound within this context
    #[error("Address in use: {0}")]
    AddressInUse(String),

    /// A fixed resource table is exhausted
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// Operation not supported by this socket type
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    /// Operation is invalid in the socket's current state
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    /// No route to the requested peer
    #[error("Peer unroutable")]
    Unroutable,

    /// Invalid routing identity
    #[error("Invalid identity")]
    InvalidIdentity,

    /// Message too large
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Result type alias for capstan operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Create a protocol error with a message
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an invalid greeting error
    pub fn invalid_greeting(msg: impl Into<String>) -> Self {
        Self::InvalidGreeting(msg.into())
    }

    /// Create an invalid frame error
    pub fn invalid_frame(msg: impl Into<String>) -> Self {
        Self::InvalidFrame(msg.into())
    }

    /// Create an address unresolvable error
    pub fn unresolvable(addr: impl Into<String>) -> Self {
        Self::AddressUnresolvable(addr.into())
    }

    /// Check if this error is recoverable by retrying the operation
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            Self::WouldBlock => true,
            _ => false,
        }
    }

    /// Check if this error must tear down the connection it occurred on
    #[must_use]
    pub const fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_)
                | Self::InvalidGreeting(_)
                | Self::InvalidFrame(_)
                | Self::HandshakeTimeout(_)
                | Self::MessageTooLarge { .. }
        )
    }
}
