use std::fmt;
use thiserror::Error;

/// Direction of a message registration.
///
/// Incoming registrations are used to decode received frames, outgoing
/// registrations to encode queued messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Incoming => f.write_str("incoming"),
            Direction::Outgoing => f.write_str("outgoing"),
        }
    }
}

/// The error type for peerlink operations.
///
/// Configuration errors (bad registrations, enqueueing unregistered
/// messages, invalid configuration values) are returned immediately from the
/// call that caused them. I/O errors are mostly handled internally by
/// terminating the affected connection, so they usually show up as
/// `process()` or `connect()` returning `false` rather than as an `Err`.
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // I/O and Networking Errors
    // ============================================================================
    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection (orderly shutdown or reset).
    #[error("Connection closed")]
    ConnectionClosed,

    /// The provided socket address could not be parsed or resolved.
    #[error("Invalid socket address")]
    InvalidAddress,

    /// `bind()` was called on a server that is already listening.
    #[error("Server is already bound to {addr}")]
    AlreadyBound {
        /// The address the server is listening on.
        addr: std::net::SocketAddr,
    },

    /// A frame is larger than the wire format or the target buffer allows.
    #[error("Frame of {len} bytes is too large")]
    FrameTooLarge {
        /// Size of the offending frame in bytes.
        len: usize,
    },

    // ============================================================================
    // Message Errors
    // ============================================================================
    /// Message payload data is truncated or doesn't match the expected format.
    #[error("Malformed message data: {0}")]
    MalformedData(String),

    /// Attempted to send a message type that has no outgoing registration.
    ///
    /// Register the type with [`MessageRegistry::register`](crate::MessageRegistry::register)
    /// (or one of its helpers) before enqueueing it.
    #[error("Message type {type_name} is not registered as outgoing")]
    UnregisteredMessage {
        /// Name of the unregistered type.
        type_name: &'static str,
    },

    // ============================================================================
    // Registration Errors
    // ============================================================================
    /// Message id 0 is reserved for the heartbeat message.
    #[error("Invalid message id {0}, ids must be greater than zero")]
    InvalidId(u16),

    /// The message id is already bound for this direction.
    #[error("Message id {id} is already registered as {direction}")]
    DuplicateId {
        /// The conflicting id.
        id: u16,
        /// The direction of the existing registration.
        direction: Direction,
    },

    /// The message type already has an outgoing registration under another id.
    #[error("Message type {type_name} is already registered as outgoing")]
    DuplicateType {
        /// Name of the type.
        type_name: &'static str,
    },

    /// The codec can neither decode nor encode the message type.
    #[error("Message type {type_name} supports neither decoding nor encoding")]
    UnsupportedType {
        /// Name of the type.
        type_name: &'static str,
    },

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    /// Configuration value lookup or conversion failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}
