//! Error types for the WebSocket engine

use std::io;

/// Result type alias for WebSocket operations
pub type Result<T> = std::result::Result<T, Error>;

/// WebSocket error types
///
/// Every variant maps onto the close code reported to the application
/// through [`Error::close_code`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from the underlying byte stream
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Invalid UTF-8 in a text message or close reason
    #[error("invalid UTF-8 in text message")]
    InvalidUtf8,
    /// Protocol violation
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    /// Send attempted after the connection left the open state
    #[error("connection closed")]
    ConnectionClosed,
    /// Accumulated message exceeds the configured maximum
    #[error("message too large")]
    MessageTooLarge,
    /// Invalid HTTP in a handshake message
    #[error("invalid HTTP: {0}")]
    InvalidHttp(&'static str),
    /// Handshake failed
    #[error("handshake failed: {0}")]
    HandshakeFailed(&'static str),
    /// No subprotocol in common between the peers
    #[error("unsupported protocol")]
    UnsupportedProtocol,
    /// The peer requested an extension we do not implement
    #[error("unsupported extension")]
    UnsupportedExtension,
    /// Send attempted before the handshake completed
    #[error("would block: connection still opening")]
    WouldBlock,
    /// Connection reset by peer
    #[error("connection reset by peer")]
    ConnectionReset,
    /// Invalid close code received
    #[error("invalid close code: {0}")]
    InvalidCloseCode(u16),
}

impl Error {
    /// Close code used when this error terminates a connection
    pub fn close_code(&self) -> u16 {
        match self {
            Error::Protocol(_)
            | Error::InvalidCloseCode(_)
            | Error::InvalidHttp(_)
            | Error::HandshakeFailed(_) => CloseReason::PROTOCOL_ERROR,
            Error::InvalidUtf8 => CloseReason::INVALID_PAYLOAD,
            Error::MessageTooLarge => CloseReason::TOO_BIG,
            Error::UnsupportedProtocol => CloseReason::UNSUPPORTED,
            Error::UnsupportedExtension => CloseReason::EXTENSION,
            Error::ConnectionClosed => CloseReason::NORMAL,
            Error::Io(_) | Error::WouldBlock | Error::ConnectionReset => CloseReason::ABNORMAL,
        }
    }
}

/// Close frame reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code
    pub code: u16,
    /// Reason string (may be empty)
    pub reason: String,
}

impl CloseReason {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Going away (e.g., server shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Unsupported data
    pub const UNSUPPORTED: u16 = 1003;
    /// No status received
    pub const NO_STATUS: u16 = 1005;
    /// Abnormal closure
    pub const ABNORMAL: u16 = 1006;
    /// Invalid frame payload
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Policy violation
    pub const POLICY: u16 = 1008;
    /// Message too big
    pub const TOO_BIG: u16 = 1009;
    /// Mandatory extension
    pub const EXTENSION: u16 = 1010;
    /// Internal server error
    pub const INTERNAL: u16 = 1011;

    /// Create a new close reason
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Check if the close code may appear on the wire per RFC 6455
    pub fn is_valid_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            Error::WouldBlock => io::Error::new(io::ErrorKind::WouldBlock, "would block"),
            Error::ConnectionReset => {
                io::Error::new(io::ErrorKind::ConnectionReset, "connection reset")
            }
            Error::ConnectionClosed => {
                io::Error::new(io::ErrorKind::BrokenPipe, "connection closed")
            }
            other => io::Error::other(other.to_string()),
        }
    }
}

/// Map a transport error onto the engine's error kinds
pub(crate) fn from_io(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::WouldBlock => Error::WouldBlock,
        io::ErrorKind::ConnectionReset => Error::ConnectionReset,
        io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
        _ => Error::Io(e),
    }
}
