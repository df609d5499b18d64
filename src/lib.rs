//! # sockudo-wire: push-driven HTTP/1.x and WebSocket engine
//!
//! An embeddable, incremental protocol engine providing:
//!
//! - **HTTP/1.x parsing**: [`http::HttpParser`] turns arbitrarily chunked
//!   bytes into ordered request/response events
//! - **RFC 6455 WebSocket**: client and server roles sharing one frame engine
//!   ([`protocol::Protocol`]) parameterized by [`Role`]
//! - **Transport independence**: everything runs over a [`ByteStream`], a
//!   callback-based duplex stream supplied by the host event loop
//!
//! Parsing never blocks. The driver pushes bytes in with `handle_data` and
//! results come back through registered listeners on the same thread.
//!
//! ## Example
//!
//! ```ignore
//! use sockudo_wire::prelude::*;
//!
//! let ws = WebSocket::client(stream, "/ws", "example.com", &["chat"], ClientOptions::default());
//! ws.on_open(|protocol| println!("open: {protocol:?}"));
//! ws.on_text(|text, _fin| println!("got {text}"));
//! ```

pub mod client;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod http;
pub mod mask;
pub mod protocol;
pub mod server;
pub mod signal;
pub mod stream;
pub mod transport;
pub mod utf8;

pub use client::ClientOptions;
pub use error::{CloseReason, Error, Result};
pub use frame::{OpCode, OutgoingFrame};
pub use protocol::{Role, State};
pub use server::{HttpRequest, HttpServerConnection, ServerOptions, WebSocketServer};
pub use stream::{WeakWebSocket, WebSocket};
pub use transport::{ByteStream, StreamHandler};

#[cfg(feature = "tokio-runtime")]
pub use stream::{StreamReader, TokioStream};

/// Maximum WebSocket frame header size (2 + 8 + 4 = 14 bytes)
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// Small message threshold (payloads up to 125 bytes use the 7-bit length)
pub const SMALL_MESSAGE_THRESHOLD: usize = 125;

/// Medium message threshold (up to 64KB uses the 16-bit extended length)
pub const MEDIUM_MESSAGE_THRESHOLD: usize = 65535;

/// WebSocket GUID for handshake
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version spoken
pub const WS_VERSION: &str = "13";

/// Configuration for WebSocket connections
///
/// # Example
///
/// ```
/// use sockudo_wire::Config;
///
/// let config = Config::builder()
///     .max_message_size(16 * 1024)
///     .combine_fragments(false)
///     .build();
/// assert!(config.auto_pong);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum accumulated message size (default: 128KB)
    pub max_message_size: usize,
    /// Deliver whole messages instead of individual fragments (default: true)
    pub combine_fragments: bool,
    /// Answer pings with a pong automatically (default: true)
    pub auto_pong: bool,
    /// Maximum url / header field / header value length (default: 1024)
    pub http_max_length: usize,
    /// Maximum request body collected by the HTTP server glue (default: 1MB)
    pub max_request_body: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_message_size: 128 * 1024,
            combine_fragments: true,
            auto_pong: true,
            http_max_length: 1024,
            max_request_body: 1024 * 1024,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Builder for WebSocket configuration
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set maximum message size
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Combine fragments into whole messages, or deliver them one by one
    pub fn combine_fragments(mut self, combine: bool) -> Self {
        self.config.combine_fragments = combine;
        self
    }

    /// Enable or disable automatic pong replies
    pub fn auto_pong(mut self, enabled: bool) -> Self {
        self.config.auto_pong = enabled;
        self
    }

    /// Set the HTTP parser's per-token length limit
    pub fn http_max_length(mut self, len: usize) -> Self {
        self.config.http_max_length = len;
        self
    }

    /// Set the maximum request body the server glue will collect
    pub fn max_request_body(mut self, size: usize) -> Self {
        self.config.max_request_body = size;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::Config;
    pub use crate::client::ClientOptions;
    pub use crate::error::{CloseReason, Error, Result};
    pub use crate::frame::{OpCode, OutgoingFrame};
    pub use crate::http::{HttpHandler, HttpMode, HttpParser};
    pub use crate::protocol::{Role, State};
    pub use crate::server::{HttpRequest, HttpServerConnection, ServerOptions, WebSocketServer};
    pub use crate::stream::{WeakWebSocket, WebSocket};
    pub use crate::transport::{ByteStream, StreamHandler};

    #[cfg(feature = "tokio-runtime")]
    pub use crate::stream::TokioStream;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.max_message_size, 128 * 1024);
        assert!(config.combine_fragments);
        assert!(config.auto_pong);
        assert_eq!(config.http_max_length, 1024);
    }

    #[test]
    fn test_config_builder() {
        let config = Config::builder()
            .max_message_size(10)
            .combine_fragments(false)
            .auto_pong(false)
            .http_max_length(64)
            .max_request_body(5)
            .build();
        assert_eq!(config.max_message_size, 10);
        assert!(!config.combine_fragments);
        assert!(!config.auto_pong);
        assert_eq!(config.http_max_length, 64);
        assert_eq!(config.max_request_body, 5);
    }
}
