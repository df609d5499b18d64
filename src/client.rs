//! Client connection options
//!
//! ```
//! use std::time::Duration;
//! use sockudo_wire::ClientOptions;
//!
//! let options = ClientOptions::new()
//!     .handshake_timeout(Duration::from_secs(5))
//!     .header("Origin", "http://example.com");
//! assert_eq!(options.extra_headers.len(), 1);
//! ```

use std::time::Duration;

use crate::Config;

/// Options for [`WebSocket::client`](crate::WebSocket::client)
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Terminate with 1006 if the handshake has not completed in time
    pub handshake_timeout: Option<Duration>,
    /// Additional request headers, sent after the standard ones in order
    pub extra_headers: Vec<(String, String)>,
    /// Connection configuration
    pub config: Config,
}

impl ClientOptions {
    /// Default options: no timeout, no extra headers
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the handshake timeout
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    /// Append a request header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }

    /// Set the connection configuration
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }
}

#[cfg(feature = "tokio-runtime")]
mod runtime {
    use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};

    use super::ClientOptions;
    use crate::stream::{StreamReader, TokioStream, WebSocket};

    /// Start a client handshake over a tokio I/O object
    ///
    /// Must be called inside a `LocalSet`. Register listeners on the
    /// returned connection, then drive it with
    /// [`StreamReader::run`](crate::StreamReader::run).
    pub fn connect<S, P>(
        io: S,
        path: &str,
        host: &str,
        protocols: &[P],
        options: ClientOptions,
    ) -> (WebSocket, StreamReader<ReadHalf<S>>)
    where
        S: AsyncRead + AsyncWrite + 'static,
        P: AsRef<str>,
    {
        let (stream, reader) = TokioStream::spawn(io);
        let ws = WebSocket::client(stream, path, host, protocols, options);
        (ws, reader)
    }
}

#[cfg(feature = "tokio-runtime")]
pub use runtime::connect;
