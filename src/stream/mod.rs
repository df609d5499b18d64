//! WebSocket connections
//!
//! [`WebSocket`] runs the protocol over any [`ByteStream`](crate::ByteStream).
//! With the `tokio-runtime` feature, [`TokioStream`] adapts a tokio I/O
//! object into one:
//!
//! ```ignore
//! let (stream, reader) = TokioStream::spawn(tcp);
//! let ws = WebSocket::client(stream, "/", "localhost", &["chat"], ClientOptions::default());
//! reader.run(&ws).await;
//! ```

#[cfg(feature = "tokio-runtime")]
mod transport_stream;
mod websocket;

#[cfg(feature = "tokio-runtime")]
pub use transport_stream::{StreamReader, TokioStream};
pub use websocket::{WeakWebSocket, WebSocket};
