//! Streaming HTTP/1.x message parsing
//!
//! [`HttpParser`] accepts input in chunks of any size (down to a single
//! byte) and reports the message structure through an [`HttpHandler`].
//! The head is buffered until complete and tokenised with `httparse`, so a
//! handler never sees a partial URL, header name or header value, and the
//! event sequence is the same no matter how the input was split.
//!
//! # Event order
//!
//! ```text
//! on_message_begin
//! on_method + on_url | on_status
//! on_header*                      (one per header; folded response lines joined)
//! on_headers_complete(keep_alive)
//! on_body(chunk, is_final)*
//! on_message_complete(keep_alive)
//! ```
//!
//! [`HttpParser::execute`] returns the bytes it did not consume. After an
//! upgrade (a `101` response, a `CONNECT` request, or a request carrying
//! `Upgrade` + `Connection: upgrade`) the parser stops at the end of the
//! headers and everything after them belongs to the next protocol layer.

use std::ops::ControlFlow;

mod parser;

pub use parser::HttpParser;

/// Which grammar the parser accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMode {
    /// `METHOD url HTTP/x.y` start lines
    Request,
    /// `HTTP/x.y code reason` start lines
    Response,
}

/// Which token buffer the parser is currently filling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    /// Between tokens (before a message, or in the body)
    Start,
    /// Request line
    Url,
    /// Status line
    Status,
    /// Header name
    Field,
    /// Header value
    Value,
}

/// HTTP parse errors
///
/// These abort the current parse only. The caller decides whether the
/// connection survives.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HttpError {
    /// Request method is not a token
    #[error("invalid HTTP method")]
    InvalidMethod,
    /// Request target is empty or contains control characters
    #[error("invalid URL")]
    InvalidUrl,
    /// Version is not `HTTP/1.0` or `HTTP/1.1`
    #[error("invalid HTTP version")]
    InvalidVersion,
    /// Status code is not three digits
    #[error("invalid HTTP status code")]
    InvalidStatus,
    /// Header name is empty or contains non-token characters
    #[error("invalid character in header name")]
    InvalidHeaderToken,
    /// Header value contains control characters
    #[error("invalid character in header value")]
    InvalidHeaderValue,
    /// A line ending is not CRLF or LF
    #[error("invalid new line")]
    InvalidNewLine,
    /// More header lines than the parser keeps
    #[error("too many headers")]
    TooManyHeaders,
    /// A url, header name or header value exceeds the maximum length
    #[error("header overflow")]
    HeaderOverflow,
    /// Content-Length is not a number or is given twice with different values
    #[error("invalid Content-Length")]
    InvalidContentLength,
    /// Malformed chunk-size line or chunk terminator
    #[error("invalid chunk size")]
    InvalidChunkSize,
    /// Input ended in the middle of a message
    #[error("stream ended at an unexpected time")]
    InvalidEofState,
    /// Data arrived after a message that closes the connection
    #[error("data received after completed connection")]
    ClosedConnection,
    /// A handler callback asked to stop
    #[error("parse aborted by callback")]
    Aborted,
}

impl From<httparse::Error> for HttpError {
    fn from(e: httparse::Error) -> Self {
        match e {
            httparse::Error::HeaderName => HttpError::InvalidHeaderToken,
            httparse::Error::HeaderValue => HttpError::InvalidHeaderValue,
            httparse::Error::NewLine => HttpError::InvalidNewLine,
            httparse::Error::Status => HttpError::InvalidStatus,
            httparse::Error::Token => HttpError::InvalidMethod,
            httparse::Error::TooManyHeaders => HttpError::TooManyHeaders,
            httparse::Error::Version => HttpError::InvalidVersion,
        }
    }
}

/// Receiver of parse events
///
/// Every method has a no-op default. Returning `ControlFlow::Break(())`
/// aborts the parse with [`HttpError::Aborted`].
pub trait HttpHandler {
    /// First byte of a new message seen
    fn on_message_begin(&mut self) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    /// Request method and protocol version (request mode), before `on_url`
    fn on_method(&mut self, _method: &str, _version: (u8, u8)) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    /// Request target (request mode)
    fn on_url(&mut self, _url: &str) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    /// Status code and reason phrase (response mode)
    fn on_status(&mut self, _code: u16, _text: &str) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    /// One complete header
    fn on_header(&mut self, _name: &str, _value: &str) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    /// End of the header block
    fn on_headers_complete(&mut self, _keep_alive: bool) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    /// A piece of the body; the last piece has `is_final` set
    fn on_body(&mut self, _chunk: &[u8], _is_final: bool) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    /// Message done
    fn on_message_complete(&mut self, _keep_alive: bool) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
}

/// Ignores every event
impl HttpHandler for () {}
