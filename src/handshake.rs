//! WebSocket handshake implementation
//!
//! This module handles the HTTP upgrade handshake for WebSocket connections:
//! - Request/response wire builders
//! - Base64/SHA-1 accept key generation and validation
//! - Incremental client-side response validation on top of [`HttpParser`]
//! - Server-side header collection and subprotocol negotiation

use std::ops::ControlFlow;

use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::error::{Error, Result};
use crate::http::{HttpHandler, HttpMode, HttpParser};
use crate::mask::MaskRng;
use crate::{WS_GUID, WS_VERSION};

/// Response sent when the client speaks a protocol version other than 13
pub const VERSION_MISMATCH_RESPONSE: &[u8] =
    b"HTTP/1.1 426 Upgrade Required\r\nUpgrade: WebSocket\r\nSec-WebSocket-Version: 13\r\n\r\n";

/// Generate the Sec-WebSocket-Accept key
///
/// This computes: Base64(SHA-1(key + GUID))
#[inline]
pub fn generate_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let hash = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(hash)
}

/// Validate the server's accept key (client-side)
pub fn validate_accept_key(sent_key: &str, received_accept: &str) -> bool {
    let expected = generate_accept_key(sent_key);
    expected == received_accept
}

/// Generate a random WebSocket key (client-side)
///
/// 16 bytes from the connection's CSPRNG, base64 encoded.
pub fn generate_key(rng: &mut MaskRng) -> String {
    base64::engine::general_purpose::STANDARD.encode(rng.nonce())
}

/// Build a WebSocket upgrade request (client-side)
///
/// Offered protocols are joined with `", "`; extra headers follow the
/// standard ones in the given order.
pub fn build_request<P: AsRef<str>>(
    host: &str,
    path: &str,
    key: &str,
    protocols: &[P],
    extra_headers: &[(String, String)],
) -> Bytes {
    let mut buf = BytesMut::with_capacity(512);

    buf.put_slice(b"GET ");
    buf.put_slice(path.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");
    buf.put_slice(b"Host: ");
    buf.put_slice(host.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Sec-WebSocket-Key: ");
    buf.put_slice(key.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Sec-WebSocket-Version: 13\r\n");

    if !protocols.is_empty() {
        buf.put_slice(b"Sec-WebSocket-Protocol: ");
        for (i, proto) in protocols.iter().enumerate() {
            if i > 0 {
                buf.put_slice(b", ");
            }
            buf.put_slice(proto.as_ref().as_bytes());
        }
        buf.put_slice(b"\r\n");
    }

    for (name, value) in extra_headers {
        buf.put_slice(name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Build a WebSocket upgrade response
pub fn build_response(accept_key: &str, protocol: Option<&str>) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);

    buf.put_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Sec-WebSocket-Accept: ");
    buf.put_slice(accept_key.as_bytes());
    buf.put_slice(b"\r\n");

    if let Some(proto) = protocol {
        buf.put_slice(b"Sec-WebSocket-Protocol: ");
        buf.put_slice(proto.as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Server reply to an upgrade request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerResponse {
    /// `101 Switching Protocols`; the connection opens once it is written
    Accepted(Bytes),
    /// `426 Upgrade Required`; the connection terminates with 1003
    VersionMismatch(Bytes),
}

impl ServerResponse {
    /// Wire bytes of the response
    pub fn bytes(&self) -> &Bytes {
        match self {
            ServerResponse::Accepted(b) | ServerResponse::VersionMismatch(b) => b,
        }
    }
}

/// Pick the server's reply for a client key and version
pub fn server_response(key: &str, version: &str, protocol: Option<&str>) -> ServerResponse {
    if version != WS_VERSION {
        debug!(version, "unsupported websocket version");
        return ServerResponse::VersionMismatch(Bytes::from_static(VERSION_MISMATCH_RESPONSE));
    }
    ServerResponse::Accepted(build_response(&generate_accept_key(key), protocol))
}

#[inline]
fn has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

// ============================================================================
// Client side
// ============================================================================

/// Progress of the client handshake
#[derive(Debug)]
pub enum HandshakeStatus {
    /// The response is not complete yet
    Pending,
    /// Upgrade accepted; bytes past `consumed` are WebSocket frames
    Open {
        /// Protocol chosen by the server
        protocol: Option<String>,
        /// Bytes of the input that belonged to the HTTP response
        consumed: usize,
    },
    /// Upgrade rejected; [`Error::close_code`] gives the close code
    Failed(Error),
}

/// Checks the server's response headers as the parser reports them
#[derive(Debug, Default)]
struct ResponseValidator {
    expected_accept: String,
    protocols: Vec<String>,
    has_upgrade: bool,
    has_connection: bool,
    has_accept: bool,
    protocol: Option<String>,
    complete: bool,
    failure: Option<Error>,
}

impl ResponseValidator {
    fn fail(&mut self, e: Error) -> ControlFlow<()> {
        debug!(error = %e, "handshake response rejected");
        self.failure = Some(e);
        ControlFlow::Break(())
    }
}

impl HttpHandler for ResponseValidator {
    fn on_status(&mut self, code: u16, _text: &str) -> ControlFlow<()> {
        if code != 101 {
            return self.fail(Error::HandshakeFailed("unexpected status code"));
        }
        ControlFlow::Continue(())
    }

    fn on_header(&mut self, name: &str, value: &str) -> ControlFlow<()> {
        if name.eq_ignore_ascii_case("upgrade") {
            if !value.eq_ignore_ascii_case("websocket") {
                return self.fail(Error::HandshakeFailed("invalid upgrade response value"));
            }
            self.has_upgrade = true;
        } else if name.eq_ignore_ascii_case("connection") {
            if !has_token(value, "upgrade") {
                return self.fail(Error::HandshakeFailed("invalid connection response value"));
            }
            self.has_connection = true;
        } else if name.eq_ignore_ascii_case("sec-websocket-accept") {
            if value != self.expected_accept {
                return self.fail(Error::HandshakeFailed("invalid accept key"));
            }
            self.has_accept = true;
        } else if name.eq_ignore_ascii_case("sec-websocket-extensions") {
            if !value.trim().is_empty() {
                return self.fail(Error::UnsupportedExtension);
            }
        } else if name.eq_ignore_ascii_case("sec-websocket-protocol") {
            // Protocol names compare case-insensitively; report our spelling
            let offered = self.protocols.iter().find(|p| p.eq_ignore_ascii_case(value)).cloned();
            match offered {
                Some(offered) if self.protocol.is_none() => self.protocol = Some(offered),
                _ => return self.fail(Error::UnsupportedProtocol),
            }
        }
        ControlFlow::Continue(())
    }

    fn on_headers_complete(&mut self, _keep_alive: bool) -> ControlFlow<()> {
        let missing_protocol = !self.protocols.is_empty() && self.protocol.is_none();
        if !self.has_upgrade || !self.has_connection || !self.has_accept || missing_protocol {
            return self.fail(Error::HandshakeFailed("invalid response"));
        }
        ControlFlow::Continue(())
    }

    fn on_message_complete(&mut self, _keep_alive: bool) -> ControlFlow<()> {
        self.complete = true;
        ControlFlow::Continue(())
    }
}

/// Client handshake context
///
/// Holds the nonce, the offered protocols and the response parser. It lives
/// from connection start until the response has been accepted or rejected.
#[derive(Debug)]
pub struct ClientHandshake {
    key: String,
    parser: HttpParser,
    validator: ResponseValidator,
}

impl ClientHandshake {
    /// Create a handshake with a fresh random key
    pub fn new(rng: &mut MaskRng, protocols: Vec<String>, max_length: usize) -> Self {
        let key = generate_key(rng);
        let mut parser = HttpParser::new(HttpMode::Response);
        parser.set_max_length(max_length);
        Self {
            validator: ResponseValidator {
                expected_accept: generate_accept_key(&key),
                protocols,
                ..Default::default()
            },
            key,
            parser,
        }
    }

    /// The Sec-WebSocket-Key sent to the server
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Protocols offered to the server
    pub fn protocols(&self) -> &[String] {
        &self.validator.protocols
    }

    /// Wire bytes of the upgrade request
    pub fn request(&self, host: &str, path: &str, extra_headers: &[(String, String)]) -> Bytes {
        build_request(
            host,
            path,
            &self.key,
            self.validator.protocols.as_slice(),
            extra_headers,
        )
    }

    /// Feed response bytes
    pub fn receive(&mut self, data: &[u8]) -> HandshakeStatus {
        let rest = self.parser.execute(data, &mut self.validator);

        if let Some(e) = self.validator.failure.take() {
            return HandshakeStatus::Failed(e);
        }
        if self.parser.has_error() {
            return HandshakeStatus::Failed(Error::InvalidHttp("malformed handshake response"));
        }
        if self.validator.complete {
            return HandshakeStatus::Open {
                protocol: self.validator.protocol.take(),
                consumed: data.len() - rest.len(),
            };
        }
        HandshakeStatus::Pending
    }
}

// ============================================================================
// Server side
// ============================================================================

/// Server handshake context
///
/// Fed with request headers; afterwards tells whether the request is a
/// WebSocket upgrade and negotiates the subprotocol.
#[derive(Debug, Clone, Default)]
pub struct ServerHandshake {
    has_upgrade: bool,
    has_connection: bool,
    key: Option<String>,
    version: Option<String>,
    protocols: Vec<String>,
    protocol: Option<String>,
}

impl ServerHandshake {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one request header
    pub fn observe_header(&mut self, name: &str, value: &str) {
        if name.eq_ignore_ascii_case("upgrade") {
            if value.eq_ignore_ascii_case("websocket") {
                self.has_upgrade = true;
            }
        } else if name.eq_ignore_ascii_case("connection") {
            if has_token(value, "upgrade") {
                self.has_connection = true;
            }
        } else if name.eq_ignore_ascii_case("sec-websocket-key") {
            self.key = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("sec-websocket-version") {
            self.version = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("sec-websocket-protocol") {
            self.protocols.extend(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(String::from),
            );
        }
    }

    /// Check if the request asked for a WebSocket upgrade
    pub fn is_websocket(&self) -> bool {
        self.has_upgrade && self.has_connection
    }

    /// Sec-WebSocket-Key, if sent
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Sec-WebSocket-Version, if sent
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Protocols offered by the client, in its order
    pub fn protocols(&self) -> &[String] {
        &self.protocols
    }

    /// Negotiated protocol (after [`match_protocol`](Self::match_protocol))
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Choose the first of `supported` that the client offered
    ///
    /// The server's order wins. When neither side lists protocols the result
    /// is `Ok(None)`; any other case without a common entry fails with
    /// [`Error::UnsupportedProtocol`].
    pub fn match_protocol<S: AsRef<str>>(&mut self, supported: &[S]) -> Result<Option<String>> {
        if supported.is_empty() && self.protocols.is_empty() {
            return Ok(None);
        }
        let chosen = supported
            .iter()
            .map(|s| s.as_ref())
            .find(|s| self.protocols.iter().any(|p| p == s))
            .map(String::from)
            .ok_or(Error::UnsupportedProtocol)?;
        self.protocol = Some(chosen.clone());
        Ok(Some(chosen))
    }

    /// Build the reply for this request
    pub fn response(&self) -> Result<ServerResponse> {
        let key = self
            .key
            .as_deref()
            .ok_or(Error::HandshakeFailed("missing Sec-WebSocket-Key"))?;
        let version = self.version.as_deref().unwrap_or_default();
        Ok(server_response(key, version, self.protocol.as_deref()))
    }
}
