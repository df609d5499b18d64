//! HTTP server connection and WebSocket upgrade glue
//!
//! [`HttpServerConnection`] pairs a request-mode [`HttpParser`] with
//! response builders. Complete requests are handed to `on_request`
//! listeners, which answer with one of the `send_*` helpers or upgrade the
//! connection with [`accept_websocket`](HttpServerConnection::accept_websocket).
//! After an upgrade every incoming byte goes to the [`WebSocket`].
//!
//! [`WebSocketServer`] is the common case on top of that: check the URL
//! and host, negotiate the subprotocol and report the upgraded connection.
//!
//! # Example
//!
//! ```ignore
//! use sockudo_wire::{ServerOptions, WebSocketServer};
//!
//! let server = WebSocketServer::new(stream, &["chat"], ServerOptions::default());
//! server.on_connected(|url, ws| {
//!     let weak = ws.downgrade();
//!     ws.on_text(move |text, _| {
//!         if let Some(ws) = weak.upgrade() {
//!             ws.send_text(vec![text.to_owned().into()], |_, _| {});
//!         }
//!     });
//! });
//! reader.run(&server).await;
//! ```

use std::cell::{Cell, RefCell};
use std::fmt::{self, Write as _};
use std::io;
use std::ops::ControlFlow;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::Config;
use crate::error::{Error, Result};
use crate::handshake::ServerHandshake;
use crate::http::{HttpHandler, HttpMode, HttpParser};
use crate::signal::Signal;
use crate::stream::WebSocket;
use crate::transport::{ByteStream, StreamHandler};

/// Headers sent with every response
const COMMON_HEADERS: &str = "Server: sockudo-wire\r\n\
    Cache-Control: no-store, no-cache, must-revalidate, pre-check=0, post-check=0, max-age=0\r\n\
    Pragma: no-cache\r\n\
    Expires: Mon, 3 Jan 2000 12:34:56 GMT\r\n";

/// A complete HTTP request
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    /// Request method
    pub method: String,
    /// Request target
    pub url: String,
    /// Protocol version (major, minor)
    pub version: (u8, u8),
    /// Headers in arrival order
    pub headers: Vec<(String, String)>,
    /// Collected body
    pub body: Bytes,
    /// Whether the connection stays open after the response
    pub keep_alive: bool,
    /// Whether the request asked for a protocol upgrade
    pub upgrade: bool,
    /// WebSocket upgrade headers seen in this request
    pub websocket: ServerHandshake,
}

impl HttpRequest {
    /// First header named `name` (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether this is a valid WebSocket upgrade request
    pub fn is_websocket(&self) -> bool {
        self.upgrade && self.websocket.is_websocket()
    }
}

/// Why a request could not be served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestFailure {
    BodyTooLarge,
    Malformed,
}

/// Builds [`HttpRequest`]s out of parser events
#[derive(Debug, Default)]
struct RequestCollector {
    current: HttpRequest,
    body: BytesMut,
    max_body: usize,
    body_too_large: bool,
    completed: Vec<HttpRequest>,
}

impl HttpHandler for RequestCollector {
    fn on_message_begin(&mut self) -> ControlFlow<()> {
        self.current = HttpRequest::default();
        self.body.clear();
        ControlFlow::Continue(())
    }

    fn on_method(&mut self, method: &str, version: (u8, u8)) -> ControlFlow<()> {
        self.current.method = method.to_string();
        self.current.version = version;
        ControlFlow::Continue(())
    }

    fn on_url(&mut self, url: &str) -> ControlFlow<()> {
        self.current.url = url.to_string();
        ControlFlow::Continue(())
    }

    fn on_header(&mut self, name: &str, value: &str) -> ControlFlow<()> {
        self.current.websocket.observe_header(name, value);
        self.current
            .headers
            .push((name.to_string(), value.to_string()));
        ControlFlow::Continue(())
    }

    fn on_headers_complete(&mut self, keep_alive: bool) -> ControlFlow<()> {
        self.current.keep_alive = keep_alive;
        ControlFlow::Continue(())
    }

    fn on_body(&mut self, chunk: &[u8], _is_final: bool) -> ControlFlow<()> {
        if self.body.len() + chunk.len() > self.max_body {
            self.body_too_large = true;
            return ControlFlow::Break(());
        }
        self.body.extend_from_slice(chunk);
        ControlFlow::Continue(())
    }

    fn on_message_complete(&mut self, keep_alive: bool) -> ControlFlow<()> {
        let mut request = std::mem::take(&mut self.current);
        request.keep_alive = keep_alive;
        request.body = self.body.split().freeze();
        self.completed.push(request);
        ControlFlow::Continue(())
    }
}

type RequestListener = dyn Fn(&HttpServerConnection, &HttpRequest);

struct ConnectionShared {
    stream: Rc<dyn ByteStream>,
    config: Config,
    parser: RefCell<HttpParser>,
    collector: RefCell<RequestCollector>,
    /// Response framing follows the request being answered
    keep_alive: Cell<bool>,
    version: Cell<(u8, u8)>,
    /// Bytes that followed an upgrade request
    upgrade_data: RefCell<Vec<u8>>,
    websocket: RefCell<Option<WebSocket>>,
    on_request: Signal<RequestListener>,
}

/// Server side of an HTTP/1.x connection
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct HttpServerConnection {
    shared: Rc<ConnectionShared>,
}

impl HttpServerConnection {
    /// Wrap a freshly accepted stream
    pub fn new(stream: Rc<dyn ByteStream>, config: Config) -> Self {
        let mut parser = HttpParser::new(HttpMode::Request);
        parser.set_max_length(config.http_max_length);
        let collector = RequestCollector {
            max_body: config.max_request_body,
            ..Default::default()
        };
        stream.start_read();
        Self {
            shared: Rc::new(ConnectionShared {
                stream,
                config,
                parser: RefCell::new(parser),
                collector: RefCell::new(collector),
                keep_alive: Cell::new(false),
                version: Cell::new((1, 1)),
                upgrade_data: RefCell::new(Vec::new()),
                websocket: RefCell::new(None),
                on_request: Signal::new(),
            }),
        }
    }

    /// A complete request arrived
    pub fn on_request(&self, listener: impl Fn(&HttpServerConnection, &HttpRequest) + 'static) {
        self.shared.on_request.connect(Rc::new(listener));
    }

    /// The underlying transport
    pub fn stream(&self) -> Rc<dyn ByteStream> {
        self.shared.stream.clone()
    }

    /// Connection configuration
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// The upgraded WebSocket, once accepted
    pub fn websocket(&self) -> Option<WebSocket> {
        self.shared.websocket.borrow().clone()
    }

    // ========================================================================
    // Incoming
    // ========================================================================

    /// Bytes arrived from the client
    pub fn handle_data(&self, data: &[u8]) {
        if let Some(ws) = self.websocket() {
            ws.handle_data(data);
            return;
        }

        let (rest, requests, upgraded, failure) = {
            let mut parser = self.shared.parser.borrow_mut();
            let mut collector = self.shared.collector.borrow_mut();
            let rest = parser.execute(data, &mut *collector);
            let mut requests = std::mem::take(&mut collector.completed);
            let upgraded = parser.is_upgrade();
            if upgraded {
                // Parsing stops at an upgrade, so it is always the last request
                if let Some(last) = requests.last_mut() {
                    last.upgrade = true;
                }
            }
            let failure = if std::mem::take(&mut collector.body_too_large) {
                Some(RequestFailure::BodyTooLarge)
            } else if parser.has_error() {
                Some(RequestFailure::Malformed)
            } else {
                None
            };
            let rest = if upgraded { rest.to_vec() } else { Vec::new() };
            (rest, requests, upgraded, failure)
        };

        if !rest.is_empty() {
            self.shared.upgrade_data.borrow_mut().extend_from_slice(&rest);
        }
        for request in &requests {
            self.dispatch(request);
        }

        match failure {
            Some(RequestFailure::BodyTooLarge) => {
                debug!("request body too large");
                self.shared.keep_alive.set(false);
                self.send_response(413, "Payload Too Large", "text/plain", Bytes::new(), "");
            }
            Some(RequestFailure::Malformed) => {
                debug!(error = ?self.shared.parser.borrow().error(), "bad request; closing");
                // Responses already queued go out first
                self.send_data(Vec::new(), true);
            }
            None if upgraded && self.websocket().is_none() => self.decline_upgrade(),
            None => {}
        }
    }

    /// The upgrade request was answered over HTTP; keep serving HTTP
    fn decline_upgrade(&self) {
        let pending = self.shared.upgrade_data.take();
        if !self.shared.keep_alive.get() {
            trace!(discarded = pending.len(), "upgrade declined; closing");
            self.send_data(Vec::new(), true);
            return;
        }
        trace!("upgrade declined; resuming http");
        self.shared.parser.borrow_mut().reset(HttpMode::Request);
        if !pending.is_empty() {
            self.handle_data(&pending);
        }
    }

    /// The client finished sending
    pub fn handle_end(&self) {
        match self.websocket() {
            Some(ws) => ws.handle_end(),
            None => self.shared.stream.close(),
        }
    }

    /// The transport failed
    pub fn handle_error(&self, error: &io::Error) {
        match self.websocket() {
            Some(ws) => ws.handle_error(error),
            None => {
                debug!(%error, "http connection error");
                self.shared.stream.close();
            }
        }
    }

    /// The transport closed
    pub fn handle_closed(&self) {
        if let Some(ws) = self.websocket() {
            ws.handle_closed();
        }
        self.shared.on_request.clear();
    }

    fn dispatch(&self, request: &HttpRequest) {
        trace!(method = %request.method, url = %request.url, "http request");
        self.shared.keep_alive.set(request.keep_alive);
        self.shared.version.set(request.version);
        self.shared.on_request.emit(|listener| listener(self, request));
    }

    // ========================================================================
    // Responses
    // ========================================================================

    /// Append the headers common to every response
    pub fn build_common_headers(&self, out: &mut BytesMut) {
        out.extend_from_slice(COMMON_HEADERS.as_bytes());
    }

    /// Status line plus headers, terminated by the blank line
    ///
    /// A 401 carries an authentication challenge; responses on a
    /// connection that will not be kept alive carry `Connection: close`.
    pub fn build_header(
        &self,
        code: u16,
        text: &str,
        content_type: &str,
        content_length: Option<usize>,
        extra_header: &str,
    ) -> BytesMut {
        let (major, minor) = self.shared.version.get();
        let mut out = BytesMut::with_capacity(256);
        // Writing into BytesMut cannot fail
        let _ = write!(out, "HTTP/{major}.{minor} {code} {text}\r\n");
        if code == 401 {
            out.extend_from_slice(b"WWW-Authenticate: Basic realm=\"sockudo-wire\"\r\n");
        }
        if !self.shared.keep_alive.get() {
            out.extend_from_slice(b"Connection: close\r\n");
        }
        self.build_common_headers(&mut out);
        if !content_type.is_empty() {
            let _ = write!(out, "Content-Type: {content_type}\r\n");
        }
        if let Some(len) = content_length {
            let _ = write!(out, "Content-Length: {len}\r\n");
        }
        out.extend_from_slice(extra_header.as_bytes());
        out.extend_from_slice(b"\r\n");
        out
    }

    /// Write raw buffers; close the stream afterwards if asked to
    pub fn send_data(&self, bufs: Vec<Bytes>, close_after: bool) {
        let stream = self.shared.stream.clone();
        self.shared.stream.write(
            bufs,
            Box::new(move |_, result| {
                if let Err(e) = &result {
                    debug!(error = %e, "http response write failed");
                }
                if close_after || result.is_err() {
                    stream.close();
                }
            }),
        );
    }

    /// Send a complete response with a body
    pub fn send_response(
        &self,
        code: u16,
        text: &str,
        content_type: &str,
        content: Bytes,
        extra_header: &str,
    ) {
        let header = self.build_header(code, text, content_type, Some(content.len()), extra_header);
        let mut bufs = vec![header.freeze()];
        if !content.is_empty() {
            bufs.push(content);
        }
        self.send_data(bufs, !self.shared.keep_alive.get());
    }

    /// Send a response whose body is static data, optionally gzip-encoded
    pub fn send_static_response(
        &self,
        code: u16,
        text: &str,
        content_type: &str,
        content: &'static [u8],
        gzipped: bool,
        extra_header: &str,
    ) {
        let extra = if gzipped {
            format!("Content-Encoding: gzip\r\n{extra_header}")
        } else {
            extra_header.to_string()
        };
        self.send_response(code, text, content_type, Bytes::from_static(content), &extra);
    }

    /// Send a plain-text error page
    ///
    /// Known codes are 400, 401, 403, 404, 500 and 503; anything else is
    /// reported as 501.
    pub fn send_error(&self, code: u16, message: &str) {
        let (code, text, base) = match code {
            400 => (400, "Bad Request", "400: Bad Request!"),
            401 => (401, "Unauthorized", "401: Not Authenticated!"),
            403 => (403, "Forbidden", "403: Forbidden!"),
            404 => (404, "Not Found", "404: Not Found!"),
            500 => (500, "Internal Server Error", "500: Internal Server Error!"),
            503 => (503, "Service Unavailable", "503: Service Unavailable"),
            _ => (501, "Not Implemented", "501: Not Implemented!"),
        };
        let body = format!("{base}\r\n{message}");
        self.send_response(code, text, "text/plain", Bytes::from(body), "");
    }

    /// Answer with a bare status line and close once it is written
    ///
    /// A 426 advertises the supported WebSocket version.
    pub fn abort(&self, code: u16, text: &str) {
        let mut out = BytesMut::with_capacity(128);
        let _ = write!(out, "HTTP/1.1 {code} {text}\r\n");
        if code == 426 {
            out.extend_from_slice(b"Upgrade: WebSocket\r\nSec-WebSocket-Version: 13\r\n");
        }
        out.extend_from_slice(b"\r\n");
        self.shared.keep_alive.set(false);
        self.send_data(vec![out.freeze()], true);
    }

    // ========================================================================
    // Upgrade
    // ========================================================================

    /// Upgrade to a WebSocket using the handshake of the current request
    ///
    /// The negotiated protocol is the one chosen with
    /// [`ServerHandshake::match_protocol`]. Bytes that followed the request
    /// are forwarded to the new connection.
    pub fn accept_websocket(&self, handshake: &ServerHandshake) -> Result<WebSocket> {
        if self.shared.websocket.borrow().is_some() {
            return Err(Error::Protocol("connection already upgraded"));
        }
        let key = handshake
            .key()
            .ok_or(Error::HandshakeFailed("missing Sec-WebSocket-Key"))?;
        let version = handshake.version().unwrap_or_default();

        let ws = WebSocket::server(
            self.shared.stream.clone(),
            key,
            version,
            handshake.protocol(),
            self.shared.config.clone(),
        );
        self.shared.websocket.replace(Some(ws.clone()));

        let early = self.shared.upgrade_data.take();
        if !early.is_empty() {
            ws.handle_data(&early);
        }
        Ok(ws)
    }
}

impl StreamHandler for HttpServerConnection {
    fn handle_data(&self, data: &[u8]) {
        HttpServerConnection::handle_data(self, data);
    }

    fn handle_end(&self) {
        HttpServerConnection::handle_end(self);
    }

    fn handle_error(&self, error: &io::Error) {
        HttpServerConnection::handle_error(self, error);
    }

    fn handle_closed(&self) {
        HttpServerConnection::handle_closed(self);
    }
}

impl fmt::Debug for HttpServerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpServerConnection")
            .field("parser", &*self.shared.parser.borrow())
            .field("upgraded", &self.shared.websocket.borrow().is_some())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// WebSocketServer
// ============================================================================

/// Predicate over a request URL or Host header
pub type RequestCheck = Rc<dyn Fn(&str) -> bool>;

/// Options for [`WebSocketServer`]
#[derive(Clone, Default)]
pub struct ServerOptions {
    /// Reject upgrade requests whose URL fails this check (404)
    pub check_url: Option<RequestCheck>,
    /// Reject upgrade requests whose Host header fails this check (401)
    pub check_host: Option<RequestCheck>,
    /// Connection configuration
    pub config: Config,
}

impl fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerOptions")
            .field("check_url", &self.check_url.is_some())
            .field("check_host", &self.check_host.is_some())
            .field("config", &self.config)
            .finish()
    }
}

type ConnectedListener = dyn Fn(&str, &WebSocket);
type RejectedListener = dyn Fn(&Error);

struct ServerState {
    protocols: Vec<String>,
    options: ServerOptions,
    connected: Signal<ConnectedListener>,
    rejected: Signal<RejectedListener>,
}

impl ServerState {
    fn handle_request(&self, conn: &HttpServerConnection, request: &HttpRequest) {
        if !request.is_websocket() {
            let e = Error::HandshakeFailed("not a websocket upgrade");
            return self.reject(conn, 426, "Upgrade Required", e);
        }
        if let Some(check) = &self.options.check_url {
            if !check(&request.url) {
                let e = Error::HandshakeFailed("url rejected");
                return self.reject(conn, 404, "Not Found", e);
            }
        }
        if let Some(check) = &self.options.check_host {
            if !check(request.header("host").unwrap_or_default()) {
                let e = Error::HandshakeFailed("host rejected");
                return self.reject(conn, 401, "Unauthorized", e);
            }
        }

        let mut handshake = request.websocket.clone();
        if let Err(e) = handshake.match_protocol(self.protocols.as_slice()) {
            return self.reject(conn, 426, "Upgrade Required", e);
        }

        match conn.accept_websocket(&handshake) {
            Ok(ws) => {
                debug!(url = %request.url, protocol = ?handshake.protocol(), "websocket accepted");
                self.connected.emit(|listener| listener(&request.url, &ws));
            }
            Err(e) => self.reject(conn, 400, "Bad Request", e),
        }
    }

    fn reject(&self, conn: &HttpServerConnection, code: u16, text: &str, error: Error) {
        debug!(code, error = %error, "websocket upgrade rejected");
        conn.abort(code, text);
        self.rejected.emit(|listener| listener(&error));
    }
}

/// Accepts WebSocket upgrades on one HTTP connection
///
/// URL and host checks failing are answered with 404 and 401; a request
/// that is not a WebSocket upgrade, or offers none of the supported
/// protocols, gets 426. Rejections are reported through `on_rejected`
/// (a protocol mismatch as [`Error::UnsupportedProtocol`], close code 1003).
#[derive(Clone)]
pub struct WebSocketServer {
    conn: HttpServerConnection,
    state: Rc<ServerState>,
}

impl WebSocketServer {
    /// Serve `stream`, accepting the given subprotocols in preference order
    pub fn new<P: AsRef<str>>(
        stream: Rc<dyn ByteStream>,
        protocols: &[P],
        options: ServerOptions,
    ) -> Self {
        let conn = HttpServerConnection::new(stream, options.config.clone());
        let state = Rc::new(ServerState {
            protocols: protocols.iter().map(|p| p.as_ref().to_owned()).collect(),
            options,
            connected: Signal::new(),
            rejected: Signal::new(),
        });
        let handler = state.clone();
        conn.on_request(move |conn, request| handler.handle_request(conn, request));
        Self { conn, state }
    }

    /// A WebSocket was accepted; receives the request URL
    pub fn on_connected(&self, listener: impl Fn(&str, &WebSocket) + 'static) {
        self.state.connected.connect(Rc::new(listener));
    }

    /// An upgrade request was refused
    pub fn on_rejected(&self, listener: impl Fn(&Error) + 'static) {
        self.state.rejected.connect(Rc::new(listener));
    }

    /// The HTTP connection underneath
    pub fn connection(&self) -> &HttpServerConnection {
        &self.conn
    }

    /// The accepted WebSocket, if any
    pub fn websocket(&self) -> Option<WebSocket> {
        self.conn.websocket()
    }
}

impl StreamHandler for WebSocketServer {
    fn handle_data(&self, data: &[u8]) {
        self.conn.handle_data(data);
    }

    fn handle_end(&self) {
        self.conn.handle_end();
    }

    fn handle_error(&self, error: &io::Error) {
        self.conn.handle_error(error);
    }

    fn handle_closed(&self) {
        self.conn.handle_closed();
    }
}

impl fmt::Debug for WebSocketServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketServer")
            .field("protocols", &self.state.protocols)
            .field("conn", &self.conn)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{OpCode, encode_frame};
    use crate::protocol::State;
    use crate::transport::mock::MockStream;

    const RFC_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    fn upgrade_request(url: &str, protocols: Option<&str>) -> String {
        let mut req = format!(
            "GET {url} HTTP/1.1\r\n\
             Host: localhost\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {RFC_KEY}\r\n\
             Sec-WebSocket-Version: 13\r\n"
        );
        if let Some(p) = protocols {
            req.push_str(&format!("Sec-WebSocket-Protocol: {p}\r\n"));
        }
        req.push_str("\r\n");
        req
    }

    fn masked(opcode: OpCode, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, opcode, payload, true, Some([1, 2, 3, 4]));
        buf.to_vec()
    }

    fn written(stream: &MockStream) -> String {
        String::from_utf8(stream.take_written()).unwrap()
    }

    #[test]
    fn test_request_collection_and_response() {
        let stream = MockStream::new();
        let conn = HttpServerConnection::new(stream.clone(), Config::default());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        conn.on_request(move |conn, req| {
            s.borrow_mut().push(req.clone());
            conn.send_response(200, "OK", "text/plain", Bytes::from_static(b"hello"), "");
        });

        let input = b"POST /submit HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\n\r\nabc";
        for chunk in input.chunks(5) {
            conn.handle_data(chunk);
        }

        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].method, "POST");
        assert_eq!(seen[0].url, "/submit");
        assert_eq!(seen[0].version, (1, 1));
        assert_eq!(seen[0].header("HOST"), Some("x"));
        assert_eq!(&seen[0].body[..], b"abc");
        assert!(seen[0].keep_alive);

        let response = written(&stream);
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Server: sockudo-wire\r\n"));
        assert!(response.contains("Content-Type: text/plain\r\n"));
        assert!(response.contains("Content-Length: 5\r\n"));
        assert!(!response.contains("Connection: close"));
        assert!(response.ends_with("\r\n\r\nhello"));

        stream.complete_writes();
        assert!(!stream.closed.get());
    }

    #[test]
    fn test_keep_alive_pipelined_requests() {
        let stream = MockStream::new();
        let conn = HttpServerConnection::new(stream.clone(), Config::default());
        let urls = Rc::new(RefCell::new(Vec::new()));
        let u = urls.clone();
        conn.on_request(move |_, req| u.borrow_mut().push(req.url.clone()));

        conn.handle_data(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n");
        conn.handle_data(b"GET /c HTTP/1.1\r\n\r\n");
        assert_eq!(*urls.borrow(), vec!["/a", "/b", "/c"]);
    }

    #[test]
    fn test_http10_closes_after_response() {
        let stream = MockStream::new();
        let conn = HttpServerConnection::new(stream.clone(), Config::default());
        conn.on_request(|conn, _| conn.send_error(404, "no such page"));
        conn.handle_data(b"GET /missing HTTP/1.0\r\n\r\n");

        let response = written(&stream);
        assert!(response.starts_with("HTTP/1.0 404 Not Found\r\n"));
        assert!(response.contains("Connection: close\r\n"));
        assert!(response.ends_with("404: Not Found!\r\nno such page"));

        assert!(!stream.closed.get());
        stream.complete_writes();
        assert!(stream.closed.get());
    }

    #[test]
    fn test_send_error_codes() {
        let stream = MockStream::new();
        let conn = HttpServerConnection::new(stream.clone(), Config::default());
        conn.on_request(|conn, req| {
            let code = req.url[1..].parse().unwrap();
            conn.send_error(code, "");
        });

        for (code, line) in [
            (400, "400 Bad Request"),
            (401, "401 Unauthorized"),
            (403, "403 Forbidden"),
            (500, "500 Internal Server Error"),
            (503, "503 Service Unavailable"),
            (418, "501 Not Implemented"),
        ] {
            conn.handle_data(format!("GET /{code} HTTP/1.1\r\n\r\n").as_bytes());
            let response = written(&stream);
            assert!(response.starts_with(&format!("HTTP/1.1 {line}\r\n")), "{response}");
            assert_eq!(response.contains("WWW-Authenticate"), code == 401);
        }
    }

    #[test]
    fn test_static_response_gzip() {
        let stream = MockStream::new();
        let conn = HttpServerConnection::new(stream.clone(), Config::default());
        conn.on_request(|conn, _| {
            conn.send_static_response(200, "OK", "text/html", b"<html/>", true, "X-Test: 1\r\n");
        });
        conn.handle_data(b"GET / HTTP/1.1\r\n\r\n");
        let response = written(&stream);
        assert!(response.contains("Content-Encoding: gzip\r\nX-Test: 1\r\n\r\n<html/>"));
        assert!(response.contains("Content-Length: 7\r\n"));
    }

    #[test]
    fn test_malformed_request_closes() {
        let stream = MockStream::new();
        let conn = HttpServerConnection::new(stream.clone(), Config::default());
        conn.handle_data(b"GET /\x01 HTTP/1.1\r\n\r\n");
        assert!(!stream.closed.get());
        stream.complete_writes();
        assert!(stream.closed.get());
    }

    #[test]
    fn test_trailing_crlf_after_closing_request() {
        let stream = MockStream::new();
        let conn = HttpServerConnection::new(stream.clone(), Config::default());
        conn.on_request(|conn, _| {
            conn.send_response(200, "OK", "text/plain", Bytes::from_static(b"ok"), "");
        });

        conn.handle_data(b"POST / HTTP/1.0\r\nContent-Length: 2\r\n\r\nab\r\n");
        assert!(conn.shared.parser.borrow().error().is_none());
        assert!(written(&stream).starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(!stream.closed.get());
        stream.complete_writes();
        assert!(stream.closed.get());
    }

    #[test]
    fn test_garbage_after_request_flushes_response_first() {
        let stream = MockStream::new();
        let conn = HttpServerConnection::new(stream.clone(), Config::default());
        conn.on_request(|conn, _| {
            conn.send_response(200, "OK", "text/plain", Bytes::from_static(b"ok"), "");
        });

        conn.handle_data(b"GET / HTTP/1.0\r\n\r\nXYZ");
        assert!(conn.shared.parser.borrow().has_error());
        assert!(written(&stream).ends_with("\r\n\r\nok"));
        assert!(!stream.closed.get());
        assert_eq!(stream.pending_writes(), 2);
        stream.complete_writes();
        assert!(stream.closed.get());
    }

    #[test]
    fn test_declined_upgrade_resumes_http() {
        let stream = MockStream::new();
        let conn = HttpServerConnection::new(stream.clone(), Config::default());
        let urls = Rc::new(RefCell::new(Vec::new()));
        let u = urls.clone();
        conn.on_request(move |conn, req| {
            u.borrow_mut().push(req.url.clone());
            conn.send_error(404, "");
        });

        let mut input = upgrade_request("/ws", None).into_bytes();
        input.extend_from_slice(b"GET /next HTTP/1.1\r\n\r\n");
        conn.handle_data(&input);
        conn.handle_data(b"GET /next HTTP/1.1\r\n\r\n");
        conn.handle_data(b"GET /next HTTP/1.1\r\n\r\n");

        assert_eq!(*urls.borrow(), vec!["/ws", "/next", "/next", "/next"]);
        assert!(conn.websocket().is_none());
        assert!(conn.shared.upgrade_data.borrow().is_empty());
        stream.complete_writes();
        assert!(!stream.closed.get());
    }

    #[test]
    fn test_body_limit() {
        let stream = MockStream::new();
        let config = Config::builder().max_request_body(4).build();
        let conn = HttpServerConnection::new(stream.clone(), config);
        let calls = Rc::new(Cell::new(0));
        let c = calls.clone();
        conn.on_request(move |_, _| c.set(c.get() + 1));

        conn.handle_data(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123456789");
        assert_eq!(calls.get(), 0);
        let response = written(&stream);
        assert!(response.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
        stream.complete_writes();
        assert!(stream.closed.get());
    }

    #[test]
    fn test_accept_websocket_forwards_trailing_bytes() {
        let stream = MockStream::new();
        let conn = HttpServerConnection::new(stream.clone(), Config::default());
        let texts = Rc::new(RefCell::new(Vec::new()));
        let t = texts.clone();
        conn.on_request(move |conn, req| {
            assert!(req.is_websocket());
            let ws = conn.accept_websocket(&req.websocket).unwrap();
            let t = t.clone();
            ws.on_text(move |text, _| t.borrow_mut().push(text.to_string()));
        });

        let mut input = upgrade_request("/ws", None).into_bytes();
        input.extend(masked(OpCode::Text, b"early"));
        conn.handle_data(&input);

        let response = written(&stream);
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(texts.borrow().is_empty());

        stream.complete_writes();
        assert_eq!(*texts.borrow(), vec!["early"]);

        conn.handle_data(&masked(OpCode::Text, b"later"));
        assert_eq!(*texts.borrow(), vec!["early", "later"]);
        assert_eq!(conn.websocket().unwrap().state(), State::Open);
    }

    #[test]
    fn test_server_negotiates_protocol() {
        let stream = MockStream::new();
        let server = WebSocketServer::new(stream.clone(), &["v2", "v1"], ServerOptions::default());
        let connected = Rc::new(RefCell::new(None));
        let c = connected.clone();
        server.on_connected(move |url, ws| {
            *c.borrow_mut() = Some((url.to_string(), ws.protocol()));
        });

        server.handle_data(upgrade_request("/chat", Some("v1, v2")).as_bytes());
        assert_eq!(
            *connected.borrow(),
            Some(("/chat".to_string(), Some("v2".to_string())))
        );
        let response = written(&stream);
        assert!(response.contains("Sec-WebSocket-Protocol: v2\r\n"));
        stream.complete_writes();
        assert!(server.websocket().unwrap().is_open());
    }

    #[test]
    fn test_server_protocol_mismatch() {
        let stream = MockStream::new();
        let server = WebSocketServer::new(stream.clone(), &["v3"], ServerOptions::default());
        let codes = Rc::new(RefCell::new(Vec::new()));
        let c = codes.clone();
        server.on_rejected(move |e| c.borrow_mut().push(e.close_code()));

        server.handle_data(upgrade_request("/", Some("v1")).as_bytes());
        assert_eq!(*codes.borrow(), vec![1003]);
        let response = written(&stream);
        assert!(response.starts_with("HTTP/1.1 426 Upgrade Required\r\n"));
        assert!(response.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(server.websocket().is_none());
        stream.complete_writes();
        assert!(stream.closed.get());
    }

    #[test]
    fn test_server_url_and_host_checks() {
        let stream = MockStream::new();
        let options = ServerOptions {
            check_url: Some(Rc::new(|url: &str| url == "/ok")),
            ..Default::default()
        };
        let server = WebSocketServer::new(stream.clone(), &[] as &[&str], options);
        server.handle_data(upgrade_request("/nope", None).as_bytes());
        assert!(written(&stream).starts_with("HTTP/1.1 404 Not Found\r\n"));

        let stream = MockStream::new();
        let options = ServerOptions {
            check_host: Some(Rc::new(|host: &str| host == "example.com")),
            ..Default::default()
        };
        let server = WebSocketServer::new(stream.clone(), &[] as &[&str], options);
        server.handle_data(upgrade_request("/", None).as_bytes());
        assert!(written(&stream).starts_with("HTTP/1.1 401 Unauthorized\r\n"));
    }

    #[test]
    fn test_server_plain_request_gets_426() {
        let stream = MockStream::new();
        let server = WebSocketServer::new(stream.clone(), &[] as &[&str], ServerOptions::default());
        server.handle_data(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n");
        assert!(written(&stream).starts_with("HTTP/1.1 426 Upgrade Required\r\n"));
    }

    #[test]
    fn test_server_version_mismatch_closes_with_1003() {
        let stream = MockStream::new();
        let server = WebSocketServer::new(stream.clone(), &[] as &[&str], ServerOptions::default());
        let closed = Rc::new(Cell::new(0));
        let c = closed.clone();
        server.on_connected(move |_, ws| {
            let c = c.clone();
            ws.on_closed(move |code, _| c.set(code));
        });

        let request = upgrade_request("/", None).replace("Version: 13", "Version: 8");
        server.handle_data(request.as_bytes());
        assert!(written(&stream).starts_with("HTTP/1.1 426 Upgrade Required\r\n"));
        stream.complete_writes();
        assert_eq!(closed.get(), 1003);
    }
}
