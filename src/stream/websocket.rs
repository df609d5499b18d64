//! WebSocket connection over a [`ByteStream`]
//!
//! [`WebSocket`] binds a [`Protocol`] engine to a transport and to the
//! user's listeners. The host event loop pushes transport notifications in
//! through `handle_data`, `handle_end`, `handle_error` and `handle_closed`;
//! everything the engine decides (writes, shutdown, deliveries) comes back
//! out as [`Effect`]s and is executed here.
//!
//! The engine is never borrowed while a listener or the stream runs, so
//! listeners may freely send, close or register further listeners.
//!
//! # Example
//!
//! ```ignore
//! use sockudo_wire::{ClientOptions, WebSocket};
//!
//! let ws = WebSocket::client(stream, "/chat", "example.com", &["chat"], ClientOptions::default());
//! let weak = ws.downgrade();
//! ws.on_text(move |text, _fin| {
//!     if let Some(ws) = weak.upgrade() {
//!         ws.send_text(vec![text.to_owned().into()], |_, _| {});
//!     }
//! });
//! ```

use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::rc::{Rc, Weak};
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::{Config, MAX_FRAME_HEADER_SIZE};
use crate::client::ClientOptions;
use crate::error::{CloseReason, Result, from_io};
use crate::frame::{OpCode, OutgoingFrame};
use crate::handshake::{ClientHandshake, HandshakeStatus, ServerResponse, server_response};
use crate::protocol::{Effect, Protocol, Role, State, text_payload};
use crate::signal::Signal;
use crate::transport::{ByteStream, StreamHandler};

type OpenListener = dyn Fn(Option<&str>);
type ClosedListener = dyn Fn(u16, &str);
type TextListener = dyn Fn(&str, bool);
type DataListener = dyn Fn(&[u8], bool);
type ControlListener = dyn Fn(&[u8]);

#[derive(Default)]
struct Listeners {
    open: Signal<OpenListener>,
    closed: Signal<ClosedListener>,
    text: Signal<TextListener>,
    binary: Signal<DataListener>,
    ping: Signal<ControlListener>,
    pong: Signal<ControlListener>,
}

impl Listeners {
    fn clear(&self) {
        self.open.clear();
        self.closed.clear();
        self.text.clear();
        self.binary.clear();
        self.ping.clear();
        self.pong.clear();
    }
}

struct Shared {
    stream: Rc<dyn ByteStream>,
    engine: RefCell<Protocol>,
    /// Client handshake, dropped once the response is accepted or rejected
    handshake: RefCell<Option<ClientHandshake>>,
    /// Frames a server received before its 101 response was flushed
    early_input: RefCell<Vec<u8>>,
    protocol: RefCell<Option<String>>,
    listeners: Listeners,
    writes_in_flight: Cell<usize>,
    last_received: Cell<Option<Instant>>,
}

/// A WebSocket connection
///
/// Cheap to clone; all clones refer to the same connection. Listeners that
/// need the connection should capture a [`WeakWebSocket`] to avoid a
/// reference cycle. Listeners are dropped after `closed` fires.
#[derive(Clone)]
pub struct WebSocket {
    shared: Rc<Shared>,
}

/// Non-owning handle to a [`WebSocket`]
#[derive(Clone)]
pub struct WeakWebSocket {
    shared: Weak<Shared>,
}

impl WeakWebSocket {
    /// Get the connection back if it is still alive
    pub fn upgrade(&self) -> Option<WebSocket> {
        self.shared.upgrade().map(|shared| WebSocket { shared })
    }
}

impl fmt::Debug for WeakWebSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakWebSocket")
            .field("alive", &(self.shared.strong_count() > 0))
            .finish()
    }
}

impl WebSocket {
    fn with_engine(
        stream: Rc<dyn ByteStream>,
        engine: Protocol,
        handshake: Option<ClientHandshake>,
        protocol: Option<String>,
    ) -> Self {
        Self {
            shared: Rc::new(Shared {
                stream,
                engine: RefCell::new(engine),
                handshake: RefCell::new(handshake),
                early_input: RefCell::new(Vec::new()),
                protocol: RefCell::new(protocol),
                listeners: Listeners::default(),
                writes_in_flight: Cell::new(0),
                last_received: Cell::new(None),
            }),
        }
    }

    /// Start a client connection
    ///
    /// Writes the upgrade request for `path` on `host`, offering
    /// `protocols`, and arms the handshake timer if one is configured. The
    /// connection opens once a valid `101` response arrives through
    /// [`handle_data`](Self::handle_data).
    pub fn client<P: AsRef<str>>(
        stream: Rc<dyn ByteStream>,
        path: &str,
        host: &str,
        protocols: &[P],
        options: ClientOptions,
    ) -> Self {
        let mut engine = Protocol::new(Role::Client, &options.config);
        let offered = protocols.iter().map(|p| p.as_ref().to_owned()).collect();
        let handshake = ClientHandshake::new(engine.rng_mut(), offered, options.config.http_max_length);
        let request = handshake.request(host, path, &options.extra_headers);

        let ws = Self::with_engine(stream, engine, Some(handshake), None);
        debug!(host, path, "websocket client connecting");

        ws.shared.stream.stop_read();
        ws.shared.stream.start_read();

        let weak = ws.downgrade();
        ws.write_internal(vec![request], move |result| {
            if let (Err(e), Some(ws)) = (result, weak.upgrade()) {
                ws.terminate(CloseReason::ABNORMAL, &format!("error writing request: {e}"));
            }
        });

        if let Some(timeout) = options.handshake_timeout {
            let weak = ws.downgrade();
            ws.shared.stream.set_timer(
                timeout,
                Box::new(move || {
                    if let Some(ws) = weak.upgrade() {
                        ws.handshake_timed_out();
                    }
                }),
            );
        }

        ws
    }

    /// Start a server connection for an already-parsed upgrade request
    ///
    /// Sends the `101` response (or `426` when `version` is not 13). The
    /// connection opens when the response has been written. A version
    /// mismatch terminates the connection with 1003 after the `426` is
    /// flushed.
    pub fn server(
        stream: Rc<dyn ByteStream>,
        key: &str,
        version: &str,
        protocol: Option<&str>,
        config: Config,
    ) -> Self {
        let engine = Protocol::new(Role::Server, &config);
        let ws = Self::with_engine(stream, engine, None, protocol.map(String::from));

        ws.shared.stream.stop_read();
        ws.shared.stream.start_read();

        let weak = ws.downgrade();
        match server_response(key, version, protocol) {
            ServerResponse::Accepted(response) => {
                debug!(?protocol, "websocket upgrade accepted");
                ws.write_internal(vec![response], move |result| {
                    let Some(ws) = weak.upgrade() else {
                        return;
                    };
                    match result {
                        Ok(()) => ws.server_open(),
                        Err(e) => ws.terminate(
                            CloseReason::ABNORMAL,
                            &format!("error writing upgrade response: {e}"),
                        ),
                    }
                });
            }
            ServerResponse::VersionMismatch(response) => {
                debug!(version, "websocket version mismatch");
                ws.write_internal(vec![response], move |_| {
                    if let Some(ws) = weak.upgrade() {
                        ws.terminate(CloseReason::UNSUPPORTED, "unsupported protocol version");
                    }
                });
            }
        }

        ws
    }

    /// Non-owning handle for use inside listeners and callbacks
    pub fn downgrade(&self) -> WeakWebSocket {
        WeakWebSocket {
            shared: Rc::downgrade(&self.shared),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Current state
    pub fn state(&self) -> State {
        self.shared.engine.borrow().state()
    }

    /// Check if the connection is open
    pub fn is_open(&self) -> bool {
        self.state() == State::Open
    }

    /// Endpoint role
    pub fn role(&self) -> Role {
        self.shared.engine.borrow().role()
    }

    /// Negotiated subprotocol
    pub fn protocol(&self) -> Option<String> {
        self.shared.protocol.borrow().clone()
    }

    /// When data last arrived from the peer
    pub fn last_received(&self) -> Option<Instant> {
        self.shared.last_received.get()
    }

    /// Whether a write issued by this connection has not completed yet
    pub fn is_write_in_progress(&self) -> bool {
        self.shared.writes_in_flight.get() > 0
    }

    /// The underlying transport
    pub fn stream(&self) -> Rc<dyn ByteStream> {
        self.shared.stream.clone()
    }

    /// Set the maximum accumulated message size
    pub fn set_max_message_size(&self, size: usize) {
        self.shared.engine.borrow_mut().set_max_message_size(size);
    }

    /// Choose between whole-message and per-fragment delivery
    pub fn set_combine_fragments(&self, combine: bool) {
        self.shared.engine.borrow_mut().set_combine_fragments(combine);
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    /// Connection opened; receives the negotiated protocol
    pub fn on_open(&self, listener: impl Fn(Option<&str>) + 'static) {
        self.shared.listeners.open.connect(Rc::new(listener));
    }

    /// Connection reached a terminal state; fires exactly once
    pub fn on_closed(&self, listener: impl Fn(u16, &str) + 'static) {
        self.shared.listeners.closed.connect(Rc::new(listener));
    }

    /// Text message or fragment
    pub fn on_text(&self, listener: impl Fn(&str, bool) + 'static) {
        self.shared.listeners.text.connect(Rc::new(listener));
    }

    /// Binary message or fragment
    pub fn on_binary(&self, listener: impl Fn(&[u8], bool) + 'static) {
        self.shared.listeners.binary.connect(Rc::new(listener));
    }

    /// Ping received
    pub fn on_ping(&self, listener: impl Fn(&[u8]) + 'static) {
        self.shared.listeners.ping.connect(Rc::new(listener));
    }

    /// Pong received
    pub fn on_pong(&self, listener: impl Fn(&[u8]) + 'static) {
        self.shared.listeners.pong.connect(Rc::new(listener));
    }

    // ========================================================================
    // Transport notifications
    // ========================================================================

    /// Bytes arrived from the peer
    pub fn handle_data(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let state = self.state();
        if state.is_terminal() {
            return;
        }
        self.shared.last_received.set(Some(Instant::now()));

        if state == State::Connecting {
            if self.shared.handshake.borrow().is_none() {
                // Server waiting for its 101 to flush; at most one frame's worth
                let limit = self.shared.engine.borrow().max_message_size() + MAX_FRAME_HEADER_SIZE;
                let buffered = self.shared.early_input.borrow().len();
                if buffered + data.len() > limit {
                    debug!(limit, "too much data before the handshake completed");
                    self.fail(CloseReason::TOO_BIG, "message too large");
                    return;
                }
                self.shared.early_input.borrow_mut().extend_from_slice(data);
                return;
            }
            self.receive_handshake(data);
            return;
        }
        self.process_frames(data);
    }

    /// The peer closed its write side
    ///
    /// After the closing handshake this is the expected end of the
    /// connection and the stream is simply closed.
    pub fn handle_end(&self) {
        if self.state().is_terminal() {
            self.shared.stream.close();
            return;
        }
        self.terminate(CloseReason::ABNORMAL, "remote end closed connection");
    }

    /// The transport reported an error
    pub fn handle_error(&self, error: &io::Error) {
        if self.state().is_terminal() {
            self.shared.stream.close();
            return;
        }
        self.terminate(CloseReason::ABNORMAL, &format!("stream error: {error}"));
    }

    /// The transport is gone; nothing more can be written
    pub fn handle_closed(&self) {
        self.run_engine(|engine, effects| {
            engine.set_closed(CloseReason::ABNORMAL, "handle closed", false, effects)
        });
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Send one frame with the given opcode
    ///
    /// `done` receives `data` back once the write finished or failed.
    pub fn send<F>(&self, opcode: OpCode, fin: bool, data: Vec<Bytes>, done: F)
    where
        F: FnOnce(Vec<Bytes>, Result<()>) + 'static,
    {
        self.send_frames(vec![OutgoingFrame::new(opcode, fin, data)], done);
    }

    /// Send a complete text message
    pub fn send_text<F>(&self, data: Vec<Bytes>, done: F)
    where
        F: FnOnce(Vec<Bytes>, Result<()>) + 'static,
    {
        self.send_frames(vec![OutgoingFrame::text(data)], done);
    }

    /// Send a complete binary message
    pub fn send_binary<F>(&self, data: Vec<Bytes>, done: F)
    where
        F: FnOnce(Vec<Bytes>, Result<()>) + 'static,
    {
        self.send_frames(vec![OutgoingFrame::binary(data)], done);
    }

    /// Send the first fragment of a text message
    pub fn send_text_fragment<F>(&self, data: Vec<Bytes>, done: F)
    where
        F: FnOnce(Vec<Bytes>, Result<()>) + 'static,
    {
        self.send_frames(vec![OutgoingFrame::text_fragment(data)], done);
    }

    /// Send the first fragment of a binary message
    pub fn send_binary_fragment<F>(&self, data: Vec<Bytes>, done: F)
    where
        F: FnOnce(Vec<Bytes>, Result<()>) + 'static,
    {
        self.send_frames(vec![OutgoingFrame::binary_fragment(data)], done);
    }

    /// Send a continuation fragment; `fin` ends the message
    pub fn send_fragment<F>(&self, data: Vec<Bytes>, fin: bool, done: F)
    where
        F: FnOnce(Vec<Bytes>, Result<()>) + 'static,
    {
        self.send_frames(vec![OutgoingFrame::fragment(data, fin)], done);
    }

    /// Send a ping (payload of at most 125 bytes)
    pub fn send_ping<F>(&self, data: Vec<Bytes>, done: F)
    where
        F: FnOnce(Vec<Bytes>, Result<()>) + 'static,
    {
        self.send_frames(vec![OutgoingFrame::ping(data)], done);
    }

    /// Send a pong (payload of at most 125 bytes)
    pub fn send_pong<F>(&self, data: Vec<Bytes>, done: F)
    where
        F: FnOnce(Vec<Bytes>, Result<()>) + 'static,
    {
        self.send_frames(vec![OutgoingFrame::pong(data)], done);
    }

    /// Send several frames in one write
    ///
    /// `done` receives the payload buffers of all frames, in order. Sending
    /// before the connection is open fails with
    /// [`WouldBlock`](crate::Error::WouldBlock), after it left the open state
    /// with [`ConnectionClosed`](crate::Error::ConnectionClosed); `done` then
    /// runs before this call returns.
    pub fn send_frames<F>(&self, frames: Vec<OutgoingFrame>, done: F)
    where
        F: FnOnce(Vec<Bytes>, Result<()>) + 'static,
    {
        let encoded = self.shared.engine.borrow_mut().encode_frames(&frames);
        let data: Vec<Bytes> = frames.into_iter().flat_map(|frame| frame.data).collect();

        let wire = match encoded {
            Ok(wire) => wire,
            Err(e) => {
                trace!(error = %e, "send rejected");
                done(data, Err(e));
                return;
            }
        };

        self.begin_write();
        let weak = self.downgrade();
        self.shared.stream.write(
            wire,
            Box::new(move |_, result| {
                if let Some(ws) = weak.upgrade() {
                    ws.end_write();
                }
                done(data, result.map_err(from_io));
            }),
        );
    }

    /// Send frames unless a write is already in progress
    ///
    /// Returns the frames untouched (and drops `done` without calling it)
    /// when the transport is still busy with an earlier write.
    pub fn try_send_frames<F>(
        &self,
        frames: Vec<OutgoingFrame>,
        done: F,
    ) -> std::result::Result<(), Vec<OutgoingFrame>>
    where
        F: FnOnce(Vec<Bytes>, Result<()>) + 'static,
    {
        if self.is_write_in_progress() {
            return Err(frames);
        }
        self.send_frames(frames, done);
        Ok(())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the closing handshake
    ///
    /// Writes a close frame; `closed` fires when the peer answers or the
    /// transport ends. Closing before the connection opened terminates it.
    pub fn close(&self, code: u16, reason: &str) {
        self.run_engine(|engine, effects| engine.close(code, reason, effects));
    }

    /// Send a close frame (if open) and shut the transport down at once
    pub fn fail(&self, code: u16, reason: &str) {
        self.run_engine(|engine, effects| engine.fail(code, reason, effects));
    }

    /// Shut the transport down without a close frame
    pub fn terminate(&self, code: u16, reason: &str) {
        self.run_engine(|engine, effects| engine.terminate(code, reason, effects));
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn receive_handshake(&self, data: &[u8]) {
        let status = {
            let mut handshake = self.shared.handshake.borrow_mut();
            match handshake.as_mut() {
                Some(handshake) => handshake.receive(data),
                None => return,
            }
        };

        match status {
            HandshakeStatus::Pending => {}
            HandshakeStatus::Open { protocol, consumed } => {
                self.shared.handshake.replace(None);
                self.shared.protocol.replace(protocol.clone());
                self.shared.engine.borrow_mut().open();
                self.shared
                    .listeners
                    .open
                    .emit(|listener| listener(protocol.as_deref()));
                if consumed < data.len() {
                    self.process_frames(&data[consumed..]);
                }
            }
            HandshakeStatus::Failed(e) => {
                debug!(error = %e, "websocket handshake failed");
                self.shared.handshake.replace(None);
                self.terminate(e.close_code(), &e.to_string());
            }
        }
    }

    fn handshake_timed_out(&self) {
        let pending = self.shared.handshake.borrow().is_some();
        if pending && self.state() == State::Connecting {
            debug!("websocket handshake timed out");
            self.terminate(CloseReason::ABNORMAL, "connection timed out");
        }
    }

    fn server_open(&self) {
        if self.state() != State::Connecting {
            return;
        }
        self.shared.engine.borrow_mut().open();
        let protocol = self.protocol();
        self.shared
            .listeners
            .open
            .emit(|listener| listener(protocol.as_deref()));

        let early = self.shared.early_input.take();
        if !early.is_empty() {
            self.process_frames(&early);
        }
    }

    fn process_frames(&self, mut data: &[u8]) {
        let mut effects = Vec::new();
        while !data.is_empty() {
            let result = self.shared.engine.borrow_mut().receive(&mut data, &mut effects);
            if let Err(e) = result {
                debug!(error = %e, "websocket protocol error");
                self.shared
                    .engine
                    .borrow_mut()
                    .fail(e.close_code(), &e.to_string(), &mut effects);
                self.run_effects(&mut effects);
                return;
            }
            self.run_effects(&mut effects);
            if self.state().is_terminal() {
                return;
            }
        }
    }

    fn run_engine(&self, f: impl FnOnce(&mut Protocol, &mut Vec<Effect>)) {
        let mut effects = Vec::new();
        f(&mut self.shared.engine.borrow_mut(), &mut effects);
        self.run_effects(&mut effects);
    }

    fn run_effects(&self, effects: &mut Vec<Effect>) {
        let listeners = &self.shared.listeners;
        for effect in effects.drain(..) {
            match effect {
                Effect::Text { data, fin } => {
                    let text = text_payload(&data);
                    listeners.text.emit(|listener| listener(text, fin));
                }
                Effect::Binary { data, fin } => {
                    listeners.binary.emit(|listener| listener(&data, fin));
                }
                Effect::Ping(data) => listeners.ping.emit(|listener| listener(&data)),
                Effect::Pong(data) => listeners.pong.emit(|listener| listener(&data)),
                Effect::Write(wire) => self.write_internal(wire, |result| {
                    if let Err(e) = result {
                        debug!(error = %e, "control frame write failed");
                    }
                }),
                Effect::Shutdown => self.shared.stream.shutdown(),
                Effect::Closed(reason) => self.emit_closed(reason),
            }
        }
    }

    fn emit_closed(&self, reason: CloseReason) {
        self.shared.handshake.replace(None);
        self.shared.early_input.take();
        self.shared
            .listeners
            .closed
            .emit(|listener| listener(reason.code, &reason.reason));
        self.shared.listeners.clear();
    }

    /// Write bytes owned by the connection (handshake, control frames)
    fn write_internal(&self, wire: Vec<Bytes>, done: impl FnOnce(Result<()>) + 'static) {
        self.begin_write();
        let weak = self.downgrade();
        self.shared.stream.write(
            wire,
            Box::new(move |_, result| {
                if let Some(ws) = weak.upgrade() {
                    ws.end_write();
                }
                if let Err(e) = &result {
                    warn!(error = %e, "websocket write failed");
                }
                done(result.map_err(from_io));
            }),
        );
    }

    fn begin_write(&self) {
        let n = self.shared.writes_in_flight.get();
        self.shared.writes_in_flight.set(n + 1);
    }

    fn end_write(&self) {
        let n = self.shared.writes_in_flight.get();
        self.shared.writes_in_flight.set(n.saturating_sub(1));
    }
}

impl StreamHandler for WebSocket {
    fn handle_data(&self, data: &[u8]) {
        WebSocket::handle_data(self, data);
    }

    fn handle_end(&self) {
        WebSocket::handle_end(self);
    }

    fn handle_error(&self, error: &io::Error) {
        WebSocket::handle_error(self, error);
    }

    fn handle_closed(&self) {
        WebSocket::handle_closed(self);
    }
}

impl fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocket")
            .field("engine", &*self.shared.engine.borrow())
            .field("protocol", &*self.shared.protocol.borrow())
            .field("writes_in_flight", &self.shared.writes_in_flight.get())
            .finish_non_exhaustive()
    }
}
