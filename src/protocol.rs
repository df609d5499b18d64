//! WebSocket protocol implementation
//!
//! This module handles the WebSocket protocol state machine, including:
//! - Incremental frame decoding over arbitrarily split input
//! - Message fragmentation and reassembly
//! - Control frame handling (ping/pong/close)
//! - State transitions
//!
//! [`Protocol`] performs no I/O. It consumes bytes and records what should
//! happen as a list of [`Effect`]s, which the owning connection executes
//! after releasing its borrow of the engine.

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::Config;
use crate::error::{CloseReason, Error, Result};
use crate::frame::{FrameHeader, FrameParser, OpCode, OutgoingFrame, close_payload};
use crate::mask::{MaskRng, apply_mask};
use crate::utf8::{validate_utf8, validate_utf8_incomplete};

/// WebSocket endpoint role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client (must mask frames, expects unmasked frames)
    Client,
    /// Server (must not mask frames, expects masked frames, shuts the
    /// transport down after echoing a close)
    Server,
}

impl Role {
    /// Whether frames received in this role must carry a mask
    #[inline]
    pub fn expects_masked(self) -> bool {
        self == Role::Server
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Handshake in progress
    Connecting,
    /// Normal operation
    Open,
    /// Close frame sent, waiting for the peer's close
    Closing,
    /// Failed with a protocol or transport error
    Failed,
    /// Connection closed
    Closed,
}

impl State {
    /// Failed and Closed are final
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Failed | State::Closed)
    }
}

/// Something the connection must do on behalf of the engine
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Deliver text (validated UTF-8)
    Text {
        /// Message or fragment payload
        data: Bytes,
        /// Last fragment of the message
        fin: bool,
    },
    /// Deliver binary data
    Binary {
        /// Message or fragment payload
        data: Bytes,
        /// Last fragment of the message
        fin: bool,
    },
    /// Deliver a received ping
    Ping(Bytes),
    /// Deliver a received pong
    Pong(Bytes),
    /// Write encoded frames to the transport
    Write(Vec<Bytes>),
    /// Shut the transport down once pending writes are flushed
    Shutdown,
    /// The connection reached a terminal state
    Closed(CloseReason),
}

/// View a delivered text payload as `&str`
#[inline]
pub(crate) fn text_payload(data: &Bytes) -> &str {
    // SAFETY: text payloads are UTF-8 validated before an Effect::Text is emitted
    unsafe { std::str::from_utf8_unchecked(data) }
}

/// WebSocket protocol handler
///
/// Handles frame parsing, message assembly, and control frame processing.
pub struct Protocol {
    /// Endpoint role
    role: Role,
    /// Current state
    state: State,
    /// Frame header decoder
    parser: FrameParser,
    /// Header of the frame whose payload is being buffered
    header: Option<FrameHeader>,
    /// Payload bytes still expected for the current frame
    remaining: usize,
    /// Data payload accumulator
    payload: BytesMut,
    /// Offset in `payload` where the current frame starts
    frame_start: usize,
    /// Control frame payload, kept apart so it never disturbs a fragment
    control: BytesMut,
    /// Opcode of the fragmented message in progress
    fragment_opcode: Option<OpCode>,
    /// Maximum message size
    max_message_size: usize,
    /// Deliver complete messages rather than individual fragments
    combine_fragments: bool,
    /// Answer pings automatically
    auto_pong: bool,
    /// Masking key source
    rng: MaskRng,
}

impl Protocol {
    /// Create a new protocol handler in the Connecting state
    pub fn new(role: Role, config: &Config) -> Self {
        Self::with_rng(role, config, MaskRng::new())
    }

    /// Create a protocol handler with an explicit masking key source
    pub fn with_rng(role: Role, config: &Config, rng: MaskRng) -> Self {
        Self {
            role,
            state: State::Connecting,
            parser: FrameParser::new(role.expects_masked()),
            header: None,
            remaining: 0,
            payload: BytesMut::new(),
            frame_start: 0,
            control: BytesMut::new(),
            fragment_opcode: None,
            max_message_size: config.max_message_size,
            combine_fragments: config.combine_fragments,
            auto_pong: config.auto_pong,
            rng,
        }
    }

    /// Endpoint role
    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current state
    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    /// Check if the connection is open
    #[inline]
    pub fn is_open(&self) -> bool {
        self.state == State::Open
    }

    /// Maximum accumulated message size
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Set the maximum accumulated message size
    pub fn set_max_message_size(&mut self, size: usize) {
        self.max_message_size = size;
    }

    /// Choose between whole-message and per-fragment delivery
    pub fn set_combine_fragments(&mut self, combine: bool) {
        self.combine_fragments = combine;
    }

    /// Enable or disable automatic pong replies
    pub fn set_auto_pong(&mut self, auto_pong: bool) {
        self.auto_pong = auto_pong;
    }

    /// Random source owned by this connection
    pub fn rng_mut(&mut self) -> &mut MaskRng {
        &mut self.rng
    }

    /// Handshake finished: Connecting -> Open
    pub fn open(&mut self) {
        if self.state == State::Connecting {
            debug!(role = ?self.role, "websocket open");
            self.state = State::Open;
        }
    }

    // ========================================================================
    // Incoming
    // ========================================================================

    /// Consume bytes from the front of `data`
    ///
    /// Returns after one complete frame has been dispatched or when `data`
    /// runs dry, so the caller can run effects (and listeners) between
    /// frames. Input is ignored once the connection is terminal. An error is
    /// fatal; map it with [`Error::close_code`] and [`Protocol::fail`].
    pub fn receive(&mut self, data: &mut &[u8], effects: &mut Vec<Effect>) -> Result<()> {
        if self.state.is_terminal() {
            *data = &[];
            return Ok(());
        }

        let header = match self.header.take() {
            Some(header) => header,
            None => match self.parser.parse_header(data)? {
                Some(header) => {
                    self.begin_frame(&header)?;
                    header
                }
                None => return Ok(()),
            },
        };

        let n = self.remaining.min(data.len());
        if n > 0 {
            let target = if header.opcode.is_control() {
                &mut self.control
            } else {
                &mut self.payload
            };
            target.extend_from_slice(&data[..n]);
            *data = &data[n..];
            self.remaining -= n;
        }

        if self.remaining > 0 {
            self.header = Some(header);
            return Ok(());
        }

        self.finish_frame(header, effects)
    }

    /// Size check and buffer setup for a freshly decoded header
    fn begin_frame(&mut self, header: &FrameHeader) -> Result<()> {
        let accumulated = if header.opcode.is_control() {
            0
        } else {
            self.payload.len()
        };
        if accumulated as u64 + header.payload_len > self.max_message_size as u64 {
            debug!(
                accumulated,
                frame = header.payload_len,
                max = self.max_message_size,
                "message too large"
            );
            return Err(Error::MessageTooLarge);
        }

        // Bounded by max_message_size above
        self.remaining = header.payload_len as usize;
        if header.opcode.is_control() {
            self.control.clear();
            self.control.reserve(self.remaining);
        } else {
            self.frame_start = self.payload.len();
            self.payload.reserve(self.remaining);
        }
        Ok(())
    }

    fn finish_frame(&mut self, header: FrameHeader, effects: &mut Vec<Effect>) -> Result<()> {
        trace!(opcode = ?header.opcode, fin = header.fin, len = header.payload_len, "frame received");

        match header.opcode {
            OpCode::Continuation => {
                self.unmask_data(&header);
                self.handle_continuation(header.fin, effects)
            }
            OpCode::Text | OpCode::Binary => {
                self.unmask_data(&header);
                self.handle_data(header.opcode, header.fin, effects)
            }
            OpCode::Close => {
                let data = self.take_control(&header);
                self.handle_close(&data, effects)
            }
            OpCode::Ping => {
                let data = self.take_control(&header);
                if self.auto_pong && self.state == State::Open {
                    let pong = self.encode_control(OpCode::Pong, data.clone());
                    effects.push(Effect::Write(pong));
                }
                effects.push(Effect::Ping(data));
                Ok(())
            }
            OpCode::Pong => {
                let data = self.take_control(&header);
                effects.push(Effect::Pong(data));
                Ok(())
            }
        }
    }

    #[inline]
    fn unmask_data(&mut self, header: &FrameHeader) {
        if let Some(mask) = header.mask {
            apply_mask(&mut self.payload[self.frame_start..], mask);
        }
    }

    #[inline]
    fn take_control(&mut self, header: &FrameHeader) -> Bytes {
        if let Some(mask) = header.mask {
            apply_mask(&mut self.control, mask);
        }
        self.control.split().freeze()
    }

    /// Handle continuation frame
    fn handle_continuation(&mut self, fin: bool, effects: &mut Vec<Effect>) -> Result<()> {
        let opcode = self
            .fragment_opcode
            .ok_or(Error::Protocol("continuation frame without a pending fragment"))?;
        if fin {
            self.fragment_opcode = None;
        }
        self.deliver(opcode, fin, effects)
    }

    /// Handle text or binary frame
    fn handle_data(&mut self, opcode: OpCode, fin: bool, effects: &mut Vec<Effect>) -> Result<()> {
        if self.fragment_opcode.is_some() {
            return Err(Error::Protocol("expected continuation frame"));
        }
        if !fin {
            self.fragment_opcode = Some(opcode);
        }
        self.deliver(opcode, fin, effects)
    }

    /// Emit the buffered payload according to the fragment policy
    fn deliver(&mut self, opcode: OpCode, fin: bool, effects: &mut Vec<Effect>) -> Result<()> {
        if self.combine_fragments {
            if !fin {
                return Ok(());
            }
            let data = self.payload.split().freeze();
            if opcode == OpCode::Text && !validate_utf8(&data) {
                return Err(Error::InvalidUtf8);
            }
            effects.push(message(opcode, data, true));
            return Ok(());
        }

        // Per-fragment delivery: an incomplete UTF-8 tail stays buffered
        // and is prepended to the next fragment.
        let data = if opcode == OpCode::Text {
            let valid = validate_utf8_incomplete(&self.payload).ok_or(Error::InvalidUtf8)?;
            if fin && valid != self.payload.len() {
                return Err(Error::InvalidUtf8);
            }
            self.payload.split_to(valid).freeze()
        } else {
            self.payload.split().freeze()
        };
        effects.push(message(opcode, data, fin));
        Ok(())
    }

    /// Handle close frame
    fn handle_close(&mut self, data: &[u8], effects: &mut Vec<Effect>) -> Result<()> {
        let reason = match data.len() {
            0 => CloseReason::new(CloseReason::NO_STATUS, ""),
            1 => return Err(Error::Protocol("invalid close frame payload")),
            _ => {
                let code = u16::from_be_bytes([data[0], data[1]]);
                if !CloseReason::is_valid_code(code) {
                    return Err(Error::InvalidCloseCode(code));
                }
                let text =
                    simdutf8::basic::from_utf8(&data[2..]).map_err(|_| Error::InvalidUtf8)?;
                CloseReason::new(code, text)
            }
        };

        debug!(code = reason.code, reason = %reason.reason, state = ?self.state, "close frame received");

        if self.state != State::Closing {
            let echo = self.encode_control(OpCode::Close, close_payload(reason.code, &reason.reason));
            effects.push(Effect::Write(echo));
        }
        self.state = State::Closed;
        effects.push(Effect::Closed(reason));
        if self.role == Role::Server {
            effects.push(Effect::Shutdown);
        }
        Ok(())
    }

    // ========================================================================
    // Outgoing
    // ========================================================================

    #[inline]
    fn next_mask(&mut self) -> Option<[u8; 4]> {
        match self.role {
            Role::Client => Some(self.rng.mask()),
            Role::Server => None,
        }
    }

    fn encode_control(&mut self, opcode: OpCode, payload: Bytes) -> Vec<Bytes> {
        let frame = OutgoingFrame::new(opcode, true, vec![payload]);
        let mut out = Vec::with_capacity(2);
        let mask = self.next_mask();
        frame.encode_into(mask, &mut out);
        out
    }

    /// Serialize frames for sending
    ///
    /// Fails with [`Error::WouldBlock`] while connecting and
    /// [`Error::ConnectionClosed`] once the connection left the open state.
    /// Client frames get a fresh masking key each.
    pub fn encode_frames(&mut self, frames: &[OutgoingFrame]) -> Result<Vec<Bytes>> {
        match self.state {
            State::Open => {}
            State::Connecting => return Err(Error::WouldBlock),
            _ => return Err(Error::ConnectionClosed),
        }
        for frame in frames {
            frame.validate()?;
        }

        let mut out = Vec::with_capacity(frames.len() * 2);
        for frame in frames {
            let mask = self.next_mask();
            frame.encode_into(mask, &mut out);
            trace!(opcode = ?frame.opcode, fin = frame.fin, len = frame.payload_len(), "frame queued");
        }
        Ok(out)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the closing handshake
    ///
    /// From Open a close frame is written and the state becomes Closing.
    /// While still connecting there is nobody to talk to, so the connection
    /// is terminated instead.
    pub fn close(&mut self, code: u16, reason: &str, effects: &mut Vec<Effect>) {
        match self.state {
            State::Open => {
                let frame = self.encode_control(OpCode::Close, close_payload(code, reason));
                effects.push(Effect::Write(frame));
                self.state = State::Closing;
                debug!(code, "closing");
            }
            State::Connecting => self.terminate(code, reason, effects),
            _ => {}
        }
    }

    /// Fail the connection: close frame (if open), Failed, shutdown
    pub fn fail(&mut self, code: u16, reason: &str, effects: &mut Vec<Effect>) {
        if self.state.is_terminal() {
            return;
        }
        if self.state == State::Open {
            let frame = self.encode_control(OpCode::Close, close_payload(code, reason));
            effects.push(Effect::Write(frame));
        }
        self.set_closed(code, reason, true, effects);
        effects.push(Effect::Shutdown);
    }

    /// Terminate immediately without a close frame
    pub fn terminate(&mut self, code: u16, reason: &str, effects: &mut Vec<Effect>) {
        if self.state.is_terminal() {
            return;
        }
        self.set_closed(code, reason, false, effects);
        effects.push(Effect::Shutdown);
    }

    /// Enter a terminal state and report it
    pub fn set_closed(&mut self, code: u16, reason: &str, failed: bool, effects: &mut Vec<Effect>) {
        if self.state.is_terminal() {
            return;
        }
        self.state = if failed { State::Failed } else { State::Closed };
        debug!(code, reason, state = ?self.state, "websocket closed");
        effects.push(Effect::Closed(CloseReason::new(code, reason)));
    }
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("fragment_opcode", &self.fragment_opcode)
            .field("buffered", &self.payload.len())
            .finish_non_exhaustive()
    }
}

#[inline]
fn message(opcode: OpCode, data: Bytes, fin: bool) -> Effect {
    if opcode == OpCode::Text {
        Effect::Text { data, fin }
    } else {
        Effect::Binary { data, fin }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_frame;

    const MASK: [u8; 4] = [0x11, 0x22, 0x33, 0x44];

    fn server() -> Protocol {
        let mut p = Protocol::with_rng(Role::Server, &Config::default(), MaskRng::from_seed(1));
        p.open();
        p
    }

    fn client() -> Protocol {
        let mut p = Protocol::with_rng(Role::Client, &Config::default(), MaskRng::from_seed(2));
        p.open();
        p
    }

    /// A frame as a client would put it on the wire
    fn masked(opcode: OpCode, payload: &[u8], fin: bool) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, opcode, payload, fin, Some(MASK));
        buf.to_vec()
    }

    fn unmasked(opcode: OpCode, payload: &[u8], fin: bool) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, opcode, payload, fin, None);
        buf.to_vec()
    }

    fn feed(p: &mut Protocol, bytes: &[u8]) -> Result<Vec<Effect>> {
        let mut effects = Vec::new();
        let mut data = bytes;
        while !data.is_empty() {
            p.receive(&mut data, &mut effects)?;
        }
        Ok(effects)
    }

    fn text(s: &str, fin: bool) -> Effect {
        Effect::Text {
            data: Bytes::copy_from_slice(s.as_bytes()),
            fin,
        }
    }

    #[test]
    fn test_receive_text() {
        let mut p = server();
        let effects = feed(&mut p, &masked(OpCode::Text, b"hello", true)).unwrap();
        assert_eq!(effects, vec![text("hello", true)]);
    }

    #[test]
    fn test_receive_split_byte_by_byte() {
        let mut p = server();
        let wire = masked(OpCode::Binary, &[5u8; 200], true);
        let mut effects = Vec::new();
        for byte in &wire {
            let mut data: &[u8] = std::slice::from_ref(byte);
            p.receive(&mut data, &mut effects).unwrap();
        }
        assert_eq!(
            effects,
            vec![Effect::Binary {
                data: Bytes::from(vec![5u8; 200]),
                fin: true
            }]
        );
    }

    #[test]
    fn test_receive_stops_after_each_frame() {
        let mut p = server();
        let mut wire = masked(OpCode::Text, b"one", true);
        wire.extend(masked(OpCode::Text, b"two", true));
        let mut data = &wire[..];
        let mut effects = Vec::new();
        p.receive(&mut data, &mut effects).unwrap();
        assert_eq!(effects, vec![text("one", true)]);
        assert_eq!(data.len(), wire.len() / 2);
    }

    #[test]
    fn test_mask_direction() {
        let mut p = server();
        let err = feed(&mut p, &unmasked(OpCode::Text, b"hi", true)).unwrap_err();
        assert_eq!(err.close_code(), 1002);

        let mut p = client();
        let err = feed(&mut p, &masked(OpCode::Text, b"hi", true)).unwrap_err();
        assert_eq!(err.close_code(), 1002);
    }

    #[test]
    fn test_continuation_without_fragment() {
        let mut p = server();
        let err = feed(&mut p, &masked(OpCode::Continuation, b"x", true)).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(err.close_code(), 1002);
    }

    #[test]
    fn test_new_message_while_fragment_pending() {
        let mut p = server();
        let mut wire = masked(OpCode::Text, b"part", false);
        wire.extend(masked(OpCode::Binary, b"other", true));
        let err = feed(&mut p, &wire).unwrap_err();
        assert_eq!(err.close_code(), 1002);
    }

    #[test]
    fn test_invalid_opcode() {
        for opcode in [0x3u8, 0x7, 0xB, 0xF] {
            let mut p = server();
            let mut wire = vec![0x80 | opcode, 0x80];
            wire.extend_from_slice(&MASK);
            let err = feed(&mut p, &wire).unwrap_err();
            assert!(matches!(err, Error::Protocol(_)), "opcode {opcode:#x}");
            assert_eq!(err.close_code(), 1002);
        }
    }

    #[test]
    fn test_unfinished_control_frame() {
        let mut p = client();
        // ping with FIN clear
        let err = feed(&mut p, &[0x09, 0x00]).unwrap_err();
        assert_eq!(err.close_code(), 1002);
    }

    #[test]
    fn test_single_frame_too_large() {
        let mut p = server();
        let payload = vec![0u8; 128 * 1024 + 1];
        let wire = masked(OpCode::Binary, &payload, true);
        // Rejected as soon as the header is in
        let err = feed(&mut p, &wire[..14]).unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge));
        assert_eq!(err.close_code(), 1009);
    }

    #[test]
    fn test_max_size_frame_accepted() {
        let mut p = server();
        let payload = vec![1u8; 128 * 1024];
        let effects = feed(&mut p, &masked(OpCode::Binary, &payload, true)).unwrap();
        assert_eq!(effects.len(), 1);
    }

    #[test]
    fn test_combined_fragments_too_large() {
        let mut p = server();
        let chunk = vec![0u8; 70_000];
        let mut wire = masked(OpCode::Binary, &chunk, false);
        wire.extend(masked(OpCode::Continuation, &chunk, true));
        let err = feed(&mut p, &wire).unwrap_err();
        assert_eq!(err.close_code(), 1009);
    }

    #[test]
    fn test_fragments_combined() {
        let mut p = server();
        let mut wire = masked(OpCode::Text, b"Hel", false);
        wire.extend(masked(OpCode::Ping, b"p", true));
        wire.extend(masked(OpCode::Continuation, b"lo", false));
        wire.extend(masked(OpCode::Continuation, b"!", true));
        let effects = feed(&mut p, &wire).unwrap();
        assert_eq!(effects.len(), 3);
        assert!(matches!(&effects[0], Effect::Write(_)));
        assert_eq!(effects[1], Effect::Ping(Bytes::from_static(b"p")));
        assert_eq!(effects[2], text("Hello!", true));
    }

    #[test]
    fn test_fragments_separate() {
        let mut p = server();
        p.set_combine_fragments(false);
        let mut wire = masked(OpCode::Binary, b"ab", false);
        wire.extend(masked(OpCode::Continuation, b"", false));
        wire.extend(masked(OpCode::Continuation, b"c", true));
        let effects = feed(&mut p, &wire).unwrap();
        assert_eq!(
            effects,
            vec![
                Effect::Binary { data: Bytes::from_static(b"ab"), fin: false },
                Effect::Binary { data: Bytes::new(), fin: false },
                Effect::Binary { data: Bytes::from_static(b"c"), fin: true },
            ]
        );
    }

    #[test]
    fn test_separate_text_fragments_carry_utf8_tail() {
        let mut p = server();
        p.set_combine_fragments(false);
        let euro = "€".as_bytes(); // 3 bytes
        let mut first = b"a".to_vec();
        first.extend_from_slice(&euro[..1]);
        let mut wire = masked(OpCode::Text, &first, false);
        wire.extend(masked(OpCode::Continuation, &euro[1..], true));
        let effects = feed(&mut p, &wire).unwrap();
        assert_eq!(effects, vec![text("a", false), text("€", true)]);
    }

    #[test]
    fn test_invalid_utf8() {
        let mut p = server();
        let err = feed(&mut p, &masked(OpCode::Text, &[0xff, 0xfe], true)).unwrap_err();
        assert_eq!(err.close_code(), 1007);
    }

    #[test]
    fn test_auto_pong() {
        let mut p = server();
        let effects = feed(&mut p, &masked(OpCode::Ping, b"abc", true)).unwrap();
        let Effect::Write(bufs) = &effects[0] else {
            panic!("expected pong write, got {effects:?}");
        };
        let wire: Vec<u8> = bufs.iter().flat_map(|b| b.iter().copied()).collect();
        assert_eq!(wire, b"\x8a\x03abc");
        assert_eq!(effects[1], Effect::Ping(Bytes::from_static(b"abc")));

        let mut p = server();
        p.set_auto_pong(false);
        let effects = feed(&mut p, &masked(OpCode::Ping, b"abc", true)).unwrap();
        assert_eq!(effects, vec![Effect::Ping(Bytes::from_static(b"abc"))]);
    }

    #[test]
    fn test_close_echo_and_server_shutdown() {
        let mut p = server();
        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"bye");
        let effects = feed(&mut p, &masked(OpCode::Close, &payload, true)).unwrap();

        let Effect::Write(bufs) = &effects[0] else {
            panic!("expected echo, got {effects:?}");
        };
        let wire: Vec<u8> = bufs.iter().flat_map(|b| b.iter().copied()).collect();
        assert_eq!(wire, b"\x88\x05\x03\xe8bye");
        assert_eq!(effects[1], Effect::Closed(CloseReason::new(1000, "bye")));
        assert_eq!(effects[2], Effect::Shutdown);
        assert_eq!(p.state(), State::Closed);
    }

    #[test]
    fn test_empty_close_is_no_status() {
        let mut p = client();
        let effects = feed(&mut p, &unmasked(OpCode::Close, b"", true)).unwrap();
        let Effect::Write(bufs) = &effects[0] else {
            panic!("expected echo, got {effects:?}");
        };
        // masked echo: header + mask key, no body
        assert_eq!(bufs[0].len(), 6);
        assert_eq!(&bufs[0][..2], &[0x88, 0x80]);
        assert_eq!(effects[1], Effect::Closed(CloseReason::new(1005, "")));
        // a client waits for the server to close the transport
        assert_eq!(effects.len(), 2);
    }

    #[test]
    fn test_bad_close_payloads() {
        let mut p = client();
        assert_eq!(feed(&mut p, &unmasked(OpCode::Close, &[0x03], true)).unwrap_err().close_code(), 1002);

        let mut p = client();
        let err = feed(&mut p, &unmasked(OpCode::Close, &1005u16.to_be_bytes(), true)).unwrap_err();
        assert!(matches!(err, Error::InvalidCloseCode(1005)));
    }

    #[test]
    fn test_close_handshake_initiated_locally() {
        let mut p = server();
        let mut effects = Vec::new();
        p.close(1000, "done", &mut effects);
        assert_eq!(p.state(), State::Closing);
        assert!(matches!(&effects[0], Effect::Write(_)));

        let effects = feed(&mut p, &masked(OpCode::Close, &1000u16.to_be_bytes(), true)).unwrap();
        // no second close frame
        assert_eq!(
            effects,
            vec![Effect::Closed(CloseReason::new(1000, "")), Effect::Shutdown]
        );
    }

    #[test]
    fn test_send_requires_open() {
        let mut p = Protocol::with_rng(Role::Client, &Config::default(), MaskRng::from_seed(3));
        let frames = [OutgoingFrame::text(vec![Bytes::from_static(b"x")])];
        assert!(matches!(p.encode_frames(&frames), Err(Error::WouldBlock)));

        p.open();
        assert!(p.encode_frames(&frames).is_ok());

        let mut effects = Vec::new();
        p.close(1000, "", &mut effects);
        assert!(matches!(p.encode_frames(&frames), Err(Error::ConnectionClosed)));
    }

    #[test]
    fn test_client_frames_are_masked() {
        let mut p = client();
        let frames = [OutgoingFrame::binary(vec![Bytes::from_static(b"data")])];
        let out = p.encode_frames(&frames).unwrap();
        let wire: Vec<u8> = out.iter().flat_map(|b| b.iter().copied()).collect();

        let mut s = server();
        let effects = feed(&mut s, &wire).unwrap();
        assert_eq!(
            effects,
            vec![Effect::Binary { data: Bytes::from_static(b"data"), fin: true }]
        );
    }

    #[test]
    fn test_fail_and_terminate() {
        let mut p = server();
        let mut effects = Vec::new();
        p.fail(1002, "bad", &mut effects);
        assert_eq!(p.state(), State::Failed);
        assert!(matches!(&effects[0], Effect::Write(_)));
        assert_eq!(effects[1], Effect::Closed(CloseReason::new(1002, "bad")));
        assert_eq!(effects[2], Effect::Shutdown);

        // terminal states are sticky
        effects.clear();
        p.terminate(1006, "again", &mut effects);
        assert!(effects.is_empty());

        let mut p = server();
        p.terminate(1006, "gone", &mut effects);
        assert_eq!(
            effects,
            vec![Effect::Closed(CloseReason::new(1006, "gone")), Effect::Shutdown]
        );
    }

    #[test]
    fn test_close_while_connecting_terminates() {
        let mut p = Protocol::with_rng(Role::Client, &Config::default(), MaskRng::from_seed(4));
        let mut effects = Vec::new();
        p.close(1000, "nevermind", &mut effects);
        assert_eq!(p.state(), State::Closed);
        assert_eq!(
            effects,
            vec![Effect::Closed(CloseReason::new(1000, "nevermind")), Effect::Shutdown]
        );
    }
}
