//! WebSocket frame parsing and serialization
//!
//! This module implements the RFC 6455 frame codec:
//! - Incremental header decoding that survives arbitrary input splits
//! - Fast-path for small messages (< 126 bytes)
//! - Masked encoding into a copy, unmasked encoding without copying payload

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{CloseReason, Error, Result};
use crate::mask::{apply_mask, apply_mask_offset};
use crate::{MAX_FRAME_HEADER_SIZE, MEDIUM_MESSAGE_THRESHOLD, SMALL_MESSAGE_THRESHOLD};

/// FIN bit in the first header byte
pub const FLAG_FIN: u8 = 0x80;
/// MASK bit in the second header byte
pub const FLAG_MASK: u8 = 0x80;
/// RSV1-3 bits in the first header byte
const RSV_MASK: u8 = 0x70;
/// Opcode bits in the first header byte
const OPCODE_MASK: u8 = 0x0F;
/// 7-bit length bits in the second header byte
const LEN_MASK: u8 = 0x7F;

/// Maximum payload of a control frame
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation frame
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

impl OpCode {
    /// Parse opcode from byte
    #[inline]
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        (*self as u8) >= 0x8
    }

    /// Check if this is a data frame
    #[inline]
    pub fn is_data(&self) -> bool {
        (*self as u8) <= 0x2
    }
}

/// A parsed WebSocket frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment flag
    pub fin: bool,
    /// Frame opcode
    pub opcode: OpCode,
    /// Payload length
    pub payload_len: u64,
    /// Masking key (if masked)
    pub mask: Option<[u8; 4]>,
}

impl FrameHeader {
    /// Get the total header size in bytes
    #[inline]
    pub fn header_size(&self) -> usize {
        header_size(self.payload_len, self.mask.is_some())
    }

    /// Encode the frame header into a buffer
    #[inline]
    pub fn encode(&self, buf: &mut BytesMut) {
        encode_frame_header(buf, self.opcode, self.fin, self.payload_len, self.mask);
    }
}

#[inline]
fn header_size(payload_len: u64, masked: bool) -> usize {
    let mut size = 2;
    if payload_len > MEDIUM_MESSAGE_THRESHOLD as u64 {
        size += 8;
    } else if payload_len > SMALL_MESSAGE_THRESHOLD as u64 {
        size += 2;
    }
    if masked {
        size += 4;
    }
    size
}

/// Incremental frame header decoder
///
/// Buffers header bytes across calls until the complete header (including
/// extended length and masking key) is available. Enforces the RSV, masking
/// direction and length encoding rules as soon as the relevant bytes arrive.
#[derive(Debug)]
pub struct FrameParser {
    header_buf: [u8; MAX_FRAME_HEADER_SIZE],
    header_len: usize,
    /// Full header size, known once the first two bytes are in
    header_size: usize,
    /// Whether to expect masked frames (server role)
    expect_masked: bool,
}

impl FrameParser {
    /// Create a new header decoder
    pub fn new(expect_masked: bool) -> Self {
        Self {
            header_buf: [0; MAX_FRAME_HEADER_SIZE],
            header_len: 0,
            header_size: 0,
            expect_masked,
        }
    }

    /// Reset parser state for next frame
    #[inline]
    pub fn reset(&mut self) {
        self.header_len = 0;
        self.header_size = 0;
    }

    /// Number of header bytes buffered so far
    #[inline]
    pub fn buffered(&self) -> usize {
        self.header_len
    }

    /// Copy bytes from `data` until `target` header bytes are buffered
    #[inline]
    fn fill(&mut self, data: &mut &[u8], target: usize) {
        let n = target.saturating_sub(self.header_len).min(data.len());
        self.header_buf[self.header_len..self.header_len + n].copy_from_slice(&data[..n]);
        self.header_len += n;
        *data = &data[n..];
    }

    /// Decode a frame header from the front of `data`
    ///
    /// Consumed bytes are removed from `data`. Returns:
    /// - Ok(Some(header)) once the header is complete (the parser resets)
    /// - Ok(None) if more data is needed
    /// - Err(e) if the header violates the protocol
    pub fn parse_header(&mut self, data: &mut &[u8]) -> Result<Option<FrameHeader>> {
        if self.header_len < 2 {
            self.fill(data, 2);
            if self.header_len < 2 {
                return Ok(None);
            }

            let b0 = self.header_buf[0];
            let b1 = self.header_buf[1];

            // No extensions are negotiated, so all RSV bits must be clear
            if b0 & RSV_MASK != 0 {
                return Err(Error::Protocol("nonzero RSV"));
            }

            let masked = b1 & FLAG_MASK != 0;
            if self.expect_masked && !masked {
                return Err(Error::Protocol("client data not masked"));
            }
            if !self.expect_masked && masked {
                return Err(Error::Protocol("server data masked"));
            }

            self.header_size = 2
                + match b1 & LEN_MASK {
                    126 => 2,
                    127 => 8,
                    _ => 0,
                }
                + if masked { 4 } else { 0 };
        }

        self.fill(data, self.header_size);
        if self.header_len < self.header_size {
            return Ok(None);
        }

        let header = self.decode()?;
        self.reset();
        Ok(Some(header))
    }

    fn decode(&self) -> Result<FrameHeader> {
        let b0 = self.header_buf[0];
        let b1 = self.header_buf[1];

        let fin = b0 & FLAG_FIN != 0;
        let opcode = OpCode::from_u8(b0 & OPCODE_MASK).ok_or(Error::Protocol("invalid opcode"))?;

        // Control frames must not be fragmented
        if opcode.is_control() && !fin {
            return Err(Error::Protocol("cannot fragment control frames"));
        }

        let payload_len = match b1 & LEN_MASK {
            126 => {
                let len = u16::from_be_bytes([self.header_buf[2], self.header_buf[3]]) as u64;
                if len < 126 {
                    return Err(Error::Protocol("payload length not minimal"));
                }
                len
            }
            127 => {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&self.header_buf[2..10]);
                let len = u64::from_be_bytes(bytes);
                if len <= 0xFFFF {
                    return Err(Error::Protocol("payload length not minimal"));
                }
                if len >> 63 != 0 {
                    return Err(Error::Protocol("payload length MSB must be 0"));
                }
                len
            }
            len => len as u64,
        };

        if opcode.is_control() && payload_len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(Error::Protocol("control frame too large"));
        }

        let mask = if b1 & FLAG_MASK != 0 {
            let at = self.header_size - 4;
            Some([
                self.header_buf[at],
                self.header_buf[at + 1],
                self.header_buf[at + 2],
                self.header_buf[at + 3],
            ])
        } else {
            None
        };

        Ok(FrameHeader {
            fin,
            opcode,
            payload_len,
            mask,
        })
    }
}

/// Encode a frame header: opcode|FIN byte, length byte(s), masking key
#[inline]
pub fn encode_frame_header(
    buf: &mut BytesMut,
    opcode: OpCode,
    fin: bool,
    payload_len: u64,
    mask: Option<[u8; 4]>,
) {
    let mut b0 = opcode as u8;
    if fin {
        b0 |= FLAG_FIN;
    }
    buf.put_u8(b0);

    let mask_bit = if mask.is_some() { FLAG_MASK } else { 0x00 };

    if payload_len <= SMALL_MESSAGE_THRESHOLD as u64 {
        buf.put_u8(mask_bit | payload_len as u8);
    } else if payload_len <= MEDIUM_MESSAGE_THRESHOLD as u64 {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(payload_len as u16);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(payload_len);
    }

    if let Some(m) = mask {
        buf.put_slice(&m);
    }
}

/// Encode a frame into a buffer
///
/// For masked frames (client role) the payload is copied and masked.
#[inline]
pub fn encode_frame(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    mask: Option<[u8; 4]>,
) {
    buf.reserve(header_size(payload.len() as u64, mask.is_some()) + payload.len());
    encode_frame_header(buf, opcode, fin, payload.len() as u64, mask);

    let start = buf.len();
    buf.put_slice(payload);
    if let Some(m) = mask {
        apply_mask(&mut buf[start..], m);
    }
}

/// Build a close frame payload
///
/// Code 1005 means "no status" and is sent as an empty payload; every other
/// code is sent as 2 big-endian bytes followed by the reason.
pub fn close_payload(code: u16, reason: &str) -> Bytes {
    if code == CloseReason::NO_STATUS {
        return Bytes::new();
    }
    let mut payload = BytesMut::with_capacity(2 + reason.len());
    payload.put_u16(code);
    payload.put_slice(reason.as_bytes());
    payload.freeze()
}

/// A frame queued for sending, with its payload spread over caller buffers
#[derive(Debug, Clone)]
pub struct OutgoingFrame {
    /// Frame opcode
    pub opcode: OpCode,
    /// Final fragment flag
    pub fin: bool,
    /// Payload buffers, concatenated on the wire
    pub data: Vec<Bytes>,
}

impl OutgoingFrame {
    /// Create a new outgoing frame
    pub fn new(opcode: OpCode, fin: bool, data: Vec<Bytes>) -> Self {
        Self { opcode, fin, data }
    }

    /// Complete text message
    pub fn text(data: Vec<Bytes>) -> Self {
        Self::new(OpCode::Text, true, data)
    }

    /// Complete binary message
    pub fn binary(data: Vec<Bytes>) -> Self {
        Self::new(OpCode::Binary, true, data)
    }

    /// First fragment of a text message
    pub fn text_fragment(data: Vec<Bytes>) -> Self {
        Self::new(OpCode::Text, false, data)
    }

    /// First fragment of a binary message
    pub fn binary_fragment(data: Vec<Bytes>) -> Self {
        Self::new(OpCode::Binary, false, data)
    }

    /// Continuation fragment; `fin` marks the last one
    pub fn fragment(data: Vec<Bytes>, fin: bool) -> Self {
        Self::new(OpCode::Continuation, fin, data)
    }

    /// Ping
    pub fn ping(data: Vec<Bytes>) -> Self {
        Self::new(OpCode::Ping, true, data)
    }

    /// Pong
    pub fn pong(data: Vec<Bytes>) -> Self {
        Self::new(OpCode::Pong, true, data)
    }

    /// Close frame with the given code and reason
    pub fn close(code: u16, reason: &str) -> Self {
        Self::new(OpCode::Close, true, vec![close_payload(code, reason)])
    }

    /// Total payload length across all buffers
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.data.iter().map(Bytes::len).sum()
    }

    /// Check control frame constraints (FIN set, payload <= 125 bytes)
    pub fn validate(&self) -> Result<()> {
        if self.opcode.is_control() {
            if !self.fin {
                return Err(Error::Protocol("cannot fragment control frames"));
            }
            if self.payload_len() > MAX_CONTROL_PAYLOAD {
                return Err(Error::Protocol("control frame too large"));
            }
        }
        Ok(())
    }

    /// Serialize this frame onto `out`
    ///
    /// Without a mask the caller's buffers are appended as-is (reference
    /// counted, not copied). With a mask the payload is copied into the
    /// header buffer and masked there, leaving caller memory untouched.
    pub fn encode_into(&self, mask: Option<[u8; 4]>, out: &mut Vec<Bytes>) {
        let payload_len = self.payload_len();
        match mask {
            Some(m) => {
                let mut buf =
                    BytesMut::with_capacity(header_size(payload_len as u64, true) + payload_len);
                encode_frame_header(&mut buf, self.opcode, self.fin, payload_len as u64, mask);
                let start = buf.len();
                for data in &self.data {
                    buf.put_slice(data);
                }
                apply_mask_offset(&mut buf[start..], m, 0);
                out.push(buf.freeze());
            }
            None => {
                let mut buf = BytesMut::with_capacity(header_size(payload_len as u64, false));
                encode_frame_header(&mut buf, self.opcode, self.fin, payload_len as u64, None);
                out.push(buf.freeze());
                out.extend(self.data.iter().filter(|d| !d.is_empty()).cloned());
            }
        }
    }
}
