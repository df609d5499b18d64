//! Incremental HTTP/1.x parser
//!
//! Start lines, header lines and chunk-size lines are buffered until their
//! terminating LF arrives. Each completed head line is run through
//! `httparse` so malformed input fails early; once the blank line arrives the
//! head is reported. Body bytes are forwarded as they come.

use std::ops::ControlFlow;

use tracing::{debug, trace};

use super::{HttpError, HttpHandler, HttpMode, ParseState};

/// Default bound on url / header name / header value length
const DEFAULT_MAX_LENGTH: usize = 1024;

/// Room for method, version and separators on a start line
const START_LINE_SLACK: usize = 32;

/// Chunk-size lines (size plus extensions)
const MAX_CHUNK_LINE_LEN: usize = 1024;

/// Header slots handed to httparse
const MAX_HEADERS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    StartLine,
    Headers,
    Body { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    Trailers,
    BodyEof,
    Upgraded,
    Closed,
    Errored,
}

#[inline]
fn check(flow: ControlFlow<()>) -> Result<(), HttpError> {
    match flow {
        ControlFlow::Continue(()) => Ok(()),
        ControlFlow::Break(()) => Err(HttpError::Aborted),
    }
}

/// Join obsolete folded continuation lines with single spaces
fn unfold(value: &[u8]) -> String {
    if !value.contains(&b'\n') {
        return String::from_utf8_lossy(value).into_owned();
    }
    let parts: Vec<&[u8]> = value
        .split(|&b| b == b'\n')
        .map(<[u8]>::trim_ascii)
        .filter(|part| !part.is_empty())
        .collect();
    String::from_utf8_lossy(&parts.join(&b' ')).into_owned()
}

/// A complete message head, copied out of the head buffer
#[derive(Debug, Default)]
struct Head {
    method: String,
    url: String,
    status: u16,
    reason: String,
    minor: u8,
    headers: Vec<(String, String)>,
}

/// Push-driven HTTP/1.x request or response parser
///
/// Feed bytes with [`execute`](Self::execute); errors are sticky and can be
/// inspected with [`error`](Self::error) until [`reset`](Self::reset).
#[derive(Debug)]
pub struct HttpParser {
    mode: HttpMode,
    phase: Phase,
    max_length: usize,
    /// Current line, including its terminator once complete
    line: Vec<u8>,
    /// Completed lines of the current head
    head: Vec<u8>,
    method: String,
    url: String,
    status_code: u16,
    version: (u8, u8),
    content_length: Option<u64>,
    chunked: bool,
    conn_close: bool,
    conn_keep_alive: bool,
    conn_upgrade: bool,
    has_upgrade_header: bool,
    upgrade: bool,
    keep_alive: bool,
    error: Option<HttpError>,
}

impl HttpParser {
    /// Create a parser for requests or responses
    pub fn new(mode: HttpMode) -> Self {
        Self {
            mode,
            phase: Phase::StartLine,
            max_length: DEFAULT_MAX_LENGTH,
            line: Vec::new(),
            head: Vec::new(),
            method: String::new(),
            url: String::new(),
            status_code: 0,
            version: (0, 0),
            content_length: None,
            chunked: false,
            conn_close: false,
            conn_keep_alive: false,
            conn_upgrade: false,
            has_upgrade_header: false,
            upgrade: false,
            keep_alive: false,
            error: None,
        }
    }

    /// Start over, e.g. for the next message on a kept-alive connection
    ///
    /// The maximum length setting is preserved.
    pub fn reset(&mut self, mode: HttpMode) {
        let max_length = self.max_length;
        *self = Self::new(mode);
        self.max_length = max_length;
    }

    /// Bound url, header name and header value lengths
    pub fn set_max_length(&mut self, len: usize) {
        self.max_length = len;
    }

    /// Current length bound
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Grammar in use
    pub fn mode(&self) -> HttpMode {
        self.mode
    }

    /// Request method of the current message (request mode)
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Request target of the current message (request mode)
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Status code of the current message (response mode)
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    /// `(major, minor)` HTTP version of the current message
    pub fn version(&self) -> (u8, u8) {
        self.version
    }

    /// The message switched protocols; remaining bytes are not HTTP
    pub fn is_upgrade(&self) -> bool {
        self.upgrade
    }

    /// Whether the connection may carry another message after this one
    pub fn should_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Error that stopped parsing, if any
    pub fn error(&self) -> Option<&HttpError> {
        self.error.as_ref()
    }

    /// Check if parsing stopped on an error
    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Which token buffer is being filled
    pub fn parse_state(&self) -> ParseState {
        match self.phase {
            Phase::StartLine if self.line.is_empty() => ParseState::Start,
            Phase::StartLine => match self.mode {
                HttpMode::Request => ParseState::Url,
                HttpMode::Response => ParseState::Status,
            },
            Phase::Headers => {
                let folded = matches!(self.line.first(), Some(b' ' | b'\t'));
                if folded || self.line.contains(&b':') {
                    ParseState::Value
                } else {
                    ParseState::Field
                }
            }
            _ => ParseState::Start,
        }
    }

    /// Parse a chunk of input
    ///
    /// Returns the bytes that were not consumed: everything after the
    /// headers of an upgrade message, or the rest of the input once an
    /// error occurred.
    pub fn execute<'a, H: HttpHandler + ?Sized>(
        &mut self,
        data: &'a [u8],
        handler: &mut H,
    ) -> &'a [u8] {
        let mut data = data;
        while !data.is_empty() {
            match self.step(data, handler) {
                Ok(Some(n)) => data = &data[n..],
                Ok(None) => break,
                Err(e) => {
                    self.fail(e);
                    break;
                }
            }
        }
        data
    }

    /// Signal end of input
    ///
    /// Completes a response body that is delimited by connection close.
    /// Ending anywhere else inside a message is an error.
    pub fn finish<H: HttpHandler + ?Sized>(&mut self, handler: &mut H) -> Result<(), HttpError> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        let result = self.finish_inner(handler);
        if let Err(e) = &result {
            self.fail(e.clone());
        }
        result
    }

    fn finish_inner<H: HttpHandler + ?Sized>(&mut self, handler: &mut H) -> Result<(), HttpError> {
        match self.phase {
            Phase::BodyEof => {
                check(handler.on_body(&[], true))?;
                self.complete_message(handler)
            }
            Phase::StartLine if self.line.is_empty() => Ok(()),
            Phase::Closed | Phase::Upgraded => Ok(()),
            _ => Err(HttpError::InvalidEofState),
        }
    }

    fn fail(&mut self, e: HttpError) {
        debug!(error = %e, mode = ?self.mode, "http parse error");
        self.error = Some(e);
        self.phase = Phase::Errored;
    }

    /// Consume a prefix of `data`; `None` means stop consuming
    fn step<H: HttpHandler + ?Sized>(
        &mut self,
        data: &[u8],
        handler: &mut H,
    ) -> Result<Option<usize>, HttpError> {
        match self.phase {
            Phase::StartLine => {
                if self.line.is_empty() {
                    // Blank lines between kept-alive messages
                    let skip = data.iter().take_while(|&&b| b == b'\r' || b == b'\n').count();
                    if skip > 0 {
                        return Ok(Some(skip));
                    }
                    self.begin_message(handler)?;
                }
                let (n, complete) = self.read_line(data, self.max_length + START_LINE_SLACK)?;
                if complete {
                    self.head_line(handler)?;
                }
                Ok(Some(n))
            }
            Phase::Headers => {
                let (n, complete) = self.read_line(data, 2 * self.max_length + 4)?;
                if complete {
                    self.head_line(handler)?;
                }
                Ok(Some(n))
            }
            Phase::Body { remaining } => {
                let n = remaining.min(data.len() as u64) as usize;
                let remaining = remaining - n as u64;
                self.phase = Phase::Body { remaining };
                check(handler.on_body(&data[..n], remaining == 0))?;
                if remaining == 0 {
                    self.complete_message(handler)?;
                }
                Ok(Some(n))
            }
            Phase::ChunkSize => {
                let (n, complete) = self
                    .read_line(data, MAX_CHUNK_LINE_LEN)
                    .map_err(|_| HttpError::InvalidChunkSize)?;
                if complete {
                    let size = match httparse::parse_chunk_size(&self.line) {
                        Ok(httparse::Status::Complete((_, size))) => size,
                        _ => return Err(HttpError::InvalidChunkSize),
                    };
                    self.line.clear();
                    self.phase = if size == 0 {
                        Phase::Trailers
                    } else {
                        Phase::ChunkData { remaining: size }
                    };
                }
                Ok(Some(n))
            }
            Phase::ChunkData { remaining } => {
                let n = remaining.min(data.len() as u64) as usize;
                let remaining = remaining - n as u64;
                self.phase = if remaining == 0 {
                    Phase::ChunkDataEnd
                } else {
                    Phase::ChunkData { remaining }
                };
                check(handler.on_body(&data[..n], false))?;
                Ok(Some(n))
            }
            Phase::ChunkDataEnd => {
                let (n, complete) = self
                    .read_line(data, 2)
                    .map_err(|_| HttpError::InvalidChunkSize)?;
                if complete {
                    if !self.take_line().is_empty() {
                        return Err(HttpError::InvalidChunkSize);
                    }
                    self.phase = Phase::ChunkSize;
                }
                Ok(Some(n))
            }
            Phase::Trailers => {
                let (n, complete) = self.read_line(data, 2 * self.max_length + 4)?;
                // Trailer fields are not reported
                if complete && self.take_line().is_empty() {
                    check(handler.on_body(&[], true))?;
                    self.complete_message(handler)?;
                }
                Ok(Some(n))
            }
            Phase::BodyEof => {
                check(handler.on_body(data, false))?;
                Ok(Some(data.len()))
            }
            Phase::Closed => {
                // Stray line endings after the last message are tolerated
                let skip = data.iter().take_while(|&&b| b == b'\r' || b == b'\n').count();
                if skip == 0 {
                    return Err(HttpError::ClosedConnection);
                }
                Ok(Some(skip))
            }
            Phase::Upgraded | Phase::Errored => Ok(None),
        }
    }

    /// Buffer up to and including the next LF
    ///
    /// Returns the bytes consumed and whether the line is complete.
    fn read_line(&mut self, data: &[u8], limit: usize) -> Result<(usize, bool), HttpError> {
        match data.iter().position(|&b| b == b'\n') {
            Some(i) => {
                if self.line.len() + i + 1 > limit {
                    return Err(HttpError::HeaderOverflow);
                }
                self.line.extend_from_slice(&data[..=i]);
                Ok((i + 1, true))
            }
            None => {
                if self.line.len() + data.len() > limit {
                    return Err(HttpError::HeaderOverflow);
                }
                self.line.extend_from_slice(data);
                Ok((data.len(), false))
            }
        }
    }

    /// Take the buffered line without its CRLF (or bare LF)
    fn take_line(&mut self) -> Vec<u8> {
        let mut line = std::mem::take(&mut self.line);
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        line
    }

    fn begin_message<H: HttpHandler + ?Sized>(&mut self, handler: &mut H) -> Result<(), HttpError> {
        self.method.clear();
        self.url.clear();
        self.status_code = 0;
        self.head.clear();
        self.content_length = None;
        self.chunked = false;
        self.conn_close = false;
        self.conn_keep_alive = false;
        self.conn_upgrade = false;
        self.has_upgrade_header = false;
        self.upgrade = false;
        self.keep_alive = false;
        trace!(mode = ?self.mode, "message begin");
        check(handler.on_message_begin())
    }

    /// Move a completed line into the head and report the head once whole
    fn head_line<H: HttpHandler + ?Sized>(&mut self, handler: &mut H) -> Result<(), HttpError> {
        self.head.extend_from_slice(&self.line);
        self.line.clear();
        match self.parse_head()? {
            Some(head) => {
                self.head.clear();
                self.dispatch_head(head, handler)
            }
            None => {
                self.phase = Phase::Headers;
                Ok(())
            }
        }
    }

    /// Run the buffered head through httparse; `None` while incomplete
    fn parse_head(&self) -> Result<Option<Head>, HttpError> {
        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        match self.mode {
            HttpMode::Request => {
                let mut req = httparse::Request::new(&mut slots);
                let status = match req.parse(&self.head) {
                    Ok(status) => status,
                    // Method already parsed, so the bad token is the target
                    Err(httparse::Error::Token) if req.method.is_some() => {
                        return Err(HttpError::InvalidUrl);
                    }
                    Err(e) => return Err(e.into()),
                };
                if req.path.is_some_and(|url| url.len() > self.max_length) {
                    return Err(HttpError::HeaderOverflow);
                }
                if status.is_partial() {
                    return Ok(None);
                }
                Ok(Some(Head {
                    method: req.method.unwrap_or_default().to_owned(),
                    url: req.path.unwrap_or_default().to_owned(),
                    minor: req.version.unwrap_or_default(),
                    headers: self.collect_headers(req.headers)?,
                    ..Default::default()
                }))
            }
            HttpMode::Response => {
                let mut res = httparse::Response::new(&mut slots);
                let status = httparse::ParserConfig::default()
                    .allow_obsolete_multiline_headers_in_responses(true)
                    .parse_response(&mut res, &self.head)?;
                if res.reason.is_some_and(|text| text.len() > self.max_length) {
                    return Err(HttpError::HeaderOverflow);
                }
                if status.is_partial() {
                    return Ok(None);
                }
                Ok(Some(Head {
                    status: res.code.unwrap_or_default(),
                    reason: res.reason.unwrap_or_default().to_owned(),
                    minor: res.version.unwrap_or_default(),
                    headers: self.collect_headers(res.headers)?,
                    ..Default::default()
                }))
            }
        }
    }

    fn collect_headers(
        &self,
        headers: &[httparse::Header<'_>],
    ) -> Result<Vec<(String, String)>, HttpError> {
        headers
            .iter()
            .map(|header| {
                let value = unfold(header.value);
                if header.name.len() > self.max_length || value.len() > self.max_length {
                    return Err(HttpError::HeaderOverflow);
                }
                Ok((header.name.to_owned(), value))
            })
            .collect()
    }

    fn dispatch_head<H: HttpHandler + ?Sized>(
        &mut self,
        head: Head,
        handler: &mut H,
    ) -> Result<(), HttpError> {
        self.version = (1, head.minor);
        match self.mode {
            HttpMode::Request => {
                self.method = head.method;
                self.url = head.url;
                check(handler.on_method(&self.method, self.version))?;
                check(handler.on_url(&self.url))?;
            }
            HttpMode::Response => {
                self.status_code = head.status;
                check(handler.on_status(head.status, &head.reason))?;
            }
        }
        for (name, value) in &head.headers {
            self.observe_header(name, value)?;
            check(handler.on_header(name, value))?;
        }
        self.headers_complete(handler)
    }

    /// Track the headers that shape message framing
    fn observe_header(&mut self, name: &str, value: &str) -> Result<(), HttpError> {
        if name.eq_ignore_ascii_case("content-length") {
            if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                return Err(HttpError::InvalidContentLength);
            }
            let len: u64 = value
                .parse()
                .map_err(|_| HttpError::InvalidContentLength)?;
            if self.content_length.is_some_and(|prev| prev != len) {
                return Err(HttpError::InvalidContentLength);
            }
            self.content_length = Some(len);
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            self.chunked = value
                .rsplit(',')
                .next()
                .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
        } else if name.eq_ignore_ascii_case("connection") {
            for token in value.split(',').map(str::trim) {
                if token.eq_ignore_ascii_case("close") {
                    self.conn_close = true;
                } else if token.eq_ignore_ascii_case("keep-alive") {
                    self.conn_keep_alive = true;
                } else if token.eq_ignore_ascii_case("upgrade") {
                    self.conn_upgrade = true;
                }
            }
        } else if name.eq_ignore_ascii_case("upgrade") {
            self.has_upgrade_header = true;
        }
        Ok(())
    }

    fn wants_keep_alive(&self) -> bool {
        if self.version >= (1, 1) {
            !self.conn_close
        } else {
            self.conn_keep_alive && !self.conn_close
        }
    }

    /// Where the body starts, or `None` for a bodiless message
    fn body_phase(&self) -> Option<Phase> {
        if self.mode == HttpMode::Response
            && (self.status_code / 100 == 1 || self.status_code == 204 || self.status_code == 304)
        {
            return None;
        }
        if self.chunked {
            return Some(Phase::ChunkSize);
        }
        match self.content_length {
            Some(0) => None,
            Some(remaining) => Some(Phase::Body { remaining }),
            None if self.mode == HttpMode::Response => Some(Phase::BodyEof),
            None => None,
        }
    }

    fn headers_complete<H: HttpHandler + ?Sized>(
        &mut self,
        handler: &mut H,
    ) -> Result<(), HttpError> {
        self.upgrade = match self.mode {
            HttpMode::Response => self.status_code == 101,
            HttpMode::Request => {
                self.method == "CONNECT" || (self.has_upgrade_header && self.conn_upgrade)
            }
        };
        let body = if self.upgrade { None } else { self.body_phase() };
        self.keep_alive = body != Some(Phase::BodyEof) && self.wants_keep_alive();

        trace!(upgrade = self.upgrade, keep_alive = self.keep_alive, "headers complete");
        check(handler.on_headers_complete(self.keep_alive))?;

        if self.upgrade {
            self.complete_message(handler)?;
            self.phase = Phase::Upgraded;
            return Ok(());
        }
        match body {
            Some(phase) => {
                self.phase = phase;
                Ok(())
            }
            None => self.complete_message(handler),
        }
    }

    fn complete_message<H: HttpHandler + ?Sized>(
        &mut self,
        handler: &mut H,
    ) -> Result<(), HttpError> {
        self.phase = if self.keep_alive {
            Phase::StartLine
        } else {
            Phase::Closed
        };
        trace!(keep_alive = self.keep_alive, "message complete");
        check(handler.on_message_complete(self.keep_alive))
    }
}
