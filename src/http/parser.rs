//! The incremental message parser.
//!
//! [`Parser::execute`] may be handed a message in slices of any size. The
//! start line and header block are buffered until complete and then parsed
//! with [`httparse`]; body bytes are never buffered and reach the handler as
//! `(buffer, offset, len)` views of the caller's input.

use std::cell::Cell;
use std::error::Error as StdError;
use std::rc::Rc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, trace};

use super::body::{BodyDecoder, BodyError, Framing, Step};
use super::{Headers, Method};
use crate::config::ReactorConfig;
use crate::error::{ParseErrorCode, ProtocolError, UsageError};

/// Error type handler callbacks may fail with.
pub type HandlerResult<T> = Result<T, Box<dyn StdError + Send + Sync>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
}

/// Where the parser is within the current message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    Idle,
    StartLine,
    Headers,
    /// The header block was delivered and no body byte has arrived yet.
    HeadersComplete,
    Body,
    MessageComplete,
    Paused,
    Error,
}

/// The headers-complete event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeadersInfo {
    pub headers: Headers,
    pub version_major: u8,
    pub version_minor: u8,
    pub should_keep_alive: bool,
    pub upgrade: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<Method>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

impl HeadersInfo {
    /// `[name0, value0, name1, value1, ...]`.
    pub fn flat_headers(&self) -> Vec<&str> {
        self.headers.flat()
    }
}

/// Receives framing events. Every method has a no-op default.
///
/// A callback that returns `Err` aborts the current `execute` with the
/// matching `HPE_CB_*` code and leaves the parser in the error state.
pub trait ParserHandler {
    /// Returning `true` skips the body, e.g. for the response to a `HEAD`.
    fn on_headers_complete(&mut self, _info: HeadersInfo) -> HandlerResult<bool> {
        Ok(false)
    }

    /// `len` body bytes at `offset` of `buf`, the buffer passed to
    /// `execute`.
    fn on_body(&mut self, _buf: &[u8], _offset: usize, _len: usize) -> HandlerResult<()> {
        Ok(())
    }

    /// Trailer fields that followed a chunked body. Not called when there
    /// are none.
    fn on_headers(&mut self, _trailers: Headers) -> HandlerResult<()> {
        Ok(())
    }

    fn on_message_complete(&mut self) -> HandlerResult<()> {
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("{protocol}: {source}")]
    Callback {
        protocol: ProtocolError,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    #[error(transparent)]
    Usage(#[from] UsageError),
}

impl ExecuteError {
    pub fn protocol(&self) -> Option<&ProtocolError> {
        match self {
            Self::Protocol(err) | Self::Callback { protocol: err, .. } => Some(err),
            Self::Usage(_) => None,
        }
    }

    pub fn code(&self) -> Option<ParseErrorCode> {
        self.protocol().map(|err| err.code)
    }

    /// True only for `HPE_PAUSED`.
    pub fn is_recoverable(&self) -> bool {
        self.code().is_some_and(ParseErrorCode::is_recoverable)
    }
}

/// Shared pause flag. Clone it into the handler to pause from a callback.
#[derive(Debug, Clone, Default)]
pub struct PauseHandle(Rc<Cell<bool>>);

impl PauseHandle {
    pub fn pause(&self) {
        self.0.set(true);
    }

    pub fn resume(&self) {
        self.0.set(false);
    }

    pub fn is_paused(&self) -> bool {
        self.0.get()
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Idle,
    Head,
    Body(BodyDecoder),
    Trailers,
    Upgraded,
    Failed(ProtocolError),
}

/// A parsed start line and header block.
struct Head {
    method: Option<Method>,
    url: Option<String>,
    status_code: Option<u16>,
    version_minor: u8,
    headers: Headers,
}

/// An HTTP/1.x framing parser for one connection.
///
/// # Examples
///
/// ```
/// use uvwire::http::{HeadersInfo, MessageType, Parser, ParserHandler};
/// use uvwire::http::HandlerResult;
///
/// #[derive(Default)]
/// struct Collect {
///     url: Option<String>,
///     body: Vec<u8>,
///     done: bool,
/// }
///
/// impl ParserHandler for Collect {
///     fn on_headers_complete(&mut self, info: HeadersInfo) -> HandlerResult<bool> {
///         self.url = info.url;
///         Ok(false)
///     }
///     fn on_body(&mut self, buf: &[u8], offset: usize, len: usize) -> HandlerResult<()> {
///         self.body.extend_from_slice(&buf[offset..offset + len]);
///         Ok(())
///     }
///     fn on_message_complete(&mut self) -> HandlerResult<()> {
///         self.done = true;
///         Ok(())
///     }
/// }
///
/// let mut parser = Parser::new(MessageType::Request);
/// let mut handler = Collect::default();
/// parser.execute(&mut handler, b"POST /upload HTTP/1.1\r\nContent-Le").unwrap();
/// parser.execute(&mut handler, b"ngth: 3\r\n\r\nabc").unwrap();
///
/// assert_eq!(handler.url.as_deref(), Some("/upload"));
/// assert_eq!(handler.body, b"abc");
/// assert!(handler.done);
/// ```
#[derive(Debug)]
pub struct Parser {
    kind: MessageType,
    phase: Phase,
    /// Start line and header block (or trailers) buffered so far.
    head: Vec<u8>,
    /// Start of the unfinished line in `head`.
    line_start: usize,
    keep_alive: bool,
    upgrade: bool,
    body_started: bool,
    /// The last message forbade reuse of the connection.
    dead: bool,
    completed: bool,
    max_header_size: usize,
    max_headers: usize,
    pause: PauseHandle,
}

impl Parser {
    /// A parser with the default header limits.
    pub fn new(kind: MessageType) -> Self {
        Self::from_config(kind, &ReactorConfig::default())
    }

    pub fn from_config(kind: MessageType, config: &ReactorConfig) -> Self {
        Self::with_limits(kind, config.max_header_size, config.max_headers)
    }

    pub fn with_limits(kind: MessageType, max_header_size: usize, max_headers: usize) -> Self {
        Self {
            kind,
            phase: Phase::Idle,
            head: Vec::new(),
            line_start: 0,
            keep_alive: false,
            upgrade: false,
            body_started: false,
            dead: false,
            completed: false,
            max_header_size,
            max_headers,
            pause: PauseHandle::default(),
        }
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn state(&self) -> ParserState {
        match self.phase {
            Phase::Failed(_) => ParserState::Error,
            _ if self.pause.is_paused() => ParserState::Paused,
            Phase::Idle if self.completed => ParserState::MessageComplete,
            Phase::Idle => ParserState::Idle,
            Phase::Head if self.line_start == 0 => ParserState::StartLine,
            Phase::Head => ParserState::Headers,
            Phase::Body(_) if !self.body_started => ParserState::HeadersComplete,
            Phase::Body(_) | Phase::Trailers => ParserState::Body,
            Phase::Upgraded => ParserState::MessageComplete,
        }
    }

    /// Keep-alive flag of the most recent header block.
    pub fn should_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Whether the connection has switched protocols. Once set, `execute`
    /// consumes nothing until [`reinitialize`](Self::reinitialize).
    pub fn is_upgrade(&self) -> bool {
        matches!(self.phase, Phase::Upgraded)
    }

    pub fn pause(&self) {
        self.pause.pause();
    }

    pub fn resume(&self) {
        self.pause.resume();
    }

    pub fn pause_handle(&self) -> PauseHandle {
        self.pause.clone()
    }

    /// Resets all state, including a pause, for a new message type.
    pub fn reinitialize(&mut self, kind: MessageType) {
        let pause = self.pause.clone();
        let mut head = std::mem::take(&mut self.head);
        head.clear();
        *self = Self {
            head,
            pause,
            ..Self::with_limits(kind, self.max_header_size, self.max_headers)
        };
        self.pause.resume();
    }

    /// Parses all of `buf`.
    ///
    /// Returns the number of bytes consumed, which is less than
    /// `buf.len()` only after an upgrade.
    pub fn execute<H>(&mut self, handler: &mut H, buf: &[u8]) -> Result<usize, ExecuteError>
    where
        H: ParserHandler + ?Sized,
    {
        if buf.is_empty() {
            return Ok(0);
        }
        self.execute_range(handler, buf, 0, buf.len())
    }

    /// Parses `buf[offset..offset + len]`. Body offsets reported to the
    /// handler index `buf`.
    ///
    /// # Errors
    ///
    /// A [`UsageError`] when the range lies outside `buf`; otherwise a
    /// protocol error carrying the bytes consumed before the failure.
    pub fn execute_range<H>(
        &mut self,
        handler: &mut H,
        buf: &[u8],
        offset: usize,
        len: usize,
    ) -> Result<usize, ExecuteError>
    where
        H: ParserHandler + ?Sized,
    {
        if offset >= buf.len() {
            return Err(UsageError::OffsetOutOfBounds { offset, len }.into());
        }
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= buf.len())
            .ok_or(UsageError::RangeOutOfBounds {
                offset,
                len,
                buffer_len: buf.len(),
            })?;
        self.run(handler, buf, offset, end)
    }

    /// Signals end of input.
    ///
    /// # Errors
    ///
    /// `HPE_INVALID_EOF_STATE` unless the stream ended between messages or
    /// inside a body that runs until end of stream.
    pub fn finish<H>(&mut self, handler: &mut H) -> Result<(), ExecuteError>
    where
        H: ParserHandler + ?Sized,
    {
        match self.phase {
            Phase::Failed(err) => Err(ProtocolError::new(err.code, 0).into()),
            Phase::Idle | Phase::Upgraded => Ok(()),
            Phase::Body(decoder) if decoder.ends_at_eof() => {
                self.complete_message(handler, 0)?;
                self.dead = true;
                Ok(())
            }
            _ => Err(self.fail(ParseErrorCode::InvalidEofState, 0)),
        }
    }

    fn run<H>(&mut self, handler: &mut H, buf: &[u8], start: usize, end: usize) -> Result<usize, ExecuteError>
    where
        H: ParserHandler + ?Sized,
    {
        if let Phase::Failed(err) = self.phase {
            return Err(ProtocolError::new(err.code, 0).into());
        }
        let mut pos = start;
        while pos < end {
            if self.pause.is_paused() {
                return Err(ProtocolError::new(ParseErrorCode::Paused, pos - start).into());
            }
            match self.phase {
                Phase::Failed(err) => return Err(ProtocolError::new(err.code, pos - start).into()),
                Phase::Upgraded => return Ok(pos - start),
                Phase::Idle => {
                    if matches!(buf[pos], b'\r' | b'\n') {
                        pos += 1;
                        continue;
                    }
                    if self.dead {
                        return Err(self.fail(ParseErrorCode::ClosedConnection, pos - start));
                    }
                    self.completed = false;
                    self.begin_block(Phase::Head);
                }
                Phase::Head | Phase::Trailers => {
                    pos = self.feed_block(handler, buf, start, pos, end)?;
                }
                Phase::Body(mut decoder) => {
                    let step = decoder.advance(&buf[pos..end]);
                    self.phase = Phase::Body(decoder);
                    match step {
                        Ok(Step::Data { start: at, len }) => {
                            let offset = pos + at;
                            pos = offset + len;
                            self.body_started = true;
                            if len > 0 {
                                if let Err(source) = handler.on_body(buf, offset, len) {
                                    return Err(self.callback_failed(ParseErrorCode::CbBody, offset - start, source));
                                }
                            }
                            if decoder.is_finished() {
                                self.complete_message(handler, pos - start)?;
                            }
                        }
                        Ok(Step::Done { consumed }) => {
                            pos += consumed;
                            self.complete_message(handler, pos - start)?;
                        }
                        Ok(Step::Trailers { consumed }) => {
                            pos += consumed;
                            self.begin_block(Phase::Trailers);
                        }
                        Ok(Step::NeedMore) => pos = end,
                        Err(BodyError { code, at }) => return Err(self.fail(code, pos + at - start)),
                    }
                }
            }
        }
        Ok(end - start)
    }

    fn begin_block(&mut self, phase: Phase) {
        self.head.clear();
        self.line_start = 0;
        self.phase = phase;
    }

    /// Buffers input up to the next line end of the header block (or the
    /// trailers) and tries to parse the block once a line is complete.
    fn feed_block<H>(
        &mut self,
        handler: &mut H,
        buf: &[u8],
        start: usize,
        pos: usize,
        end: usize,
    ) -> Result<usize, ExecuteError>
    where
        H: ParserHandler + ?Sized,
    {
        let input = &buf[pos..end];
        let (take, line_done) = match input.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (input.len(), false),
        };
        let before = self.head.len();
        if before + take > self.max_header_size {
            let at = pos + self.max_header_size.saturating_sub(before);
            return Err(self.fail(ParseErrorCode::HeaderOverflow, at - start));
        }
        self.head.extend_from_slice(&input[..take]);
        let next = pos + take;
        if !line_done {
            return Ok(next);
        }

        // Maps an index into `head` to bytes consumed in this call. Bytes
        // buffered by earlier calls count as zero.
        let located = |index: usize| {
            if index >= before {
                pos + (index - before) - start
            } else {
                0
            }
        };

        if let Phase::Trailers = self.phase {
            return match self.parse_trailers(&self.head) {
                Ok(None) => {
                    self.line_start = self.head.len();
                    Ok(next)
                }
                Ok(Some(trailers)) => {
                    if !trailers.is_empty() {
                        if let Err(source) = handler.on_headers(trailers) {
                            return Err(self.callback_failed(ParseErrorCode::CbHeaders, next - start, source));
                        }
                    }
                    self.complete_message(handler, next - start)?;
                    Ok(next)
                }
                Err(err) => {
                    let index = self.first_bad_byte(|bytes| self.parse_trailers(bytes).is_err());
                    let code = match err {
                        httparse::Error::TooManyHeaders => ParseErrorCode::HeaderOverflow,
                        _ => ParseErrorCode::InvalidHeaderToken,
                    };
                    Err(self.fail(code, located(index)))
                }
            };
        }

        match self.parse_head(&self.head) {
            Ok(None) => {
                self.line_start = self.head.len();
                Ok(next)
            }
            Ok(Some(head)) => {
                self.headers_complete(handler, head, next - start)?;
                Ok(next)
            }
            Err(err) => {
                let index = self.first_bad_byte(|bytes| self.parse_head(bytes).is_err());
                let code = self.head_error_code(err, &self.head[..index]);
                Err(self.fail(code, located(index)))
            }
        }
    }

    fn headers_complete<H>(&mut self, handler: &mut H, head: Head, consumed: usize) -> Result<(), ExecuteError>
    where
        H: ParserHandler + ?Sized,
    {
        let headers = &head.headers;
        let content_length = match content_length(headers) {
            Ok(length) => length,
            Err(code) => return Err(self.fail(code, consumed.saturating_sub(1))),
        };
        let chunked = headers
            .tokens("transfer-encoding")
            .last()
            .is_some_and(|t| t.eq_ignore_ascii_case("chunked"));
        let connect = head.method == Some(Method::Connect);
        let upgrade = connect
            || (headers.contains("upgrade")
                && headers.has_token("connection", "upgrade")
                && match self.kind {
                    MessageType::Request => true,
                    MessageType::Response => head.status_code == Some(101),
                });
        let needs_eof = self.kind == MessageType::Response
            && !chunked
            && content_length.is_none()
            && !matches!(head.status_code, Some(100..=199 | 204 | 304));
        let keep_alive = if head.version_minor >= 1 {
            !headers.has_token("connection", "close")
        } else {
            headers.has_token("connection", "keep-alive")
        };

        self.keep_alive = keep_alive && !needs_eof;
        self.upgrade = upgrade;
        self.body_started = false;

        let info = HeadersInfo {
            headers: head.headers,
            version_major: 1,
            version_minor: head.version_minor,
            should_keep_alive: self.keep_alive,
            upgrade,
            method: head.method,
            url: head.url,
            status_code: head.status_code,
        };
        trace!(kind = ?self.kind, keep_alive = self.keep_alive, upgrade, "headers complete");
        let skip_body = match handler.on_headers_complete(info) {
            Ok(skip) => skip,
            Err(source) => return Err(self.callback_failed(ParseErrorCode::CbHeadersComplete, consumed, source)),
        };

        let has_body = chunked || content_length.is_some_and(|n| n > 0);
        if skip_body || (upgrade && (connect || !has_body)) {
            return self.complete_message(handler, consumed);
        }
        let framing = if chunked {
            Some(Framing::Chunked)
        } else {
            match content_length {
                Some(0) => None,
                Some(n) => Some(Framing::Fixed(n)),
                None if needs_eof => Some(Framing::UntilEof),
                None => None,
            }
        };
        match framing {
            Some(framing) => {
                self.phase = Phase::Body(BodyDecoder::new(framing));
                Ok(())
            }
            None => self.complete_message(handler, consumed),
        }
    }

    fn complete_message<H>(&mut self, handler: &mut H, consumed: usize) -> Result<(), ExecuteError>
    where
        H: ParserHandler + ?Sized,
    {
        self.head.clear();
        self.line_start = 0;
        self.body_started = false;
        self.completed = true;
        if self.upgrade {
            self.phase = Phase::Upgraded;
        } else {
            self.phase = Phase::Idle;
            self.dead = !self.keep_alive;
        }
        trace!(kind = ?self.kind, "message complete");
        handler
            .on_message_complete()
            .map_err(|source| self.callback_failed(ParseErrorCode::CbMessageComplete, consumed, source))
    }

    fn fail(&mut self, code: ParseErrorCode, consumed: usize) -> ExecuteError {
        let err = ProtocolError::new(code, consumed);
        debug!(kind = ?self.kind, %code, consumed, "parse failed");
        self.phase = Phase::Failed(err);
        err.into()
    }

    fn callback_failed(
        &mut self,
        code: ParseErrorCode,
        consumed: usize,
        source: Box<dyn StdError + Send + Sync>,
    ) -> ExecuteError {
        let protocol = ProtocolError::new(code, consumed);
        debug!(kind = ?self.kind, %code, error = %source, "parser callback failed");
        self.phase = Phase::Failed(protocol);
        ExecuteError::Callback { protocol, source }
    }

    /// Index in `head` of the first byte that makes `fails` true, searching
    /// from the start of the last line.
    ///
    /// Once a prefix fails every longer prefix fails too, so the shortest
    /// failing prefix is found by bisection.
    fn first_bad_byte(&self, fails: impl Fn(&[u8]) -> bool) -> usize {
        let fallback = self.head.len().saturating_sub(1);
        let (mut lo, mut hi) = (self.line_start + 1, self.head.len());
        if lo > hi || !fails(&self.head[..hi]) {
            return fallback;
        }
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if fails(&self.head[..mid]) {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        hi - 1
    }

    fn head_error_code(&self, err: httparse::Error, prefix: &[u8]) -> ParseErrorCode {
        use httparse::Error as E;
        match (err, self.kind) {
            (E::HeaderName | E::HeaderValue, _) => ParseErrorCode::InvalidHeaderToken,
            (E::NewLine, _) => ParseErrorCode::LfExpected,
            (E::Version, _) => ParseErrorCode::InvalidVersion,
            (E::TooManyHeaders, _) => ParseErrorCode::HeaderOverflow,
            (E::Status, _) | (E::Token, MessageType::Response) => ParseErrorCode::InvalidStatus,
            (E::Token, MessageType::Request) if !prefix.contains(&b' ') => ParseErrorCode::InvalidMethod,
            (E::Token, MessageType::Request) => ParseErrorCode::InvalidUrl,
            #[allow(unreachable_patterns)]
            _ => ParseErrorCode::Unknown,
        }
    }

    fn parse_head(&self, bytes: &[u8]) -> Result<Option<Head>, httparse::Error> {
        let mut fields = vec![httparse::EMPTY_HEADER; self.max_headers];
        match self.kind {
            MessageType::Request => {
                let mut req = httparse::Request::new(&mut fields);
                if req.parse(bytes)?.is_partial() {
                    return Ok(None);
                }
                Ok(Some(Head {
                    method: req.method.map(parse_method),
                    url: req.path.map(str::to_owned),
                    status_code: None,
                    version_minor: req.version.unwrap_or(1),
                    headers: collect(req.headers),
                }))
            }
            MessageType::Response => {
                let mut res = httparse::Response::new(&mut fields);
                if res.parse(bytes)?.is_partial() {
                    return Ok(None);
                }
                Ok(Some(Head {
                    method: None,
                    url: None,
                    status_code: res.code,
                    version_minor: res.version.unwrap_or(1),
                    headers: collect(res.headers),
                }))
            }
        }
    }

    fn parse_trailers(&self, bytes: &[u8]) -> Result<Option<Headers>, httparse::Error> {
        let mut fields = vec![httparse::EMPTY_HEADER; self.max_headers];
        match httparse::parse_headers(bytes, &mut fields)? {
            httparse::Status::Complete((_, parsed)) => Ok(Some(collect(parsed))),
            httparse::Status::Partial => Ok(None),
        }
    }
}

fn parse_method(token: &str) -> Method {
    let Ok(method) = token.parse::<Method>();
    method
}

fn collect(fields: &[httparse::Header<'_>]) -> Headers {
    fields
        .iter()
        .map(|h| (h.name, String::from_utf8_lossy(h.value).into_owned()))
        .collect()
}

/// All `Content-Length` entries must be plain digits and agree.
fn content_length(headers: &Headers) -> Result<Option<u64>, ParseErrorCode> {
    let mut length = None;
    for value in headers.get_all("content-length") {
        let value = value.trim();
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseErrorCode::InvalidContentLength);
        }
        let parsed: u64 = value
            .parse()
            .map_err(|_| ParseErrorCode::InvalidContentLength)?;
        match length {
            Some(previous) if previous != parsed => return Err(ParseErrorCode::InvalidContentLength),
            _ => length = Some(parsed),
        }
    }
    Ok(length)
}
