// src/parser.rs
//! Incremental HTTP/1.1 request parser.
//!
//! Bytes are appended to a fixed buffer by the reactor and parsed in place by
//! a worker. Three cursors track progress:
//!
//! ```text
//! 0        start_line      checked_idx        read_idx        READ_BUF_SIZE
//! |  done   | current line  |  not yet scanned  |    free space   |
//! ```
//!
//! Line terminators are overwritten with NUL bytes as lines are accepted, so
//! every parsed field is a span of the read buffer. Parsing can stop at any
//! byte boundary and resume later from the saved cursors.

use memchr::{memchr, memchr2};
use tracing::trace;

use crate::http::{CheckState, HttpCode, LineStatus, Method};

pub const READ_BUF_SIZE: usize = 2048;

/// A byte range inside the read buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub len: usize,
}

impl Span {
    fn end(&self) -> usize {
        self.start + self.len
    }
}

pub struct RequestParser {
    buf: [u8; READ_BUF_SIZE],
    read_idx: usize,
    checked_idx: usize,
    start_line: usize,

    state: CheckState,
    method: Method,
    url: Option<Span>,
    version: Option<Span>,
    host: Option<Span>,
    content_length: usize,
    keep_alive: bool,
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            buf: [0; READ_BUF_SIZE],
            read_idx: 0,
            checked_idx: 0,
            start_line: 0,
            state: CheckState::RequestLine,
            method: Method::Get,
            url: None,
            version: None,
            host: None,
            content_length: 0,
            keep_alive: false,
        }
    }

    /// Return to "awaiting request line" with every cursor at zero.
    pub fn reset(&mut self) {
        self.buf[..self.read_idx].fill(0);
        self.read_idx = 0;
        self.checked_idx = 0;
        self.start_line = 0;
        self.state = CheckState::RequestLine;
        self.method = Method::Get;
        self.url = None;
        self.version = None;
        self.host = None;
        self.content_length = 0;
        self.keep_alive = false;
    }

    // ---- Buffer side ----

    /// Unfilled tail of the read buffer, for `read(2)` to land in.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.read_idx..]
    }

    /// Record `n` bytes written into `spare_mut()`.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.read_idx + n <= READ_BUF_SIZE);
        self.read_idx = (self.read_idx + n).min(READ_BUF_SIZE);
    }

    /// Copy as much of `data` as fits. Returns the number of bytes taken.
    pub fn feed(&mut self, data: &[u8]) -> usize {
        let spare = self.spare_mut();
        let n = spare.len().min(data.len());
        spare[..n].copy_from_slice(&data[..n]);
        self.commit(n);
        n
    }

    pub fn is_full(&self) -> bool {
        self.read_idx == READ_BUF_SIZE
    }

    pub fn read_idx(&self) -> usize {
        self.read_idx
    }

    pub fn checked_idx(&self) -> usize {
        self.checked_idx
    }

    pub fn start_line(&self) -> usize {
        self.start_line
    }

    pub fn state(&self) -> CheckState {
        self.state
    }

    // ---- Parsed fields ----

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn url(&self) -> Option<&str> {
        self.url.and_then(|s| std::str::from_utf8(&self.buf[s.start..s.end()]).ok())
    }

    pub fn version(&self) -> Option<&str> {
        self.version.and_then(|s| std::str::from_utf8(&self.buf[s.start..s.end()]).ok())
    }

    pub fn host(&self) -> Option<&str> {
        self.host.and_then(|s| std::str::from_utf8(&self.buf[s.start..s.end()]).ok())
    }

    pub fn content_length(&self) -> usize {
        self.content_length
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Request body, once the whole of it has arrived.
    pub fn body(&self) -> &[u8] {
        if self.state == CheckState::Content && self.read_idx - self.start_line >= self.content_length {
            &self.buf[self.start_line..self.start_line + self.content_length]
        } else {
            &[]
        }
    }

    // ---- State machine ----

    /// Scan for the next line terminator between `checked_idx` and `read_idx`.
    pub fn parse_line(&mut self) -> LineStatus {
        if self.checked_idx >= self.read_idx {
            return LineStatus::Open;
        }

        let window = &self.buf[self.checked_idx..self.read_idx];
        let Some(offset) = memchr2(b'\r', b'\n', window) else {
            self.checked_idx = self.read_idx;
            return LineStatus::Open;
        };
        let idx = self.checked_idx + offset;

        if self.buf[idx] == b'\r' {
            self.checked_idx = idx;
            if idx + 1 == self.read_idx {
                return LineStatus::Open;
            }
            if self.buf[idx + 1] == b'\n' {
                self.buf[idx] = 0;
                self.buf[idx + 1] = 0;
                self.checked_idx = idx + 2;
                return LineStatus::Ok;
            }
            return LineStatus::Bad;
        }

        // bare '\n': only valid when the '\r' sits right before it
        self.checked_idx = idx;
        if idx > self.start_line && self.buf[idx - 1] == b'\r' {
            self.buf[idx - 1] = 0;
            self.buf[idx] = 0;
            self.checked_idx = idx + 1;
            return LineStatus::Ok;
        }
        LineStatus::Bad
    }

    /// Drive the state machine over every complete line received so far.
    ///
    /// Returns `NoRequest` when more input is needed, `GetRequest` once a
    /// whole request (including any body) is buffered, or `BadRequest`.
    pub fn process(&mut self) -> HttpCode {
        loop {
            if self.state == CheckState::Content {
                return self.parse_content();
            }

            match self.parse_line() {
                LineStatus::Ok => {}
                LineStatus::Open => return HttpCode::NoRequest,
                LineStatus::Bad => return HttpCode::BadRequest,
            }

            let start = self.start_line;
            let end = self.checked_idx - 2;
            self.start_line = self.checked_idx;
            trace!(line = %String::from_utf8_lossy(&self.buf[start..end]), "got 1 http line");

            let ret = match self.state {
                CheckState::RequestLine => self.parse_request_line(start, end),
                CheckState::Headers => self.parse_headers(start, end),
                CheckState::Content => HttpCode::InternalError,
            };

            if ret != HttpCode::NoRequest {
                return ret;
            }
        }
    }

    fn parse_request_line(&mut self, start: usize, end: usize) -> HttpCode {
        let is_ws = |b: &u8| *b == b' ' || *b == b'\t';

        // METHOD <ws> URL <ws> VERSION
        let (method_end, url_end) = {
            let line = &self.buf[start..end];
            let Some(sp1) = line.iter().position(is_ws) else {
                return HttpCode::BadRequest;
            };
            let Some(sp2) = line[sp1 + 1..].iter().position(is_ws) else {
                return HttpCode::BadRequest;
            };
            (start + sp1, start + sp1 + 1 + sp2)
        };

        let Some(method) = Method::from_bytes(&self.buf[start..method_end]) else {
            return HttpCode::BadRequest;
        };

        let version = Span {
            start: url_end + 1,
            len: end - (url_end + 1),
        };
        if !self.buf[version.start..version.end()].eq_ignore_ascii_case(b"HTTP/1.1") {
            return HttpCode::BadRequest;
        }

        self.buf[method_end] = 0;
        self.buf[url_end] = 0;

        let mut url_start = method_end + 1;
        let raw = &self.buf[url_start..url_end];
        if raw.len() >= 7 && raw[..7].eq_ignore_ascii_case(b"http://") {
            match memchr(b'/', &raw[7..]) {
                Some(slash) => url_start += 7 + slash,
                None => return HttpCode::BadRequest,
            }
        }

        if url_start >= url_end || self.buf[url_start] != b'/' {
            return HttpCode::BadRequest;
        }
        if std::str::from_utf8(&self.buf[url_start..url_end]).is_err() {
            return HttpCode::BadRequest;
        }

        self.method = method;
        self.url = Some(Span {
            start: url_start,
            len: url_end - url_start,
        });
        self.version = Some(version);
        self.state = CheckState::Headers;
        HttpCode::NoRequest
    }

    fn parse_headers(&mut self, start: usize, end: usize) -> HttpCode {
        if start == end {
            if self.content_length == 0 {
                return HttpCode::GetRequest;
            }
            // the body has to fit behind the header block
            if self.content_length > READ_BUF_SIZE - self.checked_idx {
                return HttpCode::BadRequest;
            }
            self.state = CheckState::Content;
            return HttpCode::NoRequest;
        }

        let line = &self.buf[start..end];
        if let Some(off) = header_value(line, b"Connection:") {
            if line[off..].eq_ignore_ascii_case(b"keep-alive") {
                self.keep_alive = true;
            }
        } else if let Some(off) = header_value(line, b"Content-Length:") {
            match parse_leading_digits(&line[off..]) {
                Some(n) => self.content_length = n,
                None => return HttpCode::BadRequest,
            }
        } else if let Some(off) = header_value(line, b"Host:") {
            self.host = Some(Span {
                start: start + off,
                len: end - (start + off),
            });
        } else {
            trace!(header = %String::from_utf8_lossy(line), "unknown header");
        }
        HttpCode::NoRequest
    }

    fn parse_content(&mut self) -> HttpCode {
        if self.read_idx - self.start_line >= self.content_length {
            HttpCode::GetRequest
        } else {
            HttpCode::NoRequest
        }
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Offset of the value if `line` starts with `name` (case-insensitive),
/// skipping spaces and tabs after the colon.
fn header_value(line: &[u8], name: &[u8]) -> Option<usize> {
    if line.len() < name.len() || !line[..name.len()].eq_ignore_ascii_case(name) {
        return None;
    }
    let skip = line[name.len()..]
        .iter()
        .take_while(|b| **b == b' ' || **b == b'\t')
        .count();
    Some(name.len() + skip)
}

/// `atol`-style: leading decimal digits, zero when there are none.
/// `None` on overflow.
fn parse_leading_digits(value: &[u8]) -> Option<usize> {
    value
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .try_fold(0usize, |acc, b| acc.checked_mul(10)?.checked_add((b - b'0') as usize))
}
