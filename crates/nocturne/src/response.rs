// src/response.rs
//! Response side of a connection: the header buffer, the mapped file and the
//! send cursor that walks across both.

use std::fmt::{self, Write as _};
use std::fs::File;
use std::io;
use std::os::unix::fs::PermissionsExt;

use arrayvec::{ArrayString, ArrayVec};
use memmap2::Mmap;
use tracing::debug;

use crate::error::{NocturneError, NocturneResult};
use crate::http::HttpCode;

pub const WRITE_BUF_SIZE: usize = 1024;
pub const FILENAME_LEN: usize = 512;

/// "Others may read" permission bit.
const WORLD_READABLE: u32 = 0o004;
const MAX_PATH_DEPTH: usize = 64;

/// A read-only view of a served file. Unmapped on drop.
pub struct MappedFile {
    map: Option<Mmap>,
    size: usize,
    mode: u32,
}

impl MappedFile {
    pub fn as_bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }
}

pub struct Response {
    buf: ArrayVec<u8, WRITE_BUF_SIZE>,
    file: Option<MappedFile>,
    real_file: ArrayString<FILENAME_LEN>,
    iov_count: usize,
    bytes_sent: usize,
}

impl Response {
    pub fn new() -> Self {
        Self {
            buf: ArrayVec::new(),
            file: None,
            real_file: ArrayString::new(),
            iov_count: 0,
            bytes_sent: 0,
        }
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.file = None;
        self.real_file.clear();
        self.iov_count = 0;
        self.bytes_sent = 0;
    }

    // ---- File resolution ----

    /// Resolve `url` under `doc_root` and map the file it names.
    ///
    /// The URL is normalised lexically; a `..` that would climb above the
    /// document root is refused. Returns `FileRequest` on success or the error
    /// code the client should receive.
    pub fn map_file(&mut self, doc_root: &str, url: &str) -> HttpCode {
        self.file = None;
        self.real_file.clear();
        if self.real_file.try_push_str(doc_root.trim_end_matches('/')).is_err() {
            return HttpCode::BadRequest;
        }

        let mut marks: ArrayVec<usize, MAX_PATH_DEPTH> = ArrayVec::new();
        for segment in url.split('/') {
            match segment {
                "" | "." => {}
                ".." => match marks.pop() {
                    Some(mark) => self.real_file.truncate(mark),
                    None => return HttpCode::ForbiddenRequest,
                },
                name => {
                    if marks.try_push(self.real_file.len()).is_err()
                        || self.real_file.try_push('/').is_err()
                        || self.real_file.try_push_str(name).is_err()
                    {
                        return HttpCode::BadRequest;
                    }
                }
            }
        }

        let meta = match std::fs::metadata(self.real_file.as_str()) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => return HttpCode::ForbiddenRequest,
            Err(_) => return HttpCode::NoResource,
        };

        let mode = meta.permissions().mode();
        if mode & WORLD_READABLE == 0 {
            return HttpCode::ForbiddenRequest;
        }
        if meta.is_dir() {
            return HttpCode::BadRequest;
        }

        let file = match File::open(self.real_file.as_str()) {
            Ok(file) => file,
            Err(e) => {
                return match e.kind() {
                    io::ErrorKind::NotFound => HttpCode::NoResource,
                    io::ErrorKind::PermissionDenied => HttpCode::ForbiddenRequest,
                    _ => HttpCode::InternalError,
                };
            }
        };

        let map = if meta.len() == 0 {
            None
        } else {
            // SAFETY: the mapping is read-only and private to this connection;
            // served files are not expected to be truncated while in flight.
            match unsafe { Mmap::map(&file) } {
                Ok(map) => Some(map),
                Err(e) => {
                    debug!(path = %self.real_file, error = %e, "mmap failed");
                    return HttpCode::InternalError;
                }
            }
        };
        let size = map.as_ref().map_or(0, |m| m.len());

        self.file = Some(MappedFile { map, size, mode });
        HttpCode::FileRequest
    }

    /// Path of the last resolved file.
    pub fn real_file(&self) -> &str {
        self.real_file.as_str()
    }

    pub fn file(&self) -> Option<&MappedFile> {
        self.file.as_ref()
    }

    /// Drop the mapping once the response has been flushed.
    pub fn release_file(&mut self) {
        self.file = None;
    }

    // ---- Assembly ----

    /// Append formatted text. On overflow the buffer is left as it was.
    fn add(&mut self, args: fmt::Arguments<'_>) -> NocturneResult<()> {
        let mark = self.buf.len();
        if BufWriter(&mut self.buf).write_fmt(args).is_err() {
            self.buf.truncate(mark);
            return Err(NocturneError::ResponseTooLarge);
        }
        Ok(())
    }

    pub fn add_status_line(&mut self, status: u16, title: &str) -> NocturneResult<()> {
        self.add(format_args!("HTTP/1.1 {} {}\r\n", status, title))
    }

    pub fn add_headers(&mut self, content_len: usize, keep_alive: bool) -> NocturneResult<()> {
        self.add(format_args!("Content-length: {}\r\n", content_len))?;
        self.add(format_args!("Content-Type: text/html\r\n"))?;
        let connection = if keep_alive { "keep-alive" } else { "close" };
        self.add(format_args!("Connection: {}\r\n", connection))?;
        self.add(format_args!("\r\n"))
    }

    pub fn add_content(&mut self, content: &str) -> NocturneResult<()> {
        self.add(format_args!("{}", content))
    }

    /// Build the response for `code` into the header buffer and set up the
    /// scatter list: header plus file for a served file, header (with the
    /// canned body) alone for everything else.
    pub fn assemble(&mut self, code: HttpCode, keep_alive: bool) -> NocturneResult<()> {
        let Some((status, title, form)) = code.status() else {
            return Err(NocturneError::Other(format!("no response for {:?}", code)));
        };

        self.buf.clear();
        self.bytes_sent = 0;
        self.add_status_line(status, title)?;

        match form {
            Some(body) => {
                self.add_headers(body.len(), keep_alive)?;
                self.add_content(body)?;
                self.iov_count = 1;
            }
            None => {
                let size = self.file.as_ref().map_or(0, MappedFile::size);
                self.add_headers(size, keep_alive)?;
                self.iov_count = if size > 0 { 2 } else { 1 };
            }
        }
        Ok(())
    }

    // ---- Sending ----

    pub fn head(&self) -> &[u8] {
        &self.buf
    }

    pub fn iov_count(&self) -> usize {
        self.iov_count
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    fn body(&self) -> &[u8] {
        match (&self.file, self.iov_count) {
            (Some(file), 2) => file.as_bytes(),
            _ => &[],
        }
    }

    pub fn total_len(&self) -> usize {
        self.buf.len() + self.body().len()
    }

    pub fn bytes_to_send(&self) -> usize {
        self.total_len() - self.bytes_sent
    }

    /// Unsent remainder of each scatter element, in order.
    pub fn pending(&self) -> ArrayVec<&[u8], 2> {
        let mut out = ArrayVec::new();
        let head = self.buf.len();
        let body = self.body();

        if self.bytes_sent < head {
            out.push(&self.buf[self.bytes_sent..]);
            if !body.is_empty() {
                out.push(body);
            }
        } else if self.bytes_sent - head < body.len() {
            out.push(&body[self.bytes_sent - head..]);
        }
        out
    }

    /// Record `n` more bytes as written to the socket.
    pub fn advance(&mut self, n: usize) {
        self.bytes_sent = (self.bytes_sent + n).min(self.total_len());
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_sent >= self.total_len()
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

struct BufWriter<'a>(&'a mut ArrayVec<u8, WRITE_BUF_SIZE>);

impl fmt::Write for BufWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.try_extend_from_slice(s.as_bytes()).map_err(|_| fmt::Error)
    }
}
