// src/conn.rs
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use crate::error::NocturneResult;
use crate::parser::RequestParser;
use crate::response::Response;
use crate::syscalls;

/// Per-connection state. One lives in each occupied slot of the connection
/// table and is reused for every socket that lands on that descriptor.
pub struct Conn {
    pub fd: RawFd,
    pub peer: Option<SocketAddr>,
    pub parser: RequestParser,
    pub response: Response,
    /// Number of HTTP requests served on this keep-alive connection
    pub requests_served: u32,
}

/// What a read-readiness drain left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes (possibly none) were buffered and the socket is still open.
    Data(usize),
    /// The peer closed, or the buffer was already full before reading.
    Closed,
}

impl Conn {
    pub fn new(fd: RawFd, peer: Option<SocketAddr>) -> Self {
        Self {
            fd,
            peer,
            parser: RequestParser::new(),
            response: Response::new(),
            requests_served: 0,
        }
    }

    /// Take over a freshly accepted socket.
    pub fn init(&mut self, fd: RawFd, peer: Option<SocketAddr>) {
        self.fd = fd;
        self.peer = peer;
        self.requests_served = 0;
        self.reset();
    }

    /// Back to "awaiting request line", ready for the next request.
    pub fn reset(&mut self) {
        self.parser.reset();
        self.response.reset();
    }

    /// Drain the socket into the read buffer until it would block, the peer
    /// hangs up or the buffer fills.
    pub fn read_socket(&mut self) -> NocturneResult<ReadOutcome> {
        if self.parser.is_full() {
            return Ok(ReadOutcome::Closed);
        }

        let mut total = 0;
        while !self.parser.is_full() {
            match syscalls::read_nonblocking(self.fd, self.parser.spare_mut())? {
                Some(0) => return Ok(ReadOutcome::Closed),
                Some(n) => {
                    self.parser.commit(n);
                    total += n;
                }
                None => break,
            }
        }
        Ok(ReadOutcome::Data(total))
    }
}
