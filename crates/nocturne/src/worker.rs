// src/worker.rs
//! State shared between the reactor and the pool, and the task a worker runs
//! for a connection with buffered input.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::http::HttpCode;
use crate::metrics::ServerMetrics;
use crate::pool::Task;
use crate::slab::{ConnGuard, ConnState, ConnectionSlab};
use crate::syscalls::{self, Epoll, Interest};

pub struct Shared {
    pub epoll: Epoll,
    pub slab: ConnectionSlab,
    pub doc_root: String,
    pub metrics: Arc<ServerMetrics>,
}

impl Shared {
    pub fn new(epoll: Epoll, slab: ConnectionSlab, doc_root: String, metrics: Arc<ServerMetrics>) -> Self {
        Self {
            epoll,
            slab,
            doc_root,
            metrics,
        }
    }

    /// Give the connection up and re-arm it for `interest`. Ownership is
    /// released first so the next readiness edge finds the slot claimable.
    pub fn arm(&self, guard: ConnGuard<'_>, interest: Interest) {
        let fd = guard.fd();
        let (waiting, owned) = match interest {
            Interest::Read => (ConnState::AwaitingRead, ConnState::Reading),
            Interest::Write => (ConnState::AwaitingWrite, ConnState::Writing),
        };
        guard.release(waiting);

        if let Err(e) = self.epoll.rearm(fd, fd as u64, interest) {
            warn!(fd, error = %e, "failed to re-arm connection");
            // the registration is dead, so no event can race us for the slot
            if let Some(guard) = self.slab.claim(fd, waiting, owned) {
                self.close(guard);
            }
        }
    }

    /// Unregister, vacate the slot, then close the descriptor. In this order
    /// a reused descriptor number can never meet a slot that is still owned.
    pub fn close(&self, guard: ConnGuard<'_>) {
        let fd = guard.fd();
        if let Err(e) = self.epoll.delete(fd) {
            debug!(fd, error = %e, "epoll delete failed");
        }
        guard.free();
        syscalls::close_fd(fd);
        self.metrics.dec_conn();
        debug!(fd, "connection closed");
    }

    /// Write as much of the pending response as the socket takes.
    ///
    /// Would-block re-arms for write. Once everything is out the mapping is
    /// released and the connection is either reset for the next request or
    /// closed.
    pub fn flush(&self, mut guard: ConnGuard<'_>) {
        loop {
            let written = {
                let parts = guard.response.pending();
                if parts.is_empty() {
                    break;
                }
                syscalls::writev_nonblocking(guard.fd(), &parts)
            };

            match written {
                Ok(Some(n)) => {
                    guard.response.advance(n);
                    self.metrics.add_bytes(n);
                }
                Ok(None) => return self.arm(guard, Interest::Write),
                Err(e) => {
                    if e.is_transport() {
                        debug!(fd = guard.fd(), error = %e, "write failed");
                    } else {
                        warn!(fd = guard.fd(), error = %e, "write failed");
                    }
                    return self.close(guard);
                }
            }
        }

        guard.response.release_file();
        guard.requests_served += 1;
        self.metrics.inc_req();

        if guard.parser.keep_alive() {
            guard.reset();
            self.arm(guard, Interest::Read);
        } else {
            self.close(guard);
        }
    }
}

/// A connection whose read buffer has new bytes. Holds a handle, never the
/// connection itself.
pub struct ConnTask {
    shared: Arc<Shared>,
    fd: RawFd,
}

impl ConnTask {
    pub fn new(shared: Arc<Shared>, fd: RawFd) -> Self {
        Self { shared, fd }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Task for ConnTask {
    fn process(self) {
        let shared = &*self.shared;
        let Some(mut guard) = shared.slab.claim(self.fd, ConnState::Queued, ConnState::Processing) else {
            shared.metrics.inc_conflict();
            warn!(fd = self.fd, state = ?shared.slab.state(self.fd), "task found connection not queued");
            return;
        };

        let code = guard.parser.process();
        if !code.is_terminal() {
            if guard.parser.is_full() {
                debug!(fd = self.fd, "request does not fit in the read buffer");
                shared.close(guard);
            } else {
                shared.arm(guard, Interest::Read);
            }
            return;
        }

        let conn = &mut *guard;
        let code = if code == HttpCode::GetRequest {
            match conn.parser.url() {
                Some(url) => conn.response.map_file(&shared.doc_root, url),
                None => HttpCode::BadRequest,
            }
        } else {
            code
        };

        let keep_alive = conn.parser.keep_alive();
        match conn.response.assemble(code, keep_alive) {
            Ok(()) => {
                trace!(fd = self.fd, ?code, path = conn.response.real_file(), "response ready");
                shared.arm(guard, Interest::Write);
            }
            Err(e) => {
                warn!(fd = self.fd, error = %e, "failed to build response");
                shared.close(guard);
            }
        }
    }
}
