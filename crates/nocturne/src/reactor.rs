// src/reactor.rs
//! The event loop. One thread owns the listener, the epoll set, the control
//! pipe and the idle timers. It accepts, drains sockets, flushes responses
//! and hands parsing to the pool.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use crate::config::ServerConfig;
use crate::conn::ReadOutcome;
use crate::error::{NocturneError, NocturneResult};
use crate::metrics::ServerMetrics;
use crate::pool::ThreadPool;
use crate::slab::{ConnGuard, ConnState, ConnectionSlab};
use crate::syscalls::{self, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, Epoll, Interest, epoll_event};
use crate::timer::{Ticker, TimerList};
use crate::worker::{ConnTask, Shared};

const LISTENER: u64 = u64::MAX;
const CONTROL: u64 = u64::MAX - 1;

const TICK: u8 = b't';
const QUIT: u8 = b'q';

/// Self-pipe used to wake the reactor from other threads.
struct ControlPipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl ControlPipe {
    fn new() -> NocturneResult<Self> {
        let (read_fd, write_fd) = syscalls::create_pipe()?;
        Ok(Self { read_fd, write_fd })
    }

    fn notify(&self, byte: u8) -> NocturneResult<()> {
        syscalls::pipe_notify(self.write_fd, byte)
    }
}

impl Drop for ControlPipe {
    fn drop(&mut self) {
        syscalls::close_fd(self.read_fd);
        syscalls::close_fd(self.write_fd);
    }
}

/// Asks a running reactor to stop. Cheap to clone and safe to use from a
/// signal handler thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    control: Arc<ControlPipe>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        if let Err(e) = self.control.notify(QUIT) {
            warn!(error = %e, "failed to signal reactor shutdown");
        }
    }
}

pub struct Reactor {
    listen_fd: RawFd,
    shared: Arc<Shared>,
    pool: ThreadPool<ConnTask>,
    control: Arc<ControlPipe>,

    timers: Option<TimerList<RawFd>>,
    idle_timeout: Option<Duration>,
    tick_interval: Duration,
    ticker: Option<Ticker>,

    /// Tasks the pool refused while its queue was full, oldest first.
    deferred: VecDeque<ConnTask>,
    events: Vec<epoll_event>,
    running: bool,
    finished: bool,
}

impl Reactor {
    /// Take ownership of a listening socket and set up everything the loop
    /// needs. The socket is closed if setup fails.
    pub fn new(config: &ServerConfig, listen_fd: RawFd) -> NocturneResult<Self> {
        Self::setup(config, listen_fd).inspect_err(|_| syscalls::close_fd(listen_fd))
    }

    fn setup(config: &ServerConfig, listen_fd: RawFd) -> NocturneResult<Self> {
        let epoll = Epoll::new()?;
        epoll.add_level(listen_fd, LISTENER)?;

        let control = Arc::new(ControlPipe::new()?);
        epoll.add_level(control.read_fd, CONTROL)?;

        let doc_root = config.doc_root.to_string_lossy().into_owned();
        let shared = Arc::new(Shared::new(
            epoll,
            ConnectionSlab::new(config.max_connections),
            doc_root,
            Arc::new(ServerMetrics::new()),
        ));
        let pool = ThreadPool::new(config.workers, config.max_requests)?;

        Ok(Self {
            listen_fd,
            shared,
            pool,
            control,
            timers: config.idle_timeout.map(|_| TimerList::new()),
            idle_timeout: config.idle_timeout,
            tick_interval: config.tick_interval,
            ticker: None,
            deferred: VecDeque::new(),
            events: vec![epoll_event { events: 0, u64: 0 }; config.max_events],
            running: false,
            finished: false,
        })
    }

    pub fn local_addr(&self) -> NocturneResult<SocketAddr> {
        syscalls::local_addr(self.listen_fd)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            control: Arc::clone(&self.control),
        }
    }

    pub fn metrics(&self) -> Arc<ServerMetrics> {
        Arc::clone(&self.shared.metrics)
    }

    /// Run until a shutdown handle fires or epoll itself fails. Workers are
    /// joined and every remaining connection is closed before returning.
    pub fn run(&mut self) -> NocturneResult<()> {
        if self.finished {
            return Ok(());
        }

        if self.idle_timeout.is_some() {
            let control = Arc::clone(&self.control);
            self.ticker = Some(Ticker::spawn(self.tick_interval, move || control.notify(TICK).is_ok())?);
        }

        info!(
            addr = ?self.local_addr().ok(),
            workers = self.pool.threads(),
            capacity = self.shared.slab.capacity(),
            "reactor running"
        );

        self.running = true;
        let mut result = Ok(());
        while self.running {
            // poll briefly while tasks are parked so they get retried
            let timeout = if self.deferred.is_empty() { -1 } else { 1 };
            let n = match self.shared.epoll.wait(&mut self.events, timeout) {
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, "epoll_wait failed");
                    result = Err(e);
                    break;
                }
            };

            for i in 0..n {
                let event = self.events[i];
                let token = event.u64;
                let flags = event.events;
                match token {
                    LISTENER => self.accept(),
                    CONTROL => self.drain_control(),
                    _ => self.dispatch(token as RawFd, flags),
                }
            }

            self.retry_deferred();
        }

        self.finish();
        result
    }

    fn accept(&mut self) {
        let (fd, peer) = match syscalls::accept_connection(self.listen_fd) {
            Ok(Some(accepted)) => accepted,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "accept failed");
                return;
            }
        };

        let shared = Arc::clone(&self.shared);
        let guard = match admit(&shared.slab, fd, peer) {
            Ok(guard) => guard,
            Err(e) => {
                warn!(fd, error = %e, "rejecting connection");
                shared.metrics.inc_rejected();
                syscalls::close_fd(fd);
                return;
            }
        };
        shared.metrics.inc_conn();

        if let Err(e) = syscalls::set_reuse_addr(fd) {
            debug!(fd, error = %e, "SO_REUSEADDR failed");
        }

        guard.release(ConnState::AwaitingRead);
        if let Err(e) = shared.epoll.add_oneshot(fd, fd as u64, Interest::Read) {
            warn!(fd, error = %e, "failed to register connection");
            if let Some(guard) = shared.slab.claim(fd, ConnState::AwaitingRead, ConnState::Closing) {
                shared.close(guard);
            }
            return;
        }

        if let (Some(timers), Some(idle)) = (self.timers.as_mut(), self.idle_timeout) {
            timers.register(fd, Instant::now() + idle);
        }
        debug!(fd, ?peer, "accepted connection");
    }

    fn dispatch(&mut self, fd: RawFd, flags: u32) {
        if flags & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) as u32 != 0 {
            self.on_hangup(fd);
        } else if flags & EPOLLIN as u32 != 0 {
            self.on_readable(fd);
        } else if flags & EPOLLOUT as u32 != 0 {
            self.on_writable(fd);
        }
    }

    fn on_hangup(&mut self, fd: RawFd) {
        let shared = Arc::clone(&self.shared);
        let guard = shared
            .slab
            .claim(fd, ConnState::AwaitingRead, ConnState::Closing)
            .or_else(|| shared.slab.claim(fd, ConnState::AwaitingWrite, ConnState::Closing));

        match guard {
            Some(guard) => {
                debug!(fd, "peer hung up");
                self.forget_timer(fd);
                shared.close(guard);
            }
            None => self.lost_claim(fd),
        }
    }

    fn on_readable(&mut self, fd: RawFd) {
        let shared = Arc::clone(&self.shared);
        let Some(mut guard) = shared.slab.claim(fd, ConnState::AwaitingRead, ConnState::Reading) else {
            self.lost_claim(fd);
            return;
        };

        match guard.read_socket() {
            Ok(ReadOutcome::Data(n)) => {
                trace!(fd, n, "read");
                guard.release(ConnState::Queued);
                self.touch_timer(fd);
                self.submit(ConnTask::new(Arc::clone(&shared), fd));
            }
            Ok(ReadOutcome::Closed) => {
                self.forget_timer(fd);
                shared.close(guard);
            }
            Err(e) => {
                debug!(fd, error = %e, "read failed");
                self.forget_timer(fd);
                shared.close(guard);
            }
        }
    }

    fn on_writable(&mut self, fd: RawFd) {
        let shared = Arc::clone(&self.shared);
        let Some(guard) = shared.slab.claim(fd, ConnState::AwaitingWrite, ConnState::Writing) else {
            self.lost_claim(fd);
            return;
        };

        shared.flush(guard);
        match shared.slab.state(fd) {
            Some(ConnState::Free) => self.forget_timer(fd),
            _ => self.touch_timer(fd),
        }
    }

    /// An event arrived for a connection we could not claim.
    fn lost_claim(&self, fd: RawFd) {
        match self.shared.slab.state(fd) {
            // already closed earlier in this batch
            Some(ConnState::Free) | None => debug!(fd, "event for a closed connection"),
            Some(state) => {
                self.shared.metrics.inc_conflict();
                warn!(fd, ?state, "event for a connection owned elsewhere");
            }
        }
    }

    fn submit(&mut self, task: ConnTask) {
        // keep FIFO order behind anything already parked
        if !self.deferred.is_empty() {
            self.shared.metrics.inc_deferred();
            self.deferred.push_back(task);
            return;
        }
        if let Err(task) = self.pool.submit(task) {
            warn!(fd = task.fd(), queued = self.pool.len(), "task queue full, deferring");
            self.shared.metrics.inc_deferred();
            self.deferred.push_back(task);
        }
    }

    fn retry_deferred(&mut self) {
        while let Some(task) = self.deferred.pop_front() {
            if let Err(task) = self.pool.submit(task) {
                self.deferred.push_front(task);
                break;
            }
        }
    }

    fn drain_control(&mut self) {
        let mut buf = [0u8; 64];
        let mut tick = false;
        loop {
            match syscalls::read_nonblocking(self.control.read_fd, &mut buf) {
                Ok(Some(0)) | Ok(None) => break,
                Ok(Some(n)) => {
                    for byte in &buf[..n] {
                        match *byte {
                            TICK => tick = true,
                            QUIT => self.running = false,
                            other => debug!(byte = other, "unknown control byte"),
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "control pipe read failed");
                    break;
                }
            }
        }

        if tick && self.running {
            self.expire_idle();
        }
    }

    /// Close connections that have been waiting for input past their
    /// deadline. Connections busy elsewhere get a fresh deadline.
    fn expire_idle(&mut self) {
        let (Some(timers), Some(idle)) = (self.timers.as_mut(), self.idle_timeout) else {
            return;
        };
        let shared = &self.shared;
        let now = Instant::now();
        let mut busy = Vec::new();

        let fired = timers.tick(now, |fd| {
            match shared.slab.claim(fd, ConnState::AwaitingRead, ConnState::Closing) {
                Some(guard) => {
                    debug!(fd, "closing idle connection");
                    shared.close(guard);
                }
                None => {
                    if !matches!(shared.slab.state(fd), Some(ConnState::Free) | None) {
                        busy.push(fd);
                    }
                }
            }
        });

        for fd in busy {
            timers.register(fd, now + idle);
        }
        if fired > 0 {
            debug!(fired, active = shared.slab.len(), "idle sweep");
        }
    }

    fn touch_timer(&mut self, fd: RawFd) {
        if let (Some(timers), Some(idle)) = (self.timers.as_mut(), self.idle_timeout) {
            timers.register(fd, Instant::now() + idle);
        }
    }

    fn forget_timer(&mut self, fd: RawFd) {
        if let Some(timers) = self.timers.as_mut() {
            timers.remove(fd);
        }
    }

    /// Stop the ticker and the pool, then close every connection and the
    /// listener.
    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.running = false;

        if let Some(mut ticker) = self.ticker.take() {
            ticker.stop();
        }
        self.pool.shutdown();
        self.deferred.clear();

        let shared = Arc::clone(&self.shared);
        let open: Vec<RawFd> = shared.slab.occupied().collect();
        for fd in open {
            // SAFETY: the pool is joined and the reactor is the only thread left.
            if let Some(guard) = unsafe { shared.slab.reclaim(fd) } {
                shared.close(guard);
            }
        }
        if let Some(timers) = self.timers.as_mut() {
            *timers = TimerList::new();
        }

        if let Err(e) = shared.epoll.delete(self.listen_fd) {
            debug!(error = %e, "failed to unregister listener");
        }
        syscalls::close_fd(self.listen_fd);

        let snap = shared.metrics.snapshot();
        info!(
            requests = snap.requests,
            bytes_sent = snap.bytes_sent,
            rejected = snap.rejected,
            deferred = snap.deferred,
            ownership_conflicts = snap.ownership_conflicts,
            "reactor stopped"
        );
    }
}

/// Claim a table slot for a new descriptor, or refuse it.
fn admit(slab: &ConnectionSlab, fd: RawFd, peer: Option<SocketAddr>) -> NocturneResult<ConnGuard<'_>> {
    if slab.len() >= slab.capacity() {
        return Err(NocturneError::TableFull);
    }
    slab.open(fd, peer).ok_or(NocturneError::TableFull)
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::thread;

    fn config(root: &tempfile::TempDir) -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".into(),
            doc_root: root.path().to_path_buf(),
            workers: 2,
            max_requests: 16,
            max_connections: 1024,
            max_events: 64,
            idle_timeout: None,
            ..ServerConfig::default()
        }
    }

    fn reactor(config: &ServerConfig) -> Reactor {
        let fd = syscalls::create_listen_socket(&config.host, 0, 128).unwrap();
        Reactor::new(config, fd).unwrap()
    }

    #[test]
    fn serves_one_request_and_stops_on_handle() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("a.html"), b"abc").unwrap();
        let mut reactor = reactor(&config(&root));
        let addr = reactor.local_addr().unwrap();
        let handle = reactor.shutdown_handle();
        let metrics = reactor.metrics();
        let server = thread::spawn(move || reactor.run());

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"GET /a.html HTTP/1.1\r\n\r\n").unwrap();
        let mut text = String::new();
        stream.read_to_string(&mut text).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("\r\n\r\nabc"));

        handle.shutdown();
        server.join().unwrap().unwrap();
        let snap = metrics.snapshot();
        assert_eq!(snap.requests, 1);
        assert_eq!(snap.active_conns, 0);
    }

    #[test]
    fn shutdown_closes_open_connections() {
        let root = tempfile::tempdir().unwrap();
        let mut reactor = reactor(&config(&root));
        let addr = reactor.local_addr().unwrap();
        let handle = reactor.shutdown_handle();
        let metrics = reactor.metrics();
        let server = thread::spawn(move || reactor.run());

        let mut idle = TcpStream::connect(addr).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while metrics.snapshot().active_conns == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(metrics.snapshot().active_conns, 1);

        handle.shutdown();
        server.join().unwrap().unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(idle.read(&mut buf).unwrap(), 0);
        assert_eq!(metrics.snapshot().active_conns, 0);
    }

    #[test]
    fn dropping_an_unstarted_reactor_releases_the_port() {
        let root = tempfile::tempdir().unwrap();
        let reactor = reactor(&config(&root));
        let addr = reactor.local_addr().unwrap();
        drop(reactor);
        assert!(TcpStream::connect(addr).is_err());
    }
}
