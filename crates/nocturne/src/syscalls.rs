// src/syscalls.rs
use crate::error::NocturneResult;
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::ptr;

pub use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, epoll_event};

// ---- Socket Operations ----

/// Create a non-blocking TCP listening socket with SO_REUSEADDR.
pub fn create_listen_socket(host: &str, port: u16, backlog: c_int) -> NocturneResult<c_int> {
    let addr_str = format!("{}:{}", host, port);
    let addr: SocketAddr = addr_str
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    unsafe {
        // 1. Create socket
        let fd = libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        // 2. Address reuse so restarts do not trip over TIME_WAIT
        if let Err(err) = set_reuse_addr(fd) {
            libc::close(fd);
            return Err(err);
        }

        // 3. Bind
        let (storage, len) = socket_addr_to_raw(&addr);
        if libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        // 4. Listen
        if libc::listen(fd, backlog) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

/// Set SO_REUSEADDR on a socket.
pub fn set_reuse_addr(fd: c_int) -> NocturneResult<()> {
    let optval: c_int = 1;
    unsafe {
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &optval as *const _ as *const c_void,
            mem::size_of_val(&optval) as socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

/// Accept one non-blocking connection. `Ok(None)` means nothing was pending.
pub fn accept_connection(listen_fd: c_int) -> NocturneResult<Option<(c_int, Option<SocketAddr>)>> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;

    unsafe {
        let fd = libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        );

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            Ok(Some((fd, raw_to_socket_addr(&storage))))
        }
    }
}

/// Address a socket is bound to.
pub fn local_addr(fd: c_int) -> NocturneResult<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
    unsafe {
        if libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    raw_to_socket_addr(&storage)
        .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "unsupported address family").into())
}

pub fn close_fd(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

fn socket_addr_to_raw(addr: &SocketAddr) -> (libc::sockaddr_storage, socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe { ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin) };
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            unsafe { ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6) };
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as socklen_t)
}

fn raw_to_socket_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

// ---- Epoll Operations ----

/// Readiness a connection is armed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

impl Interest {
    /// Edge-triggered, one-shot event mask. The peer-hangup bit rides along
    /// so a half-closed socket wakes the reactor.
    pub fn oneshot(self) -> u32 {
        let base = match self {
            Interest::Read => EPOLLIN,
            Interest::Write => EPOLLOUT,
        };
        (base | libc::EPOLLET | libc::EPOLLONESHOT | EPOLLRDHUP) as u32
    }
}

pub struct Epoll {
    pub fd: c_int,
}

impl Epoll {
    pub fn new() -> NocturneResult<Self> {
        unsafe {
            let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { fd })
        }
    }

    /// Add a file descriptor with a raw event mask.
    pub fn add(&self, fd: c_int, token: u64, events: u32) -> NocturneResult<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, events)
    }

    /// Replace the event mask of a registered descriptor. For one-shot
    /// registrations this is the re-arm.
    pub fn modify(&self, fd: c_int, token: u64, events: u32) -> NocturneResult<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, events)
    }

    /// Level-triggered read interest, used for the listener and control pipe.
    pub fn add_level(&self, fd: c_int, token: u64) -> NocturneResult<()> {
        self.add(fd, token, EPOLLIN as u32)
    }

    pub fn add_oneshot(&self, fd: c_int, token: u64, interest: Interest) -> NocturneResult<()> {
        self.add(fd, token, interest.oneshot())
    }

    pub fn rearm(&self, fd: c_int, token: u64, interest: Interest) -> NocturneResult<()> {
        self.modify(fd, token, interest.oneshot())
    }

    pub fn delete(&self, fd: c_int) -> NocturneResult<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    /// Block for events. A negative timeout waits forever; EINTR yields zero events.
    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> NocturneResult<usize> {
        unsafe {
            let res = libc::epoll_wait(self.fd, events.as_mut_ptr(), events.len() as c_int, timeout_ms);

            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err.into());
            }

            Ok(res as usize)
        }
    }

    fn ctl(&self, op: c_int, fd: c_int, token: u64, events: u32) -> NocturneResult<()> {
        let mut event = epoll_event { events, u64: token };
        unsafe {
            if libc::epoll_ctl(self.fd, op, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ---- Non-blocking I/O ----

/// Read into `buf`. `Ok(None)` is would-block, `Ok(Some(0))` is EOF.
pub fn read_nonblocking(fd: c_int, buf: &mut [u8]) -> NocturneResult<Option<usize>> {
    loop {
        let res = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if res >= 0 {
            return Ok(Some(res as usize));
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => return Ok(None),
            io::ErrorKind::Interrupted => continue,
            _ => return Err(err.into()),
        }
    }
}

/// Vectored write: write multiple buffers in a single syscall (scatter-gather I/O).
/// `Ok(None)` means the socket send buffer is full.
pub fn writev_nonblocking(fd: c_int, bufs: &[&[u8]]) -> NocturneResult<Option<usize>> {
    if bufs.is_empty() {
        return Ok(Some(0));
    }

    // Build iovec array on stack (max 8 segments)
    let mut iovecs: [libc::iovec; 8] = unsafe { mem::zeroed() };
    let iov_count = bufs.len().min(8);

    for i in 0..iov_count {
        iovecs[i] = libc::iovec {
            iov_base: bufs[i].as_ptr() as *mut c_void,
            iov_len: bufs[i].len(),
        };
    }

    loop {
        let res = unsafe { libc::writev(fd, iovecs.as_ptr(), iov_count as c_int) };
        if res >= 0 {
            return Ok(Some(res as usize));
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => return Ok(None),
            io::ErrorKind::Interrupted => continue,
            _ => return Err(err.into()),
        }
    }
}

// ---- Self-pipe ----

/// Create a Unix pipe with both ends non-blocking. Returns (read_fd, write_fd).
pub fn create_pipe() -> NocturneResult<(c_int, c_int)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok((fds[0], fds[1]))
}

/// Write one byte into a pipe. A full pipe is not an error: the reader is
/// already due to wake up.
pub fn pipe_notify(pipe_write_fd: c_int, byte: u8) -> NocturneResult<()> {
    unsafe {
        let n = libc::write(pipe_write_fd, &byte as *const u8 as *const c_void, 1);
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err.into());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_reports_its_ephemeral_port() {
        let fd = create_listen_socket("127.0.0.1", 0, 16).unwrap();
        let addr = local_addr(fd).unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
        assert!(accept_connection(fd).unwrap().is_none());
        close_fd(fd);
    }

    #[test]
    fn pipe_round_trip_and_would_block() {
        let (rd, wr) = create_pipe().unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(read_nonblocking(rd, &mut buf).unwrap(), None);

        pipe_notify(wr, b't').unwrap();
        pipe_notify(wr, b'q').unwrap();
        assert_eq!(read_nonblocking(rd, &mut buf).unwrap(), Some(2));
        assert_eq!(&buf[..2], b"tq");

        close_fd(wr);
        assert_eq!(read_nonblocking(rd, &mut buf).unwrap(), Some(0));
        close_fd(rd);
    }

    #[test]
    fn oneshot_masks_are_edge_triggered() {
        let read = Interest::Read.oneshot();
        assert_ne!(read & libc::EPOLLONESHOT as u32, 0);
        assert_ne!(read & libc::EPOLLET as u32, 0);
        assert_ne!(read & EPOLLIN as u32, 0);
        assert_eq!(read & EPOLLOUT as u32, 0);
        assert_ne!(Interest::Write.oneshot() & EPOLLOUT as u32, 0);
    }
}
