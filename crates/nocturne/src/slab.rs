// src/slab.rs
//! Connection table indexed by file descriptor.
//!
//! Each slot carries an atomic ownership state. A thread may touch the
//! slot's `Conn` only while holding a [`ConnGuard`], which is obtained by a
//! compare-exchange from the state the previous owner left behind. Because
//! sockets are registered one-shot and the guard is released before the
//! socket is re-armed, at most one thread ever holds a guard for a slot.

use std::cell::UnsafeCell;
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::conn::Conn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Free = 0,
    /// Armed for read, nobody owns it.
    AwaitingRead = 1,
    /// Owned by the reactor (accepting or draining the socket).
    Reading = 2,
    /// Handed to the pool, waiting for a worker.
    Queued = 3,
    /// Owned by a worker.
    Processing = 4,
    /// Armed for write, nobody owns it.
    AwaitingWrite = 5,
    /// Owned by the reactor while flushing.
    Writing = 6,
    Closing = 7,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnState::AwaitingRead,
            2 => ConnState::Reading,
            3 => ConnState::Queued,
            4 => ConnState::Processing,
            5 => ConnState::AwaitingWrite,
            6 => ConnState::Writing,
            7 => ConnState::Closing,
            _ => ConnState::Free,
        }
    }
}

impl Default for ConnState {
    fn default() -> Self {
        ConnState::Free
    }
}

struct Slot {
    state: AtomicU8,
    conn: UnsafeCell<Option<Box<Conn>>>,
}

pub struct ConnectionSlab {
    slots: Box<[Slot]>,
    active_count: AtomicUsize,
}

// SAFETY: a slot's `conn` is only reached through a `ConnGuard`, and a guard
// only exists for the thread that won the compare-exchange on `state`.
unsafe impl Sync for ConnectionSlab {}

impl ConnectionSlab {
    /// Slots are allocated up front; each `Conn` is boxed lazily the first
    /// time its descriptor is accepted and kept for reuse afterwards.
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                state: AtomicU8::new(ConnState::Free as u8),
                conn: UnsafeCell::new(None),
            })
            .collect::<Vec<_>>();

        Self {
            slots: slots.into_boxed_slice(),
            active_count: AtomicUsize::new(0),
        }
    }

    fn slot(&self, fd: RawFd) -> Option<&Slot> {
        usize::try_from(fd).ok().and_then(|idx| self.slots.get(idx))
    }

    /// Occupy the slot for a freshly accepted descriptor. The returned guard
    /// is in the `Reading` state (owned by the reactor).
    ///
    /// Returns `None` if the descriptor is outside the table or its slot is
    /// still in use.
    pub fn open(&self, fd: RawFd, peer: Option<SocketAddr>) -> Option<ConnGuard<'_>> {
        let slot = self.slot(fd)?;
        slot.state
            .compare_exchange(
                ConnState::Free as u8,
                ConnState::Reading as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()?;

        // SAFETY: we just moved the slot out of `Free`; nobody else can own it.
        let cell = unsafe { &mut *slot.conn.get() };
        let conn = cell.get_or_insert_with(|| Box::new(Conn::new(fd, peer)));
        conn.init(fd, peer);

        self.active_count.fetch_add(1, Ordering::Relaxed);
        Some(ConnGuard {
            slab: self,
            slot,
            conn: &mut **conn,
            state: ConnState::Reading,
        })
    }

    /// Take ownership of `fd` if it is currently in state `from`, moving it
    /// to `to`.
    pub fn claim(&self, fd: RawFd, from: ConnState, to: ConnState) -> Option<ConnGuard<'_>> {
        debug_assert!(from != ConnState::Free && to != ConnState::Free);
        let slot = self.slot(fd)?;
        slot.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;

        // SAFETY: the compare-exchange made us the only owner.
        let cell = unsafe { &mut *slot.conn.get() };
        match cell.as_deref_mut() {
            Some(conn) => Some(ConnGuard {
                slab: self,
                slot,
                conn,
                state: to,
            }),
            None => {
                slot.state.store(from as u8, Ordering::Release);
                None
            }
        }
    }

    /// Take ownership of `fd` whatever state it is in.
    ///
    /// # Safety
    /// No other thread may hold, or later obtain, a guard for this slot:
    /// only call once the worker pool has been joined.
    pub unsafe fn reclaim(&self, fd: RawFd) -> Option<ConnGuard<'_>> {
        let slot = self.slot(fd)?;
        if slot.state.swap(ConnState::Closing as u8, Ordering::AcqRel) == ConnState::Free as u8 {
            slot.state.store(ConnState::Free as u8, Ordering::Release);
            return None;
        }
        // SAFETY: guaranteed by the caller.
        let cell = unsafe { &mut *slot.conn.get() };
        let conn = cell.as_deref_mut()?;
        Some(ConnGuard {
            slab: self,
            slot,
            conn,
            state: ConnState::Closing,
        })
    }

    pub fn state(&self, fd: RawFd) -> Option<ConnState> {
        self.slot(fd)
            .map(|slot| ConnState::from_u8(slot.state.load(Ordering::Acquire)))
    }

    /// Descriptors whose slot is not `Free`.
    pub fn occupied(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state.load(Ordering::Acquire) != ConnState::Free as u8)
            .map(|(idx, _)| idx as RawFd)
    }

    pub fn len(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

/// Exclusive access to one connection. Consume it with [`release`] or
/// [`free`]; dropping it leaves the slot in its owned state.
///
/// [`release`]: ConnGuard::release
/// [`free`]: ConnGuard::free
pub struct ConnGuard<'a> {
    slab: &'a ConnectionSlab,
    slot: &'a Slot,
    conn: &'a mut Conn,
    state: ConnState,
}

impl<'a> ConnGuard<'a> {
    pub fn fd(&self) -> RawFd {
        self.conn.fd
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Give the connection up, leaving it in `next`. Must happen before the
    /// socket is re-armed.
    pub fn release(self, next: ConnState) {
        debug_assert!(next != ConnState::Free, "use free() to vacate a slot");
        self.slot.state.store(next as u8, Ordering::Release);
    }

    /// Vacate the slot. Drops the file mapping and decrements the active
    /// count; the descriptor itself is closed by the caller afterwards.
    pub fn free(self) {
        self.conn.response.release_file();
        self.conn.peer = None;
        self.conn.fd = -1;
        self.slot.state.store(ConnState::Free as u8, Ordering::Release);
        self.slab.active_count.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Deref for ConnGuard<'_> {
    type Target = Conn;

    fn deref(&self) -> &Conn {
        &*self.conn
    }
}

impl DerefMut for ConnGuard<'_> {
    fn deref_mut(&mut self) -> &mut Conn {
        &mut *self.conn
    }
}
