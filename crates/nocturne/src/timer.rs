// src/timer.rs
//! Idle-connection timers.
//!
//! `TimerList` keeps one absolute deadline per key, ordered by expiry, so a
//! tick only looks at the timers that are actually due. `Ticker` is the
//! periodic wake-up that drives it.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::NocturneResult;

/// Deadlines sorted ascending. Ties expire in registration order.
pub struct TimerList<K> {
    by_expiry: BTreeMap<(Instant, u64), K>,
    index: HashMap<K, (Instant, u64)>,
    seq: u64,
}

impl<K: Copy + Eq + Hash> TimerList<K> {
    pub fn new() -> Self {
        Self {
            by_expiry: BTreeMap::new(),
            index: HashMap::new(),
            seq: 0,
        }
    }

    /// Set `key` to expire at `expire`, replacing any earlier timer for it.
    pub fn register(&mut self, key: K, expire: Instant) {
        if let Some(old) = self.index.remove(&key) {
            self.by_expiry.remove(&old);
        }
        let slot = (expire, self.seq);
        self.seq = self.seq.wrapping_add(1);
        self.by_expiry.insert(slot, key);
        self.index.insert(key, slot);
    }

    /// Move an existing timer to `expire`. Returns false if `key` has none.
    pub fn refresh(&mut self, key: K, expire: Instant) -> bool {
        if !self.index.contains_key(&key) {
            return false;
        }
        self.register(key, expire);
        true
    }

    pub fn remove(&mut self, key: K) -> bool {
        match self.index.remove(&key) {
            Some(slot) => {
                self.by_expiry.remove(&slot);
                true
            }
            None => false,
        }
    }

    /// Pop every timer due at `now`, oldest first, handing each key to
    /// `on_expire`. Stops at the first timer still in the future.
    pub fn tick<F: FnMut(K)>(&mut self, now: Instant, mut on_expire: F) -> usize {
        let mut fired = 0;
        while let Some(entry) = self.by_expiry.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let key = entry.remove();
            self.index.remove(&key);
            on_expire(key);
            fired += 1;
        }
        if fired > 0 {
            trace!(fired, remaining = self.by_expiry.len(), "timer tick");
        }
        fired
    }

    pub fn next_expiry(&self) -> Option<Instant> {
        self.by_expiry.keys().next().map(|(at, _)| *at)
    }

    pub fn contains(&self, key: K) -> bool {
        self.index.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.by_expiry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_expiry.is_empty()
    }
}

impl<K: Copy + Eq + Hash> Default for TimerList<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Background thread calling `on_tick` every `interval` until stopped or
/// until the callback returns false.
pub struct Ticker {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    pub fn spawn<F>(interval: Duration, mut on_tick: F) -> NocturneResult<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_stop = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("nocturne-ticker".into())
            .spawn(move || {
                let (lock, cvar) = &*thread_stop;
                let mut stopped = lock.lock().unwrap_or_else(PoisonError::into_inner);
                loop {
                    let deadline = Instant::now() + interval;
                    // wait out the full interval unless told to stop
                    while !*stopped {
                        let left = deadline.saturating_duration_since(Instant::now());
                        if left.is_zero() {
                            break;
                        }
                        stopped = cvar
                            .wait_timeout(stopped, left)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0;
                    }
                    if *stopped {
                        return;
                    }
                    drop(stopped);
                    if !on_tick() {
                        return;
                    }
                    stopped = lock.lock().unwrap_or_else(PoisonError::into_inner);
                }
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        {
            let (lock, cvar) = &*self.stop;
            *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
            cvar.notify_all();
        }
        let _ = handle.join();
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}
