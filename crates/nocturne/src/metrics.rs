// src/metrics.rs
use std::sync::atomic::{AtomicUsize, Ordering};

#[repr(C, align(64))]
pub struct ServerMetrics {
    pub req_count: AtomicUsize,
    pub active_conns: AtomicUsize,
    pub bytes_sent: AtomicUsize,
    pub deferred: AtomicUsize,
    pub rejected: AtomicUsize,
    pub ownership_conflicts: AtomicUsize,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests: usize,
    pub active_conns: usize,
    pub bytes_sent: usize,
    pub deferred: usize,
    pub rejected: usize,
    pub ownership_conflicts: usize,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            req_count: AtomicUsize::new(0),
            active_conns: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
            deferred: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
            ownership_conflicts: AtomicUsize::new(0),
        }
    }

    pub fn inc_req(&self) {
        self.req_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_conn(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_deferred(&self) {
        self.deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_conflict(&self) {
        self.ownership_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.req_count.load(Ordering::Relaxed),
            active_conns: self.active_conns.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            ownership_conflicts: self.ownership_conflicts.load(Ordering::Relaxed),
        }
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let metrics = ServerMetrics::new();
        metrics.inc_conn();
        metrics.inc_conn();
        metrics.dec_conn();
        metrics.inc_req();
        metrics.add_bytes(128);
        metrics.inc_conflict();

        let snap = metrics.snapshot();
        assert_eq!(snap.active_conns, 1);
        assert_eq!(snap.requests, 1);
        assert_eq!(snap.bytes_sent, 128);
        assert_eq!(snap.ownership_conflicts, 1);
        assert_eq!(snap.deferred, 0);
    }
}
