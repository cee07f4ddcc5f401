// src/pool.rs
//! Fixed-size worker pool fed from a bounded FIFO queue.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

use crate::error::{NocturneError, NocturneResult};

/// A unit of work the pool can run.
pub trait Task: Send + 'static {
    fn process(self);
}

struct Shared<T> {
    queue: Mutex<VecDeque<T>>,
    available: Condvar,
    running: AtomicBool,
    max_requests: usize,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ThreadPool<T: Task> {
    shared: Arc<Shared<T>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Task> ThreadPool<T> {
    /// Start `threads` workers sharing a queue of at most `max_requests` tasks.
    pub fn new(threads: usize, max_requests: usize) -> NocturneResult<Self> {
        if threads == 0 || max_requests == 0 {
            return Err(NocturneError::InvalidConfig(
                "thread pool needs at least one thread and one queue slot".into(),
            ));
        }

        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(max_requests.min(1024))),
            available: Condvar::new(),
            running: AtomicBool::new(true),
            max_requests,
        });

        let mut pool = Self {
            shared,
            workers: Vec::with_capacity(threads),
        };

        for i in 0..threads {
            let shared = Arc::clone(&pool.shared);
            // On failure `pool` is dropped here, which stops the workers already started.
            let handle = thread::Builder::new()
                .name(format!("nocturne-worker-{}", i))
                .spawn(move || worker_loop(&shared))?;
            pool.workers.push(handle);
        }

        debug!(threads, max_requests, "thread pool started");
        Ok(pool)
    }

    /// Enqueue a task and wake one idle worker. When the queue is full (or
    /// the pool is stopping) the task is handed back untouched.
    pub fn submit(&self, task: T) -> Result<(), T> {
        {
            let mut queue = self.shared.lock();
            if !self.shared.running.load(Ordering::Acquire) || queue.len() >= self.shared.max_requests {
                return Err(task);
            }
            queue.push_back(task);
        }
        self.shared.available.notify_one();
        Ok(())
    }

    /// Tasks waiting for a worker.
    pub fn len(&self) -> usize {
        self.shared.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.max_requests
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Stop every worker and wait for it to exit. Queued tasks are dropped
    /// without running.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }

        {
            let _queue = self.shared.lock();
            self.shared.running.store(false, Ordering::Release);
        }
        self.shared.available.notify_all();

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("worker thread panicked outside a task");
            }
        }

        let dropped = {
            let mut queue = self.shared.lock();
            let n = queue.len();
            queue.clear();
            n
        };
        debug!(dropped, "thread pool stopped");
    }
}

impl<T: Task> Drop for ThreadPool<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<T: Task>(shared: &Shared<T>) {
    loop {
        let task = {
            let mut queue = shared.lock();
            while shared.running.load(Ordering::Acquire) && queue.is_empty() {
                queue = shared.available.wait(queue).unwrap_or_else(PoisonError::into_inner);
            }

            if !shared.running.load(Ordering::Acquire) {
                return;
            }

            match queue.pop_front() {
                Some(task) => task,
                None => continue,
            }
        };

        if panic::catch_unwind(AssertUnwindSafe(|| task.process())).is_err() {
            error!("task panicked; worker keeps running");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    enum Job {
        Report(mpsc::Sender<usize>, usize),
        Block(mpsc::Sender<()>, mpsc::Receiver<()>),
        Panic,
    }

    impl Task for Job {
        fn process(self) {
            match self {
                Job::Report(tx, n) => {
                    let _ = tx.send(n);
                }
                Job::Block(started, release) => {
                    let _ = started.send(());
                    let _ = release.recv();
                }
                Job::Panic => panic!("boom"),
            }
        }
    }

    /// Occupy the only worker until the returned sender is used or dropped.
    fn block_worker(pool: &ThreadPool<Job>) -> mpsc::Sender<()> {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        assert!(pool.submit(Job::Block(started_tx, release_rx)).is_ok());
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        release_tx
    }

    #[test]
    fn zero_sizes_are_rejected() {
        assert!(ThreadPool::<Job>::new(0, 10).is_err());
        assert!(ThreadPool::<Job>::new(2, 0).is_err());
    }

    #[test]
    fn every_submitted_task_runs() {
        let pool = ThreadPool::new(4, 1000).unwrap();
        assert_eq!(pool.threads(), 4);
        let (tx, rx) = mpsc::channel();
        for i in 0..200 {
            assert!(pool.submit(Job::Report(tx.clone(), i)).is_ok());
        }

        let mut seen: Vec<usize> = (0..200)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn full_queue_hands_the_task_back() {
        let pool = ThreadPool::new(1, 2).unwrap();
        let release = block_worker(&pool);

        let (tx, rx) = mpsc::channel();
        assert!(pool.submit(Job::Report(tx.clone(), 1)).is_ok());
        assert!(pool.submit(Job::Report(tx.clone(), 2)).is_ok());
        assert_eq!(pool.len(), 2);

        match pool.submit(Job::Report(tx.clone(), 3)) {
            Err(Job::Report(_, n)) => assert_eq!(n, 3),
            _ => panic!("expected the task back"),
        }
        assert_eq!(pool.len(), 2);

        release.send(()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
    }

    #[test]
    fn panicking_task_does_not_kill_the_worker() {
        let pool = ThreadPool::new(1, 10).unwrap();
        let (tx, rx) = mpsc::channel();
        assert!(pool.submit(Job::Panic).is_ok());
        assert!(pool.submit(Job::Report(tx, 7)).is_ok());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    }

    #[test]
    fn shutdown_joins_and_refuses_new_work() {
        let mut pool = ThreadPool::new(3, 10).unwrap();
        pool.shutdown();
        assert_eq!(pool.threads(), 0);

        let (tx, _rx) = mpsc::channel();
        assert!(pool.submit(Job::Report(tx, 1)).is_err());
        assert!(pool.is_empty());

        // idempotent
        pool.shutdown();
    }
}
