//! Bounded background task pool
//!
//! Fixed worker threads fed by a bounded channel. `add_task` blocks while
//! the queue is full, `try_add_task` fails fast. `stop` lets the workers
//! drain what is queued, then joins them.

use crate::config::TaskPoolConfig;
use crate::{Result, StorageError};
use crossbeam::channel::{self, Sender, TrySendError};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

type Task = Box<dyn FnOnce() + Send + 'static>;

pub struct TaskPool {
    name: String,
    sender: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
}

impl TaskPool {
    pub fn new(name: impl Into<String>, config: &TaskPoolConfig) -> Result<Self> {
        let name = name.into();
        if config.threads == 0 || config.queue_size == 0 {
            return Err(StorageError::InvalidArgument(format!(
                "task pool '{}' needs at least one thread and one queue slot",
                name
            )));
        }

        let (sender, receiver) = channel::bounded::<Task>(config.queue_size);
        let pending = Arc::new(AtomicUsize::new(0));
        let mut workers = Vec::with_capacity(config.threads);
        for i in 0..config.threads {
            let receiver = receiver.clone();
            let pending = Arc::clone(&pending);
            let worker_name = format!("{}-{}", name, i);
            let handle = thread::Builder::new().name(worker_name).spawn(move || {
                for task in receiver.iter() {
                    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                        error!(worker = i, "background task panicked");
                    }
                    pending.fetch_sub(1, Ordering::AcqRel);
                }
            })?;
            workers.push(handle);
        }

        debug!(pool = %name, threads = config.threads, queue_size = config.queue_size, "task pool started");
        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            pending,
        })
    }

    fn sender(&self) -> Result<Sender<Task>> {
        self.sender
            .lock()
            .clone()
            .ok_or_else(|| StorageError::InvalidState(format!("task pool '{}' is stopped", self.name)))
    }

    /// Queue a task, waiting for a free slot
    pub fn add_task<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender()?;
        self.pending.fetch_add(1, Ordering::AcqRel);
        if sender.send(Box::new(task)).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(StorageError::InvalidState(format!("task pool '{}' is stopped", self.name)));
        }
        Ok(())
    }

    /// Queue a task, failing with `ResourceExhausted` when the queue is full
    pub fn try_add_task<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender()?;
        self.pending.fetch_add(1, Ordering::AcqRel);
        match sender.try_send(Box::new(task)) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                match e {
                    TrySendError::Full(_) => Err(StorageError::ResourceExhausted(format!(
                        "task pool '{}' queue is full",
                        self.name
                    ))),
                    TrySendError::Disconnected(_) => Err(StorageError::InvalidState(format!(
                        "task pool '{}' is stopped",
                        self.name
                    ))),
                }
            }
        }
    }

    /// Tasks queued or running
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Run every queued task, then join the workers
    pub fn stop(&self) {
        drop(self.sender.lock().take());
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                error!(pool = %self.name, "task pool worker exited abnormally");
            }
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    fn config(threads: usize, queue_size: usize) -> TaskPoolConfig {
        TaskPoolConfig { threads, queue_size }
    }

    #[test]
    fn test_runs_all_tasks_before_stop_returns() {
        let pool = TaskPool::new("test", &config(4, 8)).unwrap();
        let counter = Arc::new(AtomicU64::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.add_task(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        }
        pool.stop();
        assert_eq!(counter.load(Ordering::Relaxed), 100);
        assert_eq!(pool.pending(), 0);
        assert!(pool.add_task(|| {}).is_err());
    }

    #[test]
    fn test_try_add_fails_when_full() {
        let pool = TaskPool::new("test", &config(1, 1)).unwrap();
        let (started_tx, started_rx) = channel::bounded::<()>(1);
        let (release_tx, release_rx) = channel::bounded::<()>(1);
        let counter = Arc::new(AtomicU64::new(0));

        pool.add_task(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        })
        .unwrap();
        started_rx.recv().unwrap();

        let c = Arc::clone(&counter);
        pool.try_add_task(move || {
            c.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
        assert!(matches!(
            pool.try_add_task(|| {}),
            Err(StorageError::ResourceExhausted(_))
        ));
        assert_eq!(pool.pending(), 2);

        release_tx.send(()).unwrap();
        pool.stop();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let pool = TaskPool::new("test", &config(1, 4)).unwrap();
        let counter = Arc::new(AtomicU64::new(0));
        pool.add_task(|| panic!("boom")).unwrap();
        let c = Arc::clone(&counter);
        pool.add_task(move || {
            c.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
        pool.stop();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_rejects_empty_config() {
        assert!(TaskPool::new("test", &config(0, 4)).is_err());
        assert!(TaskPool::new("test", &config(1, 0)).is_err());
    }
}
