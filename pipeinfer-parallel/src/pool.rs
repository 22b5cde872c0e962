//! Fixed-size pool of named worker threads fed by a bounded queue

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use pipeinfer_core::{Error, Result};

/// Unit of work run by a pool thread
pub type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolInner {
    name: String,
    size: usize,
    sender: RwLock<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// A cheaply clonable handle to a set of worker threads.
///
/// Jobs queue on a bounded channel, so `submit` blocks once the queue is
/// full. A panicking job is contained and logged; the worker keeps going.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Start `size` threads named `pipeinfer-{name}-worker-{i}`
    pub fn new(name: impl Into<String>, size: usize, queue_capacity: usize) -> Result<Self> {
        let name = name.into();
        if size == 0 {
            return Err(Error::setup("worker pool needs at least one thread"));
        }
        let (sender, receiver) = channel::bounded::<Job>(queue_capacity.max(1));

        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("pipeinfer-{name}-worker-{i}"))
                .spawn(move || work(&receiver))
                .map_err(|e| Error::resource(format!("failed to spawn worker thread: {e}")))?;
            workers.push(handle);
        }
        tracing::debug!(pool = %name, size, "worker pool started");

        Ok(Self {
            inner: Arc::new(PoolInner {
                name,
                size,
                sender: RwLock::new(Some(sender)),
                workers: Mutex::new(workers),
            }),
        })
    }

    /// Pool name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of worker threads
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Queue a job, blocking while the queue is full
    pub fn submit(&self, job: Job) -> Result<()> {
        let sender = self
            .inner
            .sender
            .read()
            .map_err(|_| Error::resource("worker pool lock poisoned"))?
            .clone()
            .ok_or_else(|| {
                Error::resource(format!("worker pool {} is shut down", self.inner.name))
            })?;
        sender.send(job).map_err(|_| {
            Error::resource(format!("worker pool {} has no live workers", self.inner.name))
        })
    }

    /// Whether `shutdown` has been called
    pub fn is_shut_down(&self) -> bool {
        self.inner.sender.read().map_or(true, |s| s.is_none())
    }

    /// Stop accepting jobs, let queued jobs finish and join every thread
    pub fn shutdown(&self) {
        if let Ok(mut sender) = self.inner.sender.write() {
            sender.take();
        }
        let workers = match self.inner.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => return,
        };
        for handle in workers {
            if handle.join().is_err() {
                tracing::error!(pool = %self.inner.name, "worker thread panicked");
            }
        }
        tracing::debug!(pool = %self.inner.name, "worker pool stopped");
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        // Closing the queue lets idle workers exit; nobody waits for them here.
        if let Ok(mut sender) = self.sender.write() {
            sender.take();
        }
    }
}

fn work(receiver: &Receiver<Job>) {
    while let Ok(job) = receiver.recv() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            tracing::error!(
                error = %pipeinfer_core::transform::panic_message(payload.as_ref()),
                "job panicked on worker thread"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_pool_runs_every_job() {
        let pool = WorkerPool::new("test", 3, 4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_pool_survives_panicking_job() {
        let pool = WorkerPool::new("panics", 1, 2).unwrap();
        let (tx, rx) = channel::bounded(1);
        pool.submit(Box::new(|| panic!("boom"))).unwrap();
        pool.submit(Box::new(move || tx.send(7).unwrap())).unwrap();
        assert_eq!(rx.recv().unwrap(), 7);
        pool.shutdown();
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let pool = WorkerPool::new("closed", 1, 1).unwrap();
        pool.shutdown();
        assert!(pool.is_shut_down());
        let err = pool.submit(Box::new(|| {})).unwrap_err();
        assert!(matches!(err, Error::ExecutorResource(_)));
    }

    #[test]
    fn test_zero_threads_rejected() {
        assert!(matches!(WorkerPool::new("none", 0, 1), Err(Error::OperatorSetup(_))));
    }
}
