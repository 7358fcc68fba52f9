//! Worker threads behind the async entry points.
//!
//! Async variants enqueue a job on a fixed pool of OS threads and resolve
//! through a oneshot channel; sync variants never touch the pool. Every
//! job shares the database's close token: once the handle closes, queued
//! jobs resolve with `CLOSED_DURING_OPERATION` instead of running, and a
//! dropped queue resolves pending futures the same way.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Error, Result};

/// Cooperative cancellation shared by every pending operation of one
/// database handle; polled at each suspension point.
#[derive(Debug, Default)]
pub(crate) struct CloseToken {
    closed: AtomicBool,
}

impl CloseToken {
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn flag(&self) -> &AtomicBool {
        &self.closed
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed-size pool executing async operations' blocking bodies.
pub(crate) struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.handles.lock().len())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        let (sender, receiver) = channel::unbounded::<Job>();
        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers.max(1) {
            let receiver = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("woofdb-worker-{i}"))
                .spawn(move || {
                    for job in receiver.iter() {
                        job();
                    }
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
        Self {
            sender: Mutex::new(Some(sender)),
            handles: Mutex::new(handles),
        }
    }

    fn submit(&self, job: Job) -> Result<()> {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) => sender.send(job).map_err(|_| Error::not_open()),
            None => Err(Error::not_open()),
        }
    }

    /// Runs `body` on a worker and resolves with its result. `token`
    /// short-circuits jobs that were still queued when the handle closed.
    pub async fn run<T, F>(&self, token: &Arc<CloseToken>, body: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let token = Arc::clone(token);
        self.submit(Box::new(move || {
            let result = if token.is_closed() {
                Err(Error::closed_during_operation())
            } else {
                body()
            };
            let _ = tx.send(result);
        }))?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::closed_during_operation()),
        }
    }

    /// Stops accepting jobs, lets queued jobs finish, and joins the
    /// threads. Idempotent.
    pub fn shutdown(&self) {
        let sender = self.sender.lock().take();
        drop(sender);
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        let joined = handles.len();
        for handle in handles {
            let _ = handle.join();
        }
        if joined > 0 {
            debug!(joined, "worker pool stopped");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
