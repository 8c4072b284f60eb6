//! Fixed-size worker pool for store I/O
//!
//! The pool owns `size` tokio tasks pulling jobs off a shared flume queue,
//! so at most `size` chunk fetches, puts or deletes are in flight at once
//! no matter how many callers submit. Callers get a [`TaskHandle`] they can
//! `.await` from async code or [`TaskHandle::wait`] on from a plain thread.
//!
//! Jobs must not submit to the pool and then wait on the result: with every
//! worker blocked that way the queue never drains.
//!
//! The pool has an explicit lifecycle: [`WorkerPool::new`] spawns the
//! workers, [`WorkerPool::shutdown`] drains queued jobs and joins them.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const DEFAULT_WORKERS: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool is shut down")]
    ShutDown,
    #[error("task was cancelled before completing")]
    Cancelled,
}

enum Message {
    Run(BoxFuture<'static, ()>),
    Stop,
}

/// Cloneable submission handle.
#[derive(Clone)]
pub struct PoolHandle {
    tx: flume::Sender<Message>,
    closed: Arc<AtomicBool>,
    size: usize,
}

impl std::fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle")
            .field("size", &self.size)
            .field("queued", &self.tx.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl PoolHandle {
    /// Queue `fut` for execution on a worker.
    pub fn submit<F, T>(&self, fut: F) -> Result<TaskHandle<T>, PoolError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::ShutDown);
        }
        let (tx, rx) = oneshot::channel();
        let job = async move {
            let _ = tx.send(fut.await);
        };
        self.tx
            .send(Message::Run(job.boxed()))
            .map_err(|_| PoolError::ShutDown)?;
        Ok(TaskHandle { rx })
    }

    /// Submit and await in one step.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, PoolError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.submit(fut)?.await
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn queued(&self) -> usize {
        self.tx.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Completion signal for a submitted job.
///
/// Resolves to `PoolError::Cancelled` if the job panicked or the pool was
/// torn down before running it.
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Block the current thread until the job finishes. Must not be called
    /// from inside an async context.
    pub fn wait(self) -> Result<T, PoolError> {
        self.rx.blocking_recv().map_err(|_| PoolError::Cancelled)
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, PoolError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.map_err(|_| PoolError::Cancelled))
    }
}

/// Owner of the worker tasks.
pub struct WorkerPool {
    handle: PoolHandle,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers on the current tokio runtime.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (tx, rx) = flume::unbounded::<Message>();
        let workers = (0..size)
            .map(|id| {
                let rx = rx.clone();
                tokio::spawn(async move {
                    while let Ok(message) = rx.recv_async().await {
                        match message {
                            Message::Run(job) => {
                                if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                                    tracing::error!(worker = id, "pool job panicked");
                                }
                            }
                            Message::Stop => break,
                        }
                    }
                    tracing::trace!(worker = id, "worker stopped");
                })
            })
            .collect();

        tracing::debug!(size, "worker pool started");
        Self {
            handle: PoolHandle {
                tx,
                closed: Arc::new(AtomicBool::new(false)),
                size,
            },
            workers,
        }
    }

    pub fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }

    /// Stop accepting jobs, let queued jobs finish, and join the workers.
    pub async fn shutdown(self) {
        self.handle.closed.store(true, Ordering::Release);
        for _ in 0..self.workers.len() {
            let _ = self.handle.tx.send(Message::Stop);
        }
        for worker in self.workers {
            if let Err(e) = worker.await {
                tracing::error!("worker pool task failed: {}", e);
            }
        }
        tracing::debug!("worker pool shut down");
    }
}
