//! Per-chat FIFO job queue.
//!
//! Jobs run strictly one at a time in submission order. The first submitter
//! that finds the queue idle spawns a drain task; later submitters only
//! enqueue. A job's output (including its own `Err`) goes back to the caller
//! that submitted it and never affects queued jobs.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{ChatError, ChatResult};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Default)]
struct ExecutorState {
    queue: VecDeque<Job>,
    running: bool,
}

#[derive(Clone, Default)]
pub struct SerialJobExecutor {
    state: Arc<Mutex<ExecutorState>>,
}

impl SerialJobExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `job` and resolves with its output once it has run.
    ///
    /// Returns `JobAborted` when the job panicked.
    pub async fn run<F, T>(&self, job: F) -> ChatResult<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let wrapped: Job = Box::pin(async move {
            let _ = tx.send(job.await);
        });

        let should_drain = {
            let mut state = self.state.lock();
            state.queue.push_back(wrapped);
            let idle = !state.running;
            state.running = true;
            idle
        };

        if should_drain {
            tokio::spawn(drain(Arc::clone(&self.state)));
        }

        rx.await
            .map_err(|_| ChatError::JobAborted("job panicked before completing".to_string()))
    }

    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }
}

async fn drain(state: Arc<Mutex<ExecutorState>>) {
    loop {
        let next = {
            let mut state = state.lock();
            match state.queue.pop_front() {
                Some(job) => job,
                None => {
                    state.running = false;
                    return;
                }
            }
        };

        if AssertUnwindSafe(next).catch_unwind().await.is_err() {
            tracing::warn!("serial job panicked; continuing with queued jobs");
        }
    }
}
