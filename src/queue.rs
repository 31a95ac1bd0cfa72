//! Serial mutation queue
//!
//! One spawned worker owns the state and runs submitted tasks one at a time,
//! in submission order. Each task gets `&mut` access to the state and answers
//! its submitter through a oneshot channel, so a failing or panicking task
//! only affects its own caller; the worker moves on to the next job.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::StoreError;

type Job<S> = Box<dyn for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, ()> + Send>;

fn job<S, F>(f: F) -> Job<S>
where
    F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, ()> + Send + 'static,
{
    Box::new(f)
}

/// Handle for submitting tasks to the worker
pub struct SerialQueue<S> {
    job_tx: mpsc::UnboundedSender<Job<S>>,
}

impl<S> Clone for SerialQueue<S> {
    fn clone(&self) -> Self {
        Self {
            job_tx: self.job_tx.clone(),
        }
    }
}

impl<S: Send + 'static> SerialQueue<S> {
    /// Spawn the worker on the current runtime
    ///
    /// The worker stops once every handle is dropped and hands the state back
    /// through the join handle.
    pub fn spawn(state: S) -> (Self, JoinHandle<S>) {
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(worker_loop(state, job_rx));
        (Self { job_tx }, worker)
    }

    /// Run `task` after every previously submitted task has finished
    pub async fn submit<T, F>(&self, task: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, Result<T, StoreError>> + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();

        let job = job(move |state: &mut S| {
            async move {
                let outcome = AssertUnwindSafe(task(state)).catch_unwind().await;
                let result = outcome.unwrap_or_else(|panic| {
                    let reason = panic_message(panic.as_ref());
                    error!(reason = %reason, "Queued task panicked");
                    Err(StoreError::TaskPanicked(reason))
                });
                // Submitter may have stopped waiting
                let _ = result_tx.send(result);
            }
            .boxed()
        });

        self.job_tx.send(job).map_err(|_| StoreError::QueueClosed)?;

        result_rx.await.map_err(|_| StoreError::QueueClosed)?
    }
}

async fn worker_loop<S>(mut state: S, mut job_rx: mpsc::UnboundedReceiver<Job<S>>) -> S {
    debug!("Mutation queue worker started");
    while let Some(job) = job_rx.recv().await {
        job(&mut state).await;
    }
    debug!("Mutation queue worker stopped");
    state
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
