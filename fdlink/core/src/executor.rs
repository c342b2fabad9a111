//! Serialized Executor
//!
//! A single worker task that owns a piece of mutable state and runs
//! submitted closures against it strictly one at a time, in submission
//! order. It replaces a lock around the state: nothing outside the worker
//! ever touches it, so transitions are ordered by the FIFO queue alone.
//!
//! ```text
//!  submitters ──exec()──►  ┌──────────────┐
//!  submitters ──call()──►  │  FIFO queue  │──► worker ──► &mut S
//!  submitters ──exec()──►  └──────────────┘
//! ```
//!
//! Submission never blocks. The returned [`Completion`] may be awaited when
//! the caller needs the mutation to be visible before it proceeds, or
//! dropped when it does not.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

type Job<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

/// The worker is gone; the submitted closure never ran
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("serialized executor has shut down")]
pub struct ExecutorClosed;

/// Single-consumer task queue bound to one state value
pub struct SerialExecutor<S> {
    tx: mpsc::UnboundedSender<Job<S>>,
}

impl<S> Clone for SerialExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<S> std::fmt::Debug for SerialExecutor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialExecutor")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl<S: Send + 'static> SerialExecutor<S> {
    /// Spawn the worker that owns `state`
    ///
    /// The worker runs until every handle to the executor is dropped, then
    /// drops the state.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(state: S) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job<S>>();

        tokio::spawn(async move {
            let mut state = state;
            while let Some(job) = rx.recv().await {
                job(&mut state);
            }
        });

        Self { tx }
    }

    /// Submit a mutation without caring about its outcome
    pub fn exec<F>(&self, f: F) -> Completion<()>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.call(f)
    }

    /// Submit a closure and receive its return value through the completion
    pub fn call<F, R>(&self, f: F) -> Completion<R>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let job: Job<S> = Box::new(move |state| {
            let _ = done_tx.send(f(state));
        });

        if self.tx.send(job).is_err() {
            tracing::debug!("Submission to stopped serialized executor dropped");
        }

        Completion { rx: done_rx }
    }

    /// Whether the worker has stopped accepting jobs
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Outcome of a submitted closure
#[must_use = "completions do nothing unless awaited; drop explicitly to fire and forget"]
#[derive(Debug)]
pub struct Completion<R> {
    rx: oneshot::Receiver<R>,
}

impl<R> Future for Completion<R> {
    type Output = Result<R, ExecutorClosed>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map_err(|_| ExecutorClosed)
    }
}
