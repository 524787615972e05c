//! Single-shot completion of an asynchronous operation.
//!
//! A [`Completion`] is handed back as soon as an operation is submitted. The
//! outcome arrives exactly once through a oneshot channel: either the value
//! or error produced by the operation, or `ConnectionClosed` if the task
//! running it went away without answering.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::error::{Result, WireError};

/// Future resolving to the outcome of a submitted operation.
#[must_use = "the outcome of the operation is only observable through the completion"]
#[derive(Debug)]
pub struct Completion<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T: Send + 'static> Completion<T> {
    /// Completion that already holds its outcome.
    pub fn ready(result: Result<T>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }

    /// Run `operation` as a task on `runtime`.
    ///
    /// Control returns immediately; the operation never runs on the caller's
    /// stack.
    pub fn spawn<F>(runtime: &Handle, operation: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        runtime.spawn(async move {
            let _ = tx.send(operation.await);
        });
        Self { rx }
    }

    /// Block the current thread until the outcome is available.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn wait(self) -> Result<T> {
        self.rx
            .blocking_recv()
            .unwrap_or_else(|_| Err(WireError::ConnectionClosed))
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or_else(|_| Err(WireError::ConnectionClosed)))
    }
}
