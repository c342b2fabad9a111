//! One-Shot Result Channels
//!
//! Every send or receive operation returns a [`Receipt`] immediately and
//! resolves it later, exactly once. A [`Resolver`] is the producing end.
//!
//! A receipt distinguishes three states:
//! - not yet resolved ([`Receipt::try_take`] returns `None`)
//! - resolved successfully
//! - resolved with an [`FdError`]
//!
//! Dropping a [`Resolver`] without resolving it delivers
//! [`FdError::ConnectionClosed`], so teardown never leaves a receipt hanging.

use std::fs::File;
use std::future::Future;
use std::os::fd::OwnedFd;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::oneshot;

use crate::error::FdError;

/// Receipt for a descriptor send
pub type SendReceipt = Receipt<()>;

/// Receipt for a received descriptor
pub type FdReceipt = Receipt<OwnedFd>;

/// Receipt for a received descriptor wrapped as a [`File`]
pub type FileReceipt = Receipt<File>;

/// Consuming end of a one-shot result
#[must_use = "a receipt reports whether the operation succeeded"]
pub struct Receipt<T> {
    inner: Option<BoxFuture<'static, Result<T, FdError>>>,
}

impl<T: Send + 'static> Receipt<T> {
    /// Create an unresolved receipt and the resolver that completes it
    pub fn channel() -> (Resolver<T>, Self) {
        let (tx, rx) = oneshot::channel();
        let receipt = Self::from_future(async move {
            rx.await.unwrap_or(Err(FdError::ConnectionClosed))
        });
        (Resolver { tx: Some(tx) }, receipt)
    }

    /// A receipt that is already resolved
    pub fn ready(result: Result<T, FdError>) -> Self {
        Self::from_future(futures::future::ready(result))
    }

    /// A receipt that is already resolved with an error
    pub fn failed(err: FdError) -> Self {
        Self::ready(Err(err))
    }

    pub(crate) fn from_future<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, FdError>> + Send + 'static,
    {
        Self {
            inner: Some(future.boxed()),
        }
    }

    /// Transform the successful value once it arrives
    pub fn map<U, F>(self, f: F) -> Receipt<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        Receipt::from_future(async move { self.await.map(f) })
    }

    /// Take the result if it is already available, without waiting
    ///
    /// Returns `None` while the operation is still outstanding. Once a result
    /// has been taken the receipt is spent and later polls report
    /// [`FdError::ConnectionClosed`].
    pub fn try_take(&mut self) -> Option<Result<T, FdError>> {
        let out = self.inner.as_mut()?.now_or_never()?;
        self.inner = None;
        Some(out)
    }

    /// Whether the result has already been taken
    #[must_use]
    pub fn is_spent(&self) -> bool {
        self.inner.is_none()
    }
}

impl Receipt<OwnedFd> {
    /// Wrap the received descriptor as a [`File`]
    pub fn into_file(self) -> FileReceipt {
        self.map(File::from)
    }
}

impl<T> Future for Receipt<T> {
    type Output = Result<T, FdError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(inner) = self.inner.as_mut() else {
            return Poll::Ready(Err(FdError::ConnectionClosed));
        };
        let out = ready!(inner.as_mut().poll(cx));
        self.inner = None;
        Poll::Ready(out)
    }
}

impl<T> std::fmt::Debug for Receipt<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receipt")
            .field("spent", &self.inner.is_none())
            .finish()
    }
}

/// Producing end of a one-shot result
#[derive(Debug)]
pub struct Resolver<T> {
    tx: Option<oneshot::Sender<Result<T, FdError>>>,
}

impl<T> Resolver<T> {
    /// Deliver the result
    ///
    /// If the receipt was dropped the value is dropped too, which closes any
    /// descriptor it carries.
    pub fn resolve(mut self, result: Result<T, FdError>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(result);
        }
    }

    /// Whether the receipt has been dropped
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        match &self.tx {
            Some(tx) => tx.is_closed(),
            None => true,
        }
    }
}

impl<T> Drop for Resolver<T> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(FdError::ConnectionClosed));
        }
    }
}
