//! Per-call credential adapter
//!
//! Code that issues a call has no connection to send descriptors on until
//! the RPC layer asks for request metadata. [`FdPerCallCredentials`]
//! bridges that gap: send and receive operations made early are deferred,
//! and replayed in order against the connection's transceiver the first
//! time metadata is requested. Receipts handed out before resolution stay
//! the same; they simply resolve later.

use std::os::fd::{AsFd, BorrowedFd};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::conn::Transceiver;
use crate::error::FdError;
use crate::executor::{Completion, SerialExecutor};
use crate::identity::Identity;
use crate::receipt::{FdReceipt, Receipt, SendReceipt};
use crate::rpc::{transceiver_from_context, CallContext, CallOption, Metadata, TransportError};
use crate::transceiver::{FdReceiver, FdSender, FdTransceiver};

use super::PerCallCredentials;

type Deferred = Box<dyn FnOnce(&dyn FdTransceiver) + Send>;

#[derive(Default)]
struct DeferredState {
    resolved: Option<Arc<dyn FdTransceiver>>,
    deferred: Vec<Deferred>,
}

impl DeferredState {
    /// Run `op` now if resolved, otherwise keep it for later
    fn run_or_defer(&mut self, op: Deferred) {
        match &self.resolved {
            Some(transceiver) => op(transceiver.as_ref()),
            None => self.deferred.push(op),
        }
    }

    /// Adopt `found` unless already resolved; replays deferred operations
    fn resolve(&mut self, found: Option<Transceiver>) -> bool {
        if self.resolved.is_some() {
            return true;
        }
        let Some(found) = found else {
            return false;
        };

        let conn_id = found.conn_id().clone();
        let transceiver: Arc<dyn FdTransceiver> = Arc::new(found);
        let replayed = self.deferred.len();
        for op in self.deferred.drain(..) {
            op(transceiver.as_ref());
        }
        self.resolved = Some(transceiver);

        tracing::debug!(%conn_id, replayed, "Per-call transceiver resolved");
        true
    }
}

/// Per-call credentials that carry descriptor operations to the call's connection
///
/// Wraps optional inner credentials, whose metadata is passed through.
/// Clones share the same deferred state.
#[derive(Clone)]
pub struct FdPerCallCredentials {
    inner: Option<Arc<dyn PerCallCredentials>>,
    state: SerialExecutor<DeferredState>,
}

impl FdPerCallCredentials {
    /// Credentials with no inner metadata
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        Self::wrapping(None)
    }

    /// Credentials passing through `inner`'s metadata
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn wrapping(inner: Option<Arc<dyn PerCallCredentials>>) -> Self {
        Self {
            inner,
            state: SerialExecutor::new(DeferredState::default()),
        }
    }

    /// Whether a transceiver has been resolved
    pub fn is_resolved(&self) -> Completion<bool> {
        self.state.call(|state| state.resolved.is_some())
    }

    /// Number of operations waiting for a transceiver
    pub fn deferred_count(&self) -> Completion<usize> {
        self.state.call(|state| state.deferred.len())
    }

    /// Run `op` against the transceiver once known; relay its receipt
    fn defer<T, F>(&self, op: F) -> Receipt<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn FdTransceiver) -> Receipt<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel::<Receipt<T>>();
        drop(self.state.exec(move |state| {
            state.run_or_defer(Box::new(move |transceiver| {
                let _ = tx.send(op(transceiver));
            }));
        }));

        Receipt::from_future(async move {
            match rx.await {
                Ok(inner) => inner.await,
                Err(_) => Err(FdError::ConnectionClosed),
            }
        })
    }
}

impl Default for FdPerCallCredentials {
    /// Same as [`FdPerCallCredentials::new`]
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FdPerCallCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdPerCallCredentials")
            .field("has_inner", &self.inner.is_some())
            .finish_non_exhaustive()
    }
}

impl FdSender for FdPerCallCredentials {
    fn send_fd(&self, fd: BorrowedFd<'_>) -> SendReceipt {
        let fd = match fd.try_clone_to_owned() {
            Ok(fd) => fd,
            Err(e) => return SendReceipt::failed(FdError::DuplicateFailed(e)),
        };
        self.defer(move |transceiver| transceiver.send_fd(fd.as_fd()))
    }
}

impl FdReceiver for FdPerCallCredentials {
    fn recv_fd(&self, identity: Identity) -> FdReceipt {
        self.defer(move |transceiver| transceiver.recv_fd(identity))
    }
}

#[async_trait]
impl PerCallCredentials for FdPerCallCredentials {
    async fn request_metadata(
        &self,
        ctx: &CallContext,
        uri: &str,
    ) -> Result<Metadata, TransportError> {
        let found = transceiver_from_context(ctx);
        let resolved = self
            .state
            .call(move |state| state.resolve(found))
            .await
            .map_err(|e| TransportError::InvalidState(e.to_string()))?;
        if !resolved {
            tracing::debug!(method = %ctx.method, "No transceiver on call context");
        }

        match &self.inner {
            Some(inner) => inner.request_metadata(ctx, uri).await,
            None => Ok(Metadata::new()),
        }
    }

    fn require_transport_security(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|inner| inner.require_transport_security())
    }

    fn transceiver(&self) -> Option<Arc<dyn FdTransceiver>> {
        Some(Arc::new(self.clone()))
    }
}

/// Several per-call credentials applied as one
///
/// Metadata maps are merged in order, later keys overwriting earlier ones.
#[derive(Clone, Default)]
pub struct CombinedPerCallCredentials {
    parts: Vec<Arc<dyn PerCallCredentials>>,
}

impl CombinedPerCallCredentials {
    /// Combine `parts` in order
    pub fn new(parts: Vec<Arc<dyn PerCallCredentials>>) -> Self {
        Self { parts }
    }

    /// Number of combined credentials
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Whether nothing is combined
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

#[async_trait]
impl PerCallCredentials for CombinedPerCallCredentials {
    async fn request_metadata(
        &self,
        ctx: &CallContext,
        uri: &str,
    ) -> Result<Metadata, TransportError> {
        let mut merged = Metadata::new();
        for part in &self.parts {
            merged.extend(part.request_metadata(ctx, uri).await?);
        }
        Ok(merged)
    }

    fn require_transport_security(&self) -> bool {
        self.parts.iter().any(|p| p.require_transport_security())
    }

    fn transceiver(&self) -> Option<Arc<dyn FdTransceiver>> {
        self.parts.iter().find_map(|p| p.transceiver())
    }
}

/// Fold every per-call credential in `options` into one
///
/// Other options keep their order; the combined credential goes last. A
/// single credential is kept as is.
pub fn merge_call_options(options: Vec<CallOption>) -> Vec<CallOption> {
    let mut rest = Vec::with_capacity(options.len());
    let mut creds = Vec::new();
    for option in options {
        match option {
            CallOption::PerCallCredentials(c) => creds.push(c),
            other => rest.push(other),
        }
    }

    match creds.len() {
        0 => {}
        1 => rest.extend(creds.into_iter().map(CallOption::PerCallCredentials)),
        _ => rest.push(CallOption::PerCallCredentials(Arc::new(
            CombinedPerCallCredentials::new(creds),
        ))),
    }
    rest
}

/// The last per-call credential in `options`
pub fn per_call_credentials_from_options(
    options: &[CallOption],
) -> Option<Arc<dyn PerCallCredentials>> {
    options.iter().rev().find_map(|option| match option {
        CallOption::PerCallCredentials(c) => Some(Arc::clone(c)),
        CallOption::Timeout(_) => None,
    })
}

/// Transceiver exposed by per-call credentials
pub fn transceiver_from_per_call(creds: &dyn PerCallCredentials) -> Option<Arc<dyn FdTransceiver>> {
    creds.transceiver()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransceiverConfig;
    use crate::conn::wrap_conn;
    use crate::rpc::Peer;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixStream;

    /// Fixed metadata
    struct Static(&'static str, &'static str, bool);

    #[async_trait]
    impl PerCallCredentials for Static {
        async fn request_metadata(&self, _: &CallContext, _: &str) -> Result<Metadata, TransportError> {
            Ok(Metadata::from([(self.0.to_string(), self.1.to_string())]))
        }
        fn require_transport_security(&self) -> bool {
            self.2
        }
    }

    fn context(transceiver: Option<Transceiver>) -> CallContext {
        CallContext::new(
            Peer {
                addr: "test".into(),
                auth_info: None,
                transceiver,
            },
            "open",
        )
    }

    #[tokio::test]
    async fn test_deferred_send_replays_on_resolution() {
        let (a, b) = UnixStream::pair().unwrap();
        let config = TransceiverConfig::default();
        let (mut conn_a, tx) = wrap_conn(Box::new(a), &config);
        let (mut conn_b, rx) = wrap_conn(Box::new(b), &config);

        let creds = FdPerCallCredentials::new();
        let file = tempfile::tempfile().unwrap();
        let id = Identity::of_fd(file.as_fd()).unwrap();

        let mut sent = creds.send_file(&file);
        drop(file);
        assert!(sent.try_take().is_none());
        assert_eq!(creds.deferred_count().await.unwrap(), 1);

        creds.request_metadata(&context(tx), "/open").await.unwrap();
        assert!(creds.is_resolved().await.unwrap());
        assert_eq!(creds.deferred_count().await.unwrap(), 0);

        conn_a.write_all(b"x").await.unwrap();
        sent.await.unwrap();

        let mut buf = [0u8; 1];
        conn_b.read_exact(&mut buf).await.unwrap();
        let fd = rx.unwrap().recv_fd(id).await.unwrap();
        assert_eq!(Identity::of_fd(fd.as_fd()).unwrap(), id);
    }

    #[tokio::test]
    async fn test_resolution_happens_once() {
        let (a, _b) = UnixStream::pair().unwrap();
        let config = TransceiverConfig::default();
        let (_conn, first) = wrap_conn(Box::new(a), &config);
        let (c, _d) = UnixStream::pair().unwrap();
        let (_other, second) = wrap_conn(Box::new(c), &config);

        let creds = FdPerCallCredentials::new();
        creds.request_metadata(&context(first), "/").await.unwrap();
        creds.request_metadata(&context(second), "/").await.unwrap();
        assert!(creds.is_resolved().await.unwrap());
    }

    #[tokio::test]
    async fn test_unresolved_stays_pending_then_fails_on_drop() {
        let creds = FdPerCallCredentials::new();
        let mut waiting = creds.recv_fd(Identity::new(1, 1));

        creds.request_metadata(&context(None), "/").await.unwrap();
        assert!(!creds.is_resolved().await.unwrap());
        assert!(waiting.try_take().is_none());

        drop(creds);
        let result = tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap();
        assert!(result.unwrap_err().is_connection_closed());
    }

    #[tokio::test]
    async fn test_inner_metadata_passes_through() {
        let creds = FdPerCallCredentials::wrapping(Some(Arc::new(Static("k", "v", true))));
        let md = creds.request_metadata(&context(None), "/").await.unwrap();
        assert_eq!(md, Metadata::from([("k".to_string(), "v".to_string())]));
        assert!(creds.require_transport_security());
        assert!(transceiver_from_per_call(&creds).is_some());
        assert!(transceiver_from_per_call(&Static("a", "b", false)).is_none());
    }

    #[tokio::test]
    async fn test_combined_merges_in_order() {
        let combined = CombinedPerCallCredentials::new(vec![
            Arc::new(Static("a", "1", false)),
            Arc::new(Static("a", "2", false)),
            Arc::new(FdPerCallCredentials::new()),
        ]);
        let md = combined.request_metadata(&context(None), "/").await.unwrap();
        assert_eq!(md.get("a").map(String::as_str), Some("2"));
        assert!(!combined.require_transport_security());
        assert!(combined.transceiver().is_some());
    }

    #[tokio::test]
    async fn test_merge_and_last_wins() {
        let first: Arc<dyn PerCallCredentials> = Arc::new(Static("a", "1", false));
        let second: Arc<dyn PerCallCredentials> = Arc::new(Static("b", "2", true));
        let options = vec![
            CallOption::PerCallCredentials(Arc::clone(&first)),
            CallOption::Timeout(Duration::from_secs(1)),
            CallOption::PerCallCredentials(Arc::clone(&second)),
        ];

        let last = per_call_credentials_from_options(&options).unwrap();
        assert!(Arc::ptr_eq(&last, &second));

        let merged = merge_call_options(options);
        assert_eq!(merged.len(), 2);
        assert!(matches!(merged[0], CallOption::Timeout(_)));
        let combined = per_call_credentials_from_options(&merged).unwrap();
        assert!(combined.require_transport_security());
        let md = combined.request_metadata(&context(None), "/").await.unwrap();
        assert_eq!(md.len(), 2);

        let single = merge_call_options(vec![CallOption::PerCallCredentials(Arc::clone(&first))]);
        let kept = per_call_credentials_from_options(&single).unwrap();
        assert!(Arc::ptr_eq(&kept, &first));
    }

    #[test]
    fn test_default_needs_a_runtime() {
        assert!(tokio::runtime::Handle::try_current().is_err());
        assert!(std::panic::catch_unwind(FdPerCallCredentials::default).is_err());

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = rt.enter();
        let creds = FdPerCallCredentials::default();
        assert!(!rt.block_on(creds.is_resolved()).unwrap());
    }
}
