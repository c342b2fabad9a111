//! Descriptor-Carrying Connection
//!
//! [`FdConn`] wraps a [`UnixStream`] and multiplexes descriptors with the
//! byte stream the RPC layer writes and reads:
//!
//! ```text
//!   Transceiver::send_fd ──► send executor ──take──┐
//!                                                   ▼
//!   RPC poll_write(buf) ──► [buf[0] + fd0] [buf[1] + fd1] ... [buf[n..]]
//!
//!   RPC poll_read(buf)  ◄── recvmsg(bytes + SCM_RIGHTS) ──► recv executor
//!                                                            (cache, waiters)
//! ```
//!
//! Queued descriptors leave with the next application write; each one
//! borrows a single byte from the front of the caller's buffer.
//!
//! [`Transceiver`] is the cloneable handle given to everyone else. The
//! connection itself stays with whoever owns the byte stream, and dropping
//! it closes everything.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, Interest, ReadBuf};
use tokio::net::UnixStream;

use crate::config::TransceiverConfig;
use crate::error::FdError;
use crate::executor::{Completion, SerialExecutor};
use crate::identity::Identity;
use crate::receipt::{FdReceipt, Receipt, SendReceipt};
use crate::transceiver::{FdReceiver, FdSender};

use super::ancillary;
use super::state::{Arrival, PendingSend, RecvState, SendState};
use super::ConnectionId;

/// State shared between a connection and its transceiver handles
struct Shared {
    id: ConnectionId,
    send: SerialExecutor<SendState>,
    recv: SerialExecutor<RecvState>,
    /// Entries submitted to `send` and not yet taken or failed
    queued: Arc<AtomicUsize>,
    closed: AtomicBool,
    fds_per_write: usize,
}

impl Shared {
    /// Fail everything outstanding; later calls do nothing
    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let id = self.id.clone();
        let queued = Arc::clone(&self.queued);
        drop(self.send.exec(move |state| {
            let failed = state.close();
            queued.fetch_sub(failed, Ordering::AcqRel);
            if failed > 0 {
                tracing::debug!(conn_id = %id, failed, "Failed unsent descriptors");
            }
        }));

        let id = self.id.clone();
        drop(self.recv.exec(move |state| {
            let failed = state.close();
            if failed > 0 {
                tracing::debug!(conn_id = %id, failed, "Failed descriptor waiters");
            }
        }));

        tracing::info!(conn_id = %self.id, "Descriptor transfer closed");
    }
}

/// A Unix stream connection that carries descriptors alongside its bytes
pub struct FdConn {
    io: Option<UnixStream>,
    shared: Arc<Shared>,
    /// Taken from the send queue but not yet written
    outgoing: VecDeque<PendingSend>,
    /// In-flight take from the send queue
    take: Option<Completion<Vec<PendingSend>>>,
}

impl FdConn {
    /// Wrap a stream with default limits
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(stream: UnixStream) -> Self {
        Self::with_config(stream, &TransceiverConfig::default())
    }

    /// Wrap a stream with the given limits
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_config(stream: UnixStream, config: &TransceiverConfig) -> Self {
        let id = ConnectionId::new();
        let shared = Arc::new(Shared {
            send: SerialExecutor::new(SendState::default()),
            recv: SerialExecutor::new(RecvState::new(id.clone(), config.max_cached_fds)),
            queued: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
            fds_per_write: config.fds_per_write(),
            id,
        });

        tracing::debug!(
            conn_id = %shared.id,
            fds_per_write = shared.fds_per_write,
            max_cached_fds = config.max_cached_fds,
            "Descriptor transfer enabled"
        );

        Self {
            io: Some(stream),
            shared,
            outgoing: VecDeque::new(),
            take: None,
        }
    }

    /// Handle for sending and receiving descriptors on this connection
    pub fn transceiver(&self) -> Transceiver {
        Transceiver {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Connection identifier used in logs
    pub fn id(&self) -> &ConnectionId {
        &self.shared.id
    }

    /// The underlying stream, until closed
    pub fn get_ref(&self) -> Option<&UnixStream> {
        self.io.as_ref()
    }

    /// Close the stream and fail every outstanding operation
    ///
    /// Idempotent. Cached descriptors are closed, waiters and unsent
    /// descriptors receive [`FdError::ConnectionClosed`].
    pub fn close(&mut self) {
        self.io = None;
        self.take = None;
        for entry in self.outgoing.drain(..) {
            entry.complete(Err(FdError::ConnectionClosed));
        }
        self.shared.shutdown();
    }

    /// Whether [`close`](Self::close) has run
    pub fn is_closed(&self) -> bool {
        self.io.is_none()
    }

    /// Pull the next batch from the send queue into `outgoing`
    ///
    /// Pending only while a take is in flight.
    fn poll_refill(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if self.take.is_none()
            && self.outgoing.is_empty()
            && self.shared.queued.load(Ordering::Acquire) > 0
        {
            let limit = self.shared.fds_per_write;
            let queued = Arc::clone(&self.shared.queued);
            self.take = Some(self.shared.send.call(move |state| {
                let batch = state.take(limit);
                queued.fetch_sub(batch.len(), Ordering::AcqRel);
                batch
            }));
        }

        let Some(take) = self.take.as_mut() else {
            return Poll::Ready(());
        };
        let taken = match Pin::new(take).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(taken) => taken,
        };
        self.take = None;
        if let Ok(batch) = taken {
            self.outgoing.extend(batch);
        }
        Poll::Ready(())
    }

    /// Write queued descriptors, one byte of `buf` each
    ///
    /// Returns how many bytes of `buf` were consumed. An entry the socket
    /// is not ready for stays at the head of `outgoing`.
    fn poll_write_fds(&mut self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let Some(io) = self.io.as_ref() else {
            return Poll::Ready(Err(closed()));
        };

        let mut consumed = 0;
        while consumed < buf.len() && consumed < self.shared.fds_per_write {
            let Some(entry) = self.outgoing.front() else {
                break;
            };

            match io.poll_write_ready(cx) {
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(e)) if consumed == 0 => return Poll::Ready(Err(e)),
                Poll::Ready(Err(_)) | Poll::Pending if consumed > 0 => break,
                _ => return Poll::Pending,
            }

            let byte = buf[consumed];
            let sent = io.try_io(Interest::WRITABLE, || {
                ancillary::send_with_fd(io.as_raw_fd(), byte, entry.fd.as_fd())
            });

            match sent {
                Ok(_) => {
                    consumed += 1;
                    if let Some(entry) = self.outgoing.pop_front() {
                        entry.complete(Ok(()));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    tracing::warn!(conn_id = %self.shared.id, error = %e, "Descriptor send rejected");
                    if let Some(entry) = self.outgoing.pop_front() {
                        entry.complete(Err(FdError::SendFailed(e)));
                    }
                }
            }
        }

        if consumed > 0 {
            tracing::debug!(conn_id = %self.shared.id, count = consumed, "Descriptors sent");
        }
        Poll::Ready(Ok(consumed))
    }
}

impl std::fmt::Debug for FdConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdConn")
            .field("id", &self.shared.id)
            .field("closed", &self.is_closed())
            .field("outgoing", &self.outgoing.len())
            .finish()
    }
}

impl Drop for FdConn {
    fn drop(&mut self) {
        self.close();
    }
}

impl AsyncWrite for FdConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.io.is_none() {
            return Poll::Ready(Err(closed()));
        }

        if this.poll_refill(cx).is_pending() {
            return Poll::Pending;
        }

        let consumed = match this.poll_write_fds(cx, buf) {
            Poll::Ready(Ok(n)) => n,
            other => return other,
        };
        if consumed == buf.len() {
            return Poll::Ready(Ok(consumed));
        }

        let Some(io) = this.io.as_mut() else {
            return Poll::Ready(Err(closed()));
        };
        match Pin::new(io).poll_write(cx, &buf[consumed..]) {
            Poll::Ready(Ok(n)) => Poll::Ready(Ok(consumed + n)),
            Poll::Ready(Err(e)) if consumed == 0 => Poll::Ready(Err(e)),
            Poll::Pending if consumed == 0 => Poll::Pending,
            // The descriptor bytes are on the wire; report them and let the
            // caller retry the rest.
            _ => Poll::Ready(Ok(consumed)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().io.as_mut() {
            Some(io) => Pin::new(io).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().io.as_mut() {
            Some(io) => Pin::new(io).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl AsyncRead for FdConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let Some(io) = this.io.as_ref() else {
            return Poll::Ready(Err(closed()));
        };
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            match io.poll_read_ready(cx) {
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }

            let dst = buf.initialize_unfilled();
            let received = io.try_io(Interest::READABLE, || {
                ancillary::recv_with_fds(io.as_raw_fd(), dst)
            });

            match received {
                Ok(received) => {
                    buf.advance(received.bytes);
                    this.deliver(received.fds);
                    return Poll::Ready(Ok(()));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
    }
}

impl FdConn {
    fn deliver(&self, fds: Result<Vec<OwnedFd>, FdError>) {
        match fds {
            Ok(fds) if fds.is_empty() => {}
            Ok(fds) => {
                let id = self.shared.id.clone();
                drop(self.shared.recv.exec(move |state| {
                    for fd in fds {
                        match state.arrive(fd) {
                            Arrival::Cached { identity, waiters } => {
                                tracing::debug!(conn_id = %id, %identity, waiters, "Descriptor received");
                            }
                            Arrival::Duplicate(identity) => {
                                tracing::debug!(conn_id = %id, %identity, "Duplicate descriptor closed");
                            }
                            Arrival::Unidentified => {}
                            Arrival::Discarded => {
                                tracing::debug!(conn_id = %id, "Descriptor arrived after close");
                            }
                        }
                    }
                }));
            }
            Err(e) => {
                tracing::warn!(conn_id = %self.shared.id, error = %e, "Discarding received descriptors");
            }
        }
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "descriptor connection closed")
}

/// Cloneable send/receive handle for one [`FdConn`]
///
/// Sends are transmitted in submission order with the connection's next
/// writes. Receives resolve from the connection's cache of arrived
/// descriptors. Once the connection closes every outstanding and later
/// operation fails with [`FdError::ConnectionClosed`].
#[derive(Clone)]
pub struct Transceiver {
    shared: Arc<Shared>,
}

impl Transceiver {
    /// Identifier of the underlying connection
    pub fn conn_id(&self) -> &ConnectionId {
        &self.shared.id
    }

    /// Whether the underlying connection has closed
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Number of received descriptors currently cached
    ///
    /// Ordered after every arrival and request submitted before this call.
    pub fn cached_count(&self) -> Completion<usize> {
        self.shared.recv.call(|state| state.cached_count())
    }

    /// Whether two handles refer to the same connection
    pub fn same_connection(&self, other: &Transceiver) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl std::fmt::Debug for Transceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transceiver")
            .field("conn_id", &self.shared.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl FdSender for Transceiver {
    fn send_fd(&self, fd: BorrowedFd<'_>) -> SendReceipt {
        let fd = match fd.try_clone_to_owned() {
            Ok(fd) => fd,
            Err(e) => return SendReceipt::failed(FdError::DuplicateFailed(e)),
        };

        let (resolver, receipt) = Receipt::channel();
        let entry = PendingSend::new(fd, resolver);

        self.shared.queued.fetch_add(1, Ordering::AcqRel);
        let queued = Arc::clone(&self.shared.queued);
        drop(self.shared.send.exec(move |state| {
            if !state.enqueue(entry) {
                queued.fetch_sub(1, Ordering::AcqRel);
            }
        }));

        receipt
    }
}

impl FdReceiver for Transceiver {
    fn recv_fd(&self, identity: Identity) -> FdReceipt {
        let (resolver, receipt) = Receipt::channel();
        drop(self.shared.recv.exec(move |state| state.request(identity, resolver)));
        receipt
    }
}
