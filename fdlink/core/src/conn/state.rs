//! Per-connection send and receive state
//!
//! Both structs are owned by a [`SerialExecutor`](crate::executor::SerialExecutor)
//! worker; every method here runs on that worker, never concurrently.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::{AsFd, OwnedFd};

use crate::error::FdError;
use crate::identity::Identity;
use crate::receipt::Resolver;

use super::ConnectionId;

/// A descriptor waiting to be written, and who to tell when it is
#[derive(Debug)]
pub(crate) struct PendingSend {
    pub(crate) fd: OwnedFd,
    resolver: Resolver<()>,
}

impl PendingSend {
    pub(crate) fn new(fd: OwnedFd, resolver: Resolver<()>) -> Self {
        Self { fd, resolver }
    }

    /// Report the outcome and close our duplicate
    pub(crate) fn complete(self, result: Result<(), FdError>) {
        self.resolver.resolve(result);
    }
}

/// Outgoing queue
#[derive(Debug, Default)]
pub(crate) struct SendState {
    queue: VecDeque<PendingSend>,
    closed: bool,
}

impl SendState {
    /// Queue an entry; returns `false` if it was failed because the queue is closed
    pub(crate) fn enqueue(&mut self, entry: PendingSend) -> bool {
        if self.closed {
            entry.complete(Err(FdError::ConnectionClosed));
            return false;
        }
        self.queue.push_back(entry);
        true
    }

    /// Remove up to `limit` entries from the front, oldest first
    pub(crate) fn take(&mut self, limit: usize) -> Vec<PendingSend> {
        let n = limit.min(self.queue.len());
        self.queue.drain(..n).collect()
    }

    /// Fail every queued entry; later enqueues fail immediately
    pub(crate) fn close(&mut self) -> usize {
        self.closed = true;
        let failed = self.queue.len();
        for entry in self.queue.drain(..) {
            entry.complete(Err(FdError::ConnectionClosed));
        }
        failed
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }
}

/// What happened to one arriving descriptor
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Arrival {
    /// Cached, and handed to this many waiters
    Cached { identity: Identity, waiters: usize },
    /// Already cached; the new copy was closed
    Duplicate(Identity),
    /// Could not be identified; closed
    Unidentified,
    /// Arrived after close; closed
    Discarded,
}

/// Received descriptor cache and outstanding requests
#[derive(Debug)]
pub(crate) struct RecvState {
    conn_id: ConnectionId,
    cached: HashMap<Identity, OwnedFd>,
    /// Cache insertion order, for eviction
    order: VecDeque<Identity>,
    waiters: HashMap<Identity, Vec<Resolver<OwnedFd>>>,
    max_cached: usize,
    closed: bool,
}

impl RecvState {
    pub(crate) fn new(conn_id: ConnectionId, max_cached: usize) -> Self {
        Self {
            conn_id,
            cached: HashMap::new(),
            order: VecDeque::new(),
            waiters: HashMap::new(),
            max_cached: max_cached.max(1),
            closed: false,
        }
    }

    /// Answer from cache, or wait for the next matching arrival
    pub(crate) fn request(&mut self, identity: Identity, resolver: Resolver<OwnedFd>) {
        if self.closed {
            resolver.resolve(Err(FdError::ConnectionClosed));
            return;
        }
        if let Some(fd) = self.cached.get(&identity) {
            resolver.resolve(duplicate(fd));
            return;
        }
        tracing::debug!(conn_id = %self.conn_id, %identity, "Waiting for descriptor");
        self.waiters.entry(identity).or_default().push(resolver);
    }

    /// Take ownership of a descriptor read off the socket
    pub(crate) fn arrive(&mut self, fd: OwnedFd) -> Arrival {
        let identity = Identity::of_fd(fd.as_fd());
        self.arrive_as(fd, identity)
    }

    fn arrive_as(&mut self, fd: OwnedFd, identity: Result<Identity, FdError>) -> Arrival {
        if self.closed {
            return Arrival::Discarded;
        }

        let identity = match identity {
            Ok(identity) => identity,
            Err(e) => {
                tracing::warn!(conn_id = %self.conn_id, error = %e, "Dropping unidentifiable descriptor");
                return Arrival::Unidentified;
            }
        };

        // First arrival wins; the cache is authoritative.
        if self.cached.contains_key(&identity) {
            return Arrival::Duplicate(identity);
        }

        let waiters = self.waiters.remove(&identity).unwrap_or_default();
        let handed = waiters.len();
        if let Err(e) = hand_off(waiters, &fd, OwnedFd::try_clone) {
            tracing::warn!(conn_id = %self.conn_id, %identity, waiters = handed, error = %e, "Failed to duplicate for waiters");
        }

        self.cached.insert(identity, fd);
        self.order.push_back(identity);
        self.evict();

        Arrival::Cached {
            identity,
            waiters: handed,
        }
    }

    fn evict(&mut self) {
        while self.cached.len() > self.max_cached {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if self.cached.remove(&oldest).is_some() {
                tracing::debug!(conn_id = %self.conn_id, identity = %oldest, "Evicted cached descriptor");
            }
        }
    }

    /// Close every cached descriptor and fail every waiter
    pub(crate) fn close(&mut self) -> usize {
        self.closed = true;
        self.cached.clear();
        self.order.clear();

        let mut failed = 0;
        for (_, waiters) in self.waiters.drain() {
            for waiter in waiters {
                waiter.resolve(Err(FdError::ConnectionClosed));
                failed += 1;
            }
        }
        failed
    }

    pub(crate) fn cached_count(&self) -> usize {
        self.cached.len()
    }

    #[cfg(test)]
    pub(crate) fn waiter_count(&self) -> usize {
        self.waiters.values().map(Vec::len).sum()
    }
}

fn duplicate(fd: &OwnedFd) -> Result<OwnedFd, FdError> {
    fd.try_clone().map_err(FdError::DuplicateFailed)
}

/// Give each waiter its own duplicate, or give all of them the same failure
///
/// Every duplicate is made before any waiter is resolved. If one fails, the
/// duplicates already made are closed and every waiter sees `DuplicateFailed`
/// with the same OS error.
fn hand_off<D>(waiters: Vec<Resolver<OwnedFd>>, fd: &OwnedFd, mut dup: D) -> io::Result<()>
where
    D: FnMut(&OwnedFd) -> io::Result<OwnedFd>,
{
    let copies: io::Result<Vec<OwnedFd>> = waiters.iter().map(|_| dup(fd)).collect();
    match copies {
        Ok(copies) => {
            for (waiter, copy) in waiters.into_iter().zip(copies) {
                waiter.resolve(Ok(copy));
            }
            Ok(())
        }
        Err(e) => {
            for waiter in waiters {
                waiter.resolve(Err(FdError::DuplicateFailed(same_error(&e))));
            }
            Err(e)
        }
    }
}

fn same_error(e: &io::Error) -> io::Error {
    match e.raw_os_error() {
        Some(code) => io::Error::from_raw_os_error(code),
        None => io::Error::new(e.kind(), e.to_string()),
    }
}
