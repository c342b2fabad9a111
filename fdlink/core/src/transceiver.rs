//! Transceiver Capability
//!
//! The interface the rest of a system programs against to move descriptors.
//! It has two facets:
//!
//! - [`FdSender`]: queue a descriptor, file, or path for transmission
//! - [`FdReceiver`]: request the descriptor for an [`Identity`] (or locator)
//!
//! Anything implementing both facets is an [`FdTransceiver`] by construction.
//! Only [`FdSender::send_fd`] and [`FdReceiver::recv_fd`] are required; the
//! file, path, and locator variants are derived from them.

use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, BorrowedFd};
use std::path::Path;

use crate::error::FdError;
use crate::identity::Identity;
use crate::receipt::{FdReceipt, FileReceipt, SendReceipt};

/// Send facet
pub trait FdSender: Send + Sync {
    /// Queue a descriptor for transmission
    ///
    /// The descriptor is duplicated before this returns, so the caller may
    /// close or reuse its own copy immediately.
    fn send_fd(&self, fd: BorrowedFd<'_>) -> SendReceipt;

    /// Queue an open file (or anything holding a descriptor) for transmission
    ///
    /// The descriptor is stat'ed first; a descriptor whose identity cannot be
    /// read would be dropped by the receiver, so it fails here instead.
    fn send_file(&self, file: &dyn AsFd) -> SendReceipt {
        let fd = file.as_fd();
        if let Err(e) = Identity::of_fd(fd) {
            return SendReceipt::failed(e);
        }
        self.send_fd(fd)
    }

    /// Open `path` and queue its descriptor for transmission
    ///
    /// On Linux the path is opened with `O_PATH`, which works for objects
    /// that cannot be opened for reading (namespace handles, sockets). Open
    /// failure is reported on an already-resolved receipt.
    fn send_path(&self, path: &Path) -> SendReceipt {
        match open_path(path) {
            Ok(file) => self.send_file(&file),
            Err(e) => SendReceipt::failed(e),
        }
    }
}

/// Receive facet
pub trait FdReceiver: Send + Sync {
    /// Request the descriptor for `identity`
    ///
    /// Resolves immediately if it has already arrived, otherwise on arrival.
    /// Every request gets its own duplicate.
    fn recv_fd(&self, identity: Identity) -> FdReceipt;

    /// Request the descriptor for `identity` as a [`File`]
    fn recv_file(&self, identity: Identity) -> FileReceipt {
        self.recv_fd(identity).into_file()
    }

    /// Request the descriptor named by a locator
    ///
    /// # Errors
    ///
    /// Returns [`FdError::MalformedLocator`] without registering a request.
    fn recv_fd_by_locator(&self, locator: &str) -> Result<FdReceipt, FdError> {
        let identity = Identity::from_locator(locator)?;
        Ok(self.recv_fd(identity))
    }

    /// Request the descriptor named by a locator as a [`File`]
    ///
    /// # Errors
    ///
    /// Returns [`FdError::MalformedLocator`] without registering a request.
    fn recv_file_by_locator(&self, locator: &str) -> Result<FileReceipt, FdError> {
        let identity = Identity::from_locator(locator)?;
        Ok(self.recv_file(identity))
    }
}

/// Both facets
pub trait FdTransceiver: FdSender + FdReceiver {}

impl<T: FdSender + FdReceiver + ?Sized> FdTransceiver for T {}

/// Open a handle to `path` that yields a raw descriptor, even for special files
///
/// # Errors
///
/// Returns [`FdError::OpenFailed`] if the path cannot be opened.
pub fn open_path(path: &Path) -> Result<File, FdError> {
    let mut options = OpenOptions::new();
    options.read(true);

    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.custom_flags(libc::O_PATH);
    }

    options.open(path).map_err(|source| FdError::OpenFailed {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records what it was asked to do
    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<Identity>>,
        requested: Mutex<Vec<Identity>>,
    }

    impl FdSender for Recorder {
        fn send_fd(&self, fd: BorrowedFd<'_>) -> SendReceipt {
            let id = Identity::of_fd(fd).unwrap();
            self.sent.lock().unwrap().push(id);
            SendReceipt::ready(Ok(()))
        }
    }

    impl FdReceiver for Recorder {
        fn recv_fd(&self, identity: Identity) -> FdReceipt {
            self.requested.lock().unwrap().push(identity);
            FdReceipt::failed(FdError::ConnectionClosed)
        }
    }

    #[tokio::test]
    async fn test_send_path_opens_and_delegates() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let rec = Recorder::default();
        rec.send_path(file.path()).await.unwrap();
        assert_eq!(
            rec.sent.lock().unwrap().as_slice(),
            &[Identity::of_path(file.path()).unwrap()]
        );
    }

    #[tokio::test]
    async fn test_send_path_missing_fails_before_send() {
        let dir = tempfile::tempdir().unwrap();
        let rec = Recorder::default();
        let err = rec.send_path(&dir.path().join("nope")).await.unwrap_err();
        assert!(matches!(err, FdError::OpenFailed { .. }));
        assert!(rec.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_malformed_locator_registers_nothing() {
        let rec = Recorder::default();
        let err = rec.recv_fd_by_locator("not-a-scheme://x/y").unwrap_err();
        assert!(matches!(err, FdError::MalformedLocator { .. }));
        assert!(rec.requested.lock().unwrap().is_empty());
    }

    #[test]
    fn test_locator_delegates_to_identity() {
        let rec = Recorder::default();
        let _receipt = rec.recv_file_by_locator("inode://5/6").unwrap();
        assert_eq!(
            rec.requested.lock().unwrap().as_slice(),
            &[Identity::new(5, 6)]
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_open_path_handles_unreadable_special_files() {
        // Network namespace handles cannot be opened for reading by
        // unprivileged users, but O_PATH handles can.
        let file = open_path(Path::new("/proc/self/ns/net")).unwrap();
        assert_eq!(
            Identity::of_fd(file.as_fd()).unwrap(),
            Identity::of_path("/proc/self/ns/net").unwrap()
        );
    }
}
