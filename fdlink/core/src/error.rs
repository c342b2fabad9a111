//! Error Types
//!
//! Errors surfaced by the descriptor transfer subsystem.
//!
//! # Propagation
//!
//! Synchronous preconditions (a malformed locator, a path that cannot be
//! opened) fail before any asynchronous work is queued. Everything else is
//! delivered on the operation's own [`Receipt`](crate::receipt::Receipt).

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors produced while sending or receiving descriptors
#[derive(Debug, Error)]
pub enum FdError {
    /// A path-based send source could not be opened
    #[error("failed to open {path:?}: {source}")]
    OpenFailed {
        /// Path that was requested
        path: PathBuf,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// Duplicating a descriptor failed
    #[error("failed to duplicate descriptor: {0}")]
    DuplicateFailed(#[source] io::Error),

    /// The (device, inode) identity of a descriptor could not be read
    #[error("failed to stat descriptor: {0}")]
    StatFailed(#[source] io::Error),

    /// A locator string did not have the form `inode://{device}/{inode}`
    #[error("malformed locator {locator:?}: {reason}")]
    MalformedLocator {
        /// The rejected input
        locator: String,
        /// What was wrong with it
        reason: String,
    },

    /// The connection closed while the operation was outstanding
    #[error("connection closed")]
    ConnectionClosed,

    /// Ancillary data on a read could not be parsed; its descriptors were discarded
    #[error("failed to parse ancillary data: {0}")]
    AncillaryParseFailed(String),

    /// The kernel rejected the ancillary message carrying this descriptor
    #[error("failed to send descriptor: {0}")]
    SendFailed(#[source] io::Error),
}

impl FdError {
    pub(crate) fn malformed(locator: &str, reason: impl Into<String>) -> Self {
        Self::MalformedLocator {
            locator: locator.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether this error reports connection teardown
    #[must_use]
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_display_includes_input() {
        let err = FdError::malformed("file:///x", "scheme must be \"inode\"");
        let msg = err.to_string();
        assert!(msg.contains("file:///x"));
        assert!(msg.contains("scheme"));
    }

    #[test]
    fn test_connection_closed_predicate() {
        assert!(FdError::ConnectionClosed.is_connection_closed());
        assert!(!FdError::AncillaryParseFailed("x".into()).is_connection_closed());
    }
}
