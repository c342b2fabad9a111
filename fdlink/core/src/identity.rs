//! Filesystem Identity and Locators
//!
//! A descriptor is correlated between sender and receiver by the
//! `(device, inode)` pair of the object it refers to. The pair travels
//! between processes as a locator string:
//!
//! ```text
//! inode://{device}/{inode}
//! ```
//!
//! Both fields are ASCII decimal. A path is meaningless outside the owning
//! process's mount namespace, but device and inode are stable and comparable.

use std::fmt;
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FdError;

/// Locator scheme
pub const LOCATOR_SCHEME: &str = "inode";

/// The `(device, inode)` pair of a live filesystem object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    /// Device number
    pub device: u64,
    /// Inode number
    pub inode: u64,
}

impl Identity {
    /// Create an identity from its parts
    #[must_use]
    pub const fn new(device: u64, inode: u64) -> Self {
        Self { device, inode }
    }

    /// Identity of the object an open descriptor refers to
    ///
    /// # Errors
    ///
    /// Returns [`FdError::StatFailed`] if `fstat` fails.
    pub fn of_fd(fd: BorrowedFd<'_>) -> Result<Self, FdError> {
        let mut stat = MaybeUninit::<libc::stat>::uninit();
        // SAFETY: fd is a live borrowed descriptor and `stat` is a valid out pointer.
        let rc = unsafe { libc::fstat(fd.as_raw_fd(), stat.as_mut_ptr()) };
        if rc < 0 {
            return Err(FdError::StatFailed(io::Error::last_os_error()));
        }
        // SAFETY: fstat succeeded and initialized the struct.
        let stat = unsafe { stat.assume_init() };
        // dev_t is signed on some platforms
        #[allow(clippy::cast_sign_loss, clippy::unnecessary_cast)]
        Ok(Self::new(stat.st_dev as u64, stat.st_ino as u64))
    }

    /// Identity of the object at `path`, following symlinks
    ///
    /// # Errors
    ///
    /// Returns [`FdError::StatFailed`] if the path cannot be stat'ed.
    pub fn of_path(path: impl AsRef<Path>) -> Result<Self, FdError> {
        let meta = std::fs::metadata(path).map_err(FdError::StatFailed)?;
        Ok(Self::new(meta.dev(), meta.ino()))
    }

    /// Encode as `inode://{device}/{inode}`
    #[must_use]
    pub fn to_locator(&self) -> String {
        self.to_string()
    }

    /// Decode a locator string
    ///
    /// The scheme is matched case-insensitively; both fields must be
    /// non-empty runs of ASCII digits that fit in a `u64`. Anything else,
    /// including extra path segments, queries, or fragments, is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`FdError::MalformedLocator`] on any deviation from the format.
    pub fn from_locator(locator: &str) -> Result<Self, FdError> {
        let (scheme, rest) = locator
            .split_once("://")
            .ok_or_else(|| FdError::malformed(locator, "missing \"://\""))?;

        if !scheme.eq_ignore_ascii_case(LOCATOR_SCHEME) {
            return Err(FdError::malformed(
                locator,
                format!("scheme must be \"{LOCATOR_SCHEME}\" not {scheme:?}"),
            ));
        }

        let (device, inode) = rest
            .split_once('/')
            .ok_or_else(|| FdError::malformed(locator, "missing inode component"))?;

        Ok(Self::new(
            parse_decimal(locator, "device", device)?,
            parse_decimal(locator, "inode", inode)?,
        ))
    }
}

fn parse_decimal(locator: &str, field: &str, digits: &str) -> Result<u64, FdError> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FdError::malformed(
            locator,
            format!("{field} must be a decimal integer, got {digits:?}"),
        ));
    }
    digits
        .parse()
        .map_err(|e| FdError::malformed(locator, format!("{field}: {e}")))
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{LOCATOR_SCHEME}://{}/{}", self.device, self.inode)
    }
}

impl FromStr for Identity {
    type Err = FdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_locator(s)
    }
}

/// Locator for the object an open descriptor refers to
///
/// # Errors
///
/// Returns [`FdError::StatFailed`] if `fstat` fails.
pub fn locator_of_fd(fd: BorrowedFd<'_>) -> Result<String, FdError> {
    Identity::of_fd(fd).map(|id| id.to_locator())
}

/// Locator for the object at `path`
///
/// # Errors
///
/// Returns [`FdError::StatFailed`] if the path cannot be stat'ed.
pub fn locator_of_path(path: impl AsRef<Path>) -> Result<String, FdError> {
    Identity::of_path(path).map(|id| id.to_locator())
}
