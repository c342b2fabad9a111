//! Descriptor accounting across close
//!
//! Kept in its own test binary: counting `/proc/self/fd` is only meaningful
//! when no other test in the process is opening descriptors.

#![cfg(target_os = "linux")]

use std::fs::File;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::net::UnixStream;

use fdlink_core::{wrap_conn, FdError, FdSender, TransceiverConfig};

const WAIT: Duration = Duration::from_secs(5);

fn open_fds() -> usize {
    std::fs::read_dir("/proc/self/fd").unwrap().count()
}

#[tokio::test]
async fn test_close_with_queued_sends_leaks_nothing() {
    let before = open_fds();
    {
        let (a, b) = UnixStream::pair().unwrap();
        let config = TransceiverConfig::default();
        let (a, ta) = wrap_conn(Box::new(a), &config);
        let (b, tb) = wrap_conn(Box::new(b), &config);
        let ta = ta.unwrap();

        let files: Vec<File> = (0..20).map(|_| tempfile::tempfile().unwrap()).collect();
        let receipts: Vec<_> = files.iter().map(|f| ta.send_file(f)).collect();
        drop(files);

        // Only the queued duplicates keep the files open now.
        drop(a);
        for receipt in receipts {
            let err = tokio::time::timeout(WAIT, receipt).await.unwrap().unwrap_err();
            assert!(matches!(err, FdError::ConnectionClosed));
        }

        drop(ta);
        drop(tb);
        drop(b);
    }
    // Let executor workers observe their closed channels.
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(open_fds(), before);
}
