//! `SCM_RIGHTS` ancillary I/O
//!
//! Raw `sendmsg`/`recvmsg` on a Unix stream socket. Callers drive readiness;
//! these functions make exactly one syscall and report `WouldBlock` as an
//! ordinary `io::Error`.
//!
//! # Wire Format
//!
//! ```text
//! sendmsg: [ 1 payload byte ] + cmsg(SOL_SOCKET, SCM_RIGHTS, [fd])
//! ```
//!
//! Each descriptor travels in its own one-byte message so a short write can
//! never strand a descriptor without its byte. The receive buffer has room
//! for [`MAX_FDS_PER_WRITE`] descriptors.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use crate::error::FdError;

/// Maximum descriptors carried by one write, and received by one read
pub const MAX_FDS_PER_WRITE: usize = 64;

const CONTROL_CAPACITY: usize = 512;

/// Control buffer aligned for `cmsghdr`
#[repr(C, align(8))]
struct ControlBuf([u8; CONTROL_CAPACITY]);

impl ControlBuf {
    fn new() -> Self {
        Self([0; CONTROL_CAPACITY])
    }
}

fn cmsg_space(fd_count: usize) -> io::Result<usize> {
    let data_len = fd_count * mem::size_of::<RawFd>();
    // SAFETY: CMSG_SPACE is a pure size computation.
    let space = unsafe { libc::CMSG_SPACE(data_len as libc::c_uint) } as usize;
    if space > CONTROL_CAPACITY {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{fd_count} descriptors exceed control buffer"),
        ));
    }
    Ok(space)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
const RECV_FLAGS: libc::c_int = 0;

/// Send one payload byte carrying one descriptor
///
/// Returns the number of payload bytes the kernel accepted (1 on success).
pub(crate) fn send_with_fd(socket: RawFd, byte: u8, fd: BorrowedFd<'_>) -> io::Result<usize> {
    let mut payload = [byte];
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr().cast(),
        iov_len: payload.len(),
    };

    let space = cmsg_space(1)?;
    let mut control = ControlBuf::new();

    // SAFETY: zeroed msghdr is valid before assigning pointers.
    let mut msghdr: libc::msghdr = unsafe { mem::zeroed() };
    msghdr.msg_iov = &mut iov;
    msghdr.msg_iovlen = 1;
    msghdr.msg_control = control.0.as_mut_ptr().cast();
    msghdr.msg_controllen = space as _;

    // SAFETY: control buffer is aligned and sized with CMSG_SPACE for one fd.
    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msghdr) };
    if cmsg.is_null() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "failed to allocate SCM_RIGHTS cmsg",
        ));
    }

    let raw = fd.as_raw_fd();
    // SAFETY: cmsg points into `control`, which has room for one RawFd of data.
    unsafe {
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as libc::c_uint) as _;
        std::ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>(), raw);
    }

    // SAFETY: msghdr points to live iov/control buffers.
    let n = unsafe { libc::sendmsg(socket, &msghdr, SEND_FLAGS) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "sendmsg accepted no payload for descriptor",
        ));
    }
    Ok(n as usize)
}

/// Result of one `recvmsg`
#[derive(Debug)]
pub(crate) struct Received {
    /// Payload bytes written into the caller's buffer
    pub bytes: usize,
    /// Descriptors from the control data, or why they were discarded
    pub fds: Result<Vec<OwnedFd>, FdError>,
}

/// Read payload bytes and any `SCM_RIGHTS` descriptors in one call
///
/// Descriptors are taken into ownership as soon as they are parsed, so a
/// malformed or truncated control message closes them instead of leaking.
pub(crate) fn recv_with_fds(socket: RawFd, buf: &mut [u8]) -> io::Result<Received> {
    recv_with_capacity(socket, buf, MAX_FDS_PER_WRITE)
}

/// As [`recv_with_fds`], with control space for `fd_capacity` descriptors
///
/// Descriptors beyond that capacity are cut by the kernel (`MSG_CTRUNC`);
/// the payload bytes are still returned.
fn recv_with_capacity(socket: RawFd, buf: &mut [u8], fd_capacity: usize) -> io::Result<Received> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };

    let space = cmsg_space(fd_capacity)?;
    let mut control = ControlBuf::new();

    // SAFETY: zeroed msghdr is valid before assigning pointers.
    let mut msghdr: libc::msghdr = unsafe { mem::zeroed() };
    msghdr.msg_iov = &mut iov;
    msghdr.msg_iovlen = 1;
    msghdr.msg_control = control.0.as_mut_ptr().cast();
    msghdr.msg_controllen = space as _;

    // SAFETY: msghdr points to live iov/control buffers.
    let n = unsafe { libc::recvmsg(socket, &mut msghdr, RECV_FLAGS) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let (fds, malformed) = parse_rights(&msghdr);
    let fds = if msghdr.msg_flags & libc::MSG_CTRUNC != 0 {
        Err(FdError::AncillaryParseFailed(format!(
            "control data truncated, discarding {} descriptors",
            fds.len()
        )))
    } else if malformed {
        Err(FdError::AncillaryParseFailed(format!(
            "malformed control message, discarding {} descriptors",
            fds.len()
        )))
    } else {
        Ok(fds)
    };

    Ok(Received {
        bytes: n as usize,
        fds,
    })
}

/// Collect every `SCM_RIGHTS` descriptor; the flag reports a malformed header
fn parse_rights(msghdr: &libc::msghdr) -> (Vec<OwnedFd>, bool) {
    let mut out = Vec::new();
    let mut malformed = false;

    if msghdr.msg_controllen == 0 {
        return (out, malformed);
    }

    // SAFETY: CMSG_LEN is a pure size computation.
    let base_len = unsafe { libc::CMSG_LEN(0) } as usize;

    // SAFETY: msghdr points at a valid control buffer owned by the caller,
    // with msg_controllen set by the kernel.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msghdr);
        while !cmsg.is_null() {
            let cmsg_len = (*cmsg).cmsg_len as usize;
            if cmsg_len < base_len {
                malformed = true;
                break;
            }
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let count = (cmsg_len - base_len) / mem::size_of::<RawFd>();
                let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                for i in 0..count {
                    let raw = std::ptr::read_unaligned(data.add(i));
                    if raw >= 0 {
                        // FDs from SCM_RIGHTS are owned by the receiver now.
                        out.push(OwnedFd::from_raw_fd(raw));
                    }
                }
            }
            cmsg = libc::CMSG_NXTHDR(msghdr, cmsg);
        }
    }

    (out, malformed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_send_recv_single_descriptor() {
        let (a, b) = UnixStream::pair().unwrap();
        let file = tempfile::tempfile().unwrap();

        let n = send_with_fd(a.as_raw_fd(), b'x', file.as_fd()).unwrap();
        assert_eq!(n, 1);

        let mut buf = [0u8; 16];
        let received = recv_with_fds(b.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(received.bytes, 1);
        assert_eq!(buf[0], b'x');

        let fds = received.fds.unwrap();
        assert_eq!(fds.len(), 1);
        assert_eq!(
            Identity::of_fd(fds[0].as_fd()).unwrap(),
            Identity::of_fd(file.as_fd()).unwrap()
        );
    }

    #[test]
    fn test_plain_bytes_carry_no_descriptors() {
        use std::io::Write;

        let (mut a, b) = UnixStream::pair().unwrap();
        a.write_all(b"hello").unwrap();

        let mut buf = [0u8; 16];
        let received = recv_with_fds(b.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..received.bytes], b"hello");
        assert!(received.fds.unwrap().is_empty());
    }

    #[test]
    fn test_descriptor_messages_are_read_boundaries() {
        let (a, b) = UnixStream::pair().unwrap();
        let first = tempfile::tempfile().unwrap();
        let second = tempfile::tempfile().unwrap();

        send_with_fd(a.as_raw_fd(), b'1', first.as_fd()).unwrap();
        send_with_fd(a.as_raw_fd(), b'2', second.as_fd()).unwrap();

        let mut buf = [0u8; 16];
        let one = recv_with_fds(b.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(one.bytes, 1);
        assert_eq!(one.fds.unwrap().len(), 1);

        let two = recv_with_fds(b.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(two.bytes, 1);
        assert_eq!(buf[0], b'2');
        assert_eq!(two.fds.unwrap().len(), 1);
    }

    #[test]
    fn test_truncated_control_still_delivers_bytes() {
        let (a, b) = UnixStream::pair().unwrap();
        let file = tempfile::tempfile().unwrap();
        send_with_fd(a.as_raw_fd(), b'k', file.as_fd()).unwrap();

        // No room for even one descriptor.
        let mut buf = [0u8; 16];
        let received = recv_with_capacity(b.as_raw_fd(), &mut buf, 0).unwrap();
        assert_eq!(received.bytes, 1);
        assert_eq!(buf[0], b'k');
        assert!(matches!(
            received.fds,
            Err(FdError::AncillaryParseFailed(_))
        ));

        // The stream carries on after the discarded descriptor.
        send_with_fd(a.as_raw_fd(), b'l', file.as_fd()).unwrap();
        let next = recv_with_fds(b.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(buf[0], b'l');
        assert_eq!(next.fds.unwrap().len(), 1);
    }

    #[test]
    fn test_batch_fits_control_buffer() {
        assert!(cmsg_space(MAX_FDS_PER_WRITE).is_ok());
        assert!(cmsg_space(CONTROL_CAPACITY).is_err());
    }
}
