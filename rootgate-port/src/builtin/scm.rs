//! Descriptor passing over unix sockets with `SCM_RIGHTS`
//!
//! Every message carries one status byte. The descriptor rides along only
//! with [`STATUS_OK`]; an error status is followed by a plain-text reason.

#![allow(unsafe_code)]
#![allow(clippy::cast_possible_truncation)]

use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

/// The helper dialed the target and attached the socket
pub const STATUS_OK: u8 = 0;
/// The helper could not dial; a reason follows
pub const STATUS_ERR: u8 = 1;

fn cmsg_space() -> usize {
    // SAFETY: pure arithmetic on the size of one descriptor
    unsafe { libc::CMSG_SPACE(size_of::<RawFd>() as u32) as usize }
}

/// Send `fd` with a [`STATUS_OK`] byte
pub fn send_fd(socket: RawFd, fd: RawFd) -> io::Result<()> {
    let data = [STATUS_OK];
    let iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };

    let space = cmsg_space();
    let mut cmsg_buf = vec![0u8; space];

    // SAFETY: msghdr is plain data; zero is a valid initial state
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = (&raw const iov).cast_mut();
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = space as _;

    // SAFETY: msg_control points at a buffer of CMSG_SPACE bytes
    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&raw const msg) };
    if cmsg.is_null() {
        return Err(io::Error::other("CMSG_FIRSTHDR returned null"));
    }
    // SAFETY: cmsg points into cmsg_buf, which has room for one descriptor
    unsafe {
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(size_of::<RawFd>() as u32) as _;
        std::ptr::copy_nonoverlapping(
            (&raw const fd).cast::<u8>(),
            libc::CMSG_DATA(cmsg),
            size_of::<RawFd>(),
        );
    }

    // SAFETY: msg and everything it points to outlive the call
    let ret = unsafe { libc::sendmsg(socket, &raw const msg, libc::MSG_NOSIGNAL) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Receive a status byte and, with [`STATUS_OK`], a descriptor
///
/// The descriptor is close-on-exec.
pub fn recv_fd(socket: RawFd) -> io::Result<(u8, Option<OwnedFd>)> {
    let mut data = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: data.as_mut_ptr().cast(),
        iov_len: data.len(),
    };

    let space = cmsg_space();
    let mut cmsg_buf = vec![0u8; space];

    // SAFETY: msghdr is plain data; zero is a valid initial state
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &raw mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = space as _;

    // SAFETY: msg and everything it points to outlive the call
    let ret = unsafe { libc::recvmsg(socket, &raw mut msg, libc::MSG_CMSG_CLOEXEC) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    if ret == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "peer closed before answering",
        ));
    }

    // SAFETY: msg was filled in by recvmsg
    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&raw const msg) };
    if cmsg.is_null() {
        return Ok((data[0], None));
    }
    // SAFETY: cmsg points into cmsg_buf as laid out by the kernel
    unsafe {
        if (*cmsg).cmsg_level != libc::SOL_SOCKET || (*cmsg).cmsg_type != libc::SCM_RIGHTS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected control message type",
            ));
        }
        let mut fd: RawFd = -1;
        std::ptr::copy_nonoverlapping(
            libc::CMSG_DATA(cmsg),
            (&raw mut fd).cast::<u8>(),
            size_of::<RawFd>(),
        );
        Ok((data[0], Some(OwnedFd::from_raw_fd(fd))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_passed_descriptor_is_usable() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        let (mut ours, theirs) = UnixStream::pair().unwrap();

        send_fd(sender.as_raw_fd(), theirs.as_raw_fd()).unwrap();
        drop(theirs);
        let (status, fd) = recv_fd(receiver.as_raw_fd()).unwrap();
        assert_eq!(status, STATUS_OK);

        let mut passed = UnixStream::from(fd.unwrap());
        passed.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        ours.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn test_error_status_without_descriptor() {
        let (mut sender, receiver) = UnixStream::pair().unwrap();
        sender.write_all(&[STATUS_ERR]).unwrap();
        sender.write_all(b"connection refused").unwrap();
        drop(sender);

        let (status, fd) = recv_fd(receiver.as_raw_fd()).unwrap();
        assert_eq!(status, STATUS_ERR);
        assert!(fd.is_none());

        let mut rest = String::new();
        (&receiver).read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "connection refused");
    }

    #[test]
    fn test_eof_is_an_error() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        drop(sender);
        let err = recv_fd(receiver.as_raw_fd()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
