//! `SCM_RIGHTS` ancillary fd passage over a `SOCK_STREAM` Unix socket
//! (the socket transport half of §4.5). The pipe transport never calls
//! into this module — it has no ancillary channel, so `CreateFdSession`
//! is simply unavailable on that transport.

use nix::cmsg_space;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, RawFd};

/// Send `bytes` as the in-band payload of one `sendmsg`, with `fd` (if any)
/// riding along as an `SCM_RIGHTS` ancillary message. The caller is
/// responsible for closing its copy of `fd` immediately after this returns,
/// per §5's fd-ownership rule.
pub fn send_with_fd(socket: impl AsFd, bytes: &[u8], fd: Option<RawFd>) -> nix::Result<usize> {
    let iov = [IoSlice::new(bytes)];
    match fd {
        Some(fd) => {
            let fds = [fd];
            let cmsg = [ControlMessage::ScmRights(&fds)];
            sendmsg::<()>(socket.as_fd().as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
        }
        None => sendmsg::<()>(socket.as_fd().as_raw_fd(), &iov, &[], MsgFlags::empty(), None),
    }
}

/// One `recvmsg` call: returns the bytes read and any `SCM_RIGHTS` fds that
/// arrived alongside them, in order. Multiple fds in one message are
/// pushed in the order the kernel returns them, matching the FIFO
/// association rule in §4.5.
pub fn recv_with_fds(socket: impl AsFd, buf: &mut [u8]) -> nix::Result<(usize, Vec<RawFd>)> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg_buffer = cmsg_space!([RawFd; 4]);
    let msg = recvmsg::<()>(
        socket.as_fd().as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buffer),
        MsgFlags::empty(),
    )?;

    let mut fds = Vec::new();
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            fds.extend(received);
        }
    }
    Ok((msg.bytes, fds))
}
