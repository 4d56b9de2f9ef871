//! Descriptor passing over the control socket
//!
//! Descriptors travel as one `SCM_RIGHTS` control message attached to a
//! single placeholder byte; a stream socket cannot carry ancillary data
//! without at least one byte of real payload.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr, recvmsg, sendmsg};

use crate::error::ControlError;

/// Most descriptors accepted in one transfer (one per DMA-BUF plane)
pub const MAX_FDS: usize = imgoverlay_proto::MAX_PLANES;

const PLACEHOLDER: u8 = b'A';

/// Try to receive one descriptor transfer without blocking.
///
/// Returns `Ok(None)` when nothing is queued yet. Every descriptor the
/// kernel hands over is wrapped in an `OwnedFd` before any validation, so
/// a rejected transfer still closes what it carried.
pub fn recv_fds(sock: BorrowedFd<'_>) -> Result<Option<Vec<OwnedFd>>, ControlError> {
    let mut placeholder = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut placeholder)];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_FDS]);

    let msg = match recvmsg::<UnixAddr>(
        sock.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::MSG_CMSG_CLOEXEC | MsgFlags::MSG_DONTWAIT,
    ) {
        Ok(msg) => msg,
        Err(Errno::EAGAIN) | Err(Errno::EINTR) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut fds = Vec::new();
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(raw) = cmsg {
            // SAFETY: the kernel just installed these descriptors for us.
            fds.extend(raw.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
        }
    }
    let bytes = msg.bytes;
    let truncated = msg.flags.contains(MsgFlags::MSG_CTRUNC);

    if bytes == 0 && fds.is_empty() {
        return Err(ControlError::Disconnected);
    }
    if truncated {
        return Err(ControlError::FdTransferFailed("ancillary data truncated".into()));
    }
    if bytes != 1 {
        return Err(ControlError::FdTransferFailed(format!(
            "expected a placeholder message data of length 1, got {}",
            bytes
        )));
    }
    if fds.is_empty() {
        return Err(ControlError::FdTransferFailed(
            "expected SCM_RIGHTS descriptors, got none".into(),
        ));
    }

    Ok(Some(fds))
}

/// Send `fds` in a single `SCM_RIGHTS` message with the placeholder byte.
pub fn send_fds(sock: BorrowedFd<'_>, fds: &[BorrowedFd<'_>]) -> Result<(), ControlError> {
    if fds.is_empty() || fds.len() > MAX_FDS {
        return Err(ControlError::FdTransferFailed(format!(
            "can send 1 to {} descriptors, got {}",
            MAX_FDS,
            fds.len()
        )));
    }

    let raw: Vec<RawFd> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
    let placeholder = [PLACEHOLDER];
    let iov = [IoSlice::new(&placeholder)];
    let cmsgs = [ControlMessage::ScmRights(&raw)];

    loop {
        match sendmsg::<UnixAddr>(sock.as_raw_fd(), &iov, &cmsgs, MsgFlags::MSG_NOSIGNAL, None) {
            Ok(1) => return Ok(()),
            Ok(n) => {
                return Err(ControlError::FdTransferFailed(format!(
                    "sent {} placeholder bytes",
                    n
                )));
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Write a whole frame.
///
/// Uses `MSG_NOSIGNAL` so a vanished peer surfaces as `EPIPE` instead of
/// killing the embedding process with `SIGPIPE`.
pub fn send_frame(sock: BorrowedFd<'_>, frame: &[u8]) -> Result<(), ControlError> {
    let mut sent = 0;
    while sent < frame.len() {
        let iov = [IoSlice::new(&frame[sent..])];
        match sendmsg::<UnixAddr>(sock.as_raw_fd(), &iov, &[], MsgFlags::MSG_NOSIGNAL, None) {
            Ok(0) => return Err(ControlError::Disconnected),
            Ok(n) => sent += n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
