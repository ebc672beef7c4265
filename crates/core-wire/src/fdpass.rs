//! `SCM_RIGHTS` descriptor transfer.
//!
//! Every message carries a one-byte iov payload; zero-length iovs break on
//! some platforms and the byte doubles as the wakeup ping for the event
//! pump. A single receive may return several descriptors (up to four
//! buffer planes plus fences).

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};
use tracing::debug;

use crate::WireError;

/// Most descriptors one receive is expected to carry.
pub const FETCH_LIMIT: usize = 12;

/// Poll window between liveness checks in a blocking fetch.
const FETCH_POLL: Duration = Duration::from_millis(1000);

fn nosig() -> MsgFlags {
    #[cfg(target_os = "macos")]
    {
        MsgFlags::empty()
    }
    #[cfg(not(target_os = "macos"))]
    {
        MsgFlags::MSG_NOSIGNAL
    }
}

/// Write a single wakeup byte, no descriptor. Best-effort: a full pipe is
/// not an error, the peer is merely behind on draining pings.
pub fn ping(sock: RawFd) {
    let iov = [IoSlice::new(b"!")];
    let _ = sendmsg::<()>(sock, &iov, &[], MsgFlags::MSG_DONTWAIT | nosig(), None);
}

/// Send one descriptor as ancillary data. With `fd` of `None` only the
/// ping byte travels.
pub fn push_fd(sock: RawFd, fd: Option<BorrowedFd>) -> Result<(), WireError> {
    let iov = [IoSlice::new(b"!")];
    let raw;
    let cmsg: &[ControlMessage] = match fd {
        Some(fd) => {
            raw = [fd.as_raw_fd()];
            &[ControlMessage::ScmRights(&raw)]
        }
        None => &[],
    };

    sendmsg::<()>(sock, &iov, cmsg, MsgFlags::MSG_DONTWAIT | nosig(), None)
        .map_err(|e| WireError::FdPass(e.into()))?;
    Ok(())
}

/// Send several descriptors in one message so the receiver observes them
/// atomically in a single fetch (subsegment offers pair a socket with the
/// page descriptor).
pub fn push_fds(sock: RawFd, fds: &[RawFd]) -> Result<(), WireError> {
    let iov = [IoSlice::new(b"!")];
    let cmsg = [ControlMessage::ScmRights(fds)];
    sendmsg::<()>(sock, &iov, &cmsg, MsgFlags::MSG_DONTWAIT | nosig(), None)
        .map_err(|e| WireError::FdPass(e.into()))?;
    Ok(())
}

/// Outcome of one fetch attempt.
pub enum Fetched {
    /// Nothing pending (non-blocking mode only).
    WouldBlock,
    /// The peer is gone or `alive` reported the connection dead.
    Dead,
    /// One ping byte consumed; zero or more descriptors arrived with it.
    Got(Vec<OwnedFd>),
}

/// Pump the socket for descriptors.
///
/// In blocking mode this loops over a bounded poll so the caller's
/// aliveness check runs even if the peer never writes; the dead-man switch
/// being pulled mid-fetch surfaces as [`Fetched::Dead`] rather than a hang.
pub fn fetch_fds(sock: RawFd, blocking: bool, alive: impl Fn() -> bool) -> Fetched {
    let mut byte = [0u8; 1];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; FETCH_LIMIT]);

    loop {
        let mut iov = [IoSliceMut::new(&mut byte)];
        match recvmsg::<()>(
            sock,
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::MSG_DONTWAIT | nosig(),
        ) {
            Ok(msg) => {
                if msg.bytes == 0 {
                    // orderly shutdown from the peer
                    return Fetched::Dead;
                }
                let mut out = Vec::new();
                let Ok(cmsgs) = msg.cmsgs() else {
                    return Fetched::Got(out);
                };
                for c in cmsgs {
                    if let ControlMessageOwned::ScmRights(fds) = c {
                        for fd in fds {
                            // Ownership transfers here; mark close-on-exec
                            // like every other descriptor we hold.
                            let owned = unsafe { OwnedFd::from_raw_fd(fd) };
                            crate::fdops::set_cloexec(owned.as_raw_fd());
                            out.push(owned);
                        }
                    }
                }
                if !out.is_empty() {
                    debug!(target: "wire.fdpass", count = out.len(), "descriptors fetched");
                }
                return Fetched::Got(out);
            }
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => {
                if !blocking {
                    return Fetched::WouldBlock;
                }
            }
            Err(_) => return Fetched::Dead,
        }

        if !alive() {
            return Fetched::Dead;
        }

        let borrowed = unsafe { BorrowedFd::borrow_raw(sock) };
        let mut pfd = [PollFd::new(borrowed, PollFlags::POLLIN | PollFlags::POLLHUP)];
        let timeout = PollTimeout::try_from(FETCH_POLL.as_millis() as u16)
            .unwrap_or(PollTimeout::MAX);
        let _ = nix::poll::poll(&mut pfd, timeout);
    }
}
