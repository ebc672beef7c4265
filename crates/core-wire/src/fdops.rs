//! Small descriptor utilities shared by both sides of the connection.

use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, FdFlag, OFlag, fcntl};
use nix::unistd::{dup, dup2};

pub(crate) fn set_cloexec(fd: RawFd) {
    if let Ok(flags) = fcntl(fd, FcntlArg::F_GETFD) {
        let mut flags = FdFlag::from_bits_truncate(flags);
        flags.insert(FdFlag::FD_CLOEXEC);
        let _ = fcntl(fd, FcntlArg::F_SETFD(flags));
    }
}

/// dup2-with-dup-fallback. `dst` below zero means "any number"; `blocking`
/// false sets O_NONBLOCK on the copy. The copy is CLOEXEC unless it landed
/// on a stdio number.
pub fn dup_fd(fd: RawFd, dst: RawFd, blocking: bool) -> Option<OwnedFd> {
    if fd < 0 {
        return None;
    }

    let mut copy = -1;
    if dst >= 0 {
        loop {
            match dup2(fd, dst) {
                Ok(n) => {
                    copy = n;
                    break;
                }
                Err(Errno::EINTR) => continue,
                Err(_) => break,
            }
        }
    }
    if copy == -1 {
        loop {
            match dup(fd) {
                Ok(n) => {
                    copy = n;
                    break;
                }
                Err(Errno::EINTR) => continue,
                Err(_) => return None,
            }
        }
    }

    if !blocking {
        if let Ok(flags) = fcntl(copy, FcntlArg::F_GETFL) {
            let mut flags = OFlag::from_bits_truncate(flags);
            flags.insert(OFlag::O_NONBLOCK);
            let _ = fcntl(copy, FcntlArg::F_SETFL(flags));
        }
    }
    if copy > 2 {
        set_cloexec(copy);
    }

    Some(unsafe { OwnedFd::from_raw_fd(copy) })
}

/// Make sure descriptors 0..2 are occupied before the page descriptor is
/// created. The page carries data: an accidental printf into it would
/// corrupt the cookie and kill the connection.
pub fn ensure_stdio() -> bool {
    use nix::fcntl::open;
    use nix::sys::stat::Mode;

    loop {
        match open("/dev/null", OFlag::O_RDWR, Mode::empty()) {
            Ok(fd) => {
                if fd > 2 {
                    let _ = nix::unistd::close(fd);
                    return true;
                }
                // descriptor landed in the stdio range: keep it open and
                // continue until the range is filled
            }
            Err(_) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::fd::{AsRawFd, IntoRawFd};

    #[test]
    fn dup_fd_produces_independent_descriptor() {
        let mut tmp = tempfile::tempfile().unwrap();
        writeln!(tmp, "dup me").unwrap();
        tmp.flush().unwrap();

        let copy = dup_fd(tmp.as_raw_fd(), -1, true).expect("dup");
        assert_ne!(copy.as_raw_fd(), tmp.as_raw_fd());

        // the copy shares the open file description
        let mut f = std::fs::File::from(copy);
        f.seek(SeekFrom::Start(0)).unwrap();
        let mut out = String::new();
        f.read_to_string(&mut out).unwrap();
        assert_eq!(out, "dup me\n");
    }

    #[test]
    fn dup_of_bad_fd_is_none() {
        assert!(dup_fd(-1, -1, true).is_none());
        // a valid but closed number
        let tmp = tempfile::tempfile().unwrap();
        let raw = tmp.into_raw_fd();
        let owned = unsafe { OwnedFd::from_raw_fd(raw) };
        drop(owned);
        assert!(dup_fd(raw, -1, true).is_none());
    }
}
