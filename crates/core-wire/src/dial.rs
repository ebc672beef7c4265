//! Dialling a connection point and the key-line handshake.
//!
//! After connecting, the server answers with a single line naming the page:
//! either a shared-memory object name or a decimal descriptor number for a
//! page that arrives over the socket. The line is read one byte at a time;
//! juggling blocking state on a socket this young is not worth it.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{AddressFamily, SockFlag, SockType, UnixAddr, connect, socket};
use nix::unistd::{read, write};
use tracing::{debug, warn};

use crate::{WireError, path::resolve_connpath};

/// Upper bound on the key line, terminator included.
pub const KEY_LINE_LIM: usize = 256;

/// Read a `\n`-terminated key line from the socket.
pub fn read_key_line(sock: RawFd) -> Result<String, WireError> {
    let mut buf = Vec::with_capacity(64);
    loop {
        let mut byte = [0u8; 1];
        match read(sock, &mut byte) {
            Ok(0) => return Err(WireError::HandshakeEof),
            Ok(_) => {
                if byte[0] == b'\n' {
                    break;
                }
                buf.push(byte[0]);
                if buf.len() >= KEY_LINE_LIM {
                    return Err(WireError::BadKeyLine);
                }
            }
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            Err(e) => return Err(e.into()),
        }
    }

    String::from_utf8(buf).map_err(|_| WireError::BadKeyLine)
}

fn set_nosigpipe(_fd: RawFd) {
    #[cfg(target_os = "macos")]
    {
        use nix::sys::socket::{setsockopt, sockopt};
        let fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(_fd) };
        let _ = setsockopt(&fd, sockopt::NoSigPipe, &true);
    }
}

/// Connect to a named endpoint, walking the resolution order until one
/// address answers, then run the key handshake. Returns the connected
/// socket and the page key the server announced.
pub fn connect_endpoint(
    name: &str,
    auth_key: Option<&str>,
) -> Result<(OwnedFd, String), WireError> {
    let sock = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )?;
    set_nosigpipe(sock.as_raw_fd());

    let mut attempt = 0u32;
    loop {
        let Some(path) = resolve_connpath(name, attempt) else {
            return Err(WireError::BadEndpoint);
        };
        attempt += 1;

        let addr = UnixAddr::new(&path)?;
        match connect(sock.as_raw_fd(), &addr) {
            Ok(()) => {
                debug!(target: "wire.dial", path = %path.display(), "connected");
                break;
            }
            Err(e) => {
                warn!(target: "wire.dial",
                    path = %path.display(), errno = %e, "connect failed");
                // absolute paths have a single resolution; named endpoints
                // retry against the remaining search paths
                if name.starts_with('/') {
                    return Err(WireError::Dial(e.into()));
                }
                if attempt > 1 {
                    return Err(WireError::Dial(e.into()));
                }
            }
        }
    }

    // Optional authentication line goes first, then the server responds
    // with the page key.
    if let Some(key) = auth_key {
        let line = format!("{key}\n");
        if line.len() >= KEY_LINE_LIM {
            return Err(WireError::BadKeyLine);
        }
        let mut ofs = 0;
        while ofs < line.len() {
            match write(&sock, &line.as_bytes()[ofs..]) {
                Ok(n) => ofs += n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    let key = read_key_line(sock.as_raw_fd())?;
    Ok((sock, key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{SockFlag, SockType, socketpair};
    use std::os::fd::AsRawFd;

    #[test]
    fn key_line_reads_up_to_newline() {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .unwrap();
        write(&a, b"page-77\nextra").unwrap();
        assert_eq!(read_key_line(b.as_raw_fd()).unwrap(), "page-77");
    }

    #[test]
    fn eof_before_newline_is_an_error() {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .unwrap();
        write(&a, b"partial").unwrap();
        drop(a);
        assert!(matches!(
            read_key_line(b.as_raw_fd()),
            Err(WireError::HandshakeEof)
        ));
    }

    #[test]
    fn dial_to_missing_endpoint_fails() {
        assert!(matches!(
            connect_endpoint("/nonexistent/shimmer-test-sock", None),
            Err(WireError::Dial(_))
        ));
    }
}
