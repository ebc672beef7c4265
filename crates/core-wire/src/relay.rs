//! Network relay spawn for `a12://` endpoints.
//!
//! A prefixed endpoint of the form `a12[s]://tag@host[:port]` is served by
//! an external relay process bound to one end of a socketpair; the relay
//! becomes the peer and announces the page key back over the socket like a
//! local server would.

use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
use nix::sys::wait::waitpid;
use nix::unistd::{ForkResult, fork};
use tracing::info;

use crate::{WireError, dial::read_key_line};

/// Relay binary looked up through the normal search path.
pub const RELAY_BIN: &str = "shimmer-net";

const DEFAULT_PORT: &str = "6680";

/// Classified `a12` endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct A12Addr {
    /// Offset of the host part within the endpoint string.
    pub host_ofs: usize,
    /// Certificate pinning is skipped ("soft auth") for the plain scheme.
    pub weak_auth: bool,
}

/// Classify an endpoint string. `a12s://` demands keystore auth, `a12://`
/// allows soft auth, and a bare `tag@host` form defers to the keystore
/// definition of the tag.
pub fn a12_endpoint(src: &str) -> Option<A12Addr> {
    if let Some(rest) = src.strip_prefix("a12s://") {
        let _ = rest;
        Some(A12Addr {
            host_ofs: "a12s://".len(),
            weak_auth: false,
        })
    } else if let Some(rest) = src.strip_prefix("a12://") {
        let _ = rest;
        Some(A12Addr {
            host_ofs: "a12://".len(),
            weak_auth: true,
        })
    } else if src.contains('@') {
        Some(A12Addr {
            host_ofs: 0,
            weak_auth: false,
        })
    } else {
        None
    }
}

fn ident() -> String {
    if let Ok(id) = std::env::var("A12_IDENT") {
        return id;
    }
    nix::sys::utsname::uname()
        .ok()
        .and_then(|u| u.nodename().to_str().map(str::to_string))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "anon".to_string())
}

/// Spawn the relay for `src`, returning our end of the socketpair and the
/// key line the relay read back from the remote.
///
/// The relay may outlive the caller's interest in it, so the spawn
/// double-forks and reaps only the intermediate child; no SIGCHLD handling
/// leaks into the embedding process.
pub fn spawn_relay(
    src: &str,
    keystore_fd: Option<RawFd>,
) -> Result<(OwnedFd, String), WireError> {
    let addr = a12_endpoint(src).ok_or(WireError::BadEndpoint)?;

    // split host / port; a tagged form keeps host and port in the keystore
    let hostpart = &src[addr.host_ofs..];
    let (host, port) = match hostpart.rsplit_once([':', ' ']) {
        Some((h, p)) if addr.host_ofs != 0 => (h.to_string(), p.to_string()),
        _ => (
            hostpart.to_string(),
            if addr.host_ofs == 0 {
                String::new()
            } else {
                DEFAULT_PORT.to_string()
            },
        ),
    };

    let (ours, theirs) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )?;
    crate::fdops::set_cloexec(ours.as_raw_fd());

    let ident = ident();
    let mut argv: Vec<CString> = vec![
        CString::new(RELAY_BIN).unwrap(),
        CString::new("-X").unwrap(),
        CString::new("--ident").unwrap(),
        CString::new(ident.as_str()).unwrap_or_else(|_| CString::new("anon").unwrap()),
    ];
    match keystore_fd {
        Some(fd) if !addr.weak_auth => {
            argv.push(CString::new("--keystore").unwrap());
            argv.push(CString::new(format!("{fd}")).unwrap());
        }
        _ => argv.push(CString::new("--soft-auth").unwrap()),
    }
    argv.push(CString::new("-S").unwrap());
    argv.push(CString::new(format!("{}", theirs.as_raw_fd())).unwrap());
    argv.push(CString::new(host).unwrap());
    if !port.is_empty() {
        argv.push(CString::new(port).unwrap());
    }

    // double-fork so the relay reparents to init and the only wait we owe
    // is for the intermediate child
    match unsafe { fork() }.map_err(|e| WireError::Relay(e.to_string()))? {
        ForkResult::Child => {
            match unsafe { fork() } {
                Ok(ForkResult::Child) => {
                    let _ = nix::unistd::execvp(&argv[0], &argv);
                    unsafe { libc::_exit(1) };
                }
                _ => unsafe { libc::_exit(0) },
            }
        }
        ForkResult::Parent { child } => {
            drop(theirs);
            let _ = waitpid(child, None);
        }
    }

    info!(target: "wire.relay", endpoint = src, "relay spawned");
    let key = read_key_line(ours.as_raw_fd())?;
    Ok((ours, key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_classification() {
        assert_eq!(
            a12_endpoint("a12://me@host:31337"),
            Some(A12Addr {
                host_ofs: 6,
                weak_auth: true
            })
        );
        assert_eq!(
            a12_endpoint("a12s://me@host"),
            Some(A12Addr {
                host_ofs: 7,
                weak_auth: false
            })
        );
        assert_eq!(
            a12_endpoint("tag@"),
            Some(A12Addr {
                host_ofs: 0,
                weak_auth: false
            })
        );
        assert_eq!(a12_endpoint("plain-endpoint"), None);
        assert_eq!(a12_endpoint("/absolute/path"), None);
    }
}
