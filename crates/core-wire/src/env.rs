//! Environment-driven connection setup.
//!
//! Reserved names, in precedence order:
//!
//! - `SHIMMER_SOCKIN_FD`  - pre-opened socket inherited from the parent;
//!   the page key comes from `SHIMMER_SHMKEY` or, failing that, the page
//!   descriptor itself arrives over the socket.
//! - `SHIMMER_CONNPATH`   - endpoint to dial; an `a12://` form spawns the
//!   network relay instead of a local connect.
//! - `SHIMMER_CONNFL`     - numeric OR-mask folded into the caller's
//!   connection flags.
//! - `SHIMMER_ARG`        - packed argument string for the client.
//! - `SHIMMER_ALTCONN`    - fallback endpoint for crash recovery.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

use tracing::{debug, info};

use crate::{WireError, connect_endpoint, fdpass, relay};

pub const ENV_CONNPATH: &str = "SHIMMER_CONNPATH";
pub const ENV_CONNFL: &str = "SHIMMER_CONNFL";
pub const ENV_SOCKIN: &str = "SHIMMER_SOCKIN_FD";
pub const ENV_ARG: &str = "SHIMMER_ARG";
pub const ENV_ALTCONN: &str = "SHIMMER_ALTCONN";
pub const ENV_SHMKEY: &str = "SHIMMER_SHMKEY";

/// A resolved connection, page not yet mapped.
pub struct EnvConnection {
    pub socket: OwnedFd,
    /// Page key: a decimal string names an inherited descriptor, anything
    /// else a shared-memory object.
    pub keyfile: String,
    /// Descriptor fetched when the key had to come over the socket.
    pub key_fd: Option<OwnedFd>,
    pub networked: bool,
    /// The endpoint that was dialled, when one was (not inherited).
    pub endpoint: Option<String>,
    /// OR-mask from `SHIMMER_CONNFL`.
    pub extra_flags: u32,
    pub args: Option<String>,
    pub alternate: Option<String>,
}

/// Open a connection according to the inherited environment.
///
/// With `loop_connect` the dial retries with exponential backoff (capped at
/// 16 s) until the endpoint answers.
pub fn open_env_connection(loop_connect: bool) -> Result<EnvConnection, WireError> {
    let extra_flags = std::env::var(ENV_CONNFL)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(0);
    let args = std::env::var(ENV_ARG).ok();
    let alternate = std::env::var(ENV_ALTCONN).ok();

    if let Ok(fdstr) = std::env::var(ENV_SOCKIN) {
        let raw = fdstr
            .parse::<i32>()
            .map_err(|_| WireError::BadEndpoint)?;
        let socket = unsafe { OwnedFd::from_raw_fd(raw) };
        crate::fdops::set_cloexec(socket.as_raw_fd());

        let (keyfile, key_fd) = match std::env::var(ENV_SHMKEY) {
            Ok(key) => (key, None),
            // no named key: the page descriptor travels on the socket
            Err(_) => match fdpass::fetch_fds(socket.as_raw_fd(), true, || true) {
                fdpass::Fetched::Got(mut fds) if !fds.is_empty() => {
                    let fd = fds.remove(0);
                    (format!("{}", fd.as_raw_fd()), Some(fd))
                }
                _ => return Err(WireError::HandshakeEof),
            },
        };

        // single-use: children must not pick these up again
        unsafe {
            std::env::remove_var(ENV_SOCKIN);
            std::env::remove_var(ENV_SHMKEY);
        }

        info!(target: "wire.env", key = %keyfile, "inherited connection");
        return Ok(EnvConnection {
            socket,
            keyfile,
            key_fd,
            networked: false,
            endpoint: None,
            extra_flags,
            args,
            alternate,
        });
    }

    let Ok(conn_src) = std::env::var(ENV_CONNPATH) else {
        return Err(WireError::NoEndpoint);
    };

    if relay::a12_endpoint(&conn_src).is_some() {
        let (socket, keyfile) = relay::spawn_relay(&conn_src, None)?;
        return Ok(EnvConnection {
            socket,
            keyfile,
            key_fd: None,
            networked: true,
            endpoint: Some(conn_src),
            extra_flags,
            args,
            alternate,
        });
    }

    let mut step = 0u32;
    let (socket, keyfile) = loop {
        match connect_endpoint(&conn_src, None) {
            Ok(res) => break res,
            Err(e) if loop_connect => {
                debug!(target: "wire.env", error = %e, "dial failed, retrying");
                std::thread::sleep(Duration::from_secs(1 << step.min(4)));
                step += 1;
            }
            Err(e) => return Err(e),
        }
    };

    Ok(EnvConnection {
        socket,
        keyfile,
        key_fd: None,
        networked: false,
        endpoint: Some(conn_src),
        extra_flags,
        args,
        alternate,
    })
}
