//! Stream-socket plumbing: descriptor passing, endpoint resolution, the
//! connect handshake, environment-driven connection setup and the network
//! relay spawn.
//!
//! Data traffic on the socket is one byte at a time, used purely as a
//! wakeup ping and as the carrier for `SCM_RIGHTS` ancillary payloads.

use std::io;

pub mod dial;
pub mod env;
pub mod fdops;
pub mod fdpass;
pub mod path;
pub mod relay;

pub use dial::{connect_endpoint, read_key_line};
pub use env::{EnvConnection, open_env_connection};
pub use fdops::{dup_fd, ensure_stdio};
pub use fdpass::{fetch_fds, ping, push_fd, push_fds};
pub use path::resolve_connpath;
pub use relay::{a12_endpoint, spawn_relay};

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("no connection endpoint: set the connection path variable")]
    NoEndpoint,
    #[error("endpoint name could not be resolved against any search path")]
    BadEndpoint,
    #[error("dial failed: {0}")]
    Dial(#[source] io::Error),
    #[error("malformed key line in connection handshake")]
    BadKeyLine,
    #[error("peer closed the socket during handshake")]
    HandshakeEof,
    #[error("relay spawn failed: {0}")]
    Relay(String),
    #[error("descriptor transfer failed: {0}")]
    FdPass(#[source] io::Error),
    #[error("system error: {0}")]
    Sys(#[from] nix::errno::Errno),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
