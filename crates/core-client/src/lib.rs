//! Client side of the shimmer IPC substrate.
//!
//! A [`Context`] owns one segment: the shared page, the stream socket, the
//! sync slots and the watchdog that turns any lifecycle anomaly into a
//! clean fault signal. The primary segment comes from [`open`] (or
//! [`Context::from_socket`] when the connection is inherited); subsegments
//! are acquired from a primary via the NEWSEGMENT flow.
//!
//! Threading contract: one designated primary thread drives the event
//! pump, the signal pump and migration; migration from any other thread
//! is refused. A context is `Send` but deliberately not `Sync` - callers
//! that share one across threads wrap it and use the
//! [`Context::lock`]/[`Context::unlock`] pair (owner-tracked, so a
//! release from the wrong thread fails loudly) to exclude the pumps
//! around their critical sections; [`Context::try_enqueue`] never blocks
//! and is safe to call under that lock. The watchdog runs on its own
//! detached thread and touches nothing but the guard state.

use std::sync::Arc;

pub mod context;
pub mod guard;
pub mod migrate;
pub mod mouse;
pub mod open;
pub mod page;
pub mod preroll;
pub mod pump;
pub mod resize;
pub mod signal;
pub mod subseg;

pub use context::{Context, PageKey, PrimaryRegistry, PrimaryRole};
pub use migrate::MigrateStatus;
pub use mouse::MouseState;
pub use open::{OpenExt, open, open_ext};
pub use page::PageMap;
pub use preroll::{FontSlot, Initial};
pub use resize::ResizeExt;
pub use subseg::BufferedEvent;

use core_layout::LayoutError;
use core_wire::WireError;

bitflags::bitflags! {
    /// Connection setup flags. The environment may OR additional bits in
    /// through the connection-flags variable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ContextFlags: u32 {
        /// Keep retrying the initial dial until the endpoint answers.
        const CONNECT_LOOP       = 1;
        /// Skip the preroll stage entirely.
        const NO_ACTIVATE        = 2;
        /// Run preroll but do not resize to the prerolled geometry.
        const NO_ACTIVATE_RESIZE = 4;
        /// Caller controls the REGISTER event.
        const NO_REGISTER        = 8;
        /// Deliver PAUSE/UNPAUSE rather than aggregating between them.
        const MANUAL_PAUSE       = 16;
        /// Do not spawn the watchdog thread.
        const DISABLE_GUARD      = 32;
        /// Keep named shared resources linked after mapping.
        const DONT_UNLINK        = 64;
        /// Never migrate implicitly on a dead peer.
        const NO_AUTO_RECONNECT  = 128;
    }
}

bitflags::bitflags! {
    /// What `signal` publishes and how it synchronises.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SignalMask: u32 {
        const VIDEO      = 1;
        const AUDIO      = 2;
        /// Do not block for the acknowledge even on a depth-1 chain.
        const NONBLOCK   = 4;
        /// Derive the dirty rectangle by diffing against the previous
        /// buffer (needs SUBREGION hint and at least two buffers).
        const AUTO_DIRTY = 8;
    }
}

/// Segment role, exchanged in REGISTER/NEWSEGMENT events.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SegmentKind {
    #[default]
    Unknown = 0,
    Application = 1,
    Media = 2,
    Terminal = 3,
    Popup = 4,
    Icon = 5,
    Cursor = 6,
    Clipboard = 7,
    /// Output direction: receives buffer contents.
    ClipboardPaste = 8,
    /// Output direction: receives buffer contents.
    Encoder = 9,
    Debug = 10,
    Accessibility = 11,
}

impl SegmentKind {
    pub fn from_raw(v: u8) -> Self {
        match v {
            1 => Self::Application,
            2 => Self::Media,
            3 => Self::Terminal,
            4 => Self::Popup,
            5 => Self::Icon,
            6 => Self::Cursor,
            7 => Self::Clipboard,
            8 => Self::ClipboardPaste,
            9 => Self::Encoder,
            10 => Self::Debug,
            11 => Self::Accessibility,
            _ => Self::Unknown,
        }
    }

    /// Output-direction segments receive rather than produce buffers.
    pub fn is_output(self) -> bool {
        matches!(self, Self::Encoder | Self::ClipboardPaste)
    }
}

/// Argument to the reset hook installed with [`Context::on_reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetStatus {
    /// Geometry applied in place, pointers unchanged.
    NoChange,
    /// The page was remapped; re-derive any cached references.
    Remap,
    /// The connection died mid-operation.
    Lost,
}

pub type ResetHook = Box<dyn FnMut(ResetStatus) + Send>;

#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("connection is dead")]
    Dead,
    #[error("peer delivered EXIT")]
    Exited,
    #[error("outgoing queue is full")]
    OutOfSpace,
    #[error("server rejected the resize")]
    ResizeRejected,
    #[error("operation restricted to the primary thread")]
    BadThread,
    #[error("migration failed: {0:?}")]
    Migration(MigrateStatus),
    #[error("no pending subsegment to acquire")]
    NoSegment,
    #[error("subsegment request {0} failed")]
    RequestFailed(u32),
    #[error("system error: {0}")]
    Sys(#[from] nix::errno::Errno),
}

/// Shared guard state, see [`guard`].
pub(crate) type GuardHandle = Arc<guard::GuardShared>;
