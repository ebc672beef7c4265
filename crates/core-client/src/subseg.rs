//! Subsegment allocation: acquire a delivered NEWSEGMENT and the
//! request/acquire loop for client-initiated segments.

use std::os::fd::OwnedFd;

use tracing::debug;

use core_events::{EventRecord, ExternalKind, SegReqBody, TargetKind};

use crate::context::{Context, PageKey};
use crate::{ContextFlags, SegmentKind, ShmError};

/// Bound on events parked while waiting for a segment response.
const ACQUIRE_POOL_LIMIT: usize = 512;

/// An event buffered during an acquire loop. Descriptor-bearing events
/// carry a duplicated descriptor so ownership survives the detour.
pub struct BufferedEvent {
    pub event: EventRecord,
    pub fd: Option<OwnedFd>,
}

impl Context {
    /// Map the subsegment delivered by the most recent NEWSEGMENT.
    ///
    /// The child shares no buffers with this context. Its liveness is
    /// implied by the parent's: the server tears the pair down together,
    /// and the child's own watchdog observes that through its socket.
    pub fn acquire(
        &mut self,
        kind: SegmentKind,
        flags: ContextFlags,
    ) -> Result<Context, ShmError> {
        let seg = self.hidden.pseg.take().ok_or(ShmError::NoSegment)?;

        let (map, shm_key) = match seg.page_fd {
            Some(fd) => (crate::PageMap::from_fd(fd)?, None),
            // legacy path: the key line travels on the new socket
            None => {
                let key = core_wire::read_key_line(std::os::fd::AsRawFd::as_raw_fd(
                    &seg.socket,
                ))?;
                Context::map_key(&seg.socket, PageKey::parse(&key), flags)?
            }
        };

        // the escrow fulfilled its purpose; reset so the next pump call
        // does not close what we just took
        self.hidden.pev = Default::default();

        let kind = if kind == SegmentKind::Unknown {
            seg.kind
        } else {
            kind
        };
        debug!(target: "shm.subseg", kind = ?kind, "subsegment acquired");
        Context::assemble(map, seg.socket, kind, flags, None, shm_key)
    }

    /// Request a subsegment and wait for the matching NEWSEGMENT or
    /// REQFAIL. Normal dispatch continues meanwhile: unrelated events are
    /// parked into `buffered` (descriptors duplicated) and should be
    /// replayed to the application after the acquire, in order.
    pub fn request_segment(
        &mut self,
        kind: SegmentKind,
        id: u32,
        w: u32,
        h: u32,
        buffered: &mut Vec<BufferedEvent>,
    ) -> Result<Context, ShmError> {
        let mut req = EventRecord::external(ExternalKind::SegReq);
        req.ext_mut().body.segreq = SegReqBody {
            kind: kind as u8,
            id,
            width: w,
            height: h,
        };
        self.enqueue(&req)?;

        loop {
            let ev = self.wait()?;

            if ev.is_target(TargetKind::NewSegment)
                && ev.tgt().ioevs[1].iv() as u32 == id
            {
                return self.acquire(kind, self.hidden.flags);
            }

            if ev.is_target(TargetKind::RequestFail)
                && ev.tgt().ioevs[0].iv() as u32 == id
            {
                debug!(target: "shm.subseg", id, "segment request refused");
                return Err(ShmError::RequestFailed(id));
            }

            // the raw number in the event stays valid exactly until the
            // next pump call, so the dup has to happen here
            let fd = if ev.carries_descriptor() {
                core_wire::dup_fd(ev.tgt().ioevs[0].iv(), -1, true)
            } else {
                None
            };
            buffered.push(BufferedEvent { event: ev, fd });

            if buffered.len() > ACQUIRE_POOL_LIMIT {
                debug!(target: "shm.subseg", id, "acquire pool overflow");
                return Err(ShmError::RequestFailed(id));
            }
        }
    }
}
