//! The event pump: outbound enqueue and the priority-ordered inbound
//! state machine.
//!
//! Inbound priority: delay-slot RESET and coalesced hints first, then the
//! descriptor escrow, then the ring, then liveness. A descriptor-bearing
//! event is withheld until its descriptor has arrived on the socket, and
//! the descriptor from the previous delivery is consumed at the top of the
//! next call, which gives callers a one-event window to take ownership.

use std::os::fd::AsRawFd;
use std::sync::atomic::Ordering;
use std::time::Duration;

use nix::poll::{PollFd, PollFlags, PollTimeout};
use tracing::{debug, trace, warn};

use core_events::merge::{empty_fonthint, merge_displayhint, merge_fonthint};
use core_events::{BAD_FD, Category, EventRecord, ExternalKind, TargetKind};
use core_wire::fdpass::Fetched;

use crate::context::{Context, PendingSegment};
use crate::migrate::MigrateStatus;
use crate::{ContextFlags, SegmentKind, ShmError};

pub(crate) enum Pumped {
    Dead,
    Empty,
    Event(EventRecord),
}

impl Context {
    /// Non-blocking dequeue.
    pub fn poll(&mut self) -> Result<Option<EventRecord>, ShmError> {
        if !self.hidden.alive {
            return Err(ShmError::Dead);
        }
        self.discard_unread_initial();
        match self.process_events(false, false) {
            Pumped::Dead => Err(ShmError::Dead),
            Pumped::Empty => Ok(None),
            Pumped::Event(ev) => {
                trace!(target: "shm.pump", event = %ev, "<-");
                Ok(Some(ev))
            }
        }
    }

    /// Blocking dequeue.
    pub fn wait(&mut self) -> Result<EventRecord, ShmError> {
        if !self.hidden.alive {
            return Err(ShmError::Dead);
        }
        self.discard_unread_initial();
        loop {
            match self.process_events(true, false) {
                Pumped::Dead => return Err(ShmError::Dead),
                Pumped::Empty => continue,
                Pumped::Event(ev) => {
                    trace!(target: "shm.pump", event = %ev, "<-");
                    return Ok(ev);
                }
            }
        }
    }

    /// Wait with a millisecond budget: poll the socket for that long, then
    /// run a normal wait once readable. Returns the event and the leftover
    /// budget, or `None` on timeout.
    pub fn wait_timed(
        &mut self,
        budget: Duration,
    ) -> Result<Option<(EventRecord, Duration)>, ShmError> {
        // state queued internally or on the ring needs no socket traffic
        if self.hidden.ph != 0 || !self.inq().is_empty() {
            return Ok(Some((self.wait()?, budget)));
        }

        let start = std::time::Instant::now();
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(self.sock.as_raw_fd()) };
        let mut pfd = [PollFd::new(
            borrowed,
            PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP,
        )];
        let timeout = PollTimeout::try_from(budget.as_millis().min(u16::MAX as u128) as u16)
            .unwrap_or(PollTimeout::MAX);

        match nix::poll::poll(&mut pfd, timeout) {
            Ok(n) if n > 0 => {
                let left = budget.saturating_sub(start.elapsed());
                Ok(Some((self.wait()?, left)))
            }
            _ => Ok(None),
        }
    }

    /// Readiness probe: which publishes are still awaiting acknowledge.
    /// Bit 1 video, bit 2 audio.
    pub fn signal_status(&self) -> Result<u32, ShmError> {
        if !self.check_dms() {
            return Err(ShmError::Dead);
        }
        let page = self.map.page();
        let mut res = 0;
        if page.vready.load(Ordering::Acquire) != 0 {
            res |= 1;
        }
        if page.aready.load(Ordering::Acquire) != 0 {
            res |= 2;
        }
        Ok(res)
    }

    /// Blocking enqueue. On a dead peer this triggers fallback migration;
    /// the event itself is dropped in that case (recovery is best effort,
    /// the caller learns about the remap through the queued RESET).
    pub fn enqueue(&mut self, ev: &EventRecord) -> Result<(), ShmError> {
        if !self.check_dms() {
            return match self.fallback_migrate(true) {
                MigrateStatus::Ok => Ok(()),
                st => {
                    debug!(target: "shm.pump", status = ?st, "enqueue on dead context");
                    Err(ShmError::Dead)
                }
            };
        }

        // under automatic pause, drain inbound until the unpause arrives
        // so we neither spin nor race it
        if self.hidden.paused {
            let _ = self.process_events(true, true);
        }

        loop {
            if !self.check_dms() {
                return Err(ShmError::Dead);
            }
            if !self.outq().is_full() {
                break;
            }
            debug!(target: "shm.pump", "outqueue full, waiting for drain");
            let page = self.map.page();
            core_sync::post(&page.esync);
            core_sync::wait(&page.esync, || self.check_dms() && self.outq().is_full());
            core_sync::clear(&page.esync);
        }

        let stamped = self.stamp_outbound(ev);
        // REGISTER refreshes the cached identity used on re-register
        // after crash recovery
        if stamped.is_external(ExternalKind::Register) {
            let reg = unsafe { stamped.ext().body.register };
            if reg.guid[0] != 0 || reg.guid[1] != 0 {
                self.hidden.guid = reg.guid;
                if self.hidden.kind == SegmentKind::Unknown {
                    self.hidden.kind = SegmentKind::from_raw(reg.segkind);
                }
            }
        }
        self.outq().produce(&stamped);
        core_wire::ping(self.sock.as_raw_fd());
        trace!(target: "shm.pump", event = %stamped, "->");
        Ok(())
    }

    /// Non-blocking enqueue, callable from secondary threads. Does not
    /// pump the inbound queue, so under automatic pause it refuses rather
    /// than race a pending unpause.
    pub fn try_enqueue(&self, ev: &EventRecord) -> Result<(), ShmError> {
        if !self.check_dms() {
            return Err(ShmError::Dead);
        }
        if self.hidden.paused {
            return Err(ShmError::OutOfSpace);
        }
        if self.outq().is_full() {
            return Err(ShmError::OutOfSpace);
        }
        let stamped = self.stamp_outbound(ev);
        self.outq().produce(&stamped);
        core_wire::ping(self.sock.as_raw_fd());
        Ok(())
    }

    /// Tag outbound EXTERNAL events with the last signalled frame id so
    /// they act as a clock for the receiver.
    fn stamp_outbound(&self, ev: &EventRecord) -> EventRecord {
        let mut out = *ev;
        if out.category() == Some(Category::External) {
            out.ext_mut().frame_id = self.vframe_id.load(Ordering::Relaxed);
        }
        out
    }

    fn discard_unread_initial(&mut self) {
        if self.hidden.initial.is_some() {
            debug!(target: "shm.pump", "unread preroll state discarded");
            self.hidden.initial = None;
        }
    }

    /// Close out the previous delivery's descriptor escrow. The caller had
    /// one event worth of time to dup or take what it needed.
    pub(crate) fn consume_pending(&mut self) {
        if !self.hidden.pev.consumed {
            return;
        }

        if !self.hidden.pev.fds.is_empty() {
            debug!(target: "shm.pump",
                count = self.hidden.pev.fds.len(),
                handed_over = self.hidden.pev.handed_over,
                "closing unclaimed descriptors");
            self.hidden.pev.fds.clear();
        }

        if let Some(seg) = self.hidden.pseg.take() {
            debug!(target: "shm.pump", kind = ?seg.kind,
                "closing unhandled subsegment descriptors");
            drop(seg);
        }

        self.hidden.pev = Default::default();
    }

    /// Attach the escrowed descriptor(s) to the event they pair with.
    /// Returns true when the pairing was absorbed internally and should
    /// not reach the caller as-is.
    fn fd_event(&mut self, ev: &mut EventRecord) -> bool {
        self.hidden.pev.consumed = true;

        if ev.is_target(TargetKind::NewSegment) {
            // descriptor order: control socket, then the page memfd
            let socket = self.hidden.pev.fds.pop_front();
            let page_fd = self.hidden.pev.fds.pop_front();
            let kind = SegmentKind::from_raw(ev.tgt().ioevs[2].iv() as u8);

            if let Some(socket) = socket {
                // mirror the raw numbers so a handover parent can forward
                self.hidden.pev.handed_over = true;
                ev.tgt_mut().ioevs[0].iv = socket.as_raw_fd();
                if let Some(pf) = &page_fd {
                    ev.tgt_mut().ioevs[6].iv = pf.as_raw_fd();
                    let num = format!("{}", pf.as_raw_fd());
                    ev.set_message(&num);
                }
                self.hidden.pseg = Some(PendingSegment {
                    socket,
                    page_fd,
                    kind,
                });
            }
            return true;
        }

        // key-store handle swap: swallow, never forward
        if ev.is_target(TargetKind::DeviceNode) && ev.tgt().ioevs[3].iv() == 3 {
            self.hidden.keystate = self.hidden.pev.fds.pop_front();
            self.hidden.autoclean = true;
            return true;
        }

        if let Some(fd) = self.hidden.pev.fds.front() {
            ev.tgt_mut().ioevs[0].iv = fd.as_raw_fd();
        } else {
            ev.tgt_mut().ioevs[0].iv = BAD_FD;
        }
        false
    }

    /// Duplicate the descriptor of the current escrow for a caller that
    /// wants to keep it past the consume window.
    pub fn dup_pending_fd(&mut self) -> Option<std::os::fd::OwnedFd> {
        let fd = self.hidden.pev.fds.front()?;
        core_wire::dup_fd(fd.as_raw_fd(), -1, true)
    }

    /// Shorter handling cycle for the automatic paused state. Returns true
    /// when the event was absorbed (aggregated or discarded).
    fn pause_event(&mut self, ev: &EventRecord) -> bool {
        if ev.category() != Some(Category::Target) {
            return true;
        }

        match ev.target_kind() {
            Some(TargetKind::Unpause) | Some(TargetKind::Reset) => {
                self.hidden.paused = false;
                true
            }
            Some(TargetKind::Exit) => {
                self.hidden.alive = false;
                false
            }
            Some(TargetKind::DisplayHint) => {
                let mut merged = *ev;
                if self.hidden.ph & 1 != 0 {
                    merge_displayhint(&mut merged, &self.hidden.dh);
                }
                self.hidden.dh = merged;
                self.hidden.ph |= 1;
                true
            }
            Some(TargetKind::FontHint) => {
                if self.hidden.ph & 2 == 0 {
                    self.hidden.fh = empty_fonthint();
                }
                // the descriptor rides the socket; make sure it sits in
                // escrow now so a later fonthint in the same pause cannot
                // overtake it. It may already be there from a stray fetch.
                if ev.tgt().ioevs[1].iv() != 0 {
                    if self.hidden.ph & 2 != 0 {
                        // a descriptor held for a previous pending
                        // fonthint is superseded; drop it, don't leak it
                        self.hidden.pev.fds.clear();
                    }
                    if self.hidden.pev.fds.is_empty() {
                        let fetched = core_wire::fetch_fds(self.sock.as_raw_fd(), true, || {
                            self.check_dms()
                        });
                        if let Fetched::Got(fds) = fetched {
                            self.hidden.pev.fds.extend(fds);
                        }
                    }
                }
                let new = *ev;
                let mut pending = self.hidden.fh;
                merge_fonthint(&mut pending, &new);
                self.hidden.fh = pending;
                self.hidden.ph |= 2;
                true
            }
            _ => true,
        }
    }

    /// Deliver a coalesced pending hint, one flag per call. The fonthint
    /// slot doubles as the delay-slot RESET after migration, which always
    /// runs first on its own bit.
    fn replay_pending(&mut self) -> Option<EventRecord> {
        if self.hidden.ph & 4 != 0 {
            // the fonthint slot was repurposed for the RESET; a pending
            // displayhint still replays on the following call
            self.hidden.ph &= !(4 | 2);
            return Some(self.hidden.fh);
        }
        if self.hidden.ph & 1 != 0 {
            self.hidden.ph &= !1;
            return Some(self.hidden.dh);
        }
        if self.hidden.ph & 2 != 0 {
            self.hidden.ph &= !2;
            let mut ev = self.hidden.fh;
            if let Some(fd) = self.hidden.pev.fds.front() {
                ev.tgt_mut().ioevs[0].iv = fd.as_raw_fd();
                ev.tgt_mut().ioevs[1].iv = 1;
                self.hidden.pev.consumed = true;
            } else {
                ev.tgt_mut().ioevs[0].iv = BAD_FD;
            }
            return Some(ev);
        }
        None
    }

    pub(crate) fn process_events(&mut self, blocking: bool, upret: bool) -> Pumped {
        'reset: loop {
            if !self.hidden.paused {
                if let Some(ev) = self.replay_pending() {
                    return Pumped::Event(ev);
                }
            }

            self.consume_pending();

            // Descriptor stage. The socket is also the blocking wakeup
            // carrier, so the fetch runs even with no event pending; a
            // stray ping with no payload just loops back to the ring.
            'checkfd: loop {
                if self.hidden.pev.fds.is_empty() {
                    let fetched = core_wire::fetch_fds(self.sock.as_raw_fd(), blocking, || {
                        self.check_dms()
                    });
                    match fetched {
                        Fetched::Got(fds) => {
                            self.hidden.pev.fds.extend(fds);
                        }
                        Fetched::WouldBlock => {
                            if self.hidden.pev.got_event {
                                // event withheld until its descriptor lands
                                return Pumped::Empty;
                            }
                        }
                        Fetched::Dead => break 'checkfd,
                    }
                }

                if self.hidden.pev.got_event {
                    if self.hidden.pev.fds.is_empty() {
                        if blocking && self.check_dms() {
                            continue 'checkfd;
                        }
                        if !self.check_dms() {
                            break 'checkfd;
                        }
                        return Pumped::Empty;
                    }
                    let mut ev = self.hidden.pev.ev;
                    let absorbed = self.fd_event(&mut ev);
                    self.hidden.pev.got_event = false;
                    if absorbed && self.hidden.autoclean {
                        self.hidden.autoclean = false;
                        self.consume_pending();
                        continue 'reset;
                    }
                    return Pumped::Event(ev);
                }
                break 'checkfd;
            }

            // Ring stage.
            if let Some(mut ev) = self.inq().consume() {
                if self.hidden.paused {
                    if self.pause_event(&ev) {
                        continue 'reset;
                    }
                    // only EXIT falls through; it is the last event ever
                    return Pumped::Event(ev);
                }

                if ev.category() == Some(Category::Target) {
                    match self.filter_target(&mut ev, upret) {
                        Filtered::Deliver => return Pumped::Event(ev),
                        Filtered::Restart => continue 'reset,
                        Filtered::Escrow => {
                            self.hidden.pev.ev = ev;
                            self.hidden.pev.got_event = true;
                            continue 'reset;
                        }
                        Filtered::Return0 => return Pumped::Empty,
                    }
                }
                return Pumped::Event(ev);
            }

            // Liveness stage.
            if !self.check_dms() {
                return match self.fallback_migrate(true) {
                    // the synthetic RESET is queued; report empty and let
                    // the next dequeue deliver it first
                    MigrateStatus::Ok => Pumped::Empty,
                    _ => Pumped::Dead,
                };
            }

            if blocking {
                continue 'reset;
            }
            return Pumped::Empty;
        }
    }

    fn filter_target(&mut self, ev: &mut EventRecord, upret: bool) -> Filtered {
        match ev.target_kind() {
            // ignore a displayhint when a newer mergeable one is queued;
            // the preroll stage wants them all, so only filter once the
            // initial state has been consumed
            Some(TargetKind::DisplayHint) => {
                if self.hidden.initial.is_none() {
                    let old = *ev;
                    let merged = self.inq().scan_mut(|queued| {
                        queued.is_target(TargetKind::DisplayHint)
                            && merge_displayhint(queued, &old)
                    });
                    if merged {
                        return Filtered::Restart;
                    }
                }
                Filtered::Deliver
            }

            Some(TargetKind::StepFrame) => {
                let id = ev.tgt().ioevs[1].iv();
                // conservative dedup: vblank-ish sources only
                if (id == 2 || id == 3) && self.scan_stepframe(id) {
                    Filtered::Restart
                } else {
                    Filtered::Deliver
                }
            }

            Some(TargetKind::Pause) => {
                if !self.hidden.flags.contains(ContextFlags::MANUAL_PAUSE) {
                    self.hidden.paused = true;
                    return Filtered::Restart;
                }
                Filtered::Deliver
            }

            Some(TargetKind::Unpause) => {
                if !self.hidden.flags.contains(ContextFlags::MANUAL_PAUSE) {
                    if upret {
                        return Filtered::Return0;
                    }
                    self.hidden.paused = false;
                    return Filtered::Restart;
                }
                Filtered::Deliver
            }

            Some(TargetKind::BufferFail) => {
                debug!(target: "shm.pump", "accelerated handle passing rejected");
                self.hidden.no_accel = true;
                Filtered::Restart
            }

            Some(TargetKind::Exit) => {
                // never drop the context here: the A/V side may run on a
                // different thread; just refuse everything after this
                self.hidden.alive = false;
                Filtered::Deliver
            }

            // the descriptor is conditional on the carry word
            Some(TargetKind::FontHint) => {
                if ev.tgt().ioevs[1].iv() == 1 {
                    Filtered::Escrow
                } else {
                    ev.tgt_mut().ioevs[0].iv = BAD_FD;
                    Filtered::Deliver
                }
            }

            Some(TargetKind::DeviceNode) => self.filter_device_node(ev),

            Some(TargetKind::NewSegment) => {
                self.hidden.autoclean = ev.tgt().ioevs[5].iv() != 0;
                Filtered::Escrow
            }

            Some(TargetKind::Store)
            | Some(TargetKind::Restore)
            | Some(TargetKind::BchunkIn)
            | Some(TargetKind::BchunkOut) => Filtered::Escrow,

            _ => Filtered::Deliver,
        }
    }

    fn filter_device_node(&mut self, ev: &mut EventRecord) -> Filtered {
        let subkind = ev.tgt().ioevs[1].iv();
        match subkind {
            // alternate connection endpoint, possibly with a new identity
            4 => {
                let guid = [
                    (ev.tgt().ioevs[2].uv() as u64) | ((ev.tgt().ioevs[3].uv() as u64) << 32),
                    (ev.tgt().ioevs[4].uv() as u64) | ((ev.tgt().ioevs[5].uv() as u64) << 32),
                ];
                if (guid[0] != 0 || guid[1] != 0) && guid != self.hidden.guid {
                    self.hidden.guid = guid;
                }
                let msg = ev.message();
                self.hidden.alt_conn = if msg.is_empty() {
                    None
                } else {
                    Some(msg.to_string())
                };
                Filtered::Restart
            }
            // render node switch; key-store swap is gated on word 3
            1 => {
                if ev.tgt().ioevs[3].iv() == 3 {
                    Filtered::Escrow
                } else {
                    Filtered::Deliver
                }
            }
            // connection-point switch: migrate in place when the target is
            // named, otherwise the descriptor names the new connection
            2 | 3 => {
                if ev.message().is_empty() {
                    Filtered::Escrow
                } else {
                    let target = ev.message().to_string();
                    match self.migrate_to(&target) {
                        MigrateStatus::Ok => Filtered::Restart,
                        st => {
                            warn!(target: "shm.pump", status = ?st,
                                "server-directed migration failed");
                            Filtered::Return0
                        }
                    }
                }
            }
            _ => Filtered::Restart,
        }
    }

    fn scan_stepframe(&self, id: i32) -> bool {
        self.inq().scan(|queued| {
            queued.is_target(TargetKind::StepFrame) && queued.tgt().ioevs[1].iv() == id
        })
    }

    /// Queue the synthetic RESET that informs the caller about a remap.
    /// Delivered before anything else on the next dequeue.
    pub(crate) fn queue_reset_event(&mut self, old_fd: i32) {
        // a pending fonthint descriptor is useless on the new connection
        if self.hidden.ph & 2 != 0 {
            self.hidden.pev.fds.clear();
        }
        let mut ev = EventRecord::target(TargetKind::Reset);
        ev.tgt_mut().ioevs[0].iv = 3;
        ev.tgt_mut().ioevs[1].iv = old_fd;
        self.hidden.fh = ev;
        self.hidden.ph = (self.hidden.ph & 1) | 4;
    }
}

enum Filtered {
    Deliver,
    Restart,
    Escrow,
    Return0,
}
