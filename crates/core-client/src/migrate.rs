//! Crash-resilient migration: rebuild the connection against a new
//! endpoint with window state intact.
//!
//! Only the thread that created the primary context may migrate. The new
//! context re-registers with the cached GUID so the caller's logical
//! identity is stable, buffer contents are carried over when the derived
//! sizes agree, and the mapping is re-established at the old base address
//! when the kernel allows so external references survive. Subsegments are
//! not replayed; the synthetic RESET tells the caller to request fresh
//! ones.

use std::os::fd::AsRawFd;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::{debug, info, warn};

use core_events::TargetKind;
use core_layout::rgba;

use crate::context::{Context, PageKey, register_event};
use crate::resize::ResizeExt;
use crate::{ContextFlags, ResetStatus, SegmentKind, ShmError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateStatus {
    Ok,
    /// Endpoint did not answer; retryable.
    NoConnection,
    /// Broken endpoint name or missing fallback.
    BadArg,
    /// Caller is not the primary thread.
    BadSource,
    /// Connected but the new segment could not be brought up.
    TransferFail,
}

/// Colour written into the video buffers when the old contents could not
/// be carried across, so the anomaly is observable.
const RECOVERY_FILL: core_layout::Pixel = rgba(90, 60, 60, 255);

impl Context {
    /// Migrate to a new endpoint, carrying identity and buffer contents.
    pub fn migrate(&mut self, endpoint: &str) -> Result<(), ShmError> {
        match self.migrate_to(endpoint) {
            MigrateStatus::Ok => Ok(()),
            st => Err(ShmError::Migration(st)),
        }
    }

    pub(crate) fn migrate_to(&mut self, endpoint: &str) -> MigrateStatus {
        if endpoint.is_empty() {
            return MigrateStatus::BadArg;
        }
        if std::thread::current().id() != self.hidden.primary_id {
            return MigrateStatus::BadSource;
        }

        // dial the new endpoint
        let dialed = if core_wire::a12_endpoint(endpoint).is_some() {
            let ks = self.hidden.keystate.as_ref().map(|fd| fd.as_raw_fd());
            core_wire::spawn_relay(endpoint, ks)
        } else {
            core_wire::connect_endpoint(endpoint, None)
        };
        let (sock, keyline) = match dialed {
            Ok(res) => res,
            Err(e) => {
                debug!(target: "shm.migrate", endpoint, error = %e, "dial failed");
                return MigrateStatus::NoConnection;
            }
        };

        // fresh context against the new page; registration is manual so
        // the cached identity survives the reconnect
        let forced = self.hidden.flags
            | ContextFlags::NO_REGISTER
            | ContextFlags::DISABLE_GUARD
            | ContextFlags::NO_ACTIVATE;
        let (map, shm_key) =
            match Context::map_key(&sock, PageKey::parse(&keyline), forced) {
                Ok(r) => r,
                Err(_) => return MigrateStatus::NoConnection,
            };
        let mut fresh = match Context::assemble(
            map,
            sock,
            self.hidden.kind,
            forced,
            Some(self.hidden.guid),
            shm_key,
        ) {
            Ok(c) => c,
            Err(e) => {
                warn!(target: "shm.migrate", error = %e, "segment bring-up failed");
                return MigrateStatus::TransferFail;
            }
        };

        self.hidden.in_migrate = true;

        if self.hidden.kind != SegmentKind::Unknown {
            let ev = register_event(self.hidden.kind, self.hidden.guid);
            let _ = fresh.enqueue(&ev);
        }

        // let the hook release anything pinned to the old mapping
        self.run_reset_hook(ResetStatus::Remap);

        // negotiate the old geometry on the new connection; TPACK and
        // friends change the size math, so hints must travel first
        fresh.hints = self.hints;
        let page = self.map.page();
        let ext = ResizeExt {
            vbuf_cnt: Some(self.hidden.vbuf_cnt as u32),
            abuf_cnt: Some(self.hidden.abuf_cnt as u32),
            abuf_sz: Some(self.abuf_sz as u32),
            samplerate: Some(self.samplerate),
            rows: page.rows.load(Ordering::Acquire),
            cols: page.cols.load(Ordering::Acquire),
            apad: page.apad.load(Ordering::Acquire),
            apad_type: page.apad_type.load(Ordering::Acquire),
        };
        if let Err(e) = fresh.resize_ext(self.w, self.h, ext) {
            debug!(target: "shm.migrate", error = %e, "geometry carry-over rejected");
        }

        // whatever blocked against the old segment is now moot
        core_sync::clear(&page.esync);
        core_sync::clear(&page.vsync);
        core_sync::clear(&page.async_);

        self.copy_av_contents(&mut fresh);

        // detach the watchdog from resources that are about to go away
        self.guard
            .resynch(std::ptr::null_mut(), [std::ptr::null_mut(); 3], 0, -1);

        let old_base = self.map.base_addr();
        let old_sock = self.sock.as_raw_fd();

        // swap the transport, keep identity-bearing state with self
        std::mem::swap(self, &mut fresh);
        std::mem::swap(&mut self.guard, &mut fresh.guard);
        std::mem::swap(&mut self.ctx_lock, &mut fresh.ctx_lock);
        self.hints = fresh.hints;
        self.dirty = fresh.dirty;
        self.hidden.flags = fresh.hidden.flags;
        self.hidden.reset_hook = fresh.hidden.reset_hook.take();
        self.hidden.alt_conn = fresh.hidden.alt_conn.take();
        self.hidden.args = fresh.hidden.args.take();
        self.hidden.keystate = fresh.hidden.keystate.take();
        self.hidden.primary_id = fresh.hidden.primary_id;

        // the old context goes down like a voluntary exit: switch pulled,
        // socket closed, mapping released
        drop(fresh);

        // best effort: bring the new mapping back to the old base so any
        // pointers the caller kept stay valid
        match self.map.try_rebase(old_base) {
            Ok(true) => {}
            Ok(false) => {}
            Err(_) => {
                self.hidden.in_migrate = false;
                return MigrateStatus::TransferFail;
            }
        }

        // re-arm the watchdog against the new page and socket
        self.guard.local_dms.store(true, Ordering::Release);
        self.resynch_guard();
        if !self.hidden.flags.contains(ContextFlags::DISABLE_GUARD)
            && !self.guard.active.load(Ordering::Acquire)
        {
            crate::guard::spawn(self.guard.clone());
        }

        self.hidden.alive = true;
        self.hidden.paused = false;
        self.run_reset_hook(ResetStatus::Remap);
        self.queue_reset_event(old_sock);
        self.hidden.in_migrate = false;

        info!(target: "shm.migrate", endpoint, "migration complete");
        MigrateStatus::Ok
    }

    /// Carry A/V contents into the fresh context when the derived sizes
    /// agree; otherwise make the loss observable.
    fn copy_av_contents(&mut self, fresh: &mut Context) {
        if fresh.vbuf_sz == self.vbuf_sz && self.vbuf_sz != 0 {
            for i in 0..self.hidden.vbuf_cnt.min(fresh.hidden.vbuf_cnt) {
                let (Some(src), Some(dst)) = (
                    self.vbufs.get(i).and_then(|&o| self.map.offset_ptr(o, self.vbuf_sz)),
                    fresh
                        .vbufs
                        .get(i)
                        .and_then(|&o| fresh.map.offset_ptr(o, fresh.vbuf_sz)),
                ) else {
                    continue;
                };
                unsafe { std::ptr::copy_nonoverlapping(src, dst, self.vbuf_sz) };
            }
        } else {
            warn!(target: "shm.migrate",
                old = self.vbuf_sz, new = fresh.vbuf_sz,
                "video buffer size mismatch, filling with recovery colour");
            for px in fresh.video_mut() {
                *px = RECOVERY_FILL;
            }
        }

        if fresh.abuf_sz == self.abuf_sz && fresh.hidden.abuf_cnt == self.hidden.abuf_cnt {
            for i in 0..self.hidden.abuf_cnt {
                let (Some(src), Some(dst)) = (
                    self.abufs.get(i).and_then(|&o| self.map.offset_ptr(o, self.abuf_sz)),
                    fresh
                        .abufs
                        .get(i)
                        .and_then(|&o| fresh.map.offset_ptr(o, fresh.abuf_sz)),
                ) else {
                    continue;
                };
                unsafe { std::ptr::copy_nonoverlapping(src, dst, self.abuf_sz) };
            }
        } else {
            debug!(target: "shm.migrate", "audio parameters changed, buffers dropped");
        }
    }

    /// Implicit recovery path: reconnect to the cached fallback endpoint.
    ///
    /// Refused when the inbound queue carries an EXIT (the peer wants
    /// termination, not migration), when reconnecting was disabled, or -
    /// for forced recovery - while the peer is still demonstrably alive.
    pub(crate) fn fallback_migrate(&mut self, force: bool) -> MigrateStatus {
        if self.inq().scan(|ev| ev.is_target(TargetKind::Exit)) {
            return MigrateStatus::NoConnection;
        }

        // a newer fallback endpoint may already be queued
        let mut newest: Option<String> = None;
        self.inq().scan(|ev| {
            if ev.is_target(TargetKind::DeviceNode) && ev.tgt().ioevs[1].iv() == 4 {
                let msg = ev.message();
                newest = (!msg.is_empty()).then(|| msg.to_string());
            }
            false
        });
        if let Some(ep) = newest {
            self.hidden.alt_conn = Some(ep);
        }

        if force {
            if self.hidden.flags.contains(ContextFlags::NO_AUTO_RECONNECT)
                || self.hidden.kind.is_output()
                || crate::guard::peer_probe(&self.guard)
            {
                return MigrateStatus::NoConnection;
            }
        }

        let Some(primary) = self.hidden.alt_conn.clone() else {
            return MigrateStatus::BadArg;
        };

        let mut current = primary.clone();
        loop {
            let sv = self.migrate_to(&current);
            if sv != MigrateStatus::NoConnection {
                return sv;
            }
            if !force {
                return sv;
            }

            // alternate with whatever fallback the dead connection left us
            if let Some(alt) = &self.hidden.alt_conn {
                if current == primary && *alt != primary {
                    current = alt.clone();
                } else {
                    current = primary.clone();
                }
            }

            if !endpoint_wait(&current) {
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

/// Park until something appears at the endpoint's directory, where the
/// platform offers a way to watch for it.
#[cfg(target_os = "linux")]
fn endpoint_wait(endpoint: &str) -> bool {
    use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};

    if core_wire::a12_endpoint(endpoint).is_some() {
        return false;
    }
    let Some(path) = core_wire::resolve_connpath(endpoint, 0) else {
        return false;
    };
    let Some(dir) = path.parent() else {
        return false;
    };
    let Ok(inotify) = Inotify::init(InitFlags::IN_CLOEXEC) else {
        return false;
    };
    if inotify.add_watch(dir, AddWatchFlags::IN_CREATE).is_err() {
        return false;
    }
    // the directory should be quiet; any create is worth a retry
    inotify.read_events().is_ok()
}

#[cfg(not(target_os = "linux"))]
fn endpoint_wait(_endpoint: &str) -> bool {
    false
}
