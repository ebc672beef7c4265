//! Resize and renegotiation.
//!
//! The client writes the desired geometry into the page, raises the
//! resize word and waits for the server to apply or reject it. A resize
//! is either fully applied (every derived pointer recomputed, word back
//! to zero) or cleanly rejected (word at -1, old layout intact).

use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::{debug, trace};

use core_layout::{
    ABUF_LIMIT, DEFAULT_ABUF_SZ, DEFAULT_SAMPLERATE, HintFlags, LayoutError, MAX_H, MAX_W,
    PageGeometry, VBUF_LIMIT,
};

use crate::context::Context;
use crate::migrate::MigrateStatus;
use crate::{ResetStatus, ShmError};

/// Extended negotiation parameters; `None` keeps the current value.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResizeExt {
    pub vbuf_cnt: Option<u32>,
    pub abuf_cnt: Option<u32>,
    pub abuf_sz: Option<u32>,
    /// `Some(0)` resets to the default rate.
    pub samplerate: Option<u32>,
    pub rows: u32,
    pub cols: u32,
    /// Extended-protocol block: reserved byte count and type tag
    /// (colour ramps, HDR metadata, and friends live there).
    pub apad: u32,
    pub apad_type: u32,
}

impl Context {
    pub fn resize(&mut self, w: u32, h: u32) -> Result<(), ShmError> {
        let page = self.map.page();
        let ext = ResizeExt {
            rows: page.rows.load(Ordering::Acquire),
            cols: page.cols.load(Ordering::Acquire),
            apad: page.apad.load(Ordering::Acquire),
            apad_type: page.apad_type.load(Ordering::Acquire),
            ..Default::default()
        };
        self.resize_ext(w, h, ext)
    }

    pub fn resize_ext(&mut self, w: u32, h: u32, ext: ResizeExt) -> Result<(), ShmError> {
        if w > MAX_W || h > MAX_H {
            return Err(LayoutError::BadDimensions(w, h).into());
        }
        self.map.page().integrity_check()?;

        // resize on a dead context triggers recovery first
        if !self.check_dms() {
            self.run_reset_hook(ResetStatus::Lost);
            if self.fallback_migrate(true) != MigrateStatus::Ok {
                return Err(ShmError::Dead);
            }
        }

        // wait out any unacknowledged publishes
        self.drain_ready()?;

        let w = w.max(1);
        let h = h.max(1);
        let vidc = ext
            .vbuf_cnt
            .unwrap_or(self.hidden.vbuf_cnt as u32)
            .clamp(1, VBUF_LIMIT as u32);
        let audc = ext
            .abuf_cnt
            .unwrap_or(self.hidden.abuf_cnt as u32)
            .clamp(1, ABUF_LIMIT as u32);
        let abufsz = match ext.abuf_sz {
            Some(0) | None => self.abuf_sz.max(DEFAULT_ABUF_SZ as usize) as u32,
            Some(sz) => sz,
        };

        let page = self.map.page();
        let dimensions_changed = w != self.w || h != self.h;
        let grid_changed = ext.rows != page.rows.load(Ordering::Acquire)
            || ext.cols != page.cols.load(Ordering::Acquire);
        let bufcnt_changed =
            vidc as usize != self.hidden.vbuf_cnt || audc as usize != self.hidden.abuf_cnt;
        let hints_changed =
            page.hints.load(Ordering::Acquire) != self.hints.bits();
        let bufsz_changed = abufsz as usize != self.abuf_sz;
        let meta_changed = ext.apad as usize != page.apad.load(Ordering::Acquire) as usize
            || ext.apad_type != page.apad_type.load(Ordering::Acquire);

        // don't negotiate unless the goals have changed
        if !self.vbufs.is_empty()
            && !dimensions_changed
            && !grid_changed
            && !bufcnt_changed
            && !hints_changed
            && !bufsz_changed
            && !meta_changed
        {
            self.run_reset_hook(ResetStatus::NoChange);
            return Ok(());
        }

        // local bound check first, shrinking the chain before failing
        let mut geom = PageGeometry {
            w,
            h,
            rows: ext.rows,
            cols: ext.cols,
            hints: self.hints,
            vbuf_cnt: vidc as usize,
            abuf_cnt: audc as usize,
            abuf_sz: abufsz as usize,
            apad: ext.apad as usize,
        };
        let vidc = match geom.validate() {
            Ok(()) => vidc,
            Err(LayoutError::SizeOverflow { .. }) => {
                geom.vbuf_cnt = 1;
                geom.validate()?;
                1
            }
            Err(e) => return Err(e.into()),
        };

        trace!(target: "shm.resize",
            w, h, vidc, audc, rows = ext.rows, cols = ext.cols, "negotiating");

        // strict ordering across the process boundary: geometry first,
        // request flag last
        page.hints.store(self.hints.bits(), Ordering::Release);
        match ext.samplerate {
            None => {}
            Some(0) => page.audiorate.store(DEFAULT_SAMPLERATE, Ordering::Release),
            Some(r) => page.audiorate.store(r, Ordering::Release),
        }
        page.w.store(w, Ordering::Release);
        page.h.store(h, Ordering::Release);
        page.rows.store(ext.rows, Ordering::Release);
        page.cols.store(ext.cols, Ordering::Release);
        page.abufsize.store(abufsz, Ordering::Release);
        page.apad.store(ext.apad, Ordering::Release);
        page.apad_type.store(ext.apad_type, Ordering::Release);
        // the pending words park the requested chain depths until the
        // acknowledge, then revert to ownership bitmaps
        page.apending.store(audc, Ordering::Release);
        page.vpending.store(vidc, Ordering::Release);

        page.resized.store(1, Ordering::Release);
        core_sync::post(&page.vsync);

        // the server-side apply is roughly a vblank away; poll with a
        // bounded wait rather than sleeping blind
        loop {
            if page.resized.load(Ordering::Acquire) <= 0 {
                break;
            }
            if !self.check_dms() {
                break;
            }
            if !core_sync::trywait(&page.vsync, || self.check_dms()) {
                std::thread::sleep(Duration::from_millis(16));
            }
        }

        if !self.check_dms() {
            self.run_reset_hook(ResetStatus::NoChange);
            self.run_reset_hook(ResetStatus::Lost);
            let _ = self.fallback_migrate(true);
            return Err(ShmError::Dead);
        }

        if page.resized.load(Ordering::Acquire) == -1 {
            page.resized.store(0, Ordering::Release);
            debug!(target: "shm.resize", "server rejected the negotiation");
            self.run_reset_hook(ResetStatus::NoChange);
            return Err(ShmError::ResizeRejected);
        }

        // apply: remap when the authoritative size changed, then re-derive
        // everything from the prefix
        let new_size = page.segment_size.load(Ordering::Acquire) as usize;
        let mut moved = false;
        if new_size != self.map.len() {
            // the watchdog holds a pointer into the old mapping
            {
                let _lock = self.guard.synch.lock().unwrap_or_else(|e| e.into_inner());
                moved = self.map.remap(new_size)?;
            }
            self.resynch_guard();
        }

        if self.hints.contains(HintFlags::AUTH_TOKEN) {
            self.hidden.auth_token = self.map.page().vpts.load(Ordering::Acquire);
        }

        self.setup_avbuf();
        self.run_reset_hook(if moved {
            ResetStatus::Remap
        } else {
            ResetStatus::NoChange
        });
        Ok(())
    }

    /// Block until previously published buffers have been acknowledged.
    fn drain_ready(&mut self) -> Result<(), ShmError> {
        loop {
            let page = self.map.page();
            let vready = page.vready.load(Ordering::Acquire) != 0;
            let aready = page.aready.load(Ordering::Acquire) != 0;
            if !vready && !aready {
                return Ok(());
            }
            if !self.check_dms() {
                // the wait can be long; the peer may die inside it
                self.run_reset_hook(ResetStatus::Lost);
                if self.fallback_migrate(true) != MigrateStatus::Ok {
                    return Err(ShmError::Dead);
                }
                continue;
            }
            // the wait condition is folded into the liveness closure so a
            // consume that lands between the check and the arm cannot
            // strand us on a slot nobody will clear
            if vready {
                core_sync::post(&page.vsync);
                core_sync::wait(&page.vsync, || {
                    self.check_dms() && page.vready.load(Ordering::Acquire) != 0
                });
                core_sync::clear(&page.vsync);
            } else {
                core_sync::post(&page.async_);
                core_sync::wait(&page.async_, || {
                    self.check_dms() && page.aready.load(Ordering::Acquire) != 0
                });
                core_sync::clear(&page.async_);
            }
        }
    }
}
