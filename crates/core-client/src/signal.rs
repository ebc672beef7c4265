//! The signal pump: publish video/audio buffers and rotate the chain.

use std::os::fd::{AsRawFd, BorrowedFd};
use std::sync::atomic::Ordering;

use tracing::{debug, trace};

use core_events::{EventRecord, ExternalKind, time_millis};
use core_layout::{HintFlags, Pixel, Region};

use crate::context::Context;
use crate::{ShmError, SignalMask};

/// What a publish step did and whether the chain forces a wait.
struct Stepped {
    published: bool,
    must_wait: bool,
}

impl Context {
    /// Publish the current video and/or audio buffer per `mask`. Returns
    /// the time spent blocked, in milliseconds.
    pub fn signal(&mut self, mask: SignalMask) -> Result<u64, ShmError> {
        let page = self.map.page();

        // output-direction segments consume rather than produce; their
        // acknowledge is clearing the ready words
        if self.hidden.kind.is_output() {
            if mask.contains(SignalMask::VIDEO) {
                page.vready.store(0, Ordering::Release);
            }
            if mask.contains(SignalMask::AUDIO) {
                page.aready.store(0, Ordering::Release);
            }
            return Ok(0);
        }

        if self.hidden.in_migrate {
            return Ok(0);
        }

        if !self.check_dms() {
            self.abuf_pos = 0;
            let _ = self.fallback_migrate(true);
            return Ok(0);
        }

        let start = time_millis();

        if mask.contains(SignalMask::AUDIO) {
            let step = self.step_audio();
            if step.published {
                let page = self.map.page();
                if step.must_wait && !mask.contains(SignalMask::NONBLOCK) {
                    core_sync::post(&page.async_);
                    core_sync::wait(&page.async_, || {
                        self.check_dms() && page.aready.load(Ordering::Acquire) != 0
                    });
                    core_sync::clear(&page.async_);
                } else {
                    core_sync::trywait(&page.async_, || self.check_dms());
                }
            }
        }

        if mask.contains(SignalMask::VIDEO) {
            // with subregion transfers the server reads the rectangle out
            // of the page, so the previous publish must be fully consumed
            // before the rectangle may change under it
            if self.hints.contains(HintFlags::SUBREGION) {
                let page = self.map.page();
                while page.vready.load(Ordering::Acquire) != 0 && self.check_dms() {
                    core_sync::post(&page.vsync);
                    core_sync::wait(&page.vsync, || {
                        self.check_dms() && page.vready.load(Ordering::Acquire) != 0
                    });
                    core_sync::clear(&page.vsync);
                }
            }

            let step = self.step_video(mask);
            if step.published {
                let page = self.map.page();
                if step.must_wait && !mask.contains(SignalMask::NONBLOCK) {
                    while page.vready.load(Ordering::Acquire) != 0 && self.check_dms() {
                        core_sync::post(&page.vsync);
                        core_sync::wait(&page.vsync, || {
                            self.check_dms() && page.vready.load(Ordering::Acquire) != 0
                        });
                        core_sync::clear(&page.vsync);
                    }
                } else {
                    core_sync::trywait(&page.vsync, || self.check_dms());
                }
            }
        }

        Ok(time_millis().saturating_sub(start))
    }

    /// Pass an accelerated buffer plane out-of-band, then publish. Up to
    /// four planes travel by repeating this with a decrementing
    /// `planes_left`; the signal itself should ride the last plane.
    pub fn signal_handle(
        &mut self,
        fd: BorrowedFd,
        stride: u32,
        format: u32,
        planes_left: u8,
        mask: SignalMask,
    ) -> Result<u64, ShmError> {
        if self.hidden.no_accel {
            debug!(target: "shm.signal", "handle passing disabled after BUFFER_FAIL");
            return Ok(0);
        }
        core_wire::push_fd(self.sock.as_raw_fd(), Some(fd))?;

        let mut ev = EventRecord::external(ExternalKind::BufferStream);
        ev.ext_mut().body.bstream = core_events::BufferStreamBody {
            width: self.w,
            height: self.h,
            stride,
            format,
            planes_left,
        };
        self.enqueue(&ev)?;

        if planes_left > 0 {
            return Ok(0);
        }
        self.signal(mask)
    }

    fn step_video(&mut self, mask: SignalMask) -> Stepped {
        let page = self.map.page();
        page.hints.store(self.hints.bits(), Ordering::Release);
        self.vframe_id.fetch_add(1, Ordering::Relaxed);

        if self.hints.contains(HintFlags::SUBREGION) {
            // trim the region against the previous buffer when asked and
            // possible (populated chain of at least two)
            if mask.contains(SignalMask::AUTO_DIRTY)
                && self.hidden.nbuf_active
                && self.hidden.vbuf_cnt > 1
            {
                match self.auto_dirty_region() {
                    Some(region) => self.dirty = region,
                    None => {
                        trace!(target: "shm.signal", "auto-region: no-op");
                        return Stepped {
                            published: false,
                            must_wait: false,
                        };
                    }
                }
            }

            if !self.dirty.is_valid() {
                self.dirty = Region::full(self.w, self.h);
            }
            page.dirty.store(self.dirty);

            // invalidate so repeat signals without new damage are inert
            self.dirty = Region::inverted(self.w, self.h);
        }

        let ind = self.hidden.vbuf_ind;
        let pending = page.vpending.fetch_or(1 << ind, Ordering::Release);
        page.vready.store(ind as u32 + 1, Ordering::Release);

        // slide the window so the caller never cares which buffer it is on
        self.hidden.vbuf_ind = (ind + 1) % self.hidden.vbuf_cnt;
        self.hidden.nbuf_active = true;

        let must_wait =
            self.hidden.vbuf_cnt == 1 || (pending & (1 << self.hidden.vbuf_ind)) != 0;
        trace!(target: "shm.signal",
            frame = self.vframe_id.load(Ordering::Relaxed), buffer = ind, "video published");
        Stepped {
            published: true,
            must_wait,
        }
    }

    fn step_audio(&mut self) -> Stepped {
        if self.abuf_pos == 0 {
            return Stepped {
                published: false,
                must_wait: false,
            };
        }
        let used =
            (self.abuf_pos * size_of::<core_layout::AudioSample>()) as u32;
        let page = self.map.page();
        let ind = self.hidden.abuf_ind;

        let mut pending = page.apending.fetch_or(1 << ind, Ordering::Release);
        pending |= 1 << ind;
        page.abufused[ind].store(used, Ordering::Release);
        page.aready.store(ind as u32 + 1, Ordering::Release);

        self.hidden.abuf_ind = (ind + 1) % self.hidden.abuf_cnt;
        self.abuf_pos = 0;

        let must_wait =
            self.hidden.abuf_cnt == 1 || (pending & (1 << self.hidden.abuf_ind)) != 0;
        Stepped {
            published: true,
            must_wait,
        }
    }

    /// Minimal bounding rectangle of the 32-bit differences between the
    /// working buffer and its predecessor. Full-word comparison, alpha
    /// included. `None` when the buffers are identical.
    fn auto_dirty_region(&self) -> Option<Region> {
        let cur_ind = self.hidden.vbuf_ind;
        let prev_ind = if cur_ind == 0 {
            self.hidden.vbuf_cnt - 1
        } else {
            cur_ind - 1
        };

        let span = (self.w as usize) * (self.h as usize);
        let cur = self.buffer_slice(cur_ind, span)?;
        let prev = self.buffer_slice(prev_ind, span)?;

        let w = self.w as usize;
        let h = self.h as usize;

        // scan rows in from both ends, then columns within the row band;
        // the reduced y-range keeps the column scans cache friendly
        let mut y1 = None;
        for y in 0..h {
            if cur[y * w..(y + 1) * w] != prev[y * w..(y + 1) * w] {
                y1 = Some(y);
                break;
            }
        }
        let y1 = y1?;

        let mut y2 = y1;
        for y in (y1..h).rev() {
            if cur[y * w..(y + 1) * w] != prev[y * w..(y + 1) * w] {
                y2 = y;
                break;
            }
        }

        let differs_col = |x: usize| -> bool {
            (y1..=y2).any(|y| cur[y * w + x] != prev[y * w + x])
        };
        let mut x1 = 0;
        for x in 0..w {
            if differs_col(x) {
                x1 = x;
                break;
            }
        }
        let mut x2 = x1;
        for x in (x1..w).rev() {
            if differs_col(x) {
                x2 = x;
                break;
            }
        }

        Some(Region {
            x1: x1 as u32,
            y1: y1 as u32,
            x2: x2 as u32 + 1,
            y2: y2 as u32 + 1,
        })
    }

    fn buffer_slice(&self, ind: usize, span: usize) -> Option<&[Pixel]> {
        let ofs = *self.vbufs.get(ind)?;
        let ptr = self.map.offset_ptr(ofs, self.vbuf_sz)?;
        if span * size_of::<Pixel>() > self.vbuf_sz {
            debug!(target: "shm.signal", "buffer span exceeds derived size");
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts(ptr as *const Pixel, span) })
    }
}
