//! Preroll: gather the initial hint burst before the main loop starts.
//!
//! Between acquire and the first frame the server sends display geometry,
//! density, fonts, colour table, output rate, geolocation, render node and
//! stdio mappings, terminated by ACTIVATE. Everything is stashed into an
//! [`Initial`], with every descriptor duplicated so it survives past the
//! pump's one-event consume window. The structure is delivered once via
//! [`Context::take_initial`]; pumping events with it unread discards it.

use std::os::fd::OwnedFd;

use tracing::debug;

use core_events::{Category, TargetKind};
use core_layout::DEFAULT_PPCM;

use crate::context::Context;
use crate::ShmError;

/// One prerolled font: descriptor, size and hinting mode.
#[derive(Debug, Default)]
pub struct FontSlot {
    pub fd: Option<OwnedFd>,
    pub size_mm: f32,
    pub hinting: i32,
}

/// One colour-table slot from GRAPHMODE.
#[derive(Debug, Clone, Copy, Default)]
pub struct ColorSlot {
    pub fg: [u8; 3],
    pub bg: [u8; 3],
    pub fg_set: bool,
    pub bg_set: bool,
}

/// Initial display/environment state, defaults per the protocol.
#[derive(Debug)]
pub struct Initial {
    pub display_width_px: u32,
    pub display_height_px: u32,
    /// Output refresh rate in Hz.
    pub rate: u32,
    /// Pixels per centimetre.
    pub density: f32,
    pub cell_w: u32,
    pub cell_h: u32,
    pub render_node: Option<OwnedFd>,
    pub fonts: [FontSlot; 4],
    pub colors: [ColorSlot; 12],
    pub latitude: f32,
    pub longitude: f32,
    pub elevation: f32,
    pub country: [u8; 4],
    pub lang: [u8; 4],
    pub text_lang: [u8; 4],
    pub timezone: i32,
}

impl Default for Initial {
    fn default() -> Self {
        Self {
            display_width_px: 0,
            display_height_px: 0,
            rate: 0,
            density: DEFAULT_PPCM,
            cell_w: 0,
            cell_h: 0,
            render_node: None,
            fonts: [
                FontSlot {
                    fd: None,
                    size_mm: 3.527_780,
                    hinting: 0,
                },
                FontSlot::default(),
                FontSlot::default(),
                FontSlot::default(),
            ],
            colors: [ColorSlot::default(); 12],
            latitude: 51.48,
            longitude: 0.001_475,
            elevation: 0.0,
            country: *b"GBR\0",
            lang: *b"ENG\0",
            text_lang: *b"ENG\0",
            timezone: 0,
        }
    }
}

impl Context {
    /// Run the preroll stage by hand, for contexts built from an
    /// inherited socket where `open` never ran. With `resize_after` the
    /// context is resized to the prerolled geometry on ACTIVATE.
    pub fn preroll(&mut self, resize_after: bool) -> Result<(), ShmError> {
        preroll_loop(self, resize_after)
    }

    /// For NO_REGISTER openings: submit the caller-built REGISTER, then
    /// run the preroll the registration unblocks server-side.
    pub fn defer_register(
        &mut self,
        ev: &core_events::EventRecord,
    ) -> Result<(), ShmError> {
        self.enqueue(ev)?;
        preroll_loop(self, true)
    }
}

/// Drive the pump until ACTIVATE, folding the hint burst into the
/// context's initial slot.
pub(crate) fn preroll_loop(ctx: &mut Context, resize_after: bool) -> Result<(), ShmError> {
    let mut init = Initial::default();
    let mut w = 640u32;
    let mut h = 480u32;
    let mut font_ind = 0usize;

    loop {
        let ev = ctx.wait()?;
        if ev.category() != Some(Category::Target) {
            continue;
        }

        match ev.target_kind() {
            Some(TargetKind::Activate) => {
                if resize_after {
                    if let Err(e) = ctx.resize(w, h) {
                        debug!(target: "shm.preroll", error = %e, "activate resize refused");
                    }
                }
                ctx.hidden.initial = Some(init);
                return Ok(());
            }

            Some(TargetKind::DisplayHint) => {
                if ev.tgt().ioevs[0].iv() != 0 {
                    w = ev.tgt().ioevs[0].iv() as u32;
                }
                if ev.tgt().ioevs[1].iv() != 0 {
                    h = ev.tgt().ioevs[1].iv() as u32;
                }
                if ev.tgt().ioevs[4].fv() > 0.0001 {
                    init.density = ev.tgt().ioevs[4].fv();
                }
                if ev.tgt().ioevs[5].iv() != 0 {
                    init.cell_w = ev.tgt().ioevs[5].iv() as u32;
                }
                if ev.tgt().ioevs[6].iv() != 0 {
                    init.cell_h = ev.tgt().ioevs[6].iv() as u32;
                }
            }

            Some(TargetKind::OutputHint) => {
                if ev.tgt().ioevs[0].iv() != 0 {
                    init.display_width_px = ev.tgt().ioevs[0].iv() as u32;
                }
                if ev.tgt().ioevs[1].iv() != 0 {
                    init.display_height_px = ev.tgt().ioevs[1].iv() as u32;
                }
                if ev.tgt().ioevs[2].iv() != 0 {
                    init.rate = ev.tgt().ioevs[2].iv() as u32;
                }
            }

            Some(TargetKind::GraphMode) => {
                let word = ev.tgt().ioevs[0].iv();
                let bg = (word & 256) != 0;
                let slot = (word & !256) as usize;
                if slot < init.colors.len() {
                    let entry = &mut init.colors[slot];
                    let dst = if bg {
                        entry.bg_set = true;
                        &mut entry.bg
                    } else {
                        entry.fg_set = true;
                        &mut entry.fg
                    };
                    dst[0] = ev.tgt().ioevs[1].fv() as u8;
                    dst[1] = ev.tgt().ioevs[2].fv() as u8;
                    dst[2] = ev.tgt().ioevs[3].fv() as u8;
                }
            }

            Some(TargetKind::DeviceNode) => {
                if ev.tgt().ioevs[0].iv() != -1 {
                    init.render_node = ctx.dup_pending_fd();
                }
            }

            Some(TargetKind::FontHint) => {
                // font slots append; size zero is not a legal override
                if font_ind < init.fonts.len() {
                    init.fonts[font_ind].hinting = ev.tgt().ioevs[3].iv();
                    if ev.tgt().ioevs[2].fv() > 0.0 {
                        init.fonts[font_ind].size_mm = ev.tgt().ioevs[2].fv();
                    }
                    if ev.tgt().ioevs[0].iv() != -1 {
                        init.fonts[font_ind].fd = ctx.dup_pending_fd();
                        font_ind += 1;
                    }
                }
            }

            // stdio remappings stay across exec, so no CLOEXEC here
            Some(TargetKind::BchunkIn) => {
                if ev.message() == "stdin" {
                    let _ = core_wire::dup_fd(ev.tgt().ioevs[0].iv(), 0, true)
                        .map(std::mem::forget);
                }
            }
            Some(TargetKind::BchunkOut) => {
                if ev.message() == "stdout" {
                    let _ = core_wire::dup_fd(ev.tgt().ioevs[0].iv(), 1, true)
                        .map(std::mem::forget);
                }
            }

            Some(TargetKind::GeoHint) => {
                init.latitude = ev.tgt().ioevs[0].fv();
                init.longitude = ev.tgt().ioevs[1].fv();
                init.elevation = ev.tgt().ioevs[2].fv();
                let country = ev.tgt().ioevs[3].cv();
                if country[0] != 0 {
                    init.country[..3].copy_from_slice(&country[..3]);
                }
                let lang = ev.tgt().ioevs[4].cv();
                if lang[0] != 0 {
                    init.lang[..3].copy_from_slice(&lang[..3]);
                }
                let text_lang = ev.tgt().ioevs[5].cv();
                if text_lang[0] != 0 {
                    init.text_lang[..3].copy_from_slice(&text_lang[..3]);
                }
                init.timezone = ev.tgt().ioevs[6].iv();
            }

            _ => {}
        }
    }
}
