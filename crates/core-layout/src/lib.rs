//! Byte-exact layout of the process-shared page and the geometry math
//! derived from it.
//!
//! The page is the single source of truth for negotiated geometry. Offsets
//! of named fields are frozen: new fields may only be appended, and the
//! [`page_cookie`] constant folds the critical offsets so that two builds
//! with diverging layouts refuse to talk to each other.

use std::mem::offset_of;
use std::sync::atomic::{AtomicI8, AtomicU8, AtomicU32, AtomicU64, Ordering};

use core_events::EventRecord;

pub mod region;

pub use region::Region;

/// Layout revision. Bumping either number invalidates peers.
pub const VERSION_MAJOR: u8 = 1;
pub const VERSION_MINOR: u8 = 0;

/// Ring capacity in records; front/back advance modulo this.
pub const QUEUE_SZ: usize = 127;

/// Upper bound on the negotiated video buffer chain.
pub const VBUF_LIMIT: usize = 4;

/// Upper bound on the negotiated audio buffer chain.
pub const ABUF_LIMIT: usize = 8;

/// Dimension caps; a resize beyond these is rejected locally.
pub const MAX_W: u32 = 8192;
pub const MAX_H: u32 = 8192;

/// Initial mapping size before `segment_size` has been read.
pub const START_SZ: usize = 512 * 1024;

/// Platform cap on the total page size.
pub const MAX_PAGE_SZ: usize = 64 * 1024 * 1024;

/// Fixed capacity of the last-words buffer.
pub const LAST_WORDS_SZ: usize = 256;

/// Audio defaults used when the negotiation leaves a field at zero.
pub const DEFAULT_SAMPLERATE: u32 = 48_000;
pub const DEFAULT_ABUF_SZ: u32 = 16_384;

/// Default output density in pixels per centimetre.
pub const DEFAULT_PPCM: f32 = 28.346_457;

/// Bytes per cell for the text-pack transfer mode.
pub const TPACK_CELL_SZ: usize = 16;

/// Alignment of every buffer carved out of the page.
const BUF_ALIGN: usize = 64;

/// Video pixel: 8-bit RGBA packed little-endian.
pub type Pixel = u32;

/// Bytes per video pixel.
pub const VCHANNELS: usize = 4;

/// Audio sample: signed 16-bit interleaved.
pub type AudioSample = i16;

pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Pixel {
    (r as u32) | (g as u32) << 8 | (b as u32) << 16 | (a as u32) << 24
}

bitflags::bitflags! {
    /// Transfer hints stored in the page hint word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HintFlags: u32 {
        /// Only the dirty rectangle of the buffer changed.
        const SUBREGION     = 1;
        /// Buffer rows run bottom-up.
        const ORIGO_LL      = 2;
        /// Alpha channel is carried but meaningless.
        const IGNORE_ALPHA  = 4;
        /// Buffer holds text-pack cells rather than pixels.
        const TPACK         = 8;
        /// Client requests a device authentication token via `vpts`.
        const AUTH_TOKEN    = 16;
        /// Client wants a STEPFRAME event per consumed video signal.
        const VSIGNAL_EVENT = 32;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LayoutError {
    #[error("page cookie mismatch (expected {expected:#x}, found {found:#x})")]
    CookieMismatch { expected: u64, found: u64 },
    #[error("page version mismatch (peer is {0}.{1})")]
    VersionMismatch(u8, u8),
    #[error("requested layout of {required} bytes exceeds the {max} byte cap")]
    SizeOverflow { required: usize, max: usize },
    #[error("dimensions {0}x{1} outside the supported range")]
    BadDimensions(u32, u32),
}

/// One of the two event rings embedded in the page.
#[repr(C)]
pub struct EventRing {
    pub front: AtomicU8,
    pub back: AtomicU8,
    _pad: [u8; 6],
    pub evqueue: [EventRecord; QUEUE_SZ],
}

/// Fixed prefix of the shared page. Both peers re-derive buffer base
/// pointers from these fields on every resize; nothing below the prefix is
/// addressed directly.
#[repr(C)]
pub struct SharedPage {
    pub major: u8,
    pub minor: u8,
    /// Dead-man switch: non-zero while the connection lives. Monotonic,
    /// either side may clear it, nobody sets it again.
    pub dms: AtomicU8,
    /// Resize control: 0 idle, 1 requested by client, -1 rejected by server.
    pub resized: AtomicI8,
    /// Pid of the allocating (server) process, 0 if untracked.
    pub parent: AtomicU32,
    /// Layout checksum; written once at allocation.
    pub cookie: AtomicU64,
    /// Authoritative size of the mapping.
    pub segment_size: AtomicU64,
    /// Opaque identifier the server assigned to this segment.
    pub segment_token: AtomicU32,
    /// `HintFlags` bits, synched by the client at signal/resize.
    pub hints: AtomicU32,
    pub w: AtomicU32,
    pub h: AtomicU32,
    /// Optional cell grid for text-pack transfers.
    pub rows: AtomicU32,
    pub cols: AtomicU32,
    /// Most recently published dirty rectangle (SUBREGION hint).
    pub dirty: region::DirtyRegion,
    /// Presentation timestamp; doubles as the auth-token side channel
    /// during an AUTH_TOKEN resize round-trip.
    pub vpts: AtomicU64,
    /// Buffer-index-plus-one of the published video/audio buffer.
    pub vready: AtomicU32,
    pub aready: AtomicU32,
    /// Server-owned buffer slots. Outside a resize round-trip these are
    /// bitmasks; during one they briefly carry the requested chain depths.
    pub vpending: AtomicU32,
    pub apending: AtomicU32,
    /// Payload bytes in each published audio buffer.
    pub abufused: [AtomicU32; ABUF_LIMIT],
    pub abufsize: AtomicU32,
    pub audiorate: AtomicU32,
    /// Extended-protocol block: negotiated byte count and type tag.
    pub apad: AtomicU32,
    pub apad_type: AtomicU32,
    /// Sync slots (event, video, audio).
    pub esync: AtomicU32,
    pub vsync: AtomicU32,
    pub async_: AtomicU32,
    /// Client-written reason for a voluntary exit.
    pub last_words: [u8; LAST_WORDS_SZ],
    /// Server-to-client ring.
    pub childevq: EventRing,
    /// Client-to-server ring.
    pub parentevq: EventRing,
}

/// Compile-time constant derived from the sizes and chosen field offsets of
/// the shared structures. Both peers recompute it independently; mismatch
/// means incompatible builds or memory corruption.
pub fn page_cookie() -> u64 {
    let mut base = (size_of::<EventRecord>() + size_of::<SharedPage>()) as u64;
    base |= (offset_of!(SharedPage, cookie) as u64) << 8;
    base |= (offset_of!(SharedPage, resized) as u64) << 16;
    base |= (offset_of!(SharedPage, aready) as u64) << 24;
    base |= (offset_of!(SharedPage, abufused) as u64) << 32;
    base |= ((offset_of!(SharedPage, childevq) + offset_of!(EventRing, front)) as u64) << 40;
    base |= ((offset_of!(SharedPage, childevq) + offset_of!(EventRing, back)) as u64) << 48;
    base |= ((offset_of!(SharedPage, parentevq) + offset_of!(EventRing, front)) as u64) << 56;
    base
}

impl SharedPage {
    /// Validate version and cookie against this build.
    pub fn integrity_check(&self) -> Result<(), LayoutError> {
        if self.major != VERSION_MAJOR || self.minor != VERSION_MINOR {
            return Err(LayoutError::VersionMismatch(self.major, self.minor));
        }
        let found = self.cookie.load(Ordering::Acquire);
        let expected = page_cookie();
        if found != expected {
            return Err(LayoutError::CookieMismatch { expected, found });
        }
        Ok(())
    }

    pub fn dms_alive(&self) -> bool {
        self.dms.load(Ordering::Acquire) != 0
    }

    pub fn pull_dms(&self) {
        self.dms.store(0, Ordering::Release);
    }

    /// Write the exit reason, truncated at capacity or the first newline.
    /// The field is plain bytes in shared memory, so it is written through
    /// a volatile pointer rather than a reference.
    pub fn write_last_words(&self, msg: &str) {
        let base = self.last_words.as_ptr() as *mut u8;
        let mut n = 0;
        for &b in msg.as_bytes().iter().take(LAST_WORDS_SZ - 1) {
            if b == b'\n' {
                break;
            }
            unsafe { base.add(n).write_volatile(b) };
            n += 1;
        }
        unsafe { base.add(n).write_volatile(0) };
    }

    pub fn read_last_words(&self) -> String {
        let mut out = Vec::with_capacity(LAST_WORDS_SZ);
        let base = self.last_words.as_ptr();
        for i in 0..LAST_WORDS_SZ {
            let b = unsafe { base.add(i).read_volatile() };
            if b == 0 {
                break;
            }
            out.push(b);
        }
        String::from_utf8_lossy(&out).into_owned()
    }
}

const fn align_up(v: usize, align: usize) -> usize {
    (v + align - 1) & !(align - 1)
}

/// Geometry needed to derive every pointer in a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageGeometry {
    pub w: u32,
    pub h: u32,
    pub rows: u32,
    pub cols: u32,
    pub hints: HintFlags,
    pub vbuf_cnt: usize,
    pub abuf_cnt: usize,
    pub abuf_sz: usize,
    pub apad: usize,
}

impl PageGeometry {
    /// Read the negotiated geometry back out of a page prefix.
    pub fn from_page(page: &SharedPage) -> Self {
        let abuf_sz = match page.abufsize.load(Ordering::Acquire) {
            0 => DEFAULT_ABUF_SZ,
            sz => sz,
        };
        Self {
            w: page.w.load(Ordering::Acquire),
            h: page.h.load(Ordering::Acquire),
            rows: page.rows.load(Ordering::Acquire),
            cols: page.cols.load(Ordering::Acquire),
            hints: HintFlags::from_bits_truncate(page.hints.load(Ordering::Acquire)),
            vbuf_cnt: page.vpending.load(Ordering::Acquire).max(1) as usize,
            abuf_cnt: page.apending.load(Ordering::Acquire).max(1) as usize,
            abuf_sz: abuf_sz as usize,
            apad: page.apad.load(Ordering::Acquire) as usize,
        }
    }

    /// Byte size of one video buffer under these hints.
    pub fn vbuf_size(&self) -> usize {
        if self.hints.contains(HintFlags::TPACK) {
            let cells = (self.rows.max(1) as usize) * (self.cols.max(1) as usize);
            align_up(cells * TPACK_CELL_SZ, BUF_ALIGN)
        } else {
            (self.w as usize) * (self.h as usize) * VCHANNELS
        }
    }

    /// Total page size required for this geometry.
    pub fn required_size(&self) -> usize {
        let mut total = align_up(size_of::<SharedPage>(), BUF_ALIGN);
        total = align_up(total + self.apad, BUF_ALIGN);
        for _ in 0..self.abuf_cnt.min(ABUF_LIMIT) {
            total = align_up(total + self.abuf_sz, BUF_ALIGN);
        }
        for _ in 0..self.vbuf_cnt.min(VBUF_LIMIT) {
            total = align_up(total + self.vbuf_size(), BUF_ALIGN);
        }
        total
    }

    pub fn validate(&self) -> Result<(), LayoutError> {
        if self.w == 0 || self.h == 0 || self.w > MAX_W || self.h > MAX_H {
            return Err(LayoutError::BadDimensions(self.w, self.h));
        }
        let required = self.required_size();
        if required > MAX_PAGE_SZ {
            return Err(LayoutError::SizeOverflow {
                required,
                max: MAX_PAGE_SZ,
            });
        }
        Ok(())
    }
}

/// Derived buffer base offsets, recomputed from the prefix on every resize.
#[derive(Debug, Clone, Default)]
pub struct AvLayout {
    pub apad_ofs: usize,
    pub abuf_ofs: Vec<usize>,
    pub vbuf_ofs: Vec<usize>,
    pub vbuf_sz: usize,
    pub abuf_sz: usize,
}

/// Map the audio and video buffer arrays that follow the page prefix:
/// (extension pad)(audio buffers)(video buffers), each aligned.
pub fn map_av(geometry: &PageGeometry) -> AvLayout {
    let mut ofs = align_up(size_of::<SharedPage>(), BUF_ALIGN);
    let apad_ofs = ofs;
    ofs = align_up(ofs + geometry.apad, BUF_ALIGN);

    let mut abuf_ofs = Vec::with_capacity(geometry.abuf_cnt);
    for _ in 0..geometry.abuf_cnt.min(ABUF_LIMIT) {
        abuf_ofs.push(ofs);
        ofs = align_up(ofs + geometry.abuf_sz, BUF_ALIGN);
    }

    let vbuf_sz = geometry.vbuf_size();
    let mut vbuf_ofs = Vec::with_capacity(geometry.vbuf_cnt);
    for _ in 0..geometry.vbuf_cnt.min(VBUF_LIMIT) {
        vbuf_ofs.push(ofs);
        ofs = align_up(ofs + vbuf_sz, BUF_ALIGN);
    }

    AvLayout {
        apad_ofs,
        abuf_ofs,
        vbuf_ofs,
        vbuf_sz,
        abuf_sz: geometry.abuf_sz,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(w: u32, h: u32, vcnt: usize, acnt: usize) -> PageGeometry {
        PageGeometry {
            w,
            h,
            rows: 0,
            cols: 0,
            hints: HintFlags::empty(),
            vbuf_cnt: vcnt,
            abuf_cnt: acnt,
            abuf_sz: DEFAULT_ABUF_SZ as usize,
            apad: 0,
        }
    }

    #[test]
    fn cookie_reflects_layout() {
        let a = page_cookie();
        let b = page_cookie();
        assert_eq!(a, b);
        // The size component lives in the low byte range; offsets occupy
        // the upper bytes. A page of all-zero never validates.
        assert_ne!(a, 0);
        assert_ne!(a & !0xff, 0);
    }

    #[test]
    fn buffers_do_not_overlap() {
        let g = geometry(640, 480, 3, 2);
        let layout = map_av(&g);
        assert_eq!(layout.vbuf_ofs.len(), 3);
        assert_eq!(layout.abuf_ofs.len(), 2);

        let vsz = layout.vbuf_sz;
        for pair in layout.vbuf_ofs.windows(2) {
            assert!(pair[0] + vsz <= pair[1]);
        }
        for (a, v) in layout.abuf_ofs.iter().zip(layout.vbuf_ofs.iter()) {
            assert!(a + layout.abuf_sz <= *v);
        }
        assert!(layout.abuf_ofs[0] >= size_of::<SharedPage>());
        assert!(g.required_size() >= layout.vbuf_ofs[2] + vsz);
    }

    #[test]
    fn tpack_sizes_by_cells() {
        let mut g = geometry(640, 480, 1, 1);
        g.hints = HintFlags::TPACK;
        g.rows = 25;
        g.cols = 80;
        assert_eq!(g.vbuf_size() % BUF_ALIGN, 0);
        assert!(g.vbuf_size() >= 25 * 80 * TPACK_CELL_SZ);
        assert!(g.vbuf_size() < 640 * 480 * VCHANNELS);
    }

    #[test]
    fn oversize_layout_is_rejected() {
        let g = geometry(MAX_W, MAX_H, VBUF_LIMIT, 1);
        assert!(matches!(
            g.validate(),
            Err(LayoutError::SizeOverflow { .. })
        ));
        assert!(geometry(0, 32, 1, 1).validate().is_err());
        assert!(geometry(32, 32, 1, 1).validate().is_ok());
    }

    #[test]
    fn last_words_truncate_at_newline() {
        let page: Box<SharedPage> = unsafe { Box::new(std::mem::zeroed()) };
        page.write_last_words("gone fishing\nnot seen");
        assert_eq!(page.read_last_words(), "gone fishing");
    }
}
