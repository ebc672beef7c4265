//! Event model for the shimmer IPC substrate.
//!
//! Events travel as fixed-size records inside the process-shared ring
//! queues, so every payload here is a `#[repr(C)]` plain-old-data struct and
//! the per-category storage is a POD union. The typed enums in [`kinds`] are
//! views over the raw discriminant bytes; an unrecognized byte from the peer
//! decodes to `None` instead of undefined behaviour.

use std::fmt;
use std::time::Instant;

pub mod kinds;
pub mod merge;
pub mod multipart;

pub use kinds::{Category, ExternalKind, IoDataType, IoDeviceKind, TargetKind};

/// Sentinel for "no descriptor" in event fields that may carry one.
pub const BAD_FD: i32 = -1;

/// Payload capacity of the fixed message field, excluding the terminator.
pub const MESSAGE_LEN: usize = 78;

/// Capacity of label/title style fields.
pub const LABEL_LEN: usize = 32;

/// Generic event argument word: int, uint, float or four raw bytes.
#[repr(C)]
#[derive(Clone, Copy)]
pub union IoWord {
    pub iv: i32,
    pub uv: u32,
    pub fv: f32,
    pub cv: [u8; 4],
}

impl IoWord {
    pub const fn zero() -> Self {
        IoWord { uv: 0 }
    }

    pub fn iv(&self) -> i32 {
        unsafe { self.iv }
    }

    pub fn uv(&self) -> u32 {
        unsafe { self.uv }
    }

    pub fn fv(&self) -> f32 {
        unsafe { self.fv }
    }

    pub fn cv(&self) -> [u8; 4] {
        unsafe { self.cv }
    }
}

impl Default for IoWord {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Debug for IoWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.iv())
    }
}

/// Server-to-client command payload: kind, eight argument words, message,
/// label and a millisecond timestamp.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TargetPayload {
    pub kind: u8,
    pub message: [u8; MESSAGE_LEN],
    pub label: [u8; LABEL_LEN],
    pub ioevs: [IoWord; 8],
    pub timestamp: u64,
}

/// REGISTER body: segment kind, persistent identity and a display title.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RegisterBody {
    pub segkind: u8,
    pub title: [u8; LABEL_LEN],
    pub guid: [u64; 2],
}

/// MESSAGE body with the multipart continuation bit.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct MessageBody {
    pub data: [u8; MESSAGE_LEN],
    pub multipart: u8,
}

/// SEGREQ body: requested subsegment kind, caller-chosen request id and an
/// initial size hint.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SegReqBody {
    pub kind: u8,
    pub id: u32,
    pub width: u32,
    pub height: u32,
}

/// BUFFERSTREAM body naming the geometry of an out-of-band buffer plane.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct BufferStreamBody {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: u32,
    pub planes_left: u8,
}

/// VIEWPORT body: position relative to a parent segment token.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ViewportBody {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
    pub parent_token: u32,
    pub invisible: u8,
    pub focus: u8,
}

/// CLOCK body: request a periodic or one-shot STEPFRAME source.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ClockBody {
    pub rate: u32,
    pub id: u8,
    pub dynamic: u8,
    pub once: u8,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union ExternalBody {
    pub message: MessageBody,
    pub register: RegisterBody,
    pub segreq: SegReqBody,
    pub bstream: BufferStreamBody,
    pub viewport: ViewportBody,
    pub clock: ClockBody,
}

/// Client-to-server payload: kind, per-kind body and the id of the last
/// signalled video frame (stamped at enqueue, acts as a clock).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ExternalPayload {
    pub kind: u8,
    pub body: ExternalBody,
    pub frame_id: u64,
}

/// Translated keyboard sample.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TranslatedInput {
    pub active: u8,
    pub scancode: u32,
    pub keysym: u32,
    pub modifiers: u16,
    pub utf8: [u8; 5],
}

/// Analog sample block (relative or absolute axes).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct AnalogInput {
    pub gotrel: u8,
    pub nvalues: u8,
    pub axisval: [i16; 4],
}

/// Digital (button) sample.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DigitalInput {
    pub active: u8,
}

/// Touch sample.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TouchInput {
    pub active: u8,
    pub x: i16,
    pub y: i16,
    pub pressure: f32,
    pub size: f32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union IoBody {
    pub translated: TranslatedInput,
    pub analog: AnalogInput,
    pub digital: DigitalInput,
    pub touch: TouchInput,
}

/// Input sample payload.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct IoPayload {
    pub devkind: u8,
    pub datatype: u8,
    pub devid: u16,
    pub subid: u16,
    pub pts: u64,
    pub input: IoBody,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union EventBody {
    pub tgt: TargetPayload,
    pub ext: ExternalPayload,
    pub io: IoPayload,
}

/// The fixed-size tagged union carried on the ring queues.
///
/// `category` selects which member of the body union is live. All members
/// are POD with every bit pattern valid, so reading the wrong member is
/// merely meaningless, never undefined.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct EventRecord {
    pub category: u8,
    pub body: EventBody,
}

impl EventRecord {
    /// An all-zero record, category `None`.
    pub fn zeroed() -> Self {
        // All constituent types are POD for which zero is a valid state.
        unsafe { std::mem::zeroed() }
    }

    /// Build a TARGET event of the given kind, all other fields zero.
    pub fn target(kind: TargetKind) -> Self {
        let mut ev = Self::zeroed();
        ev.category = Category::Target as u8;
        ev.body.tgt.kind = kind as u8;
        ev
    }

    /// Build an EXTERNAL event of the given kind, all other fields zero.
    pub fn external(kind: ExternalKind) -> Self {
        let mut ev = Self::zeroed();
        ev.category = Category::External as u8;
        ev.body.ext.kind = kind as u8;
        ev
    }

    /// Build an IO event, body zeroed.
    pub fn io(devkind: IoDeviceKind, datatype: IoDataType) -> Self {
        let mut ev = Self::zeroed();
        ev.category = Category::Io as u8;
        ev.body.io.devkind = devkind as u8;
        ev.body.io.datatype = datatype as u8;
        ev
    }

    pub fn category(&self) -> Option<Category> {
        Category::from_raw(self.category)
    }

    pub fn is_target(&self, kind: TargetKind) -> bool {
        self.category() == Some(Category::Target) && self.tgt().kind == kind as u8
    }

    pub fn is_external(&self, kind: ExternalKind) -> bool {
        self.category() == Some(Category::External) && self.ext().kind == kind as u8
    }

    pub fn target_kind(&self) -> Option<TargetKind> {
        if self.category() == Some(Category::Target) {
            TargetKind::from_raw(self.tgt().kind)
        } else {
            None
        }
    }

    pub fn external_kind(&self) -> Option<ExternalKind> {
        if self.category() == Some(Category::External) {
            ExternalKind::from_raw(self.ext().kind)
        } else {
            None
        }
    }

    pub fn tgt(&self) -> &TargetPayload {
        unsafe { &self.body.tgt }
    }

    pub fn tgt_mut(&mut self) -> &mut TargetPayload {
        unsafe { &mut self.body.tgt }
    }

    pub fn ext(&self) -> &ExternalPayload {
        unsafe { &self.body.ext }
    }

    pub fn ext_mut(&mut self) -> &mut ExternalPayload {
        unsafe { &mut self.body.ext }
    }

    pub fn io_payload(&self) -> &IoPayload {
        unsafe { &self.body.io }
    }

    pub fn io_payload_mut(&mut self) -> &mut IoPayload {
        unsafe { &mut self.body.io }
    }

    /// Copy a string into the TARGET/EXTERNAL message field, truncated at
    /// capacity with a terminating zero.
    pub fn set_message(&mut self, msg: &str) {
        let dst: &mut [u8; MESSAGE_LEN] = match self.category() {
            Some(Category::External) => unsafe { &mut self.body.ext.body.message.data },
            _ => &mut self.tgt_mut().message,
        };
        write_fixed(dst, msg.as_bytes());
    }

    /// The message field as a string slice up to the first zero byte.
    pub fn message(&self) -> &str {
        let src: &[u8; MESSAGE_LEN] = match self.category() {
            Some(Category::External) => unsafe { &self.body.ext.body.message.data },
            _ => &self.tgt().message,
        };
        read_fixed(src)
    }

    /// True when this record is one of the TARGET kinds that pairs with a
    /// descriptor on the socket and its descriptor field is populated.
    pub fn carries_descriptor(&self) -> bool {
        let Some(kind) = self.target_kind() else {
            return false;
        };
        kind.descriptor_bearing() && self.tgt().ioevs[0].iv() != BAD_FD
    }

    /// Raw byte view, used by the ring primitives and loopback tests.
    pub fn as_bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(self as *const Self as *const u8, size_of::<Self>())
        }
    }
}

impl Default for EventRecord {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl fmt::Display for EventRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.category() {
            Some(Category::Target) => match self.target_kind() {
                Some(k) => write!(
                    f,
                    "TARGET:{:?}({}, {}, {}, {})",
                    k,
                    self.tgt().ioevs[0].iv(),
                    self.tgt().ioevs[1].iv(),
                    self.tgt().ioevs[2].iv(),
                    self.tgt().ioevs[3].iv()
                ),
                None => write!(f, "TARGET:unknown({})", self.tgt().kind),
            },
            Some(Category::External) => match self.external_kind() {
                Some(k) => write!(f, "EXTERNAL:{:?}", k),
                None => write!(f, "EXTERNAL:unknown({})", self.ext().kind),
            },
            Some(Category::Io) => write!(
                f,
                "IO:dev={},type={},id={}:{}",
                self.io_payload().devkind,
                self.io_payload().datatype,
                self.io_payload().devid,
                self.io_payload().subid
            ),
            None => write!(f, "EMPTY"),
        }
    }
}

fn write_fixed(dst: &mut [u8], src: &[u8]) {
    let n = src.len().min(dst.len() - 1);
    dst[..n].copy_from_slice(&src[..n]);
    dst[n..].fill(0);
}

fn read_fixed(src: &[u8]) -> &str {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    std::str::from_utf8(&src[..end]).unwrap_or("")
}

/// Milliseconds since the first call in this process. Used to stamp events
/// whose producer left the timestamp at zero.
pub fn time_millis() -> u64 {
    use std::sync::OnceLock;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_is_pod_sized() {
        // The record crosses a process boundary; its size must be stable
        // and divisible by its alignment so ring arrays have no tail gaps.
        assert_eq!(size_of::<EventRecord>() % align_of::<EventRecord>(), 0);
        assert!(size_of::<EventRecord>() >= size_of::<TargetPayload>());
        assert!(size_of::<EventRecord>() >= size_of::<ExternalPayload>());
    }

    #[test]
    fn target_constructor_tags_category() {
        let ev = EventRecord::target(TargetKind::DisplayHint);
        assert_eq!(ev.category(), Some(Category::Target));
        assert_eq!(ev.target_kind(), Some(TargetKind::DisplayHint));
        assert_eq!(ev.external_kind(), None);
    }

    #[test]
    fn message_round_trip_truncates() {
        let mut ev = EventRecord::target(TargetKind::Message);
        ev.set_message("hello");
        assert_eq!(ev.message(), "hello");

        let long = "x".repeat(200);
        ev.set_message(&long);
        assert_eq!(ev.message().len(), MESSAGE_LEN - 1);
    }

    #[test]
    fn descriptor_predicate_needs_kind_and_fd() {
        let mut ev = EventRecord::target(TargetKind::FontHint);
        ev.tgt_mut().ioevs[0].iv = BAD_FD;
        assert!(!ev.carries_descriptor());

        ev.tgt_mut().ioevs[0].iv = 7;
        assert!(ev.carries_descriptor());

        let mut plain = EventRecord::target(TargetKind::Pause);
        plain.tgt_mut().ioevs[0].iv = 7;
        assert!(!plain.carries_descriptor());
    }

    #[test]
    fn external_fields_survive_copy_bit_for_bit() {
        let mut ev = EventRecord::external(ExternalKind::Register);
        ev.ext_mut().body.register = RegisterBody {
            segkind: 4,
            title: [b'x'; LABEL_LEN],
            guid: [0xDEAD_BEEF_CAFE_F00D, 0x0123_4567_89AB_CDEF],
        };
        ev.ext_mut().frame_id = 77;

        let copy = ev;
        assert_eq!(ev.as_bytes(), copy.as_bytes());
        let reg = unsafe { copy.ext().body.register };
        assert_eq!(reg.guid[0], 0xDEAD_BEEF_CAFE_F00D);
        assert_eq!(copy.ext().frame_id, 77);
    }
}
