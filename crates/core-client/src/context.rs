//! The client context: one mapped segment plus its socket, guard and
//! queue state.

use std::collections::VecDeque;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::ThreadId;

use tracing::{debug, info, warn};

use core_args::ArgList;
use core_events::{EventRecord, ExternalKind, RegisterBody};
use core_layout::{
    DEFAULT_SAMPLERATE, HintFlags, PageGeometry, Pixel, Region, map_av,
};
use core_ring::RingView;

use crate::guard::GuardShared;
use crate::page::PageMap;
use crate::preroll::Initial;
use crate::{ContextFlags, GuardHandle, ResetHook, ResetStatus, SegmentKind, ShmError};

/// How to reach the page named by a key line.
pub enum PageKey {
    /// The page descriptor arrives over the socket.
    FromSocket,
    /// An already-open descriptor (inherited or fetched).
    Fd(OwnedFd),
    /// A named shared-memory object.
    Name(String),
}

impl PageKey {
    /// Interpret a key line: `@` means fd-over-socket, a decimal number an
    /// inherited descriptor, anything else a shm object name.
    pub fn parse(key: &str) -> Self {
        if key == "@" {
            Self::FromSocket
        } else if let Ok(n) = key.parse::<i32>() {
            Self::Fd(unsafe { OwnedFd::from_raw_fd(n) })
        } else {
            Self::Name(key.to_string())
        }
    }
}

/// Descriptor escrow: an event has been dequeued that pairs with one or
/// more descriptors on the socket, and the pair is pending until both have
/// arrived and the caller's one-event consume window has passed.
#[derive(Default)]
pub(crate) struct PendingDescriptor {
    pub got_event: bool,
    pub consumed: bool,
    pub handed_over: bool,
    pub ev: EventRecord,
    pub fds: VecDeque<OwnedFd>,
}

/// A NEWSEGMENT that has been delivered but not yet acquired.
pub(crate) struct PendingSegment {
    pub socket: OwnedFd,
    pub page_fd: Option<OwnedFd>,
    pub kind: SegmentKind,
}

pub(crate) struct Hidden {
    pub alive: bool,
    pub paused: bool,
    pub autoclean: bool,
    pub flags: ContextFlags,
    pub kind: SegmentKind,
    pub guid: [u64; 2],

    pub vbuf_ind: usize,
    pub vbuf_cnt: usize,
    pub nbuf_active: bool,
    pub abuf_ind: usize,
    pub abuf_cnt: usize,

    /// Pending-hint bits: 1 displayhint, 2 fonthint, 4 delay-slot reset.
    pub ph: u8,
    pub dh: EventRecord,
    pub fh: EventRecord,

    pub pev: PendingDescriptor,
    pub pseg: Option<PendingSegment>,
    pub keystate: Option<OwnedFd>,

    pub alt_conn: Option<String>,
    pub shm_key: Option<String>,
    pub args: Option<ArgList>,
    pub initial: Option<Initial>,

    pub primary_id: ThreadId,
    pub in_migrate: bool,
    pub no_accel: bool,
    pub auth_token: u64,
    pub last_words: Option<String>,
    pub reset_hook: Option<ResetHook>,
}

impl Hidden {
    fn new(kind: SegmentKind, flags: ContextFlags) -> Self {
        Self {
            alive: true,
            paused: false,
            autoclean: false,
            flags,
            kind,
            guid: [0; 2],
            vbuf_ind: 0,
            vbuf_cnt: 1,
            nbuf_active: false,
            abuf_ind: 0,
            abuf_cnt: 1,
            ph: 0,
            dh: EventRecord::zeroed(),
            fh: EventRecord::zeroed(),
            pev: PendingDescriptor::default(),
            pseg: None,
            keystate: None,
            alt_conn: None,
            shm_key: None,
            args: None,
            initial: None,
            primary_id: std::thread::current().id(),
            in_migrate: false,
            no_accel: false,
            auth_token: 0,
            last_words: None,
            reset_hook: None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LockEntry {
    Acquired,
    AlreadyOwner,
}

/// Context mutex with owner tracking; releasing from the wrong thread
/// fails loudly instead of corrupting state.
pub(crate) struct CtxLock {
    inner: Mutex<Option<ThreadId>>,
    cv: Condvar,
}

impl CtxLock {
    fn new() -> Self {
        Self {
            inner: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn acquire(&self) -> LockEntry {
        let me = std::thread::current().id();
        let mut owner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            match *owner {
                None => {
                    *owner = Some(me);
                    return LockEntry::Acquired;
                }
                Some(id) if id == me => return LockEntry::AlreadyOwner,
                Some(_) => {
                    owner = self
                        .cv
                        .wait(owner)
                        .unwrap_or_else(|e| e.into_inner());
                }
            }
        }
    }

    pub(crate) fn release(&self) -> bool {
        let me = std::thread::current().id();
        let mut owner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if *owner == Some(me) {
            *owner = None;
            self.cv.notify_one();
            true
        } else {
            warn!(target: "shm.lock", "unlock from a non-owning thread refused");
            false
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("w", &self.w)
            .field("h", &self.h)
            .finish_non_exhaustive()
    }
}

/// One segment of a connection.
pub struct Context {
    pub(crate) map: PageMap,
    pub(crate) sock: OwnedFd,
    pub(crate) guard: GuardHandle,
    pub(crate) ctx_lock: Arc<CtxLock>,
    pub(crate) hidden: Hidden,

    // mirrors derived from the page prefix, refreshed on every resize
    pub(crate) w: u32,
    pub(crate) h: u32,
    pub(crate) hints: HintFlags,
    pub(crate) dirty: Region,
    pub(crate) vbufs: Vec<usize>,
    pub(crate) abufs: Vec<usize>,
    pub(crate) vbuf_sz: usize,
    pub(crate) abuf_sz: usize,
    pub(crate) apad_ofs: usize,
    pub(crate) apad_len: usize,
    pub(crate) abuf_pos: usize,
    pub(crate) samplerate: u32,
    pub(crate) token: u32,
    pub(crate) vframe_id: AtomicU64,
}

// The pump/signal/resize surface takes &mut self; the only &self entry
// points (try_enqueue, accessors) touch page words through atomics.
unsafe impl Send for Context {}

impl Context {
    /// Assemble a context over a mapped page and its socket. This is the
    /// common tail of open, acquire and migrate.
    pub(crate) fn assemble(
        map: PageMap,
        sock: OwnedFd,
        kind: SegmentKind,
        flags: ContextFlags,
        guid: Option<[u64; 2]>,
        shm_key: Option<String>,
    ) -> Result<Self, ShmError> {
        map.page().integrity_check()?;

        let guard: GuardHandle = Arc::new(GuardShared::new());
        let mut ctx = Self {
            map,
            sock,
            guard,
            ctx_lock: Arc::new(CtxLock::new()),
            hidden: Hidden::new(kind, flags),
            w: 0,
            h: 0,
            hints: HintFlags::empty(),
            dirty: Region::default(),
            vbufs: Vec::new(),
            abufs: Vec::new(),
            vbuf_sz: 0,
            abuf_sz: 0,
            apad_ofs: 0,
            apad_len: 0,
            abuf_pos: 0,
            samplerate: DEFAULT_SAMPLERATE,
            token: 0,
            vframe_id: AtomicU64::new(0),
        };
        ctx.hidden.shm_key = shm_key;
        ctx.hidden.guid = guid.unwrap_or_else(|| [rand::random(), rand::random()]);

        ctx.resynch_guard();
        if !flags.contains(ContextFlags::DISABLE_GUARD)
            && std::env::var_os("SHIMMER_NOGUARD").is_none()
        {
            crate::guard::spawn(ctx.guard.clone());
        }

        ctx.setup_avbuf();

        if kind != SegmentKind::Unknown && !flags.contains(ContextFlags::NO_REGISTER) {
            let ev = register_event(kind, ctx.hidden.guid);
            ctx.enqueue(&ev)?;
        }

        debug!(target: "shm.context",
            token = ctx.token, kind = ?kind, "context assembled");
        Ok(ctx)
    }

    /// Build a context from an already-connected socket and page key.
    /// This is the inherited-descriptor bring-up and the loopback entry
    /// the server library uses.
    pub fn from_socket(
        sock: OwnedFd,
        key: PageKey,
        kind: SegmentKind,
        flags: ContextFlags,
    ) -> Result<Self, ShmError> {
        let (map, shm_key) = Self::map_key(&sock, key, flags)?;
        Self::assemble(map, sock, kind, flags, None, shm_key)
    }

    pub(crate) fn map_key(
        sock: &OwnedFd,
        key: PageKey,
        flags: ContextFlags,
    ) -> Result<(PageMap, Option<String>), ShmError> {
        match key {
            PageKey::Fd(fd) => Ok((PageMap::from_fd(fd)?, None)),
            PageKey::FromSocket => {
                match core_wire::fetch_fds(sock.as_raw_fd(), true, || true) {
                    core_wire::fdpass::Fetched::Got(mut fds) if !fds.is_empty() => {
                        Ok((PageMap::from_fd(fds.remove(0))?, None))
                    }
                    _ => Err(ShmError::Dead),
                }
            }
            PageKey::Name(name) => {
                let map = PageMap::from_name(&name)?;
                if flags.contains(ContextFlags::DONT_UNLINK) {
                    Ok((map, Some(name)))
                } else {
                    // the open descriptor keeps the region alive
                    let _ = nix::sys::mman::shm_unlink(name.as_str());
                    Ok((map, None))
                }
            }
        }
    }

    /// Point the guard at the current page and socket.
    pub(crate) fn resynch_guard(&self) {
        let page = self.map.page();
        self.guard.resynch(
            &page.dms as *const AtomicU8 as *mut AtomicU8,
            [
                &page.esync as *const AtomicU32 as *mut AtomicU32,
                &page.vsync as *const AtomicU32 as *mut AtomicU32,
                &page.async_ as *const AtomicU32 as *mut AtomicU32,
            ],
            page.parent.load(Ordering::Acquire) as i32,
            self.sock.as_raw_fd(),
        );
    }

    /// Re-derive every buffer pointer and cursor from the page prefix.
    /// Any previous A/V state on this side is lost.
    pub(crate) fn setup_avbuf(&mut self) {
        let page = self.map.page();
        let geom = PageGeometry::from_page(page);
        let layout = map_av(&geom);

        self.w = geom.w;
        self.h = geom.h;
        self.hints = geom.hints;
        self.vbufs = layout.vbuf_ofs;
        self.abufs = layout.abuf_ofs;
        self.vbuf_sz = layout.vbuf_sz;
        self.abuf_sz = layout.abuf_sz;
        self.apad_ofs = layout.apad_ofs;
        self.apad_len = geom.apad;
        self.abuf_pos = 0;
        self.token = page.segment_token.load(Ordering::Acquire);
        self.samplerate = {
            let rate = page.audiorate.load(Ordering::Acquire);
            if rate == 0 { DEFAULT_SAMPLERATE } else { rate }
        };

        self.hidden.vbuf_cnt = self.vbufs.len().max(1);
        self.hidden.abuf_cnt = self.abufs.len().max(1);
        self.hidden.vbuf_ind = 0;
        self.hidden.abuf_ind = 0;
        self.hidden.nbuf_active = false;

        // the counts were parked in the pending words during negotiation;
        // from here on they are ownership bitmaps again
        page.vpending.store(0, Ordering::Release);
        page.apending.store(0, Ordering::Release);

        self.dirty = Region::full(self.w, self.h);
    }

    pub(crate) fn inq(&self) -> RingView {
        unsafe { RingView::over(&raw mut (*self.map.page_ptr()).childevq) }
    }

    pub(crate) fn outq(&self) -> RingView {
        unsafe { RingView::over(&raw mut (*self.map.page_ptr()).parentevq) }
    }

    /// Consolidated liveness: context alive flag, guard mirror, page DMS.
    pub fn alive(&self) -> bool {
        self.hidden.alive && self.guard.dms_alive()
    }

    pub(crate) fn check_dms(&self) -> bool {
        self.alive()
    }

    pub fn width(&self) -> u32 {
        self.w
    }

    pub fn height(&self) -> u32 {
        self.h
    }

    pub fn segment_token(&self) -> u32 {
        self.token
    }

    pub fn segment_kind(&self) -> SegmentKind {
        self.hidden.kind
    }

    pub fn guid(&self) -> [u64; 2] {
        self.hidden.guid
    }

    pub fn samplerate(&self) -> u32 {
        self.samplerate
    }

    pub fn hints(&self) -> HintFlags {
        self.hints
    }

    pub fn set_hints(&mut self, hints: HintFlags) {
        self.hints = hints;
    }

    pub fn args(&self) -> Option<&ArgList> {
        self.hidden.args.as_ref()
    }

    /// Fallback endpoint used by crash recovery.
    pub fn fallback_endpoint(&self) -> Option<&str> {
        self.hidden.alt_conn.as_deref()
    }

    pub fn set_fallback_endpoint(&mut self, ep: Option<String>) {
        self.hidden.alt_conn = ep;
    }

    /// Mark the dirty rectangle for the next SUBREGION signal.
    pub fn set_dirty(&mut self, region: Region) {
        self.dirty = region;
    }

    /// Accelerated handle passing permitted (no BUFFER_FAIL seen).
    pub fn handle_permitted(&self) -> bool {
        !self.hidden.no_accel
    }

    /// The device authentication token exchanged during an AUTH_TOKEN
    /// resize round-trip.
    pub fn auth_token(&self) -> u64 {
        self.hidden.auth_token
    }

    /// The negotiated extended-protocol block and its type tag, when one
    /// was reserved through `resize_ext`.
    pub fn extended_block(&mut self) -> Option<(&mut [u8], u32)> {
        if self.apad_len == 0 {
            return None;
        }
        let ptr = self.map.offset_ptr(self.apad_ofs, self.apad_len)?;
        let tag = self.map.page().apad_type.load(Ordering::Acquire);
        Some((
            unsafe { std::slice::from_raw_parts_mut(ptr, self.apad_len) },
            tag,
        ))
    }

    /// Install the reset hook that runs after remaps and migrations.
    pub fn on_reset(&mut self, hook: ResetHook) {
        self.hidden.reset_hook = Some(hook);
    }

    pub(crate) fn run_reset_hook(&mut self, status: ResetStatus) {
        if let Some(mut hook) = self.hidden.reset_hook.take() {
            hook(status);
            self.hidden.reset_hook = Some(hook);
        }
    }

    /// The current working video buffer.
    pub fn video_mut(&mut self) -> &mut [Pixel] {
        let Some(&ofs) = self.vbufs.get(self.hidden.vbuf_ind) else {
            return &mut [];
        };
        match self.map.offset_ptr(ofs, self.vbuf_sz) {
            Some(p) => unsafe {
                std::slice::from_raw_parts_mut(
                    p as *mut Pixel,
                    (self.w as usize) * (self.h as usize),
                )
            },
            None => &mut [],
        }
    }

    /// The current working audio buffer, full capacity.
    pub fn audio_mut(&mut self) -> &mut [core_layout::AudioSample] {
        let Some(&ofs) = self.abufs.get(self.hidden.abuf_ind) else {
            return &mut [];
        };
        match self.map.offset_ptr(ofs, self.abuf_sz) {
            Some(p) => unsafe {
                std::slice::from_raw_parts_mut(
                    p as *mut core_layout::AudioSample,
                    self.abuf_sz / size_of::<core_layout::AudioSample>(),
                )
            },
            None => &mut [],
        }
    }

    /// Append samples to the working audio buffer; returns how many were
    /// taken (the rest belong in the next buffer after a signal).
    pub fn queue_audio(&mut self, samples: &[core_layout::AudioSample]) -> usize {
        let pos = self.abuf_pos;
        let buf = self.audio_mut();
        let space = buf.len().saturating_sub(pos);
        let take = samples.len().min(space);
        buf[pos..pos + take].copy_from_slice(&samples[..take]);
        self.abuf_pos += take;
        take
    }

    /// Exclude the event and signal pumps for a caller critical section.
    pub fn lock(&self) -> bool {
        self.ctx_lock.acquire() == LockEntry::Acquired
    }

    pub fn unlock(&self) -> bool {
        self.ctx_lock.release()
    }

    /// Record the reason for a voluntary exit so the server can log it.
    pub fn last_words(&mut self, msg: &str) {
        self.hidden.last_words = Some(msg.to_string());
        self.map.page().write_last_words(msg);
    }

    /// The initial preroll state. Reading it transfers ownership; any
    /// later pump call discards an unread copy and closes its descriptors.
    pub fn take_initial(&mut self) -> Option<Initial> {
        self.hidden.initial.take()
    }

    /// Unlink named shared resources kept by DONT_UNLINK.
    pub fn unlink(&mut self) {
        if let Some(key) = self.hidden.shm_key.take() {
            let _ = nix::sys::mman::shm_unlink(key.as_str());
        }
    }

    /// The raw socket, for callers integrating with poll loops.
    pub fn socket_fd(&self) -> std::os::fd::RawFd {
        self.sock.as_raw_fd()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let _ = self.ctx_lock.acquire();

        if let Some(words) = &self.hidden.last_words {
            info!(target: "shm.context", last_words = %words, "dropping context");
        }

        // voluntary exit clears the switch for the peer
        self.map.page().pull_dms();
        self.guard.release();
        PrimaryRegistry::global().forget(self.token);

        let _ = self.ctx_lock.release();
    }
}

pub(crate) fn register_event(kind: SegmentKind, guid: [u64; 2]) -> EventRecord {
    let mut ev = EventRecord::external(ExternalKind::Register);
    ev.ext_mut().body.register = RegisterBody {
        segkind: kind as u8,
        title: [0; core_events::LABEL_LEN],
        guid,
    };
    ev
}

/// Role slots for the process-wide ergonomic registry. The registry maps
/// a role to a segment token so embedders (and tests) can address "the"
/// input/output segment without threading state around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryRole {
    Input,
    Output,
    Accessibility,
}

#[derive(Default)]
pub struct PrimaryRegistry {
    slots: Mutex<[Option<u32>; 3]>,
}

impl PrimaryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide instance.
    pub fn global() -> &'static PrimaryRegistry {
        static GLOBAL: OnceLock<PrimaryRegistry> = OnceLock::new();
        GLOBAL.get_or_init(PrimaryRegistry::new)
    }

    pub fn set(&self, role: PrimaryRole, token: u32) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots[role as usize] = Some(token);
    }

    pub fn get(&self, role: PrimaryRole) -> Option<u32> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots[role as usize]
    }

    /// Drop every slot naming `token`; called when a segment dies.
    pub fn forget(&self, token: u32) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        for slot in slots.iter_mut() {
            if *slot == Some(token) {
                *slot = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_set_get_forget() {
        let reg = PrimaryRegistry::new();
        assert_eq!(reg.get(PrimaryRole::Input), None);
        reg.set(PrimaryRole::Input, 7);
        reg.set(PrimaryRole::Output, 7);
        assert_eq!(reg.get(PrimaryRole::Input), Some(7));
        reg.forget(7);
        assert_eq!(reg.get(PrimaryRole::Input), None);
        assert_eq!(reg.get(PrimaryRole::Output), None);
    }

    #[test]
    fn ctx_lock_tracks_owner() {
        let lock = Arc::new(CtxLock::new());
        assert_eq!(lock.acquire(), LockEntry::Acquired);
        assert_eq!(lock.acquire(), LockEntry::AlreadyOwner);

        // a foreign thread cannot release our lock
        let l2 = lock.clone();
        std::thread::spawn(move || {
            assert!(!l2.release());
        })
        .join()
        .unwrap();

        assert!(lock.release());
        assert!(!lock.release());
    }
}
