//! Headless server half of the shimmer substrate.
//!
//! Exists so that servers, proxies and tests can be written without the
//! display-server proper: it allocates and initialises pages, answers the
//! resize handshake, consumes published frames, injects events (with
//! descriptor pairing) and offers subsegments. The binary and the
//! integration suites drive both halves of the protocol through this
//! crate.

use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use nix::sys::memfd::{MemFdCreateFlag, memfd_create};
use nix::unistd::ftruncate;
use tracing::{debug, info, warn};

use core_client::PageMap;
use core_events::{EventRecord, ExternalKind, TargetKind};
use core_layout::{
    ABUF_LIMIT, AvLayout, DEFAULT_ABUF_SZ, DEFAULT_SAMPLERATE, HintFlags, PageGeometry, Pixel,
    START_SZ, VBUF_LIMIT, VERSION_MAJOR, VERSION_MINOR, map_av, page_cookie,
};
use core_ring::RingView;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Layout(#[from] core_layout::LayoutError),
    #[error(transparent)]
    Wire(#[from] core_wire::WireError),
    #[error("client error: {0}")]
    Client(#[from] core_client::ShmError),
    #[error("outbound ring is full")]
    QueueFull,
    #[error("system error: {0}")]
    Sys(#[from] nix::errno::Errno),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Allocation parameters for a fresh segment.
#[derive(Debug, Clone, Copy)]
pub struct AllocOpts {
    pub vbuf_cnt: u32,
    pub abuf_cnt: u32,
    pub abuf_sz: u32,
    pub samplerate: u32,
    /// Pid the client watchdog should track; `None` means this process.
    pub parent_pid: Option<i32>,
    /// Segment token; random when absent.
    pub token: Option<u32>,
}

impl Default for AllocOpts {
    fn default() -> Self {
        Self {
            vbuf_cnt: 1,
            abuf_cnt: 1,
            abuf_sz: DEFAULT_ABUF_SZ,
            samplerate: DEFAULT_SAMPLERATE,
            parent_pid: None,
            token: None,
        }
    }
}

/// Server view of one connected segment.
pub struct ServerSegment {
    map: PageMap,
    sock: OwnedFd,
    geom: PageGeometry,
    layout: AvLayout,
    token: u32,
    deny_next_resize: bool,
}

impl ServerSegment {
    /// Allocate a page and a socketpair; returns the server segment and
    /// the descriptor the client side connects through.
    pub fn allocate_pair(
        w: u32,
        h: u32,
        opts: AllocOpts,
    ) -> Result<(Self, OwnedFd), ServerError> {
        use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
        let (ours, theirs) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )?;
        let seg = Self::allocate(ours, w, h, opts)?;
        Ok((seg, theirs))
    }

    /// Allocate and initialise a page for an already-connected socket.
    pub fn allocate(sock: OwnedFd, w: u32, h: u32, opts: AllocOpts) -> Result<Self, ServerError> {
        let geom = PageGeometry {
            w,
            h,
            rows: 0,
            cols: 0,
            hints: HintFlags::empty(),
            vbuf_cnt: (opts.vbuf_cnt as usize).clamp(1, VBUF_LIMIT),
            abuf_cnt: (opts.abuf_cnt as usize).clamp(1, ABUF_LIMIT),
            abuf_sz: opts.abuf_sz.max(1) as usize,
            apad: 0,
        };
        geom.validate()?;

        // the first client mapping happens before segment_size can be
        // read, so the initial allocation never goes below the agreed
        // start size
        let size = geom.required_size().max(START_SZ);
        let fd = memfd_create(c"shimmer-page", MemFdCreateFlag::MFD_CLOEXEC)?;
        ftruncate(&fd, size as i64)?;
        let map = PageMap::from_fd_sized(fd, size)?;

        let token = opts.token.unwrap_or_else(rand::random);
        let parent = opts
            .parent_pid
            .unwrap_or_else(|| std::process::id() as i32);

        // the version bytes are plain and written before any reference to
        // the page exists; everything else in the prefix is atomic and the
        // cookie goes last
        unsafe {
            let p = map.page_ptr();
            (&raw mut (*p).major).write(VERSION_MAJOR);
            (&raw mut (*p).minor).write(VERSION_MINOR);
        }
        {
            let page = map.page();
            page.parent.store(parent as u32, Ordering::Release);
            page.segment_size.store(size as u64, Ordering::Release);
            page.segment_token.store(token, Ordering::Release);
            page.w.store(w, Ordering::Release);
            page.h.store(h, Ordering::Release);
            page.abufsize.store(geom.abuf_sz as u32, Ordering::Release);
            page.audiorate.store(
                if opts.samplerate == 0 {
                    DEFAULT_SAMPLERATE
                } else {
                    opts.samplerate
                },
                Ordering::Release,
            );
            // park the chain depths for the client's first derive
            page.vpending
                .store(geom.vbuf_cnt as u32, Ordering::Release);
            page.apending
                .store(geom.abuf_cnt as u32, Ordering::Release);
            page.dms.store(1, Ordering::Release);
            page.cookie.store(page_cookie(), Ordering::Release);
        }

        let layout = map_av(&geom);
        info!(target: "shm.server", token, w, h, size, "segment allocated");
        Ok(Self {
            map,
            sock,
            geom,
            layout,
            token,
            deny_next_resize: false,
        })
    }

    pub fn token(&self) -> u32 {
        self.token
    }

    pub fn socket_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    pub fn alive(&self) -> bool {
        self.map.page().dms_alive()
    }

    pub fn width(&self) -> u32 {
        self.geom.w
    }

    pub fn height(&self) -> u32 {
        self.geom.h
    }

    /// Duplicate the page descriptor for handing to a client.
    pub fn dup_page_fd(&self) -> Option<OwnedFd> {
        core_wire::dup_fd(self.map.fd().as_raw_fd(), -1, true)
    }

    /// Send the page descriptor over the socket (fd-over-socket key).
    pub fn send_page_fd(&self) -> Result<(), ServerError> {
        let dup = self.dup_page_fd().ok_or(ServerError::QueueFull)?;
        core_wire::push_fd(self.sock.as_raw_fd(), Some(dup.as_fd()))?;
        Ok(())
    }

    fn inq(&self) -> RingView {
        unsafe { RingView::over(&raw mut (*self.map.page_ptr()).parentevq) }
    }

    fn outq(&self) -> RingView {
        unsafe { RingView::over(&raw mut (*self.map.page_ptr()).childevq) }
    }

    /// Inject one event toward the client.
    pub fn enqueue(&self, ev: &EventRecord) -> Result<(), ServerError> {
        if !self.outq().produce(ev) {
            return Err(ServerError::QueueFull);
        }
        core_sync::post(&self.map.page().esync);
        core_wire::ping(self.sock.as_raw_fd());
        Ok(())
    }

    /// Inject a descriptor-bearing event: the descriptors travel first on
    /// the socket, then the event they pair with.
    pub fn enqueue_with_fds(
        &self,
        ev: &EventRecord,
        fds: &[RawFd],
    ) -> Result<(), ServerError> {
        core_wire::push_fds(self.sock.as_raw_fd(), fds)?;
        self.enqueue(ev)
    }

    /// Drain the client-to-server ring.
    pub fn poll(&self) -> Vec<EventRecord> {
        let mut out = Vec::new();
        let inq = self.inq();
        while let Some(ev) = inq.consume() {
            out.push(ev);
        }
        // release a client blocked on a full outbound ring
        core_sync::clear(&self.map.page().esync);
        out
    }

    /// Refuse the next resize request (tests and quota policy).
    pub fn deny_next_resize(&mut self) {
        self.deny_next_resize = true;
    }

    /// Answer a pending resize request. Returns `Some(true)` when a
    /// negotiation was applied, `Some(false)` when rejected, `None` when
    /// nothing was pending.
    pub fn step_resize(&mut self) -> Result<Option<bool>, ServerError> {
        let page = self.map.page();
        if page.resized.load(Ordering::Acquire) != 1 {
            return Ok(None);
        }

        let requested = PageGeometry::from_page(page);
        let denied = std::mem::take(&mut self.deny_next_resize);
        if denied || requested.validate().is_err() {
            warn!(target: "shm.server", "resize rejected");
            page.resized.store(-1, Ordering::Release);
            core_sync::clear(&page.vsync);
            return Ok(Some(false));
        }

        let required = requested.required_size();
        if required != self.map.len() {
            ftruncate(self.map.fd(), required as i64)?;
            let _moved = self.map.remap(required)?;
        }
        let page = self.map.page();
        page.segment_size.store(required as u64, Ordering::Release);

        // device authentication token side-channel
        if requested.hints.contains(HintFlags::AUTH_TOKEN) {
            page.vpts.store(rand::random::<u64>(), Ordering::Release);
        }

        self.geom = requested;
        self.layout = map_av(&self.geom);

        debug!(target: "shm.server",
            w = self.geom.w, h = self.geom.h,
            vbufs = self.geom.vbuf_cnt, size = required, "resize applied");
        page.resized.store(0, Ordering::Release);
        core_sync::clear(&page.vsync);
        Ok(Some(true))
    }

    /// Index of a published-but-unconsumed video buffer.
    pub fn video_ready(&self) -> Option<usize> {
        let v = self.map.page().vready.load(Ordering::Acquire);
        if v == 0 { None } else { Some(v as usize - 1) }
    }

    /// The published video buffer's contents.
    pub fn video(&self, index: usize) -> Option<&[Pixel]> {
        let ofs = *self.layout.vbuf_ofs.get(index)?;
        let ptr = self.map.offset_ptr(ofs, self.layout.vbuf_sz)?;
        let span = (self.geom.w as usize) * (self.geom.h as usize);
        Some(unsafe { std::slice::from_raw_parts(ptr as *const Pixel, span) })
    }

    /// The dirty rectangle of the latest publish.
    pub fn dirty(&self) -> core_layout::Region {
        self.map.page().dirty.load()
    }

    /// Acknowledge the published video buffer: flip ownership back to the
    /// client and release its waiter.
    pub fn ack_video(&self) -> Result<(), ServerError> {
        let page = self.map.page();
        let v = page.vready.load(Ordering::Acquire);
        if v == 0 {
            return Ok(());
        }
        let bit = 1u32 << (v - 1);
        page.vpending.fetch_and(!bit, Ordering::Release);
        page.vready.store(0, Ordering::Release);
        core_sync::clear(&page.vsync);

        if HintFlags::from_bits_truncate(page.hints.load(Ordering::Acquire))
            .contains(HintFlags::VSIGNAL_EVENT)
        {
            let mut step = EventRecord::target(TargetKind::StepFrame);
            step.tgt_mut().ioevs[1].iv = 1;
            let _ = self.enqueue(&step);
        }
        Ok(())
    }

    /// Published audio payload (buffer index, used bytes).
    pub fn audio_ready(&self) -> Option<(usize, usize)> {
        let page = self.map.page();
        let a = page.aready.load(Ordering::Acquire);
        if a == 0 {
            return None;
        }
        let ind = a as usize - 1;
        let used = page.abufused[ind].load(Ordering::Acquire) as usize;
        Some((ind, used))
    }

    pub fn audio(&self, index: usize, used: usize) -> Option<&[core_layout::AudioSample]> {
        let ofs = *self.layout.abuf_ofs.get(index)?;
        let ptr = self.map.offset_ptr(ofs, self.layout.abuf_sz)?;
        let n = used.min(self.layout.abuf_sz) / size_of::<core_layout::AudioSample>();
        Some(unsafe {
            std::slice::from_raw_parts(ptr as *const core_layout::AudioSample, n)
        })
    }

    pub fn ack_audio(&self) -> Result<(), ServerError> {
        let page = self.map.page();
        let a = page.aready.load(Ordering::Acquire);
        if a == 0 {
            return Ok(());
        }
        let bit = 1u32 << (a - 1);
        page.apending.fetch_and(!bit, Ordering::Release);
        page.abufused[a as usize - 1].store(0, Ordering::Release);
        page.aready.store(0, Ordering::Release);
        core_sync::clear(&page.async_);
        Ok(())
    }

    /// Offer a subsegment: allocate a fresh page + socketpair, hand the
    /// client end and the page descriptor over in one message, then the
    /// NEWSEGMENT event naming the request.
    pub fn send_subsegment(
        &self,
        kind: u8,
        w: u32,
        h: u32,
        req_id: u32,
        opts: AllocOpts,
    ) -> Result<ServerSegment, ServerError> {
        let (child, client_end) = ServerSegment::allocate_pair(w, h, opts)?;
        let page_dup = child.dup_page_fd().ok_or(ServerError::QueueFull)?;

        let mut ev = EventRecord::target(TargetKind::NewSegment);
        ev.tgt_mut().ioevs[1].iv = req_id as i32;
        ev.tgt_mut().ioevs[2].iv = kind as i32;
        ev.tgt_mut().ioevs[3].iv = child.token() as i32;

        self.enqueue_with_fds(
            &ev,
            &[client_end.as_raw_fd(), page_dup.as_raw_fd()],
        )?;
        // the client owns the transferred copies now
        drop(client_end);
        drop(page_dup);
        Ok(child)
    }

    /// Refuse a segment request.
    pub fn request_fail(&self, req_id: u32) -> Result<(), ServerError> {
        let mut ev = EventRecord::target(TargetKind::RequestFail);
        ev.tgt_mut().ioevs[0].iv = req_id as i32;
        self.enqueue(&ev)
    }

    /// Read back the client's exit reason.
    pub fn last_words(&self) -> String {
        self.map.page().read_last_words()
    }

    /// Graceful teardown: EXIT to the client, then pull the switch and
    /// release every waiter.
    pub fn shutdown(&mut self) {
        let _ = self.enqueue(&EventRecord::target(TargetKind::Exit));
        let page = self.map.page();
        page.pull_dms();
        core_sync::clear(&page.esync);
        core_sync::clear(&page.vsync);
        core_sync::clear(&page.async_);
        let _ = nix::sys::socket::shutdown(
            self.sock.as_raw_fd(),
            nix::sys::socket::Shutdown::Both,
        );
    }

    /// Crash simulation: close every resource without touching the page,
    /// as a `SIGKILL`ed server would. (Dropping the segment without
    /// calling [`ServerSegment::shutdown`] behaves the same way.)
    pub fn abandon(self) {
        drop(self);
    }
}

/// A bound, named connection point.
pub struct ConnPoint {
    listener: std::os::unix::net::UnixListener,
    path: PathBuf,
}

impl ConnPoint {
    /// Bind a connection point at an absolute path. A stale socket file
    /// is replaced.
    pub fn bind(path: &Path) -> Result<Self, ServerError> {
        let _ = std::fs::remove_file(path);
        let listener = std::os::unix::net::UnixListener::bind(path)?;
        info!(target: "shm.server", path = %path.display(), "connection point bound");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept one client: greet with the fd-over-socket key, push the
    /// page descriptor, return the connected segment.
    pub fn accept(&self, w: u32, h: u32, opts: AllocOpts) -> Result<ServerSegment, ServerError> {
        let (stream, _) = self.listener.accept()?;
        let sock: OwnedFd = stream.into();

        nix::unistd::write(&sock, b"@\n")?;
        let seg = ServerSegment::allocate(sock, w, h, opts)?;
        seg.send_page_fd()?;
        Ok(seg)
    }
}

impl Drop for ConnPoint {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Parameters for the standard preroll burst.
#[derive(Debug, Clone, Copy)]
pub struct PrerollOpts {
    pub display_w: u32,
    pub display_h: u32,
    pub rate: u32,
    pub density: f32,
    pub font_fd: Option<RawFd>,
    pub font_size_mm: f32,
}

impl Default for PrerollOpts {
    fn default() -> Self {
        Self {
            display_w: 1920,
            display_h: 1080,
            rate: 60,
            density: core_layout::DEFAULT_PPCM,
            font_fd: None,
            font_size_mm: 3.527_780,
        }
    }
}

impl ServerSegment {
    /// Send the initial hint burst terminated by ACTIVATE.
    pub fn preroll(&self, opts: PrerollOpts) -> Result<(), ServerError> {
        let mut out = EventRecord::target(TargetKind::OutputHint);
        out.tgt_mut().ioevs[0].iv = opts.display_w as i32;
        out.tgt_mut().ioevs[1].iv = opts.display_h as i32;
        out.tgt_mut().ioevs[2].iv = opts.rate as i32;
        self.enqueue(&out)?;

        let mut dh = EventRecord::target(TargetKind::DisplayHint);
        dh.tgt_mut().ioevs[0].iv = self.geom.w as i32;
        dh.tgt_mut().ioevs[1].iv = self.geom.h as i32;
        dh.tgt_mut().ioevs[4].fv = opts.density;
        self.enqueue(&dh)?;

        if let Some(fd) = opts.font_fd {
            let mut fh = EventRecord::target(TargetKind::FontHint);
            fh.tgt_mut().ioevs[1].iv = 1;
            fh.tgt_mut().ioevs[2].fv = opts.font_size_mm;
            self.enqueue_with_fds(&fh, &[fd])?;
        }

        self.enqueue(&EventRecord::target(TargetKind::Activate))
    }

    /// Wait (bounded) for the client's REGISTER and return its identity.
    pub fn await_register(
        &self,
        budget: std::time::Duration,
    ) -> Option<([u64; 2], u8)> {
        let deadline = std::time::Instant::now() + budget;
        loop {
            for ev in self.poll() {
                if ev.is_external(ExternalKind::Register) {
                    let reg = unsafe { ev.ext().body.register };
                    return Some((reg.guid, reg.segkind));
                }
            }
            if std::time::Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_page_passes_integrity() {
        let (seg, _client) =
            ServerSegment::allocate_pair(32, 32, AllocOpts::default()).expect("allocate");
        seg.map_page_check().expect("cookie and version valid");
        assert!(seg.alive());
        assert_eq!(seg.width(), 32);
    }

    #[test]
    fn oversized_allocation_is_refused() {
        let opts = AllocOpts {
            vbuf_cnt: VBUF_LIMIT as u32,
            ..Default::default()
        };
        assert!(ServerSegment::allocate_pair(
            core_layout::MAX_W,
            core_layout::MAX_H,
            opts
        )
        .is_err());
    }

    #[test]
    fn segment_tokens_are_distinct() {
        let (a, _ca) =
            ServerSegment::allocate_pair(16, 16, AllocOpts::default()).expect("a");
        let (b, _cb) =
            ServerSegment::allocate_pair(16, 16, AllocOpts::default()).expect("b");
        assert_ne!(a.token(), b.token());
    }

    #[test]
    fn shutdown_pulls_the_switch() {
        let (mut seg, _client) =
            ServerSegment::allocate_pair(16, 16, AllocOpts::default()).expect("allocate");
        assert!(seg.alive());
        seg.shutdown();
        assert!(!seg.alive());
    }
}

impl ServerSegment {
    #[cfg(test)]
    fn map_page_check(&self) -> Result<(), core_layout::LayoutError> {
        self.map.page().integrity_check()
    }
}
