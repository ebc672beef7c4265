//! Mapping and remapping of the shared page.
//!
//! Every page access funnels through [`PageMap`]: it owns the descriptor
//! and the mapping, revalidates the authoritative `segment_size` before
//! pointers are derived, and is the only place that calls mmap. Mapping
//! failures and size skew surface to callers as errors that end in a
//! cleared dead-man switch, never as a stray fault.

use std::num::NonZeroUsize;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::ptr::NonNull;

use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap};
use tracing::{debug, warn};

use core_layout::{SharedPage, START_SZ};

use crate::ShmError;

pub struct PageMap {
    base: NonNull<libc::c_void>,
    len: usize,
    fd: OwnedFd,
}

// The mapping is process-shared memory; the watchdog and the pump access
// disjoint words through atomics.
unsafe impl Send for PageMap {}

impl PageMap {
    /// Map a page from its descriptor: initial mapping at the agreed
    /// start size, then remap to the authoritative `segment_size` the
    /// allocator wrote into the prefix.
    pub fn from_fd(fd: OwnedFd) -> Result<Self, ShmError> {
        let len = NonZeroUsize::new(START_SZ).expect("nonzero start size");
        let base = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd.as_fd(),
                0,
            )?
        };

        let mut map = Self {
            base: base.cast(),
            len: START_SZ,
            fd,
        };

        let authoritative = map.page().segment_size.load(std::sync::atomic::Ordering::Acquire) as usize;
        if authoritative != START_SZ && authoritative != 0 {
            debug!(target: "shm.page", size = authoritative, "initial size differs, remapping");
            map.remap(authoritative)?;
        }

        Ok(map)
    }

    /// Map a page whose size is already known, for the allocating side:
    /// the prefix is not yet initialised, so `segment_size` cannot be
    /// trusted.
    pub fn from_fd_sized(fd: OwnedFd, len: usize) -> Result<Self, ShmError> {
        let nz = NonZeroUsize::new(len).ok_or(ShmError::Dead)?;
        let base = unsafe {
            mmap(
                None,
                nz,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd.as_fd(),
                0,
            )?
        };
        Ok(Self {
            base: base.cast(),
            len,
            fd,
        })
    }

    /// Open a named shared-memory object and map it.
    pub fn from_name(name: &str) -> Result<Self, ShmError> {
        use nix::fcntl::OFlag;
        use nix::sys::mman::shm_open;
        use nix::sys::stat::Mode;

        // An open below the stdio range means stdio is closed; a later
        // printf would then write into the page and corrupt the cookie.
        let fd = shm_open(name, OFlag::O_RDWR, Mode::S_IRWXU)?;
        if fd.as_raw_fd() <= 2 {
            drop(fd);
            if !core_wire::ensure_stdio() {
                return Err(ShmError::Dead);
            }
            let fd = shm_open(name, OFlag::O_RDWR, Mode::S_IRWXU)?;
            return Self::from_fd(fd);
        }
        Self::from_fd(fd)
    }

    pub fn page(&self) -> &SharedPage {
        unsafe { &*(self.base.as_ptr() as *const SharedPage) }
    }

    pub fn page_ptr(&self) -> *mut SharedPage {
        self.base.as_ptr() as *mut SharedPage
    }

    pub fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn fd(&self) -> &OwnedFd {
        &self.fd
    }

    /// Pointer to a buffer at a derived offset. The offset is validated
    /// against the live mapping, so a peer shrinking the file behind our
    /// back yields `None` rather than a fault.
    pub fn offset_ptr(&self, ofs: usize, span: usize) -> Option<*mut u8> {
        if ofs + span > self.len {
            return None;
        }
        Some(unsafe { (self.base.as_ptr() as *mut u8).add(ofs) })
    }

    /// Remap after a size change. Returns true when the base address moved.
    pub fn remap(&mut self, new_len: usize) -> Result<bool, ShmError> {
        let old_base = self.base;
        unsafe {
            munmap(self.base.cast(), self.len)?;
        }
        let len = NonZeroUsize::new(new_len).ok_or(ShmError::Dead)?;
        let base = unsafe {
            mmap(
                Some(NonZeroUsize::new(old_base.as_ptr() as usize).unwrap()),
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                self.fd.as_fd(),
                0,
            )?
        };
        self.base = base.cast();
        self.len = new_len;
        let moved = self.base != old_base;
        if moved {
            debug!(target: "shm.page", "remap moved the base address");
        }
        Ok(moved)
    }

    /// Move this mapping to a hinted base address, used by the migration
    /// engine so caller-held references stay valid across a reconnect.
    /// Best effort: the kernel may place the mapping elsewhere, in which
    /// case the returned flag is false and aliasing callers are on their
    /// own. The backing file keeps the contents either way.
    pub fn try_rebase(&mut self, hint: usize) -> Result<bool, ShmError> {
        if self.base.as_ptr() as usize == hint {
            return Ok(true);
        }
        unsafe {
            munmap(self.base.cast(), self.len)?;
        }
        let nz = NonZeroUsize::new(self.len).ok_or(ShmError::Dead)?;
        let base = unsafe {
            mmap(
                NonZeroUsize::new(hint),
                nz,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                self.fd.as_fd(),
                0,
            )?
        };
        self.base = base.cast();
        let hit = self.base.as_ptr() as usize == hint;
        if !hit {
            warn!(target: "shm.page",
                "could not remap at the previous base, aliasing callers will break");
        }
        Ok(hit)
    }
}

impl Drop for PageMap {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.base.cast(), self.len);
        }
    }
}
