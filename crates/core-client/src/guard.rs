//! The per-context watchdog.
//!
//! A detached thread checks once per second that the peer is alive (parent
//! pid and/or socket probe). On death it pulls the dead-man switch, clears
//! a local mirror of it (the page may be gone or truncated by then),
//! releases all three sync slots so no waiter sleeps through the event,
//! and shuts down the socket to unblock any descriptor fetch.
//!
//! The guard mutex protects only the pointer state across remap; it is not
//! taken on the per-operation fast path.

use std::os::fd::RawFd;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU8, AtomicU32, Ordering};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::socket::{MsgFlags, Shutdown, recv, shutdown};
use tracing::{info, warn};

pub struct GuardShared {
    pub active: AtomicBool,
    /// Mirror of the page DMS that survives the page itself.
    pub local_dms: AtomicBool,
    pub dms: AtomicPtr<AtomicU8>,
    /// Event, video, audio sync slots.
    pub slots: [AtomicPtr<AtomicU32>; 3],
    pub parent_pid: AtomicI32,
    pub parent_fd: AtomicI32,
    /// Protects the pointers above across remap.
    pub synch: Mutex<()>,
}

impl GuardShared {
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            local_dms: AtomicBool::new(true),
            dms: AtomicPtr::new(std::ptr::null_mut()),
            slots: [
                AtomicPtr::new(std::ptr::null_mut()),
                AtomicPtr::new(std::ptr::null_mut()),
                AtomicPtr::new(std::ptr::null_mut()),
            ],
            parent_pid: AtomicI32::new(0),
            parent_fd: AtomicI32::new(-1),
            synch: Mutex::new(()),
        }
    }

    /// Re-target the guard after a remap or migration; caller holds no
    /// page references while this runs.
    pub fn resynch(
        &self,
        dms: *mut AtomicU8,
        slots: [*mut AtomicU32; 3],
        parent_pid: i32,
        parent_fd: RawFd,
    ) {
        let _lock = self.synch.lock().unwrap_or_else(|e| e.into_inner());
        self.dms.store(dms, Ordering::Release);
        for (slot, ptr) in self.slots.iter().zip(slots) {
            slot.store(ptr, Ordering::Release);
        }
        self.parent_pid.store(parent_pid, Ordering::Release);
        self.parent_fd.store(parent_fd, Ordering::Release);
    }

    /// Detach the guard from the page; the thread exits on its next tick.
    pub fn release(&self) {
        self.dms.store(std::ptr::null_mut(), Ordering::Release);
        self.active.store(false, Ordering::Release);
    }

    /// The consolidated liveness check: local mirror and page switch.
    pub fn dms_alive(&self) -> bool {
        if !self.local_dms.load(Ordering::Acquire) {
            return false;
        }
        let dms = self.dms.load(Ordering::Acquire);
        if dms.is_null() {
            return true;
        }
        unsafe { (*dms).load(Ordering::Acquire) != 0 }
    }

    /// Pull the switch from this side and release every waiter.
    pub fn pull(&self) {
        let _lock = self.synch.lock().unwrap_or_else(|e| e.into_inner());
        let dms = self.dms.load(Ordering::Acquire);
        if !dms.is_null() {
            unsafe { (*dms).store(0, Ordering::Release) };
        }
        self.local_dms.store(false, Ordering::Release);
        for slot in &self.slots {
            let p = slot.load(Ordering::Acquire);
            if !p.is_null() {
                core_sync::clear(unsafe { &*p });
            }
        }
    }
}

impl Default for GuardShared {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot probe of the peer, used by forced fallback to refuse
/// recovery while the other side is demonstrably alive.
pub(crate) fn peer_probe(guard: &GuardShared) -> bool {
    parent_alive(guard)
}

fn parent_alive(guard: &GuardShared) -> bool {
    let pid = guard.parent_pid.load(Ordering::Acquire);
    if pid > 0 {
        let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok();
        if !alive {
            return false;
        }
    }

    let fd = guard.parent_fd.load(Ordering::Acquire);
    if fd != -1 {
        let mut ch = [0u8; 1];
        match recv(fd, &mut ch, MsgFlags::MSG_PEEK | MsgFlags::MSG_DONTWAIT) {
            // orderly shutdown counts as death on a stream socket
            Ok(0) => return false,
            Ok(_) => {}
            Err(Errno::EWOULDBLOCK) | Err(Errno::EINTR) => {}
            Err(_) => return false,
        }
    }

    true
}

/// Spawn the watchdog. The thread detaches itself; dropping the context
/// releases it rather than joining.
pub fn spawn(guard: crate::GuardHandle) {
    guard.active.store(true, Ordering::Release);
    let res = std::thread::Builder::new()
        .name("shm-watchdog".into())
        .spawn(move || watchdog(guard));
    if let Err(e) = res {
        warn!(target: "shm.guard", error = %e, "watchdog spawn failed");
    }
}

fn watchdog(guard: crate::GuardHandle) {
    while guard.active.load(Ordering::Acquire) {
        if !parent_alive(&guard) {
            info!(target: "shm.guard", "peer lost, pulling the dead-man switch");
            guard.pull();
            guard.active.store(false, Ordering::Release);

            // unblock any blocking recv in the descriptor fetcher
            let fd = guard.parent_fd.load(Ordering::Acquire);
            if fd != -1 {
                let _ = shutdown(fd, Shutdown::Both);
            }
            return;
        }
        std::thread::sleep(Duration::from_secs(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn pull_clears_local_and_slots() {
        let guard = Arc::new(GuardShared::new());
        let slot: &'static AtomicU32 = Box::leak(Box::new(AtomicU32::new(0)));
        core_sync::post(slot);
        let slot_ptr = slot as *const AtomicU32 as *mut AtomicU32;
        guard.resynch(
            std::ptr::null_mut(),
            [slot_ptr, std::ptr::null_mut(), std::ptr::null_mut()],
            0,
            -1,
        );

        assert!(guard.dms_alive());
        guard.pull();
        assert!(!guard.dms_alive());
        assert_eq!(slot.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn dead_parent_pid_is_detected() {
        // spawn a short-lived child and wait for it, then probe its pid
        let mut child = std::process::Command::new("true")
            .spawn()
            .expect("spawn true");
        let pid = child.id() as i32;
        child.wait().unwrap();

        let guard = GuardShared::new();
        guard.parent_pid.store(pid, Ordering::Release);
        assert!(!parent_alive(&guard));
    }
}
