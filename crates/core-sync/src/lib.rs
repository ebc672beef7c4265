//! Sync-slot primitives: single-word wakeup slots with blocking and
//! timed-wait semantics.
//!
//! A slot is armed by storing a sentinel and cleared by the consuming side;
//! waiters block while the sentinel is visible. Slots are only hints: every
//! waiter re-checks the condition it slept on after waking, and every wait
//! terminates early once the dead-man switch drops. On Linux the wait is a
//! futex on the slot word; elsewhere a 1 ms sleep loop stands in.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Value stored in an armed slot.
pub const SENTINEL: u32 = 0xFFFF_FFFF;

/// Bound of a single trywait step.
pub const TRYWAIT_STEP: Duration = Duration::from_millis(1);

/// Arm the slot: the producer has published and intends to block until the
/// consumer clears it.
pub fn post(slot: &AtomicU32) {
    slot.store(SENTINEL, Ordering::Release);
    wake(slot);
}

/// Clear the slot and release every waiter. Called by the consuming side
/// after acting on the published state, and by the watchdog when pulling
/// the dead-man switch.
pub fn clear(slot: &AtomicU32) {
    slot.store(0, Ordering::Release);
    wake(slot);
}

/// Block until the slot clears or `alive` reports the connection dead.
/// Returns true if the slot was observed clear.
pub fn wait(slot: &AtomicU32, alive: impl Fn() -> bool) -> bool {
    loop {
        if slot.load(Ordering::Acquire) != SENTINEL {
            return true;
        }
        if !alive() {
            return false;
        }
        futex_wait(slot, Some(Duration::from_millis(100)));
    }
}

/// Bounded wait: give the consumer roughly one [`TRYWAIT_STEP`] to clear
/// the slot, then report whether it is clear.
pub fn trywait(slot: &AtomicU32, alive: impl Fn() -> bool) -> bool {
    if slot.load(Ordering::Acquire) != SENTINEL {
        return true;
    }
    if !alive() {
        return false;
    }
    futex_wait(slot, Some(TRYWAIT_STEP));
    slot.load(Ordering::Acquire) != SENTINEL
}

#[cfg(target_os = "linux")]
fn futex_wait(slot: &AtomicU32, timeout: Option<Duration>) {
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(std::ptr::null(), |t| t as *const libc::timespec);
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            slot.as_ptr(),
            libc::FUTEX_WAIT,
            SENTINEL,
            ts_ptr,
        );
    }
}

#[cfg(target_os = "linux")]
fn wake(slot: &AtomicU32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            slot.as_ptr(),
            libc::FUTEX_WAKE,
            libc::INT_MAX,
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn futex_wait(_slot: &AtomicU32, _timeout: Option<Duration>) {
    std::thread::sleep(TRYWAIT_STEP);
}

#[cfg(not(target_os = "linux"))]
fn wake(_slot: &AtomicU32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    #[test]
    fn wait_returns_once_cleared() {
        let slot = Arc::new(AtomicU32::new(0));
        post(&slot);

        let waiter = {
            let slot = slot.clone();
            std::thread::spawn(move || wait(&slot, || true))
        };
        std::thread::sleep(Duration::from_millis(20));
        clear(&slot);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn wait_terminates_on_dead_switch() {
        let slot = Arc::new(AtomicU32::new(0));
        let alive = Arc::new(AtomicBool::new(true));
        post(&slot);

        let waiter = {
            let slot = slot.clone();
            let alive = alive.clone();
            std::thread::spawn(move || wait(&slot, || alive.load(Ordering::Relaxed)))
        };
        std::thread::sleep(Duration::from_millis(20));
        alive.store(false, Ordering::Relaxed);
        // The armed word is untouched; only the liveness check releases it.
        assert!(!waiter.join().unwrap());
        assert_eq!(slot.load(Ordering::Relaxed), SENTINEL);
    }

    #[test]
    fn trywait_bounds_the_block() {
        let slot = AtomicU32::new(0);
        post(&slot);
        let start = Instant::now();
        assert!(!trywait(&slot, || true));
        assert!(start.elapsed() < Duration::from_millis(500));

        clear(&slot);
        assert!(trywait(&slot, || true));
    }
}
