//! Liveness: the dead-man switch terminates every blocking wait, and a
//! graceful server shutdown still delivers EXIT first.

use std::time::{Duration, Instant};

use core_client::{Context, ContextFlags, PageKey, SegmentKind, SignalMask};
use core_events::TargetKind;
use core_server::{AllocOpts, ServerSegment};

fn pair() -> (ServerSegment, Context) {
    let (seg, client_sock) = ServerSegment::allocate_pair(
        32,
        32,
        AllocOpts {
            parent_pid: Some(0),
            ..Default::default()
        },
    )
    .expect("allocate");
    seg.send_page_fd().expect("page fd");
    let ctx = Context::from_socket(
        client_sock,
        PageKey::FromSocket,
        SegmentKind::Application,
        ContextFlags::NO_AUTO_RECONNECT,
    )
    .expect("client context");
    (seg, ctx)
}

#[test]
fn blocked_wait_terminates_on_shutdown() {
    let (seg, mut ctx) = pair();

    let killer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        let mut seg = seg;
        seg.shutdown();
        seg
    });

    // EXIT is queued by the shutdown; the blocking wait must return it
    let start = Instant::now();
    let ev = ctx.wait().expect("exit delivered");
    assert_eq!(ev.target_kind(), Some(TargetKind::Exit));
    assert!(start.elapsed() < Duration::from_secs(3));

    let _ = killer.join();
}

#[test]
fn blocked_signal_releases_when_the_switch_drops() {
    let (seg, mut ctx) = pair();

    let killer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        let mut seg = seg;
        seg.shutdown();
        seg
    });

    // nobody acknowledges: without the switch this would block forever
    let start = Instant::now();
    let _ = ctx.signal(SignalMask::VIDEO).expect("signal returns");
    assert!(start.elapsed() < Duration::from_secs(3));
    assert!(!ctx.alive());

    let _ = killer.join();
}

#[test]
fn socket_eof_is_detected_by_the_watchdog() {
    let (seg, ctx) = pair();

    // crash, not shutdown: the page is never touched
    seg.abandon();

    let deadline = Instant::now() + Duration::from_secs(5);
    while ctx.alive() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(!ctx.alive(), "peer loss observed within the probe period");
}

#[test]
fn dead_context_refuses_enqueue_without_fallback() {
    let (seg, mut ctx) = pair();
    seg.abandon();

    let deadline = Instant::now() + Duration::from_secs(5);
    while ctx.alive() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }

    // NO_AUTO_RECONNECT and no fallback endpoint: unusable state
    let ev = core_events::EventRecord::external(core_events::ExternalKind::Message);
    assert!(ctx.enqueue(&ev).is_err());
    assert!(ctx.try_enqueue(&ev).is_err());
}
