//! Full handshake over an in-process loopback pair: preroll, resize,
//! first frame, ownership bitmap.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use core_client::{Context, ContextFlags, PageKey, ResetStatus, SegmentKind, SignalMask};
use core_layout::rgba;
use core_server::{AllocOpts, PrerollOpts, ServerSegment};

fn opts() -> AllocOpts {
    AllocOpts {
        // no pid tracking: liveness rides on the socket in-process
        parent_pid: Some(0),
        ..Default::default()
    }
}

fn pair(w: u32, h: u32) -> (ServerSegment, Context) {
    let (seg, client_sock) = ServerSegment::allocate_pair(w, h, opts()).expect("allocate");
    seg.send_page_fd().expect("page fd");
    let ctx = Context::from_socket(
        client_sock,
        PageKey::FromSocket,
        SegmentKind::Application,
        ContextFlags::empty(),
    )
    .expect("client context");
    (seg, ctx)
}

#[test]
fn minimal_handshake() {
    let (seg, mut ctx) = pair(32, 32);
    assert_eq!(ctx.width(), 32);
    assert_eq!(ctx.height(), 32);

    seg.preroll(PrerollOpts {
        display_w: 1920,
        display_h: 1080,
        density: 28.0,
        ..Default::default()
    })
    .expect("preroll burst");

    // server side: answer resizes and consume frames until the client
    // goes away
    let server = std::thread::spawn(move || {
        let mut seg = seg;
        let mut acked = 0u32;
        while seg.alive() {
            seg.step_resize().expect("resize step");
            if seg.video_ready().is_some() {
                seg.ack_video().expect("ack");
                acked += 1;
            }
            let _ = seg.poll();
            std::thread::sleep(Duration::from_millis(2));
        }
        (seg, acked)
    });

    ctx.preroll(false).expect("preroll");
    let initial = ctx.take_initial().expect("initial present");
    assert_eq!(initial.display_width_px, 1920);
    assert_eq!(initial.display_height_px, 1080);
    assert!((initial.density - 28.0).abs() < 0.5);

    // renegotiate and publish the first frame
    ctx.resize(640, 480).expect("resize");
    assert_eq!(ctx.width(), 640);
    assert_eq!(ctx.height(), 480);

    let pixel = rgba(10, 20, 30, 255);
    for px in ctx.video_mut() {
        *px = pixel;
    }
    ctx.signal(SignalMask::VIDEO).expect("signal");
    // blocking signal returns only after the acknowledge
    assert_eq!(ctx.signal_status().expect("status"), 0);

    drop(ctx);
    let (_seg, acked) = server.join().expect("server thread");
    assert!(acked >= 1, "server consumed the published frame");
}

#[test]
fn ownership_bitmap_flips_on_publish_and_ack() {
    let (seg, mut ctx) = pair(32, 32);

    for px in ctx.video_mut() {
        *px = rgba(255, 0, 255, 255);
    }
    ctx.signal(SignalMask::VIDEO | SignalMask::NONBLOCK)
        .expect("publish");

    // published: the slot belongs to the server now
    assert_eq!(ctx.signal_status().expect("status") & 1, 1);
    let index = seg.video_ready().expect("server sees the frame");
    assert_eq!(index, 0);
    assert_eq!(seg.video(index).expect("buffer")[0], rgba(255, 0, 255, 255));

    seg.ack_video().expect("ack");
    assert_eq!(ctx.signal_status().expect("status"), 0);
    assert_eq!(seg.video_ready(), None);
}

#[test]
fn resize_to_current_geometry_is_a_noop() {
    let (_seg, mut ctx) = pair(64, 64);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    ctx.on_reset(Box::new(move |status| {
        log.lock().unwrap().push(status);
    }));

    // no server involvement: the request must short-circuit locally
    ctx.resize(64, 64).expect("noop resize");
    assert_eq!(ctx.width(), 64);
    assert_eq!(*seen.lock().unwrap(), vec![ResetStatus::NoChange]);
}

#[test]
fn rejected_resize_keeps_the_old_layout() {
    let (mut seg, mut ctx) = pair(32, 32);
    seg.deny_next_resize();

    let server = std::thread::spawn(move || {
        let mut steps = 0;
        loop {
            if let Some(applied) = seg.step_resize().expect("step") {
                return (seg, applied);
            }
            steps += 1;
            if steps > 2000 {
                panic!("no resize request observed");
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    });

    let err = ctx.resize(640, 480).expect_err("rejection propagates");
    assert!(matches!(err, core_client::ShmError::ResizeRejected));
    assert_eq!(ctx.width(), 32, "old layout intact");
    assert_eq!(ctx.height(), 32);

    let (_seg, applied) = server.join().unwrap();
    assert!(!applied);
}

#[test]
fn external_event_round_trips_bit_for_bit() {
    let (seg, ctx) = pair(32, 32);

    let mut ev = core_events::EventRecord::external(core_events::ExternalKind::Viewport);
    ev.ext_mut().body.viewport = core_events::ViewportBody {
        x: -4,
        y: 7,
        w: 320,
        h: 200,
        parent_token: ctx.segment_token(),
        invisible: 1,
        focus: 0,
    };
    ctx.try_enqueue(&ev).expect("enqueue");

    let got = seg
        .poll()
        .into_iter()
        .find(|e| e.is_external(core_events::ExternalKind::Viewport))
        .expect("viewport arrives");
    assert_eq!(got.as_bytes(), ev.as_bytes());
}

#[test]
fn last_words_reach_the_server() {
    let (seg, mut ctx) = pair(32, 32);
    ctx.last_words("caller asked us to stop");
    drop(ctx);
    assert_eq!(seg.last_words(), "caller asked us to stop");
    assert!(!seg.alive(), "voluntary exit pulls the switch");
}
