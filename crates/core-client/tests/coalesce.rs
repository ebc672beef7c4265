//! Hint-storm coalescing and pause aggregation through a loopback pair.

use std::io::Write;
use std::os::fd::AsRawFd;

use core_client::{Context, ContextFlags, PageKey, SegmentKind};
use core_events::{BAD_FD, EventRecord, TargetKind};
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
        ContextFlags::empty(),
    )
    .expect("client context");
    (seg, ctx)
}

fn displayhint(w: i32, h: i32, density: f32, token: u32) -> EventRecord {
    let mut ev = EventRecord::target(TargetKind::DisplayHint);
    ev.tgt_mut().ioevs[0].iv = w;
    ev.tgt_mut().ioevs[1].iv = h;
    ev.tgt_mut().ioevs[4].fv = density;
    ev.tgt_mut().ioevs[7].uv = token;
    ev
}

#[test]
fn displayhint_storm_collapses_to_one_merged_event() {
    let (seg, mut ctx) = pair();

    seg.enqueue(&displayhint(800, 600, 38.0, 1)).unwrap();
    seg.enqueue(&displayhint(820, 600, 0.0, 1)).unwrap();
    seg.enqueue(&displayhint(0, 0, 42.0, 1)).unwrap();

    let ev = ctx.poll().expect("pump").expect("one event");
    assert_eq!(ev.target_kind(), Some(TargetKind::DisplayHint));
    assert_eq!(ev.tgt().ioevs[0].iv(), 820);
    assert_eq!(ev.tgt().ioevs[1].iv(), 600);
    assert_eq!(ev.tgt().ioevs[4].fv(), 42.0);

    assert!(ctx.poll().expect("pump").is_none(), "storm fully absorbed");
}

#[test]
fn displayhints_with_different_tokens_stay_apart() {
    let (seg, mut ctx) = pair();

    seg.enqueue(&displayhint(800, 600, 38.0, 1)).unwrap();
    seg.enqueue(&displayhint(400, 300, 20.0, 2)).unwrap();

    let first = ctx.poll().unwrap().expect("first");
    assert_eq!(first.tgt().ioevs[0].iv(), 800);
    assert_eq!(first.tgt().ioevs[7].uv(), 1);

    let second = ctx.poll().unwrap().expect("second");
    assert_eq!(second.tgt().ioevs[0].iv(), 400);
    assert_eq!(second.tgt().ioevs[7].uv(), 2);
}

#[test]
fn stepframe_with_same_id_is_delivered_once() {
    let (seg, mut ctx) = pair();

    let mut step = EventRecord::target(TargetKind::StepFrame);
    step.tgt_mut().ioevs[0].iv = 100;
    step.tgt_mut().ioevs[1].iv = 2;
    seg.enqueue(&step).unwrap();
    step.tgt_mut().ioevs[0].iv = 101;
    seg.enqueue(&step).unwrap();

    let ev = ctx.poll().unwrap().expect("one stepframe");
    assert_eq!(ev.target_kind(), Some(TargetKind::StepFrame));
    assert_eq!(ev.tgt().ioevs[0].iv(), 101, "older duplicate suppressed");
    assert!(ctx.poll().unwrap().is_none());
}

#[test]
fn stepframe_with_distinct_ids_all_arrive() {
    let (seg, mut ctx) = pair();

    for id in [2, 3] {
        let mut step = EventRecord::target(TargetKind::StepFrame);
        step.tgt_mut().ioevs[1].iv = id;
        seg.enqueue(&step).unwrap();
    }

    assert_eq!(ctx.poll().unwrap().expect("first").tgt().ioevs[1].iv(), 2);
    assert_eq!(ctx.poll().unwrap().expect("second").tgt().ioevs[1].iv(), 3);
}

#[test]
fn pause_aggregates_hints_until_unpause() {
    let (seg, mut ctx) = pair();

    let mut font = tempfile::tempfile().unwrap();
    write!(font, "font-f1").unwrap();
    font.flush().unwrap();

    seg.enqueue(&EventRecord::target(TargetKind::Pause)).unwrap();

    let mut fh = EventRecord::target(TargetKind::FontHint);
    fh.tgt_mut().ioevs[1].iv = 1;
    fh.tgt_mut().ioevs[2].fv = 5.0;
    seg.enqueue_with_fds(&fh, &[font.as_raw_fd()]).unwrap();

    seg.enqueue(&displayhint(1024, 768, 0.0, 0)).unwrap();

    // nothing is application visible while paused
    assert!(ctx.poll().expect("pump").is_none());

    seg.enqueue(&EventRecord::target(TargetKind::Unpause)).unwrap();

    // exactly one displayhint and one fonthint come out, nothing else
    let mut got_dh = None;
    let mut got_fh = None;
    while let Some(ev) = ctx.poll().expect("pump") {
        match ev.target_kind() {
            Some(TargetKind::DisplayHint) => {
                assert!(got_dh.is_none(), "displayhint delivered twice");
                got_dh = Some(ev);
            }
            Some(TargetKind::FontHint) => {
                assert!(got_fh.is_none(), "fonthint delivered twice");
                assert_ne!(ev.tgt().ioevs[0].iv(), BAD_FD, "descriptor preserved");
                got_fh = Some(ev);
            }
            other => panic!("unexpected event during replay: {:?}", other),
        }
    }

    let dh = got_dh.expect("aggregated displayhint");
    assert_eq!(dh.tgt().ioevs[0].iv(), 1024);
    assert_eq!(dh.tgt().ioevs[1].iv(), 768);

    let fh = got_fh.expect("aggregated fonthint");
    assert_eq!(fh.tgt().ioevs[2].fv(), 5.0);
}

#[test]
fn exit_is_visible_through_pause_and_final() {
    let (seg, mut ctx) = pair();

    seg.enqueue(&EventRecord::target(TargetKind::Pause)).unwrap();
    seg.enqueue(&EventRecord::target(TargetKind::Exit)).unwrap();

    let ev = ctx.wait().expect("exit reaches the caller");
    assert_eq!(ev.target_kind(), Some(TargetKind::Exit));

    // EXIT is the last event ever delivered
    assert!(ctx.poll().is_err());
}
