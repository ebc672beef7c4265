//! Subsegment allocation: server-offered and client-requested variants,
//! including the acquire-loop event detour.

use core_client::{Context, ContextFlags, PageKey, SegmentKind, ShmError};
use core_events::{EventRecord, TargetKind};
use core_server::{AllocOpts, ServerSegment};

fn opts() -> AllocOpts {
    AllocOpts {
        parent_pid: Some(0),
        ..Default::default()
    }
}

fn pair() -> (ServerSegment, Context) {
    let (seg, client_sock) = ServerSegment::allocate_pair(32, 32, opts()).expect("allocate");
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
fn offered_subsegment_is_acquired() {
    let (seg, mut ctx) = pair();

    let child_srv = seg
        .send_subsegment(SegmentKind::Popup as u8, 64, 32, 0, opts())
        .expect("offer");

    let ev = ctx.wait().expect("newsegment");
    assert_eq!(ev.target_kind(), Some(TargetKind::NewSegment));
    assert_eq!(ev.tgt().ioevs[2].iv(), SegmentKind::Popup as i32);

    let child = ctx
        .acquire(SegmentKind::Unknown, ContextFlags::empty())
        .expect("acquire");
    assert_eq!(child.segment_kind(), SegmentKind::Popup);
    assert_eq!(child.width(), 64);
    assert_eq!(child.height(), 32);
    assert_ne!(child.segment_token(), ctx.segment_token());
    assert!(child.alive());

    // the child registered on its own ring
    let (guid, kind) = child_srv
        .await_register(std::time::Duration::from_secs(1))
        .expect("child register");
    assert_eq!(kind, SegmentKind::Popup as u8);
    assert_eq!(guid, child.guid());
}

#[test]
fn acquire_without_pending_segment_fails() {
    let (_seg, mut ctx) = pair();
    assert!(matches!(
        ctx.acquire(SegmentKind::Popup, ContextFlags::empty()),
        Err(ShmError::NoSegment)
    ));
}

#[test]
fn request_loop_buffers_unrelated_events() {
    let (seg, mut ctx) = pair();

    // an unrelated event sits in front of the response; it must reach
    // the application after the acquire, not get lost
    let mut note = EventRecord::target(TargetKind::Message);
    note.set_message("while-you-were-waiting");
    seg.enqueue(&note).expect("queue note");

    let _child_srv = seg
        .send_subsegment(SegmentKind::Popup as u8, 32, 32, 7, opts())
        .expect("respond");

    let mut buffered = Vec::new();
    let child = ctx
        .request_segment(SegmentKind::Popup, 7, 32, 32, &mut buffered)
        .expect("acquire loop");

    assert!(child.alive());
    assert_eq!(buffered.len(), 1);
    assert_eq!(
        buffered[0].event.target_kind(),
        Some(TargetKind::Message)
    );
    assert_eq!(buffered[0].event.message(), "while-you-were-waiting");

    // the server observed the SEGREQ with the right id
    let segreq = seg
        .poll()
        .into_iter()
        .find(|e| e.is_external(core_events::ExternalKind::SegReq))
        .expect("segreq observed");
    let body = unsafe { segreq.ext().body.segreq };
    assert_eq!(body.id, 7);
    assert_eq!(body.kind, SegmentKind::Popup as u8);
}

#[test]
fn request_fail_propagates_the_id() {
    let (seg, mut ctx) = pair();

    seg.request_fail(9).expect("refuse");

    let mut buffered = Vec::new();
    let err = ctx
        .request_segment(SegmentKind::Clipboard, 9, 0, 0, &mut buffered)
        .expect_err("refused");
    assert!(matches!(err, ShmError::RequestFailed(9)));
    assert!(buffered.is_empty());
}

#[test]
fn newsegment_with_mismatched_id_is_buffered_until_match() {
    let (seg, mut ctx) = pair();

    // response for someone else's request, then ours
    let _other = seg
        .send_subsegment(SegmentKind::Icon as u8, 16, 16, 3, opts())
        .expect("other response");
    let _ours = seg
        .send_subsegment(SegmentKind::Popup as u8, 32, 32, 4, opts())
        .expect("our response");

    let mut buffered = Vec::new();
    let child = ctx
        .request_segment(SegmentKind::Popup, 4, 32, 32, &mut buffered)
        .expect("match on id 4");
    assert_eq!(child.segment_kind(), SegmentKind::Popup);

    assert_eq!(buffered.len(), 1);
    assert_eq!(
        buffered[0].event.target_kind(),
        Some(TargetKind::NewSegment)
    );
    // the detoured offer keeps its descriptor alive for the caller
    assert!(buffered[0].fd.is_some());
}
