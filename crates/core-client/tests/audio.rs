//! Audio chain: queue, publish, consume, payload-length bookkeeping.

use core_client::{Context, ContextFlags, PageKey, ResizeExt, SegmentKind, SignalMask};
use core_server::{AllocOpts, ServerSegment};

fn pair(abuf_cnt: u32) -> (ServerSegment, Context) {
    let (seg, client_sock) = ServerSegment::allocate_pair(
        32,
        32,
        AllocOpts {
            parent_pid: Some(0),
            abuf_cnt,
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

#[test]
fn published_audio_reports_exact_payload() {
    let (seg, mut ctx) = pair(1);
    assert_eq!(ctx.samplerate(), core_layout::DEFAULT_SAMPLERATE);

    let samples: Vec<i16> = (0..441).map(|i| (i * 3) as i16).collect();
    assert_eq!(ctx.queue_audio(&samples), samples.len());

    ctx.signal(SignalMask::AUDIO | SignalMask::NONBLOCK)
        .expect("publish");

    let (index, used) = seg.audio_ready().expect("server sees audio");
    assert_eq!(index, 0);
    assert_eq!(used, samples.len() * size_of::<i16>());
    assert_eq!(seg.audio(index, used).expect("payload"), &samples[..]);

    seg.ack_audio().expect("ack");
    assert_eq!(seg.audio_ready(), None);
}

#[test]
fn empty_audio_signal_is_a_noop() {
    let (seg, mut ctx) = pair(1);
    ctx.signal(SignalMask::AUDIO | SignalMask::NONBLOCK)
        .expect("noop");
    assert_eq!(seg.audio_ready(), None);
}

#[test]
fn audio_chain_rotates_across_buffers() {
    let (seg, mut ctx) = pair(2);

    let a: Vec<i16> = vec![1; 100];
    let b: Vec<i16> = vec![2; 50];

    ctx.queue_audio(&a);
    ctx.signal(SignalMask::AUDIO | SignalMask::NONBLOCK).unwrap();
    let (i0, used0) = seg.audio_ready().expect("first");
    assert_eq!(i0, 0);
    assert_eq!(used0, 200);
    seg.ack_audio().unwrap();

    ctx.queue_audio(&b);
    ctx.signal(SignalMask::AUDIO | SignalMask::NONBLOCK).unwrap();
    let (i1, used1) = seg.audio_ready().expect("second");
    assert_eq!(i1, 1, "chain advanced to the next buffer");
    assert_eq!(used1, 100);
    assert_eq!(seg.audio(i1, used1).unwrap(), &b[..]);
}

#[test]
fn overfull_queue_returns_the_remainder() {
    let (_seg, mut ctx) = pair(1);
    let capacity = core_layout::DEFAULT_ABUF_SZ as usize / size_of::<i16>();

    let big: Vec<i16> = vec![7; capacity + 123];
    let taken = ctx.queue_audio(&big);
    assert_eq!(taken, capacity);
    // the rest belongs in the next buffer after a signal
    assert_eq!(ctx.queue_audio(&big[taken..]), 0);
}

#[test]
fn samplerate_renegotiation_applies() {
    let (seg, mut ctx) = pair(1);

    let server = std::thread::spawn(move || {
        let mut seg = seg;
        loop {
            if let Some(applied) = seg.step_resize().expect("step") {
                return (seg, applied);
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    });

    ctx.resize_ext(
        32,
        32,
        ResizeExt {
            samplerate: Some(44_100),
            abuf_cnt: Some(2),
            ..Default::default()
        },
    )
    .expect("renegotiate");
    assert_eq!(ctx.samplerate(), 44_100);

    let (_seg, applied) = server.join().unwrap();
    assert!(applied);
}
