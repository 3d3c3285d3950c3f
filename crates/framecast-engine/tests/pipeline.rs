use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;

use framecast_engine::gpu::{CommandStatus, ManualCommandBuffer, SoftwareQueue, SoftwareTexture, SourceTexture};
use framecast_engine::surface::HeapAllocator;
use framecast_engine::{
    PipelineEvent, PixelFormat, Region, ShareConfig, ShareError, SharePipeline, StopReport, Submission,
    SurfaceBackend,
};

fn config() -> ShareConfig {
    ShareConfig {
        server_name: "pipeline-test".into(),
        surface_backend: SurfaceBackend::Heap,
        bind_addr: None,
        drain_timeout_ms: 100,
        leak_timeout_ms: 50,
        ..ShareConfig::default()
    }
}

fn start(cfg: ShareConfig) -> SharePipeline {
    SharePipeline::start_with_allocator(cfg, Arc::new(HeapAllocator)).unwrap()
}

/// Render one frame on the software GPU and hand it to the pipeline.
fn render(p: &SharePipeline, queue: &SoftwareQueue, tex: &Arc<SoftwareTexture>, seed: u8) -> u64 {
    let cb = queue.command_buffer();
    let t = tex.clone();
    cb.encode(move || t.fill_test_pattern(seed));
    let sub = p.publish(tex.clone(), Region::full(tex.width(), tex.height()), false, cb.as_ref());
    queue.commit(&cb).unwrap();
    sub.seq()
}

fn wait_for(events: &Receiver<PipelineEvent>, want: impl Fn(&PipelineEvent) -> bool) -> PipelineEvent {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(left) {
            Ok(ev) if want(&ev) => return ev,
            Ok(_) => {}
            Err(_) => panic!("event not seen in time"),
        }
    }
}

fn published(seq: u64) -> impl Fn(&PipelineEvent) -> bool {
    move |ev| matches!(ev, PipelineEvent::FramePublished { seq: s, .. } if *s == seq)
}

#[test]
fn late_consumer_sees_current_and_following_frames() {
    let p = start(config());
    let events = p.events();
    let queue = SoftwareQueue::new().unwrap();
    let tex = Arc::new(SoftwareTexture::new(100, 100, PixelFormat::Rgba8));

    for seed in 1..=3u8 {
        let seq = render(&p, &queue, &tex, seed);
        wait_for(&events, published(seq));
    }

    let mut consumer = p.local_consumer("late").unwrap();
    let mut seen = Vec::new();
    let first = consumer.fetch(Duration::from_secs(2)).unwrap().unwrap();
    seen.push(first.seq);
    assert_eq!(first.pixel(10, 20), Some(&[10u8, 20, 3, 255][..]));

    for seed in 4..=5u8 {
        render(&p, &queue, &tex, seed);
        let f = consumer.fetch(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!((f.width, f.height, f.stride), (100, 100, 400));
        assert_eq!(f.pixel(99, 99), Some(&[99u8, 99, seed, 255][..]));
        seen.push(f.seq);
    }
    assert_eq!(seen, vec![3, 4, 5]);
    assert_eq!(p.registry().stats().pinned_refs, 0);
}

#[test]
fn memory_stays_bounded_with_a_stuck_consumer() {
    let p = start(config());
    let events = p.events();
    let consumer = p.local_consumer("stuck").unwrap();
    let tex = Arc::new(SoftwareTexture::new(32, 32, PixelFormat::Rgba8));

    // Pin the first frame and never release it.
    let cb = ManualCommandBuffer::new();
    p.publish(tex.clone(), Region::full(32, 32), false, &cb);
    cb.complete(CommandStatus::Completed);
    wait_for(&events, published(1));
    let ann = p.server().current_announcement().unwrap();
    consumer.map(&ann).unwrap();

    for _ in 0..200 {
        let cb = ManualCommandBuffer::new();
        let sub = p.publish(tex.clone(), Region::full(32, 32), false, &cb);
        assert!(sub.is_accepted(), "{sub:?}");
        cb.complete(CommandStatus::Completed);
        wait_for(&events, published(sub.seq()));
    }

    let st = p.registry().stats();
    assert!(st.live_surfaces <= 3, "{st:?}");
    assert_eq!(st.allocations, 3);
    assert_eq!(st.allocated_bytes, 3 * 32 * 32 * 4);
    assert_eq!(st.pinned_refs, 1);
}

#[test]
fn resize_drops_one_frame_then_continues() {
    let p = start(config());
    let events = p.events();
    let small = Arc::new(SoftwareTexture::new(50, 50, PixelFormat::Rgba8));
    let big = Arc::new(SoftwareTexture::new(100, 100, PixelFormat::Rgba8));

    let cb = ManualCommandBuffer::new();
    p.publish(big.clone(), Region::full(100, 100), false, &cb);
    cb.complete(CommandStatus::Completed);
    wait_for(&events, published(1));

    let sub = p.publish(small.clone(), Region::full(50, 50), false, &ManualCommandBuffer::new());
    assert!(matches!(
        sub,
        Submission::Dropped { seq: 2, reason: ShareError::FormatMismatch { .. } }
    ));

    let cb = ManualCommandBuffer::new();
    p.publish(small, Region::full(50, 50), false, &cb);
    cb.complete(CommandStatus::Completed);
    wait_for(&events, published(3));
    let ann = p.server().current_announcement().unwrap();
    assert_eq!((ann.width, ann.height), (50, 50));
}

#[test]
fn stop_abandons_hung_frames_and_reports_leaks() {
    let p = start(ShareConfig { pixel_format: PixelFormat::Bgra8, ..config() });
    let events = p.events();
    let tex = Arc::new(SoftwareTexture::new(8, 8, PixelFormat::Bgra8));

    let cb = ManualCommandBuffer::new();
    p.publish(tex.clone(), Region::full(8, 8), false, &cb);
    cb.complete(CommandStatus::Completed);
    wait_for(&events, published(1));

    // A pin taken outside any session survives consumer cleanup.
    let surface = p.registry().published().unwrap();
    p.registry().pin(surface).unwrap();

    let hung = ManualCommandBuffer::new();
    assert!(p.publish(tex, Region::full(8, 8), false, &hung).is_accepted());

    let report = p.stop();
    assert_eq!(report.abandoned, 1);
    assert_eq!(report.leaks, vec![ShareError::ResourceLeakDetected { surface, refs: 1 }]);
    assert_eq!(p.registry().stats().live_surfaces, 0);

    wait_for(&events, |ev| {
        matches!(ev, PipelineEvent::FrameDropped { seq: 2, reason: ShareError::Abandoned })
    });
    wait_for(&events, |ev| matches!(ev, PipelineEvent::SurfaceLeak { .. }));
    wait_for(&events, |ev| *ev == PipelineEvent::Stopped);

    // Second stop is a no-op; publishing after stop is refused.
    assert_eq!(p.stop(), StopReport::default());
    let late = p.publish(
        Arc::new(SoftwareTexture::new(8, 8, PixelFormat::Bgra8)),
        Region::full(8, 8),
        false,
        &ManualCommandBuffer::new(),
    );
    assert!(matches!(late, Submission::Dropped { reason: ShareError::Stopped, .. }));
}

#[test]
fn consumer_sees_stop() {
    let p = start(config());
    let mut consumer = p.local_consumer("watcher").unwrap();
    p.stop();
    assert_eq!(consumer.next_frame(Duration::from_millis(500)), Err(ShareError::Stopped));
}

#[test]
fn exhausted_rotation_drops_without_blocking_and_recovers() {
    let p = start(ShareConfig { rotation_depth: 2, ..config() });
    let events = p.events();
    let tex = Arc::new(SoftwareTexture::new(16, 16, PixelFormat::Rgba8));

    // Pin both surfaces: each one as it becomes the published frame.
    let mut pinned = Vec::new();
    for seq in 1..=2u64 {
        let cb = ManualCommandBuffer::new();
        assert!(p.publish(tex.clone(), Region::full(16, 16), false, &cb).is_accepted());
        cb.complete(CommandStatus::Completed);
        wait_for(&events, published(seq));
        let surface = p.registry().published().unwrap();
        p.registry().pin(surface).unwrap();
        pinned.push(surface);
    }

    let t0 = Instant::now();
    let sub = p.publish(tex.clone(), Region::full(16, 16), false, &ManualCommandBuffer::new());
    assert!(t0.elapsed() < Duration::from_millis(50), "drop took {:?}", t0.elapsed());
    assert!(matches!(
        sub,
        Submission::Dropped { seq: 3, reason: ShareError::ResourceExhausted { depth: 2 } }
    ));

    // The older surface is no longer published; releasing it frees a slot.
    p.registry().release(pinned[0]).unwrap();
    let cb = ManualCommandBuffer::new();
    let sub = p.publish(tex, Region::full(16, 16), false, &cb);
    assert!(sub.is_accepted(), "{sub:?}");
    cb.complete(CommandStatus::Completed);
    wait_for(&events, published(4));

    let stats = p.stats().frames;
    assert_eq!((stats.published, stats.dropped), (3, 1));
    assert_eq!(stats.dropped_by_reason.get("backpressure"), Some(&1));
    p.registry().release(pinned[1]).unwrap();
}
