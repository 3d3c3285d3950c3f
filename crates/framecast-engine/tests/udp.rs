use std::net::UdpSocket;
use std::sync::Arc;
use std::time::{Duration, Instant};

use framecast_engine::consumer::query_status;
use framecast_engine::gpu::{CommandStatus, ManualCommandBuffer, SoftwareTexture};
use framecast_engine::server::wire::{self, ClientRequest};
use framecast_engine::server::{discovery, ServerMessage};
use framecast_engine::{
    PipelineEvent, PixelFormat, Region, RemoteConsumer, ShareConfig, ShareError, SharePipeline, SurfaceBackend,
    SurfaceId,
};

struct Rig {
    pipeline: SharePipeline,
    discovery_dir: tempfile::TempDir,
    _surface_dir: tempfile::TempDir,
}

fn rig(name: &str, session_timeout_ms: u64) -> Rig {
    let discovery_dir = tempfile::tempdir().unwrap();
    let surface_dir = tempfile::tempdir().unwrap();
    let cfg = ShareConfig {
        server_name: name.into(),
        surface_backend: SurfaceBackend::File,
        surface_dir: Some(surface_dir.path().to_path_buf()),
        discovery_dir: Some(discovery_dir.path().to_path_buf()),
        bind_addr: Some("127.0.0.1:0".into()),
        pixel_format: PixelFormat::Rgba8,
        session_timeout_ms,
        drain_timeout_ms: 100,
        leak_timeout_ms: 100,
        ..ShareConfig::default()
    };
    let pipeline = SharePipeline::start(cfg).unwrap();
    Rig { pipeline, discovery_dir, _surface_dir: surface_dir }
}

fn publish_blocking(p: &SharePipeline, tex: &Arc<SoftwareTexture>, w: u32, h: u32, flip: bool) -> u64 {
    let events = p.events();
    let cb = ManualCommandBuffer::new();
    let sub = p.publish(tex.clone(), Region::full(w, h), flip, &cb);
    assert!(sub.is_accepted(), "{sub:?}");
    cb.complete(CommandStatus::Completed);
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        match events.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(PipelineEvent::FramePublished { seq, .. }) if seq == sub.seq() => return seq,
            Ok(_) => {}
            Err(_) => panic!("frame {} not published", sub.seq()),
        }
    }
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn remote_consumer_reads_frames_through_shared_files() {
    let r = rig("udp-read", 5_000);
    let mut consumer = RemoteConsumer::discover(r.discovery_dir.path(), "udp-read").unwrap();
    wait_until("subscription", || r.pipeline.server().status().sessions == 1);

    let tex = Arc::new(SoftwareTexture::new(64, 32, PixelFormat::Rgba8));
    tex.fill_test_pattern(7);
    let seq = publish_blocking(&r.pipeline, &tex, 64, 32, true);

    let frame = consumer.fetch(Duration::from_secs(2)).unwrap().unwrap();
    assert_eq!(frame.seq, seq);
    assert_eq!((frame.width, frame.height, frame.stride), (64, 32, 256));
    assert_eq!(frame.pixels.len(), 64 * 32 * 4);
    // Bottom-up source: published row 0 is source row 31.
    assert_eq!(frame.pixel(5, 0), Some(&[5u8, 31, 7, 255][..]));
    assert_eq!(frame.pixel(5, 31), Some(&[5u8, 0, 7, 255][..]));

    assert_eq!(r.pipeline.registry().stats().pinned_refs, 0);
    assert!(consumer.ping().unwrap() < Duration::from_secs(1));
}

#[test]
fn status_is_answered_without_a_session() {
    let r = rig("udp-status", 5_000);
    let addr = r.pipeline.local_addr().unwrap();
    let tex = Arc::new(SoftwareTexture::new(4, 4, PixelFormat::Rgba8));
    publish_blocking(&r.pipeline, &tex, 4, 4, false);

    let st = query_status(addr, Duration::from_secs(2)).unwrap();
    assert!(st.running);
    assert_eq!(st.seq, Some(1));
    assert_eq!(st.sessions, 0);
    assert_eq!(st.published, 1);
}

#[test]
fn stale_map_is_reported_and_session_survives() {
    let r = rig("udp-stale", 5_000);
    let mut consumer = RemoteConsumer::discover(r.discovery_dir.path(), "udp-stale").unwrap();
    let tex = Arc::new(SoftwareTexture::new(4, 4, PixelFormat::Rgba8));
    publish_blocking(&r.pipeline, &tex, 4, 4, false);
    let old = consumer.next_frame(Duration::from_secs(2)).unwrap().unwrap();
    publish_blocking(&r.pipeline, &tex, 4, 4, false);

    let err = consumer.map(&old).unwrap_err();
    assert_eq!(err, ShareError::Stale { surface: old.surface, seq: old.seq });
    assert_eq!(r.pipeline.server().status().sessions, 1);

    let newer = consumer.next_frame(Duration::from_secs(2)).unwrap().unwrap();
    assert!(newer.seq > old.seq);
}

#[test]
fn bogus_release_ends_the_session() {
    let r = rig("udp-bogus", 5_000);
    let events = r.pipeline.events();
    let mut consumer = RemoteConsumer::discover(r.discovery_dir.path(), "udp-bogus").unwrap();
    wait_until("subscription", || r.pipeline.server().status().sessions == 1);

    let err = consumer.release(SurfaceId(999)).unwrap_err();
    assert!(matches!(err, ShareError::ProtocolError { .. }), "{err:?}");
    assert_eq!(r.pipeline.server().status().sessions, 0);
    assert!(events
        .try_iter()
        .any(|ev| matches!(ev, PipelineEvent::ConsumerDisconnected { .. })));
}

#[test]
fn silent_consumer_times_out_and_its_pins_are_released() {
    let r = rig("udp-idle", 200);
    let mut consumer = RemoteConsumer::discover(r.discovery_dir.path(), "udp-idle").unwrap();
    let tex = Arc::new(SoftwareTexture::new(4, 4, PixelFormat::Rgba8));
    publish_blocking(&r.pipeline, &tex, 4, 4, false);

    let ann = consumer.next_frame(Duration::from_secs(2)).unwrap().unwrap();
    consumer.map(&ann).unwrap();
    assert_eq!(r.pipeline.registry().stats().pinned_refs, 1);

    // Never release, never ping.
    wait_until("session reaped", || r.pipeline.server().status().sessions == 0);
    assert_eq!(r.pipeline.registry().stats().pinned_refs, 0);
}

#[test]
fn requests_without_a_session_are_answered_not_subscribed() {
    let r = rig("udp-stranger", 5_000);
    let addr = r.pipeline.local_addr().unwrap();
    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    sock.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    for req in [ClientRequest::Ping, ClientRequest::Current] {
        sock.send_to(&wire::encode_request(&req).unwrap(), addr).unwrap();
        let mut buf = [0u8; wire::MAX_PACKET];
        let (n, _) = sock.recv_from(&mut buf).unwrap();
        assert_eq!(
            wire::decode_messages_from_server(&buf[..n]).unwrap(),
            vec![ServerMessage::from_error(&ShareError::NotSubscribed)],
            "{req:?}"
        );
    }
    assert_eq!(r.pipeline.server().status().sessions, 0);
}

#[test]
fn consumer_rejoins_after_its_session_times_out() {
    let r = rig("udp-rejoin", 200);
    let mut consumer = RemoteConsumer::discover(r.discovery_dir.path(), "udp-rejoin").unwrap();
    wait_until("subscription", || r.pipeline.server().status().sessions == 1);

    // Engine pause longer than the session timeout, with the default (slower) keepalive.
    assert_eq!(consumer.next_frame(Duration::from_millis(600)).unwrap(), None);
    consumer.ping().unwrap();
    wait_until("session renewed", || r.pipeline.server().status().sessions == 1);

    let tex = Arc::new(SoftwareTexture::new(4, 4, PixelFormat::Rgba8));
    let mut last = 0;
    for _ in 0..3 {
        last = publish_blocking(&r.pipeline, &tex, 4, 4, false);
    }
    let frame = consumer.fetch(Duration::from_millis(800)).unwrap().expect("frame after resume");
    assert_eq!(frame.seq, last);
    assert_eq!(r.pipeline.registry().stats().pinned_refs, 0);
}

#[test]
fn keepalive_holds_the_session_through_a_pause() {
    let r = rig("udp-keepalive", 200);
    let events = r.pipeline.events();
    let mut consumer = RemoteConsumer::discover(r.discovery_dir.path(), "udp-keepalive").unwrap();
    consumer.set_keepalive(Duration::from_millis(50));
    wait_until("subscription", || r.pipeline.server().status().sessions == 1);

    assert_eq!(consumer.next_frame(Duration::from_millis(600)).unwrap(), None);
    assert_eq!(r.pipeline.server().status().sessions, 1);
    assert!(!events
        .try_iter()
        .any(|ev| matches!(ev, PipelineEvent::ConsumerDisconnected { .. })));
}

#[test]
fn in_process_consumer_outlives_the_session_timeout() {
    let r = rig("udp-local", 200);
    let mut local = r.pipeline.local_consumer("in-proc").unwrap();

    assert_eq!(local.next_frame(Duration::from_millis(600)).unwrap(), None);
    assert_eq!(r.pipeline.server().status().sessions, 1);

    let tex = Arc::new(SoftwareTexture::new(4, 4, PixelFormat::Rgba8));
    let seq = publish_blocking(&r.pipeline, &tex, 4, 4, false);
    let frame = local.fetch(Duration::from_secs(2)).unwrap().unwrap();
    assert_eq!(frame.seq, seq);
}

#[test]
fn late_error_reply_is_not_taken_for_the_next_request() {
    let r = rig("udp-late-reply", 5_000);
    let mut consumer = RemoteConsumer::discover(r.discovery_dir.path(), "udp-late-reply").unwrap();
    let tex = Arc::new(SoftwareTexture::new(4, 4, PixelFormat::Rgba8));
    publish_blocking(&r.pipeline, &tex, 4, 4, false);
    let old = consumer.next_frame(Duration::from_secs(2)).unwrap().unwrap();
    publish_blocking(&r.pipeline, &tex, 4, 4, false);
    let newer = consumer.next_frame(Duration::from_secs(2)).unwrap().unwrap();

    // Give up on the reply before it can arrive; the stale error lands afterwards.
    consumer.set_reply_timeout(Duration::ZERO);
    assert!(matches!(consumer.map(&old), Err(ShareError::Io { .. })));
    std::thread::sleep(Duration::from_millis(50));

    consumer.set_reply_timeout(Duration::from_secs(2));
    let mapping = consumer.map(&newer).unwrap();
    assert_eq!((mapping.surface, mapping.seq), (newer.surface, newer.seq));
    consumer.release(mapping.surface).unwrap();
    assert_eq!(r.pipeline.registry().stats().pinned_refs, 0);
}

#[test]
fn stop_notifies_consumers_and_withdraws_discovery() {
    let r = rig("udp-stop", 5_000);
    let record = discovery::record_path(r.discovery_dir.path(), "udp-stop");
    assert!(record.exists());

    let mut consumer = RemoteConsumer::discover(r.discovery_dir.path(), "udp-stop").unwrap();
    wait_until("subscription", || r.pipeline.server().status().sessions == 1);

    let report = r.pipeline.stop();
    assert!(report.leaks.is_empty());
    assert!(!record.exists());
    assert_eq!(consumer.next_frame(Duration::from_secs(2)), Err(ShareError::Stopped));
    assert!(RemoteConsumer::discover(r.discovery_dir.path(), "udp-stop").is_err());
}
