//! `serve`: publish a moving test pattern rendered on the software GPU.
//!
//! Frame loop:
//! - pick the next texture in a small ring (a texture may still be read by the publisher while
//!   the queue renders into the next one)
//! - encode the pattern, hand the frame to the pipeline, commit
//! - sleep to the next frame deadline
//!
//! A separate thread turns pipeline events into log lines so the render loop stays quiet.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;

use framecast_engine::gpu::{SoftwareQueue, SoftwareTexture};
use framecast_engine::{logi, logw};
use framecast_engine::{PipelineEvent, Region, ShareConfig, ShareError, SharePipeline, Submission};

use crate::cli::ServeOpts;

/// Textures in flight between the render loop and the publisher.
const RING: usize = 4;
const STATS_EVERY: Duration = Duration::from_secs(2);

/// Flipped by the event logger when the loop should end early.
struct RunState {
    done: AtomicBool,
}

pub fn serve(config: ShareConfig, opts: &ServeOpts) -> Result<()> {
    let name = config.server_name.clone();
    let format = config.pixel_format;
    let pipeline = SharePipeline::start(config).context("starting share pipeline")?;
    if let Some(addr) = pipeline.local_addr() {
        logi!("DEMO", "serving '{name}' on udp {addr} ({}x{} {})", opts.width, opts.height, format.as_str());
    } else {
        logi!("DEMO", "serving '{name}' in-process only");
    }

    let state = Arc::new(RunState { done: AtomicBool::new(false) });
    let logger = spawn_event_logger(pipeline.events(), state.clone())?;

    let queue = SoftwareQueue::new().context("starting software gpu")?;
    let ring: Vec<Arc<SoftwareTexture>> = (0..RING)
        .map(|_| Arc::new(SoftwareTexture::new(opts.width, opts.height, format)))
        .collect();

    let period = Duration::try_from_secs_f64(1.0 / opts.fps).context("--fps out of range")?;
    let limit = opts.seconds.map(Duration::try_from_secs_f64).transpose().context("--seconds out of range")?;
    let started = Instant::now();
    let mut next_deadline = started;
    let mut last_stats = started;
    let mut rendered: u64 = 0;

    while !state.done.load(Ordering::Relaxed) {
        if opts.frames > 0 && rendered >= opts.frames {
            break;
        }
        if limit.is_some_and(|l| started.elapsed() >= l) {
            break;
        }

        let tex = ring[(rendered as usize) % RING].clone();
        let cb = queue.command_buffer();
        let seed = (rendered % 256) as u8;
        {
            let t = tex.clone();
            cb.encode(move || t.fill_test_pattern(seed));
        }
        rendered += 1;
        if opts.fail_every.is_some_and(|n| rendered % n == 0) {
            cb.fail_with(format!("injected failure on frame {rendered}"));
        }

        let region = Region::full(opts.width, opts.height);
        match pipeline.publish(tex, region, opts.flip, cb.as_ref()) {
            Submission::Accepted { .. } => {}
            // Drops are counted and logged by the pipeline; stop only once it refuses everything.
            Submission::Dropped { reason, .. } if reason.is_fatal() || reason == ShareError::Stopped => {
                logw!("DEMO", "pipeline refused frame: {reason}");
                break;
            }
            Submission::Dropped { .. } => {}
        }
        queue.commit(&cb).context("submitting to software gpu")?;

        if last_stats.elapsed() >= STATS_EVERY {
            log_stats(&pipeline, started);
            last_stats = Instant::now();
        }

        next_deadline += period;
        let now = Instant::now();
        if next_deadline > now {
            std::thread::sleep(next_deadline - now);
        } else {
            // Fell behind; don't try to catch up with a burst.
            next_deadline = now;
        }
    }

    // Let the queue finish what was committed before the pipeline drains.
    drop(queue);
    log_stats(&pipeline, started);

    let report = pipeline.stop();
    logi!(
        "DEMO",
        "stopped after {rendered} frame(s): abandoned={} leaks={}",
        report.abandoned,
        report.leaks.len()
    );
    for leak in &report.leaks {
        logw!("DEMO", "{leak}");
    }

    drop(pipeline);
    let _ = logger.join();
    Ok(())
}

fn log_stats(pipeline: &SharePipeline, started: Instant) {
    let st = pipeline.stats();
    let secs = started.elapsed().as_secs_f64().max(0.001);
    let reasons: Vec<String> = st
        .frames
        .dropped_by_reason
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    logi!(
        "DEMO",
        "published={} ({:.1}/s) dropped={} [{}] sessions={} pinned={} in_flight={}",
        st.frames.published,
        st.frames.published as f64 / secs,
        st.frames.dropped,
        reasons.join(" "),
        st.server.sessions,
        st.surfaces.pinned_refs,
        st.in_flight
    );
}

/// Logs connection changes, leaks and device loss. Exits when the pipeline stops.
fn spawn_event_logger(events: Receiver<PipelineEvent>, state: Arc<RunState>) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("demo-events".to_string())
        .spawn(move || {
            for ev in events.iter() {
                match ev {
                    PipelineEvent::ConsumerConnected { session } => {
                        logi!("DEMO", "consumer {session} connected");
                    }
                    PipelineEvent::ConsumerDisconnected { session, reason } => {
                        logi!("DEMO", "consumer {session} left ({reason})");
                    }
                    PipelineEvent::SurfaceLeak { error } => logw!("DEMO", "{error}"),
                    PipelineEvent::DeviceLost => {
                        logw!("DEMO", "gpu device lost; stopping");
                        state.done.store(true, Ordering::Relaxed);
                    }
                    PipelineEvent::Stopped => break,
                    PipelineEvent::FramePublished { .. } | PipelineEvent::FrameDropped { .. } => {}
                }
            }
        })
        .context("spawning event logger")
}
