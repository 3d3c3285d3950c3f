//! Frame Publisher
//!
//! Called from the render loop once per rendered frame. `publish` never blocks on the GPU:
//!
//! ```text
//!   submitted ──▶ awaiting GPU ──▶ copying ──▶ published
//!       │               │             │
//!       └───────────────┴─────────────┴──────▶ dropped (reason)
//! ```
//!
//! - submission assigns the sequence number, checks the texture against the configured pixel
//!   format, validates the region and reserves a surface;
//! - the copy (crop + optional vertical flip) runs on the tracker's dispatch thread after the
//!   command buffer completed;
//! - only then is the surface marked Published and announced.
//!
//! A frame whose GPU work failed is never announced. Drops are counted by reason; losing the
//! GPU device is fatal and stops the publisher.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{ShareError, ShareResult};
use crate::events::{EventBus, PipelineEvent};
use crate::frame::{copy_region, Frame, PixelFormat, Region};
use crate::gpu::{CommandBuffer, SourceTexture};
use crate::registry::{SurfaceRegistry, WritableSurface};
use crate::server::{Announcement, TextureShareServer};
use crate::tracker::CompletionTracker;
use crate::{logi, logw, loge};

/// Result of handing a frame to the publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// The frame is on its way; it may still be dropped later (see `PipelineEvent`).
    Accepted { seq: u64 },
    /// The frame was dropped at submission.
    Dropped { seq: u64, reason: ShareError },
}

impl Submission {
    pub fn seq(&self) -> u64 {
        match self {
            Submission::Accepted { seq } | Submission::Dropped { seq, .. } => *seq,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Submission::Accepted { .. })
    }
}

/// Frame counters shared by the publisher and the server's status reply.
#[derive(Default)]
pub struct FrameCounters {
    submitted: AtomicU64,
    published: AtomicU64,
    dropped: AtomicU64,
    drop_streak: AtomicU64,
    by_reason: Mutex<BTreeMap<&'static str, u64>>,
}

impl FrameCounters {
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> PublishStats {
        PublishStats {
            submitted: self.submitted(),
            published: self.published(),
            dropped: self.dropped(),
            dropped_by_reason: self
                .by_reason
                .lock()
                .map(|m| m.iter().map(|(k, v)| (k.to_string(), *v)).collect())
                .unwrap_or_default(),
        }
    }

    fn record_drop(&self, reason: &ShareError) -> u64 {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut m) = self.by_reason.lock() {
            *m.entry(reason.code()).or_insert(0) += 1;
        }
        self.drop_streak.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn record_publish(&self) -> u64 {
        self.published.fetch_add(1, Ordering::Relaxed);
        self.drop_streak.swap(0, Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub submitted: u64,
    pub published: u64,
    pub dropped: u64,
    pub dropped_by_reason: BTreeMap<String, u64>,
}

/// State the completion continuation needs. Cloned into every submission.
#[derive(Clone)]
struct Sink {
    registry: Arc<SurfaceRegistry>,
    server: Arc<TextureShareServer>,
    events: Arc<EventBus>,
    counters: Arc<FrameCounters>,
    accepting: Arc<AtomicBool>,
    device_lost: Arc<AtomicBool>,
}

impl Sink {
    fn drop_frame(&self, seq: u64, reason: ShareError) -> Submission {
        let streak = self.counters.record_drop(&reason);
        // One line per streak; a stalled consumer would otherwise flood the log at frame rate.
        if streak == 1 {
            logw!("PUBLISH", "dropping frame seq={seq}: {reason}");
        }
        self.events.emit(PipelineEvent::FrameDropped { seq, reason: reason.clone() });
        Submission::Dropped { seq, reason }
    }

    fn give_back(&self, surface: &WritableSurface) {
        if let Err(e) = self.registry.abandon(surface.id) {
            logw!("PUBLISH", "abandon {}: {e}", surface.id);
        }
    }

    /// Runs on the dispatch thread, in submission order.
    fn complete(&self, frame: Frame, surface: WritableSurface, outcome: ShareResult<()>) {
        let seq = frame.seq;
        if let Err(reason) = outcome {
            self.give_back(&surface);
            if reason.is_fatal() {
                self.lose_device();
            }
            self.drop_frame(seq, reason);
            return;
        }

        let copied = copy_region(frame.texture.as_ref(), frame.region, frame.flip)
            .and_then(|bytes| surface.write(&bytes));
        if let Err(reason) = copied {
            self.give_back(&surface);
            self.drop_frame(seq, reason);
            return;
        }

        if let Err(reason) = self.registry.mark_published(surface.id, seq) {
            self.give_back(&surface);
            self.drop_frame(seq, reason);
            return;
        }

        let ann = Announcement {
            surface: surface.id,
            seq,
            width: surface.desc.width,
            height: surface.desc.height,
            format: surface.desc.format,
        };
        if let Err(reason) = self.server.announce(ann) {
            // Already Published in the registry; it drains with the next frame or on stop.
            self.drop_frame(seq, reason);
            return;
        }

        let streak = self.counters.record_publish();
        if streak > 0 {
            logi!("PUBLISH", "publishing resumed at seq={seq} after {streak} dropped frame(s)");
        }
        self.events.emit(PipelineEvent::FramePublished { seq, surface: surface.id });
    }

    fn lose_device(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        if !self.device_lost.swap(true, Ordering::SeqCst) {
            loge!("PUBLISH", "GPU device lost; publisher stopped");
            self.events.emit(PipelineEvent::DeviceLost);
        }
    }
}

pub struct FramePublisher {
    sink: Sink,
    tracker: Arc<CompletionTracker>,
    next_seq: AtomicU64,
    /// Textures in any other format are dropped; discovery advertises this one.
    format: PixelFormat,
}

impl FramePublisher {
    pub fn new(
        registry: Arc<SurfaceRegistry>,
        tracker: Arc<CompletionTracker>,
        server: Arc<TextureShareServer>,
        events: Arc<EventBus>,
        counters: Arc<FrameCounters>,
        format: PixelFormat,
    ) -> Self {
        Self {
            sink: Sink {
                registry,
                server,
                events,
                counters,
                accepting: Arc::new(AtomicBool::new(true)),
                device_lost: Arc::new(AtomicBool::new(false)),
            },
            tracker,
            next_seq: AtomicU64::new(1),
            format,
        }
    }

    /// Hand a rendered frame to the pipeline. Returns without waiting for the GPU.
    ///
    /// `region` is the part of `texture` to share; `flip` marks a bottom-up source.
    pub fn publish(
        &self,
        texture: Arc<dyn SourceTexture>,
        region: Region,
        flip: bool,
        cb: &dyn CommandBuffer,
    ) -> Submission {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.sink.counters.submitted.fetch_add(1, Ordering::Relaxed);

        if !self.sink.accepting.load(Ordering::SeqCst) {
            let reason = if self.sink.device_lost.load(Ordering::SeqCst) {
                ShareError::DeviceLost
            } else {
                ShareError::Stopped
            };
            return self.sink.drop_frame(seq, reason);
        }

        if texture.format() != self.format {
            let reason = ShareError::FormatMismatch {
                expected: self.format.to_string(),
                got: texture.format().to_string(),
            };
            return self.sink.drop_frame(seq, reason);
        }

        if let Err(reason) = region.validate(texture.width(), texture.height()) {
            return self.sink.drop_frame(seq, reason);
        }

        let frame = Frame { texture, region, flip, seq };
        let surface = match self.sink.registry.acquire_writable(frame.desc()) {
            Ok(s) => s,
            Err(reason) => return self.sink.drop_frame(seq, reason),
        };
        let surface_id = surface.id;

        let sink = self.sink.clone();
        let cont = Box::new(move |outcome| sink.complete(frame, surface, outcome));
        match self.tracker.await_completion(cb, cont) {
            Ok(_) => Submission::Accepted { seq },
            Err(reason) => {
                // The continuation (and its surface handle) was never registered.
                if let Err(e) = self.sink.registry.abandon(surface_id) {
                    logw!("PUBLISH", "abandon {surface_id}: {e}");
                }
                self.sink.drop_frame(seq, reason)
            }
        }
    }

    /// Refuse further frames. In-flight frames still complete (or are abandoned by the tracker).
    pub fn stop_accepting(&self) {
        self.sink.accepting.store(false, Ordering::SeqCst);
    }

    pub fn is_accepting(&self) -> bool {
        self.sink.accepting.load(Ordering::SeqCst)
    }

    pub fn device_lost(&self) -> bool {
        self.sink.device_lost.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PublishStats {
        self.sink.counters.snapshot()
    }
}
