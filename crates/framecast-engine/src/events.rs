use crate::error::ShareError;
use crate::server::SessionId;
use crate::surface::SurfaceId;

/// Pipeline notifications for UI clients and tests.
///
/// Delivered on crossbeam channels obtained from `SharePipeline::events()`; slow subscribers
/// never slow the pipeline down (events are dropped for full subscribers).
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// A frame became the current announcement.
    FramePublished { seq: u64, surface: SurfaceId },

    /// A frame was not published.
    FrameDropped { seq: u64, reason: ShareError },

    ConsumerConnected { session: SessionId },

    /// Session ended (bye, timeout, protocol error or server shutdown).
    ConsumerDisconnected { session: SessionId, reason: String },

    /// A surface was still pinned after revocation and had to be reclaimed.
    SurfaceLeak { error: ShareError },

    /// The GPU device is gone; the pipeline no longer accepts frames.
    DeviceLost,

    /// The pipeline finished stopping.
    Stopped,
}

/// Fan-out of `PipelineEvent`s to any number of subscribers.
#[derive(Default)]
pub struct EventBus {
    subscribers: std::sync::Mutex<Vec<crossbeam_channel::Sender<PipelineEvent>>>,
}

impl EventBus {
    const CAPACITY: usize = 1024;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> crossbeam_channel::Receiver<PipelineEvent> {
        let (tx, rx) = crossbeam_channel::bounded(Self::CAPACITY);
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        rx
    }

    /// Non-blocking. Disconnected subscribers are forgotten.
    pub fn emit(&self, ev: PipelineEvent) {
        let Ok(mut subs) = self.subscribers.lock() else { return; };
        subs.retain(|tx| match tx.try_send(ev.clone()) {
            Ok(()) => true,
            Err(crossbeam_channel::TrySendError::Full(_)) => true,
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => false,
        });
    }
}
