//! `SharePipeline` wires registry, tracker, publisher and server together from a `ShareConfig`
//! and owns their shutdown order.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::Receiver;

use crate::config::{ShareConfig, SurfaceBackend};
use crate::consumer::LocalConsumer;
use crate::error::{EngineError, ShareError, ShareResult};
use crate::events::{EventBus, PipelineEvent};
use crate::frame::Region;
use crate::gpu::{CommandBuffer, SourceTexture};
use crate::publisher::{FrameCounters, FramePublisher, PublishStats, Submission};
use crate::registry::{RegistryStats, SurfaceRegistry};
use crate::server::discovery;
use crate::server::udp::{self, UdpOptions, UdpServerHandle};
use crate::server::{ServerStatus, TextureShareServer};
use crate::surface::{FileAllocator, HeapAllocator, SurfaceAllocator};
use crate::tracker::CompletionTracker;
use crate::{logi, logw};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames: PublishStats,
    pub surfaces: RegistryStats,
    pub server: ServerStatus,
    pub in_flight: usize,
}

/// What `stop` had to clean up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    pub abandoned: usize,
    pub leaks: Vec<ShareError>,
}

pub struct SharePipeline {
    config: ShareConfig,
    registry: Arc<SurfaceRegistry>,
    tracker: Arc<CompletionTracker>,
    server: Arc<TextureShareServer>,
    publisher: FramePublisher,
    events: Arc<EventBus>,
    udp: Mutex<Option<UdpServerHandle>>,
    stopped: AtomicBool,
}

/// Surface allocator selected by the config.
pub fn allocator_for(config: &ShareConfig) -> ShareResult<Arc<dyn SurfaceAllocator>> {
    Ok(match config.surface_backend {
        SurfaceBackend::Heap => Arc::new(HeapAllocator),
        SurfaceBackend::File => {
            let dir = config.surface_dir.clone().unwrap_or_else(FileAllocator::default_dir);
            Arc::new(FileAllocator::new(dir, &config.server_name)?)
        }
    })
}

impl SharePipeline {
    /// Start with the allocator the config asks for.
    pub fn start(config: ShareConfig) -> Result<Self, EngineError> {
        let allocator = allocator_for(&config)?;
        Self::start_with_allocator(config, allocator)
    }

    pub fn start_with_allocator(
        config: ShareConfig,
        allocator: Arc<dyn SurfaceAllocator>,
    ) -> Result<Self, EngineError> {
        let events = Arc::new(EventBus::new());
        let counters = Arc::new(FrameCounters::default());
        let registry = Arc::new(SurfaceRegistry::new(
            allocator.clone(),
            config.rotation_depth,
            config.backpressure,
        ));
        let tracker = Arc::new(CompletionTracker::new(config.gpu_timeout())?);
        let server = Arc::new(TextureShareServer::new(
            config.server_name.clone(),
            registry.clone(),
            counters.clone(),
            events.clone(),
            config.session_timeout(),
        ));
        let publisher = FramePublisher::new(
            registry.clone(),
            tracker.clone(),
            server.clone(),
            events.clone(),
            counters,
            config.pixel_format,
        );

        let udp = match &config.bind_addr {
            Some(bind) => Some(udp::spawn(
                server.clone(),
                &UdpOptions {
                    bind: bind.clone(),
                    discovery_dir: Some(config.discovery_dir.clone().unwrap_or_else(discovery::default_dir)),
                    format: config.pixel_format,
                },
            )?),
            None => None,
        };

        logi!(
            "INIT",
            "pipeline '{}' up: depth={} backpressure={:?} surfaces={}",
            config.server_name,
            registry.depth(),
            config.backpressure,
            allocator.name()
        );

        Ok(Self {
            config,
            registry,
            tracker,
            server,
            publisher,
            events,
            udp: Mutex::new(udp),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ShareConfig {
        &self.config
    }

    /// See `FramePublisher::publish`.
    pub fn publish(
        &self,
        texture: Arc<dyn SourceTexture>,
        region: Region,
        flip: bool,
        cb: &dyn CommandBuffer,
    ) -> Submission {
        self.publisher.publish(texture, region, flip, cb)
    }

    pub fn events(&self) -> Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn server(&self) -> &Arc<TextureShareServer> {
        &self.server
    }

    pub fn registry(&self) -> &Arc<SurfaceRegistry> {
        &self.registry
    }

    /// UDP address consumers on this host connect to (None when running in-process only).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.udp.lock().ok()?.as_ref().map(|u| u.connect_addr())
    }

    pub fn local_consumer(&self, label: &str) -> ShareResult<LocalConsumer> {
        LocalConsumer::connect(self.server.clone(), label)
    }

    pub fn device_lost(&self) -> bool {
        self.publisher.device_lost()
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            frames: self.publisher.stats(),
            surfaces: self.registry.stats(),
            server: self.server.status(),
            in_flight: self.tracker.in_flight(),
        }
    }

    /// Orderly shutdown:
    /// 1. refuse new frames;
    /// 2. let in-flight frames finish (abandon them after the drain timeout);
    /// 3. revoke the announcement, notify and disconnect consumers, close the endpoint;
    /// 4. free every surface once unreferenced, reporting pins that outlive the leak timeout.
    ///
    /// Idempotent: later calls return an empty report.
    pub fn stop(&self) -> StopReport {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return StopReport::default();
        }
        logi!("INIT", "stopping pipeline '{}'", self.config.server_name);

        self.publisher.stop_accepting();
        let abandoned = self.tracker.shutdown(self.config.drain_timeout());
        if abandoned > 0 {
            logw!("INIT", "{abandoned} frame(s) abandoned at shutdown");
        }

        if let Err(e) = self.server.revoke() {
            logw!("INIT", "revoke: {e}");
        }
        self.server.shutdown();
        if let Err(e) = self.registry.revoke_published() {
            logw!("INIT", "revoke_published: {e}");
        }
        if let Ok(mut udp) = self.udp.lock() {
            udp.take();
        }

        let leaks = match self.registry.drain(self.config.leak_timeout()) {
            Ok(l) => l,
            Err(e) => {
                logw!("INIT", "drain: {e}");
                Vec::new()
            }
        };
        for leak in &leaks {
            self.events.emit(PipelineEvent::SurfaceLeak { error: leak.clone() });
        }
        self.events.emit(PipelineEvent::Stopped);
        logi!("INIT", "pipeline stopped ({} leak(s))", leaks.len());
        StopReport { abandoned, leaks }
    }
}

impl Drop for SharePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
