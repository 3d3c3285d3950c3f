//! framecast-engine
//!
//! Shares rendered frames with other processes: a fixed rotation of shared surfaces, a tracker
//! that waits for GPU completion off the render thread, a publisher that copies finished frames
//! into surfaces, and a server that announces the newest frame to consumers.

pub mod assets;
pub mod config;
pub mod consumer;
pub mod error;
pub mod events;
pub mod frame;
pub mod gpu;
pub mod logging;
pub mod pipeline;
pub mod publisher;
pub mod registry;
pub mod server;
pub mod surface;
pub mod tracker;

pub use config::{Backpressure, ConfigMode, ShareConfig, SurfaceBackend};
pub use consumer::{LocalConsumer, ReceivedFrame, RemoteConsumer};
pub use error::{EngineError, ShareError, ShareResult};
pub use events::PipelineEvent;
pub use frame::{PixelFormat, Region, SurfaceDesc};
pub use pipeline::{SharePipeline, StopReport};
pub use publisher::Submission;
pub use server::{Announcement, Mapping, ServerStatus, TextureShareServer};
pub use surface::SurfaceId;
