use std::{fmt, path::PathBuf};

use crate::surface::SurfaceId;

/// Startup and configuration failures (anything before frames flow).
#[derive(Debug)]
pub enum EngineError {
    /// No `assets/` directory at or above `start_dir`.
    AssetsNotFound { start_dir: PathBuf },
    Io { path: PathBuf, source: std::io::Error },
    Json { path: PathBuf, source: serde_json::Error },
    /// Parsed, but a value is out of range.
    InvalidConfig { path: PathBuf, msg: String },
    /// The UDP endpoint could not be bound or configured.
    Bind { addr: String, source: std::io::Error },
    Share(ShareError),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::AssetsNotFound { start_dir } => {
                write!(f, "no assets/ directory at or above {}", start_dir.display())
            }
            EngineError::Io { path, source } => write!(f, "{}: {source}", path.display()),
            EngineError::Json { path, source } => write!(f, "{}: invalid JSON: {source}", path.display()),
            EngineError::InvalidConfig { path, msg } => write!(f, "{}: {msg}", path.display()),
            EngineError::Bind { addr, source } => write!(f, "cannot bind {addr}: {source}"),
            EngineError::Share(e) => fmt::Display::fmt(e, f),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Io { source, .. } | EngineError::Bind { source, .. } => Some(source),
            EngineError::Json { source, .. } => Some(source),
            EngineError::Share(e) => Some(e),
            EngineError::AssetsNotFound { .. } | EngineError::InvalidConfig { .. } => None,
        }
    }
}

/// Failures of the share pipeline.
///
/// Everything except `DeviceLost` is local to one frame or one consumer session: the render loop
/// and the server keep running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareError {
    /// No surface in the rotation is available for writing.
    ResourceExhausted { depth: usize },
    /// The GPU reported an execution error for the frame's command buffer.
    RenderFailed { msg: String },
    /// Frame format/size differs from the configured pixel format or the current rotation.
    /// A size change reformats the rotation; the triggering frame is dropped either way.
    FormatMismatch { expected: String, got: String },
    /// Frame region is empty or outside the source texture.
    InvalidRegion { msg: String },
    /// The command buffer did not complete within the GPU timeout.
    GpuTimeout { waited_ms: u64 },
    /// In-flight frame abandoned during shutdown.
    Abandoned,
    /// Pipeline no longer accepts frames.
    Stopped,
    /// Malformed or illegal consumer request. Terminates that session only.
    ProtocolError { msg: String },
    /// The request came from a peer without a live session (never subscribed, or timed out).
    NotSubscribed,
    /// Consumer asked for a surface/sequence that is no longer current.
    Stale { surface: SurfaceId, seq: u64 },
    /// A surface stayed pinned past the leak timeout after revocation.
    ResourceLeakDetected { surface: SurfaceId, refs: u32 },
    /// The GPU device is gone. Fatal for the pipeline.
    DeviceLost,
    /// Surface memory could not be created, written or read.
    Io { msg: String },
}

impl ShareError {
    /// Short machine-readable code (used on the wire and in drop counters).
    pub fn code(&self) -> &'static str {
        match self {
            ShareError::ResourceExhausted { .. } => "backpressure",
            ShareError::RenderFailed { .. } => "render_failed",
            ShareError::FormatMismatch { .. } => "format_mismatch",
            ShareError::InvalidRegion { .. } => "invalid_region",
            ShareError::GpuTimeout { .. } => "gpu_timeout",
            ShareError::Abandoned => "abandoned",
            ShareError::Stopped => "stopped",
            ShareError::ProtocolError { .. } => "protocol",
            ShareError::NotSubscribed => "not_subscribed",
            ShareError::Stale { .. } => "stale",
            ShareError::ResourceLeakDetected { .. } => "leak",
            ShareError::DeviceLost => "device_lost",
            ShareError::Io { .. } => "io",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ShareError::DeviceLost)
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        ShareError::ProtocolError { msg: msg.into() }
    }

    pub(crate) fn io(e: std::io::Error) -> Self {
        ShareError::Io { msg: e.to_string() }
    }
}

impl fmt::Display for ShareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShareError::ResourceExhausted { depth } => {
                write!(f, "all {depth} surfaces in the rotation are busy")
            }
            ShareError::RenderFailed { msg } => write!(f, "GPU command buffer failed: {msg}"),
            ShareError::FormatMismatch { expected, got } => {
                write!(f, "format mismatch: expected {expected}, got {got}")
            }
            ShareError::InvalidRegion { msg } => write!(f, "invalid region: {msg}"),
            ShareError::GpuTimeout { waited_ms } => {
                write!(f, "command buffer did not complete within {waited_ms}ms")
            }
            ShareError::Abandoned => write!(f, "frame abandoned during shutdown"),
            ShareError::Stopped => write!(f, "publisher is stopped"),
            ShareError::ProtocolError { msg } => write!(f, "protocol error: {msg}"),
            ShareError::NotSubscribed => write!(f, "no session for this consumer; subscribe again"),
            ShareError::Stale { surface, seq } => {
                write!(f, "surface {surface} (seq {seq}) is no longer current")
            }
            ShareError::ResourceLeakDetected { surface, refs } => {
                write!(f, "surface {surface} still pinned ({refs} refs) after revoke")
            }
            ShareError::DeviceLost => write!(f, "GPU device lost"),
            ShareError::Io { msg } => write!(f, "surface I/O error: {msg}"),
        }
    }
}

impl std::error::Error for ShareError {}

impl From<ShareError> for EngineError {
    fn from(e: ShareError) -> Self {
        EngineError::Share(e)
    }
}

pub type ShareResult<T> = Result<T, ShareError>;
