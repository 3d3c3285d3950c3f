use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::assets::{read_to_string_result, resolve_assets_path, AssetsRoot};
use crate::error::EngineError;
use crate::frame::PixelFormat;
use crate::registry::MIN_ROTATION_DEPTH;

/// How strictly to interpret/validate config files.
///
/// - `Lenient` is forward-compatible: unknown fields are ignored and missing optional
///   keys fall back to defaults.
/// - `Strict` is fail-fast: unknown fields and obvious shape issues become errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigMode {
    Lenient,
    Strict,
}

/// What `publish` does when no surface in the rotation is writable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum Backpressure {
    /// Drop the incoming frame immediately.
    Drop,
    /// Wait up to `max_wait_ms` for a surface, then drop.
    BoundedWait {
        #[serde(default = "default_max_wait_ms")]
        max_wait_ms: u64,
    },
}

impl Default for Backpressure {
    fn default() -> Self { Backpressure::Drop }
}

/// Where shared surfaces live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SurfaceBackend {
    /// One file per surface; mappable from other processes.
    File,
    /// In-process buffers only.
    Heap,
}

impl Default for SurfaceBackend {
    fn default() -> Self { SurfaceBackend::File }
}

/// Typed view of `assets/share.json`.
///
/// Versioning: `version` defaults to 1 when omitted.
/// Unknown fields are ignored in lenient mode (serde default behavior).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareConfig {
    #[serde(default = "default_version")]
    pub version: u32,

    /// Name the server advertises to consumers.
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Surfaces in the rotation (2 = double-buffered, 3 = triple-buffered).
    #[serde(default = "default_rotation_depth")]
    pub rotation_depth: usize,

    #[serde(default)]
    pub pixel_format: PixelFormat,

    #[serde(default)]
    pub backpressure: Backpressure,

    #[serde(default)]
    pub surface_backend: SurfaceBackend,

    /// A command buffer pending longer than this is abandoned.
    #[serde(default = "default_gpu_timeout_ms")]
    pub gpu_timeout_ms: u64,

    /// How long `stop` waits for in-flight GPU work.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Consumer sessions idle longer than this are dropped.
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Surfaces still pinned this long after revocation are reported as leaks.
    #[serde(default = "default_leak_timeout_ms")]
    pub leak_timeout_ms: u64,

    /// UDP address for the OSC front-end. `None` keeps the server in-process only.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: Option<String>,

    /// Directory for discovery files (defaults to `<temp>/framecast/servers`).
    #[serde(default)]
    pub discovery_dir: Option<PathBuf>,

    /// Directory for file-backed surfaces (defaults to `/dev/shm/framecast` on Linux).
    #[serde(default)]
    pub surface_dir: Option<PathBuf>,
}

/// Strict version of `ShareConfig` that fails on unknown fields.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ShareConfigStrict {
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default = "default_server_name")]
    server_name: String,
    #[serde(default = "default_rotation_depth")]
    rotation_depth: usize,
    #[serde(default)]
    pixel_format: PixelFormat,
    #[serde(default)]
    backpressure: Backpressure,
    #[serde(default)]
    surface_backend: SurfaceBackend,
    #[serde(default = "default_gpu_timeout_ms")]
    gpu_timeout_ms: u64,
    #[serde(default = "default_drain_timeout_ms")]
    drain_timeout_ms: u64,
    #[serde(default = "default_session_timeout_ms")]
    session_timeout_ms: u64,
    #[serde(default = "default_leak_timeout_ms")]
    leak_timeout_ms: u64,
    #[serde(default = "default_bind_addr")]
    bind_addr: Option<String>,
    #[serde(default)]
    discovery_dir: Option<PathBuf>,
    #[serde(default)]
    surface_dir: Option<PathBuf>,
}

impl From<ShareConfigStrict> for ShareConfig {
    fn from(s: ShareConfigStrict) -> Self {
        Self {
            version: s.version,
            server_name: s.server_name,
            rotation_depth: s.rotation_depth,
            pixel_format: s.pixel_format,
            backpressure: s.backpressure,
            surface_backend: s.surface_backend,
            gpu_timeout_ms: s.gpu_timeout_ms,
            drain_timeout_ms: s.drain_timeout_ms,
            session_timeout_ms: s.session_timeout_ms,
            leak_timeout_ms: s.leak_timeout_ms,
            bind_addr: s.bind_addr,
            discovery_dir: s.discovery_dir,
            surface_dir: s.surface_dir,
        }
    }
}

fn default_version() -> u32 { 1 }
fn default_server_name() -> String { "framecast".to_string() }
fn default_rotation_depth() -> usize { 3 }
fn default_max_wait_ms() -> u64 { 2 }
fn default_gpu_timeout_ms() -> u64 { 1_000 }
fn default_drain_timeout_ms() -> u64 { 500 }
fn default_session_timeout_ms() -> u64 { 5_000 }
fn default_leak_timeout_ms() -> u64 { 2_000 }
fn default_bind_addr() -> Option<String> { Some("127.0.0.1:0".to_string()) }

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            server_name: default_server_name(),
            rotation_depth: default_rotation_depth(),
            pixel_format: PixelFormat::default(),
            backpressure: Backpressure::default(),
            surface_backend: SurfaceBackend::default(),
            gpu_timeout_ms: default_gpu_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            session_timeout_ms: default_session_timeout_ms(),
            leak_timeout_ms: default_leak_timeout_ms(),
            bind_addr: default_bind_addr(),
            discovery_dir: None,
            surface_dir: None,
        }
    }
}

impl ShareConfig {
    /// Parse `share.json` text. `path` is only used for error messages.
    pub fn from_json_str(src: &str, mode: ConfigMode, path: &Path) -> Result<Self, EngineError> {
        let cfg: ShareConfig = match mode {
            ConfigMode::Lenient => serde_json::from_str(src).map_err(|e| EngineError::Json {
                path: path.to_path_buf(),
                source: e,
            })?,
            ConfigMode::Strict => serde_json::from_str::<ShareConfigStrict>(src)
                .map_err(|e| EngineError::Json {
                    path: path.to_path_buf(),
                    source: e,
                })?
                .into(),
        };

        // Minimal semantic validation in strict mode.
        if mode == ConfigMode::Strict {
            if cfg.version != 1 {
                return Err(EngineError::InvalidConfig {
                    path: path.to_path_buf(),
                    msg: format!("unsupported share.json version {} (expected 1)", cfg.version),
                });
            }
            if cfg.server_name.trim().is_empty() {
                return Err(EngineError::InvalidConfig {
                    path: path.to_path_buf(),
                    msg: "server_name must not be empty".to_string(),
                });
            }
        }
        if cfg.rotation_depth < MIN_ROTATION_DEPTH {
            return Err(EngineError::InvalidConfig {
                path: path.to_path_buf(),
                msg: format!(
                    "rotation_depth must be at least {MIN_ROTATION_DEPTH} (got {})",
                    cfg.rotation_depth
                ),
            });
        }

        Ok(cfg)
    }

    /// Relative directories in the config are resolved against the assets directory.
    pub fn resolve_paths(&mut self, assets_dir: &Path) {
        if let Some(d) = self.discovery_dir.as_mut() {
            *d = resolve_assets_path(assets_dir, d);
        }
        if let Some(d) = self.surface_dir.as_mut() {
            *d = resolve_assets_path(assets_dir, d);
        }
    }

    pub fn gpu_timeout(&self) -> Duration {
        Duration::from_millis(self.gpu_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn leak_timeout(&self) -> Duration {
        Duration::from_millis(self.leak_timeout_ms)
    }
}

/// A loaded config plus where it came from (`None` when defaults were used).
#[derive(Debug, Clone)]
pub struct LoadedShareConfig {
    pub path: Option<PathBuf>,
    pub config: ShareConfig,
}

/// Load `share(.<os>).json` from the assets root. A missing file yields defaults.
pub fn load_share_config(assets: &AssetsRoot, mode: ConfigMode) -> Result<LoadedShareConfig, EngineError> {
    let path = assets.pick_platform_json("share");
    if !path.exists() {
        return Ok(LoadedShareConfig { path: None, config: ShareConfig::default() });
    }
    let src = read_to_string_result(&path)?;
    let mut config = ShareConfig::from_json_str(&src, mode, &path)?;
    config.resolve_paths(assets.path());
    Ok(LoadedShareConfig { path: Some(path), config })
}

/// Discover `assets/` upward from `start_dir`, then load `share.json`.
pub fn load_share_config_from(start_dir: &Path, mode: ConfigMode) -> Result<LoadedShareConfig, EngineError> {
    let assets = AssetsRoot::discover(start_dir)?;
    load_share_config(&assets, mode)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str, mode: ConfigMode) -> Result<ShareConfig, EngineError> {
        ShareConfig::from_json_str(src, mode, Path::new("share.json"))
    }

    #[test]
    fn empty_object_gives_defaults() {
        let cfg = parse("{}", ConfigMode::Strict).unwrap();
        assert_eq!(cfg, ShareConfig::default());
        assert_eq!(cfg.rotation_depth, 3);
        assert_eq!(cfg.backpressure, Backpressure::Drop);
        assert_eq!(cfg.bind_addr.as_deref(), Some("127.0.0.1:0"));
    }

    #[test]
    fn backpressure_variants() {
        let cfg = parse(
            r#"{ "backpressure": { "policy": "bounded_wait", "max_wait_ms": 5 } }"#,
            ConfigMode::Lenient,
        )
        .unwrap();
        assert_eq!(cfg.backpressure, Backpressure::BoundedWait { max_wait_ms: 5 });

        let cfg = parse(r#"{ "backpressure": { "policy": "bounded_wait" } }"#, ConfigMode::Lenient).unwrap();
        assert_eq!(cfg.backpressure, Backpressure::BoundedWait { max_wait_ms: 2 });
    }

    #[test]
    fn strict_rejects_unknown_fields_lenient_ignores_them() {
        let src = r#"{ "server_name": "vj", "syphon": true }"#;
        assert!(parse(src, ConfigMode::Lenient).is_ok());
        assert!(matches!(parse(src, ConfigMode::Strict), Err(EngineError::Json { .. })));
    }

    #[test]
    fn strict_checks_version() {
        assert!(matches!(
            parse(r#"{ "version": 2 }"#, ConfigMode::Strict),
            Err(EngineError::InvalidConfig { .. })
        ));
        assert!(parse(r#"{ "version": 2 }"#, ConfigMode::Lenient).is_ok());
    }

    #[test]
    fn depth_below_two_is_rejected_in_both_modes() {
        for depth in [0, 1] {
            let src = format!(r#"{{ "rotation_depth": {depth} }}"#);
            for mode in [ConfigMode::Lenient, ConfigMode::Strict] {
                assert!(matches!(parse(&src, mode), Err(EngineError::InvalidConfig { .. })), "{depth} {mode:?}");
            }
        }
        assert_eq!(parse(r#"{ "rotation_depth": 2 }"#, ConfigMode::Strict).unwrap().rotation_depth, 2);
    }

    #[test]
    fn null_bind_addr_disables_udp() {
        let cfg = parse(r#"{ "bind_addr": null, "pixel_format": "bgra8" }"#, ConfigMode::Strict).unwrap();
        assert_eq!(cfg.bind_addr, None);
        assert_eq!(cfg.pixel_format, PixelFormat::Bgra8);
    }

    #[test]
    fn load_from_assets_resolves_relative_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let assets = dir.path().join("assets");
        std::fs::create_dir_all(&assets).unwrap();
        std::fs::write(
            assets.join("share.json"),
            r#"{ "server_name": "deck-a", "surface_dir": "surfaces" }"#,
        )
        .unwrap();

        let loaded = load_share_config(&AssetsRoot::at(&assets), ConfigMode::Strict).unwrap();
        assert_eq!(loaded.path, Some(assets.join("share.json")));
        assert_eq!(loaded.config.server_name, "deck-a");
        assert_eq!(loaded.config.surface_dir, Some(assets.join("surfaces")));
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_share_config(&AssetsRoot::at(dir.path()), ConfigMode::Lenient).unwrap();
        assert!(loaded.path.is_none());
        assert_eq!(loaded.config, ShareConfig::default());
    }
}
