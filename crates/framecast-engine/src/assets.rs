use std::path::{Path, PathBuf};

use crate::error::EngineError;

/// Environment override for the config directory.
pub const ASSETS_ENV: &str = "FRAMECAST_ASSETS";

/// Directory holding `share.json` (and its per-OS variants).
///
/// The CLI and embedding applications both go through this type so relative paths inside the
/// config resolve the same way everywhere.
#[derive(Debug, Clone)]
pub struct AssetsRoot {
    path: PathBuf,
}

impl AssetsRoot {
    /// `$FRAMECAST_ASSETS` when it names an existing directory, otherwise the nearest `assets/`
    /// directory at or above `start_dir`.
    pub fn discover(start_dir: &Path) -> Result<Self, EngineError> {
        let from_env = std::env::var_os(ASSETS_ENV)
            .map(PathBuf::from)
            .filter(|p| p.is_dir());
        if let Some(path) = from_env {
            return Ok(Self { path });
        }

        start_dir
            .ancestors()
            .map(|dir| dir.join("assets"))
            .find(|cand| cand.is_dir())
            .map(|path| Self { path })
            .ok_or_else(|| EngineError::AssetsNotFound { start_dir: start_dir.to_path_buf() })
    }

    /// Use `path` as the assets root without searching.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `<stem>.<os>.json` when present, else `<stem>.json` (e.g. `share.macos.json` wins on macOS).
    pub fn pick_platform_json(&self, stem: &str) -> PathBuf {
        pick_platform_json(&self.path, stem)
    }
}

fn platform_tag() -> &'static str {
    match std::env::consts::OS {
        os @ ("windows" | "macos" | "linux") => os,
        _ => "other",
    }
}

pub fn pick_platform_json(assets: &Path, stem: &str) -> PathBuf {
    let specific = assets.join(format!("{stem}.{}.json", platform_tag()));
    if specific.is_file() {
        specific
    } else {
        assets.join(format!("{stem}.json"))
    }
}

/// Paths in `share.json` are relative to the assets directory unless absolute.
pub fn resolve_assets_path(assets_dir: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        assets_dir.join(p)
    }
}

pub fn read_to_string_result(path: &Path) -> Result<String, EngineError> {
    std::fs::read_to_string(path).map_err(|source| EngineError::Io { path: path.to_path_buf(), source })
}
