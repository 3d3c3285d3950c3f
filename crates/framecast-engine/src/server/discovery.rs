//! Server discovery.
//!
//! A running server advertises itself with `<dir>/<name>.json`; consumers look servers up by
//! name. The file is removed when the `Advertisement` is dropped. A crashed server leaves a
//! stale file behind, which `discover` skips when the recorded pid is no longer alive (Linux).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::frame::PixelFormat;
use crate::{logi, logw};

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRecord {
    pub name: String,
    /// UDP address of the OSC endpoint, e.g. `127.0.0.1:50123`.
    pub addr: String,
    pub pid: u32,
    pub format: PixelFormat,
    #[serde(default = "default_protocol")]
    pub protocol: u32,
}

fn default_protocol() -> u32 {
    PROTOCOL_VERSION
}

/// `<temp>/framecast/servers`
pub fn default_dir() -> PathBuf {
    std::env::temp_dir().join("framecast").join("servers")
}

/// Server names become file names; keep them to a safe alphabet.
pub fn file_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if stem.is_empty() { "framecast".to_string() } else { stem }
}

pub fn record_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.json", file_stem(name)))
}

/// Advertised server. Dropping it removes the discovery file.
#[derive(Debug)]
pub struct Advertisement {
    path: PathBuf,
}

impl Advertisement {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Advertisement {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => logi!("DISCOVERY", "removed {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => logw!("DISCOVERY", "could not remove {}: {e}", self.path.display()),
        }
    }
}

/// Write the discovery file for `record`, replacing a previous one with the same name.
pub fn advertise(dir: &Path, record: &DiscoveryRecord) -> Result<Advertisement, EngineError> {
    std::fs::create_dir_all(dir).map_err(|e| EngineError::Io { path: dir.to_path_buf(), source: e })?;
    let path = record_path(dir, &record.name);
    let json = serde_json::to_string_pretty(record).map_err(|e| EngineError::Json { path: path.clone(), source: e })?;

    // Write-then-rename so readers never see a partial file.
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(|e| EngineError::Io { path: tmp.clone(), source: e })?;
    std::fs::rename(&tmp, &path).map_err(|e| EngineError::Io { path: path.clone(), source: e })?;

    logi!("DISCOVERY", "advertised '{}' at {} ({})", record.name, record.addr, path.display());
    Ok(Advertisement { path })
}

fn read_record(path: &Path) -> Result<DiscoveryRecord, EngineError> {
    let src = std::fs::read_to_string(path).map_err(|e| EngineError::Io { path: path.to_path_buf(), source: e })?;
    serde_json::from_str(&src).map_err(|e| EngineError::Json { path: path.to_path_buf(), source: e })
}

fn pid_alive(pid: u32) -> bool {
    if cfg!(target_os = "linux") {
        Path::new("/proc").join(pid.to_string()).exists()
    } else {
        true
    }
}

/// Look up a server by name.
pub fn discover(dir: &Path, name: &str) -> Result<DiscoveryRecord, EngineError> {
    let path = record_path(dir, name);
    let rec = read_record(&path)?;
    if !pid_alive(rec.pid) {
        return Err(EngineError::InvalidConfig {
            path,
            msg: format!("server '{name}' (pid {}) is no longer running", rec.pid),
        });
    }
    if rec.protocol != PROTOCOL_VERSION {
        return Err(EngineError::InvalidConfig {
            path,
            msg: format!("server speaks protocol {}, expected {PROTOCOL_VERSION}", rec.protocol),
        });
    }
    Ok(rec)
}

/// Every live server advertised in `dir`, sorted by name. Unreadable files are skipped.
pub fn list(dir: &Path) -> Vec<DiscoveryRecord> {
    let Ok(rd) = std::fs::read_dir(dir) else { return Vec::new(); };
    let mut out: Vec<DiscoveryRecord> = rd
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map_or(false, |x| x == "json"))
        .filter_map(|p| read_record(&p).ok())
        .filter(|r| pid_alive(r.pid))
        .collect();
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> DiscoveryRecord {
        DiscoveryRecord {
            name: name.to_string(),
            addr: "127.0.0.1:9000".into(),
            pid: std::process::id(),
            format: PixelFormat::Bgra8,
            protocol: PROTOCOL_VERSION,
        }
    }

    #[test]
    fn advertise_then_discover_then_withdraw() {
        let dir = tempfile::tempdir().unwrap();
        let ad = advertise(dir.path(), &record("main out")).unwrap();
        assert_eq!(ad.path(), dir.path().join("main_out.json"));

        let found = discover(dir.path(), "main out").unwrap();
        assert_eq!(found, record("main out"));
        assert_eq!(list(dir.path()).len(), 1);

        drop(ad);
        assert!(discover(dir.path(), "main out").is_err());
        assert!(list(dir.path()).is_empty());
    }

    #[test]
    fn unknown_server_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(discover(dir.path(), "nobody"), Err(EngineError::Io { .. })));
    }

    #[test]
    fn list_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hi").unwrap();
        let _a = advertise(dir.path(), &record("b")).unwrap();
        let _b = advertise(dir.path(), &record("a")).unwrap();
        let names: Vec<String> = list(dir.path()).into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
