//! Shared surface memory
//!
//! A surface is the only memory that crosses the process boundary. Backends:
//! - `HeapAllocator`: in-process buffers (`heap:<id>` locators). Good for tests and for
//!   consumers living in the publishing process.
//! - `FileAllocator`: one file per surface in a shared directory (tmpfs `/dev/shm` on Linux).
//!   The locator is the file path; another process maps the surface by opening it.
//!
//! The registry owns every `SurfaceMemory`; dropping one frees the backing store.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{ShareError, ShareResult};
use crate::frame::SurfaceDesc;

/// Opaque surface handle. Unique for the lifetime of a registry (never reused).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub u64);

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Backing store of one shared surface.
pub trait SurfaceMemory: Send + Sync {
    /// Cross-process address consumers use to map the surface.
    fn locator(&self) -> &str;

    /// Overwrite the whole surface (tightly packed, top-down rows).
    fn write(&self, bytes: &[u8]) -> ShareResult<()>;

    /// Snapshot of the surface contents.
    fn read(&self) -> ShareResult<Vec<u8>>;
}

pub trait SurfaceAllocator: Send + Sync {
    fn allocate(&self, id: SurfaceId, desc: &SurfaceDesc) -> ShareResult<Box<dyn SurfaceMemory>>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

// -----------------------------------------------------------------------------
// Heap
// -----------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

struct HeapSurface {
    locator: String,
    bytes: Mutex<Vec<u8>>,
}

impl SurfaceMemory for HeapSurface {
    fn locator(&self) -> &str {
        &self.locator
    }

    fn write(&self, bytes: &[u8]) -> ShareResult<()> {
        let mut buf = self
            .bytes
            .lock()
            .map_err(|_| ShareError::Io { msg: "surface lock poisoned".into() })?;
        if buf.len() != bytes.len() {
            return Err(ShareError::Io {
                msg: format!("write of {} bytes into {}-byte surface", bytes.len(), buf.len()),
            });
        }
        buf.copy_from_slice(bytes);
        Ok(())
    }

    fn read(&self) -> ShareResult<Vec<u8>> {
        self.bytes
            .lock()
            .map(|b| b.clone())
            .map_err(|_| ShareError::Io { msg: "surface lock poisoned".into() })
    }
}

impl SurfaceAllocator for HeapAllocator {
    fn allocate(&self, id: SurfaceId, desc: &SurfaceDesc) -> ShareResult<Box<dyn SurfaceMemory>> {
        Ok(Box::new(HeapSurface {
            locator: format!("heap:{}", id.0),
            bytes: Mutex::new(vec![0u8; desc.byte_len()]),
        }))
    }

    fn name(&self) -> &'static str {
        "heap"
    }
}

// -----------------------------------------------------------------------------
// File-backed (cross-process)
// -----------------------------------------------------------------------------

/// Allocates surfaces as files named `<prefix>-<pid>-<id>.surface` inside `dir`.
#[derive(Debug, Clone)]
pub struct FileAllocator {
    dir: PathBuf,
    prefix: String,
}

impl FileAllocator {
    pub fn new(dir: impl Into<PathBuf>, prefix: &str) -> ShareResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(ShareError::io)?;
        let prefix = prefix
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        Ok(Self { dir, prefix })
    }

    /// tmpfs on Linux so surfaces never touch a disk; the temp dir elsewhere.
    pub fn default_dir() -> PathBuf {
        let shm = Path::new("/dev/shm");
        if cfg!(target_os = "linux") && shm.is_dir() {
            shm.join("framecast")
        } else {
            std::env::temp_dir().join("framecast")
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

struct FileSurface {
    path: PathBuf,
    locator: String,
    len: usize,
    file: Mutex<File>,
}

impl SurfaceMemory for FileSurface {
    fn locator(&self) -> &str {
        &self.locator
    }

    fn write(&self, bytes: &[u8]) -> ShareResult<()> {
        if bytes.len() != self.len {
            return Err(ShareError::Io {
                msg: format!("write of {} bytes into {}-byte surface", bytes.len(), self.len),
            });
        }
        let mut f = self
            .file
            .lock()
            .map_err(|_| ShareError::Io { msg: "surface lock poisoned".into() })?;
        f.seek(SeekFrom::Start(0)).map_err(ShareError::io)?;
        f.write_all(bytes).map_err(ShareError::io)?;
        f.flush().map_err(ShareError::io)
    }

    fn read(&self) -> ShareResult<Vec<u8>> {
        read_file(&self.path)
    }
}

impl Drop for FileSurface {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

impl SurfaceAllocator for FileAllocator {
    fn allocate(&self, id: SurfaceId, desc: &SurfaceDesc) -> ShareResult<Box<dyn SurfaceMemory>> {
        let path = self
            .dir
            .join(format!("{}-{}-{}.surface", self.prefix, std::process::id(), id.0));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(ShareError::io)?;
        file.set_len(desc.byte_len() as u64).map_err(ShareError::io)?;
        Ok(Box::new(FileSurface {
            locator: path.to_string_lossy().into_owned(),
            path,
            len: desc.byte_len(),
            file: Mutex::new(file),
        }))
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

fn read_file(path: &Path) -> ShareResult<Vec<u8>> {
    let mut f = File::open(path).map_err(ShareError::io)?;
    let mut out = Vec::new();
    f.read_to_end(&mut out).map_err(ShareError::io)?;
    Ok(out)
}

/// Map a surface from another process by locator.
///
/// Heap locators only make sense inside the publishing process; use the registry for those.
pub fn open_locator(locator: &str) -> ShareResult<Vec<u8>> {
    if locator.starts_with("heap:") {
        return Err(ShareError::protocol(format!(
            "{locator} is process-local and cannot be mapped from here"
        )));
    }
    read_file(Path::new(locator))
}
