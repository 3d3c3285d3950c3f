//! GPU seam
//!
//! The pipeline never talks to a graphics API directly. A render engine hands it:
//! - a `SourceTexture` it can read the finished pixels from, and
//! - a `CommandBuffer` that reports (exactly once) when the GPU work writing that texture is done.
//!
//! Native backends adapt their own objects to these traits. `ManualCommandBuffer` is the
//! building block for that: a native completion callback calls `complete(..)`.
//!
//! `SoftwareQueue` + `SoftwareTexture` are a CPU stand-in used by the demo binary and tests:
//! encoded work runs asynchronously on a "gpu" thread and completion handlers fire afterwards,
//! which is the same ordering contract a real command queue gives.

use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Sender};

use crate::error::{ShareError, ShareResult};
use crate::frame::{PixelFormat, Region};

/// Final state of a submitted command buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStatus {
    Completed,
    Error(String),
    DeviceLost,
}

pub type CompletionHandler = Box<dyn FnOnce(CommandStatus) + Send + 'static>;

/// A unit of submitted GPU work.
pub trait CommandBuffer: Send + Sync {
    /// Register a handler that runs once the GPU has finished the buffer.
    ///
    /// Handlers registered after completion run immediately on the calling thread.
    fn on_completed(&self, handler: CompletionHandler);
}

/// A texture the pipeline can read finished pixels from.
pub trait SourceTexture: Send + Sync {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn format(&self) -> PixelFormat;

    /// Copy `region` into `dst` (tightly packed, native row order).
    fn read_rows(&self, region: Region, dst: &mut [u8]) -> ShareResult<()>;
}

// -----------------------------------------------------------------------------
// ManualCommandBuffer
// -----------------------------------------------------------------------------

#[derive(Default)]
struct ManualState {
    status: Option<CommandStatus>,
    handlers: Vec<CompletionHandler>,
}

/// Command buffer whose completion is signalled by the caller.
#[derive(Default)]
pub struct ManualCommandBuffer {
    state: Mutex<ManualState>,
}

impl ManualCommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal completion. Only the first call has an effect.
    pub fn complete(&self, status: CommandStatus) {
        let handlers = {
            let Ok(mut st) = self.state.lock() else { return; };
            if st.status.is_some() {
                return;
            }
            st.status = Some(status.clone());
            std::mem::take(&mut st.handlers)
        };
        for h in handlers {
            h(status.clone());
        }
    }

    pub fn status(&self) -> Option<CommandStatus> {
        self.state.lock().ok().and_then(|st| st.status.clone())
    }
}

impl CommandBuffer for ManualCommandBuffer {
    fn on_completed(&self, handler: CompletionHandler) {
        let done = {
            let Ok(mut st) = self.state.lock() else { return; };
            match &st.status {
                Some(s) => Some(s.clone()),
                None => {
                    st.handlers.push(handler);
                    return;
                }
            }
        };
        if let Some(s) = done {
            handler(s);
        }
    }
}

// -----------------------------------------------------------------------------
// Software GPU
// -----------------------------------------------------------------------------

type GpuOp = Box<dyn FnOnce() + Send + 'static>;

/// Command buffer executed by a `SoftwareQueue`.
pub struct SoftwareCommandBuffer {
    done: ManualCommandBuffer,
    ops: Mutex<Vec<GpuOp>>,
    outcome: Mutex<CommandStatus>,
    latency: Mutex<Duration>,
}

impl SoftwareCommandBuffer {
    fn new() -> Self {
        Self {
            done: ManualCommandBuffer::new(),
            ops: Mutex::new(Vec::new()),
            outcome: Mutex::new(CommandStatus::Completed),
            latency: Mutex::new(Duration::ZERO),
        }
    }

    /// Record work that runs on the queue thread when the buffer executes.
    pub fn encode(&self, op: impl FnOnce() + Send + 'static) {
        if let Ok(mut ops) = self.ops.lock() {
            ops.push(Box::new(op));
        }
    }

    /// Make the buffer report an execution error instead of success.
    pub fn fail_with(&self, msg: impl Into<String>) {
        if let Ok(mut o) = self.outcome.lock() {
            *o = CommandStatus::Error(msg.into());
        }
    }

    pub fn lose_device(&self) {
        if let Ok(mut o) = self.outcome.lock() {
            *o = CommandStatus::DeviceLost;
        }
    }

    /// Extra simulated execution time.
    pub fn set_latency(&self, d: Duration) {
        if let Ok(mut l) = self.latency.lock() {
            *l = d;
        }
    }

    pub fn status(&self) -> Option<CommandStatus> {
        self.done.status()
    }

    fn execute(&self) {
        let latency = self.latency.lock().map(|l| *l).unwrap_or_default();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        let ops = self.ops.lock().map(|mut o| std::mem::take(&mut *o)).unwrap_or_default();
        let outcome = self
            .outcome
            .lock()
            .map(|o| o.clone())
            .unwrap_or(CommandStatus::Completed);
        // A failed buffer leaves the texture untouched.
        if outcome == CommandStatus::Completed {
            for op in ops {
                op();
            }
        }
        self.done.complete(outcome);
    }
}

impl CommandBuffer for SoftwareCommandBuffer {
    fn on_completed(&self, handler: CompletionHandler) {
        self.done.on_completed(handler);
    }
}

/// In-order asynchronous executor for `SoftwareCommandBuffer`s.
pub struct SoftwareQueue {
    tx: Option<Sender<Arc<SoftwareCommandBuffer>>>,
    join: Option<JoinHandle<()>>,
}

impl SoftwareQueue {
    pub fn new() -> ShareResult<Self> {
        let (tx, rx) = unbounded::<Arc<SoftwareCommandBuffer>>();
        let join = std::thread::Builder::new()
            .name("gpu".to_string())
            .spawn(move || {
                for cb in rx.iter() {
                    cb.execute();
                }
            })
            .map_err(ShareError::io)?;
        Ok(Self { tx: Some(tx), join: Some(join) })
    }

    pub fn command_buffer(&self) -> Arc<SoftwareCommandBuffer> {
        Arc::new(SoftwareCommandBuffer::new())
    }

    /// Submit for asynchronous execution. Returns immediately.
    pub fn commit(&self, cb: &Arc<SoftwareCommandBuffer>) -> ShareResult<()> {
        let tx = self.tx.as_ref().ok_or(ShareError::Stopped)?;
        tx.send(cb.clone()).map_err(|_| ShareError::Stopped)
    }
}

impl Drop for SoftwareQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker finish what was committed, then exit.
        self.tx.take();
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// CPU texture, 4 bytes per pixel, rows stored top-down.
pub struct SoftwareTexture {
    width: u32,
    height: u32,
    format: PixelFormat,
    pixels: RwLock<Vec<u8>>,
}

impl SoftwareTexture {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let len = width as usize * height as usize * format.bytes_per_pixel();
        Self { width, height, format, pixels: RwLock::new(vec![0u8; len]) }
    }

    /// Fill with a pattern where every row is distinguishable: (x, y, seed, 255) per pixel,
    /// each component truncated to a byte.
    pub fn fill_test_pattern(&self, seed: u8) {
        let Ok(mut px) = self.pixels.write() else { return; };
        let bpp = self.format.bytes_per_pixel();
        for y in 0..self.height as usize {
            for x in 0..self.width as usize {
                let i = (y * self.width as usize + x) * bpp;
                px[i] = x as u8;
                px[i + 1] = y as u8;
                px[i + 2] = seed;
                px[i + 3] = 255;
            }
        }
    }

    pub fn fill(&self, rgba: [u8; 4]) {
        let Ok(mut px) = self.pixels.write() else { return; };
        for chunk in px.chunks_exact_mut(4) {
            chunk.copy_from_slice(&rgba);
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> Vec<u8> {
        let bpp = self.format.bytes_per_pixel();
        let i = (y as usize * self.width as usize + x as usize) * bpp;
        self.pixels
            .read()
            .map(|px| px[i..i + bpp].to_vec())
            .unwrap_or_default()
    }
}

impl SourceTexture for SoftwareTexture {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn format(&self) -> PixelFormat {
        self.format
    }

    fn read_rows(&self, region: Region, dst: &mut [u8]) -> ShareResult<()> {
        region.validate(self.width, self.height)?;
        let bpp = self.format.bytes_per_pixel();
        let src_stride = self.width as usize * bpp;
        let row_len = region.width as usize * bpp;
        if dst.len() < row_len * region.height as usize {
            return Err(ShareError::InvalidRegion {
                msg: format!("destination too small ({} bytes)", dst.len()),
            });
        }
        let px = self
            .pixels
            .read()
            .map_err(|_| ShareError::Io { msg: "texture lock poisoned".into() })?;
        for row in 0..region.height as usize {
            let src = (region.y as usize + row) * src_stride + region.x as usize * bpp;
            dst[row * row_len..(row + 1) * row_len].copy_from_slice(&px[src..src + row_len]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn manual_buffer_fires_each_handler_once() {
        let cb = ManualCommandBuffer::new();
        let (tx, rx) = unbounded();
        let tx2 = tx.clone();
        cb.on_completed(Box::new(move |s| tx.send(s).unwrap()));
        cb.complete(CommandStatus::Completed);
        cb.complete(CommandStatus::Error("late".into()));
        // Registered after completion: runs immediately with the first status.
        cb.on_completed(Box::new(move |s| tx2.send(s).unwrap()));

        let got: Vec<_> = rx.try_iter().collect();
        assert_eq!(got, vec![CommandStatus::Completed, CommandStatus::Completed]);
    }

    #[test]
    fn software_queue_runs_ops_before_completion() {
        let queue = SoftwareQueue::new().unwrap();
        let tex = Arc::new(SoftwareTexture::new(2, 2, PixelFormat::Rgba8));
        let cb = queue.command_buffer();
        let t = tex.clone();
        cb.encode(move || t.fill([9, 8, 7, 6]));

        let (tx, rx) = bounded(1);
        let t = tex.clone();
        cb.on_completed(Box::new(move |s| {
            tx.send((s, t.pixel(1, 1))).unwrap();
        }));
        queue.commit(&cb).unwrap();

        let (status, px) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(status, CommandStatus::Completed);
        assert_eq!(px, vec![9, 8, 7, 6]);
    }

    #[test]
    fn failed_buffer_reports_error_and_skips_ops() {
        let queue = SoftwareQueue::new().unwrap();
        let tex = Arc::new(SoftwareTexture::new(1, 1, PixelFormat::Rgba8));
        let cb = queue.command_buffer();
        let t = tex.clone();
        cb.encode(move || t.fill([1, 1, 1, 1]));
        cb.fail_with("shader trap");

        let (tx, rx) = bounded(1);
        cb.on_completed(Box::new(move |s| tx.send(s).unwrap()));
        queue.commit(&cb).unwrap();

        let status = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(status, CommandStatus::Error("shader trap".into()));
        assert_eq!(tex.pixel(0, 0), vec![0, 0, 0, 0]);
    }
}
