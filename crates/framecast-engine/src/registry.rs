//! Shared Surface Registry
//!
//! Owns a small rotation of shared surfaces and their lifecycle:
//!
//! ```text
//!   Free ──acquire──▶ Writing ──mark_published──▶ Published ──(next publish / revoke)──▶ Draining
//!    ▲                   │                                                               │
//!    └────abandon────────┘◀──────────────────── refs == 0 ──────────────────────────────┘
//! ```
//!
//! Invariants:
//! - at most one surface is Published;
//! - the Published surface and pinned Draining surfaces are never handed out for writing;
//! - a surface is freed (or reformatted) only when its consumer reference count is zero;
//! - the rotation never holds more than `depth` surfaces of the current format.
//!
//! When nothing is writable the caller gets `ResourceExhausted` (immediately, or after a bounded
//! wait) and drops the frame. The pool does not grow.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::Backpressure;
use crate::error::{ShareError, ShareResult};
use crate::frame::SurfaceDesc;
use crate::surface::{SurfaceAllocator, SurfaceId, SurfaceMemory};
use crate::{logi, logw, loge};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceState {
    Free,
    Writing,
    Published,
    Draining,
}

struct Slot {
    desc: SurfaceDesc,
    generation: u64,
    state: SurfaceState,
    refs: u32,
    seq: Option<u64>,
    memory: Arc<dyn SurfaceMemory>,
}

#[derive(Default)]
struct Inner {
    slots: BTreeMap<SurfaceId, Slot>,
    next_id: u64,
    current: Option<SurfaceDesc>,
    generation: u64,
    published: Option<SurfaceId>,
    shutting_down: bool,
    allocations: u64,
    frees: u64,
}

/// A surface acquired for writing. Hand it back with `mark_published` or `abandon`.
pub struct WritableSurface {
    pub id: SurfaceId,
    pub desc: SurfaceDesc,
    memory: Arc<dyn SurfaceMemory>,
}

impl WritableSurface {
    /// Fill the surface. Runs without the registry lock held.
    pub fn write(&self, bytes: &[u8]) -> ShareResult<()> {
        self.memory.write(bytes)
    }
}

impl std::fmt::Debug for WritableSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WritableSurface").field("id", &self.id).field("desc", &self.desc).finish()
    }
}

/// Point-in-time view of one surface.
#[derive(Debug, Clone)]
pub struct SurfaceInfo {
    pub id: SurfaceId,
    pub desc: SurfaceDesc,
    pub state: SurfaceState,
    pub refs: u32,
    pub seq: Option<u64>,
    pub locator: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub depth: usize,
    pub free: usize,
    pub writing: usize,
    pub published: usize,
    pub draining: usize,
    pub live_surfaces: usize,
    pub pinned_refs: u64,
    pub allocated_bytes: usize,
    pub generation: u64,
    pub allocations: u64,
    pub frees: u64,
}

/// One surface holds the published frame while the next is written, so a rotation needs two.
pub const MIN_ROTATION_DEPTH: usize = 2;

pub struct SurfaceRegistry {
    inner: Mutex<Inner>,
    changed: Condvar,
    allocator: Arc<dyn SurfaceAllocator>,
    depth: usize,
    backpressure: Backpressure,
}

impl SurfaceRegistry {
    pub fn new(allocator: Arc<dyn SurfaceAllocator>, depth: usize, backpressure: Backpressure) -> Self {
        Self {
            inner: Mutex::new(Inner { next_id: 1, ..Inner::default() }),
            changed: Condvar::new(),
            allocator,
            depth: depth.max(MIN_ROTATION_DEPTH),
            backpressure,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    fn lock(&self) -> ShareResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| ShareError::Io { msg: "registry lock poisoned".into() })
    }

    /// Hand out a surface for the next frame.
    ///
    /// The first call sizes the rotation. A later descriptor change reformats the rotation and
    /// fails with `FormatMismatch` (the triggering frame is dropped).
    pub fn acquire_writable(&self, desc: SurfaceDesc) -> ShareResult<WritableSurface> {
        let mut inner = self.lock()?;
        if inner.shutting_down {
            return Err(ShareError::Stopped);
        }

        match inner.current {
            None => {
                inner.current = Some(desc);
                logi!("REGISTRY", "rotation sized to {desc} (depth={}, backend={})", self.depth, self.allocator.name());
            }
            Some(cur) if cur != desc => {
                self.reformat(&mut inner, desc);
                return Err(ShareError::FormatMismatch {
                    expected: cur.to_string(),
                    got: desc.to_string(),
                });
            }
            Some(_) => {}
        }

        let deadline = match self.backpressure {
            Backpressure::Drop => None,
            Backpressure::BoundedWait { max_wait_ms } => {
                Some(Instant::now() + Duration::from_millis(max_wait_ms))
            }
        };

        loop {
            if let Some(w) = self.try_take(&mut inner, desc)? {
                return Ok(w);
            }
            let Some(deadline) = deadline else { break; };
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .changed
                .wait_timeout(inner, deadline - now)
                .map_err(|_| ShareError::Io { msg: "registry lock poisoned".into() })?;
            inner = guard;
            if inner.shutting_down {
                return Err(ShareError::Stopped);
            }
            if inner.current != Some(desc) {
                return Err(ShareError::FormatMismatch {
                    expected: inner.current.map(|d| d.to_string()).unwrap_or_default(),
                    got: desc.to_string(),
                });
            }
        }

        Err(ShareError::ResourceExhausted { depth: self.depth })
    }

    fn try_take(&self, inner: &mut Inner, desc: SurfaceDesc) -> ShareResult<Option<WritableSurface>> {
        let generation = inner.generation;
        if let Some((id, slot)) = inner
            .slots
            .iter_mut()
            .find(|(_, s)| s.generation == generation && s.state == SurfaceState::Free)
        {
            slot.state = SurfaceState::Writing;
            slot.seq = None;
            return Ok(Some(WritableSurface { id: *id, desc, memory: slot.memory.clone() }));
        }

        let live = inner.slots.values().filter(|s| s.generation == generation).count();
        if live >= self.depth {
            return Ok(None);
        }

        let id = SurfaceId(inner.next_id);
        inner.next_id += 1;
        let memory: Arc<dyn SurfaceMemory> = Arc::from(self.allocator.allocate(id, &desc)?);
        inner.allocations += 1;
        inner.slots.insert(
            id,
            Slot {
                desc,
                generation,
                state: SurfaceState::Writing,
                refs: 0,
                seq: None,
                memory: memory.clone(),
            },
        );
        Ok(Some(WritableSurface { id, desc, memory }))
    }

    /// Invalidate the whole rotation for a new descriptor.
    fn reformat(&self, inner: &mut Inner, desc: SurfaceDesc) {
        inner.generation += 1;
        inner.current = Some(desc);
        let stale: Vec<SurfaceId> = inner
            .slots
            .iter()
            .filter(|(_, s)| s.state == SurfaceState::Free)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            inner.slots.remove(id);
            inner.frees += 1;
        }
        logw!(
            "REGISTRY",
            "reformat to {desc} (generation {}): freed {} idle surfaces, {} retire when released",
            inner.generation,
            stale.len(),
            inner.slots.len()
        );
        self.changed.notify_all();
    }

    /// Writing → Published. The previous Published surface starts draining.
    ///
    /// Returns the previously published surface, if any.
    pub fn mark_published(&self, id: SurfaceId, seq: u64) -> ShareResult<Option<SurfaceId>> {
        let mut inner = self.lock()?;
        match inner.slots.get(&id).map(|s| s.state) {
            Some(SurfaceState::Writing) => {}
            Some(other) => {
                return Err(ShareError::protocol(format!("surface {id} is {other:?}, not Writing")))
            }
            None => return Err(ShareError::protocol(format!("unknown surface {id}"))),
        }

        let prev = inner.published.replace(id);
        if let Some(slot) = inner.slots.get_mut(&id) {
            slot.state = SurfaceState::Published;
            slot.seq = Some(seq);
        }
        if let Some(p) = prev {
            if let Some(slot) = inner.slots.get_mut(&p) {
                slot.state = SurfaceState::Draining;
            }
            self.settle(&mut inner, p);
        }
        Ok(prev)
    }

    /// Writing → Free, for frames that will never be published.
    pub fn abandon(&self, id: SurfaceId) -> ShareResult<()> {
        let mut inner = self.lock()?;
        let Some(slot) = inner.slots.get_mut(&id) else {
            return Err(ShareError::protocol(format!("unknown surface {id}")));
        };
        if slot.state != SurfaceState::Writing {
            return Err(ShareError::protocol(format!("surface {id} is {:?}, not Writing", slot.state)));
        }
        slot.state = SurfaceState::Draining;
        self.settle(&mut inner, id);
        Ok(())
    }

    /// Take a consumer reference. Only announced (Published) or still-referenced (Draining)
    /// surfaces can be pinned.
    pub fn pin(&self, id: SurfaceId) -> ShareResult<u32> {
        let mut inner = self.lock()?;
        let Some(slot) = inner.slots.get_mut(&id) else {
            return Err(ShareError::protocol(format!("unknown surface {id}")));
        };
        match slot.state {
            SurfaceState::Published | SurfaceState::Draining => {
                slot.refs += 1;
                Ok(slot.refs)
            }
            other => Err(ShareError::protocol(format!("surface {id} is {other:?}; cannot pin"))),
        }
    }

    /// Drop a consumer reference. Returns the remaining count.
    pub fn release(&self, id: SurfaceId) -> ShareResult<u32> {
        let mut inner = self.lock()?;
        let Some(slot) = inner.slots.get_mut(&id) else {
            return Err(ShareError::protocol(format!("release of unknown surface {id}")));
        };
        if slot.refs == 0 {
            return Err(ShareError::protocol(format!("release of unpinned surface {id}")));
        }
        slot.refs -= 1;
        let left = slot.refs;
        self.settle(&mut inner, id);
        Ok(left)
    }

    /// Published → Draining (publishing stopped).
    pub fn revoke_published(&self) -> ShareResult<Option<SurfaceId>> {
        let mut inner = self.lock()?;
        let prev = inner.published.take();
        if let Some(p) = prev {
            if let Some(slot) = inner.slots.get_mut(&p) {
                slot.state = SurfaceState::Draining;
            }
            self.settle(&mut inner, p);
        }
        Ok(prev)
    }

    /// Return an unreferenced Draining surface to the pool, or free it when it belongs to an
    /// old generation or the registry is shutting down.
    fn settle(&self, inner: &mut Inner, id: SurfaceId) {
        let generation = inner.generation;
        let shutting_down = inner.shutting_down;
        let Some(slot) = inner.slots.get_mut(&id) else { return; };
        if slot.state != SurfaceState::Draining || slot.refs > 0 {
            return;
        }
        if slot.generation != generation || shutting_down {
            inner.slots.remove(&id);
            inner.frees += 1;
        } else {
            slot.state = SurfaceState::Free;
            slot.seq = None;
        }
        self.changed.notify_all();
    }

    /// Shutdown: free everything once unreferenced.
    ///
    /// Surfaces still pinned after `leak_timeout` are reported as leaks and reclaimed anyway.
    pub fn drain(&self, leak_timeout: Duration) -> ShareResult<Vec<ShareError>> {
        let mut inner = self.lock()?;
        inner.shutting_down = true;

        if let Some(p) = inner.published.take() {
            if let Some(slot) = inner.slots.get_mut(&p) {
                slot.state = SurfaceState::Draining;
            }
        }
        let ids: Vec<SurfaceId> = inner.slots.keys().copied().collect();
        for id in ids {
            if let Some(slot) = inner.slots.get_mut(&id) {
                if slot.state == SurfaceState::Free {
                    slot.state = SurfaceState::Draining;
                }
            }
            self.settle(&mut inner, id);
        }

        let deadline = Instant::now() + leak_timeout;
        while !inner.slots.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .changed
                .wait_timeout(inner, deadline - now)
                .map_err(|_| ShareError::Io { msg: "registry lock poisoned".into() })?;
            inner = guard;
            // Frames abandoned while we waited come back as Draining; free them.
            let ids: Vec<SurfaceId> = inner.slots.keys().copied().collect();
            for id in ids {
                self.settle(&mut inner, id);
            }
        }

        let mut leaks = Vec::new();
        let remaining = std::mem::take(&mut inner.slots);
        for (id, slot) in remaining {
            let err = ShareError::ResourceLeakDetected { surface: id, refs: slot.refs };
            loge!("REGISTRY", "{err} (state={:?}); reclaiming", slot.state);
            inner.frees += 1;
            leaks.push(err);
        }
        inner.current = None;
        self.changed.notify_all();
        logi!("REGISTRY", "drained: {} allocations, {} frees", inner.allocations, inner.frees);
        Ok(leaks)
    }

    pub fn published(&self) -> Option<SurfaceId> {
        self.lock().ok().and_then(|i| i.published)
    }

    pub fn info(&self, id: SurfaceId) -> Option<SurfaceInfo> {
        let inner = self.lock().ok()?;
        inner.slots.get(&id).map(|s| SurfaceInfo {
            id,
            desc: s.desc,
            state: s.state,
            refs: s.refs,
            seq: s.seq,
            locator: s.memory.locator().to_string(),
        })
    }

    /// Read a surface's bytes in-process. Requires a live pin so the read cannot race a rewrite.
    pub fn read_pinned(&self, id: SurfaceId) -> ShareResult<Vec<u8>> {
        let memory = {
            let inner = self.lock()?;
            let slot = inner
                .slots
                .get(&id)
                .ok_or_else(|| ShareError::protocol(format!("unknown surface {id}")))?;
            if slot.refs == 0 {
                return Err(ShareError::protocol(format!("surface {id} is not pinned")));
            }
            slot.memory.clone()
        };
        memory.read()
    }

    pub fn stats(&self) -> RegistryStats {
        let Ok(inner) = self.lock() else { return RegistryStats::default(); };
        let mut st = RegistryStats {
            depth: self.depth,
            generation: inner.generation,
            allocations: inner.allocations,
            frees: inner.frees,
            live_surfaces: inner.slots.len(),
            ..RegistryStats::default()
        };
        for s in inner.slots.values() {
            match s.state {
                SurfaceState::Free => st.free += 1,
                SurfaceState::Writing => st.writing += 1,
                SurfaceState::Published => st.published += 1,
                SurfaceState::Draining => st.draining += 1,
            }
            st.pinned_refs += s.refs as u64;
            st.allocated_bytes += s.desc.byte_len();
        }
        st
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;
    use crate::surface::HeapAllocator;

    fn desc(w: u32, h: u32) -> SurfaceDesc {
        SurfaceDesc { format: PixelFormat::Rgba8, width: w, height: h }
    }

    fn registry(depth: usize) -> SurfaceRegistry {
        SurfaceRegistry::new(Arc::new(HeapAllocator), depth, Backpressure::Drop)
    }

    fn publish_one(reg: &SurfaceRegistry, seq: u64) -> SurfaceId {
        let w = reg.acquire_writable(desc(8, 8)).unwrap();
        w.write(&vec![seq as u8; 8 * 8 * 4]).unwrap();
        reg.mark_published(w.id, seq).unwrap();
        w.id
    }

    #[test]
    fn rotation_is_bounded_without_consumers() {
        let reg = registry(3);
        for seq in 1..=200 {
            publish_one(&reg, seq);
            let st = reg.stats();
            assert!(st.live_surfaces <= 3, "grew to {}", st.live_surfaces);
            assert_eq!(st.published, 1);
        }
        let st = reg.stats();
        // Double-buffering suffices when nobody holds a mapping.
        assert_eq!(st.allocations, 2);
        assert_eq!(st.allocated_bytes, 2 * 8 * 8 * 4);
    }

    #[test]
    fn single_surface_rotation_is_raised_to_two() {
        let reg = registry(1);
        assert_eq!(reg.depth(), MIN_ROTATION_DEPTH);
        // Nobody maps anything, so no frame may be dropped.
        for seq in 1..=5 {
            publish_one(&reg, seq);
        }
        assert_eq!(reg.stats().live_surfaces, 2);
    }

    #[test]
    fn reformat_while_waiting_reports_new_rotation_as_expected() {
        let reg = Arc::new(SurfaceRegistry::new(
            Arc::new(HeapAllocator),
            2,
            Backpressure::BoundedWait { max_wait_ms: 2_000 },
        ));
        let a = publish_one(&reg, 1);
        reg.pin(a).unwrap();
        let b = publish_one(&reg, 2);
        reg.pin(b).unwrap();

        let r = reg.clone();
        let reformatter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            // Fails itself, but reformats the rotation under the waiter.
            let _ = r.acquire_writable(desc(16, 4));
        });
        let err = reg.acquire_writable(desc(8, 8)).unwrap_err();
        assert_eq!(
            err,
            ShareError::FormatMismatch { expected: desc(16, 4).to_string(), got: desc(8, 8).to_string() }
        );
        reformatter.join().unwrap();
    }

    #[test]
    fn published_surface_is_never_handed_out() {
        let reg = registry(2);
        let a = publish_one(&reg, 1);
        for seq in 2..10 {
            let w = reg.acquire_writable(desc(8, 8)).unwrap();
            assert_ne!(Some(w.id), reg.published());
            reg.mark_published(w.id, seq).unwrap();
        }
        assert!(reg.info(a).is_some());
    }

    #[test]
    fn exhaustion_when_everything_is_pinned_then_recovers() {
        let reg = registry(2);
        let a = publish_one(&reg, 1);
        reg.pin(a).unwrap();
        let b = publish_one(&reg, 2);
        reg.pin(b).unwrap();

        // a is Draining+pinned, b is Published+pinned.
        assert_eq!(reg.info(a).unwrap().state, SurfaceState::Draining);
        let err = reg.acquire_writable(desc(8, 8)).unwrap_err();
        assert_eq!(err, ShareError::ResourceExhausted { depth: 2 });
        assert_eq!(reg.stats().live_surfaces, 2);

        assert_eq!(reg.release(a).unwrap(), 0);
        assert_eq!(reg.info(a).unwrap().state, SurfaceState::Free);
        let w = reg.acquire_writable(desc(8, 8)).unwrap();
        assert_eq!(w.id, a);
    }

    #[test]
    fn refcount_never_goes_negative() {
        let reg = registry(2);
        let a = publish_one(&reg, 1);
        assert!(matches!(reg.release(a), Err(ShareError::ProtocolError { .. })));
        assert_eq!(reg.pin(a).unwrap(), 1);
        assert_eq!(reg.pin(a).unwrap(), 2);
        assert_eq!(reg.release(a).unwrap(), 1);
        assert_eq!(reg.release(a).unwrap(), 0);
        assert!(reg.release(a).is_err());
        assert_eq!(reg.info(a).unwrap().refs, 0);
    }

    #[test]
    fn writing_and_free_surfaces_cannot_be_pinned() {
        let reg = registry(2);
        let w = reg.acquire_writable(desc(8, 8)).unwrap();
        assert!(reg.pin(w.id).is_err());
        reg.abandon(w.id).unwrap();
        assert_eq!(reg.info(w.id).unwrap().state, SurfaceState::Free);
        assert!(reg.pin(w.id).is_err());
    }

    #[test]
    fn reformat_keeps_pinned_surfaces_until_release() {
        let reg = registry(3);
        let a = publish_one(&reg, 1);
        reg.pin(a).unwrap();
        let b = publish_one(&reg, 2);
        // one idle surface of the old format
        let w = reg.acquire_writable(desc(8, 8)).unwrap();
        reg.abandon(w.id).unwrap();
        assert_eq!(reg.stats().live_surfaces, 3);

        let err = reg.acquire_writable(desc(16, 4)).unwrap_err();
        assert!(matches!(err, ShareError::FormatMismatch { .. }));
        let st = reg.stats();
        assert_eq!(st.generation, 1);
        // idle one freed, pinned a and published b survive
        assert_eq!(st.live_surfaces, 2);
        assert!(reg.info(a).is_some());
        assert!(reg.info(b).is_some());

        let n = reg.acquire_writable(desc(16, 4)).unwrap();
        reg.mark_published(n.id, 3).unwrap();
        // b was unpinned and stale: freed as soon as it stopped being published.
        assert!(reg.info(b).is_none());
        assert!(reg.info(a).is_some());
        reg.release(a).unwrap();
        assert!(reg.info(a).is_none());
    }

    #[test]
    fn bounded_wait_picks_up_a_surface_released_meanwhile() {
        let reg = Arc::new(SurfaceRegistry::new(
            Arc::new(HeapAllocator),
            2,
            Backpressure::BoundedWait { max_wait_ms: 2_000 },
        ));
        let a = publish_one(&reg, 1);
        reg.pin(a).unwrap();
        let b = publish_one(&reg, 2);
        reg.pin(b).unwrap();

        let r = reg.clone();
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            r.release(a).unwrap();
        });
        let start = Instant::now();
        let w = reg.acquire_writable(desc(8, 8)).unwrap();
        assert_eq!(w.id, a);
        assert!(start.elapsed() < Duration::from_millis(2_000));
        releaser.join().unwrap();
    }

    #[test]
    fn bounded_wait_gives_up() {
        let reg = SurfaceRegistry::new(
            Arc::new(HeapAllocator),
            2,
            Backpressure::BoundedWait { max_wait_ms: 20 },
        );
        let a = publish_one(&reg, 1);
        reg.pin(a).unwrap();
        let b = publish_one(&reg, 2);
        reg.pin(b).unwrap();
        let start = Instant::now();
        assert_eq!(
            reg.acquire_writable(desc(8, 8)).unwrap_err(),
            ShareError::ResourceExhausted { depth: 2 }
        );
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn drain_frees_unreferenced_and_reports_leaks() {
        let reg = registry(3);
        let a = publish_one(&reg, 1);
        reg.pin(a).unwrap();
        publish_one(&reg, 2);

        let leaks = reg.drain(Duration::from_millis(30)).unwrap();
        assert_eq!(leaks, vec![ShareError::ResourceLeakDetected { surface: a, refs: 1 }]);
        let st = reg.stats();
        assert_eq!(st.live_surfaces, 0);
        assert_eq!(st.allocations, st.frees);
        assert_eq!(reg.acquire_writable(desc(8, 8)).unwrap_err(), ShareError::Stopped);
    }

    #[test]
    fn drain_waits_for_release() {
        let reg = Arc::new(registry(2));
        let a = publish_one(&reg, 1);
        reg.pin(a).unwrap();
        let r = reg.clone();
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            r.release(a).unwrap();
        });
        let leaks = reg.drain(Duration::from_secs(5)).unwrap();
        assert!(leaks.is_empty());
        assert_eq!(reg.stats().live_surfaces, 0);
        releaser.join().unwrap();
    }
}
