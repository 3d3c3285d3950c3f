//! Texture Share Server
//!
//! The process-boundary-facing side of the pipeline. The core here is transport-agnostic:
//! - it owns the single current `Announcement` (surface + sequence + size, swapped under one
//!   lock so nobody can see a half-updated value);
//! - it owns consumer sessions and the surface pins taken on their behalf;
//! - it pushes `ServerMessage`s into each session's outbox (a crossbeam channel).
//!
//! Transports (`udp`) translate wire requests into calls on `TextureShareServer` and drain the
//! outboxes. In-process consumers (`consumer::LocalConsumer`) use the core directly.
//!
//! Pinning rules:
//! - `map` pins a surface for a session; only the currently announced (surface, seq) can be
//!   newly mapped, everything else is `Stale`;
//! - `release` unpins; releasing something the session does not hold is a protocol error and
//!   terminates that session;
//! - disconnect, timeout and shutdown release every pin the session still holds.
//!
//! Only transport sessions (`connect_remote`) time out; in-process consumers end their session
//! on drop.
//!
//! Lock order is server → registry. The publisher never holds the registry lock while calling
//! into the server.

pub mod discovery;
pub mod udp;
pub mod wire;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, TrySendError};

use crate::error::{ShareError, ShareResult};
use crate::events::{EventBus, PipelineEvent};
use crate::frame::PixelFormat;
use crate::publisher::FrameCounters;
use crate::registry::SurfaceRegistry;
use crate::surface::SurfaceId;
use crate::{logi, logw};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Which surface currently holds the newest frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Announcement {
    pub surface: SurfaceId,
    pub seq: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// A pinned surface as handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub surface: SurfaceId,
    pub seq: u64,
    pub locator: String,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub stride: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerStatus {
    pub running: bool,
    pub seq: Option<u64>,
    pub sessions: usize,
    pub published: u64,
    pub dropped: u64,
}

/// Everything the server sends to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    FrameAvailable(Announcement),
    NoNewFrame,
    Mapped(Mapping),
    Released { surface: SurfaceId },
    Revoked,
    Shutdown,
    Pong,
    Status(ServerStatus),
    Error { code: String, msg: String },
}

impl ServerMessage {
    pub fn from_error(e: &ShareError) -> Self {
        ServerMessage::Error { code: e.code().to_string(), msg: e.to_string() }
    }
}

const OUTBOX_CAPACITY: usize = 64;

/// Outbox for a new session. Bounded: a consumer that stops reading misses notifications
/// (it will see a newer frame later), it never blocks the server.
pub fn outbox() -> (Sender<ServerMessage>, crossbeam_channel::Receiver<ServerMessage>) {
    crossbeam_channel::bounded(OUTBOX_CAPACITY)
}

struct Session {
    label: String,
    outbox: Sender<ServerMessage>,
    subscribed: bool,
    last_seen: Option<u64>,
    pins: HashMap<SurfaceId, u32>,
    last_activity: Instant,
    reapable: bool,
}

impl Session {
    fn push(&self, msg: ServerMessage) {
        match self.outbox.try_send(msg) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => {
                logw!("SERVER", "outbox full for {}; notification skipped", self.label);
            }
        }
    }

    /// Deliver `ann` unless this session already saw it (or something newer).
    fn offer(&mut self, ann: Announcement) -> bool {
        if self.last_seen.map_or(false, |s| s >= ann.seq) {
            return false;
        }
        self.last_seen = Some(ann.seq);
        true
    }
}

struct State {
    running: bool,
    current: Option<Announcement>,
    sessions: HashMap<SessionId, Session>,
}

pub struct TextureShareServer {
    name: String,
    state: Mutex<State>,
    registry: Arc<SurfaceRegistry>,
    counters: Arc<FrameCounters>,
    events: Arc<EventBus>,
    next_session: AtomicU64,
    session_timeout: Duration,
}

impl TextureShareServer {
    pub fn new(
        name: impl Into<String>,
        registry: Arc<SurfaceRegistry>,
        counters: Arc<FrameCounters>,
        events: Arc<EventBus>,
        session_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State { running: true, current: None, sessions: HashMap::new() }),
            registry,
            counters,
            events,
            next_session: AtomicU64::new(1),
            session_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &Arc<SurfaceRegistry> {
        &self.registry
    }

    fn lock(&self) -> ShareResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| ShareError::Io { msg: "server lock poisoned".into() })
    }

    // -------------------------------------------------------------------------
    // Publisher side
    // -------------------------------------------------------------------------

    /// Replace the current announcement and notify subscribers that have not seen it.
    pub fn announce(&self, ann: Announcement) -> ShareResult<()> {
        let mut st = self.lock()?;
        if !st.running {
            return Err(ShareError::Stopped);
        }
        if let Some(cur) = st.current {
            if ann.seq <= cur.seq {
                return Err(ShareError::protocol(format!(
                    "announcement seq {} does not follow {}",
                    ann.seq, cur.seq
                )));
            }
        }
        st.current = Some(ann);
        for s in st.sessions.values_mut() {
            if s.subscribed && s.offer(ann) {
                s.push(ServerMessage::FrameAvailable(ann));
            }
        }
        Ok(())
    }

    /// Withdraw the current announcement (publishing paused or stopping).
    pub fn revoke(&self) -> ShareResult<()> {
        let mut st = self.lock()?;
        if st.current.take().is_some() {
            for s in st.sessions.values().filter(|s| s.subscribed) {
                s.push(ServerMessage::Revoked);
            }
        }
        Ok(())
    }

    pub fn current_announcement(&self) -> Option<Announcement> {
        self.lock().ok().and_then(|st| st.current)
    }

    // -------------------------------------------------------------------------
    // Consumer side
    // -------------------------------------------------------------------------

    /// In-process session. Never reaped for inactivity.
    pub fn connect(&self, label: impl Into<String>, outbox: Sender<ServerMessage>) -> ShareResult<SessionId> {
        self.open_session(label.into(), outbox, false)
    }

    /// Session for a transport peer. Reaped once idle longer than the session timeout.
    pub fn connect_remote(&self, label: impl Into<String>, outbox: Sender<ServerMessage>) -> ShareResult<SessionId> {
        self.open_session(label.into(), outbox, true)
    }

    fn open_session(&self, label: String, outbox: Sender<ServerMessage>, reapable: bool) -> ShareResult<SessionId> {
        let mut st = self.lock()?;
        if !st.running {
            return Err(ShareError::Stopped);
        }
        let id = SessionId(self.next_session.fetch_add(1, Ordering::SeqCst));
        st.sessions.insert(
            id,
            Session {
                label: label.clone(),
                outbox,
                subscribed: false,
                last_seen: None,
                pins: HashMap::new(),
                last_activity: Instant::now(),
                reapable,
            },
        );
        drop(st);
        logi!("SERVER", "consumer {id} connected ({label})");
        self.events.emit(PipelineEvent::ConsumerConnected { session: id });
        Ok(id)
    }

    fn session_mut<'a>(st: &'a mut State, id: SessionId) -> ShareResult<&'a mut Session> {
        let s = st
            .sessions
            .get_mut(&id)
            .ok_or_else(|| ShareError::protocol(format!("unknown session {id}")))?;
        s.last_activity = Instant::now();
        Ok(s)
    }

    pub fn has_session(&self, id: SessionId) -> bool {
        self.lock().map(|st| st.sessions.contains_key(&id)).unwrap_or(false)
    }

    /// Start push notifications. A frame that is already announced is pushed right away.
    pub fn subscribe(&self, id: SessionId) -> ShareResult<()> {
        let mut st = self.lock()?;
        let current = st.current;
        let s = Self::session_mut(&mut st, id)?;
        s.subscribed = true;
        if let Some(ann) = current {
            if s.offer(ann) {
                s.push(ServerMessage::FrameAvailable(ann));
            }
        }
        Ok(())
    }

    /// Poll: the current announcement if this session has not seen it yet.
    pub fn current(&self, id: SessionId) -> ShareResult<Option<Announcement>> {
        let mut st = self.lock()?;
        let current = st.current;
        let s = Self::session_mut(&mut st, id)?;
        Ok(current.filter(|ann| s.offer(*ann)))
    }

    /// Pin `surface` for the session and describe how to map it.
    pub fn map(&self, id: SessionId, surface: SurfaceId, seq: u64) -> ShareResult<Mapping> {
        let mut st = self.lock()?;
        let current = st.current;
        let s = Self::session_mut(&mut st, id)?;

        let is_current = current.map_or(false, |a| a.surface == surface && a.seq == seq);
        let already_held = s.pins.get(&surface).copied().unwrap_or(0) > 0;
        if !is_current && !already_held {
            return Err(ShareError::Stale { surface, seq });
        }

        // The surface can have left Published between mark_published and announce.
        self.registry
            .pin(surface)
            .map_err(|_| ShareError::Stale { surface, seq })?;
        *s.pins.entry(surface).or_insert(0) += 1;

        let Some(info) = self.registry.info(surface) else {
            return Err(ShareError::Stale { surface, seq });
        };
        Ok(Mapping {
            surface,
            seq: info.seq.unwrap_or(seq),
            locator: info.locator,
            width: info.desc.width,
            height: info.desc.height,
            format: info.desc.format,
            stride: info.desc.stride() as u32,
        })
    }

    /// Drop one pin. An unheld surface is a protocol error and ends the session.
    pub fn release(&self, id: SessionId, surface: SurfaceId) -> ShareResult<()> {
        let held = {
            let mut st = self.lock()?;
            let s = Self::session_mut(&mut st, id)?;
            match s.pins.get_mut(&surface) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    if *n == 0 {
                        s.pins.remove(&surface);
                    }
                    true
                }
                _ => false,
            }
        };

        if !held {
            let err = ShareError::protocol(format!("release of {surface} which {id} does not hold"));
            self.disconnect(id, &err.to_string());
            return Err(err);
        }
        self.registry.release(surface)?;
        Ok(())
    }

    pub fn ping(&self, id: SessionId) -> ShareResult<()> {
        let mut st = self.lock()?;
        Self::session_mut(&mut st, id)?;
        Ok(())
    }

    /// End a session and release every pin it still holds.
    pub fn disconnect(&self, id: SessionId, reason: &str) {
        let removed = self.lock().ok().and_then(|mut st| st.sessions.remove(&id));
        let Some(session) = removed else { return; };
        self.release_pins(&session);
        logi!("SERVER", "consumer {id} ({}) disconnected: {reason}", session.label);
        self.events.emit(PipelineEvent::ConsumerDisconnected {
            session: id,
            reason: reason.to_string(),
        });
    }

    fn release_pins(&self, session: &Session) {
        for (surface, n) in &session.pins {
            for _ in 0..*n {
                if let Err(e) = self.registry.release(*surface) {
                    logw!("SERVER", "releasing {surface} for {}: {e}", session.label);
                }
            }
        }
    }

    /// Drop transport sessions idle longer than the session timeout.
    pub fn reap_idle(&self, now: Instant) -> Vec<SessionId> {
        let idle: Vec<SessionId> = match self.lock() {
            Ok(st) => st
                .sessions
                .iter()
                .filter(|(_, s)| s.reapable)
                .filter(|(_, s)| now.saturating_duration_since(s.last_activity) > self.session_timeout)
                .map(|(id, _)| *id)
                .collect(),
            Err(_) => return Vec::new(),
        };
        for id in &idle {
            self.disconnect(*id, "timeout");
        }
        idle
    }

    pub fn status(&self) -> ServerStatus {
        let Ok(st) = self.lock() else { return ServerStatus::default(); };
        ServerStatus {
            running: st.running,
            seq: st.current.map(|a| a.seq),
            sessions: st.sessions.len(),
            published: self.counters.published(),
            dropped: self.counters.dropped(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock().map(|st| st.running).unwrap_or(false)
    }

    /// Revoke, tell every consumer, and end all sessions (releasing their pins).
    pub fn shutdown(&self) {
        let sessions: Vec<(SessionId, Session)> = match self.lock() {
            Ok(mut st) => {
                if !st.running {
                    return;
                }
                st.running = false;
                st.current = None;
                st.sessions.drain().collect()
            }
            Err(_) => return,
        };
        for (id, s) in sessions {
            s.push(ServerMessage::Revoked);
            s.push(ServerMessage::Shutdown);
            self.release_pins(&s);
            self.events.emit(PipelineEvent::ConsumerDisconnected {
                session: id,
                reason: "shutdown".to_string(),
            });
        }
        logi!("SERVER", "'{}' shut down", self.name);
    }
}
