//! Consumers
//!
//! A consumer watches one server for new frames, maps the announced surface, reads it and
//! releases it. Two flavors:
//! - `LocalConsumer`: same process, talks to `TextureShareServer` directly;
//! - `RemoteConsumer`: another process, talks OSC over UDP (see `server::wire`).
//!
//! Both enforce that announced sequence numbers strictly increase; a violation is reported as
//! `ProtocolError`.

use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::error::{EngineError, ShareError, ShareResult};
use crate::server::discovery;
use crate::server::wire::{self, ClientRequest, MAX_PACKET};
use crate::server::{outbox, Announcement, Mapping, ServerMessage, ServerStatus, SessionId, TextureShareServer};
use crate::surface::{open_locator, SurfaceId};
use crate::{logi, logw};

/// Tracks the last sequence number a consumer accepted.
#[derive(Debug, Default, Clone, Copy)]
pub struct SequenceGuard {
    last: Option<u64>,
}

impl SequenceGuard {
    pub fn observe(&mut self, seq: u64) -> ShareResult<()> {
        if let Some(last) = self.last {
            if seq <= last {
                return Err(ShareError::protocol(format!("sequence went from {last} to {seq}")));
            }
        }
        self.last = Some(seq);
        Ok(())
    }

    pub fn last(&self) -> Option<u64> {
        self.last
    }
}

/// A frame read out of a shared surface (already released).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFrame {
    pub seq: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: crate::frame::PixelFormat,
    /// Top-down rows, `stride` bytes each.
    pub pixels: Vec<u8>,
}

impl ReceivedFrame {
    fn from_mapping(m: &Mapping, pixels: Vec<u8>) -> Self {
        Self { seq: m.seq, width: m.width, height: m.height, stride: m.stride, format: m.format, pixels }
    }

    /// RGBA/BGRA bytes of one pixel.
    pub fn pixel(&self, x: u32, y: u32) -> Option<&[u8]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let bpp = self.format.bytes_per_pixel();
        let i = y as usize * self.stride as usize + x as usize * bpp;
        self.pixels.get(i..i + bpp)
    }
}

// -----------------------------------------------------------------------------
// LocalConsumer
// -----------------------------------------------------------------------------

pub struct LocalConsumer {
    server: Arc<TextureShareServer>,
    id: SessionId,
    rx: Receiver<ServerMessage>,
    guard: SequenceGuard,
}

impl LocalConsumer {
    /// Connect and subscribe. A frame that is already current is delivered first.
    pub fn connect(server: Arc<TextureShareServer>, label: &str) -> ShareResult<Self> {
        let (tx, rx) = outbox();
        let id = server.connect(label, tx)?;
        server.subscribe(id)?;
        Ok(Self { server, id, rx, guard: SequenceGuard::default() })
    }

    pub fn session(&self) -> SessionId {
        self.id
    }

    /// Wait up to `timeout` for a newer frame. Queued notifications collapse to the newest.
    ///
    /// `Ok(None)` on timeout or when the announcement was revoked; `Stopped` after shutdown.
    pub fn next_frame(&mut self, timeout: Duration) -> ShareResult<Option<Announcement>> {
        let first = match self.rx.recv_timeout(timeout) {
            Ok(m) => m,
            Err(RecvTimeoutError::Timeout) => return Ok(None),
            Err(RecvTimeoutError::Disconnected) => return Err(ShareError::Stopped),
        };
        let mut newest = None;
        for msg in std::iter::once(first).chain(self.rx.try_iter()) {
            match msg {
                ServerMessage::FrameAvailable(ann) => {
                    self.guard.observe(ann.seq)?;
                    newest = Some(ann);
                }
                ServerMessage::Revoked => newest = None,
                ServerMessage::Shutdown => return Err(ShareError::Stopped),
                _ => {}
            }
        }
        Ok(newest)
    }

    pub fn map(&self, ann: &Announcement) -> ShareResult<Mapping> {
        self.server.map(self.id, ann.surface, ann.seq)
    }

    /// Read a mapped surface.
    pub fn read(&self, mapping: &Mapping) -> ShareResult<Vec<u8>> {
        self.server.registry().read_pinned(mapping.surface)
    }

    pub fn release(&self, surface: SurfaceId) -> ShareResult<()> {
        self.server.release(self.id, surface)
    }

    /// Wait for the next frame, copy it out and release the surface.
    ///
    /// A frame that went stale between announcement and mapping is skipped (`Ok(None)`).
    pub fn fetch(&mut self, timeout: Duration) -> ShareResult<Option<ReceivedFrame>> {
        let Some(ann) = self.next_frame(timeout)? else { return Ok(None); };
        let mapping = match self.map(&ann) {
            Ok(m) => m,
            Err(ShareError::Stale { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let pixels = self.read(&mapping);
        self.release(mapping.surface)?;
        Ok(Some(ReceivedFrame::from_mapping(&mapping, pixels?)))
    }

    pub fn status(&self) -> ServerStatus {
        self.server.status()
    }
}

impl Drop for LocalConsumer {
    fn drop(&mut self) {
        self.server.disconnect(self.id, "bye");
    }
}

// -----------------------------------------------------------------------------
// RemoteConsumer
// -----------------------------------------------------------------------------

pub struct RemoteConsumer {
    sock: UdpSocket,
    server: SocketAddr,
    guard: SequenceGuard,
    pending: VecDeque<ServerMessage>,
    reply_timeout: Duration,
    keepalive: Duration,
    last_sent: Instant,
    /// Subscribed again after the server dropped our session; the new session may repeat the
    /// frame we saw last.
    rejoined: bool,
    closed: bool,
}

const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(1);
const MIN_KEEPALIVE: Duration = Duration::from_millis(10);

impl RemoteConsumer {
    /// Subscribe to the server at `addr`.
    pub fn connect(addr: impl ToSocketAddrs) -> ShareResult<Self> {
        let server = addr
            .to_socket_addrs()
            .map_err(ShareError::io)?
            .next()
            .ok_or_else(|| ShareError::protocol("server address did not resolve"))?;
        let local = if server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let sock = UdpSocket::bind(local).map_err(ShareError::io)?;
        let mut me = Self {
            sock,
            server,
            guard: SequenceGuard::default(),
            pending: VecDeque::new(),
            reply_timeout: Duration::from_secs(1),
            keepalive: DEFAULT_KEEPALIVE,
            last_sent: Instant::now(),
            rejoined: false,
            closed: false,
        };
        me.send(ClientRequest::Subscribe)?;
        logi!("CONSUMER", "subscribed to {server}");
        Ok(me)
    }

    /// Find a server by name in `dir` and subscribe to it.
    pub fn discover(dir: &Path, name: &str) -> Result<Self, EngineError> {
        let rec = discovery::discover(dir, name)?;
        Ok(Self::connect(rec.addr.as_str())?)
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }

    /// How long request/reply calls (`map`, `release`, `status`, `ping`) wait.
    pub fn set_reply_timeout(&mut self, d: Duration) {
        self.reply_timeout = d;
    }

    /// Longest silence while waiting in `next_frame` before a `/ping` goes out. Keep it well
    /// under the server's `session_timeout_ms`.
    pub fn set_keepalive(&mut self, d: Duration) {
        self.keepalive = d.max(MIN_KEEPALIVE);
    }

    fn send(&mut self, req: ClientRequest) -> ShareResult<()> {
        let buf = wire::encode_request(&req)?;
        self.sock.send_to(&buf, self.server).map_err(ShareError::io)?;
        self.last_sent = Instant::now();
        Ok(())
    }

    /// The server no longer knows us (the session timed out); subscribe again.
    fn rejoin(&mut self) -> ShareResult<()> {
        logw!("CONSUMER", "session on {} lost; subscribing again", self.server);
        self.rejoined = true;
        self.send(ClientRequest::Subscribe)
    }

    fn is_not_subscribed(msg: &ServerMessage) -> bool {
        matches!(msg, ServerMessage::Error { code, .. } if code == ShareError::NotSubscribed.code())
    }

    /// Sequence check for a pushed or polled frame. Returns false for a repeat that a fresh
    /// session sent right after a rejoin.
    fn accept(&mut self, seq: u64) -> ShareResult<bool> {
        if self.rejoined {
            if self.guard.last().is_some_and(|last| seq <= last) {
                return Ok(false);
            }
            self.rejoined = false;
        }
        self.guard.observe(seq)?;
        Ok(true)
    }

    /// Receive one datagram (or time out) into `pending`. Returns false on timeout.
    fn pump(&mut self, deadline: Instant) -> ShareResult<bool> {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Ok(false);
        }
        self.sock.set_read_timeout(Some(left)).map_err(ShareError::io)?;
        let mut buf = [0u8; MAX_PACKET];
        match self.sock.recv_from(&mut buf) {
            Ok((sz, from)) => {
                if from != self.server {
                    return Ok(true);
                }
                match wire::decode_messages_from_server(&buf[..sz]) {
                    Ok(msgs) => self.pending.extend(msgs),
                    Err(e) => logw!("CONSUMER", "ignoring bad packet from {from}: {e}"),
                }
                Ok(true)
            }
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => Ok(false),
            Err(e) => Err(ShareError::io(e)),
        }
    }

    /// Drop replies to earlier requests (late ones included) so they cannot answer the next
    /// request. Notifications stay queued.
    fn discard_replies(&mut self) -> ShareResult<()> {
        while self.pump(Instant::now() + Duration::from_millis(1))? {}
        let mut lost_session = false;
        self.pending.retain(|m| match m {
            ServerMessage::FrameAvailable(_) | ServerMessage::Revoked | ServerMessage::Shutdown => true,
            other => {
                lost_session |= Self::is_not_subscribed(other);
                false
            }
        });
        if lost_session {
            self.rejoin()?;
        }
        Ok(())
    }

    /// Take the first pending message `pick` accepts, receiving more until `deadline`.
    fn wait_for<T>(
        &mut self,
        deadline: Instant,
        mut pick: impl FnMut(&ServerMessage) -> Option<ShareResult<T>>,
    ) -> ShareResult<Option<T>> {
        loop {
            if let Some(i) = self.pending.iter().position(|m| pick(m).is_some()) {
                if let Some(msg) = self.pending.remove(i) {
                    if let Some(r) = pick(&msg) {
                        return r.map(Some);
                    }
                }
            }
            if !self.pump(deadline)? && Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    /// Send `req` and wait for the reply `pick` accepts. `NotSubscribed` renews the session
    /// before it is returned.
    fn request<T>(
        &mut self,
        req: ClientRequest,
        what: &str,
        pick: impl FnMut(&ServerMessage) -> Option<ShareResult<T>>,
    ) -> ShareResult<T> {
        self.discard_replies()?;
        self.send(req)?;
        let deadline = Instant::now() + self.reply_timeout;
        match self.wait_for(deadline, pick) {
            Ok(Some(v)) => Ok(v),
            Ok(None) => Err(ShareError::Io { msg: format!("{what}: no reply from server") }),
            Err(ShareError::NotSubscribed) => {
                self.rejoin()?;
                Err(ShareError::NotSubscribed)
            }
            Err(e) => Err(e),
        }
    }

    /// Wait up to `timeout` for a newer frame. Queued notifications collapse to the newest.
    ///
    /// Pings the server every keepalive interval while waiting, and subscribes again if the
    /// server reports that our session is gone.
    pub fn next_frame(&mut self, timeout: Duration) -> ShareResult<Option<Announcement>> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut newest = None;
            let mut rest = VecDeque::new();
            while let Some(msg) = self.pending.pop_front() {
                match msg {
                    ServerMessage::FrameAvailable(ann) => {
                        if self.accept(ann.seq)? {
                            newest = Some(ann);
                        }
                    }
                    ServerMessage::Revoked => newest = None,
                    ServerMessage::Shutdown => {
                        self.closed = true;
                        return Err(ShareError::Stopped);
                    }
                    ServerMessage::Pong => {}
                    ref m if Self::is_not_subscribed(m) => self.rejoin()?,
                    other => rest.push_back(other),
                }
            }
            self.pending = rest;
            if newest.is_some() {
                return Ok(newest);
            }
            if self.last_sent.elapsed() >= self.keepalive {
                self.send(ClientRequest::Ping)?;
            }
            let wake = deadline.min(self.last_sent + self.keepalive);
            if !self.pump(wake)? && Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    /// Poll for a frame this consumer has not seen yet.
    pub fn current(&mut self) -> ShareResult<Option<Announcement>> {
        let got = self.request(ClientRequest::Current, "current", |m| match m {
            ServerMessage::FrameAvailable(ann) => Some(Ok(Some(*ann))),
            ServerMessage::NoNewFrame => Some(Ok(None)),
            ServerMessage::Error { code, msg } => Some(Err(wire::error_from_wire(code, msg, None))),
            _ => None,
        })?;
        let Some(ann) = got else { return Ok(None); };
        Ok(self.accept(ann.seq)?.then_some(ann))
    }

    pub fn map(&mut self, ann: &Announcement) -> ShareResult<Mapping> {
        let ctx = (ann.surface, ann.seq);
        self.request(ClientRequest::Map { surface: ann.surface, seq: ann.seq }, "map", |m| match m {
            ServerMessage::Mapped(map) if map.surface == ctx.0 => Some(Ok(map.clone())),
            ServerMessage::Error { code, msg } => Some(Err(wire::error_from_wire(code, msg, Some(ctx)))),
            _ => None,
        })
    }

    /// Read a mapped surface from shared memory.
    pub fn read(&self, mapping: &Mapping) -> ShareResult<Vec<u8>> {
        open_locator(&mapping.locator)
    }

    pub fn release(&mut self, surface: SurfaceId) -> ShareResult<()> {
        self.request(ClientRequest::Release { surface }, "release", |m| match m {
            ServerMessage::Released { surface: s } if *s == surface => Some(Ok(())),
            ServerMessage::Error { code, msg } => Some(Err(wire::error_from_wire(code, msg, None))),
            _ => None,
        })
    }

    /// Wait for the next frame, copy it out and release the surface.
    ///
    /// `Ok(None)` when nothing arrived, the frame went stale before mapping, or the session had
    /// to be renewed.
    pub fn fetch(&mut self, timeout: Duration) -> ShareResult<Option<ReceivedFrame>> {
        let Some(ann) = self.next_frame(timeout)? else { return Ok(None); };
        let mapping = match self.map(&ann) {
            Ok(m) => m,
            Err(ShareError::Stale { .. } | ShareError::NotSubscribed) => return Ok(None),
            Err(e) => return Err(e),
        };
        let pixels = self.read(&mapping);
        self.release(mapping.surface)?;
        Ok(Some(ReceivedFrame::from_mapping(&mapping, pixels?)))
    }

    /// Round trip to the server. A server that dropped our session still counts as alive; the
    /// session is renewed.
    pub fn ping(&mut self) -> ShareResult<Duration> {
        let t0 = Instant::now();
        let answer = self.request(ClientRequest::Ping, "ping", |m| match m {
            ServerMessage::Pong => Some(Ok(())),
            ServerMessage::Error { code, msg } => Some(Err(wire::error_from_wire(code, msg, None))),
            _ => None,
        });
        match answer {
            Ok(()) | Err(ShareError::NotSubscribed) => Ok(t0.elapsed()),
            Err(e) => Err(e),
        }
    }

    pub fn status(&mut self) -> ShareResult<ServerStatus> {
        self.request(ClientRequest::Status, "status", |m| match m {
            ServerMessage::Status(s) => Some(Ok(s.clone())),
            _ => None,
        })
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.guard.last()
    }
}

impl Drop for RemoteConsumer {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.send(ClientRequest::Bye);
        }
    }
}

/// One-shot status query without subscribing.
pub fn query_status(addr: impl ToSocketAddrs, timeout: Duration) -> ShareResult<ServerStatus> {
    let server = addr
        .to_socket_addrs()
        .map_err(ShareError::io)?
        .next()
        .ok_or_else(|| ShareError::protocol("server address did not resolve"))?;
    let sock = UdpSocket::bind(if server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" }).map_err(ShareError::io)?;
    sock.send_to(&wire::encode_request(&ClientRequest::Status)?, server).map_err(ShareError::io)?;

    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; MAX_PACKET];
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(ShareError::Io { msg: format!("no status reply from {server}") });
        }
        sock.set_read_timeout(Some(left)).map_err(ShareError::io)?;
        match sock.recv_from(&mut buf) {
            Ok((sz, from)) if from == server => {
                for msg in wire::decode_messages_from_server(&buf[..sz])? {
                    if let ServerMessage::Status(s) = msg {
                        return Ok(s);
                    }
                }
            }
            Ok(_) => {}
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {}
            Err(e) => return Err(ShareError::io(e)),
        }
    }
}
