//! UDP/OSC transport for the share server.
//!
//! One receive thread (`share-server`) owns the socket and maps peer addresses to sessions.
//! Request replies go straight back to the sender; pushed notifications (`/frame`,
//! `/revoked`, `/shutdown`) are drained from each session's outbox by a small forwarder
//! thread per consumer, so a slow peer never stalls the receive loop.
//!
//! Requests other than `/subscribe` and `/status` from a peer without a live session get
//! `/error not_subscribed`; the same reply goes out when a session times out.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;

use crate::error::{EngineError, ShareError};
use crate::frame::PixelFormat;
use crate::server::discovery::{self, Advertisement, DiscoveryRecord, PROTOCOL_VERSION};
use crate::server::wire::{self, ClientRequest, MAX_PACKET};
use crate::server::{outbox, ServerMessage, SessionId, TextureShareServer};
use crate::{logi, logw};

const REAP_EVERY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct UdpOptions {
    pub bind: String,
    /// Write a discovery file here (None = don't advertise).
    pub discovery_dir: Option<PathBuf>,
    pub format: PixelFormat,
}

/// Running UDP endpoint. Dropping it stops the receive thread and withdraws the advertisement.
pub struct UdpServerHandle {
    local_addr: SocketAddr,
    stop_tx: crossbeam_channel::Sender<()>,
    join: Option<JoinHandle<()>>,
    advert: Option<Advertisement>,
}

impl UdpServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address a consumer on this host should connect to.
    pub fn connect_addr(&self) -> SocketAddr {
        reachable(self.local_addr)
    }

    pub fn discovery_file(&self) -> Option<&std::path::Path> {
        self.advert.as_ref().map(|a| a.path())
    }
}

impl Drop for UdpServerHandle {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
        self.advert.take();
    }
}

pub fn spawn(server: Arc<TextureShareServer>, opts: &UdpOptions) -> Result<UdpServerHandle, EngineError> {
    let bind_err = |e| EngineError::Bind { addr: opts.bind.clone(), source: e };
    let sock = UdpSocket::bind(&opts.bind).map_err(bind_err)?;
    sock.set_nonblocking(true).map_err(bind_err)?;
    let local_addr = sock.local_addr().map_err(bind_err)?;

    let advert = match &opts.discovery_dir {
        Some(dir) => Some(discovery::advertise(
            dir,
            &DiscoveryRecord {
                name: server.name().to_string(),
                addr: reachable(local_addr).to_string(),
                pid: std::process::id(),
                format: opts.format,
                protocol: PROTOCOL_VERSION,
            },
        )?),
        None => None,
    };

    logi!("SERVER", "'{}' listening on {local_addr}", server.name());
    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);

    let join = std::thread::Builder::new()
        .name("share-server".to_string())
        .spawn(move || {
            let mut peers: HashMap<SocketAddr, SessionId> = HashMap::new();
            let mut buf = [0u8; MAX_PACKET];
            let mut last_reap = Instant::now();
            loop {
                if stop_rx.try_recv().is_ok() {
                    break;
                }

                match sock.recv_from(&mut buf) {
                    Ok((sz, from)) => handle_datagram(&server, &sock, &mut peers, &buf[..sz], from),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(2));
                    }
                    Err(e) => {
                        // ICMP port-unreachable from a vanished peer shows up here on some OSes.
                        logw!("SERVER", "recv error: {e}");
                        std::thread::sleep(Duration::from_millis(2));
                    }
                }

                if last_reap.elapsed() >= REAP_EVERY {
                    last_reap = Instant::now();
                    let reaped = server.reap_idle(last_reap);
                    peers.retain(|addr, id| {
                        if reaped.contains(id) {
                            // A reaped peer re-subscribes when it sees not_subscribed.
                            logi!("SERVER", "consumer {id} ({addr}) timed out");
                            reply(&sock, *addr, &ServerMessage::from_error(&ShareError::NotSubscribed));
                        }
                        server.has_session(*id)
                    });
                }
            }

            for (_, id) in peers.drain() {
                server.disconnect(id, "transport closed");
            }
            logi!("SERVER", "udp endpoint {local_addr} closed");
        })
        .map_err(|e| EngineError::Bind { addr: local_addr.to_string(), source: e })?;

    Ok(UdpServerHandle { local_addr, stop_tx, join: Some(join), advert })
}

/// Replies come from the concrete interface; advertise loopback for wildcard binds.
fn reachable(addr: SocketAddr) -> SocketAddr {
    let mut out = addr;
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => out.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        IpAddr::V6(ip) if ip.is_unspecified() => out.set_ip(IpAddr::V6(Ipv6Addr::LOCALHOST)),
        _ => {}
    }
    out
}

fn reply(sock: &UdpSocket, to: SocketAddr, msg: &ServerMessage) {
    match wire::encode_message(msg) {
        Ok(buf) => {
            let _ = sock.send_to(&buf, to);
        }
        Err(e) => logw!("SERVER", "encode error: {e}"),
    }
}

fn spawn_forwarder(sock: &UdpSocket, to: SocketAddr, id: SessionId, rx: Receiver<ServerMessage>) -> bool {
    let sock = match sock.try_clone() {
        Ok(s) => s,
        Err(e) => {
            logw!("SERVER", "cannot clone socket for {id}: {e}");
            return false;
        }
    };
    // Ends when the session (and with it the outbox sender) is gone.
    std::thread::Builder::new()
        .name(format!("share-peer-{}", id.0))
        .spawn(move || {
            for msg in rx.iter() {
                reply(&sock, to, &msg);
            }
        })
        .is_ok()
}

fn handle_datagram(
    server: &TextureShareServer,
    sock: &UdpSocket,
    peers: &mut HashMap<SocketAddr, SessionId>,
    bytes: &[u8],
    from: SocketAddr,
) {
    let requests = match wire::decode_requests(bytes) {
        Ok(r) => r,
        Err(e) => {
            reply(sock, from, &ServerMessage::from_error(&e));
            if let Some(id) = peers.remove(&from) {
                server.disconnect(id, &e.to_string());
            }
            return;
        }
    };
    for req in requests {
        handle_request(server, sock, peers, req, from);
    }
}

fn handle_request(
    server: &TextureShareServer,
    sock: &UdpSocket,
    peers: &mut HashMap<SocketAddr, SessionId>,
    req: ClientRequest,
    from: SocketAddr,
) {
    let session = peers.get(&from).copied().filter(|id| server.has_session(*id));
    if session.is_none() {
        peers.remove(&from);
    }

    let answer = match (req, session) {
        (ClientRequest::Status, _) => Some(ServerMessage::Status(server.status())),
        (ClientRequest::Ping, Some(id)) => Some(match server.ping(id) {
            Ok(()) => ServerMessage::Pong,
            Err(e) => ServerMessage::from_error(&e),
        }),
        (ClientRequest::Subscribe, Some(id)) => server.subscribe(id).err().map(|e| ServerMessage::from_error(&e)),
        (ClientRequest::Subscribe, None) => {
            let (tx, rx) = outbox();
            match server.connect_remote(from.to_string(), tx) {
                Ok(id) => {
                    if !spawn_forwarder(sock, from, id, rx) {
                        server.disconnect(id, "no forwarder");
                        Some(ServerMessage::Error { code: "io".into(), msg: "server could not accept session".into() })
                    } else {
                        peers.insert(from, id);
                        server.subscribe(id).err().map(|e| ServerMessage::from_error(&e))
                    }
                }
                Err(e) => Some(ServerMessage::from_error(&e)),
            }
        }
        (ClientRequest::Bye, Some(id)) => {
            peers.remove(&from);
            server.disconnect(id, "bye");
            None
        }
        (ClientRequest::Bye, None) => None,
        (_, None) => Some(ServerMessage::from_error(&ShareError::NotSubscribed)),
        (ClientRequest::Current, Some(id)) => Some(match server.current(id) {
            Ok(Some(ann)) => ServerMessage::FrameAvailable(ann),
            Ok(None) => ServerMessage::NoNewFrame,
            Err(e) => ServerMessage::from_error(&e),
        }),
        (ClientRequest::Map { surface, seq }, Some(id)) => Some(match server.map(id, surface, seq) {
            Ok(m) => ServerMessage::Mapped(m),
            Err(e) => ServerMessage::from_error(&e),
        }),
        (ClientRequest::Release { surface }, Some(id)) => Some(match server.release(id, surface) {
            Ok(()) => ServerMessage::Released { surface },
            Err(e) => {
                if !server.has_session(id) {
                    peers.remove(&from);
                }
                ServerMessage::from_error(&e)
            }
        }),
    };

    if let Some(msg) = answer {
        reply(sock, from, &msg);
    }
}
