//! OSC wire format for the UDP transport.
//!
//! Consumer → server (all under `/framecast`):
//!   /subscribe
//!   /current
//!   /map      surface:i64 seq:i64
//!   /release  surface:i64
//!   /ping
//!   /status
//!   /bye
//!
//! Server → consumer:
//!   /frame        surface:i64 seq:i64 width:i32 height:i32 format:str
//!   /nonew
//!   /mapped       surface:i64 seq:i64 locator:str width:i32 height:i32 format:str stride:i32
//!   /released     surface:i64
//!   /revoked
//!   /shutdown
//!   /pong
//!   /status/reply running:bool seq:i64 (-1 = none) sessions:i32 published:i64 dropped:i64
//!   /error        code:str msg:str
//!
//! Integer arguments are accepted as either i32 or i64.

use rosc::{OscMessage, OscPacket, OscType};

use crate::error::{ShareError, ShareResult};
use crate::frame::PixelFormat;
use crate::server::{Announcement, Mapping, ServerMessage, ServerStatus};
use crate::surface::SurfaceId;

pub const PREFIX: &str = "/framecast";

/// Largest datagram either side sends (locators are short paths).
pub const MAX_PACKET: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRequest {
    Subscribe,
    Current,
    Map { surface: SurfaceId, seq: u64 },
    Release { surface: SurfaceId },
    Ping,
    Status,
    Bye,
}

fn addr(suffix: &str) -> String {
    format!("{PREFIX}/{suffix}")
}

fn encode(addr: String, args: Vec<OscType>) -> ShareResult<Vec<u8>> {
    rosc::encoder::encode(&OscPacket::Message(OscMessage { addr, args }))
        .map_err(|e| ShareError::protocol(format!("osc encode: {e:?}")))
}

/// Flatten bundles into their messages.
fn decode_messages(bytes: &[u8]) -> ShareResult<Vec<OscMessage>> {
    let (_rest, pkt) = rosc::decoder::decode_udp(bytes)
        .map_err(|e| ShareError::protocol(format!("osc decode: {e:?}")))?;
    let mut out = Vec::new();
    let mut stack = vec![pkt];
    while let Some(p) = stack.pop() {
        match p {
            OscPacket::Message(m) => out.push(m),
            OscPacket::Bundle(b) => stack.extend(b.content.into_iter().rev()),
        }
    }
    Ok(out)
}

struct Args<'a> {
    addr: &'a str,
    args: &'a [OscType],
}

impl<'a> Args<'a> {
    fn new(msg: &'a OscMessage) -> Self {
        Self { addr: &msg.addr, args: &msg.args }
    }

    fn get(&self, i: usize) -> ShareResult<&'a OscType> {
        self.args
            .get(i)
            .ok_or_else(|| ShareError::protocol(format!("{}: missing argument {i}", self.addr)))
    }

    fn int(&self, i: usize) -> ShareResult<i64> {
        match self.get(i)? {
            OscType::Long(v) => Ok(*v),
            OscType::Int(v) => Ok(*v as i64),
            other => Err(ShareError::protocol(format!("{}: argument {i} is {other:?}, want int", self.addr))),
        }
    }

    fn uint(&self, i: usize) -> ShareResult<u64> {
        let v = self.int(i)?;
        u64::try_from(v).map_err(|_| ShareError::protocol(format!("{}: argument {i} is negative", self.addr)))
    }

    fn u32(&self, i: usize) -> ShareResult<u32> {
        let v = self.uint(i)?;
        u32::try_from(v).map_err(|_| ShareError::protocol(format!("{}: argument {i} out of range", self.addr)))
    }

    fn string(&self, i: usize) -> ShareResult<&'a str> {
        match self.get(i)? {
            OscType::String(s) => Ok(s),
            other => Err(ShareError::protocol(format!("{}: argument {i} is {other:?}, want string", self.addr))),
        }
    }

    fn boolean(&self, i: usize) -> ShareResult<bool> {
        match self.get(i)? {
            OscType::Bool(b) => Ok(*b),
            OscType::Int(v) => Ok(*v != 0),
            other => Err(ShareError::protocol(format!("{}: argument {i} is {other:?}, want bool", self.addr))),
        }
    }

    fn format(&self, i: usize) -> ShareResult<PixelFormat> {
        let s = self.string(i)?;
        PixelFormat::parse(s).ok_or_else(|| ShareError::protocol(format!("{}: unknown pixel format '{s}'", self.addr)))
    }
}

fn suffix(addr: &str) -> ShareResult<&str> {
    addr.strip_prefix(PREFIX)
        .and_then(|s| s.strip_prefix('/'))
        .ok_or_else(|| ShareError::protocol(format!("address '{addr}' outside {PREFIX}")))
}

// -----------------------------------------------------------------------------
// Requests
// -----------------------------------------------------------------------------

pub fn encode_request(req: &ClientRequest) -> ShareResult<Vec<u8>> {
    match *req {
        ClientRequest::Subscribe => encode(addr("subscribe"), vec![]),
        ClientRequest::Current => encode(addr("current"), vec![]),
        ClientRequest::Map { surface, seq } => {
            encode(addr("map"), vec![OscType::Long(surface.0 as i64), OscType::Long(seq as i64)])
        }
        ClientRequest::Release { surface } => encode(addr("release"), vec![OscType::Long(surface.0 as i64)]),
        ClientRequest::Ping => encode(addr("ping"), vec![]),
        ClientRequest::Status => encode(addr("status"), vec![]),
        ClientRequest::Bye => encode(addr("bye"), vec![]),
    }
}

pub fn decode_requests(bytes: &[u8]) -> ShareResult<Vec<ClientRequest>> {
    decode_messages(bytes)?.iter().map(decode_request).collect()
}

fn decode_request(msg: &OscMessage) -> ShareResult<ClientRequest> {
    let a = Args::new(msg);
    Ok(match suffix(&msg.addr)? {
        "subscribe" => ClientRequest::Subscribe,
        "current" => ClientRequest::Current,
        "map" => ClientRequest::Map { surface: SurfaceId(a.uint(0)?), seq: a.uint(1)? },
        "release" => ClientRequest::Release { surface: SurfaceId(a.uint(0)?) },
        "ping" => ClientRequest::Ping,
        "status" => ClientRequest::Status,
        "bye" => ClientRequest::Bye,
        other => return Err(ShareError::protocol(format!("unknown request '{other}'"))),
    })
}

// -----------------------------------------------------------------------------
// Server messages
// -----------------------------------------------------------------------------

pub fn encode_message(msg: &ServerMessage) -> ShareResult<Vec<u8>> {
    match msg {
        ServerMessage::FrameAvailable(a) => encode(
            addr("frame"),
            vec![
                OscType::Long(a.surface.0 as i64),
                OscType::Long(a.seq as i64),
                OscType::Int(a.width as i32),
                OscType::Int(a.height as i32),
                OscType::String(a.format.as_str().to_string()),
            ],
        ),
        ServerMessage::NoNewFrame => encode(addr("nonew"), vec![]),
        ServerMessage::Mapped(m) => encode(
            addr("mapped"),
            vec![
                OscType::Long(m.surface.0 as i64),
                OscType::Long(m.seq as i64),
                OscType::String(m.locator.clone()),
                OscType::Int(m.width as i32),
                OscType::Int(m.height as i32),
                OscType::String(m.format.as_str().to_string()),
                OscType::Int(m.stride as i32),
            ],
        ),
        ServerMessage::Released { surface } => encode(addr("released"), vec![OscType::Long(surface.0 as i64)]),
        ServerMessage::Revoked => encode(addr("revoked"), vec![]),
        ServerMessage::Shutdown => encode(addr("shutdown"), vec![]),
        ServerMessage::Pong => encode(addr("pong"), vec![]),
        ServerMessage::Status(s) => encode(
            addr("status/reply"),
            vec![
                OscType::Bool(s.running),
                OscType::Long(s.seq.map_or(-1, |v| v as i64)),
                OscType::Int(s.sessions as i32),
                OscType::Long(s.published as i64),
                OscType::Long(s.dropped as i64),
            ],
        ),
        ServerMessage::Error { code, msg } => {
            encode(addr("error"), vec![OscType::String(code.clone()), OscType::String(msg.clone())])
        }
    }
}

pub fn decode_messages_from_server(bytes: &[u8]) -> ShareResult<Vec<ServerMessage>> {
    decode_messages(bytes)?.iter().map(decode_server_message).collect()
}

fn decode_server_message(msg: &OscMessage) -> ShareResult<ServerMessage> {
    let a = Args::new(msg);
    Ok(match suffix(&msg.addr)? {
        "frame" => ServerMessage::FrameAvailable(Announcement {
            surface: SurfaceId(a.uint(0)?),
            seq: a.uint(1)?,
            width: a.u32(2)?,
            height: a.u32(3)?,
            format: a.format(4)?,
        }),
        "nonew" => ServerMessage::NoNewFrame,
        "mapped" => ServerMessage::Mapped(Mapping {
            surface: SurfaceId(a.uint(0)?),
            seq: a.uint(1)?,
            locator: a.string(2)?.to_string(),
            width: a.u32(3)?,
            height: a.u32(4)?,
            format: a.format(5)?,
            stride: a.u32(6)?,
        }),
        "released" => ServerMessage::Released { surface: SurfaceId(a.uint(0)?) },
        "revoked" => ServerMessage::Revoked,
        "shutdown" => ServerMessage::Shutdown,
        "pong" => ServerMessage::Pong,
        "status/reply" => {
            let seq = a.int(1)?;
            ServerMessage::Status(ServerStatus {
                running: a.boolean(0)?,
                seq: (seq >= 0).then_some(seq as u64),
                sessions: a.uint(2)? as usize,
                published: a.uint(3)?,
                dropped: a.uint(4)?,
            })
        }
        "error" => ServerMessage::Error { code: a.string(0)?.to_string(), msg: a.string(1)?.to_string() },
        other => return Err(ShareError::protocol(format!("unknown server message '{other}'"))),
    })
}

/// Turn an `/error` reply back into the error it reports.
pub fn error_from_wire(code: &str, msg: &str, context: Option<(SurfaceId, u64)>) -> ShareError {
    match code {
        "stale" => match context {
            Some((surface, seq)) => ShareError::Stale { surface, seq },
            None => ShareError::protocol(msg),
        },
        "stopped" => ShareError::Stopped,
        "not_subscribed" => ShareError::NotSubscribed,
        "device_lost" => ShareError::DeviceLost,
        "io" => ShareError::Io { msg: msg.to_string() },
        _ => ShareError::protocol(format!("{code}: {msg}")),
    }
}
