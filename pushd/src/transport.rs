//! Presence/messaging protocol client.
//!
//! The engine consumes the channel through the [`ProtocolClient`] trait; the
//! dispatch loop never sees wire details. [`TcpProtocolClient`] is the
//! concrete implementation: newline-delimited JSON frames over TCP, each
//! frame HMAC-SHA256 signed with the dispatcher password.

use std::collections::HashSet;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use push_common::strip_resource;

type HmacSha256 = Hmac<Sha256>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const ROSTER_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_FRAME_BYTES: usize = 64 * 1024;

const KIND_AUTH: &str = "AUTH";
const KIND_AUTH_ACK: &str = "AUTH_ACK";
const KIND_PRESENCE: &str = "PRESENCE";
const KIND_SUBSCRIBE: &str = "SUBSCRIBE";
const KIND_UNSUBSCRIBE: &str = "UNSUBSCRIBE";
const KIND_MESSAGE: &str = "MESSAGE";
const KIND_ROSTER_GET: &str = "ROSTER_GET";
const KIND_ROSTER: &str = "ROSTER";
const KIND_ERR: &str = "ERR";

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("handshake rejected: {0}")]
    HandshakeFailed(String),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Kinds of outbound notifications the dispatcher sends to agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// "You have work queued; check in with the server."
    CheckIn,
    /// Liveness probe.
    Ping,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::CheckIn => "request-checkin",
            MessageKind::Ping => "ping",
        }
    }
}

/// Result of the combined socket-readiness-or-timeout wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Readable,
    Timeout,
}

/// Presence subscriptions grouped by direction.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    pub to: HashSet<String>,
    pub from: HashSet<String>,
    pub both: HashSet<String>,
}

impl Roster {
    /// Union over all three directions.
    pub fn all(&self) -> HashSet<String> {
        self.to
            .iter()
            .chain(self.from.iter())
            .chain(self.both.iter())
            .cloned()
            .collect()
    }
}

/// The messaging channel as the engine sees it.
#[async_trait]
pub trait ProtocolClient {
    async fn retrieve_roster(&mut self) -> Result<Roster, TransportError>;
    async fn subscribe(&mut self, jids: &[String]) -> Result<(), TransportError>;
    async fn unsubscribe(&mut self, jids: &[String]) -> Result<(), TransportError>;
    async fn send_presence(&mut self) -> Result<(), TransportError>;
    async fn send_message(&mut self, jid: &str, kind: MessageKind) -> Result<(), TransportError>;
    /// Whether the peer is currently reachable for messaging.
    fn is_available(&self, jid: &str) -> bool;
    /// Block until the socket is readable or `timeout` elapses.
    async fn wait(&mut self, timeout: Duration) -> Result<Readiness, TransportError>;
    /// Drain and process buffered inbound protocol events.
    async fn process_inbound(&mut self) -> Result<(), TransportError>;
}

/// One wire frame.
#[derive(Serialize, Deserialize, Clone, Debug)]
struct Frame {
    kind: String,
    msg_id: String,
    from: String,
    to: String,
    ts: u64,
    hmac: String,
    payload: serde_json::Value,
}

fn canonical_body(frame: &Frame) -> String {
    let payload = serde_json::to_string(&frame.payload).unwrap_or_else(|_| "{}".to_string());
    format!(
        "{}|{}|{}|{}|{}|{}",
        frame.kind, frame.msg_id, frame.from, frame.to, frame.ts, payload
    )
}

fn sign_frame(frame: &mut Frame, secret: &str) -> Result<(), TransportError> {
    let body = canonical_body(frame);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?;
    mac.update(body.as_bytes());
    frame.hmac = general_purpose::STANDARD.encode(mac.finalize().into_bytes());
    Ok(())
}

fn verify_frame(frame: &Frame, secret: &str) -> bool {
    let body = canonical_body(frame);
    let provided = general_purpose::STANDARD
        .decode(frame.hmac.as_bytes())
        .unwrap_or_default();
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body.as_bytes());
    mac.verify_slice(&provided).is_ok()
}

#[derive(Deserialize)]
struct PresencePayload {
    jid: String,
    available: bool,
}

#[derive(Deserialize)]
struct RosterPayload {
    #[serde(default)]
    to: Vec<String>,
    #[serde(default)]
    from: Vec<String>,
    #[serde(default)]
    both: Vec<String>,
}

/// Inbound byte buffer with newline framing and an oversized-line guard.
///
/// A single line longer than [`MAX_FRAME_BYTES`] is dropped, including
/// whatever tail of it arrives in later reads; framing resumes at the next
/// newline. Complete lines are never capped in aggregate, only drained.
#[derive(Default)]
struct LineBuffer {
    buf: Vec<u8>,
    discarding: bool,
}

impl LineBuffer {
    fn ingest(&mut self, data: &[u8]) {
        let mut data = data;
        if self.discarding {
            match data.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    self.discarding = false;
                    data = &data[pos + 1..];
                }
                None => return,
            }
        }
        self.buf.extend_from_slice(data);
        let line_start = self
            .buf
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(0, |pos| pos + 1);
        let partial = self.buf.len() - line_start;
        if partial > MAX_FRAME_BYTES {
            warn!(bytes = partial, "dropping oversized line from server");
            self.buf.truncate(line_start);
            self.discarding = true;
        }
    }

    fn pop_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.buf.drain(..=pos).collect();
        Some(String::from_utf8_lossy(&line[..pos]).trim().to_string())
    }

    fn has_line(&self) -> bool {
        self.buf.contains(&b'\n')
    }
}

/// JSON-lines-over-TCP implementation of [`ProtocolClient`].
pub struct TcpProtocolClient {
    stream: TcpStream,
    inbuf: LineBuffer,
    jid: String,
    secret: String,
    server: String,
    available: HashSet<String>,
}

impl TcpProtocolClient {
    /// Connect and authenticate. Fatal on any handshake problem.
    pub async fn connect(addr: &str, jid: &str, secret: &str) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        let mut client = Self {
            stream,
            inbuf: LineBuffer::default(),
            jid: jid.to_string(),
            secret: secret.to_string(),
            server: addr.to_string(),
            available: HashSet::new(),
        };
        client
            .send_frame(KIND_AUTH, addr, serde_json::json!({ "jid": jid }))
            .await?;
        let reply = client.next_frame(HANDSHAKE_TIMEOUT).await?;
        match reply.kind.as_str() {
            KIND_AUTH_ACK => {
                debug!(jid, server = addr, "authenticated");
                Ok(client)
            }
            KIND_ERR => Err(TransportError::HandshakeFailed(
                reply
                    .payload
                    .get("error")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unspecified")
                    .to_string(),
            )),
            other => Err(TransportError::HandshakeFailed(format!(
                "unexpected frame kind {other} during handshake"
            ))),
        }
    }

    async fn send_frame(
        &mut self,
        kind: &str,
        to: &str,
        payload: serde_json::Value,
    ) -> Result<(), TransportError> {
        let mut frame = Frame {
            kind: kind.to_string(),
            msg_id: Uuid::new_v4().to_string(),
            from: self.jid.clone(),
            to: to.to_string(),
            ts: chrono::Utc::now().timestamp() as u64,
            hmac: String::new(),
            payload,
        };
        sign_frame(&mut frame, &self.secret)?;
        let line = serde_json::to_string(&frame)
            .map_err(|e| TransportError::ConnectionLost(e.to_string()))?
            + "\n";
        self.stream.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Pull whatever the socket has buffered without blocking.
    fn fill(&mut self) -> Result<(), TransportError> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.try_read(&mut chunk) {
                Ok(0) => {
                    return Err(TransportError::ConnectionLost(
                        "peer closed the connection".to_string(),
                    ))
                }
                Ok(n) => self.inbuf.ingest(&chunk[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
    }

    fn parse_frame(&self, line: &str) -> Option<Frame> {
        if line.is_empty() {
            return None;
        }
        let frame: Frame = match serde_json::from_str(line) {
            Ok(f) => f,
            Err(err) => {
                warn!(%err, "dropping unparseable frame");
                return None;
            }
        };
        if !verify_frame(&frame, &self.secret) {
            warn!(kind = %frame.kind, from = %frame.from, "dropping frame with bad signature");
            return None;
        }
        Some(frame)
    }

    fn handle_frame(&mut self, frame: Frame) {
        match frame.kind.as_str() {
            KIND_PRESENCE => match serde_json::from_value::<PresencePayload>(frame.payload) {
                Ok(p) => {
                    let bare = strip_resource(&p.jid).to_string();
                    if p.available {
                        self.available.insert(bare);
                    } else {
                        self.available.remove(&bare);
                    }
                }
                Err(err) => warn!(%err, "malformed presence payload"),
            },
            KIND_MESSAGE => {
                debug!(from = %frame.from, "inbound message");
            }
            other => {
                debug!(kind = other, "ignoring frame");
            }
        }
    }

    /// Next verified frame, waiting up to `wait_for`. A timeout here is a
    /// stalled request/response exchange and is fatal.
    async fn next_frame(&mut self, wait_for: Duration) -> Result<Frame, TransportError> {
        let deadline = Instant::now() + wait_for;
        loop {
            while let Some(line) = self.inbuf.pop_line() {
                if let Some(frame) = self.parse_frame(&line) {
                    return Ok(frame);
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::ConnectionLost(
                    "timed out waiting for server frame".to_string(),
                ));
            }
            let readable = tokio::select! {
                res = self.stream.readable() => {
                    res?;
                    true
                }
                () = sleep(remaining) => false,
            };
            if readable {
                self.fill()?;
            }
        }
    }
}

#[async_trait]
impl ProtocolClient for TcpProtocolClient {
    async fn retrieve_roster(&mut self) -> Result<Roster, TransportError> {
        let server = self.server.clone();
        self.send_frame(KIND_ROSTER_GET, &server, serde_json::json!({}))
            .await?;
        let deadline = Instant::now() + ROSTER_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let frame = self.next_frame(remaining).await?;
            if frame.kind == KIND_ROSTER {
                let payload: RosterPayload = serde_json::from_value(frame.payload)
                    .map_err(|e| TransportError::ConnectionLost(e.to_string()))?;
                return Ok(Roster {
                    to: payload.to.into_iter().collect(),
                    from: payload.from.into_iter().collect(),
                    both: payload.both.into_iter().collect(),
                });
            }
            // Anything else that arrives while we wait is a normal event.
            self.handle_frame(frame);
        }
    }

    async fn subscribe(&mut self, jids: &[String]) -> Result<(), TransportError> {
        let server = self.server.clone();
        self.send_frame(KIND_SUBSCRIBE, &server, serde_json::json!({ "jids": jids }))
            .await
    }

    async fn unsubscribe(&mut self, jids: &[String]) -> Result<(), TransportError> {
        let server = self.server.clone();
        self.send_frame(KIND_UNSUBSCRIBE, &server, serde_json::json!({ "jids": jids }))
            .await
    }

    async fn send_presence(&mut self) -> Result<(), TransportError> {
        let server = self.server.clone();
        let jid = self.jid.clone();
        self.send_frame(
            KIND_PRESENCE,
            &server,
            serde_json::json!({ "jid": jid, "available": true }),
        )
        .await
    }

    async fn send_message(&mut self, jid: &str, kind: MessageKind) -> Result<(), TransportError> {
        self.send_frame(
            KIND_MESSAGE,
            jid,
            serde_json::json!({ "request": kind.as_str() }),
        )
        .await
    }

    fn is_available(&self, jid: &str) -> bool {
        self.available.contains(strip_resource(jid))
    }

    async fn wait(&mut self, timeout: Duration) -> Result<Readiness, TransportError> {
        if self.inbuf.has_line() {
            return Ok(Readiness::Readable);
        }
        tokio::select! {
            res = self.stream.readable() => {
                res?;
                Ok(Readiness::Readable)
            }
            () = sleep(timeout) => Ok(Readiness::Timeout),
        }
    }

    async fn process_inbound(&mut self) -> Result<(), TransportError> {
        self.fill()?;
        while let Some(line) = self.inbuf.pop_line() {
            if let Some(frame) = self.parse_frame(&line) {
                self.handle_frame(frame);
            }
        }
        Ok(())
    }
}
