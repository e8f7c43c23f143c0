//! Protocol prober for Minecraft server list pings.
//!
//! A probe walks a fixed ladder of protocol generations, newest first, and
//! stops at the first rung that produces a usable status.

mod codec;
mod legacy;
mod modern;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpStream;

use crate::config::RosterEntry;

/// Protocol id announced in the modern handshake when a host carries no hints.
pub const DEFAULT_PROTOCOL_ID: i32 = 767;

/// Counts above this are treated as bogus and capped.
pub const MAX_PLAYER_COUNT: u32 = 250_000;

/// Probe error types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    ConnectionRefused(String),
    #[error("name resolution failed: {0}")]
    Dns(String),
    #[error("no ping format produced a usable response")]
    ProtocolMismatch,
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

/// Coarse error classification exposed to viewers and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeErrorKind {
    Connection,
    Timeout,
    ProtocolMismatch,
    MalformedResponse,
}

impl ProbeError {
    pub fn kind(&self) -> ProbeErrorKind {
        match self {
            ProbeError::Timeout(_) => ProbeErrorKind::Timeout,
            ProbeError::ConnectionRefused(_) | ProbeError::Dns(_) => ProbeErrorKind::Connection,
            ProbeError::ProtocolMismatch => ProbeErrorKind::ProtocolMismatch,
            ProbeError::MalformedResponse(_) => ProbeErrorKind::MalformedResponse,
        }
    }
}

/// Protocol generations, in the order they are attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rung {
    /// Netty-era handshake + status request (1.7 and later).
    Modern,
    /// `FE 01 FA` with the `MC|PingHost` plugin message (1.6).
    LegacyExtended,
    /// `FE 01` (1.4 - 1.5).
    Legacy,
    /// Bare `FE` (beta 1.8 - 1.3).
    Beta,
}

impl Rung {
    pub const LADDER: [Rung; 4] = [Rung::Modern, Rung::LegacyExtended, Rung::Legacy, Rung::Beta];
}

/// Normalized status of a responding server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerStatus {
    pub player_count: u32,
    pub max_players: u32,
    /// Absent for beta-era servers, which never report a version.
    pub version_name: Option<String>,
    pub protocol_id: Option<i32>,
    pub motd: String,
    pub generation: Rung,
}

/// What a single rung produced.
#[derive(Debug)]
pub enum RungOutcome {
    Parsed(ServerStatus),
    /// The server answered but reported no population.
    Offline,
    NextRung,
    Fatal(ProbeError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Online(ServerStatus),
    Offline,
    Error(ProbeError),
}

/// Result of one probe attempt.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub outcome: ProbeOutcome,
    /// Protocol id announced in the modern handshake.
    pub protocol_id: i32,
    pub elapsed: Duration,
}

impl ProbeResult {
    pub fn failed(error: ProbeError, protocol_id: i32, elapsed: Duration) -> Self {
        Self {
            outcome: ProbeOutcome::Error(error),
            protocol_id,
            elapsed,
        }
    }

    /// Player count for the sample; `None` is a gap.
    pub fn player_count(&self) -> Option<u32> {
        match &self.outcome {
            ProbeOutcome::Online(status) => Some(status.player_count),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<&ServerStatus> {
        match &self.outcome {
            ProbeOutcome::Online(status) => Some(status),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ProbeError> {
        match &self.outcome {
            ProbeOutcome::Error(e) => Some(e),
            _ => None,
        }
    }
}

/// Host/port pair plus the protocol id used for the modern handshake.
#[derive(Debug, Clone)]
pub struct PingTarget {
    pub host: String,
    pub port: u16,
    pub protocol_id: i32,
}

impl PingTarget {
    pub fn new(host: &str, port: u16, protocol_hints: &[i32]) -> Self {
        Self {
            host: host.to_string(),
            port,
            protocol_id: protocol_hints.iter().copied().max().unwrap_or(DEFAULT_PROTOCOL_ID),
        }
    }
}

/// Seam between the scheduler and the wire, so ticks can be driven by fakes.
pub trait Prober: Send + Sync + 'static {
    fn probe(
        &self,
        entry: RosterEntry,
        timeout: Duration,
    ) -> impl std::future::Future<Output = ProbeResult> + Send;
}

/// The real prober: speaks the protocol over TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct WireProber;

impl Prober for WireProber {
    async fn probe(&self, entry: RosterEntry, timeout: Duration) -> ProbeResult {
        probe(&entry.address, entry.port, &entry.protocol_hints, timeout).await
    }
}

/// Run one probe against `address:port`.
///
/// Never returns past `timeout` and never fails: every error is folded into
/// [`ProbeOutcome::Error`]. All sockets are closed before this returns.
pub async fn probe(address: &str, port: u16, protocol_hints: &[i32], timeout: Duration) -> ProbeResult {
    let target = PingTarget::new(address, port, protocol_hints);
    let start = Instant::now();

    let outcome = match tokio::time::timeout(timeout, run_ladder(&target)).await {
        Ok(Ok(Some(status))) => ProbeOutcome::Online(status),
        Ok(Ok(None)) => ProbeOutcome::Offline,
        Ok(Err(e)) => ProbeOutcome::Error(e),
        Err(_) => ProbeOutcome::Error(ProbeError::Timeout(timeout)),
    };

    ProbeResult {
        outcome,
        protocol_id: target.protocol_id,
        elapsed: start.elapsed(),
    }
}

async fn run_ladder(target: &PingTarget) -> Result<Option<ServerStatus>, ProbeError> {
    let addrs = resolve(target).await?;

    for (attempt, rung) in Rung::LADDER.into_iter().enumerate() {
        // Pre-netty servers hang up after one reply, so every rung dials anew.
        let mut stream = match connect(&addrs).await {
            Ok(stream) => stream,
            Err(e) if attempt == 0 => return Err(e),
            Err(e) => {
                tracing::debug!("{}:{} refused {:?} rung: {}", target.host, target.port, rung, e);
                return Err(ProbeError::ProtocolMismatch);
            }
        };

        let outcome = match rung {
            Rung::Modern => modern::ping(&mut stream, target).await,
            legacy_rung => legacy::ping(&mut stream, legacy_rung, target).await,
        };
        drop(stream);

        match outcome {
            RungOutcome::Parsed(status) => return Ok(Some(status)),
            RungOutcome::Offline => return Ok(None),
            RungOutcome::Fatal(e) => return Err(e),
            RungOutcome::NextRung => {
                tracing::debug!("{}:{} gave no usable {:?} response", target.host, target.port, rung);
            }
        }
    }

    Err(ProbeError::ProtocolMismatch)
}

/// Resolve the target once per probe.
async fn resolve(target: &PingTarget) -> Result<Vec<SocketAddr>, ProbeError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((target.host.as_str(), target.port))
        .await
        .map_err(|e| ProbeError::Dns(e.to_string()))?
        .collect();

    if addrs.is_empty() {
        return Err(ProbeError::Dns(format!("no addresses found for {}", target.host)));
    }
    Ok(addrs)
}

async fn connect(addrs: &[SocketAddr]) -> Result<TcpStream, ProbeError> {
    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(ProbeError::ConnectionRefused(
        last_error.map(|e| e.to_string()).unwrap_or_else(|| "no address to dial".to_string()),
    ))
}

/// Clamp a reported count into `0..=MAX_PLAYER_COUNT`.
pub(crate) fn clamp_player_count(host: &str, value: i64) -> u32 {
    if value < 0 {
        tracing::warn!("{} reported a negative player count ({}), using 0", host, value);
        0
    } else if value > MAX_PLAYER_COUNT as i64 {
        tracing::warn!("{} reported {} players, capping at {}", host, value, MAX_PLAYER_COUNT);
        MAX_PLAYER_COUNT
    } else {
        value as u32
    }
}
