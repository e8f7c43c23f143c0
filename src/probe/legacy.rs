//! Pre-netty server list pings (beta 1.8 through 1.6).
//!
//! All three generations answer with a kick packet (`0xFF`, u16 length in
//! UTF-16 code units, UTF-16BE text). They differ in the request bytes and
//! in how the text is laid out.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::codec::{self, FrameError};
use super::modern::strip_formatting;
use super::{PingTarget, ProbeError, Rung, RungOutcome, ServerStatus};

const PING_OPCODE: u8 = 0xfe;
const KICK_OPCODE: u8 = 0xff;
const PLUGIN_MESSAGE_OPCODE: u8 = 0xfa;
const PING_HOST_CHANNEL: &str = "MC|PingHost";

/// Protocol number 1.6 clients send inside `MC|PingHost`.
const LEGACY_EXTENDED_PROTOCOL: u8 = 74;

/// Prefix of the 1.4+ response layout.
const MODERN_KICK_PREFIX: &str = "§1\u{0}";

/// Request bytes for a legacy rung.
pub fn request(rung: Rung, target: &PingTarget) -> Vec<u8> {
    match rung {
        Rung::LegacyExtended => {
            let channel = codec::encode_utf16be(PING_HOST_CHANNEL);
            let host = codec::encode_utf16be(&target.host);
            let host_units = (host.len() / 2) as u16;

            let mut out = vec![PING_OPCODE, 0x01, PLUGIN_MESSAGE_OPCODE];
            out.extend_from_slice(&((channel.len() / 2) as u16).to_be_bytes());
            out.extend_from_slice(&channel);
            out.extend_from_slice(&((7 + host.len()) as u16).to_be_bytes());
            out.push(LEGACY_EXTENDED_PROTOCOL);
            out.extend_from_slice(&host_units.to_be_bytes());
            out.extend_from_slice(&host);
            out.extend_from_slice(&(target.port as i32).to_be_bytes());
            out
        }
        Rung::Legacy => vec![PING_OPCODE, 0x01],
        Rung::Beta | Rung::Modern => vec![PING_OPCODE],
    }
}

/// Run one legacy rung over a fresh stream.
pub async fn ping<S>(stream: &mut S, rung: Rung, target: &PingTarget) -> RungOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = stream.write_all(&request(rung, target)).await {
        tracing::debug!("{}: {:?} request write failed: {}", target.host, rung, e);
        return RungOutcome::NextRung;
    }

    match read_kick(stream).await {
        Ok(text) => parse_kick(&text, rung),
        Err(e) => {
            tracing::debug!("{}: no {:?} kick packet: {}", target.host, rung, e);
            RungOutcome::NextRung
        }
    }
}

async fn read_kick<S: AsyncRead + Unpin>(stream: &mut S) -> Result<String, FrameError> {
    let opcode = stream.read_u8().await?;
    if opcode != KICK_OPCODE {
        return Err(FrameError::UnexpectedPacket(opcode as i32));
    }
    let units = stream.read_u16().await? as usize;
    if units == 0 {
        return Err(FrameError::Length(0));
    }
    let mut bytes = vec![0u8; units * 2];
    stream.read_exact(&mut bytes).await?;
    codec::decode_utf16be(&bytes)
}

/// Split kick text into a status.
///
/// Structurally unrecognizable text moves on to the next rung; recognizable
/// text with bad counts is a malformed response and ends the ladder.
pub fn parse_kick(text: &str, rung: Rung) -> RungOutcome {
    if let Some(body) = text.strip_prefix(MODERN_KICK_PREFIX) {
        let fields: Vec<&str> = body.split('\u{0}').collect();
        if fields.len() != 5 {
            return RungOutcome::NextRung;
        }
        let (online, max) = match (parse_count(fields[3]), parse_count(fields[4])) {
            (Ok(online), Ok(max)) => (online, max),
            (Err(e), _) | (_, Err(e)) => return RungOutcome::Fatal(e),
        };
        return RungOutcome::Parsed(ServerStatus {
            player_count: online,
            max_players: max,
            version_name: Some(fields[1].to_string()),
            protocol_id: fields[0].parse().ok(),
            motd: strip_formatting(fields[2]),
            generation: rung,
        });
    }

    // Beta layout: motd§online§max; the motd may itself contain '§'.
    let mut parts = text.rsplitn(3, '§');
    let (Some(max), Some(online), Some(motd)) = (parts.next(), parts.next(), parts.next()) else {
        return RungOutcome::NextRung;
    };
    match (parse_count(online), parse_count(max)) {
        (Ok(online), Ok(max)) => RungOutcome::Parsed(ServerStatus {
            player_count: online,
            max_players: max,
            version_name: None,
            protocol_id: None,
            motd: strip_formatting(motd),
            generation: rung,
        }),
        (Err(e), _) | (_, Err(e)) => RungOutcome::Fatal(e),
    }
}

/// Legacy counts must be plain non-negative integers; nothing is coerced.
fn parse_count(field: &str) -> Result<u32, ProbeError> {
    let value: i64 = field
        .trim()
        .parse()
        .map_err(|_| ProbeError::MalformedResponse(format!("non-numeric player field {:?}", field)))?;
    if value < 0 {
        return Err(ProbeError::MalformedResponse(format!("negative player field {}", value)));
    }
    u32::try_from(value).map_err(|_| ProbeError::MalformedResponse(format!("player field {} out of range", value)))
}
