//! Netty-era status ping: handshake, status request, JSON response.

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::codec::{self, FrameError};
use super::{clamp_player_count, PingTarget, Rung, RungOutcome, ServerStatus};

/// Handshake "next state" value requesting the status protocol.
const NEXT_STATE_STATUS: i32 = 1;

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    version: Option<VersionInfo>,
    #[serde(default)]
    players: Option<PlayersInfo>,
    #[serde(default)]
    description: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    protocol: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct PlayersInfo {
    online: i64,
    #[serde(default)]
    max: i64,
}

/// Build the framed handshake packet.
pub fn handshake_packet(target: &PingTarget) -> Vec<u8> {
    let mut packet = Vec::with_capacity(16 + target.host.len());
    codec::write_varint(&mut packet, 0x00);
    codec::write_varint(&mut packet, target.protocol_id);
    codec::write_string(&mut packet, &target.host);
    packet.extend_from_slice(&target.port.to_be_bytes());
    codec::write_varint(&mut packet, NEXT_STATE_STATUS);
    codec::frame(&packet)
}

/// Build the framed (empty) status request.
pub fn status_request_packet() -> Vec<u8> {
    codec::frame(&[0x00])
}

/// Run the modern rung. Any failure short of a clean JSON document yields
/// to the legacy ladder, since older servers often answer with garbage.
pub async fn ping<S>(stream: &mut S, target: &PingTarget) -> RungOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = handshake_packet(target);
    request.extend_from_slice(&status_request_packet());

    if let Err(e) = stream.write_all(&request).await {
        tracing::debug!("{}: handshake write failed: {}", target.host, e);
        return RungOutcome::NextRung;
    }

    let json = match read_status_json(stream).await {
        Ok(json) => json,
        Err(e) => {
            tracing::debug!("{}: no modern status frame: {}", target.host, e);
            return RungOutcome::NextRung;
        }
    };

    parse_status(&target.host, &json)
}

async fn read_status_json<S: AsyncRead + Unpin>(stream: &mut S) -> Result<String, FrameError> {
    let body = codec::read_frame(stream).await?;
    let (packet_id, rest) = codec::read_varint_prefix(&body)?;
    if packet_id != 0x00 {
        return Err(FrameError::UnexpectedPacket(packet_id));
    }
    let (json, _) = codec::read_string_prefix(rest)?;
    Ok(json)
}

/// Interpret a status JSON document.
pub fn parse_status(host: &str, json: &str) -> RungOutcome {
    let response: StatusResponse = match serde_json::from_str(json) {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!("{}: unparseable status json: {}", host, e);
            return RungOutcome::NextRung;
        }
    };

    let Some(players) = response.players else {
        return RungOutcome::Offline;
    };

    let (version_name, protocol_id) = match response.version {
        Some(v) => (v.name, v.protocol.and_then(|p| i32::try_from(p).ok())),
        None => (None, None),
    };

    RungOutcome::Parsed(ServerStatus {
        player_count: clamp_player_count(host, players.online),
        max_players: clamp_player_count(host, players.max),
        version_name,
        protocol_id,
        motd: response
            .description
            .as_ref()
            .map(|d| strip_formatting(&flatten_description(d)))
            .unwrap_or_default(),
        generation: Rung::Modern,
    })
}

/// Flatten a chat component (string, object with `text`/`extra`, or array).
fn flatten_description(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts.iter().map(flatten_description).collect(),
        Value::Object(map) => {
            let mut out = map.get("text").map(flatten_description).unwrap_or_default();
            if let Some(extra) = map.get("extra") {
                out.push_str(&flatten_description(extra));
            }
            out
        }
        _ => String::new(),
    }
}

/// Remove `§x` formatting codes from a MOTD.
pub fn strip_formatting(text: &str) -> String {
    static CODES: OnceLock<Regex> = OnceLock::new();
    let re = CODES.get_or_init(|| Regex::new(r"§[0-9a-fk-orA-FK-OR]?").expect("static regex"));
    re.replace_all(text, "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_layout() {
        let target = PingTarget {
            host: "mc".to_string(),
            port: 25565,
            protocol_id: 47,
        };
        let packet = handshake_packet(&target);
        // len, id, protocol, host len, "mc", port, next state
        assert_eq!(packet, vec![0x08, 0x00, 0x2f, 0x02, b'm', b'c', 0x63, 0xdd, 0x01]);
        assert_eq!(status_request_packet(), vec![0x01, 0x00]);
    }

    #[test]
    fn test_parse_status_plain_description() {
        let json = r#"{"version":{"name":"Paper 1.21","protocol":767},"players":{"online":3,"max":20},"description":"§6Hello §rthere"}"#;
        match parse_status("h", json) {
            RungOutcome::Parsed(status) => {
                assert_eq!(status.player_count, 3);
                assert_eq!(status.max_players, 20);
                assert_eq!(status.motd, "Hello there");
                assert_eq!(status.protocol_id, Some(767));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_parse_status_clamps_negative_counts() {
        let json = r#"{"players":{"online":-4,"max":-1}}"#;
        match parse_status("h", json) {
            RungOutcome::Parsed(status) => {
                assert_eq!(status.player_count, 0);
                assert_eq!(status.max_players, 0);
                assert_eq!(status.version_name, None);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_parse_status_garbage_yields_next_rung() {
        assert!(matches!(parse_status("h", "\u{a7}1 not json"), RungOutcome::NextRung));
        assert!(matches!(parse_status("h", r#"{"players":{"online":"many"}}"#), RungOutcome::NextRung));
    }

    #[test]
    fn test_flatten_nested_components() {
        let value: Value = serde_json::from_str(r#"[{"text":"a","extra":["b",{"text":"c"}]},"d"]"#).unwrap();
        assert_eq!(flatten_description(&value), "abcd");
    }
}
