//! Frame decoding and boundary validation.
//!
//! The codec turns one inbound text frame into a [`ClientRequest`] or a
//! [`DecodeError`] carrying the wire error code. Validation stops at the
//! envelope: relay payloads are checked for shape where the protocol
//! demands it (`offer`/`answer` must look like a session description) but
//! are never interpreted, and the caller forwards the original frame text
//! verbatim.

use crate::messages::{
    CreateSessionPayload, DescriptionProbe, ErrorCode, JoinSessionPayload, MsgType,
    SessionClosePayload,
};
use serde::Deserialize;
use serde_json::value::RawValue;

/// Upper bound on `clientId` length.
const MAX_CLIENT_ID: usize = 128;
/// Upper bound on `displayName` length.
const MAX_DISPLAY_NAME: usize = 64;
/// Upper bound on a `session_close` reason.
const MAX_REASON: usize = 200;

/// Envelope validation knobs.
#[derive(Debug, Clone)]
pub struct CodecConfig {
    pub max_frame_bytes: usize,
    pub timestamp_skew_ms: i64,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 1_048_576,
            timestamp_skew_ms: 300_000,
        }
    }
}

/// A rejected frame: wire code, detail for the `error` reply, and whether
/// the connection must close (unparsable or oversized frames only).
#[derive(Debug)]
pub struct DecodeError {
    pub code: ErrorCode,
    pub message: String,
    pub fatal: bool,
}

impl DecodeError {
    fn reject(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            fatal: false,
        }
    }

    fn fatal(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            fatal: true,
        }
    }
}

/// A validated client frame.
#[derive(Debug)]
pub enum ClientRequest {
    Create(CreateSessionPayload),
    Join {
        session_id: String,
        payload: JoinSessionPayload,
    },
    /// `offer`, `answer`, or `ice_candidate`; the payload stays in the
    /// original frame text.
    Relay {
        kind: MsgType,
        session_id: String,
        from: String,
        to: String,
    },
    Close(SessionClosePayload),
}

/// Decoded view of one inbound frame.
#[derive(Debug)]
pub struct Decoded {
    pub timestamp: i64,
    pub request: ClientRequest,
}

/// Loose envelope: unknown fields are ignored, everything optional so the
/// per-type checks below can produce precise error codes.
#[derive(Deserialize)]
struct RawEnvelope<'a> {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    from: Option<String>,
    to: Option<String>,
    timestamp: Option<i64>,
    #[serde(borrow)]
    payload: Option<&'a RawValue>,
}

/// Validate one text frame against the envelope rules.
pub fn decode(text: &str, cfg: &CodecConfig, now_ms: i64) -> Result<Decoded, DecodeError> {
    if text.len() > cfg.max_frame_bytes {
        return Err(DecodeError::fatal(
            ErrorCode::MessageTooLarge,
            format!("frame of {} bytes exceeds limit", text.len()),
        ));
    }

    let raw: RawEnvelope = serde_json::from_str(text)
        .map_err(|e| DecodeError::fatal(ErrorCode::InvalidMessage, format!("unparsable frame: {e}")))?;

    let kind = match raw.kind.as_deref() {
        None => return Err(DecodeError::reject(ErrorCode::InvalidMessage, "missing type")),
        Some(name) => MsgType::from_wire(name).ok_or_else(|| {
            DecodeError::reject(ErrorCode::UnknownMessageType, format!("unknown type: {name}"))
        })?,
    };

    let timestamp = raw
        .timestamp
        .ok_or_else(|| DecodeError::reject(ErrorCode::InvalidMessage, "missing timestamp"))?;
    if (now_ms - timestamp).abs() > cfg.timestamp_skew_ms {
        return Err(DecodeError::reject(
            ErrorCode::InvalidTimestamp,
            "timestamp outside accepted window",
        ));
    }

    let payload = raw
        .payload
        .ok_or_else(|| DecodeError::reject(ErrorCode::InvalidMessage, "missing payload"))?;

    let request = match kind {
        MsgType::CreateSession => {
            let p: CreateSessionPayload = parse_payload(payload)?;
            check_identity(&p.client_id, &p.display_name)?;
            ClientRequest::Create(p)
        }
        MsgType::JoinSession => {
            let session_id = require_session_id(raw.session_id)?;
            let p: JoinSessionPayload = parse_payload(payload)?;
            check_identity(&p.client_id, &p.display_name)?;
            ClientRequest::Join {
                session_id,
                payload: p,
            }
        }
        MsgType::Offer | MsgType::Answer | MsgType::IceCandidate => {
            let session_id = require_session_id(raw.session_id)?;
            let from = raw
                .from
                .filter(|s| !s.is_empty())
                .ok_or_else(|| DecodeError::reject(ErrorCode::InvalidMessage, "missing from"))?;
            let to = raw
                .to
                .filter(|s| !s.is_empty())
                .ok_or_else(|| DecodeError::reject(ErrorCode::InvalidMessage, "missing to"))?;
            if matches!(kind, MsgType::Offer | MsgType::Answer) {
                let probe: DescriptionProbe = parse_payload(payload)?;
                if probe.kind.is_empty() || probe.sdp.is_empty() {
                    return Err(DecodeError::reject(
                        ErrorCode::InvalidPayload,
                        "session description requires a kind and an sdp string",
                    ));
                }
            }
            ClientRequest::Relay {
                kind,
                session_id,
                from,
                to,
            }
        }
        MsgType::SessionClose => {
            let p: SessionClosePayload = parse_payload(payload)?;
            if p.reason.as_deref().is_some_and(|r| r.len() > MAX_REASON) {
                return Err(DecodeError::reject(ErrorCode::InvalidPayload, "reason too long"));
            }
            ClientRequest::Close(p)
        }
        // Server-originated types are not valid inbound.
        _ => {
            return Err(DecodeError::reject(
                ErrorCode::InvalidMessage,
                "not a client message type",
            ))
        }
    };

    Ok(Decoded { timestamp, request })
}

fn parse_payload<'de, T: Deserialize<'de>>(raw: &'de RawValue) -> Result<T, DecodeError> {
    serde_json::from_str(raw.get())
        .map_err(|e| DecodeError::reject(ErrorCode::InvalidPayload, format!("bad payload: {e}")))
}

fn require_session_id(field: Option<String>) -> Result<String, DecodeError> {
    field
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DecodeError::reject(ErrorCode::InvalidMessage, "missing sessionId"))
}

fn check_identity(client_id: &str, display_name: &str) -> Result<(), DecodeError> {
    if client_id.is_empty() || client_id.len() > MAX_CLIENT_ID {
        return Err(DecodeError::reject(ErrorCode::InvalidPayload, "bad clientId"));
    }
    if display_name.len() > MAX_DISPLAY_NAME {
        return Err(DecodeError::reject(ErrorCode::InvalidPayload, "displayName too long"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    fn cfg() -> CodecConfig {
        CodecConfig::default()
    }

    #[test]
    fn accepts_create_session() {
        let text = format!(
            r#"{{"type":"create_session","timestamp":{NOW},"payload":{{"clientId":"A","displayName":"Alice"}}}}"#
        );
        let decoded = decode(&text, &cfg(), NOW).unwrap();
        match decoded.request {
            ClientRequest::Create(p) => {
                assert_eq!(p.client_id, "A");
                assert_eq!(p.display_name, "Alice");
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn ignores_unknown_envelope_fields() {
        let text = format!(
            r#"{{"type":"create_session","timestamp":{NOW},"hmac":"ff","payload":{{"clientId":"A","displayName":""}}}}"#
        );
        assert!(decode(&text, &cfg(), NOW).is_ok());
    }

    #[test]
    fn oversized_frame_is_fatal() {
        let cfg = CodecConfig {
            max_frame_bytes: 64,
            ..CodecConfig::default()
        };
        let text = format!(
            r#"{{"type":"create_session","timestamp":{NOW},"payload":{{"clientId":"{}","displayName":"x"}}}}"#,
            "a".repeat(80)
        );
        let err = decode(&text, &cfg, NOW).unwrap_err();
        assert_eq!(err.code, ErrorCode::MessageTooLarge);
        assert!(err.fatal);
    }

    #[test]
    fn unparsable_frame_is_fatal() {
        let err = decode("{not json", &cfg(), NOW).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidMessage);
        assert!(err.fatal);
    }

    #[test]
    fn unknown_type_keeps_connection() {
        let text = format!(r#"{{"type":"teleport","timestamp":{NOW},"payload":{{}}}}"#);
        let err = decode(&text, &cfg(), NOW).unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownMessageType);
        assert!(!err.fatal);
    }

    #[test]
    fn stale_timestamp_rejected() {
        // 10 minutes in the past, against a 5 minute window
        let text = format!(
            r#"{{"type":"create_session","timestamp":{},"payload":{{"clientId":"A","displayName":"Alice"}}}}"#,
            NOW - 600_000
        );
        let err = decode(&text, &cfg(), NOW).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidTimestamp);
        assert!(!err.fatal);
    }

    #[test]
    fn future_timestamp_rejected() {
        let text = format!(
            r#"{{"type":"create_session","timestamp":{},"payload":{{"clientId":"A","displayName":"Alice"}}}}"#,
            NOW + 600_000
        );
        assert_eq!(
            decode(&text, &cfg(), NOW).unwrap_err().code,
            ErrorCode::InvalidTimestamp
        );
    }

    #[test]
    fn missing_timestamp_rejected() {
        let text = r#"{"type":"create_session","payload":{"clientId":"A","displayName":"Alice"}}"#;
        assert_eq!(
            decode(text, &cfg(), NOW).unwrap_err().code,
            ErrorCode::InvalidMessage
        );
    }

    #[test]
    fn join_requires_session_id() {
        let text = format!(
            r#"{{"type":"join_session","timestamp":{NOW},"payload":{{"token":"t","clientId":"B","displayName":"Bob"}}}}"#
        );
        assert_eq!(
            decode(&text, &cfg(), NOW).unwrap_err().code,
            ErrorCode::InvalidMessage
        );
    }

    #[test]
    fn relay_requires_addressing() {
        let text = format!(
            r#"{{"type":"ice_candidate","sessionId":"s","timestamp":{NOW},"from":"A","payload":{{}}}}"#
        );
        assert_eq!(
            decode(&text, &cfg(), NOW).unwrap_err().code,
            ErrorCode::InvalidMessage
        );
    }

    #[test]
    fn offer_payload_must_look_like_a_description() {
        let text = format!(
            r#"{{"type":"offer","sessionId":"s","from":"A","to":"B","timestamp":{NOW},"payload":{{"sdp":"v=0"}}}}"#
        );
        assert_eq!(
            decode(&text, &cfg(), NOW).unwrap_err().code,
            ErrorCode::InvalidPayload
        );

        let ok = format!(
            r#"{{"type":"offer","sessionId":"s","from":"A","to":"B","timestamp":{NOW},"payload":{{"type":"offer","sdp":"v=0..."}}}}"#
        );
        assert!(decode(&ok, &cfg(), NOW).is_ok());
    }

    #[test]
    fn ice_candidate_payload_stays_opaque() {
        let text = format!(
            r#"{{"type":"ice_candidate","sessionId":"s","from":"A","to":"B","timestamp":{NOW},"payload":{{"whatever":[1,2,3]}}}}"#
        );
        let decoded = decode(&text, &cfg(), NOW).unwrap();
        match decoded.request {
            ClientRequest::Relay { kind, .. } => assert_eq!(kind, MsgType::IceCandidate),
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn empty_client_id_rejected() {
        let text = format!(
            r#"{{"type":"create_session","timestamp":{NOW},"payload":{{"clientId":"","displayName":"Alice"}}}}"#
        );
        assert_eq!(
            decode(&text, &cfg(), NOW).unwrap_err().code,
            ErrorCode::InvalidPayload
        );
    }

    #[test]
    fn server_types_are_not_client_messages() {
        let text = format!(r#"{{"type":"session_created","timestamp":{NOW},"payload":{{}}}}"#);
        let err = decode(&text, &cfg(), NOW).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidMessage);
        assert!(!err.fatal);
    }
}
