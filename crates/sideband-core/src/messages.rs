//! Wire message types for the signaling protocol.
//!
//! Every frame is a JSON object: `type`, optional addressing fields
//! (`sessionId`, `from`, `to`), a client `timestamp` in epoch milliseconds,
//! and a `payload`. Relay payloads (`offer`, `answer`, `ice_candidate`) are
//! opaque to the server; server-originated payloads are the typed structs
//! below.

use crate::error::SignalResult;
use crate::ids::SessionId;
use serde::{Deserialize, Serialize};

/// Message types understood by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgType {
    // client → server
    CreateSession,
    JoinSession,
    Offer,
    Answer,
    IceCandidate,
    SessionClose,

    // server → client
    SessionCreated,
    SessionJoined,
    PeerJoined,
    PeerLeft,
    PeerDisconnected,
    Error,
}

impl MsgType {
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "create_session" => Some(Self::CreateSession),
            "join_session" => Some(Self::JoinSession),
            "offer" => Some(Self::Offer),
            "answer" => Some(Self::Answer),
            "ice_candidate" => Some(Self::IceCandidate),
            "session_close" => Some(Self::SessionClose),
            "session_created" => Some(Self::SessionCreated),
            "session_joined" => Some(Self::SessionJoined),
            "peer_joined" => Some(Self::PeerJoined),
            "peer_left" => Some(Self::PeerLeft),
            "peer_disconnected" => Some(Self::PeerDisconnected),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Whether this type is forwarded verbatim between peers.
    pub fn is_relay(self) -> bool {
        matches!(self, Self::Offer | Self::Answer | Self::IceCandidate)
    }
}

/// Wire error codes (the `code` field of an `error` payload).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidTimestamp,
    InvalidMessage,
    InvalidPayload,
    InvalidState,
    UnknownMessageType,
    InvalidToken,
    SessionNotFound,
    SessionFull,
    Unauthorized,
    PeerNotFound,
    RateLimitExceeded,
    MessageTooLarge,
    SlowPeer,
    Internal,
}

impl ErrorCode {
    pub fn as_wire(self) -> &'static str {
        match self {
            Self::InvalidTimestamp => "INVALID_TIMESTAMP",
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::InvalidPayload => "INVALID_PAYLOAD",
            Self::InvalidState => "INVALID_STATE",
            Self::UnknownMessageType => "UNKNOWN_MESSAGE_TYPE",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::SessionFull => "SESSION_FULL",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::PeerNotFound => "PEER_NOT_FOUND",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::MessageTooLarge => "MESSAGE_TOO_LARGE",
            Self::SlowPeer => "SLOW_PEER",
            Self::Internal => "INTERNAL",
        }
    }
}

// ── Client request payloads ─────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionPayload {
    pub client_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSessionPayload {
    pub token: String,
    pub client_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionClosePayload {
    pub reason: Option<String>,
}

/// Shape probe for `offer`/`answer` payloads: a session description as
/// produced by standard peer-connection APIs carries a kind and an SDP
/// string. The payload itself is still relayed verbatim.
#[derive(Debug, Deserialize)]
pub struct DescriptionProbe {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

// ── Server-originated payloads ──────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCreatedPayload {
    pub session_id: String,
    pub token: String,
    pub expires_at: i64,
}

/// Body of both `session_joined` (to the joiner) and `peer_joined`
/// (to the creator).
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfoPayload {
    pub peer_id: String,
    pub peer_display_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerLeftPayload {
    pub peer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDisconnectedPayload {
    pub peer_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// Outer envelope for server-originated frames.
#[derive(Debug, Serialize)]
struct OutboundEnvelope<'a, P: Serialize> {
    #[serde(rename = "type")]
    kind: MsgType,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    from: Option<&'a str>,
    timestamp: i64,
    payload: P,
}

/// Serialize a server-originated frame.
pub fn envelope<P: Serialize>(
    kind: MsgType,
    session_id: Option<&SessionId>,
    from: Option<&str>,
    payload: P,
) -> SignalResult<String> {
    let frame = OutboundEnvelope {
        kind,
        session_id: session_id.map(SessionId::to_string),
        from,
        timestamp: unix_millis(),
        payload,
    };
    Ok(serde_json::to_string(&frame)?)
}

/// Serialize an `error` frame addressed to the originator.
pub fn error_frame(
    code: ErrorCode,
    message: impl Into<String>,
    retry_after: Option<u64>,
) -> SignalResult<String> {
    envelope(
        MsgType::Error,
        None,
        None,
        ErrorPayload {
            code: code.as_wire(),
            message: message.into(),
            retry_after,
        },
    )
}

/// Current wall-clock time in epoch milliseconds.
pub fn unix_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
