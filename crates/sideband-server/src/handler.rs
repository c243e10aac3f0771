//! Per-connection protocol handler.
//!
//! Each accepted WebSocket gets one handler task that owns the read side,
//! plus a writer task draining a bounded outbound queue. Replies to the
//! connection's own requests and relays pushed by its peer go through the
//! same queue, so sends to one transport are always serialized.

use crate::registry::{
    close_code, ConnHandle, CreateError, JoinError, MemberInfo, Outbound, RemoveOutcome,
};
use crate::server::{ServerState, SlotGuard};
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use sideband_core::codec::{self, ClientRequest, CodecConfig};
use sideband_core::ids::SessionId;
use sideband_core::messages::{
    self, CreateSessionPayload, ErrorCode, JoinSessionPayload, MsgType, PeerDisconnectedPayload,
    PeerInfoPayload, PeerLeftPayload, SessionClosePayload, SessionCreatedPayload,
};
use sideband_core::unix_millis;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::{debug, warn};

/// Outbound queue depth per connection; a peer further behind than this is
/// subject to the slow-peer stall deadline.
const MAX_INFLIGHT_FRAMES: usize = 64;

/// The session membership a connection currently holds.
struct Binding {
    session_id: SessionId,
    client_id: String,
}

enum Flow {
    Continue,
    Close,
}

/// Unbinds the connection on every exit path, panics included. Registry
/// cleanup runs before the socket drops, and the remaining peer gets its
/// departure notice before the broker ever closes that peer's connection.
struct ConnGuard {
    conn_id: u64,
    state: Arc<ServerState>,
    _slot: SlotGuard,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        if let RemoveOutcome::Removed {
            session_id,
            client_id,
            peer: Some(peer),
        } = self.state.registry.remove_conn(self.conn_id)
        {
            if let Ok(frame) = messages::envelope(
                MsgType::PeerDisconnected,
                Some(&session_id),
                Some(&client_id),
                PeerDisconnectedPayload {
                    peer_id: client_id.clone(),
                },
            ) {
                let _ = peer.conn.tx.try_send(Outbound::Frame(frame));
            }
        }
    }
}

struct Connection {
    state: Arc<ServerState>,
    conn_id: u64,
    remote_ip: IpAddr,
    handle: ConnHandle,
    binding: Option<Binding>,
}

/// Drive one WebSocket connection to completion.
pub async fn run(socket: WebSocket, state: Arc<ServerState>, remote: SocketAddr, slot: SlotGuard) {
    let conn_id = state.next_conn_id.fetch_add(1, Ordering::Relaxed);
    debug!(conn_id, remote = %remote, "connection open");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(MAX_INFLIGHT_FRAMES);

    // Writer task: sole owner of the sink.
    let writer = tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            match item {
                Outbound::Frame(text) => {
                    if ws_tx.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Ping => {
                    if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    let guard = ConnGuard {
        conn_id,
        state: state.clone(),
        _slot: slot,
    };
    let mut conn = Connection {
        state: state.clone(),
        conn_id,
        remote_ip: remote.ip(),
        handle: ConnHandle {
            id: conn_id,
            tx: tx.clone(),
        },
        binding: None,
    };

    let mut shutdown_rx = state.shutdown_tx.subscribe();
    let liveness = Duration::from_millis(state.config.liveness_timeout_ms);
    let mut heartbeat = tokio::time::interval(liveness / 2);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_recv = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                let _ = tx.try_send(Outbound::Close {
                    code: close_code::GOING_AWAY,
                    reason: "server shutdown".into(),
                });
                break;
            }
            _ = heartbeat.tick() => {
                if last_recv.elapsed() >= liveness {
                    debug!(conn_id, "liveness timeout");
                    break;
                }
                let _ = tx.try_send(Outbound::Ping);
            }
            msg = ws_rx.next() => {
                match msg {
                    None => break,
                    Some(Err(e)) => {
                        debug!(conn_id, error = %e, "transport error");
                        break;
                    }
                    Some(Ok(message)) => {
                        last_recv = Instant::now();
                        match message {
                            Message::Text(text) => {
                                if matches!(conn.handle_frame(&text).await, Flow::Close) {
                                    break;
                                }
                            }
                            // The binary file channel is not multiplexed
                            // through signaling; tolerated and ignored.
                            Message::Binary(_) => {}
                            Message::Ping(_) | Message::Pong(_) => {}
                            Message::Close(_) => break,
                        }
                    }
                }
            }
        }
    }

    // Unbind (and notify the peer) before the writer shuts the socket.
    drop(guard);
    // Release every sender so the writer drains its queue and exits.
    drop(conn);
    drop(tx);
    let _ = writer.await;
    debug!(conn_id, "connection closed");
}

impl Connection {
    async fn handle_frame(&mut self, text: &str) -> Flow {
        let rate_limit_result = self.state.limits().check_message(self.remote_ip);
        if let Err(retry) = rate_limit_result {
            return self
                .reject(
                    ErrorCode::RateLimitExceeded,
                    "message rate exceeded",
                    Some(retry.as_secs().max(1)),
                )
                .await;
        }

        let cfg = CodecConfig {
            max_frame_bytes: self.state.config.max_frame_bytes,
            timestamp_skew_ms: self.state.config.timestamp_skew_ms as i64,
        };
        let decoded = match codec::decode(text, &cfg, unix_millis()) {
            Ok(decoded) => decoded,
            Err(e) => {
                let flow = self.reject(e.code, &e.message, None).await;
                if e.fatal {
                    self.close(fatal_close_code(e.code), e.code.as_wire()).await;
                    return Flow::Close;
                }
                return flow;
            }
        };

        match decoded.request {
            ClientRequest::Create(p) => self.on_create(p).await,
            ClientRequest::Join { session_id, payload } => self.on_join(&session_id, payload).await,
            ClientRequest::Relay {
                session_id,
                from,
                to,
                ..
            } => self.on_relay(text, &session_id, &from, &to).await,
            ClientRequest::Close(p) => self.on_close(p).await,
        }
    }

    async fn on_create(&mut self, p: CreateSessionPayload) -> Flow {
        if self.binding.is_some() {
            return self
                .reject(ErrorCode::InvalidState, "already in a session", None)
                .await;
        }
        let rate_limit_result = self.state.limits().check_create(self.remote_ip);
        if let Err(retry) = rate_limit_result {
            return self
                .reject(
                    ErrorCode::RateLimitExceeded,
                    "session creation rate exceeded",
                    Some(retry.as_secs().max(1)),
                )
                .await;
        }

        let created = match self.state.registry.create(
            p.client_id.clone(),
            p.display_name,
            self.handle.clone(),
            unix_millis(),
        ) {
            Ok(created) => created,
            Err(CreateError::Capacity) => {
                return self
                    .reject(ErrorCode::RateLimitExceeded, "session capacity reached", Some(60))
                    .await;
            }
            Err(CreateError::Internal) => return self.fail_internal().await,
        };

        self.state.stats.sessions_created.fetch_add(1, Ordering::Relaxed);
        self.binding = Some(Binding {
            session_id: created.session_id,
            client_id: p.client_id,
        });

        // The only frame that ever carries the token, addressed to the
        // creator alone.
        let frame = messages::envelope(
            MsgType::SessionCreated,
            Some(&created.session_id),
            None,
            SessionCreatedPayload {
                session_id: created.session_id.to_string(),
                token: created.token.to_hex(),
                expires_at: created.expires_at_ms,
            },
        );
        match frame {
            Ok(frame) => {
                self.send(frame).await;
                Flow::Continue
            }
            Err(_) => self.fail_internal().await,
        }
    }

    async fn on_join(&mut self, session_id: &str, p: JoinSessionPayload) -> Flow {
        if self.binding.is_some() {
            return self
                .reject(ErrorCode::InvalidState, "already in a session", None)
                .await;
        }
        let rate_limit_result = self.state.limits().check_join(self.remote_ip);
        if let Err(retry) = rate_limit_result {
            return self
                .reject(
                    ErrorCode::RateLimitExceeded,
                    "join rate exceeded",
                    Some(retry.as_secs().max(1)),
                )
                .await;
        }
        let Some(session_id) = SessionId::parse(session_id) else {
            return self
                .reject(ErrorCode::SessionNotFound, "unknown session", None)
                .await;
        };

        let creator = match self.state.registry.join(
            &session_id,
            &p.token,
            p.client_id.clone(),
            p.display_name.clone(),
            self.handle.clone(),
            unix_millis(),
        ) {
            Ok(creator) => creator,
            Err(JoinError::NotFound) => {
                return self
                    .reject(ErrorCode::SessionNotFound, "unknown session", None)
                    .await;
            }
            Err(JoinError::BadToken) => {
                return self.reject(ErrorCode::InvalidToken, "token mismatch", None).await;
            }
            Err(JoinError::Full) => {
                return self
                    .reject(ErrorCode::SessionFull, "session already has two peers", None)
                    .await;
            }
            Err(JoinError::DuplicateClient) => {
                return self
                    .reject(ErrorCode::InvalidState, "clientId already present in session", None)
                    .await;
            }
        };

        self.binding = Some(Binding {
            session_id,
            client_id: p.client_id.clone(),
        });

        // The joiner learns its peer before any relay can reach it; the
        // creator's notice is queued before this handler reads another frame,
        // so it precedes the joiner's first relay.
        if let Ok(frame) = messages::envelope(
            MsgType::SessionJoined,
            Some(&session_id),
            None,
            PeerInfoPayload {
                peer_id: creator.client_id.clone(),
                peer_display_name: creator.display_name.clone(),
            },
        ) {
            self.send(frame).await;
        }
        match messages::envelope(
            MsgType::PeerJoined,
            Some(&session_id),
            Some(&p.client_id),
            PeerInfoPayload {
                peer_id: p.client_id.clone(),
                peer_display_name: p.display_name,
            },
        ) {
            Ok(frame) => self.push_to_peer(&creator, frame).await,
            Err(_) => Flow::Continue,
        }
    }

    async fn on_relay(&mut self, raw: &str, session_id: &str, from: &str, to: &str) -> Flow {
        let (bound_session, me) = match &self.binding {
            Some(b) => (b.session_id, b.client_id.clone()),
            None => {
                return self
                    .reject(ErrorCode::Unauthorized, "no session bound", None)
                    .await;
            }
        };
        if from != me || SessionId::parse(session_id) != Some(bound_session) {
            return self
                .reject(
                    ErrorCode::Unauthorized,
                    "sender does not match connection identity",
                    None,
                )
                .await;
        }
        let Some(peer) = self.state.registry.peer_of(&bound_session, &me) else {
            // creator still waiting for a second member
            return self
                .reject(ErrorCode::Unauthorized, "no peer joined yet", None)
                .await;
        };
        if peer.client_id != to {
            return self
                .reject(ErrorCode::PeerNotFound, "recipient is not a session member", None)
                .await;
        }

        // Forward the envelope exactly as received.
        self.push_to_peer(&peer, raw.to_string()).await
    }

    async fn on_close(&mut self, p: SessionClosePayload) -> Flow {
        if self.binding.take().is_none() {
            return self
                .reject(ErrorCode::InvalidState, "no session to close", None)
                .await;
        }
        if let RemoveOutcome::Removed {
            session_id,
            client_id,
            peer: Some(peer),
        } = self.state.registry.remove_conn(self.conn_id)
        {
            if let Ok(frame) = messages::envelope(
                MsgType::PeerLeft,
                Some(&session_id),
                Some(&client_id),
                PeerLeftPayload {
                    peer_id: client_id.clone(),
                    reason: p.reason,
                },
            ) {
                let stall = Duration::from_millis(self.state.config.slow_peer_stall_ms);
                let _ = peer.conn.tx.send_timeout(Outbound::Frame(frame), stall).await;
            }
        }
        // The connection itself stays open, back in its unbound state.
        Flow::Continue
    }

    /// Push a frame to the other member. The bounded queue means a stuffed
    /// peer pauses this connection's read loop; a stall past the deadline
    /// tears the session down for both sides.
    async fn push_to_peer(&mut self, peer: &MemberInfo, frame: String) -> Flow {
        let stall = Duration::from_millis(self.state.config.slow_peer_stall_ms);
        match peer.conn.tx.send_timeout(Outbound::Frame(frame), stall).await {
            Ok(()) => Flow::Continue,
            Err(SendTimeoutError::Closed(_)) => {
                // Peer's handler is tearing down; its disconnect path owns
                // the membership cleanup.
                self.reject(ErrorCode::PeerNotFound, "peer connection closed", None)
                    .await
            }
            Err(SendTimeoutError::Timeout(_)) => self.abort_slow_session().await,
        }
    }

    async fn abort_slow_session(&mut self) -> Flow {
        let Some(binding) = self.binding.take() else {
            return Flow::Close;
        };
        warn!(
            conn_id = self.conn_id,
            session_id = %binding.session_id,
            "peer stalled past deadline, closing session"
        );
        let members = self.state.registry.close_session(&binding.session_id);
        let frame = messages::error_frame(ErrorCode::SlowPeer, "peer unable to keep up", None);
        for member in members {
            if let Ok(ref frame) = frame {
                let _ = member.conn.tx.try_send(Outbound::Frame(frame.clone()));
            }
            let _ = member.conn.tx.try_send(Outbound::Close {
                code: close_code::POLICY,
                reason: ErrorCode::SlowPeer.as_wire().into(),
            });
        }
        Flow::Close
    }

    /// Queue a frame on this connection, in order with relays.
    async fn send(&self, frame: String) {
        let _ = self.handle.tx.send(Outbound::Frame(frame)).await;
    }

    /// Report an error to the originator; the connection stays open.
    async fn reject(&self, code: ErrorCode, message: &str, retry_after: Option<u64>) -> Flow {
        if let Ok(frame) = messages::error_frame(code, message, retry_after) {
            self.send(frame).await;
        }
        Flow::Continue
    }

    async fn fail_internal(&self) -> Flow {
        let _ = self.reject(ErrorCode::Internal, "internal error", None).await;
        self.close(close_code::INTERNAL, "internal error").await;
        Flow::Close
    }

    async fn close(&self, code: u16, reason: &str) {
        let _ = self
            .handle
            .tx
            .send(Outbound::Close {
                code,
                reason: reason.into(),
            })
            .await;
    }
}

fn fatal_close_code(code: ErrorCode) -> u16 {
    match code {
        ErrorCode::MessageTooLarge => close_code::TOO_LARGE,
        ErrorCode::Internal => close_code::INTERNAL,
        _ => close_code::PROTOCOL_ERROR,
    }
}
