//! Session and connection registries.
//!
//! Both maps live behind one mutex: every mutation that touches membership
//! also touches the reverse connection index, and the pairing must be
//! atomic. Critical sections only mutate the maps; sends to peers happen
//! after the lock is released, through the cloned [`ConnHandle`]s returned
//! by each operation.

use ring::rand::SystemRandom;
use sideband_core::ids::{JoinToken, SessionId};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// WebSocket close codes used by the broker.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const POLICY: u16 = 1008;
    pub const TOO_LARGE: u16 = 1009;
    pub const INTERNAL: u16 = 1011;
}

/// Items queued to a connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    /// A complete JSON text frame.
    Frame(String),
    /// Transport keep-alive ping.
    Ping,
    /// Close the connection after draining queued frames.
    Close { code: u16, reason: String },
}

/// Send handle for one live connection. The socket itself stays with the
/// connection's handler task; the registry only holds this weak handle for
/// relay dispatch and teardown.
#[derive(Debug, Clone)]
pub struct ConnHandle {
    pub id: u64,
    pub tx: mpsc::Sender<Outbound>,
}

/// Membership facts returned out of the critical section.
#[derive(Debug, Clone)]
pub struct MemberInfo {
    pub client_id: String,
    pub display_name: String,
    pub conn: ConnHandle,
}

struct Member {
    client_id: String,
    display_name: String,
    conn: ConnHandle,
    #[allow(dead_code)]
    joined_at_ms: i64,
}

impl Member {
    fn info(&self) -> MemberInfo {
        MemberInfo {
            client_id: self.client_id.clone(),
            display_name: self.display_name.clone(),
            conn: self.conn.clone(),
        }
    }
}

struct Session {
    token: JoinToken,
    #[allow(dead_code)]
    created_at_ms: i64,
    expires_at_ms: i64,
    members: Vec<Member>, // at most 2
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, Session>,
    /// Reverse index: connection id → (session, member) for O(1) disconnect
    /// cleanup. An entry exists iff the connection is a member's `conn`.
    conns: HashMap<u64, (SessionId, String)>,
}

/// Result of a successful create.
#[derive(Debug)]
pub struct Created {
    pub session_id: SessionId,
    pub token: JoinToken,
    pub expires_at_ms: i64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum CreateError {
    /// Live-session cap reached.
    Capacity,
    /// CSPRNG failure or an identifier collision.
    Internal,
}

#[derive(Debug, PartialEq, Eq)]
pub enum JoinError {
    NotFound,
    BadToken,
    Full,
    DuplicateClient,
}

/// Outcome of removing a connection's membership.
#[derive(Debug)]
pub enum RemoveOutcome {
    Removed {
        session_id: SessionId,
        client_id: String,
        /// The other member, if one remains. When `None` the session was
        /// deleted with this removal.
        peer: Option<MemberInfo>,
    },
    /// The connection had no session binding.
    Missing,
}

/// Expired sessions removed by one sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub sessions_removed: u64,
    pub closed: Vec<ConnHandle>,
}

/// Sole authority over session existence, membership, and token validation.
pub struct Registry {
    inner: Mutex<Inner>,
    rng: SystemRandom,
    session_ttl_ms: i64,
    max_sessions: usize,
}

impl Registry {
    pub fn new(max_sessions: usize, session_ttl_ms: u64) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            rng: SystemRandom::new(),
            session_ttl_ms: session_ttl_ms as i64,
            max_sessions,
        }
    }

    fn locked(&self) -> MutexGuard<'_, Inner> {
        // A poisoned lock means a panic mid-mutation elsewhere; the maps are
        // still structurally sound, so keep serving.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a session with the caller as its first member.
    pub fn create(
        &self,
        client_id: String,
        display_name: String,
        conn: ConnHandle,
        now_ms: i64,
    ) -> Result<Created, CreateError> {
        let session_id = SessionId::generate(&self.rng).map_err(|_| CreateError::Internal)?;
        let token = JoinToken::generate(&self.rng).map_err(|_| CreateError::Internal)?;
        let expires_at_ms = now_ms + self.session_ttl_ms;

        let mut inner = self.locked();
        if inner.sessions.len() >= self.max_sessions {
            return Err(CreateError::Capacity);
        }
        // 128-bit IDs do not collide in practice; guard anyway so an insert
        // never replaces a live session.
        if inner.sessions.contains_key(&session_id) {
            return Err(CreateError::Internal);
        }

        let conn_id = conn.id;
        inner.sessions.insert(
            session_id,
            Session {
                token: token.clone(),
                created_at_ms: now_ms,
                expires_at_ms,
                members: vec![Member {
                    client_id: client_id.clone(),
                    display_name,
                    conn,
                    joined_at_ms: now_ms,
                }],
            },
        );
        inner.conns.insert(conn_id, (session_id, client_id));
        drop(inner);

        info!(session_id = %session_id, "session created");
        Ok(Created {
            session_id,
            token,
            expires_at_ms,
        })
    }

    /// Add the second member. Token check, capacity check, duplicate-client
    /// check, and the connection bind all happen in one critical section.
    /// Returns the already-present member for the join notifications.
    pub fn join(
        &self,
        session_id: &SessionId,
        presented_token: &str,
        client_id: String,
        display_name: String,
        conn: ConnHandle,
        now_ms: i64,
    ) -> Result<MemberInfo, JoinError> {
        let presented = JoinToken::parse(presented_token);

        let mut guard = self.locked();
        let inner = &mut *guard;
        let session = inner
            .sessions
            .get_mut(session_id)
            .filter(|s| s.expires_at_ms > now_ms)
            .ok_or(JoinError::NotFound)?;
        match presented {
            Some(ref t) if session.token.matches(t) => {}
            _ => return Err(JoinError::BadToken),
        }
        if session.members.len() >= 2 {
            return Err(JoinError::Full);
        }
        if session.members.iter().any(|m| m.client_id == client_id) {
            return Err(JoinError::DuplicateClient);
        }

        let peer = session.members[0].info();
        let conn_id = conn.id;
        session.members.push(Member {
            client_id: client_id.clone(),
            display_name,
            conn,
            joined_at_ms: now_ms,
        });
        inner.conns.insert(conn_id, (*session_id, client_id.clone()));
        drop(guard);

        info!(session_id = %session_id, client_id = %client_id, "peer joined session");
        Ok(peer)
    }

    /// Constant-time token check. Unknown sessions report `false`.
    pub fn validate_token(&self, session_id: &SessionId, presented_token: &str) -> bool {
        let Some(presented) = JoinToken::parse(presented_token) else {
            return false;
        };
        let inner = self.locked();
        inner
            .sessions
            .get(session_id)
            .is_some_and(|s| s.token.matches(&presented))
    }

    /// The *other* member of a session, for relay dispatch.
    pub fn peer_of(&self, session_id: &SessionId, client_id: &str) -> Option<MemberInfo> {
        let inner = self.locked();
        inner
            .sessions
            .get(session_id)?
            .members
            .iter()
            .find(|m| m.client_id != client_id)
            .map(Member::info)
    }

    /// Remove whatever membership a connection holds. Deletes the session
    /// when the membership empties; no empty session is ever retained.
    pub fn remove_conn(&self, conn_id: u64) -> RemoveOutcome {
        let mut inner = self.locked();
        let Some((session_id, client_id)) = inner.conns.remove(&conn_id) else {
            return RemoveOutcome::Missing;
        };
        let Some(session) = inner.sessions.get_mut(&session_id) else {
            return RemoveOutcome::Removed {
                session_id,
                client_id,
                peer: None,
            };
        };
        session.members.retain(|m| m.conn.id != conn_id);
        let peer = session.members.first().map(Member::info);
        if session.members.is_empty() {
            delete_session_locked(&mut inner, &session_id);
            debug!(session_id = %session_id, "session emptied and removed");
        }
        drop(inner);

        RemoveOutcome::Removed {
            session_id,
            client_id,
            peer,
        }
    }

    /// Tear down a whole session, returning its members so the caller can
    /// notify and close them outside the lock.
    pub fn close_session(&self, session_id: &SessionId) -> Vec<MemberInfo> {
        let mut inner = self.locked();
        delete_session_locked(&mut inner, session_id)
            .iter()
            .map(Member::info)
            .collect()
    }

    /// Delete every session past its expiry. Connection handles of removed
    /// members are returned for closing; expired peers get no notification.
    pub fn sweep(&self, now_ms: i64) -> SweepReport {
        let mut report = SweepReport::default();
        let mut inner = self.locked();
        let expired: Vec<SessionId> = inner
            .sessions
            .iter()
            .filter(|(_, s)| s.expires_at_ms <= now_ms)
            .map(|(id, _)| *id)
            .collect();
        for session_id in expired {
            let members = delete_session_locked(&mut inner, &session_id);
            report.closed.extend(members.into_iter().map(|m| m.conn));
            report.sessions_removed += 1;
            debug!(session_id = %session_id, "session expired");
        }
        report
    }

    /// (live sessions, bound connections) for the diagnostic surface.
    pub fn counts(&self) -> (usize, usize) {
        let inner = self.locked();
        (inner.sessions.len(), inner.conns.len())
    }
}

/// Single deletion path: expiry, explicit teardown, and last-member-remove
/// all converge here so the session/connection maps never disagree.
fn delete_session_locked(inner: &mut Inner, session_id: &SessionId) -> Vec<Member> {
    let Some(session) = inner.sessions.remove(session_id) else {
        return Vec::new();
    };
    for member in &session.members {
        inner.conns.remove(&member.conn.id);
    }
    session.members
}
