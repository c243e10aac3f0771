//! Server glue: shared state, listener, routing, and the expiry sweeper.
//!
//! One axum listener serves the WebSocket signaling endpoint plus the
//! read-only diagnostic routes. All process-global state lives in
//! [`ServerState`]: configuration, the registry, the rate limiter, and the
//! diagnostic counters — nothing else is a singleton.

use crate::config::Config;
use crate::handler;
use crate::rate_limit::ServerRateLimits;
use crate::registry::{close_code, Outbound, Registry};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use sideband_core::{unix_millis, SignalError, SignalResult};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Attempts to bind the listener before giving up.
const BIND_ATTEMPTS: u32 = 5;

/// Cumulative counters since start, for the `/stats` surface.
#[derive(Default)]
pub struct Stats {
    pub sessions_created: AtomicU64,
    pub sessions_expired: AtomicU64,
}

/// Process-global state shared by every connection handler.
pub struct ServerState {
    pub config: Config,
    pub registry: Registry,
    limits: Mutex<ServerRateLimits>,
    pub stats: Stats,
    pub next_conn_id: AtomicU64,
    /// Live transport connections, bound or not.
    pub live_connections: AtomicUsize,
    pub started_at: Instant,
    /// Fans the shutdown notice out to every connection handler.
    pub shutdown_tx: broadcast::Sender<()>,
}

impl ServerState {
    pub fn new(config: Config) -> Self {
        let registry = Registry::new(config.max_sessions, config.session_ttl_ms);
        let limits = Mutex::new(ServerRateLimits::from_config(&config));
        Self {
            registry,
            limits,
            stats: Stats::default(),
            next_conn_id: AtomicU64::new(1),
            live_connections: AtomicUsize::new(0),
            started_at: Instant::now(),
            shutdown_tx: broadcast::channel(1).0,
            config,
        }
    }

    pub fn limits(&self) -> MutexGuard<'_, ServerRateLimits> {
        self.limits.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Claim on the per-address and global connection budgets. Released on
/// drop, so an upgrade that never completes still frees its slot.
pub struct SlotGuard {
    state: Arc<ServerState>,
    ip: IpAddr,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.state.live_connections.fetch_sub(1, Ordering::Relaxed);
        self.state.limits().release_connection(self.ip);
    }
}

/// Assemble the application router.
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route(&state.config.endpoint_path, get(ws_handler))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .with_state(state)
}

/// Upgrade handler for the signaling endpoint. Connection caps are
/// enforced here, before the upgrade completes.
async fn ws_handler(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    if state.live_connections.load(Ordering::Relaxed) >= state.config.connection_cap {
        warn!(remote = %remote, "connection cap reached, rejecting");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    if !state.limits().try_acquire_connection(remote.ip()) {
        warn!(remote = %remote, "per-address connection limit reached, rejecting");
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    state.live_connections.fetch_add(1, Ordering::Relaxed);
    let slot = SlotGuard {
        state: state.clone(),
        ip: remote.ip(),
    };

    ws.on_upgrade(move |socket| handler::run(socket, state, remote, slot))
}

async fn health(State(state): State<Arc<ServerState>>) -> Response {
    diagnostic_body(&state, false)
}

async fn stats(State(state): State<Arc<ServerState>>) -> Response {
    diagnostic_body(&state, true)
}

fn diagnostic_body(state: &ServerState, totals: bool) -> Response {
    let (sessions, _) = state.registry.counts();
    let mut body = json!({
        "status": "ok",
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "sessions": sessions,
        "connections": state.live_connections.load(Ordering::Relaxed),
        "timestamp": unix_millis(),
    });
    if totals {
        body["sessionsCreated"] =
            json!(state.stats.sessions_created.load(Ordering::Relaxed));
        body["sessionsExpired"] =
            json!(state.stats.sessions_expired.load(Ordering::Relaxed));
    }
    (
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (
                header::ACCESS_CONTROL_ALLOW_ORIGIN,
                state.config.cors_origin.clone(),
            ),
        ],
        body.to_string(),
    )
        .into_response()
}

/// Periodic expiry sweep. Expired peers are considered gone: their
/// connections are closed without notification.
pub fn spawn_sweeper(state: Arc<ServerState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_millis(state.config.sweep_interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let report = state.registry.sweep(unix_millis());
            if report.sessions_removed > 0 {
                state
                    .stats
                    .sessions_expired
                    .fetch_add(report.sessions_removed, Ordering::Relaxed);
                info!(count = report.sessions_removed, "expired sessions removed");
            }
            for conn in report.closed {
                let _ = conn.tx.try_send(Outbound::Close {
                    code: close_code::NORMAL,
                    reason: "session expired".into(),
                });
            }
            state.limits().gc();
        }
    })
}

/// Bind the listener and spawn the serving task. Returns the bound address
/// so callers (and the integration tests) can reach an ephemeral port.
pub async fn start(
    config: Config,
) -> SignalResult<(SocketAddr, Arc<ServerState>, JoinHandle<()>)> {
    let state = Arc::new(ServerState::new(config));
    let listener = bind_with_backoff(state.config.listen_address).await?;
    let addr = listener.local_addr()?;

    let _sweeper = spawn_sweeper(state.clone());

    let app = router(state.clone()).into_make_service_with_connect_info::<SocketAddr>();
    let serve_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "server error");
        }
    });

    info!(addr = %addr, path = %state.config.endpoint_path, "sideband-server ready");
    Ok((addr, state, serve_handle))
}

/// Run until the serve task ends or a shutdown signal arrives; connected
/// clients get a close frame before the process exits.
pub async fn run(config: Config) -> SignalResult<()> {
    let (_addr, state, serve_handle) = start(config).await?;

    tokio::select! {
        _ = serve_handle => {}
        _ = shutdown_signal() => {
            info!("shutdown signal received, notifying clients");
            let _ = state.shutdown_tx.send(());
            // a moment for handlers to flush their close frames
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    Ok(())
}

async fn bind_with_backoff(addr: SocketAddr) -> SignalResult<TcpListener> {
    let mut delay = Duration::from_millis(500);
    let mut attempt = 1;
    loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) if attempt < BIND_ATTEMPTS => {
                warn!(attempt, error = %e, "bind failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => {
                return Err(SignalError::Transport(format!(
                    "could not bind {addr} after {BIND_ATTEMPTS} attempts: {e}"
                )));
            }
        }
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
