//! sideband-server: WebRTC signaling broker.
//!
//! Pairs exactly two peers through a short-lived, token-protected session
//! over a WebSocket endpoint, relays their signaling envelopes verbatim,
//! and tears state down on disconnect or expiry. No state survives the
//! process: the broker's role is ephemeral.

pub mod config;
pub mod handler;
pub mod rate_limit;
pub mod registry;
pub mod server;
