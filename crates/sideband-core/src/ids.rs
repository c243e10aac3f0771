//! Session identifiers and join tokens.
//!
//! Session IDs are 128-bit and shared with both peers; join tokens are
//! 256-bit secrets handed only to the session creator. Both render as
//! lowercase hex. Token comparison is constant-time.

use crate::error::{SignalError, SignalResult};
use ring::rand::{SecureRandom, SystemRandom};
use std::fmt;

/// A 128-bit session identifier, rendered as 32 lowercase hex chars.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId([u8; 16]);

impl SessionId {
    /// Generate a fresh identifier from the system CSPRNG.
    pub fn generate(rng: &SystemRandom) -> SignalResult<Self> {
        let mut bytes = [0u8; 16];
        rng.fill(&mut bytes).map_err(|_| SignalError::Rng)?;
        Ok(Self(bytes))
    }

    /// Parse the canonical hex form. Returns `None` for anything else.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() != 32 {
            return None;
        }
        let raw = hex::decode(s).ok()?;
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&raw);
        Some(Self(bytes))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", hex::encode(self.0))
    }
}

/// A 256-bit join token. Never logged, never compared byte-by-byte.
#[derive(Clone)]
pub struct JoinToken([u8; 32]);

impl JoinToken {
    /// Generate a fresh token from the system CSPRNG.
    pub fn generate(rng: &SystemRandom) -> SignalResult<Self> {
        let mut bytes = [0u8; 32];
        rng.fill(&mut bytes).map_err(|_| SignalError::Rng)?;
        Ok(Self(bytes))
    }

    /// Parse the canonical hex form. Returns `None` for anything else.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() != 64 {
            return None;
        }
        let raw = hex::decode(s).ok()?;
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&raw);
        Some(Self(bytes))
    }

    /// Constant-time equality against a presented token.
    pub fn matches(&self, presented: &JoinToken) -> bool {
        ring::constant_time::verify_slices_are_equal(&self.0, &presented.0).is_ok()
    }

    /// Render the token for the creator's `session_created` reply.
    /// This is the only place the secret leaves the process.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for JoinToken {
    // Redacted: tokens must never reach logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JoinToken(..)")
    }
}
