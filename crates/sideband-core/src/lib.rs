//! sideband-core: Shared protocol library for the sideband signaling broker.
//!
//! Provides the JSON wire envelope and message types, frame decoding with
//! boundary validation, session identifier / join token generation, and the
//! shared error type.

pub mod codec;
pub mod error;
pub mod ids;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{decode, ClientRequest, CodecConfig, Decoded, DecodeError};
pub use error::{SignalError, SignalResult};
pub use ids::{JoinToken, SessionId};
pub use messages::{unix_millis, ErrorCode, MsgType};
