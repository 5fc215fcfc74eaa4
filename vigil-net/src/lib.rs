//! The encrypted framed transport between clients and the service.
//!
//! One length-prefixed frame per logical message, AES-256-GCM after an
//! x25519 handshake, with scheduled rekeying on byte volume and elapsed
//! time. One state machine serves both connection roles; one-way and
//! two-way peer authentication are selectable at connect time.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod aead;
pub mod frame;
pub mod handshake;
pub mod socket;

pub use aead::{AeadError, AeadSession, InboundSession, OutboundSession};
pub use frame::{Frame, FrameError, RawFrame, RawFrameCodec, MAC_LEN, MAX_FRAME};
pub use handshake::{AuthMode, Handshake, HandshakeError, LocalIdentity, PeerSet, Role};
pub use socket::{FrameReader, FrameWriter, FramedSocket, NetError, SessionState};

/// Message types at or above this value belong to the handshake/rekey
/// machinery; user messages below it are only honored once the session
/// is authed.
pub const HANDSHAKE_THRESHOLD: u8 = 0xB0;

/// Handshake and in-band control message types.
pub const MSG_HELLO: u8 = 0xB1;
pub const MSG_ACCEPT: u8 = 0xB2;
pub const MSG_AUTH: u8 = 0xB3;
pub const MSG_REKEY: u8 = 0xB5;

/// Transport tuning. Immutable once built.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetConfig {
    /// Outbound bytes before a rekey is forced. Unit tests lower this to
    /// exercise the path.
    pub rekey_byte_budget: u64,
    /// Elapsed time before a rekey is forced.
    pub rekey_interval: Duration,
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig {
            rekey_byte_budget: 1 << 30,
            rekey_interval: Duration::from_secs(600),
        }
    }
}
