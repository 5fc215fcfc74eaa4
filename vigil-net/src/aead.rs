//! The per-session AEAD contexts and the rekey schedule.
//!
//! Each direction owns an AES-256-GCM key and a monotonic nonce counter,
//! and the two directions are separable: after the handshake the read
//! side takes the inbound half and the write side the outbound half, so
//! no key material is ever shared across tasks. The outbound side must
//! rekey when the byte budget is about to be crossed or the key epoch
//! has aged past the configured interval; the rekey travels as a single
//! in-band encrypted frame carrying a zero marker and the fresh public
//! key, never user payload.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;
use tokio::time::Instant;

use crate::frame::{Frame, RawFrame, HEADER_LEN, MAC_LEN};
use crate::{NetConfig, MSG_REKEY};

#[derive(Debug, Error)]
pub enum AeadError {
    /// MAC verification failed or the ciphertext was mangled.
    #[error("aead verification failed")]
    Verify,
    /// The frame was shorter than a MAC plus a message type.
    #[error("ciphertext too short")]
    Runt,
    /// A rekey frame carried an unexpected payload shape.
    #[error("malformed rekey frame")]
    MalformedRekey,
}

/// One direction's key material and nonce sequence.
struct DirectionState {
    key: [u8; 32],
    cipher: Aes256Gcm,
    nonce_counter: u64,
}

impl DirectionState {
    fn new(key: [u8; 32]) -> DirectionState {
        DirectionState {
            key,
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
            nonce_counter: 0,
        }
    }

    fn next_nonce(&mut self) -> [u8; 12] {
        let mut bytes = [0u8; 12];
        bytes[4..].copy_from_slice(&self.nonce_counter.to_be_bytes());
        self.nonce_counter += 1;
        bytes
    }

    /// Derive the successor key from the current key and an in-band
    /// public value, and reset the nonce sequence. Both peers converge
    /// on the same key from the rekey frame alone.
    fn rekey(&mut self, public: &[u8; 32]) {
        let mut ikm = Vec::with_capacity(64);
        ikm.extend_from_slice(&self.key);
        ikm.extend_from_slice(public);
        let hk = Hkdf::<Sha256>::new(None, &ikm);
        let mut next = [0u8; 32];
        hk.expand(b"vigil rekey", &mut next)
            .expect("32 bytes is a valid hkdf output length");
        *self = DirectionState::new(next);
    }
}

impl std::fmt::Debug for DirectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectionState")
            .field("nonce_counter", &self.nonce_counter)
            .finish_non_exhaustive()
    }
}

/// The sending half: seals frames and owns the rekey schedule.
#[derive(Debug)]
pub struct OutboundSession {
    direction: DirectionState,
    bytes_since_rekey: u64,
    rekey_byte_budget: u64,
    rekey_interval: std::time::Duration,
    out_key_epoch_start: Instant,
}

impl OutboundSession {
    fn new(key: [u8; 32], config: &NetConfig) -> OutboundSession {
        OutboundSession {
            direction: DirectionState::new(key),
            bytes_since_rekey: 0,
            rekey_byte_budget: config.rekey_byte_budget,
            rekey_interval: config.rekey_interval,
            out_key_epoch_start: Instant::now(),
        }
    }

    /// Whether sending a frame of `next_frame_len` wire bytes would cross
    /// the outbound byte budget.
    pub fn rekey_needed(&self, next_frame_len: usize) -> bool {
        self.bytes_since_rekey + next_frame_len as u64 >= self.rekey_byte_budget
    }

    /// Whether the outbound key epoch has aged out.
    pub fn time_rekey_due(&self, now: Instant) -> bool {
        now.duration_since(self.out_key_epoch_start) >= self.rekey_interval
    }

    pub fn bytes_since_rekey(&self) -> u64 {
        self.bytes_since_rekey
    }

    /// Encrypt one message into a complete wire frame. The length header
    /// is authenticated as associated data; the counter nonce makes every
    /// frame distinct.
    pub fn seal(&mut self, msg_type: u8, payload: &[u8]) -> Vec<u8> {
        let claimed = (payload.len() + 1) as u32;
        let header = claimed.to_le_bytes();

        let mut plaintext = Vec::with_capacity(payload.len() + 1);
        plaintext.push(msg_type);
        plaintext.extend_from_slice(payload);

        let nonce_bytes = self.direction.next_nonce();
        let ciphertext = self
            .direction
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &plaintext,
                    aad: &header,
                },
            )
            .expect("aes-gcm encryption is infallible for in-memory buffers");

        let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&ciphertext);

        // the rekey schedule counts unencrypted frame bytes
        self.bytes_since_rekey += (HEADER_LEN + plaintext.len()) as u64;
        out
    }

    /// Build the in-band rekey frame and install the new outbound key.
    ///
    /// The frame carries a zero marker byte plus the fresh 32-byte public
    /// value and nothing else; it is sealed under the *old* key so the
    /// peer can still read it.
    pub fn start_rekey(&mut self) -> Vec<u8> {
        use rand::RngCore;

        let mut public = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut public);

        let mut payload = Vec::with_capacity(33);
        payload.push(0u8);
        payload.extend_from_slice(&public);
        let frame = self.seal(MSG_REKEY, &payload);

        self.direction.rekey(&public);
        self.bytes_since_rekey = 0;
        self.out_key_epoch_start = Instant::now();
        metrics::counter!("net.rekeys").increment(1);
        frame
    }
}

/// The receiving half: opens frames and applies inbound rekeys.
#[derive(Debug)]
pub struct InboundSession {
    direction: DirectionState,
}

impl InboundSession {
    fn new(key: [u8; 32]) -> InboundSession {
        InboundSession {
            direction: DirectionState::new(key),
        }
    }

    /// Decrypt a raw frame into a logical message.
    pub fn open(&mut self, raw: &RawFrame) -> Result<Frame, AeadError> {
        if raw.body.len() < MAC_LEN + 1 {
            return Err(AeadError::Runt);
        }
        let nonce_bytes = self.direction.next_nonce();
        let plaintext = self
            .direction
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &raw.body,
                    aad: &raw.header,
                },
            )
            .map_err(|_| AeadError::Verify)?;

        let (&msg_type, payload) = plaintext.split_first().ok_or(AeadError::Runt)?;
        Ok(Frame::new(msg_type, payload.to_vec()))
    }

    /// Process a received rekey frame: install the new inbound key.
    pub fn process_rekey(&mut self, frame: &Frame) -> Result<(), AeadError> {
        if frame.msg_type != MSG_REKEY || frame.payload.len() != 33 || frame.payload[0] != 0 {
            return Err(AeadError::MalformedRekey);
        }
        let mut public = [0u8; 32];
        public.copy_from_slice(&frame.payload[1..]);
        self.direction.rekey(&public);
        Ok(())
    }
}

/// A fully established session, both directions still together. The
/// handshake produces this; the socket splits it.
#[derive(Debug)]
pub struct AeadSession {
    outbound: OutboundSession,
    inbound: InboundSession,
}

impl AeadSession {
    /// Build a session from the handshake's directional keys.
    pub fn new(outbound_key: [u8; 32], inbound_key: [u8; 32], config: &NetConfig) -> AeadSession {
        AeadSession {
            outbound: OutboundSession::new(outbound_key, config),
            inbound: InboundSession::new(inbound_key),
        }
    }

    pub fn seal(&mut self, msg_type: u8, payload: &[u8]) -> Vec<u8> {
        self.outbound.seal(msg_type, payload)
    }

    pub fn open(&mut self, raw: &RawFrame) -> Result<Frame, AeadError> {
        self.inbound.open(raw)
    }

    pub fn rekey_needed(&self, next_frame_len: usize) -> bool {
        self.outbound.rekey_needed(next_frame_len)
    }

    pub fn bytes_since_rekey(&self) -> u64 {
        self.outbound.bytes_since_rekey()
    }

    pub fn start_outbound_rekey(&mut self) -> Vec<u8> {
        self.outbound.start_rekey()
    }

    pub fn process_inbound_rekey(&mut self, frame: &Frame) -> Result<(), AeadError> {
        self.inbound.process_rekey(frame)
    }

    /// Separate the directions for the split socket halves.
    pub fn split(self) -> (InboundSession, OutboundSession) {
        (self.inbound, self.outbound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A connected session pair sharing directional keys.
    fn session_pair(config: &NetConfig) -> (AeadSession, AeadSession) {
        let k_ab = [0x11u8; 32];
        let k_ba = [0x22u8; 32];
        (
            AeadSession::new(k_ab, k_ba, config),
            AeadSession::new(k_ba, k_ab, config),
        )
    }

    fn raw_from_wire(wire: &[u8]) -> RawFrame {
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&wire[..HEADER_LEN]);
        RawFrame {
            header,
            body: wire[HEADER_LEN..].to_vec(),
        }
    }

    #[tokio::test]
    async fn seal_open_round_trip() {
        vigil_test::init();

        let (mut alice, mut bob) = session_pair(&NetConfig::default());
        let wire = alice.seal(0x05, b"deadbeef");
        let frame = bob.open(&raw_from_wire(&wire)).unwrap();
        assert_eq!(frame.msg_type, 0x05);
        assert_eq!(frame.payload, b"deadbeef");
    }

    #[tokio::test]
    async fn tampered_frame_fails_verification() {
        vigil_test::init();

        let (mut alice, mut bob) = session_pair(&NetConfig::default());
        let mut wire = alice.seal(0x05, b"payload");
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        assert!(matches!(
            bob.open(&raw_from_wire(&wire)),
            Err(AeadError::Verify)
        ));
    }

    #[tokio::test]
    async fn tampered_length_header_fails_verification() {
        vigil_test::init();

        let (mut alice, mut bob) = session_pair(&NetConfig::default());
        let mut wire = alice.seal(0x05, b"payload");
        wire[0] ^= 0x01;
        assert!(bob.open(&raw_from_wire(&wire)).is_err());
    }

    #[tokio::test]
    async fn rekey_schedule_counts_frame_bytes() {
        vigil_test::init();

        // the unit-test budget: 1200 bytes, 17-byte frames (12-byte
        // payload + type + length header)
        let config = NetConfig {
            rekey_byte_budget: 1200,
            ..NetConfig::default()
        };
        let (mut alice, mut bob) = session_pair(&config);
        let payload = [0xDEu8; 12];

        for _ in 0..69 {
            let wire = alice.seal(0x05, &payload);
            bob.open(&raw_from_wire(&wire)).unwrap();
            assert!(!alice.rekey_needed(17));
        }

        // the 70th frame trips the budget
        let wire = alice.seal(0x05, &payload);
        bob.open(&raw_from_wire(&wire)).unwrap();
        assert!(alice.rekey_needed(17));

        // rekey: the frame carries the zero marker + public key only
        let rekey_wire = alice.start_outbound_rekey();
        let rekey_frame = bob.open(&raw_from_wire(&rekey_wire)).unwrap();
        assert_eq!(rekey_frame.msg_type, MSG_REKEY);
        assert_eq!(rekey_frame.payload.len(), 33);
        assert_eq!(rekey_frame.payload[0], 0);
        bob.process_inbound_rekey(&rekey_frame).unwrap();

        // another 69 frames decrypt under the new key without tripping
        for _ in 0..69 {
            let wire = alice.seal(0x05, &payload);
            let frame = bob.open(&raw_from_wire(&wire)).unwrap();
            assert_eq!(frame.payload, payload);
            assert!(!alice.rekey_needed(17));
        }
        let wire = alice.seal(0x05, &payload);
        bob.open(&raw_from_wire(&wire)).unwrap();
        assert!(alice.rekey_needed(17));
    }

    #[tokio::test]
    async fn nonces_advance_per_frame() {
        vigil_test::init();

        let (mut alice, mut bob) = session_pair(&NetConfig::default());
        for i in 0u8..4 {
            let wire = alice.seal(0x05, &[i]);
            let frame = bob.open(&raw_from_wire(&wire)).unwrap();
            assert_eq!(frame.payload, vec![i]);
        }

        // replaying an old frame under an advanced nonce fails
        let replay = alice.seal(0x05, b"x");
        bob.open(&raw_from_wire(&replay)).unwrap();
        assert!(bob.open(&raw_from_wire(&replay)).is_err());
    }
}
