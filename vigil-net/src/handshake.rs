//! The authenticated key agreement run before any user frame.
//!
//! One state machine serves both roles:
//!
//! ```text
//! initiator                       responder
//!   Hello { eph_pub }        -->
//!                            <--  Accept { eph_pub, static_pub, proof }
//!   (verify static ∈ peers, verify proof, derive session)
//!   Auth { static_pub, proof }    (two-way only, encrypted)
//!                            -->  (verify static ∈ peers, verify proof)
//! ```
//!
//! Session keys come from HKDF-SHA256 over both Diffie-Hellman results
//! (ephemeral-ephemeral and ephemeral-static), salted with the handshake
//! transcript. The responder's proof requires its static secret, which
//! is what authenticates it; the initiator's mirror proof authenticates
//! it in two-way mode.

use std::collections::HashSet;

use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::aead::AeadSession;
use crate::frame::Frame;
use crate::{NetConfig, MSG_ACCEPT, MSG_AUTH, MSG_HELLO};

pub const PUBKEY_LEN: usize = 32;
const PROOF_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("unexpected handshake message {0:#04x} in state {1:?}")]
    UnexpectedMessage(u8, State),
    #[error("malformed handshake payload")]
    Malformed,
    #[error("peer's static key is not authorized")]
    UnknownPeer,
    #[error("peer's key proof did not verify")]
    BadProof,
}

/// Which end of the connection this endpoint is.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Whether only the responder proves its identity, or both ends do.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    OneWay,
    TwoWay,
}

/// This endpoint's long-term key.
#[derive(Clone)]
pub struct LocalIdentity {
    secret: StaticSecret,
}

impl LocalIdentity {
    pub fn generate() -> LocalIdentity {
        LocalIdentity {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> LocalIdentity {
        LocalIdentity {
            secret: StaticSecret::from(bytes),
        }
    }

    pub fn public_key(&self) -> [u8; 32] {
        PublicKey::from(&self.secret).to_bytes()
    }
}

impl std::fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("public", &hex::encode(self.public_key()))
            .finish_non_exhaustive()
    }
}

/// The authorized peers set: long-term public keys this endpoint will
/// talk to.
#[derive(Clone, Debug, Default)]
pub struct PeerSet {
    keys: HashSet<[u8; 32]>,
}

impl PeerSet {
    pub fn new() -> PeerSet {
        PeerSet::default()
    }

    pub fn authorize(&mut self, key: [u8; 32]) {
        self.keys.insert(key);
    }

    pub fn is_authorized(&self, key: &[u8; 32]) -> bool {
        self.keys.contains(key)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    /// Initiator: Hello not yet sent. Responder: Hello not yet received.
    Start,
    /// Initiator: waiting for Accept.
    AwaitAccept,
    /// Responder: waiting for the initiator's Auth (two-way only).
    AwaitAuth,
    Complete,
    Failed,
}

/// What `process` tells the caller to do next.
pub struct HandshakeStep {
    /// Frames to put on the wire, in order. `encrypted` marks frames
    /// that must be sealed with the just-derived session.
    pub replies: Vec<(Frame, bool)>,
    pub complete: bool,
}

pub struct Handshake {
    role: Role,
    auth_mode: AuthMode,
    identity: LocalIdentity,
    peers: PeerSet,
    config: NetConfig,
    state: State,
    eph_secret: StaticSecret,
    eph_public: [u8; 32],
    remote_eph: Option<[u8; 32]>,
    remote_static: Option<[u8; 32]>,
    session: Option<AeadSession>,
}

impl Handshake {
    pub fn new(
        role: Role,
        auth_mode: AuthMode,
        identity: LocalIdentity,
        peers: PeerSet,
        config: NetConfig,
    ) -> Handshake {
        let eph_secret = StaticSecret::random_from_rng(OsRng);
        let eph_public = PublicKey::from(&eph_secret).to_bytes();
        Handshake {
            role,
            auth_mode,
            identity,
            peers,
            config,
            state: State::Start,
            eph_secret,
            eph_public,
            remote_eph: None,
            remote_static: None,
            session: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The initiator's opening frame. Responders send nothing first.
    pub fn start(&mut self) -> Option<Frame> {
        match self.role {
            Role::Initiator => {
                self.state = State::AwaitAccept;
                Some(Frame::new(MSG_HELLO, self.eph_public.to_vec()))
            }
            Role::Responder => None,
        }
    }

    /// Feed one handshake frame through the state machine.
    pub fn process(&mut self, frame: Frame) -> Result<HandshakeStep, HandshakeError> {
        let step = match (self.role, self.state, frame.msg_type) {
            (Role::Responder, State::Start, MSG_HELLO) => self.on_hello(&frame),
            (Role::Initiator, State::AwaitAccept, MSG_ACCEPT) => self.on_accept(&frame),
            (Role::Responder, State::AwaitAuth, MSG_AUTH) => self.on_auth(&frame),
            (_, state, msg_type) => Err(HandshakeError::UnexpectedMessage(msg_type, state)),
        };
        if step.is_err() {
            self.state = State::Failed;
        }
        step
    }

    /// Hand over the established session and the peer's verified static
    /// key (two-way) once complete.
    pub fn into_session(self) -> Option<(AeadSession, Option<[u8; 32]>)> {
        if self.state != State::Complete {
            return None;
        }
        self.session.map(|session| (session, self.remote_static))
    }

    /// The in-flight session, for the socket layer to open encrypted
    /// handshake frames (the two-way Auth) before completion.
    pub fn session_mut(&mut self) -> Option<&mut AeadSession> {
        self.session.as_mut()
    }

    fn on_hello(&mut self, frame: &Frame) -> Result<HandshakeStep, HandshakeError> {
        if frame.payload.len() != PUBKEY_LEN {
            return Err(HandshakeError::Malformed);
        }
        let remote_eph = read_key(&frame.payload, 0)?;
        self.remote_eph = Some(remote_eph);

        // ee and es secrets; the es leg proves possession of our static
        let ss_ee = self.eph_secret.diffie_hellman(&PublicKey::from(remote_eph));
        let ss_es = self
            .identity
            .secret
            .diffie_hellman(&PublicKey::from(remote_eph));

        let transcript = transcript_hash(&remote_eph, &self.eph_public, &self.identity.public_key());
        let keys = derive_keys(ss_ee.as_bytes(), ss_es.as_bytes(), &transcript);

        // responder sends on the r2i key
        self.session = Some(AeadSession::new(keys.k_r2i, keys.k_i2r, &self.config));

        let mut accept = Vec::with_capacity(PUBKEY_LEN * 2 + PROOF_LEN);
        accept.extend_from_slice(&self.eph_public);
        accept.extend_from_slice(&self.identity.public_key());
        accept.extend_from_slice(&keys.responder_proof);

        match self.auth_mode {
            AuthMode::OneWay => {
                self.state = State::Complete;
            }
            AuthMode::TwoWay => {
                self.state = State::AwaitAuth;
            }
        }

        Ok(HandshakeStep {
            replies: vec![(Frame::new(MSG_ACCEPT, accept), false)],
            complete: self.state == State::Complete,
        })
    }

    fn on_accept(&mut self, frame: &Frame) -> Result<HandshakeStep, HandshakeError> {
        if frame.payload.len() != PUBKEY_LEN * 2 + PROOF_LEN {
            return Err(HandshakeError::Malformed);
        }
        let remote_eph = read_key(&frame.payload, 0)?;
        let remote_static = read_key(&frame.payload, PUBKEY_LEN)?;
        let claimed_proof = &frame.payload[PUBKEY_LEN * 2..];

        if !self.peers.is_authorized(&remote_static) {
            return Err(HandshakeError::UnknownPeer);
        }

        let ss_ee = self.eph_secret.diffie_hellman(&PublicKey::from(remote_eph));
        let ss_es = self
            .eph_secret
            .diffie_hellman(&PublicKey::from(remote_static));

        let transcript = transcript_hash(&self.eph_public, &remote_eph, &remote_static);
        let keys = derive_keys(ss_ee.as_bytes(), ss_es.as_bytes(), &transcript);

        if !constant_time_eq(claimed_proof, &keys.responder_proof) {
            return Err(HandshakeError::BadProof);
        }

        self.remote_eph = Some(remote_eph);
        self.remote_static = Some(remote_static);
        self.session = Some(AeadSession::new(keys.k_i2r, keys.k_r2i, &self.config));
        self.state = State::Complete;

        let replies = match self.auth_mode {
            AuthMode::OneWay => Vec::new(),
            AuthMode::TwoWay => {
                let ss_se = self
                    .identity
                    .secret
                    .diffie_hellman(&PublicKey::from(remote_eph));
                let proof = initiator_proof(ss_se.as_bytes(), &transcript);
                let mut auth = Vec::with_capacity(PUBKEY_LEN + PROOF_LEN);
                auth.extend_from_slice(&self.identity.public_key());
                auth.extend_from_slice(&proof);
                vec![(Frame::new(MSG_AUTH, auth), true)]
            }
        };

        Ok(HandshakeStep {
            replies,
            complete: true,
        })
    }

    fn on_auth(&mut self, frame: &Frame) -> Result<HandshakeStep, HandshakeError> {
        if frame.payload.len() != PUBKEY_LEN + PROOF_LEN {
            return Err(HandshakeError::Malformed);
        }
        let remote_static = read_key(&frame.payload, 0)?;
        let claimed_proof = &frame.payload[PUBKEY_LEN..];

        if !self.peers.is_authorized(&remote_static) {
            return Err(HandshakeError::UnknownPeer);
        }

        // recompute the mirror proof with the initiator's claimed static
        let remote_eph = self.remote_eph.expect("set when Hello was processed");
        let transcript =
            transcript_hash(&remote_eph, &self.eph_public, &self.identity.public_key());
        let ss_se = self
            .eph_secret
            .diffie_hellman(&PublicKey::from(remote_static));
        let expected = initiator_proof(ss_se.as_bytes(), &transcript);

        if !constant_time_eq(claimed_proof, &expected) {
            return Err(HandshakeError::BadProof);
        }

        self.remote_static = Some(remote_static);
        self.state = State::Complete;
        Ok(HandshakeStep {
            replies: Vec::new(),
            complete: true,
        })
    }
}

struct DerivedKeys {
    k_i2r: [u8; 32],
    k_r2i: [u8; 32],
    responder_proof: [u8; PROOF_LEN],
}

fn transcript_hash(
    initiator_eph: &[u8; 32],
    responder_eph: &[u8; 32],
    responder_static: &[u8; 32],
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"vigil-handshake-v1");
    hasher.update(initiator_eph);
    hasher.update(responder_eph);
    hasher.update(responder_static);
    hasher.finalize().into()
}

fn derive_keys(ss_ee: &[u8; 32], ss_es: &[u8; 32], transcript: &[u8; 32]) -> DerivedKeys {
    let mut ikm = Vec::with_capacity(64);
    ikm.extend_from_slice(ss_ee);
    ikm.extend_from_slice(ss_es);

    let hk = Hkdf::<Sha256>::new(Some(transcript), &ikm);
    let mut okm = [0u8; 96];
    hk.expand(b"vigil session keys", &mut okm)
        .expect("96 bytes is a valid hkdf output length");

    let mut k_i2r = [0u8; 32];
    let mut k_r2i = [0u8; 32];
    let mut responder_proof = [0u8; PROOF_LEN];
    k_i2r.copy_from_slice(&okm[..32]);
    k_r2i.copy_from_slice(&okm[32..64]);
    responder_proof.copy_from_slice(&okm[64..]);
    DerivedKeys {
        k_i2r,
        k_r2i,
        responder_proof,
    }
}

/// The initiator's mirror proof: HKDF over the static-ephemeral secret
/// bound to the transcript.
fn initiator_proof(ss_se: &[u8; 32], transcript: &[u8; 32]) -> [u8; PROOF_LEN] {
    let hk = Hkdf::<Sha256>::new(Some(transcript), ss_se);
    let mut proof = [0u8; PROOF_LEN];
    hk.expand(b"vigil initiator auth", &mut proof)
        .expect("32 bytes is a valid hkdf output length");
    proof
}

fn read_key(payload: &[u8], offset: usize) -> Result<[u8; 32], HandshakeError> {
    let bytes = payload
        .get(offset..offset + PUBKEY_LEN)
        .ok_or(HandshakeError::Malformed)?;
    let mut key = [0u8; 32];
    key.copy_from_slice(bytes);
    Ok(key)
}

fn constant_time_eq(lhs: &[u8], rhs: &[u8]) -> bool {
    if lhs.len() != rhs.len() {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in lhs.iter().zip(rhs.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(auth_mode: AuthMode) -> (Handshake, Handshake, LocalIdentity, LocalIdentity) {
        let server_id = LocalIdentity::generate();
        let client_id = LocalIdentity::generate();

        let mut client_peers = PeerSet::new();
        client_peers.authorize(server_id.public_key());
        let mut server_peers = PeerSet::new();
        server_peers.authorize(client_id.public_key());

        let client = Handshake::new(
            Role::Initiator,
            auth_mode,
            client_id.clone(),
            client_peers,
            NetConfig::default(),
        );
        let server = Handshake::new(
            Role::Responder,
            auth_mode,
            server_id.clone(),
            server_peers,
            NetConfig::default(),
        );
        (client, server, client_id, server_id)
    }

    #[test]
    fn one_way_handshake_converges() {
        vigil_test::init();

        let (mut client, mut server, _, _) = pair(AuthMode::OneWay);

        let hello = client.start().unwrap();
        let step = server.process(hello).unwrap();
        assert!(step.complete);

        let (accept, _) = step.replies.into_iter().next().unwrap();
        let step = client.process(accept).unwrap();
        assert!(step.complete);
        assert!(step.replies.is_empty());

        // both sessions agree: client seals, server opens
        let (mut client_session, peer) = client.into_session().unwrap();
        let (mut server_session, _) = server.into_session().unwrap();
        assert!(peer.is_some());

        let wire = client_session.seal(0x01, b"ping");
        let raw = crate::frame::RawFrame {
            header: wire[..4].try_into().unwrap(),
            body: wire[4..].to_vec(),
        };
        let frame = server_session.open(&raw).unwrap();
        assert_eq!(frame.payload, b"ping");
    }

    #[test]
    fn two_way_handshake_verifies_initiator() {
        vigil_test::init();

        let (mut client, mut server, _, _) = pair(AuthMode::TwoWay);

        let hello = client.start().unwrap();
        let step = server.process(hello).unwrap();
        assert!(!step.complete, "responder waits for the auth frame");

        let (accept, _) = step.replies.into_iter().next().unwrap();
        let step = client.process(accept).unwrap();
        assert!(step.complete);
        let (auth, encrypted) = step.replies.into_iter().next().unwrap();
        assert!(encrypted, "the auth frame travels under the session keys");

        let step = server.process(auth).unwrap();
        assert!(step.complete);
        assert!(server.into_session().is_some());
    }

    #[test]
    fn unauthorized_responder_is_rejected() {
        vigil_test::init();

        let server_id = LocalIdentity::generate();
        let client = Handshake::new(
            Role::Initiator,
            AuthMode::OneWay,
            LocalIdentity::generate(),
            PeerSet::new(), // nothing authorized
            NetConfig::default(),
        );
        let mut server = Handshake::new(
            Role::Responder,
            AuthMode::OneWay,
            server_id,
            PeerSet::new(),
            NetConfig::default(),
        );

        let mut client = client;
        let hello = client.start().unwrap();
        let step = server.process(hello).unwrap();
        let (accept, _) = step.replies.into_iter().next().unwrap();

        assert!(matches!(
            client.process(accept),
            Err(HandshakeError::UnknownPeer)
        ));
        assert_eq!(client.state(), State::Failed);
        assert!(client.into_session().is_none());
    }

    #[test]
    fn unknown_initiator_fails_two_way_auth() {
        vigil_test::init();

        let server_id = LocalIdentity::generate();
        let client_id = LocalIdentity::generate();

        let mut client_peers = PeerSet::new();
        client_peers.authorize(server_id.public_key());

        let mut client = Handshake::new(
            Role::Initiator,
            AuthMode::TwoWay,
            client_id,
            client_peers,
            NetConfig::default(),
        );
        // the server authorizes nobody
        let mut server = Handshake::new(
            Role::Responder,
            AuthMode::TwoWay,
            server_id,
            PeerSet::new(),
            NetConfig::default(),
        );

        let hello = client.start().unwrap();
        let step = server.process(hello).unwrap();
        let (accept, _) = step.replies.into_iter().next().unwrap();
        let step = client.process(accept).unwrap();
        let (auth, _) = step.replies.into_iter().next().unwrap();

        assert!(matches!(
            server.process(auth),
            Err(HandshakeError::UnknownPeer)
        ));
    }

    #[test]
    fn out_of_order_message_fails() {
        vigil_test::init();

        let (_, mut server, _, _) = pair(AuthMode::OneWay);
        let bogus = Frame::new(MSG_ACCEPT, vec![0u8; 96]);
        assert!(matches!(
            server.process(bogus),
            Err(HandshakeError::UnexpectedMessage(..))
        ));
    }
}
