//! The framed socket: handshake driving, encrypted frame exchange, and
//! scheduled rekeying over any async byte stream.

use futures::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::Instant;
use tokio_util::codec::FramedRead;
use tracing::{debug, trace, warn};

use crate::aead::{AeadError, InboundSession, OutboundSession};
use crate::frame::{Frame, FrameError, RawFrameCodec, HEADER_LEN};
use crate::handshake::{AuthMode, Handshake, HandshakeError, LocalIdentity, PeerSet, Role};
use crate::{NetConfig, HANDSHAKE_THRESHOLD, MSG_REKEY};

#[derive(Debug, Error)]
pub enum NetError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Aead(#[from] AeadError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("peer closed during handshake")]
    EarlyClose,
    #[error("user message type {0:#04x} collides with the handshake range")]
    ReservedType(u8),
    #[error("unexpected control frame {0:#04x} on an authed session")]
    UnexpectedControl(u8),
    #[error("connection closed")]
    Closed,
}

/// Connection lifecycle states.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Unconnected,
    HandshakeInProgress,
    Authed,
    Rekeying,
    Closed,
}

/// An authed connection, produced by [`FramedSocket::connect`] or
/// [`FramedSocket::accept`].
///
/// Split into halves for concurrent use: the per-direction AEAD contexts
/// are independent, so the read half owns inbound key material and the
/// write half outbound, and nothing is shared between the tasks.
pub struct FramedSocket<T> {
    reader: FrameReader<ReadHalf<T>>,
    writer: FrameWriter<WriteHalf<T>>,
    peer_static_key: Option<[u8; 32]>,
}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> FramedSocket<T> {
    /// Client side: drive the handshake as the initiator.
    pub async fn connect(
        io: T,
        identity: LocalIdentity,
        peers: PeerSet,
        auth_mode: AuthMode,
        config: NetConfig,
    ) -> Result<FramedSocket<T>, NetError> {
        Self::establish(io, Role::Initiator, identity, peers, auth_mode, config).await
    }

    /// Server side: drive the handshake as the responder.
    pub async fn accept(
        io: T,
        identity: LocalIdentity,
        peers: PeerSet,
        auth_mode: AuthMode,
        config: NetConfig,
    ) -> Result<FramedSocket<T>, NetError> {
        Self::establish(io, Role::Responder, identity, peers, auth_mode, config).await
    }

    async fn establish(
        io: T,
        role: Role,
        identity: LocalIdentity,
        peers: PeerSet,
        auth_mode: AuthMode,
        config: NetConfig,
    ) -> Result<FramedSocket<T>, NetError> {
        let (read_half, mut write_half) = tokio::io::split(io);
        let mut framed = FramedRead::new(read_half, RawFrameCodec::new());
        let mut handshake = Handshake::new(role, auth_mode, identity, peers, config);

        if let Some(hello) = handshake.start() {
            write_half.write_all(&hello.encode_plain()).await?;
        }

        loop {
            let raw = match framed.next().await {
                Some(raw) => raw?,
                None => return Err(NetError::EarlyClose),
            };

            // once the responder has derived its session, inbound
            // handshake frames (the two-way Auth) arrive sealed
            let frame = match handshake.session_mut() {
                Some(session) if role == Role::Responder => session.open(&raw)?,
                _ => {
                    let (&msg_type, payload) = raw.body.split_first().ok_or(FrameError::Runt)?;
                    Frame::new(msg_type, payload.to_vec())
                }
            };

            if frame.msg_type < HANDSHAKE_THRESHOLD {
                // user data before auth completes is a protocol violation
                warn!(msg_type = frame.msg_type, "user frame during handshake");
                return Err(NetError::UnexpectedControl(frame.msg_type));
            }

            let step = handshake.process(frame)?;
            // the moment our session side exists, the peer's next frames
            // arrive sealed and carry MACs
            if handshake.session_mut().is_some() {
                framed.decoder_mut().expect_mac(true);
            }
            for (reply, encrypted) in step.replies {
                let bytes = if encrypted {
                    handshake
                        .session_mut()
                        .expect("encrypted replies only exist once the session does")
                        .seal(reply.msg_type, &reply.payload)
                } else {
                    reply.encode_plain()
                };
                write_half.write_all(&bytes).await?;
            }
            if step.complete {
                break;
            }
        }

        let (session, peer_static_key) = handshake
            .into_session()
            .expect("loop exits only on completion");
        let (inbound, outbound) = session.split();
        framed.decoder_mut().expect_mac(true);

        debug!(?role, "framed socket established");
        Ok(FramedSocket {
            reader: FrameReader {
                framed,
                inbound,
                state: SessionState::Authed,
            },
            writer: FrameWriter {
                write: write_half,
                outbound,
                state: SessionState::Authed,
            },
            peer_static_key,
        })
    }

    /// The peer's verified long-term key: always present for the
    /// initiator, present for the responder in two-way mode.
    pub fn peer_static_key(&self) -> Option<[u8; 32]> {
        self.peer_static_key
    }

    /// Send one user message.
    pub async fn send(&mut self, msg_type: u8, payload: &[u8]) -> Result<(), NetError> {
        self.writer.send(msg_type, payload).await
    }

    /// Receive the next user message. Control frames (rekeys) are
    /// handled internally and never surface.
    pub async fn next(&mut self) -> Result<Frame, NetError> {
        self.reader.next_frame().await
    }

    /// Split into independently owned halves for the per-connection read
    /// task and write-serialized path.
    pub fn split(self) -> (FrameReader<ReadHalf<T>>, FrameWriter<WriteHalf<T>>) {
        (self.reader, self.writer)
    }
}

/// The read side: decrypts inbound frames, applies inbound rekeys.
pub struct FrameReader<R> {
    framed: FramedRead<R, RawFrameCodec>,
    inbound: InboundSession,
    state: SessionState,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The next user frame. Rekey frames are consumed transparently; a
    /// framing or AEAD failure closes the session and nothing surfaces
    /// above the transport.
    pub async fn next_frame(&mut self) -> Result<Frame, NetError> {
        loop {
            if self.state == SessionState::Closed {
                return Err(NetError::Closed);
            }
            let raw = match self.framed.next().await {
                Some(Ok(raw)) => raw,
                Some(Err(error)) => {
                    warn!(%error, "framing violation, closing");
                    self.state = SessionState::Closed;
                    return Err(error.into());
                }
                None => {
                    self.state = SessionState::Closed;
                    return Err(NetError::Closed);
                }
            };

            let frame = match self.inbound.open(&raw) {
                Ok(frame) => frame,
                Err(error) => {
                    warn!(%error, "aead failure, closing");
                    self.state = SessionState::Closed;
                    return Err(error.into());
                }
            };

            if frame.msg_type == MSG_REKEY {
                trace!("installing inbound rekey");
                self.inbound.process_rekey(&frame)?;
                continue;
            }
            if frame.msg_type >= HANDSHAKE_THRESHOLD {
                self.state = SessionState::Closed;
                return Err(NetError::UnexpectedControl(frame.msg_type));
            }
            return Ok(frame);
        }
    }
}

/// The write side: seals outbound frames, injecting scheduled rekeys
/// between messages (never inside one).
pub struct FrameWriter<W> {
    write: W,
    outbound: OutboundSession,
    state: SessionState,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub async fn send(&mut self, msg_type: u8, payload: &[u8]) -> Result<(), NetError> {
        if msg_type >= HANDSHAKE_THRESHOLD {
            return Err(NetError::ReservedType(msg_type));
        }

        let frame_len = HEADER_LEN + 1 + payload.len();
        if self.outbound.rekey_needed(frame_len) || self.outbound.time_rekey_due(Instant::now()) {
            self.state = SessionState::Rekeying;
            let rekey = self.outbound.start_rekey();
            self.write.write_all(&rekey).await?;
            self.state = SessionState::Authed;
        }

        let wire = self.outbound.seal(msg_type, payload);
        self.write.write_all(&wire).await?;
        Ok(())
    }

    /// Flush and close the write side.
    pub async fn shutdown(&mut self) -> Result<(), NetError> {
        self.state = SessionState::Closed;
        self.write.shutdown().await?;
        Ok(())
    }
}
