//! Length-prefixed framing.
//!
//! Wire layout, for encrypted frames:
//!
//! ```text
//! | 4-byte LE payload-length | 1-byte msg-type | payload-body | 16-byte MAC |
//! ```
//!
//! `payload-length` counts the msg-type byte plus the body, excluding the
//! MAC. Handshake frames sent before a session is established use the
//! same layout without the MAC. The codec only performs length framing;
//! interpretation (and decryption) happens above it.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum allowed payload length. A frame claiming more is a fatal
/// protocol violation.
pub const MAX_FRAME: u32 = 1 << 30;

/// The AEAD tag length appended to encrypted frames.
pub const MAC_LEN: usize = 16;

/// The length-prefix size.
pub const HEADER_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame length {0} exceeds MAX_FRAME")]
    Oversized(u32),
    #[error("frame too short to carry a message type")]
    Runt,
}

/// A decrypted (or never-encrypted) logical message.
#[derive(Clone, Eq, PartialEq)]
pub struct Frame {
    pub msg_type: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(msg_type: u8, payload: Vec<u8>) -> Frame {
        Frame { msg_type, payload }
    }

    /// The wire size of this frame, unencrypted: header + type + body.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + 1 + self.payload.len()
    }

    /// Encode without a MAC (handshake phase).
    pub fn encode_plain(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.wire_len());
        out.extend_from_slice(&((self.payload.len() + 1) as u32).to_le_bytes());
        out.push(self.msg_type);
        out.extend_from_slice(&self.payload);
        out
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("msg_type", &format_args!("{:#04x}", self.msg_type))
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// One length-delimited unit off the wire, ciphertext not yet touched.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RawFrame {
    /// The length prefix exactly as received; the AEAD associated data.
    pub header: [u8; HEADER_LEN],
    /// msg-type + body (+ MAC when the peer is encrypting).
    pub body: Vec<u8>,
}

impl RawFrame {
    /// The payload length the header claims (type + body, less MAC).
    pub fn claimed_len(&self) -> u32 {
        LittleEndian::read_u32(&self.header)
    }
}

/// A codec producing [`RawFrame`]s from byte streams and vice versa.
///
/// Decoding retains partial frames verbatim for the next read; an
/// oversized length header is a fatal error that poisons the stream.
pub struct RawFrameCodec {
    state: DecodeState,
    /// Whether inbound frames carry a MAC (post-handshake).
    expect_mac: bool,
    metrics_label: Option<String>,
}

#[derive(Debug)]
enum DecodeState {
    Head,
    Body { header: [u8; HEADER_LEN], len: usize },
}

impl RawFrameCodec {
    pub fn new() -> RawFrameCodec {
        RawFrameCodec {
            state: DecodeState::Head,
            expect_mac: false,
            metrics_label: None,
        }
    }

    /// Reconfigure after the handshake completes: inbound frames now
    /// carry a MAC.
    pub fn expect_mac(&mut self, expect: bool) {
        self.expect_mac = expect;
    }

    pub fn with_metrics_label(mut self, label: String) -> Self {
        self.metrics_label = Some(label);
        self
    }
}

impl Default for RawFrameCodec {
    fn default() -> Self {
        RawFrameCodec::new()
    }
}

impl Decoder for RawFrameCodec {
    type Item = RawFrame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.state {
            DecodeState::Head => {
                if src.len() < HEADER_LEN {
                    // partial header; wait for more bytes
                    return Ok(None);
                }
                let mut header = [0u8; HEADER_LEN];
                header.copy_from_slice(&src[..HEADER_LEN]);
                let claimed = LittleEndian::read_u32(&header);
                if claimed > MAX_FRAME {
                    return Err(FrameError::Oversized(claimed));
                }
                if claimed == 0 {
                    return Err(FrameError::Runt);
                }
                src.advance(HEADER_LEN);

                let len = claimed as usize + if self.expect_mac { MAC_LEN } else { 0 };
                src.reserve(len + HEADER_LEN);
                self.state = DecodeState::Body { header, len };
                self.decode(src)
            }
            DecodeState::Body { header, len } => {
                if src.len() < len {
                    // partial body is retained for the next read
                    return Ok(None);
                }
                let body = src.split_to(len).to_vec();
                self.state = DecodeState::Head;

                if let Some(label) = self.metrics_label.clone() {
                    metrics::counter!("net.bytes.read", "addr" => label)
                        .increment((HEADER_LEN + len) as u64);
                }
                Ok(Some(RawFrame { header, body }))
            }
        }
    }
}

impl Encoder<Vec<u8>> for RawFrameCodec {
    type Error = FrameError;

    /// Encodes pre-built wire bytes (the AEAD layer constructs complete
    /// frames, header included).
    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if let Some(label) = self.metrics_label.clone() {
            metrics::counter!("net.bytes.written", "addr" => label).increment(item.len() as u64);
        }
        dst.reserve(item.len());
        dst.put_slice(&item);
        Ok(())
    }
}
