//! The typed application messages carried over the framed transport.
//!
//! Every request carries a client-chosen `reference_id` that its reply
//! echoes; notifications carry a service-assigned category instead.
//! The encodings reuse the chain crate's wire primitives.

use std::io::{self, Cursor, Read};

use vigil_chain::serialization::{BitcoinDeserialize, BitcoinSerialize, SerializationError};
use vigil_chain::transaction::Hash;
use vigil_chain::transparent::ScriptAddr;
use vigil_chain::Amount;

use vigil_mempool::notification::{SubscriberNotification, ZcEntry};
use vigil_mempool::tracker::{HashState, RejectCode};

use vigil_node::NodeStatus;

use crate::wallet_view::{BalanceReport, LedgerEntry};

/// Frame msg-types for the application layer.
pub const MSG_TYPE_REQUEST: u8 = 0x01;
pub const MSG_TYPE_REPLY: u8 = 0x02;
pub const MSG_TYPE_NOTIFICATION: u8 = 0x03;

/// The notification categories a client can receive.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NotificationCategory {
    NewBlock = 1,
    ZcAccept = 2,
    ZcInvalidate = 3,
    NodeStatus = 4,
    Ready = 5,
    Refresh = 6,
    Error = 7,
}

/// The client-visible broadcast error codes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BroadcastErrorCode {
    ZcBroadcastAlreadyInMempool,
    ZcBroadcastAlreadyInChain,
    ZcBroadcastVerifyRejected,
    ZcBroadcastError(u8),
    P2pRejectInsufficientFee,
    Timeout,
}

impl BroadcastErrorCode {
    /// Map a terminal tracker state to the client error code, `None` for
    /// the success terminal.
    pub fn from_hash_state(state: HashState) -> Option<BroadcastErrorCode> {
        match state {
            HashState::SeenInSnapshot => None,
            HashState::AlreadyInMempool => Some(BroadcastErrorCode::ZcBroadcastAlreadyInMempool),
            HashState::AlreadyInChain => Some(BroadcastErrorCode::ZcBroadcastAlreadyInChain),
            HashState::VerifyRejected => Some(BroadcastErrorCode::ZcBroadcastVerifyRejected),
            HashState::RejectedByNode(code) if code == RejectCode::INSUFFICIENT_FEE => {
                Some(BroadcastErrorCode::P2pRejectInsufficientFee)
            }
            HashState::RejectedByNode(code) => Some(BroadcastErrorCode::ZcBroadcastError(code.0)),
            HashState::TimedOut => Some(BroadcastErrorCode::Timeout),
            HashState::Submitted | HashState::AcceptedByNode => None,
        }
    }

    fn wire_code(&self) -> (u8, u8) {
        match self {
            BroadcastErrorCode::ZcBroadcastAlreadyInMempool => (1, 0),
            BroadcastErrorCode::ZcBroadcastAlreadyInChain => (2, 0),
            BroadcastErrorCode::ZcBroadcastVerifyRejected => (3, 0),
            BroadcastErrorCode::ZcBroadcastError(code) => (4, *code),
            BroadcastErrorCode::P2pRejectInsufficientFee => (5, 0),
            BroadcastErrorCode::Timeout => (6, 0),
        }
    }

    fn from_wire_code(kind: u8, detail: u8) -> Result<BroadcastErrorCode, SerializationError> {
        Ok(match kind {
            1 => BroadcastErrorCode::ZcBroadcastAlreadyInMempool,
            2 => BroadcastErrorCode::ZcBroadcastAlreadyInChain,
            3 => BroadcastErrorCode::ZcBroadcastVerifyRejected,
            4 => BroadcastErrorCode::ZcBroadcastError(detail),
            5 => BroadcastErrorCode::P2pRejectInsufficientFee,
            6 => BroadcastErrorCode::Timeout,
            _ => return Err(SerializationError::Parse("unknown broadcast error code")),
        })
    }
}

/// What a client can ask the service to do.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RequestBody {
    /// Register interest in script addresses.
    WatchAddrs { scraddrs: Vec<ScriptAddr> },
    /// Balances over the watched (or given) address set.
    GetBalance { scraddrs: Vec<ScriptAddr> },
    /// The per-address TxIO ledger.
    GetLedger { scraddr: ScriptAddr },
    /// Available mempool UTXOs on watched addresses.
    GetSpendableZc,
    /// Broadcast raw transactions under a caller-chosen request id (an
    /// empty id asks the service to synthesize one).
    Broadcast {
        request_id: Vec<u8>,
        raw_txs: Vec<Vec<u8>>,
    },
    /// The node's connection and sync state.
    GetNodeStatus,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientRequest {
    pub reference_id: u32,
    pub body: RequestBody,
}

/// Reply payloads, echoing the request's `reference_id`.
#[derive(Clone, Debug, PartialEq)]
pub enum ReplyBody {
    Ack,
    Balance(BalanceReport),
    Ledger { entries: Vec<LedgerEntry> },
    SpendableZc { utxos: Vec<LedgerEntry> },
    NodeStatus(NodeStatus),
    Error { code: u8, message: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClientReply {
    pub reference_id: u32,
    pub body: ReplyBody,
}

/// Everything the service pushes without being asked.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientNotification {
    NewBlock {
        height: u32,
    },
    ZcAccepted {
        sequence: u64,
        entries: Vec<ZcEntry>,
    },
    ZcInvalidated {
        sequence: u64,
        hashes: Vec<Hash>,
    },
    NodeStatus(NodeStatus),
    /// The intake pipeline is live.
    Ready {
        height: u32,
    },
    /// Registration finished for the given addresses.
    Refresh {
        scraddrs: Vec<ScriptAddr>,
    },
    /// A broadcast outcome for one hash of one request.
    BroadcastError {
        request_id: Vec<u8>,
        hash: Hash,
        code: BroadcastErrorCode,
    },
    /// The success counterpart: the ZC reached a committed snapshot.
    BroadcastSuccess {
        request_id: Vec<u8>,
        hash: Hash,
    },
}

impl ClientNotification {
    pub fn category(&self) -> NotificationCategory {
        match self {
            ClientNotification::NewBlock { .. } => NotificationCategory::NewBlock,
            ClientNotification::ZcAccepted { .. } => NotificationCategory::ZcAccept,
            ClientNotification::ZcInvalidated { .. } => NotificationCategory::ZcInvalidate,
            ClientNotification::NodeStatus(_) => NotificationCategory::NodeStatus,
            ClientNotification::Ready { .. } => NotificationCategory::Ready,
            ClientNotification::Refresh { .. } => NotificationCategory::Refresh,
            ClientNotification::BroadcastError { .. } => NotificationCategory::Error,
            ClientNotification::BroadcastSuccess { .. } => NotificationCategory::ZcAccept,
        }
    }

    pub fn from_subscriber_notification(n: SubscriberNotification) -> ClientNotification {
        match n {
            SubscriberNotification::ZcAccepted { sequence, entries } => {
                ClientNotification::ZcAccepted { sequence, entries }
            }
            SubscriberNotification::ZcInvalidated { sequence, hashes } => {
                ClientNotification::ZcInvalidated { sequence, hashes }
            }
        }
    }
}

// ---- wire encodings ----

fn write_scraddr<W: io::Write>(scraddr: &ScriptAddr, mut w: W) -> Result<(), io::Error> {
    w.write_all(&scraddr.to_bytes())
}

fn read_scraddr<R: Read>(mut r: R) -> Result<ScriptAddr, SerializationError> {
    let mut bytes = [0u8; 21];
    r.read_exact(&mut bytes)?;
    ScriptAddr::from_bytes(bytes).ok_or(SerializationError::Parse("bad scraddr tag"))
}

impl BitcoinSerialize for ClientRequest {
    fn bitcoin_serialize<W: io::Write>(&self, mut w: W) -> Result<(), io::Error> {
        self.reference_id.bitcoin_serialize(&mut w)?;
        match &self.body {
            RequestBody::WatchAddrs { scraddrs } => {
                w.write_all(&[1])?;
                vigil_chain::CompactInt::from(scraddrs.len()).bitcoin_serialize(&mut w)?;
                for scraddr in scraddrs {
                    write_scraddr(scraddr, &mut w)?;
                }
            }
            RequestBody::GetBalance { scraddrs } => {
                w.write_all(&[2])?;
                vigil_chain::CompactInt::from(scraddrs.len()).bitcoin_serialize(&mut w)?;
                for scraddr in scraddrs {
                    write_scraddr(scraddr, &mut w)?;
                }
            }
            RequestBody::GetLedger { scraddr } => {
                w.write_all(&[3])?;
                write_scraddr(scraddr, &mut w)?;
            }
            RequestBody::GetSpendableZc => w.write_all(&[4])?,
            RequestBody::Broadcast {
                request_id,
                raw_txs,
            } => {
                w.write_all(&[5])?;
                request_id.bitcoin_serialize(&mut w)?;
                raw_txs.bitcoin_serialize(&mut w)?;
            }
            RequestBody::GetNodeStatus => w.write_all(&[6])?,
        }
        Ok(())
    }
}

impl BitcoinDeserialize for ClientRequest {
    fn bitcoin_deserialize<R: Read>(mut r: R) -> Result<Self, SerializationError> {
        let reference_id = u32::bitcoin_deserialize(&mut r)?;
        let kind = u8::bitcoin_deserialize(&mut r)?;
        let body = match kind {
            1 | 2 => {
                let count = vigil_chain::CompactInt::bitcoin_deserialize(&mut r)?.value() as usize;
                let mut scraddrs = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    scraddrs.push(read_scraddr(&mut r)?);
                }
                if kind == 1 {
                    RequestBody::WatchAddrs { scraddrs }
                } else {
                    RequestBody::GetBalance { scraddrs }
                }
            }
            3 => RequestBody::GetLedger {
                scraddr: read_scraddr(&mut r)?,
            },
            4 => RequestBody::GetSpendableZc,
            5 => RequestBody::Broadcast {
                request_id: <Vec<u8>>::bitcoin_deserialize(&mut r)?,
                raw_txs: <Vec<Vec<u8>>>::bitcoin_deserialize(&mut r)?,
            },
            6 => RequestBody::GetNodeStatus,
            _ => return Err(SerializationError::Parse("unknown request kind")),
        };
        Ok(ClientRequest { reference_id, body })
    }
}

impl ClientRequest {
    pub fn decode(payload: &[u8]) -> Result<ClientRequest, SerializationError> {
        ClientRequest::bitcoin_deserialize(Cursor::new(payload))
    }

    pub fn encode(&self) -> Vec<u8> {
        self.bitcoin_serialize_to_vec()
            .expect("in-memory serialization never fails")
    }
}

fn write_ledger_entries<W: io::Write>(
    entries: &[LedgerEntry],
    mut w: W,
) -> Result<(), io::Error> {
    vigil_chain::CompactInt::from(entries.len()).bitcoin_serialize(&mut w)?;
    for entry in entries {
        entry.tx_hash.bitcoin_serialize(&mut w)?;
        entry.value.bitcoin_serialize(&mut w)?;
        write_scraddr(&entry.scraddr, &mut w)?;
        let flags = (entry.credit as u8) | ((entry.zc as u8) << 1) | ((entry.spent as u8) << 2);
        w.write_all(&[flags])?;
    }
    Ok(())
}

fn read_ledger_entries<R: Read>(mut r: R) -> Result<Vec<LedgerEntry>, SerializationError> {
    let count = vigil_chain::CompactInt::bitcoin_deserialize(&mut r)?.value() as usize;
    let mut entries = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let tx_hash = Hash::bitcoin_deserialize(&mut r)?;
        let value = Amount::bitcoin_deserialize(&mut r)?;
        let scraddr = read_scraddr(&mut r)?;
        let flags = u8::bitcoin_deserialize(&mut r)?;
        entries.push(LedgerEntry {
            tx_hash,
            value,
            scraddr,
            credit: flags & 1 != 0,
            zc: flags & 2 != 0,
            spent: flags & 4 != 0,
        });
    }
    Ok(entries)
}

impl BitcoinSerialize for ClientReply {
    fn bitcoin_serialize<W: io::Write>(&self, mut w: W) -> Result<(), io::Error> {
        self.reference_id.bitcoin_serialize(&mut w)?;
        match &self.body {
            ReplyBody::Ack => w.write_all(&[1])?,
            ReplyBody::Balance(report) => {
                w.write_all(&[2])?;
                report.full.bitcoin_serialize(&mut w)?;
                report.spendable.bitcoin_serialize(&mut w)?;
                report.unconfirmed.bitcoin_serialize(&mut w)?;
            }
            ReplyBody::Ledger { entries } => {
                w.write_all(&[3])?;
                write_ledger_entries(entries, &mut w)?;
            }
            ReplyBody::SpendableZc { utxos } => {
                w.write_all(&[4])?;
                write_ledger_entries(utxos, &mut w)?;
            }
            ReplyBody::NodeStatus(status) => {
                w.write_all(&[5])?;
                status.connected.bitcoin_serialize(&mut w)?;
                status.synced.bitcoin_serialize(&mut w)?;
                status.height.bitcoin_serialize(&mut w)?;
            }
            ReplyBody::Error { code, message } => {
                w.write_all(&[6, *code])?;
                message.bitcoin_serialize(&mut w)?;
            }
        }
        Ok(())
    }
}

impl BitcoinDeserialize for ClientReply {
    fn bitcoin_deserialize<R: Read>(mut r: R) -> Result<Self, SerializationError> {
        let reference_id = u32::bitcoin_deserialize(&mut r)?;
        let kind = u8::bitcoin_deserialize(&mut r)?;
        let body = match kind {
            1 => ReplyBody::Ack,
            2 => ReplyBody::Balance(BalanceReport {
                full: Amount::bitcoin_deserialize(&mut r)?,
                spendable: Amount::bitcoin_deserialize(&mut r)?,
                unconfirmed: Amount::bitcoin_deserialize(&mut r)?,
            }),
            3 => ReplyBody::Ledger {
                entries: read_ledger_entries(&mut r)?,
            },
            4 => ReplyBody::SpendableZc {
                utxos: read_ledger_entries(&mut r)?,
            },
            5 => ReplyBody::NodeStatus(NodeStatus {
                connected: bool::bitcoin_deserialize(&mut r)?,
                synced: bool::bitcoin_deserialize(&mut r)?,
                height: u32::bitcoin_deserialize(&mut r)?,
            }),
            6 => {
                let code = u8::bitcoin_deserialize(&mut r)?;
                let message = String::bitcoin_deserialize(&mut r)?;
                ReplyBody::Error { code, message }
            }
            _ => return Err(SerializationError::Parse("unknown reply kind")),
        };
        Ok(ClientReply { reference_id, body })
    }
}

impl ClientReply {
    pub fn decode(payload: &[u8]) -> Result<ClientReply, SerializationError> {
        ClientReply::bitcoin_deserialize(Cursor::new(payload))
    }

    pub fn encode(&self) -> Vec<u8> {
        self.bitcoin_serialize_to_vec()
            .expect("in-memory serialization never fails")
    }
}

impl BitcoinSerialize for ClientNotification {
    fn bitcoin_serialize<W: io::Write>(&self, mut w: W) -> Result<(), io::Error> {
        w.write_all(&[self.category() as u8])?;
        match self {
            ClientNotification::NewBlock { height } => height.bitcoin_serialize(&mut w)?,
            ClientNotification::ZcAccepted { sequence, entries } => {
                w.write_all(&[1])?;
                sequence.bitcoin_serialize(&mut w)?;
                vigil_chain::CompactInt::from(entries.len()).bitcoin_serialize(&mut w)?;
                for entry in entries {
                    entry.hash.bitcoin_serialize(&mut w)?;
                    vigil_chain::CompactInt::from(entry.scraddrs.len())
                        .bitcoin_serialize(&mut w)?;
                    for scraddr in &entry.scraddrs {
                        write_scraddr(scraddr, &mut w)?;
                    }
                }
            }
            ClientNotification::ZcInvalidated { sequence, hashes } => {
                sequence.bitcoin_serialize(&mut w)?;
                hashes.bitcoin_serialize(&mut w)?;
            }
            ClientNotification::NodeStatus(status) => {
                status.connected.bitcoin_serialize(&mut w)?;
                status.synced.bitcoin_serialize(&mut w)?;
                status.height.bitcoin_serialize(&mut w)?;
            }
            ClientNotification::Ready { height } => height.bitcoin_serialize(&mut w)?,
            ClientNotification::Refresh { scraddrs } => {
                vigil_chain::CompactInt::from(scraddrs.len()).bitcoin_serialize(&mut w)?;
                for scraddr in scraddrs {
                    write_scraddr(scraddr, &mut w)?;
                }
            }
            ClientNotification::BroadcastError {
                request_id,
                hash,
                code,
            } => {
                request_id.bitcoin_serialize(&mut w)?;
                hash.bitcoin_serialize(&mut w)?;
                let (kind, detail) = code.wire_code();
                w.write_all(&[kind, detail])?;
            }
            ClientNotification::BroadcastSuccess { request_id, hash } => {
                w.write_all(&[2])?;
                request_id.bitcoin_serialize(&mut w)?;
                hash.bitcoin_serialize(&mut w)?;
                w.write_all(&[0, 0])?;
            }
        }
        Ok(())
    }
}

impl BitcoinDeserialize for ClientNotification {
    fn bitcoin_deserialize<R: Read>(mut r: R) -> Result<Self, SerializationError> {
        let category = u8::bitcoin_deserialize(&mut r)?;
        Ok(match category {
            1 => ClientNotification::NewBlock {
                height: u32::bitcoin_deserialize(&mut r)?,
            },
            2 => {
                let marker = u8::bitcoin_deserialize(&mut r)?;
                match marker {
                    1 => {
                        let sequence = u64::bitcoin_deserialize(&mut r)?;
                        let count =
                            vigil_chain::CompactInt::bitcoin_deserialize(&mut r)?.value() as usize;
                        let mut entries = Vec::with_capacity(count.min(1024));
                        for _ in 0..count {
                            let hash = Hash::bitcoin_deserialize(&mut r)?;
                            let addr_count =
                                vigil_chain::CompactInt::bitcoin_deserialize(&mut r)?.value()
                                    as usize;
                            let mut scraddrs = std::collections::BTreeSet::new();
                            for _ in 0..addr_count {
                                scraddrs.insert(read_scraddr(&mut r)?);
                            }
                            entries.push(ZcEntry { hash, scraddrs });
                        }
                        ClientNotification::ZcAccepted { sequence, entries }
                    }
                    2 => {
                        let request_id = <Vec<u8>>::bitcoin_deserialize(&mut r)?;
                        let hash = Hash::bitcoin_deserialize(&mut r)?;
                        let kind = u8::bitcoin_deserialize(&mut r)?;
                        let detail = u8::bitcoin_deserialize(&mut r)?;
                        if kind == 0 {
                            ClientNotification::BroadcastSuccess { request_id, hash }
                        } else {
                            ClientNotification::BroadcastError {
                                request_id,
                                hash,
                                code: BroadcastErrorCode::from_wire_code(kind, detail)?,
                            }
                        }
                    }
                    _ => return Err(SerializationError::Parse("unknown zc-accept marker")),
                }
            }
            3 => ClientNotification::ZcInvalidated {
                sequence: u64::bitcoin_deserialize(&mut r)?,
                hashes: <Vec<Hash>>::bitcoin_deserialize(&mut r)?,
            },
            4 => ClientNotification::NodeStatus(NodeStatus {
                connected: bool::bitcoin_deserialize(&mut r)?,
                synced: bool::bitcoin_deserialize(&mut r)?,
                height: u32::bitcoin_deserialize(&mut r)?,
            }),
            5 => ClientNotification::Ready {
                height: u32::bitcoin_deserialize(&mut r)?,
            },
            6 => {
                let count = vigil_chain::CompactInt::bitcoin_deserialize(&mut r)?.value() as usize;
                let mut scraddrs = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    scraddrs.push(read_scraddr(&mut r)?);
                }
                ClientNotification::Refresh { scraddrs }
            }
            7 => {
                let request_id = <Vec<u8>>::bitcoin_deserialize(&mut r)?;
                let hash = Hash::bitcoin_deserialize(&mut r)?;
                let kind = u8::bitcoin_deserialize(&mut r)?;
                let detail = u8::bitcoin_deserialize(&mut r)?;
                ClientNotification::BroadcastError {
                    request_id,
                    hash,
                    code: BroadcastErrorCode::from_wire_code(kind, detail)?,
                }
            }
            _ => return Err(SerializationError::Parse("unknown notification category")),
        })
    }
}

impl ClientNotification {
    pub fn decode(payload: &[u8]) -> Result<ClientNotification, SerializationError> {
        ClientNotification::bitcoin_deserialize(Cursor::new(payload))
    }

    pub fn encode(&self) -> Vec<u8> {
        self.bitcoin_serialize_to_vec()
            .expect("in-memory serialization never fails")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        vigil_test::init();

        let request = ClientRequest {
            reference_id: 42,
            body: RequestBody::Broadcast {
                request_id: b"req-1".to_vec(),
                raw_txs: vec![vec![0xAA; 20], vec![0xBB; 5]],
            },
        };
        let decoded = ClientRequest::decode(&request.encode()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn reply_round_trip_echoes_reference_id() {
        vigil_test::init();

        let reply = ClientReply {
            reference_id: 7,
            body: ReplyBody::Balance(BalanceReport {
                full: Amount::from_btc(10),
                spendable: Amount::from_btc(7),
                unconfirmed: Amount::from_btc(3),
            }),
        };
        let decoded = ClientReply::decode(&reply.encode()).unwrap();
        assert_eq!(decoded, reply);
        assert_eq!(decoded.reference_id, 7);
    }

    #[test]
    fn notification_categories_are_stable() {
        vigil_test::init();

        let n = ClientNotification::ZcInvalidated {
            sequence: 3,
            hashes: vec![Hash([1u8; 32])],
        };
        assert_eq!(n.category(), NotificationCategory::ZcInvalidate);
        let decoded = ClientNotification::decode(&n.encode()).unwrap();
        assert_eq!(decoded, n);
    }

    #[test]
    fn broadcast_error_round_trip() {
        vigil_test::init();

        let n = ClientNotification::BroadcastError {
            request_id: b"r".to_vec(),
            hash: Hash([9u8; 32]),
            code: BroadcastErrorCode::P2pRejectInsufficientFee,
        };
        let decoded = ClientNotification::decode(&n.encode()).unwrap();
        assert_eq!(decoded, n);
    }

    #[test]
    fn watch_addrs_round_trip() {
        vigil_test::init();

        let request = ClientRequest {
            reference_id: 1,
            body: RequestBody::WatchAddrs {
                scraddrs: vec![ScriptAddr::P2pkh([7u8; 20]), ScriptAddr::P2wpkh([8u8; 20])],
            },
        };
        let decoded = ClientRequest::decode(&request.encode()).unwrap();
        assert_eq!(decoded, request);
    }
}
