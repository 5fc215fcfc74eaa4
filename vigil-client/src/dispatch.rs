//! Command dispatch: one typed request in, one reply out, with the
//! broadcast side effects launched only after the ack is on the wire.

use std::sync::Arc;

use tracing::{debug, warn};

use vigil_mempool::parser::{ParserEvent, ParserHandle};
use vigil_mempool::tracker::RequestId;
use vigil_mempool::SubscriberId;

use vigil_node::NodeBroadcaster;
use vigil_node::NodeStatus;

use crate::messages::{ClientNotification, ClientReply, ClientRequest, ReplyBody, RequestBody};
use crate::subscriber::SubscriberRegistry;
use crate::wallet_view::{ConfirmedView, WalletView};

/// Error codes for `ReplyBody::Error`.
pub const ERR_UNKNOWN_SUBSCRIBER: u8 = 1;
pub const ERR_EMPTY_BROADCAST: u8 = 2;

/// A broadcast to launch after the reply has been written. The ordering
/// guarantee (the request ack precedes any outcome notification) falls
/// out of this two-step shape.
pub struct PendingBroadcast {
    request_id: RequestId,
    raw_txs: Vec<Vec<u8>>,
}

pub struct CommandDispatcher {
    registry: Arc<SubscriberRegistry>,
    parser: ParserHandle,
    broadcaster: Arc<NodeBroadcaster>,
    confirmed: Arc<dyn ConfirmedView>,
}

impl CommandDispatcher {
    pub fn new(
        registry: Arc<SubscriberRegistry>,
        parser: ParserHandle,
        broadcaster: Arc<NodeBroadcaster>,
        confirmed: Arc<dyn ConfirmedView>,
    ) -> CommandDispatcher {
        CommandDispatcher {
            registry,
            parser,
            broadcaster,
            confirmed,
        }
    }

    /// Handle one request. The reply must reach the client before any
    /// returned [`PendingBroadcast`] is launched.
    pub fn handle(
        &self,
        subscriber: SubscriberId,
        request: ClientRequest,
    ) -> (ClientReply, Option<PendingBroadcast>) {
        let reference_id = request.reference_id;
        let reply = |body| ClientReply { reference_id, body };

        match request.body {
            RequestBody::WatchAddrs { scraddrs } => {
                if !self.registry.watch(subscriber, &scraddrs) {
                    return (
                        reply(ReplyBody::Error {
                            code: ERR_UNKNOWN_SUBSCRIBER,
                            message: "unknown subscriber".to_owned(),
                        }),
                        None,
                    );
                }
                debug!(%subscriber, count = scraddrs.len(), "registered addresses");
                // registration-done signal, queued behind the ack
                self.registry
                    .notify_one(subscriber, ClientNotification::Refresh { scraddrs });
                (reply(ReplyBody::Ack), None)
            }

            RequestBody::GetBalance { scraddrs } => {
                let view = self.view();
                let set = if scraddrs.is_empty() {
                    self.registry.watched(subscriber)
                } else {
                    scraddrs.into_iter().collect()
                };
                (reply(ReplyBody::Balance(view.balance(&set))), None)
            }

            RequestBody::GetLedger { scraddr } => {
                let view = self.view();
                (
                    reply(ReplyBody::Ledger {
                        entries: view.ledger(&scraddr),
                    }),
                    None,
                )
            }

            RequestBody::GetSpendableZc => {
                let view = self.view();
                let watched = self.registry.watched(subscriber);
                (
                    reply(ReplyBody::SpendableZc {
                        utxos: view.spendable_zc_outputs(&watched),
                    }),
                    None,
                )
            }

            RequestBody::Broadcast {
                request_id,
                raw_txs,
            } => {
                if raw_txs.is_empty() {
                    return (
                        reply(ReplyBody::Error {
                            code: ERR_EMPTY_BROADCAST,
                            message: "empty broadcast".to_owned(),
                        }),
                        None,
                    );
                }
                let request_id = if request_id.is_empty() {
                    RequestId::synthesize()
                } else {
                    RequestId(request_id)
                };
                self.registry.bind_request(request_id.clone(), subscriber);
                (
                    reply(ReplyBody::Ack),
                    Some(PendingBroadcast {
                        request_id,
                        raw_txs,
                    }),
                )
            }

            RequestBody::GetNodeStatus => {
                let status = self
                    .registry
                    .last_node_status()
                    .unwrap_or_else(NodeStatus::disconnected);
                (reply(ReplyBody::NodeStatus(status)), None)
            }
        }
    }

    /// Launch a broadcast: the tracker registration and node submission
    /// run on the broadcaster, the staging group enters the parser.
    pub fn launch(&self, pending: PendingBroadcast) {
        let PendingBroadcast {
            request_id,
            raw_txs,
        } = pending;

        let broadcaster = self.broadcaster.clone();
        let parser = self.parser.clone();
        tokio::spawn(async move {
            broadcaster
                .broadcast_batch(request_id.clone(), raw_txs.clone())
                .await;
            if let Err(error) = parser
                .send(ParserEvent::NewZcBatchFromClient {
                    raws: raw_txs,
                    request_id,
                })
                .await
            {
                warn!(%error, "parser gone, dropping broadcast group");
            }
        });
    }

    /// A wallet view over the current committed snapshot.
    pub fn view(&self) -> WalletView {
        WalletView::new(self.parser.current_snapshot(), self.confirmed.clone())
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }
}
