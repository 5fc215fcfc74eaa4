//! Forwards node events into the parser's intake channel.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use vigil_mempool::parser::{ParserEvent, ParserHandle};

use crate::{NodeEvent, NodeStatus, P2pPort};

/// Receives node connection/sync state changes and block arrivals.
/// Implemented by the subscriber registry, which fans them out to every
/// client.
pub trait StatusSink: Send + Sync {
    fn node_status(&self, status: NodeStatus);

    fn new_block(&self, height: u32);
}

/// Run until the node's event stream or the parser goes away.
///
/// Node-originated ZCs enter the parser directly, bypassing the
/// broadcast tracker; inv announcements are resolved to transaction
/// content through `fetch_tx` first.
pub async fn run_event_pump(
    p2p: Arc<dyn P2pPort>,
    parser: ParserHandle,
    status_sink: Arc<dyn StatusSink>,
) {
    let mut events = p2p.subscribe_events();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "node event stream lagged");
                continue;
            }
            Err(RecvError::Closed) => {
                info!("node event stream closed");
                return;
            }
        };

        let forward = match event {
            NodeEvent::ZcPushed { raw } => Some(ParserEvent::NewZcFromNode { raw }),
            NodeEvent::Inv(hashes) => {
                // announcements we did not originate: pull the content
                let mut raws = Vec::new();
                for hash in hashes {
                    match p2p.fetch_tx(hash).await {
                        Ok(Some(raw)) => raws.push(raw),
                        Ok(None) => debug!(?hash, "inv for tx the node no longer has"),
                        Err(error) => warn!(%error, ?hash, "fetch_tx failed"),
                    }
                }
                for raw in raws {
                    if parser.send(ParserEvent::NewZcFromNode { raw }).await.is_err() {
                        return;
                    }
                }
                None
            }
            NodeEvent::NewBlock { height, txids } => {
                status_sink.new_block(height);
                Some(ParserEvent::NewBlock {
                    confirmed_txids: txids,
                    reorged_raw_txs: Vec::new(),
                })
            }
            NodeEvent::NotFound(hash) => Some(ParserEvent::NodeGetDataMiss { hash }),
            NodeEvent::StatusChanged(status) => {
                debug!(?status, "node status changed");
                status_sink.node_status(status);
                None
            }
            NodeEvent::Reject { .. } => {
                // rejections are consumed by the broadcaster's own
                // event subscription
                None
            }
        };

        if let Some(event) = forward {
            if parser.send(event).await.is_err() {
                return;
            }
        }
    }
}
