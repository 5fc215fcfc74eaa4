//! The per-connection task: one framed socket, one subscriber.
//!
//! Reads requests off the decrypted frame stream, writes replies and
//! queued notifications through the single write path. A request's ack
//! is always written before its broadcast side effects launch, so no
//! outcome notification can overtake it.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use vigil_net::socket::{FramedSocket, NetError};

use crate::dispatch::CommandDispatcher;
use crate::messages::{ClientRequest, MSG_TYPE_NOTIFICATION, MSG_TYPE_REPLY, MSG_TYPE_REQUEST};

/// Serve one authed connection until the client goes away. Registers a
/// subscriber on entry and always unregisters on exit; a disconnect
/// tears down only this subscriber's stream.
pub async fn serve<T>(socket: FramedSocket<T>, dispatcher: Arc<CommandDispatcher>)
where
    T: AsyncRead + AsyncWrite + Send + Unpin,
{
    let registry = dispatcher.registry().clone();
    let (subscriber, mut notifications) = registry.register();
    info!(%subscriber, "client connected");

    let (mut reader, mut writer) = socket.split();

    let result: Result<(), NetError> = async {
        loop {
            tokio::select! {
                frame = reader.next_frame() => {
                    let frame = frame?;
                    if frame.msg_type != MSG_TYPE_REQUEST {
                        debug!(msg_type = frame.msg_type, "ignoring non-request frame");
                        continue;
                    }
                    let request = match ClientRequest::decode(&frame.payload) {
                        Ok(request) => request,
                        Err(error) => {
                            warn!(%error, "undecodable request, closing");
                            break Ok(());
                        }
                    };

                    let (reply, pending) = dispatcher.handle(subscriber, request);
                    writer.send(MSG_TYPE_REPLY, &reply.encode()).await?;
                    // the ack is on the wire; side effects may start
                    if let Some(pending) = pending {
                        dispatcher.launch(pending);
                    }
                }
                notification = notifications.recv() => {
                    match notification {
                        Some(notification) => {
                            writer
                                .send(MSG_TYPE_NOTIFICATION, &notification.encode())
                                .await?;
                        }
                        None => break Ok(()),
                    }
                }
            }
        }
    }
    .await;

    match result {
        Ok(()) => info!(%subscriber, "client disconnected"),
        Err(error) => info!(%subscriber, %error, "client connection closed"),
    }
    registry.unregister(subscriber);
}
