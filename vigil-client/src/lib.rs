//! The client-facing side of the service: subscriber registration,
//! notification queues, the wallet view over a committed snapshot, and
//! command dispatch for the framed transport.

pub mod connection;
pub mod dispatch;
pub mod messages;
pub mod subscriber;
pub mod wallet_view;

pub use dispatch::CommandDispatcher;
pub use messages::{
    BroadcastErrorCode, ClientNotification, ClientReply, ClientRequest, NotificationCategory,
    ReplyBody, RequestBody,
};
pub use subscriber::SubscriberRegistry;
pub use wallet_view::{BalanceReport, ConfirmedView, LedgerEntry, WalletView};

/// Per-subscriber notification queue depth. A client that cannot drain
/// this many entries is treated as gone; at-least-once semantics cover
/// redelivery on reconnect.
pub const NOTIFICATION_QUEUE_DEPTH: usize = 256;
