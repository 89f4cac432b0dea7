//! Event notification protocol between a transport and the RPC layer.
//!
//! A transport reports lifecycle and I/O progress through a single
//! notification channel, registered once per transport. Each event is a
//! closed enum variant carrying its payload, so the payload shape is fixed
//! per event kind. Ordering is guaranteed only within one transport's
//! event stream: `Accept` precedes any `MsgReceived` on the accepted
//! child, `Disconnect` is delivered exactly once per connected lifetime,
//! and `Cleanup` is the final event before the transport is destroyed.

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::error::TransportError;
use crate::message::{Pollin, RequestInfo};
use crate::transport::Transport;

/// A tagged lifecycle or I/O event with its event-specific payload.
#[derive(Debug)]
pub enum TransportEvent {
    /// An outbound connect attempt succeeded.
    Connect,
    /// A new inbound connection spawned a child transport. Delivered on
    /// the listener; the receiver decides whether to retain the child.
    Accept(Arc<Transport>),
    /// A full RPC record was reassembled. The receiver takes ownership of
    /// the pollin; dropping it releases the buffers.
    MsgReceived(Pollin),
    /// A previously submitted message finished transmission.
    MsgSent,
    /// The backend is about to reply to `xid` and needs the program and
    /// procedure identity of the originating call. The handler completes
    /// `reply` within the callback.
    MapXidRequest {
        xid: u32,
        reply: oneshot::Sender<RequestInfo>,
    },
    /// The connection was lost or torn down. In-flight submissions on
    /// this transport have failed; the owner fails or retries them.
    Disconnect,
    /// The transport is about to be destroyed. Always the last event, and
    /// always preceded by `Disconnect` for a transport that connected.
    Cleanup,
    /// The I/O task driving this transport terminated. Informational,
    /// not retried.
    EventThreadDied,
}

impl TransportEvent {
    /// Stable name of the event kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportEvent::Connect => "connect",
            TransportEvent::Accept(_) => "accept",
            TransportEvent::MsgReceived(_) => "msg-received",
            TransportEvent::MsgSent => "msg-sent",
            TransportEvent::MapXidRequest { .. } => "map-xid-request",
            TransportEvent::Disconnect => "disconnect",
            TransportEvent::Cleanup => "cleanup",
            TransportEvent::EventThreadDied => "event-thread-died",
        }
    }
}

/// Receiver side of the notification channel, implemented by the RPC
/// layer and registered through `Transport::register_notify`.
///
/// The callback must not block: backends invoke it from their I/O task,
/// and slow work belongs on a channel or a spawned task. An `Err` return
/// on a fatal event class is not retried by the transport; failure
/// handling for a rejected event is the owner's responsibility.
pub trait TransportNotify: Send + Sync {
    fn notify(&self, transport: &Transport, event: TransportEvent) -> Result<(), TransportError>;
}
