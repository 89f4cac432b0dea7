#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;

use rpc_mamont::backend::TransportOps;
use rpc_mamont::message::{Pollin, RequestInfo, TransportReply, TransportReq};
use rpc_mamont::{Transport, TransportError, TransportEvent, TransportNotify, TransportOptions};

/// Counters observed by lifecycle tests.
#[derive(Default)]
pub struct ProbeState {
    pub fini_calls: AtomicUsize,
    pub requests: AtomicUsize,
    pub replies: AtomicUsize,
}

/// A backend test double: records calls, delivers events only when the
/// test drives them, and never completes a submission on its own.
pub struct ProbeOps {
    pub state: Arc<ProbeState>,
}

impl ProbeOps {
    pub fn new() -> (ProbeOps, Arc<ProbeState>) {
        let state = Arc::new(ProbeState::default());
        (ProbeOps { state: state.clone() }, state)
    }
}

#[async_trait]
impl TransportOps for ProbeOps {
    async fn connect(&self, transport: &Transport, _port: u16) -> Result<(), TransportError> {
        transport.notify(TransportEvent::Connect)
    }

    async fn listen(&self, _transport: &Transport) -> Result<(), TransportError> {
        Ok(())
    }

    async fn disconnect(
        &self,
        transport: &Transport,
        _wait: bool,
    ) -> Result<(), TransportError> {
        transport.notify(TransportEvent::Disconnect)
    }

    async fn submit_request(
        &self,
        _transport: &Transport,
        _req: TransportReq,
    ) -> Result<(), TransportError> {
        self.state.requests.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn submit_reply(
        &self,
        _transport: &Transport,
        _reply: TransportReply,
    ) -> Result<(), TransportError> {
        self.state.replies.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn peername(&self) -> Result<String, TransportError> {
        Err(TransportError::Unsupported)
    }

    fn myname(&self) -> Result<String, TransportError> {
        Err(TransportError::Unsupported)
    }

    fn peeraddr(&self) -> Result<SocketAddr, TransportError> {
        Err(TransportError::Unsupported)
    }

    fn myaddr(&self) -> Result<SocketAddr, TransportError> {
        Err(TransportError::Unsupported)
    }

    async fn throttle(&self, _transport: &Transport, _on: bool) -> Result<(), TransportError> {
        Ok(())
    }

    fn fini(&self) {
        self.state.fini_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

/// An event captured by [`EventLog`], tagged with the name of the
/// transport that delivered it.
pub struct Logged {
    pub transport: String,
    pub event: LoggedEvent,
}

pub enum LoggedEvent {
    Connect,
    Accept(Arc<Transport>),
    MsgReceived(Pollin),
    MsgSent,
    MapXid(u32),
    Disconnect,
    Cleanup,
    EventThreadDied,
}

impl LoggedEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            LoggedEvent::Connect => "connect",
            LoggedEvent::Accept(_) => "accept",
            LoggedEvent::MsgReceived(_) => "msg-received",
            LoggedEvent::MsgSent => "msg-sent",
            LoggedEvent::MapXid(_) => "map-xid-request",
            LoggedEvent::Disconnect => "disconnect",
            LoggedEvent::Cleanup => "cleanup",
            LoggedEvent::EventThreadDied => "event-thread-died",
        }
    }
}

/// Notify handler funneling every event into an unbounded channel.
///
/// On `Accept` it registers itself on the child as well, so child events
/// land in the same channel before the child's read loop starts. On
/// `MapXidRequest` it answers with a fixed program identity carrying the
/// requested xid.
pub struct EventLog {
    sender: mpsc::UnboundedSender<Logged>,
    this: Mutex<Weak<EventLog>>,
}

impl EventLog {
    pub const MAP_XID_PROGNUM: u32 = 100003;
    pub const MAP_XID_PROGVER: u32 = 3;
    pub const MAP_XID_PROCNUM: u32 = 1;

    pub fn channel() -> (Arc<EventLog>, mpsc::UnboundedReceiver<Logged>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let log = Arc::new(EventLog { sender, this: Mutex::new(Weak::new()) });
        *log.this.lock().expect("event log self reference poisoned") = Arc::downgrade(&log);
        (log, receiver)
    }
}

impl TransportNotify for EventLog {
    fn notify(&self, transport: &Transport, event: TransportEvent) -> Result<(), TransportError> {
        let logged = match event {
            TransportEvent::Connect => LoggedEvent::Connect,
            TransportEvent::Accept(child) => {
                let this = self
                    .this
                    .lock()
                    .expect("event log self reference poisoned")
                    .upgrade();
                if let Some(handler) = this {
                    child.register_notify(handler);
                }
                LoggedEvent::Accept(child)
            }
            TransportEvent::MsgReceived(pollin) => LoggedEvent::MsgReceived(pollin),
            TransportEvent::MsgSent => LoggedEvent::MsgSent,
            TransportEvent::MapXidRequest { xid, reply } => {
                let _ = reply.send(RequestInfo {
                    prognum: EventLog::MAP_XID_PROGNUM,
                    progver: EventLog::MAP_XID_PROGVER,
                    procnum: EventLog::MAP_XID_PROCNUM,
                    xid,
                    rsp: Default::default(),
                });
                LoggedEvent::MapXid(xid)
            }
            TransportEvent::Disconnect => LoggedEvent::Disconnect,
            TransportEvent::Cleanup => LoggedEvent::Cleanup,
            TransportEvent::EventThreadDied => LoggedEvent::EventThreadDied,
        };
        let _ = self.sender.send(Logged { transport: transport.name().to_string(), event: logged });
        Ok(())
    }
}

/// Installs a fmt subscriber so transport logs show up under
/// `cargo test -- --nocapture`. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Options for a probe-backed transport with the given outstanding limit.
pub fn probe_options(outstanding_limit: u32) -> TransportOptions {
    let mut options = TransportOptions::new();
    options.set(
        rpc_mamont::options::OUTSTANDING_RPC_LIMIT,
        outstanding_limit.to_string(),
    );
    options
}
