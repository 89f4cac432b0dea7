//! In-process loopback backend.
//!
//! Connects transports inside one process over `tokio::io::duplex` byte
//! streams, exercising the whole transport contract without a socket:
//! record-marked framing, accept-spawned child transports, throttling and
//! teardown all behave as a stream-socket backend would. Listeners claim
//! an endpoint name in a process-wide table; connectors reach them by the
//! same name through the `transport.loopback.endpoint` option.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use async_trait::async_trait;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::backend::{BackendFactory, TransportOps};
use crate::buf::{IoBuf, IoBufRef, Segment};
use crate::error::TransportError;
use crate::event::TransportEvent;
use crate::frame;
use crate::message::{Pollin, TransportMsg, TransportReply, TransportReq};
use crate::options::{self, TransportOptions};
use crate::transport::{PeerInfo, Transport};

/// Registry name of this backend.
pub const BACKEND_NAME: &str = "loopback";

/// Capacity of the in-process byte stream between two endpoints.
const STREAM_CAPACITY: usize = 256_000;

static CONNECTION_SEQ: AtomicU64 = AtomicU64::new(1);

/// The factory registered under [`BACKEND_NAME`].
pub fn factory() -> BackendFactory {
    Box::new(|opts: TransportOptions| {
        Box::pin(async move {
            let endpoint = opts.get(options::LOOPBACK_ENDPOINT).ok_or_else(|| {
                TransportError::invalid_option(
                    options::LOOPBACK_ENDPOINT,
                    "required by the loopback backend",
                )
            })?;
            Ok(Box::new(Loopback::new(endpoint.to_string())) as Box<dyn TransportOps>)
        })
    })
}

struct ConnectRequest {
    peer_identifier: String,
    stream: DuplexStream,
}

type Hub = Mutex<HashMap<String, mpsc::UnboundedSender<ConnectRequest>>>;

fn hub() -> &'static Hub {
    static HUB: OnceLock<Hub> = OnceLock::new();
    HUB.get_or_init(Hub::default)
}

struct WriteCmd {
    record: Vec<u8>,
    /// Held until the write completes, per the submission ownership
    /// contract.
    #[allow(dead_code)]
    bufref: IoBufRef,
}

#[derive(Default)]
struct State {
    listening: bool,
    connected: bool,
    local_identifier: Option<String>,
    peer_identifier: Option<String>,
    writer: Option<mpsc::UnboundedSender<WriteCmd>>,
    throttle: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

struct Shared {
    endpoint: String,
    state: Mutex<State>,
}

impl Shared {
    fn state_lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("loopback state mutex poisoned")
    }

    /// Wires an established byte stream into this endpoint: identifiers,
    /// the writer task and the throttle valve.
    fn install_conn(
        &self,
        transport: &Transport,
        local_id: String,
        peer_id: String,
        write_half: WriteHalf<DuplexStream>,
    ) {
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (throttle_tx, _) = watch::channel(false);
        let writer_task = tokio::spawn(run_writer(write_half, transport.weak(), writer_rx));
        {
            let mut state = self.state_lock();
            state.connected = true;
            state.local_identifier = Some(local_id.clone());
            state.peer_identifier = Some(peer_id.clone());
            state.writer = Some(writer_tx);
            state.throttle = Some(throttle_tx);
            state.tasks.push(writer_task);
        }
        transport.set_myinfo(PeerInfo { identifier: local_id, ..PeerInfo::default() });
        transport.set_peerinfo(PeerInfo { identifier: peer_id, ..PeerInfo::default() });
    }

    /// Starts the read loop. Separate from [`Shared::install_conn`] so an
    /// `Accept` event can be delivered before the first `MsgReceived`.
    fn spawn_reader(&self, transport: &Transport, read_half: ReadHalf<DuplexStream>) {
        let mut state = self.state_lock();
        let throttle_rx = match state.throttle.as_ref() {
            Some(tx) => tx.subscribe(),
            // Torn down between install and here; nothing to read.
            None => return,
        };
        let task = tokio::spawn(run_reader(read_half, transport.weak(), throttle_rx));
        state.tasks.push(task);
    }

    /// Drops the connection state and stops every task. Returns the task
    /// handles so a waiting disconnect can join them.
    fn teardown(&self) -> Vec<JoinHandle<()>> {
        let (tasks, was_listening) = {
            let mut state = self.state_lock();
            state.connected = false;
            state.local_identifier = None;
            state.peer_identifier = None;
            state.writer = None;
            state.throttle = None;
            (std::mem::take(&mut state.tasks), std::mem::take(&mut state.listening))
        };
        if was_listening {
            hub()
                .lock()
                .expect("loopback hub mutex poisoned")
                .remove(&self.endpoint);
        }
        for task in &tasks {
            task.abort();
        }
        tasks
    }
}

/// Ops object of the loopback backend; one per transport.
pub struct Loopback {
    shared: Arc<Shared>,
}

impl Loopback {
    pub fn new(endpoint: String) -> Loopback {
        Loopback {
            shared: Arc::new(Shared { endpoint, state: Mutex::new(State::default()) }),
        }
    }

    /// Reports a failed connect attempt the way a socket backend would: the
    /// call already returned, so the outcome arrives as a `Disconnect`.
    fn fail_connect(&self, transport: &Transport, reason: &'static str) {
        debug!(endpoint = %self.shared.endpoint, reason, "loopback connect failed");
        let weak = transport.weak();
        tokio::spawn(async move {
            if let Some(transport) = weak.upgrade() {
                transport.mark_connect_failed();
                let _ = transport.notify(TransportEvent::Disconnect);
            }
        });
    }

    fn queue_message(&self, msg: TransportMsg) -> Result<(), TransportError> {
        let cmd = WriteCmd { record: msg.to_record(), bufref: msg.bufref };
        let state = self.shared.state_lock();
        match &state.writer {
            Some(writer) => writer.send(cmd).map_err(|_| TransportError::NotConnected),
            None => Err(TransportError::NotConnected),
        }
    }
}

#[async_trait]
impl TransportOps for Loopback {
    async fn connect(&self, transport: &Transport, port: u16) -> Result<(), TransportError> {
        if self.shared.state_lock().connected {
            return Ok(());
        }
        let endpoint = self.shared.endpoint.clone();
        trace!(endpoint = %endpoint, port, "loopback connect has no port space");
        let acceptor = hub()
            .lock()
            .expect("loopback hub mutex poisoned")
            .get(&endpoint)
            .cloned();
        let Some(acceptor) = acceptor else {
            self.fail_connect(transport, "no listener on endpoint");
            return Ok(());
        };
        let (local, remote) = tokio::io::duplex(STREAM_CAPACITY);
        let local_id = format!(
            "{}.client-{}",
            endpoint,
            CONNECTION_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let request = ConnectRequest { peer_identifier: local_id.clone(), stream: remote };
        if acceptor.send(request).is_err() {
            self.fail_connect(transport, "listener is shutting down");
            return Ok(());
        }
        let (read_half, write_half) = tokio::io::split(local);
        self.shared.install_conn(transport, local_id, endpoint, write_half);
        if let Err(err) = transport.notify(TransportEvent::Connect) {
            warn!(transport = %transport.name(), error = %err, "owner rejected connect event");
        }
        self.shared.spawn_reader(transport, read_half);
        Ok(())
    }

    async fn listen(&self, transport: &Transport) -> Result<(), TransportError> {
        let (acceptor_tx, acceptor_rx) = mpsc::unbounded_channel();
        {
            let mut hub = hub().lock().expect("loopback hub mutex poisoned");
            if hub.contains_key(&self.shared.endpoint) {
                return Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("loopback endpoint {:?} already has a listener", self.shared.endpoint),
                )));
            }
            hub.insert(self.shared.endpoint.clone(), acceptor_tx);
        }
        {
            let mut state = self.shared.state_lock();
            state.listening = true;
            state.local_identifier = Some(self.shared.endpoint.clone());
        }
        transport.set_myinfo(PeerInfo {
            identifier: self.shared.endpoint.clone(),
            ..PeerInfo::default()
        });
        let task = tokio::spawn(run_acceptor(
            self.shared.endpoint.clone(),
            acceptor_rx,
            transport.weak(),
        ));
        self.shared.state_lock().tasks.push(task);
        info!(endpoint = %self.shared.endpoint, "loopback listener active");
        Ok(())
    }

    async fn disconnect(
        &self,
        transport: &Transport,
        wait: bool,
    ) -> Result<(), TransportError> {
        let was_connected = transport.is_connected();
        let tasks = self.shared.teardown();
        if was_connected {
            let _ = transport.notify(TransportEvent::Disconnect);
        }
        if wait {
            for task in tasks {
                let _ = task.await;
            }
        }
        Ok(())
    }

    async fn submit_request(
        &self,
        _transport: &Transport,
        req: TransportReq,
    ) -> Result<(), TransportError> {
        self.queue_message(req.msg)
    }

    async fn submit_reply(
        &self,
        _transport: &Transport,
        reply: TransportReply,
    ) -> Result<(), TransportError> {
        self.queue_message(reply.msg)
    }

    fn peername(&self) -> Result<String, TransportError> {
        self.shared
            .state_lock()
            .peer_identifier
            .clone()
            .ok_or(TransportError::NotConnected)
    }

    fn myname(&self) -> Result<String, TransportError> {
        self.shared
            .state_lock()
            .local_identifier
            .clone()
            .ok_or(TransportError::NotConnected)
    }

    fn peeraddr(&self) -> Result<SocketAddr, TransportError> {
        // An in-process pipe has no socket address.
        Err(TransportError::Unsupported)
    }

    fn myaddr(&self) -> Result<SocketAddr, TransportError> {
        Err(TransportError::Unsupported)
    }

    async fn throttle(&self, _transport: &Transport, on: bool) -> Result<(), TransportError> {
        let state = self.shared.state_lock();
        match &state.throttle {
            Some(valve) => {
                let _ = valve.send(on);
                Ok(())
            }
            None => Err(TransportError::NotConnected),
        }
    }

    fn fini(&self) {
        self.shared.teardown();
    }
}

async fn run_acceptor(
    endpoint: String,
    mut requests: mpsc::UnboundedReceiver<ConnectRequest>,
    weak_listener: Weak<Transport>,
) {
    while let Some(request) = requests.recv().await {
        let Some(listener) = weak_listener.upgrade() else {
            return;
        };
        if let Err(err) = accept_one(&listener, &endpoint, request) {
            error!(endpoint = %endpoint, error = %err, "failed to accept loopback connection");
        }
    }
    debug!(endpoint = %endpoint, "loopback acceptor finished");
    if let Some(listener) = weak_listener.upgrade() {
        let _ = listener.notify(TransportEvent::EventThreadDied);
    }
}

/// Builds the child transport for one inbound connection and announces it
/// on the listener. `Accept` is delivered before the child's read loop
/// starts, so it precedes any `MsgReceived` on the child.
fn accept_one(
    listener: &Arc<Transport>,
    endpoint: &str,
    request: ConnectRequest,
) -> Result<(), TransportError> {
    let ops = Loopback::new(endpoint.to_string());
    let shared = ops.shared.clone();
    let child_name = format!("{}.{}", listener.name(), request.peer_identifier);
    let child = Transport::with_ops(
        listener.ctx(),
        listener.options().clone(),
        &child_name,
        Box::new(ops),
    )?;
    let (read_half, write_half) = tokio::io::split(request.stream);
    shared.install_conn(&child, endpoint.to_string(), request.peer_identifier, write_half);
    child.set_listener(listener);
    child.mark_connected();
    info!(listener = %listener.name(), child = %child.name(), "accepted loopback connection");
    if let Err(err) = listener.notify(TransportEvent::Accept(child.clone())) {
        debug!(listener = %listener.name(), error = %err, "owner rejected accepted connection");
        return Ok(());
    }
    shared.spawn_reader(&child, read_half);
    Ok(())
}

async fn run_reader(
    mut read_half: ReadHalf<DuplexStream>,
    weak: Weak<Transport>,
    mut throttle_rx: watch::Receiver<bool>,
) {
    loop {
        // Flow control: hold off between records while throttled.
        if throttle_rx.wait_for(|paused| !*paused).await.is_err() {
            return;
        }
        let mut record = Vec::new();
        loop {
            match frame::read_fragment(&mut read_half, &mut record).await {
                Ok(true) => break,
                Ok(false) => continue,
                Err(err) => {
                    if let Some(transport) = weak.upgrade() {
                        match &err {
                            TransportError::Io(io_err)
                                if io_err.kind() == io::ErrorKind::UnexpectedEof
                                    && record.is_empty() =>
                            {
                                debug!(transport = %transport.name(), "loopback peer closed");
                            }
                            other => {
                                warn!(transport = %transport.name(), error = %other, "loopback read failed");
                            }
                        }
                        let _ = transport.notify(TransportEvent::Disconnect);
                    }
                    return;
                }
            }
        }
        // The valve also gates delivery, so a record mid-read when it
        // closed is held until it reopens.
        if throttle_rx.wait_for(|paused| !*paused).await.is_err() {
            return;
        }
        let Some(transport) = weak.upgrade() else {
            return;
        };
        transport.account_read(record.len() as u64);
        // The msg-type word distinguishes replies from fresh requests.
        let is_reply =
            record.len() >= frame::RPC_MSGTYPE_SIZE && record[4..8] == [0, 0, 0, 1];
        let buf = IoBuf::from_vec(record);
        let segment = Segment::full(buf.clone());
        let pollin = Pollin::new([segment], IoBufRef::of(buf), is_reply);
        if let Err(err) = transport.notify(TransportEvent::MsgReceived(pollin)) {
            warn!(transport = %transport.name(), error = %err, "owner rejected inbound message");
        }
    }
}

async fn run_writer(
    mut write_half: WriteHalf<DuplexStream>,
    weak: Weak<Transport>,
    mut queue: mpsc::UnboundedReceiver<WriteCmd>,
) {
    while let Some(cmd) = queue.recv().await {
        match frame::write_fragment(&mut write_half, &cmd.record).await {
            Ok(()) => {
                let Some(transport) = weak.upgrade() else {
                    return;
                };
                transport.account_written(cmd.record.len() as u64);
                if let Err(err) = transport.notify(TransportEvent::MsgSent) {
                    warn!(transport = %transport.name(), error = %err, "owner rejected send completion");
                }
            }
            Err(err) => {
                if let Some(transport) = weak.upgrade() {
                    warn!(transport = %transport.name(), error = %err, "loopback write failed");
                    let _ = transport.notify(TransportEvent::Disconnect);
                }
                return;
            }
        }
    }
}
