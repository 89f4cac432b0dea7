//! The polymorphic transport object and its lifecycle.
//!
//! A [`Transport`] gives the RPC layer a uniform handle over whatever
//! byte-stream carrier a backend implements. The object is shared through
//! `Arc`: cloning the handle retains the transport, dropping a handle
//! releases it, and backend teardown runs exactly once, when the last
//! holder is gone. Mutable shared fields live behind one mutex; the fast
//! paths (byte counters, xid allocation, connection flags) are atomic and
//! never touch the lock.
//!
//! Events flow the other way: backends report connects, accepted children,
//! reassembled records and disconnects through [`Transport::notify`],
//! which centralizes the ordering guarantees of the notification protocol
//! before handing each event to the registered [`TransportNotify`] owner.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use tracing::{debug, warn};
use tracing_attributes::instrument;

use crate::backend::{Registry, TransportOps};
use crate::error::TransportError;
use crate::event::{TransportEvent, TransportNotify};
use crate::message::{TransportReply, TransportReq};
use crate::options::{self, TransportOptions};

/// Process-wide execution context owning the backend registry.
///
/// Every transport belongs to one context; transports created from the
/// same context resolve backend names against the same registry.
pub struct Context {
    registry: Registry,
}

impl Context {
    /// A context with the built-in backends registered.
    pub fn new() -> Arc<Context> {
        Arc::new(Context { registry: Registry::with_default_backends() })
    }

    /// A context around a caller-assembled registry.
    pub fn with_registry(registry: Registry) -> Arc<Context> {
        Arc::new(Context { registry })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Endpoint description populated at connect/accept time and immutable
/// afterwards.
#[derive(Debug, Clone, Default)]
pub struct PeerInfo {
    /// Highest protocol op-version the endpoint speaks.
    pub max_op_version: u32,
    /// Lowest protocol op-version the endpoint speaks.
    pub min_op_version: u32,
    /// Raw socket address, when the carrier has one.
    pub sockaddr: Option<SocketAddr>,
    /// Printable endpoint identity.
    pub identifier: String,
    /// Name of the volume mounted by the remote end, when known.
    pub volname: String,
}

#[derive(Default)]
struct EndpointState {
    peerinfo: PeerInfo,
    myinfo: PeerInfo,
    connect_failed: bool,
}

/// A reference-counted, backend-polymorphic transport.
///
/// Created through [`Transport::create`]; retained by cloning the `Arc`
/// handle. When the last handle drops, the transport delivers its final
/// events (`Disconnect` if still connected, then `Cleanup`) and invokes
/// backend teardown, in that order and exactly once.
pub struct Transport {
    name: String,
    ctx: Arc<Context>,
    options: TransportOptions,
    ops: Box<dyn TransportOps>,
    /// Self-reference handed to backends so their I/O tasks can hold the
    /// transport weakly and never keep it alive on their own.
    this: Weak<Transport>,
    notify_handler: OnceLock<Arc<dyn TransportNotify>>,
    /// Navigational back-reference from an accepted transport to the
    /// listener that spawned it. Weak, so the link never keeps either
    /// side alive.
    listener: Mutex<Option<Weak<Transport>>>,
    endpoint: Mutex<EndpointState>,
    total_bytes_read: AtomicU64,
    total_bytes_written: AtomicU64,
    outstanding: AtomicU32,
    outstanding_limit: Option<u32>,
    xid: AtomicU32,
    connected: AtomicBool,
    disconnect_progress: AtomicBool,
    disconnect_delivered: AtomicBool,
    cleanup_delivered: AtomicBool,
}

impl Transport {
    /// Creates a transport over the backend registered as `backend`.
    ///
    /// Fails with [`TransportError::UnknownBackend`] when the name is not
    /// registered, and propagates the backend's own construction failure
    /// otherwise. The returned handle is the first reference.
    #[instrument(skip(ctx, options))]
    pub async fn create(
        ctx: &Arc<Context>,
        options: TransportOptions,
        backend: &str,
    ) -> Result<Arc<Transport>, TransportError> {
        let ops = ctx.registry().build(backend, &options).await?;
        Transport::with_ops(ctx, options, backend, ops)
    }

    /// Assembles a transport around an already-built ops object.
    ///
    /// Used by the factory and by backends spawning child transports for
    /// accepted connections.
    pub fn with_ops(
        ctx: &Arc<Context>,
        options: TransportOptions,
        default_name: &str,
        ops: Box<dyn TransportOps>,
    ) -> Result<Arc<Transport>, TransportError> {
        let name = options
            .get(options::TRANSPORT_NAME)
            .unwrap_or(default_name)
            .to_string();
        let outstanding_limit = options.outstanding_limit()?;
        debug!(transport = %name, ?outstanding_limit, "transport created");
        Ok(Arc::new_cyclic(|this| Transport {
            name,
            ctx: ctx.clone(),
            options,
            ops,
            this: this.clone(),
            notify_handler: OnceLock::new(),
            listener: Mutex::new(None),
            endpoint: Mutex::new(EndpointState::default()),
            total_bytes_read: AtomicU64::new(0),
            total_bytes_written: AtomicU64::new(0),
            outstanding: AtomicU32::new(0),
            outstanding_limit,
            xid: AtomicU32::new(1),
            connected: AtomicBool::new(false),
            disconnect_progress: AtomicBool::new(false),
            disconnect_delivered: AtomicBool::new(false),
            cleanup_delivered: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ctx(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    /// Registers the event receiver. One registration per transport;
    /// later calls are ignored with a warning. Events raised before
    /// registration are dropped.
    pub fn register_notify(&self, handler: Arc<dyn TransportNotify>) {
        if self.notify_handler.set(handler).is_err() {
            warn!(transport = %self.name, "notify handler already registered, ignoring");
        }
    }

    /// Delivers an event to the registered owner.
    ///
    /// This is the dispatch point backends call into; it also maintains
    /// the protocol's ordering guarantees: `Connect` opens a connected
    /// lifetime, `Disconnect` closes it and is delivered at most once per
    /// lifetime, `MsgSent` settles one outstanding submission, `Cleanup`
    /// must be the final event.
    pub fn notify(&self, event: TransportEvent) -> Result<(), TransportError> {
        match &event {
            TransportEvent::Connect => {
                self.connected.store(true, Ordering::SeqCst);
                self.disconnect_delivered.store(false, Ordering::SeqCst);
                self.disconnect_progress.store(false, Ordering::SeqCst);
            }
            TransportEvent::MsgSent => {
                let _ = self.outstanding.fetch_update(
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                    |n| n.checked_sub(1),
                );
            }
            TransportEvent::Disconnect => {
                self.connected.store(false, Ordering::SeqCst);
                self.outstanding.store(0, Ordering::SeqCst);
                if self.disconnect_delivered.swap(true, Ordering::SeqCst) {
                    debug!(transport = %self.name, "suppressing duplicate disconnect event");
                    return Ok(());
                }
            }
            TransportEvent::Cleanup => {
                let repeated = self.cleanup_delivered.swap(true, Ordering::SeqCst);
                debug_assert!(!repeated, "cleanup event delivered twice");
            }
            _ => {}
        }
        match self.notify_handler.get() {
            Some(handler) => handler.notify(self, event),
            None => {
                warn!(
                    transport = %self.name,
                    event = event.kind(),
                    "no notify handler registered, dropping event"
                );
                Ok(())
            }
        }
    }

    /// Initiates an outbound connect. The return value only reports
    /// whether the attempt was started; the outcome arrives later as a
    /// `Connect` or `Disconnect` event.
    pub async fn connect(&self, port: u16) -> Result<(), TransportError> {
        self.ops.connect(self, port).await
    }

    /// Starts accepting inbound connections; each one is announced as an
    /// `Accept` event carrying the child transport.
    pub async fn listen(&self) -> Result<(), TransportError> {
        self.ops.listen(self).await
    }

    /// Tears the connection down. With `wait` the call returns only after
    /// in-flight I/O has quiesced and `Disconnect` has been delivered;
    /// without it teardown proceeds asynchronously.
    pub async fn disconnect(&self, wait: bool) -> Result<(), TransportError> {
        self.disconnect_progress.store(true, Ordering::SeqCst);
        self.ops.disconnect(self, wait).await
    }

    /// Submits an outbound call. Buffer ownership passes to the backend
    /// until a `MsgSent` (success) or `Disconnect` (connection loss)
    /// event; a submission is never silently dropped.
    pub async fn submit_request(&self, req: TransportReq) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        req.msg.check_size()?;
        self.charge_outstanding()?;
        match self.ops.submit_request(self, req).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.settle_outstanding();
                Err(err)
            }
        }
    }

    /// Submits an outbound reply; same ownership and completion contract
    /// as [`Transport::submit_request`].
    pub async fn submit_reply(&self, reply: TransportReply) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        reply.msg.check_size()?;
        self.charge_outstanding()?;
        match self.ops.submit_reply(self, reply).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.settle_outstanding();
                Err(err)
            }
        }
    }

    pub fn get_peername(&self) -> Result<String, TransportError> {
        self.ops.peername()
    }

    pub fn get_myname(&self) -> Result<String, TransportError> {
        self.ops.myname()
    }

    pub fn get_peeraddr(&self) -> Result<SocketAddr, TransportError> {
        self.ops.peeraddr()
    }

    pub fn get_myaddr(&self) -> Result<SocketAddr, TransportError> {
        self.ops.myaddr()
    }

    /// Pauses (`on = true`) or resumes read-readiness processing, the
    /// backpressure valve toward a slow consumer.
    pub async fn throttle(&self, on: bool) -> Result<(), TransportError> {
        self.ops.throttle(self, on).await
    }

    /// Applies a new option set where the backend supports it; backends
    /// for which live reconfiguration is meaningless report success.
    pub async fn reconfigure(
        &self,
        new_options: &TransportOptions,
    ) -> Result<(), TransportError> {
        self.ops.reconfigure(self, new_options).await
    }

    /// Allocates the next transaction id for callback correlation.
    pub fn next_xid(&self) -> u32 {
        self.xid.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Whether a disconnect has been requested and not superseded by a
    /// later connect.
    pub fn is_disconnecting(&self) -> bool {
        self.disconnect_progress.load(Ordering::SeqCst)
    }

    /// Submissions accepted but not yet settled by `MsgSent`.
    pub fn outstanding(&self) -> u32 {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn total_bytes_read(&self) -> u64 {
        self.total_bytes_read.load(Ordering::Relaxed)
    }

    pub fn total_bytes_written(&self) -> u64 {
        self.total_bytes_written.load(Ordering::Relaxed)
    }

    /// Backend hook: marks an accepted transport connected without a
    /// `Connect` event (accepted connections are born connected).
    pub fn mark_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.disconnect_delivered.store(false, Ordering::SeqCst);
        self.disconnect_progress.store(false, Ordering::SeqCst);
    }

    /// Backend hook: records that the connect syscall itself failed, for
    /// owners that inspect the transport after a `Disconnect`.
    pub fn mark_connect_failed(&self) {
        self.endpoint_lock().connect_failed = true;
    }

    pub fn connect_failed(&self) -> bool {
        self.endpoint_lock().connect_failed
    }

    /// Backend hook: byte accounting for inbound traffic.
    pub fn account_read(&self, bytes: u64) {
        self.total_bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Backend hook: byte accounting for outbound traffic.
    pub fn account_written(&self, bytes: u64) {
        self.total_bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn set_peerinfo(&self, info: PeerInfo) {
        self.endpoint_lock().peerinfo = info;
    }

    pub fn set_myinfo(&self, info: PeerInfo) {
        self.endpoint_lock().myinfo = info;
    }

    pub fn peerinfo(&self) -> PeerInfo {
        self.endpoint_lock().peerinfo.clone()
    }

    pub fn myinfo(&self) -> PeerInfo {
        self.endpoint_lock().myinfo.clone()
    }

    /// A weak handle to this transport, for backend tasks that must not
    /// extend its lifetime.
    pub fn weak(&self) -> Weak<Transport> {
        self.this.clone()
    }

    /// Links an accepted transport back to the listener that spawned it.
    /// The link is navigational only and never retains the listener.
    pub fn set_listener(&self, listener: &Transport) {
        *self.listener.lock().expect("transport listener mutex poisoned") =
            Some(listener.weak());
    }

    /// The spawning listener, when it is still alive.
    pub fn listener(&self) -> Option<Arc<Transport>> {
        self.listener
            .lock()
            .expect("transport listener mutex poisoned")
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn endpoint_lock(&self) -> std::sync::MutexGuard<'_, EndpointState> {
        self.endpoint.lock().expect("transport endpoint mutex poisoned")
    }

    fn charge_outstanding(&self) -> Result<(), TransportError> {
        match self.outstanding_limit {
            None => {
                self.outstanding.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Some(limit) => self
                .outstanding
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    if n >= limit {
                        None
                    } else {
                        Some(n + 1)
                    }
                })
                .map(|_| ())
                .map_err(|_| TransportError::Overflow),
        }
    }

    fn settle_outstanding(&self) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Transport")
            .field("name", &self.name)
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .field("outstanding", &self.outstanding.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        // Last handle is gone. Close out the event stream in protocol
        // order, then tear the backend down. `notify` suppresses the
        // disconnect when the backend already delivered it.
        if self.connected.load(Ordering::SeqCst) {
            let _ = self.notify(TransportEvent::Disconnect);
        }
        let _ = self.notify(TransportEvent::Cleanup);
        self.ops.fini();
        debug!(transport = %self.name, "transport destroyed");
    }
}
