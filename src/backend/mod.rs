//! Backend capability set and the name → factory registry.
//!
//! A backend variant (stream socket, in-process loopback, …) plugs into
//! the transport layer by implementing [`TransportOps`] and registering a
//! factory under a name. The RPC layer never sees the variant: it holds a
//! `Transport` and the ops object behind it. Any number of variants can
//! be added without touching the layer above, provided each implements
//! the full capability set; a variant that cannot support an operation
//! returns [`TransportError::Unsupported`] rather than omitting it.

pub mod loopback;

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::RwLock;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::debug;

use crate::error::TransportError;
use crate::message::{TransportReply, TransportReq};
use crate::options::TransportOptions;
use crate::transport::Transport;

/// The polymorphic contract every backend variant implements.
///
/// Calls that depend on network state return quickly and report their real
/// outcome through the event channel; only validation failures surface
/// synchronously. `disconnect(wait = true)` is the single exception and
/// blocks until I/O has quiesced.
#[async_trait]
pub trait TransportOps: Send + Sync {
    /// Starts an outbound connect. The return value reports whether the
    /// attempt was initiated; success or failure arrives later as a
    /// `Connect` or `Disconnect` event.
    async fn connect(&self, transport: &Transport, port: u16) -> Result<(), TransportError>;

    /// Begins accepting inbound connections on this transport.
    async fn listen(&self, transport: &Transport) -> Result<(), TransportError>;

    /// Tears the connection down, blocking until quiescent when `wait`.
    async fn disconnect(&self, transport: &Transport, wait: bool)
        -> Result<(), TransportError>;

    /// Queues an outbound call for transmission. The backend guarantees an
    /// eventual `MsgSent` or `Disconnect`; it never drops a submission
    /// silently.
    async fn submit_request(
        &self,
        transport: &Transport,
        req: TransportReq,
    ) -> Result<(), TransportError>;

    /// Queues an outbound reply, with the same completion contract as
    /// `submit_request`.
    async fn submit_reply(
        &self,
        transport: &Transport,
        reply: TransportReply,
    ) -> Result<(), TransportError>;

    /// Printable identity of the remote endpoint. Fails `NotConnected`
    /// before the transport reaches connected state.
    fn peername(&self) -> Result<String, TransportError>;

    /// Printable identity of the local endpoint.
    fn myname(&self) -> Result<String, TransportError>;

    /// Raw remote socket address, for carriers that have one.
    fn peeraddr(&self) -> Result<SocketAddr, TransportError>;

    /// Raw local socket address, for carriers that have one.
    fn myaddr(&self) -> Result<SocketAddr, TransportError>;

    /// Pauses or resumes read-readiness processing for flow control.
    async fn throttle(&self, transport: &Transport, on: bool) -> Result<(), TransportError>;

    /// Applies a new option set. Variants for which live reconfiguration
    /// is meaningless report success trivially.
    async fn reconfigure(
        &self,
        _transport: &Transport,
        _options: &TransportOptions,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    /// Synchronous teardown, invoked exactly once when the last transport
    /// handle drops. Must not block.
    fn fini(&self) {}
}

/// Builds the ops object for one transport from its option set.
pub type BackendFactory = Box<
    dyn Fn(TransportOptions) -> BoxFuture<'static, anyhow::Result<Box<dyn TransportOps>>>
        + Send
        + Sync,
>;

/// Name → factory table consulted once per transport creation.
///
/// Backends register at startup; creation resolves the requested name or
/// fails with `UnknownBackend`. Registration after startup is allowed and
/// only affects transports created afterwards.
#[derive(Default)]
pub struct Registry {
    factories: RwLock<HashMap<String, BackendFactory>>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Registry {
        Registry::default()
    }

    /// A registry with the built-in backends registered.
    pub fn with_default_backends() -> Registry {
        let registry = Registry::new();
        registry.register(loopback::BACKEND_NAME, loopback::factory());
        registry
    }

    pub fn register(&self, name: &str, factory: BackendFactory) {
        debug!(backend = name, "registering transport backend");
        self.factories
            .write()
            .expect("backend registry lock poisoned")
            .insert(name.to_string(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories
            .read()
            .expect("backend registry lock poisoned")
            .contains_key(name)
    }

    /// Resolves `name` and runs its factory against `options`.
    pub async fn build(
        &self,
        name: &str,
        options: &TransportOptions,
    ) -> Result<Box<dyn TransportOps>, TransportError> {
        let pending = {
            let factories = self
                .factories
                .read()
                .expect("backend registry lock poisoned");
            match factories.get(name) {
                None => return Err(TransportError::UnknownBackend(name.to_string())),
                Some(factory) => factory(options.clone()),
            }
        };
        pending
            .await
            .map_err(|err| TransportError::Io(io::Error::other(err)))
    }
}

/// Number of transport types named in a comma-separated list such as
/// `"socket,rdma"`. Empty entries are ignored.
pub fn count_types(list: &str) -> usize {
    list.split(',').filter(|entry| !entry.trim().is_empty()).count()
}
