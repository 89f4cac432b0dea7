//! RPC Mamont - the transport abstraction layer of an ONC-RPC stack in Rust
//!
//! This library gives RPC client and server code a uniform interface for
//! sending and receiving ONC-RPC messages without knowing whether the
//! underlying channel is a TCP socket, a Unix-domain socket, or another
//! byte-stream carrier. It covers the polymorphic transport object, its
//! shared-ownership lifecycle, the event-notification protocol toward the
//! RPC layer, and the record-marking contract every backend honors when
//! assembling and disassembling messages.
//!
//! ## Main Components
//!
//! - `transport`: The central [`transport::Transport`] object - identity,
//!   configuration, peer information, counters and the dispatch glue that
//!   upholds the event-ordering guarantees. Transports are shared through
//!   `Arc`; backend teardown runs exactly once, when the last handle drops.
//!
//! - `backend`: The capability set ([`backend::TransportOps`]) every
//!   backend variant implements, and the name → factory
//!   [`backend::Registry`] the transport factory resolves against. The
//!   built-in `loopback` variant connects transports in-process.
//!
//! - `event`: The notification protocol - a closed
//!   [`event::TransportEvent`] enum delivered through one registered
//!   [`event::TransportNotify`] handler per transport.
//!
//! - `frame`: Record marking as specified in RFC 5531 - the 4-byte
//!   fragment header, async fragment I/O and an incremental reassembler.
//!
//! - `message`: Scatter/gather message, reply and request envelopes, and
//!   the [`message::Pollin`] receive buffer handed upward once per
//!   reassembled record.
//!
//! - `buf`: Reference-counted byte buffers and the buffer-reference sets
//!   that keep message memory alive across queues and threads.
//!
//! - `options`: String-keyed transport configuration with per-address-family
//!   builder helpers.
//!
//! ## Standards Compliance
//!
//! - RFC 5531: RPC: Remote Procedure Call Protocol Specification Version 2
//!   (obsoletes RFC 1831), in particular the Record Marking Standard
//! - RFC 1833: Binding Protocols for ONC RPC Version 2
//!
//! ## Usage
//!
//! Create a [`transport::Context`], build a `TransportOptions` set for the
//! desired backend, call [`transport::Transport::create`], register a
//! [`event::TransportNotify`] handler, and drive the transport through
//! `connect`/`listen` and `submit_request`/`submit_reply`. Inbound records
//! arrive as `MsgReceived` events carrying a [`message::Pollin`].

pub mod backend;
pub mod buf;
pub mod error;
pub mod event;
pub mod frame;
pub mod message;
pub mod options;
pub mod transport;

pub use backend::{Registry, TransportOps};
pub use error::TransportError;
pub use event::{TransportEvent, TransportNotify};
pub use message::{Pollin, RequestInfo, TransportMsg, TransportReply, TransportReq, TransportRsp};
pub use options::TransportOptions;
pub use transport::{Context, PeerInfo, Transport};
