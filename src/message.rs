//! Message, reply and receive-buffer structures exchanged with backends.
//!
//! Outbound traffic is described as scatter/gather views: an ordered RPC
//! header block, an ordered program-header block and an ordered payload
//! block, plus the [`IoBufRef`] set keeping the underlying memory alive
//! until transmission finishes. Inbound traffic arrives as a [`Pollin`],
//! the reassembled record a backend hands upward exactly once per
//! `MsgReceived` event.

use smallvec::SmallVec;

use crate::buf::{IoBufRef, Segment};
use crate::error::TransportError;
use crate::frame::MAX_RECORD_LENGTH;

/// Inline segment capacity of a [`Pollin`]; longer segment lists spill to
/// the heap transparently.
pub const MAX_INLINE_SEGMENTS: usize = 16;

/// Scatter/gather description of one outbound RPC message.
#[derive(Debug, Clone, Default)]
pub struct TransportMsg {
    /// RPC header block.
    pub rpchdr: Vec<Segment>,
    /// Program header block.
    pub proghdr: Vec<Segment>,
    /// Program payload block.
    pub progpayload: Vec<Segment>,
    /// Keeps every buffer referenced by the blocks above alive for the
    /// duration of the I/O.
    pub bufref: IoBufRef,
}

impl TransportMsg {
    pub fn new() -> TransportMsg {
        TransportMsg::default()
    }

    /// Total byte length across all three blocks.
    pub fn total_len(&self) -> usize {
        self.iter_segments().map(Segment::len).sum()
    }

    /// All segments in wire order: header, program header, payload.
    pub fn iter_segments(&self) -> impl Iterator<Item = &Segment> {
        self.rpchdr
            .iter()
            .chain(self.proghdr.iter())
            .chain(self.progpayload.iter())
    }

    /// Validates the message against the record-marking size bound.
    pub fn check_size(&self) -> Result<(), TransportError> {
        let total = self.total_len();
        if total > MAX_RECORD_LENGTH {
            return Err(TransportError::FrameTooLarge(total as u64));
        }
        Ok(())
    }

    /// Flattens the message into one contiguous record.
    pub fn to_record(&self) -> Vec<u8> {
        let mut record = Vec::with_capacity(self.total_len());
        for segment in self.iter_segments() {
            record.extend_from_slice(segment.as_slice());
        }
        record
    }
}

/// Scatter/gather description of where an expected reply should land:
/// response-header block, response-payload block and their buffer set.
#[derive(Debug, Clone, Default)]
pub struct TransportRsp {
    pub rsphdr: Vec<Segment>,
    pub rsp_payload: Vec<Segment>,
    pub bufref: IoBufRef,
}

/// The unit submitted to `submit_request`: an outbound call paired with
/// the reply description awaiting it.
#[derive(Debug, Default)]
pub struct TransportReq {
    pub msg: TransportMsg,
    pub rsp: TransportRsp,
}

impl TransportReq {
    pub fn new(msg: TransportMsg, rsp: TransportRsp) -> TransportReq {
        TransportReq { msg, rsp }
    }
}

/// The unit submitted to `submit_reply`: backend-private context paired
/// with the outbound message.
#[derive(Debug, Default)]
pub struct TransportReply {
    /// Opaque token a backend attached to the inbound request, echoed back
    /// on its reply.
    pub private: Option<u64>,
    pub msg: TransportMsg,
}

impl TransportReply {
    pub fn new(private: Option<u64>, msg: TransportMsg) -> TransportReply {
        TransportReply { private, msg }
    }
}

/// Correlates an outbound callback with the transaction id a backend is
/// about to reply to. Produced by the upper layer in answer to a
/// `MapXidRequest` event.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub prognum: u32,
    pub progver: u32,
    pub procnum: u32,
    pub xid: u32,
    /// Where the reply for `xid` should land once it is submitted.
    pub rsp: TransportRsp,
}

/// One fully reassembled inbound RPC record.
///
/// Created by a backend once every fragment of a record has been read and
/// split at the RPC-layer boundaries; handed upward through a
/// `MsgReceived` event. Ownership is the release contract: dropping the
/// pollin releases its buffer references, and move semantics make a second
/// release impossible.
#[derive(Debug)]
pub struct Pollin {
    segments: SmallVec<[Segment; MAX_INLINE_SEGMENTS]>,
    bufref: IoBufRef,
    is_reply: bool,
}

impl Pollin {
    pub fn new(
        segments: impl IntoIterator<Item = Segment>,
        bufref: IoBufRef,
        is_reply: bool,
    ) -> Pollin {
        Pollin {
            segments: segments.into_iter().collect(),
            bufref,
            is_reply,
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Whether the record is a reply to an outbound call, as opposed to a
    /// fresh request.
    pub fn is_reply(&self) -> bool {
        self.is_reply
    }

    pub fn total_len(&self) -> usize {
        self.segments.iter().map(Segment::len).sum()
    }

    /// The buffer-reference set kept alive for the consumer.
    pub fn bufref(&self) -> &IoBufRef {
        &self.bufref
    }

    /// Copies the record into one contiguous buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_len());
        for segment in &self.segments {
            out.extend_from_slice(segment.as_slice());
        }
        out
    }
}
