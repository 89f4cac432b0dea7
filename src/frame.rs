//! RPC record marking as specified in RFC 5531 (previously RFC 1057 section 10).
//!
//! A stream transport carries RPC records as a sequence of fragments, each
//! prefixed by a 4-byte big-endian header: the highest bit flags the last
//! fragment of the record, the lower 31 bits carry the fragment length
//! (excluding the header itself). Concatenating the fragment payloads
//! reproduces the record. Everything above the 4-byte header is opaque
//! bytes to this layer.
//!
//! Three access styles are provided:
//!
//! - pure [`encode_record_mark`]/[`decode_record_mark`] for backends that
//!   own their buffers,
//! - async [`read_fragment`]/[`write_fragment`] for backends driving a
//!   byte stream directly,
//! - an incremental [`RecordAssembler`] for backends that are fed bytes at
//!   arbitrary split points by a poller.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::TransportError;

/// Size of the record-marking fragment header on the wire.
pub const RECORD_MARK_SIZE: usize = 4;

/// Largest length representable in the 31 low bits of the fragment header.
pub const MAX_FRAGMENT_SIZE: usize = (1 << 31) - 1;

/// Upper bound enforced on a reassembled record. Anything larger is a
/// protocol violation or a hostile peer.
pub const MAX_RECORD_LENGTH: usize = 8 * 1024 * 1024;

/// Size of the msg-type block at the start of an RPC message (xid + type).
pub const RPC_MSGTYPE_SIZE: usize = 8;

/// Size of the call body from its start up to and including the credential
/// length word.
pub const RPC_CALL_BODY_SIZE: usize = 24;

/// Size of the reply-status word.
pub const RPC_REPLY_STATUS_SIZE: usize = 4;

/// Size of an auth flavour plus its length word.
pub const RPC_AUTH_FLAVOUR_N_LENGTH_SIZE: usize = 8;

/// Size of the accept-status word.
pub const RPC_ACCEPT_STATUS_SIZE: usize = 4;

const LAST_FRAGMENT_BIT: u32 = 1 << 31;

/// Encodes a fragment header for a fragment of `len` bytes.
///
/// Fails with [`TransportError::FrameTooLarge`] when `len` does not fit in
/// the 31 length bits.
pub fn encode_record_mark(len: usize, last: bool) -> Result<[u8; RECORD_MARK_SIZE], TransportError> {
    if len > MAX_FRAGMENT_SIZE {
        return Err(TransportError::FrameTooLarge(len as u64));
    }
    let mut header = len as u32;
    if last {
        header |= LAST_FRAGMENT_BIT;
    }
    Ok(header.to_be_bytes())
}

/// Decodes a fragment header into `(length, last)`.
///
/// Two pure bit-mask extractions; every 4-byte value is a valid header.
pub fn decode_record_mark(buf: [u8; RECORD_MARK_SIZE]) -> (usize, bool) {
    let header = u32::from_be_bytes(buf);
    let last = (header & LAST_FRAGMENT_BIT) != 0;
    let len = (header & !LAST_FRAGMENT_BIT) as usize;
    (len, last)
}

/// Reads a single record-marked fragment from a stream.
///
/// Reads the 4-byte header, then exactly `length` payload bytes, appending
/// them to `append_to`. Returns `true` when the last-fragment bit was set,
/// allowing the caller to loop until the record is complete. The
/// accumulated record is bounded by [`MAX_RECORD_LENGTH`].
pub async fn read_fragment<R>(
    stream: &mut R,
    append_to: &mut Vec<u8>,
) -> Result<bool, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0_u8; RECORD_MARK_SIZE];
    stream.read_exact(&mut header_buf).await?;
    let (length, is_last) = decode_record_mark(header_buf);
    trace!("reading fragment length:{} last:{}", length, is_last);
    if append_to.len().saturating_add(length) > MAX_RECORD_LENGTH {
        return Err(TransportError::FrameTooLarge(
            (append_to.len() as u64).saturating_add(length as u64),
        ));
    }
    let start_offset = append_to.len();
    append_to.resize(start_offset + length, 0);
    stream.read_exact(&mut append_to[start_offset..]).await?;
    Ok(is_last)
}

/// Writes a buffer to a stream as one or more record-marked fragments.
///
/// Large buffers are split into maximal fragments; the final fragment
/// carries the last-fragment bit so the peer can reassemble the record.
pub async fn write_fragment<W>(stream: &mut W, buf: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let mut offset = 0;
    loop {
        let remaining = buf.len() - offset;
        let fragment_size = std::cmp::min(remaining, MAX_FRAGMENT_SIZE);
        let is_last = offset + fragment_size >= buf.len();

        let header = encode_record_mark(fragment_size, is_last)?;
        stream.write_all(&header).await?;
        trace!("writing fragment length:{} last:{}", fragment_size, is_last);
        stream.write_all(&buf[offset..offset + fragment_size]).await?;

        offset += fragment_size;
        if is_last {
            break;
        }
    }
    Ok(())
}

enum AssemblerPhase {
    /// Collecting the 4-byte fragment header.
    Mark { filled: usize },
    /// Collecting `remaining` payload bytes of the current fragment.
    Body { remaining: usize, last: bool },
}

/// Incremental record reassembly for backends fed by a poller.
///
/// Bytes may arrive at any split point, down to one byte at a time; the
/// assembler buffers partial headers and partial fragments and emits each
/// record exactly once, byte-identical to an unfragmented delivery.
pub struct RecordAssembler {
    phase: AssemblerPhase,
    mark: [u8; RECORD_MARK_SIZE],
    record: Vec<u8>,
    max_record: usize,
}

impl Default for RecordAssembler {
    fn default() -> Self {
        RecordAssembler::new()
    }
}

impl RecordAssembler {
    pub fn new() -> RecordAssembler {
        RecordAssembler::with_limit(MAX_RECORD_LENGTH)
    }

    /// An assembler with a custom record-size bound.
    pub fn with_limit(max_record: usize) -> RecordAssembler {
        RecordAssembler {
            phase: AssemblerPhase::Mark { filled: 0 },
            mark: [0_u8; RECORD_MARK_SIZE],
            record: Vec::new(),
            max_record,
        }
    }

    /// Feeds a chunk of stream bytes, returning every record completed by
    /// this chunk in arrival order.
    pub fn feed(&mut self, mut bytes: &[u8]) -> Result<Vec<Vec<u8>>, TransportError> {
        let mut completed = Vec::new();
        while !bytes.is_empty() {
            match self.phase {
                AssemblerPhase::Mark { filled } => {
                    let take = std::cmp::min(RECORD_MARK_SIZE - filled, bytes.len());
                    self.mark[filled..filled + take].copy_from_slice(&bytes[..take]);
                    bytes = &bytes[take..];
                    if filled + take < RECORD_MARK_SIZE {
                        self.phase = AssemblerPhase::Mark { filled: filled + take };
                        continue;
                    }
                    let (length, last) = decode_record_mark(self.mark);
                    if self.record.len().saturating_add(length) > self.max_record {
                        return Err(TransportError::FrameTooLarge(
                            (self.record.len() as u64).saturating_add(length as u64),
                        ));
                    }
                    self.phase = AssemblerPhase::Body { remaining: length, last };
                }
                AssemblerPhase::Body { remaining, last } => {
                    let take = std::cmp::min(remaining, bytes.len());
                    self.record.extend_from_slice(&bytes[..take]);
                    bytes = &bytes[take..];
                    if take < remaining {
                        self.phase = AssemblerPhase::Body { remaining: remaining - take, last };
                        continue;
                    }
                    self.phase = AssemblerPhase::Mark { filled: 0 };
                    if last {
                        completed.push(std::mem::take(&mut self.record));
                    }
                }
            }
            // A zero-length fragment completes immediately without
            // consuming payload bytes; the loop above already advanced
            // past its header.
            if let AssemblerPhase::Body { remaining: 0, last } = self.phase {
                self.phase = AssemblerPhase::Mark { filled: 0 };
                if last {
                    completed.push(std::mem::take(&mut self.record));
                }
            }
        }
        Ok(completed)
    }

    /// Bytes of the record currently being assembled.
    pub fn pending_len(&self) -> usize {
        self.record.len()
    }
}
