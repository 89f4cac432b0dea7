//! Reference-counted byte buffers and scatter/gather views.
//!
//! Messages handed to a transport are described as ordered lists of
//! [`Segment`] views over shared [`IoBuf`] allocations, together with an
//! [`IoBufRef`] set that keeps every referenced allocation alive for the
//! duration of the I/O. A buffer is freed only when the backend queue, the
//! upper layer, and every other holder have released their handles.

use std::sync::Arc;

use smallvec::SmallVec;

/// An immutable, reference-counted byte buffer.
///
/// Buffers are always shared through `Arc<IoBuf>`; cloning the handle is
/// the unit of ownership, dropping it is the release.
#[derive(Debug)]
pub struct IoBuf {
    data: Box<[u8]>,
}

impl IoBuf {
    /// Wraps an owned byte vector in a shared buffer.
    pub fn from_vec(data: Vec<u8>) -> Arc<IoBuf> {
        Arc::new(IoBuf { data: data.into_boxed_slice() })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of live handles to this buffer, the probe used by release
    /// pairing tests.
    pub fn handle_count(this: &Arc<IoBuf>) -> usize {
        Arc::strong_count(this)
    }
}

/// An iovec-like view into a shared [`IoBuf`].
#[derive(Debug, Clone)]
pub struct Segment {
    buf: Arc<IoBuf>,
    offset: usize,
    len: usize,
}

impl Segment {
    /// Creates a view over `buf[offset..offset + len]`.
    ///
    /// Returns `None` when the range does not lie within the buffer.
    pub fn new(buf: Arc<IoBuf>, offset: usize, len: usize) -> Option<Segment> {
        if offset.checked_add(len)? > buf.len() {
            return None;
        }
        Some(Segment { buf, offset, len })
    }

    /// A view covering the whole buffer.
    pub fn full(buf: Arc<IoBuf>) -> Segment {
        let len = buf.len();
        Segment { buf, offset: 0, len }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf.as_slice()[self.offset..self.offset + self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The buffer backing this view.
    pub fn buf(&self) -> &Arc<IoBuf> {
        &self.buf
    }
}

/// A shared set of buffer references attached to an in-flight message.
///
/// Holding the set keeps every listed buffer alive; dropping it releases
/// them all. Sets from several messages can be merged when records are
/// coalesced.
#[derive(Debug, Clone, Default)]
pub struct IoBufRef {
    bufs: SmallVec<[Arc<IoBuf>; 4]>,
}

impl IoBufRef {
    pub fn new() -> IoBufRef {
        IoBufRef::default()
    }

    /// A set holding a single buffer.
    pub fn of(buf: Arc<IoBuf>) -> IoBufRef {
        let mut set = IoBufRef::new();
        set.add(buf);
        set
    }

    /// Adds a buffer to the set. Adding the same allocation twice is a
    /// no-op; the set holds one handle per distinct buffer.
    pub fn add(&mut self, buf: Arc<IoBuf>) {
        if !self.bufs.iter().any(|b| Arc::ptr_eq(b, &buf)) {
            self.bufs.push(buf);
        }
    }

    /// Moves every reference from `other` into this set.
    pub fn merge(&mut self, other: IoBufRef) {
        for buf in other.bufs {
            self.add(buf);
        }
    }

    pub fn len(&self) -> usize {
        self.bufs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }
}
