// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The single-owner payload container used on the message hot path.
//!
//! Incoming payload bytes are moved (never copied) across
//! receive -> dispatcher -> stage -> send. Pooled storage goes back to the
//! global pool exactly once, on dispose or drop, whichever comes first.

use super::pool;
use std::{fmt, ops::Range, sync::Arc};

/// A buffer rented from the global pool. Returns its storage on drop.
pub struct PooledBuf {
    buf: Option<Vec<u8>>,
}

impl PooledBuf {
    /// Wrap a rented buffer.
    pub fn new(buf: Vec<u8>) -> Self {
        Self { buf: Some(buf) }
    }

    /// The written bytes.
    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }

    /// Give the storage back to the pool early. Safe to call twice.
    pub fn release(&mut self) {
        if let Some(buf) = self.buf.take() {
            pool::give_back(buf);
        }
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.release();
    }
}

/// A non-owning window into bytes shared behind an `Arc`, for zero-copy
/// replies that reuse a slice of an inbound frame.
#[derive(Clone)]
pub struct SharedView {
    data: Arc<Vec<u8>>,
    range: Range<usize>,
}

impl SharedView {
    /// View `range` of the shared bytes.
    pub fn new(data: Arc<Vec<u8>>, range: Range<usize>) -> Self {
        debug_assert!(range.end <= data.len());
        Self { data, range }
    }

    /// The viewed bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.range.clone()]
    }
}

/// An opaque message payload with single-owner semantics.
pub enum Payload {
    /// The zero-length payload.
    Empty,
    /// An owned byte vector.
    Inline(Vec<u8>),
    /// A buffer rented from the global pool.
    Pooled(PooledBuf),
    /// A non-owning view into shared bytes.
    Shared(SharedView),
}

impl Payload {
    /// An empty payload.
    pub fn empty() -> Self {
        Payload::Empty
    }

    /// Wrap a pool-rented buffer.
    pub fn pooled(buf: Vec<u8>) -> Self {
        Payload::Pooled(PooledBuf::new(buf))
    }

    /// The payload length in bytes.
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Whether the payload is zero-length.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the payload bytes.
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Payload::Empty => &[],
            Payload::Inline(buf) => buf,
            Payload::Pooled(buf) => buf.as_slice(),
            Payload::Shared(view) => view.as_slice(),
        }
    }

    /// Transfer ownership out; the original behaves as empty afterwards.
    pub fn take(&mut self) -> Payload {
        std::mem::replace(self, Payload::Empty)
    }

    /// Release the payload. Pooled storage goes back to the pool; shared and
    /// empty payloads are untouched. Disposing twice is a no-op.
    pub fn dispose(&mut self) {
        *self = Payload::Empty;
    }

    /// Copy the payload into a fresh vector.
    pub fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Empty
    }
}

impl From<Vec<u8>> for Payload {
    fn from(buf: Vec<u8>) -> Self {
        if buf.is_empty() {
            Payload::Empty
        } else {
            Payload::Inline(buf)
        }
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload::from(bytes.to_vec())
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Payload::Empty => "Empty",
            Payload::Inline(_) => "Inline",
            Payload::Pooled(_) => "Pooled",
            Payload::Shared(_) => "Shared",
        };
        write!(f, "Payload::{}({} bytes)", kind, self.len())
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_leaves_empty() {
        let mut payload = Payload::from(vec![1, 2, 3]);
        let moved = payload.take();
        assert_eq!(moved.as_slice(), &[1, 2, 3]);
        assert!(payload.is_empty());
    }

    #[test]
    fn dispose_is_idempotent() {
        let mut payload = Payload::pooled({
            let mut buf = pool::rent(64);
            buf.extend_from_slice(b"abc");
            buf
        });
        payload.dispose();
        payload.dispose();
        assert!(payload.is_empty());
    }

    #[test]
    fn shared_views_alias_without_owning() {
        let data = Arc::new(vec![0u8, 1, 2, 3, 4]);
        let mut view = Payload::Shared(SharedView::new(data.clone(), 1..4));
        assert_eq!(view.as_slice(), &[1, 2, 3]);
        view.dispose();
        assert_eq!(&data[..], &[0, 1, 2, 3, 4]);
    }
}
