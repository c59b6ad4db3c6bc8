//! Shared payload buffers.
//!
//! A [`Packet`] is the unit handed to `send`/`broadcast` and returned by
//! receive events. The same packet may sit in several outgoing queues at
//! once (broadcast fan-out, fragments), so the buffer is shared by
//! reference count and released when the last holder drops it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Delivery must be acknowledged; resends happen until it is.
pub const FLAG_RELIABLE: u32 = 1 << 0;
/// No sequencing with other packets. Not valid together with reliable.
pub const FLAG_UNSEQUENCED: u32 = 1 << 1;
/// The packet adopts a caller-supplied buffer instead of copying.
pub const FLAG_NO_ALLOCATE: u32 = 1 << 2;
/// Oversized packets fragment as unreliable instead of reliable sends.
pub const FLAG_UNRELIABLE_FRAGMENT: u32 = 1 << 3;
/// Set once the packet has left every queue it was entered into.
pub const FLAG_SENT: u32 = 1 << 8;

struct PacketInner {
    data: Vec<u8>,
    flags: u32,
    sent: AtomicBool,
}

/// A reference-counted payload with delivery flags.
#[derive(Clone)]
pub struct Packet {
    inner: Arc<PacketInner>,
}

impl Packet {
    /// Create a packet by copying `data`.
    pub fn new(data: &[u8], flags: u32) -> Self {
        Self::from_vec(data.to_vec(), flags)
    }

    /// Create a packet that adopts `data` without copying.
    pub fn from_vec(data: Vec<u8>, flags: u32) -> Self {
        Self {
            inner: Arc::new(PacketInner {
                data,
                flags,
                sent: AtomicBool::new(false),
            }),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.inner.data
    }

    pub fn len(&self) -> usize {
        self.inner.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.data.is_empty()
    }

    /// Creation flags plus [`FLAG_SENT`] once transmission finished.
    pub fn flags(&self) -> u32 {
        let mut flags = self.inner.flags;
        if self.inner.sent.load(Ordering::Relaxed) {
            flags |= FLAG_SENT;
        }
        flags
    }

    /// Number of live references: queued command holders plus user clones.
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub(crate) fn mark_sent(&self) {
        self.inner.sent.store(true, Ordering::Relaxed);
    }

    pub(crate) fn raw_flags(&self) -> u32 {
        self.inner.flags
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len())
            .field("flags", &self.flags())
            .field("refs", &self.reference_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_shares_the_buffer() {
        let packet = Packet::new(b"payload", FLAG_RELIABLE);
        let other = packet.clone();
        assert_eq!(packet.reference_count(), 2);
        assert_eq!(other.data(), b"payload");
        drop(other);
        assert_eq!(packet.reference_count(), 1);
    }

    #[test]
    fn sent_flag_appears_after_marking() {
        let packet = Packet::from_vec(vec![1, 2, 3], 0);
        assert_eq!(packet.flags() & FLAG_SENT, 0);
        packet.mark_sent();
        assert_ne!(packet.flags() & FLAG_SENT, 0);
    }
}
