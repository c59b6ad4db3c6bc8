//! Events surfaced by `Host::service`.

use crate::packet::Packet;
use crate::peer::PeerId;

/// Something that happened on a host.
#[derive(Debug, Clone)]
pub enum Event {
    /// A connection completed, either initiated locally or by the remote.
    /// `data` carries the 32-bit value the remote supplied at connect time.
    Connect { peer: PeerId, data: u32 },

    /// A peer disconnected or timed out. `data` carries the value supplied
    /// with the disconnect request, or 0 for timeouts.
    Disconnect { peer: PeerId, data: u32 },

    /// A packet arrived on `channel_id`.
    Receive {
        peer: PeerId,
        channel_id: u8,
        packet: Packet,
    },
}

impl Event {
    pub fn peer(&self) -> PeerId {
        match self {
            Event::Connect { peer, .. }
            | Event::Disconnect { peer, .. }
            | Event::Receive { peer, .. } => *peer,
        }
    }
}
