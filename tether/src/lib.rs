//! # tether
//!
//! Reliable, ordered, multi-channel messaging over UDP.
//!
//! A [`Host`] multiplexes up to 4095 peers through a single socket and is
//! pumped by calling [`Host::service`] in a loop. Within a connection,
//! every channel is an independent substream offering four send
//! disciplines:
//!
//! - **Reliable ordered**: acknowledged and retransmitted until
//!   delivered, handed to the application in submission order.
//! - **Unreliable sequenced**: at-most-once, never delivered out of
//!   order, dropped at the sender under congestion.
//! - **Unsequenced**: fire-and-forget with duplicate suppression.
//! - **Fragmented**: packets exceeding the MTU are split and reassembled
//!   transparently, reliably or unreliably.
//!
//! Optional per-datagram compression (an adaptive order-2 PPM range
//! coder) and checksums can be enabled on a host; both apply to the whole
//! command stream of each datagram.
//!
//! ## Example
//!
//! ```no_run
//! use tether::{Address, Event, Host, HostConfig, Packet, FLAG_RELIABLE};
//!
//! let mut server = Host::bind(Some(Address::any(7777)), HostConfig::default()).unwrap();
//!
//! loop {
//!     match server.service(100).unwrap() {
//!         Some(Event::Connect { peer, .. }) => {
//!             server.send(peer, 0, Packet::new(b"welcome", FLAG_RELIABLE)).unwrap();
//!         }
//!         Some(Event::Receive { peer, channel_id, packet }) => {
//!             println!("{peer} sent {} bytes on channel {channel_id}", packet.len());
//!         }
//!         Some(Event::Disconnect { peer, .. }) => println!("{peer} left"),
//!         None => {}
//!     }
//! }
//! ```

mod address;
mod channel;
mod compress;
mod crc32;
mod error;
mod event;
mod host;
mod packet;
mod peer;
mod protocol;
mod service;
mod socket;
mod time;

pub use address::{Address, HOST_ANY, HOST_BROADCAST, PORT_ANY};
pub use compress::{Compressor, RangeCoder};
pub use error::{Result, TetherError};
pub use event::Event;
pub use host::{
    ChecksumCallback, Host, HostConfig, Intercept, InterceptCallback, DEFAULT_MTU,
    DEFAULT_MAXIMUM_PACKET_SIZE, DEFAULT_MAXIMUM_WAITING_DATA,
};
pub use packet::{
    Packet, FLAG_NO_ALLOCATE, FLAG_RELIABLE, FLAG_SENT, FLAG_UNRELIABLE_FRAGMENT, FLAG_UNSEQUENCED,
};
pub use peer::{PeerId, PeerState};
pub use protocol::{
    MAXIMUM_CHANNEL_COUNT, MAXIMUM_MTU, MAXIMUM_PEER_ID, MINIMUM_CHANNEL_COUNT, MINIMUM_MTU,
};
pub use time::{Clock, SteadyClock};

pub mod checksum {
    //! Checksum helpers usable as host checksum callbacks.
    pub use crate::crc32::{crc32, crc32_incremental, Hasher};
}

// Tracing macros - no-op when the feature is disabled.
#[cfg(feature = "tracing")]
macro_rules! trace_debug { ($($arg:tt)*) => { tracing::debug!($($arg)*) } }
#[cfg(not(feature = "tracing"))]
macro_rules! trace_debug { ($($arg:tt)*) => {{}} }

#[cfg(feature = "tracing")]
macro_rules! trace_warn { ($($arg:tt)*) => { tracing::warn!($($arg)*) } }
#[cfg(not(feature = "tracing"))]
macro_rules! trace_warn { ($($arg:tt)*) => {{}} }

pub(crate) use {trace_debug, trace_warn};
