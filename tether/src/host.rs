//! Host: the engine owning one UDP socket and a table of peers.
//!
//! All protocol state is mutated from the service loop (`service`,
//! `flush` in `service.rs`); the functions here create hosts, initiate
//! connections and adjust configuration.

use std::collections::VecDeque;

use crate::address::Address;
use crate::channel::Channel;
use crate::compress::{Compressor, RangeCoder};
use crate::error::{Result, TetherError};
use crate::packet::Packet;
use crate::peer::{Peer, PeerId, PeerState, PACKET_THROTTLE_SCALE, WINDOW_SIZE_SCALE};
use crate::protocol::{
    Command, CommandBody, ConnectBody, COMMAND_BANDWIDTH_LIMIT, COMMAND_CONNECT,
    COMMAND_DISCONNECT, COMMAND_FLAG_ACKNOWLEDGE, COMMAND_FLAG_UNSEQUENCED, MAXIMUM_CHANNEL_COUNT,
    MAXIMUM_MTU, MAXIMUM_PEER_ID, MAXIMUM_WINDOW_SIZE, MINIMUM_CHANNEL_COUNT, MINIMUM_WINDOW_SIZE,
};
use crate::socket::Socket;
use crate::time::{Clock, SteadyClock};

/// Outgoing bandwidth is redistributed at most this often, in ms.
pub const BANDWIDTH_THROTTLE_INTERVAL: u32 = 1000;
pub const DEFAULT_MTU: u32 = 1400;
pub const DEFAULT_MAXIMUM_PACKET_SIZE: usize = 32 * 1024 * 1024;
pub const DEFAULT_MAXIMUM_WAITING_DATA: usize = 32 * 1024 * 1024;

/// Decision returned by an intercept callback for a raw datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intercept {
    /// The callback consumed the datagram; the engine skips it.
    Consume,
    /// Hand the datagram to the protocol as usual.
    Pass,
    /// Abort the receive pump with an error.
    Error,
}

pub type ChecksumCallback = Box<dyn Fn(&[u8]) -> u32 + Send>;
pub type InterceptCallback = Box<dyn FnMut(Address, &[u8]) -> Intercept + Send>;

/// Creation-time host parameters.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Peer slots to allocate, at most 4095.
    pub peer_count: usize,
    /// Channels allowed per connection, clamped to 1..=255.
    pub channel_limit: usize,
    /// Downstream budget in bytes/s; 0 means unlimited.
    pub incoming_bandwidth: u32,
    /// Upstream budget in bytes/s; 0 means unlimited.
    pub outgoing_bandwidth: u32,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            peer_count: 32,
            channel_limit: 1,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
        }
    }
}

pub struct Host {
    pub(crate) socket: Socket,
    pub(crate) address: Address,
    pub(crate) incoming_bandwidth: u32,
    pub(crate) outgoing_bandwidth: u32,
    pub(crate) bandwidth_throttle_epoch: u32,
    pub(crate) mtu: u32,
    pub(crate) random_seed: u32,
    pub(crate) recalculate_bandwidth_limits: bool,
    pub(crate) peers: Vec<Peer>,
    pub(crate) channel_limit: usize,
    pub(crate) service_time: u32,
    pub(crate) dispatch_queue: VecDeque<usize>,
    pub(crate) continue_sending: bool,
    pub(crate) command_count: usize,
    pub(crate) packet_size: usize,
    pub(crate) header_flags: u16,
    pub(crate) command_buffer: Vec<u8>,
    pub(crate) send_scratch: Vec<u8>,
    pub(crate) receive_buffer: Vec<u8>,
    pub(crate) decompress_scratch: Vec<u8>,
    pub(crate) compress_scratch: Vec<u8>,
    pub(crate) received_address: Address,
    pub(crate) checksum: Option<ChecksumCallback>,
    pub(crate) compressor: Option<Box<dyn Compressor>>,
    pub(crate) intercept: Option<InterceptCallback>,
    pub(crate) connected_peers: usize,
    pub(crate) bandwidth_limited_peers: usize,
    pub(crate) duplicate_peers: usize,
    pub(crate) maximum_packet_size: usize,
    pub(crate) maximum_waiting_data: usize,
    pub(crate) total_sent_data: u32,
    pub(crate) total_sent_packets: u32,
    pub(crate) total_received_data: u32,
    pub(crate) total_received_packets: u32,
    pub(crate) clock: Box<dyn Clock>,
}

impl Host {
    /// Bind a host. `address` of `None` binds an ephemeral client socket.
    pub fn bind(address: Option<Address>, config: HostConfig) -> Result<Self> {
        if config.peer_count > MAXIMUM_PEER_ID as usize {
            return Err(TetherError::InvalidArgument("too many peers requested"));
        }

        let bind_address = address.unwrap_or(Address::any(0));
        let socket = Socket::bind(bind_address)?;
        let local_address = socket.local_address()?;

        let channel_limit = clamp_channel_limit(config.channel_limit);

        let mut random_seed = rand::random::<u32>();
        random_seed = (random_seed << 16) | (random_seed >> 16);

        let peers = (0..config.peer_count)
            .map(|index| Peer::new(index as u16, DEFAULT_MTU))
            .collect();

        Ok(Self {
            socket,
            address: local_address,
            incoming_bandwidth: config.incoming_bandwidth,
            outgoing_bandwidth: config.outgoing_bandwidth,
            bandwidth_throttle_epoch: 0,
            mtu: DEFAULT_MTU,
            random_seed,
            recalculate_bandwidth_limits: false,
            peers,
            channel_limit,
            service_time: 0,
            dispatch_queue: VecDeque::new(),
            continue_sending: false,
            command_count: 0,
            packet_size: 0,
            header_flags: 0,
            command_buffer: Vec::with_capacity(MAXIMUM_MTU as usize),
            send_scratch: Vec::with_capacity(MAXIMUM_MTU as usize),
            receive_buffer: vec![0u8; MAXIMUM_MTU as usize],
            decompress_scratch: vec![0u8; MAXIMUM_MTU as usize],
            compress_scratch: Vec::with_capacity(MAXIMUM_MTU as usize),
            received_address: Address::default(),
            checksum: None,
            compressor: None,
            intercept: None,
            connected_peers: 0,
            bandwidth_limited_peers: 0,
            duplicate_peers: MAXIMUM_PEER_ID as usize,
            maximum_packet_size: DEFAULT_MAXIMUM_PACKET_SIZE,
            maximum_waiting_data: DEFAULT_MAXIMUM_WAITING_DATA,
            total_sent_data: 0,
            total_sent_packets: 0,
            total_received_data: 0,
            total_received_packets: 0,
            clock: Box::new(SteadyClock::new()),
        })
    }

    /// Initiate a connection. The returned peer completes the handshake
    /// asynchronously; wait for the `Connect` event.
    pub fn connect(
        &mut self,
        address: Address,
        channel_count: usize,
        data: u32,
    ) -> Result<PeerId> {
        let channel_count = channel_count.clamp(MINIMUM_CHANNEL_COUNT, MAXIMUM_CHANNEL_COUNT);

        let index = self
            .peers
            .iter()
            .position(|peer| peer.state == PeerState::Disconnected)
            .ok_or(TetherError::ResourceExhausted("no free peer slots"))?;

        self.random_seed = self.random_seed.wrapping_add(1);
        let connect_id = self.random_seed;

        let window_size = initial_window_size(self.outgoing_bandwidth);
        let peer = &mut self.peers[index];
        peer.channels = (0..channel_count).map(|_| Channel::new()).collect();
        peer.state = PeerState::Connecting;
        peer.address = address;
        peer.connect_id = connect_id;
        peer.window_size = window_size;

        let command = Command::new(
            COMMAND_CONNECT | COMMAND_FLAG_ACKNOWLEDGE,
            0xFF,
            CommandBody::Connect(ConnectBody {
                outgoing_peer_id: peer.incoming_peer_id,
                incoming_session_id: peer.incoming_session_id,
                outgoing_session_id: peer.outgoing_session_id,
                mtu: peer.mtu,
                window_size: peer.window_size,
                channel_count: channel_count as u32,
                incoming_bandwidth: self.incoming_bandwidth,
                outgoing_bandwidth: self.outgoing_bandwidth,
                packet_throttle_interval: peer.packet_throttle_interval,
                packet_throttle_acceleration: peer.packet_throttle_acceleration,
                packet_throttle_deceleration: peer.packet_throttle_deceleration,
                connect_id,
                data,
            }),
        );
        peer.queue_outgoing_command(command, None, 0, 0);

        Ok(PeerId(index))
    }

    /// Queue a packet to one peer.
    pub fn send(&mut self, peer: PeerId, channel_id: u8, packet: Packet) -> Result<()> {
        let maximum_packet_size = self.maximum_packet_size;
        let has_checksum = self.checksum.is_some();
        self.peers[peer.0].send(channel_id, packet, maximum_packet_size, has_checksum)
    }

    /// Queue a packet to every connected peer.
    pub fn broadcast(&mut self, channel_id: u8, packet: Packet) {
        let maximum_packet_size = self.maximum_packet_size;
        let has_checksum = self.checksum.is_some();
        for peer in &mut self.peers {
            if peer.state != PeerState::Connected {
                continue;
            }
            let _ = peer.send(channel_id, packet.clone(), maximum_packet_size, has_checksum);
        }
    }

    /// Request a graceful disconnect; the remote acknowledges before the
    /// `Disconnect` event surfaces.
    pub fn disconnect(&mut self, peer: PeerId, data: u32) {
        let index = peer.0;
        let state = self.peers[index].state;
        if matches!(
            state,
            PeerState::Disconnecting
                | PeerState::Disconnected
                | PeerState::AcknowledgingDisconnect
                | PeerState::Zombie
        ) {
            return;
        }

        self.reset_peer_queues(index);

        let mut command_byte = COMMAND_DISCONNECT;
        if state == PeerState::Connected || state == PeerState::DisconnectLater {
            command_byte |= COMMAND_FLAG_ACKNOWLEDGE;
        } else {
            command_byte |= COMMAND_FLAG_UNSEQUENCED;
        }
        let command = Command::new(command_byte, 0xFF, CommandBody::Disconnect { data });
        self.peers[index].queue_outgoing_command(command, None, 0, 0);

        if state == PeerState::Connected || state == PeerState::DisconnectLater {
            self.peer_on_disconnect(index);
            self.peers[index].state = PeerState::Disconnecting;
        } else {
            self.flush();
            self.reset_peer(index);
        }
    }

    /// Disconnect once every queued outgoing packet has been delivered.
    pub fn disconnect_later(&mut self, peer: PeerId, data: u32) {
        let index = peer.0;
        let state = self.peers[index].state;
        if (state == PeerState::Connected || state == PeerState::DisconnectLater)
            && !self.peers[index].outgoing_queues_empty()
        {
            self.peers[index].state = PeerState::DisconnectLater;
            self.peers[index].event_data = data;
        } else {
            self.disconnect(peer, data);
        }
    }

    /// Disconnect immediately. The notification is sent once, unreliably;
    /// no `Disconnect` event is generated locally.
    pub fn disconnect_now(&mut self, peer: PeerId, data: u32) {
        let index = peer.0;
        let state = self.peers[index].state;
        if state == PeerState::Disconnected {
            return;
        }

        if state != PeerState::Zombie && state != PeerState::Disconnecting {
            self.reset_peer_queues(index);
            let command = Command::new(
                COMMAND_DISCONNECT | COMMAND_FLAG_UNSEQUENCED,
                0xFF,
                CommandBody::Disconnect { data },
            );
            self.peers[index].queue_outgoing_command(command, None, 0, 0);
            self.flush();
        }

        self.reset_peer(index);
    }

    /// Drop all connection state for a peer without notifying the remote.
    pub fn reset_peer_connection(&mut self, peer: PeerId) {
        self.reset_peer(peer.0);
    }

    pub fn ping(&mut self, peer: PeerId) {
        self.peers[peer.0].ping();
    }

    pub fn set_ping_interval(&mut self, peer: PeerId, interval: u32) {
        self.peers[peer.0].set_ping_interval(interval);
    }

    /// Adjust a peer's retransmission timeout policy; 0 restores defaults.
    pub fn set_timeout(&mut self, peer: PeerId, limit: u32, minimum: u32, maximum: u32) {
        self.peers[peer.0].set_timeout(limit, minimum, maximum);
    }

    pub fn throttle_configure(
        &mut self,
        peer: PeerId,
        interval: u32,
        acceleration: u32,
        deceleration: u32,
    ) {
        self.peers[peer.0].throttle_configure(interval, acceleration, deceleration);
    }

    /// Change the channel cap applied to future incoming connections.
    pub fn set_channel_limit(&mut self, channel_limit: usize) {
        self.channel_limit = clamp_channel_limit(channel_limit);
    }

    pub fn channel_limit(&self) -> usize {
        self.channel_limit
    }

    /// Adjust bandwidth budgets; peers learn of the change via
    /// BANDWIDTH_LIMIT commands at the next throttle interval.
    pub fn set_bandwidth_limit(&mut self, incoming_bandwidth: u32, outgoing_bandwidth: u32) {
        self.incoming_bandwidth = incoming_bandwidth;
        self.outgoing_bandwidth = outgoing_bandwidth;
        self.recalculate_bandwidth_limits = true;
    }

    /// Install or remove a packet compressor.
    pub fn set_compressor(&mut self, compressor: Option<Box<dyn Compressor>>) {
        self.compressor = compressor;
    }

    /// Compress packets with the built-in range coder.
    pub fn compress_with_range_coder(&mut self) {
        self.set_compressor(Some(Box::new(RangeCoder::new())));
    }

    /// Install or remove the datagram checksum callback.
    pub fn set_checksum(&mut self, checksum: Option<ChecksumCallback>) {
        self.checksum = checksum;
    }

    /// Checksum datagrams with CRC32.
    pub fn checksum_crc32(&mut self) {
        self.set_checksum(Some(Box::new(|data| crate::crc32::crc32(data))));
    }

    /// Install a raw-datagram intercept callback.
    pub fn set_intercept(&mut self, intercept: Option<InterceptCallback>) {
        self.intercept = intercept;
    }

    /// Cap concurrent connections accepted from one IP.
    pub fn set_duplicate_peers(&mut self, limit: usize) {
        self.duplicate_peers = if limit == 0 {
            MAXIMUM_PEER_ID as usize
        } else {
            limit
        };
    }

    pub fn set_maximum_packet_size(&mut self, limit: usize) {
        self.maximum_packet_size = limit;
    }

    pub fn set_maximum_waiting_data(&mut self, limit: usize) {
        self.maximum_waiting_data = limit;
    }

    /// Replace the engine clock. Meant for tests driving virtual time.
    pub fn set_clock(&mut self, clock: Box<dyn Clock>) {
        self.clock = clock;
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn connected_peers(&self) -> usize {
        self.connected_peers
    }

    /// Handle for a peer slot, if the index is in range.
    pub fn peer_id(&self, index: usize) -> Option<PeerId> {
        (index < self.peers.len()).then_some(PeerId(index))
    }

    pub fn peer_state(&self, peer: PeerId) -> PeerState {
        self.peers[peer.0].state
    }

    pub fn peer_address(&self, peer: PeerId) -> Address {
        self.peers[peer.0].address
    }

    /// Smoothed RTT for the peer, in milliseconds.
    pub fn peer_round_trip_time(&self, peer: PeerId) -> u32 {
        self.peers[peer.0].round_trip_time
    }

    /// Reliable-packet loss ratio scaled by 2^16.
    pub fn peer_packet_loss(&self, peer: PeerId) -> u32 {
        self.peers[peer.0].packet_loss
    }

    pub fn peer_channel_count(&self, peer: PeerId) -> usize {
        self.peers[peer.0].channels.len()
    }

    pub fn total_sent_data(&self) -> u32 {
        self.total_sent_data
    }

    pub fn total_sent_packets(&self) -> u32 {
        self.total_sent_packets
    }

    pub fn total_received_data(&self) -> u32 {
        self.total_received_data
    }

    pub fn total_received_packets(&self) -> u32 {
        self.total_received_packets
    }

    /// Redistribute outgoing bandwidth across connected peers and, when
    /// limits changed, notify them with BANDWIDTH_LIMIT commands.
    pub(crate) fn bandwidth_throttle(&mut self) {
        let time_current = self.clock.now();
        let elapsed_time = time_current.wrapping_sub(self.bandwidth_throttle_epoch);

        if elapsed_time < BANDWIDTH_THROTTLE_INTERVAL {
            return;
        }
        self.bandwidth_throttle_epoch = time_current;

        let mut peers_remaining = self.connected_peers as u32;
        if peers_remaining == 0 {
            return;
        }

        let mut data_total = u32::MAX;
        let mut bandwidth = u32::MAX;
        let mut throttle;
        let mut bandwidth_limit = 0u32;
        let mut needs_adjustment = self.bandwidth_limited_peers > 0;

        if self.outgoing_bandwidth != 0 {
            data_total = 0;
            bandwidth = (self.outgoing_bandwidth as u64 * elapsed_time as u64 / 1000) as u32;

            for peer in &self.peers {
                if peer.state != PeerState::Connected && peer.state != PeerState::DisconnectLater {
                    continue;
                }
                data_total = data_total.saturating_add(peer.outgoing_data_total);
            }
        }

        while peers_remaining > 0 && needs_adjustment {
            needs_adjustment = false;

            throttle = if data_total <= bandwidth {
                PACKET_THROTTLE_SCALE
            } else {
                (bandwidth as u64 * PACKET_THROTTLE_SCALE as u64 / data_total as u64) as u32
            };

            for peer in &mut self.peers {
                if (peer.state != PeerState::Connected
                    && peer.state != PeerState::DisconnectLater)
                    || peer.incoming_bandwidth == 0
                    || peer.outgoing_bandwidth_throttle_epoch == time_current
                {
                    continue;
                }

                let peer_bandwidth =
                    (peer.incoming_bandwidth as u64 * elapsed_time as u64 / 1000) as u32;
                if throttle as u64 * peer.outgoing_data_total as u64
                    / PACKET_THROTTLE_SCALE as u64
                    <= peer_bandwidth as u64
                {
                    continue;
                }

                peer.packet_throttle_limit = (peer_bandwidth as u64
                    * PACKET_THROTTLE_SCALE as u64
                    / peer.outgoing_data_total as u64)
                    .max(1) as u32;
                if peer.packet_throttle > peer.packet_throttle_limit {
                    peer.packet_throttle = peer.packet_throttle_limit;
                }
                peer.outgoing_bandwidth_throttle_epoch = time_current;
                peer.incoming_data_total = 0;
                peer.outgoing_data_total = 0;

                needs_adjustment = true;
                peers_remaining -= 1;
                bandwidth = bandwidth.saturating_sub(peer_bandwidth);
                data_total = data_total.saturating_sub(peer_bandwidth);
            }
        }

        if peers_remaining > 0 {
            throttle = if data_total <= bandwidth {
                PACKET_THROTTLE_SCALE
            } else {
                (bandwidth as u64 * PACKET_THROTTLE_SCALE as u64 / data_total as u64) as u32
            };

            for peer in &mut self.peers {
                if (peer.state != PeerState::Connected
                    && peer.state != PeerState::DisconnectLater)
                    || peer.outgoing_bandwidth_throttle_epoch == time_current
                {
                    continue;
                }
                peer.packet_throttle_limit = throttle;
                if peer.packet_throttle > peer.packet_throttle_limit {
                    peer.packet_throttle = peer.packet_throttle_limit;
                }
                peer.incoming_data_total = 0;
                peer.outgoing_data_total = 0;
            }
        }

        if self.recalculate_bandwidth_limits {
            self.recalculate_bandwidth_limits = false;

            let mut peers_remaining = self.connected_peers as u32;
            let mut bandwidth = self.incoming_bandwidth;
            let mut needs_adjustment = true;

            if bandwidth == 0 {
                bandwidth_limit = 0;
            } else {
                while peers_remaining > 0 && needs_adjustment {
                    needs_adjustment = false;
                    bandwidth_limit = bandwidth / peers_remaining;

                    for peer in &mut self.peers {
                        if (peer.state != PeerState::Connected
                            && peer.state != PeerState::DisconnectLater)
                            || peer.incoming_bandwidth_throttle_epoch == time_current
                        {
                            continue;
                        }
                        if peer.outgoing_bandwidth > 0
                            && peer.outgoing_bandwidth >= bandwidth_limit
                        {
                            continue;
                        }

                        peer.incoming_bandwidth_throttle_epoch = time_current;
                        needs_adjustment = true;
                        peers_remaining -= 1;
                        bandwidth = bandwidth.saturating_sub(peer.outgoing_bandwidth);
                    }
                }
            }

            let outgoing_bandwidth = self.outgoing_bandwidth;
            for peer in &mut self.peers {
                if peer.state != PeerState::Connected && peer.state != PeerState::DisconnectLater {
                    continue;
                }

                let incoming = if peer.incoming_bandwidth_throttle_epoch == time_current {
                    peer.outgoing_bandwidth
                } else {
                    bandwidth_limit
                };
                let command = Command::new(
                    COMMAND_BANDWIDTH_LIMIT | COMMAND_FLAG_ACKNOWLEDGE,
                    0xFF,
                    CommandBody::BandwidthLimit {
                        incoming_bandwidth: incoming,
                        outgoing_bandwidth,
                    },
                );
                peer.queue_outgoing_command(command, None, 0, 0);
            }
        }
    }

    // -- peer bookkeeping shared with the service loop --

    pub(crate) fn peer_on_connect(&mut self, index: usize) {
        let peer = &self.peers[index];
        if peer.state != PeerState::Connected && peer.state != PeerState::DisconnectLater {
            if peer.incoming_bandwidth != 0 {
                self.bandwidth_limited_peers += 1;
            }
            self.connected_peers += 1;
        }
    }

    pub(crate) fn peer_on_disconnect(&mut self, index: usize) {
        let peer = &self.peers[index];
        if peer.state == PeerState::Connected || peer.state == PeerState::DisconnectLater {
            if peer.incoming_bandwidth != 0 {
                self.bandwidth_limited_peers -= 1;
            }
            self.connected_peers -= 1;
        }
    }

    pub(crate) fn change_state(&mut self, index: usize, state: PeerState) {
        if state == PeerState::Connected || state == PeerState::DisconnectLater {
            self.peer_on_connect(index);
        } else {
            self.peer_on_disconnect(index);
        }
        self.peers[index].state = state;
    }

    /// Change state and queue the peer for event dispatch.
    pub(crate) fn dispatch_state(&mut self, index: usize, state: PeerState) {
        self.change_state(index, state);
        if !self.peers[index].needs_dispatch {
            self.peers[index].needs_dispatch = true;
            self.dispatch_queue.push_back(index);
        }
    }

    /// Queue the peer for dispatch when it has deliverable commands.
    pub(crate) fn schedule_dispatch(&mut self, index: usize) {
        let peer = &mut self.peers[index];
        if !peer.needs_dispatch && !peer.dispatched_commands.is_empty() {
            peer.needs_dispatch = true;
            self.dispatch_queue.push_back(index);
        }
    }

    pub(crate) fn reset_peer_queues(&mut self, index: usize) {
        if self.peers[index].needs_dispatch {
            self.dispatch_queue.retain(|&queued| queued != index);
            self.peers[index].needs_dispatch = false;
        }
        self.peers[index].reset_queues();
    }

    pub(crate) fn reset_peer(&mut self, index: usize) {
        self.peer_on_disconnect(index);
        self.reset_peer_queues(index);
        let mtu = self.mtu;
        self.peers[index].reset(mtu);
    }
}

pub(crate) fn clamp_channel_limit(channel_limit: usize) -> usize {
    if channel_limit == 0 || channel_limit > MAXIMUM_CHANNEL_COUNT {
        MAXIMUM_CHANNEL_COUNT
    } else if channel_limit < MINIMUM_CHANNEL_COUNT {
        MINIMUM_CHANNEL_COUNT
    } else {
        channel_limit
    }
}

/// Window size derived from one side's bandwidth cap at connect time.
pub(crate) fn initial_window_size(bandwidth: u32) -> u32 {
    let window_size = if bandwidth == 0 {
        MAXIMUM_WINDOW_SIZE
    } else {
        (bandwidth / WINDOW_SIZE_SCALE) * MINIMUM_WINDOW_SIZE
    };
    window_size.clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE)
}

/// Window size negotiated from both sides' bandwidth caps.
pub(crate) fn negotiated_window_size(local: u32, remote: u32) -> u32 {
    let window_size = if local == 0 && remote == 0 {
        MAXIMUM_WINDOW_SIZE
    } else if local == 0 || remote == 0 {
        (local.max(remote) / WINDOW_SIZE_SCALE) * MINIMUM_WINDOW_SIZE
    } else {
        (local.min(remote) / WINDOW_SIZE_SCALE) * MINIMUM_WINDOW_SIZE
    };
    window_size.clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_ephemeral_host() {
        let host = Host::bind(None, HostConfig::default()).unwrap();
        assert!(host.address().port > 0);
        assert_eq!(host.peer_count(), 32);
        assert_eq!(host.connected_peers(), 0);
    }

    #[test]
    fn peer_count_cap_is_enforced() {
        let config = HostConfig {
            peer_count: MAXIMUM_PEER_ID as usize + 1,
            ..HostConfig::default()
        };
        assert!(Host::bind(None, config).is_err());
    }

    #[test]
    fn channel_limit_is_clamped() {
        let mut host = Host::bind(None, HostConfig::default()).unwrap();
        host.set_channel_limit(0);
        assert_eq!(host.channel_limit(), MAXIMUM_CHANNEL_COUNT);
        host.set_channel_limit(4);
        assert_eq!(host.channel_limit(), 4);
        host.set_channel_limit(10_000);
        assert_eq!(host.channel_limit(), MAXIMUM_CHANNEL_COUNT);
    }

    #[test]
    fn connect_consumes_a_slot_and_queues_the_handshake() {
        let mut host = Host::bind(
            None,
            HostConfig {
                peer_count: 1,
                ..HostConfig::default()
            },
        )
        .unwrap();
        let target = Address::new(0x7F000001, 9999);
        let peer = host.connect(target, 2, 7).unwrap();
        assert_eq!(host.peer_state(peer), PeerState::Connecting);
        assert_eq!(host.peer_address(peer), target);
        assert_eq!(host.peer_channel_count(peer), 2);
        assert!(host.connect(target, 2, 7).is_err());
    }

    #[test]
    fn window_size_negotiation_clamps() {
        assert_eq!(negotiated_window_size(0, 0), MAXIMUM_WINDOW_SIZE);
        assert_eq!(negotiated_window_size(0, 64 * 1024), MINIMUM_WINDOW_SIZE);
        assert_eq!(
            negotiated_window_size(8 * 64 * 1024, 4 * 64 * 1024),
            4 * MINIMUM_WINDOW_SIZE
        );
        assert_eq!(initial_window_size(0), MAXIMUM_WINDOW_SIZE);
        assert_eq!(initial_window_size(1), MINIMUM_WINDOW_SIZE);
    }
}
