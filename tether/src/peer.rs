//! Peer state.
//!
//! A peer is one remote endpoint of a host: its handshake state machine,
//! channels, the eight command queues, round-trip estimation and the
//! unreliable-packet throttle. Everything here is driven by the host's
//! service loop; nothing touches the socket directly.

use std::collections::VecDeque;

use crate::address::Address;
use crate::channel::{
    Channel, FREE_RELIABLE_WINDOWS, RELIABLE_WINDOWS, RELIABLE_WINDOW_SIZE,
};
use crate::error::{Result, TetherError};
use crate::packet::{
    Packet, FLAG_RELIABLE, FLAG_UNRELIABLE_FRAGMENT, FLAG_UNSEQUENCED,
};
use crate::protocol::{
    command_size, Command, CommandBody, FragmentBody, CHECKSUM_SIZE, COMMAND_ACKNOWLEDGE,
    COMMAND_FLAG_ACKNOWLEDGE, COMMAND_FLAG_UNSEQUENCED, COMMAND_PING, COMMAND_SEND_FRAGMENT,
    COMMAND_SEND_RELIABLE, COMMAND_SEND_UNRELIABLE, COMMAND_SEND_UNRELIABLE_FRAGMENT,
    COMMAND_SEND_UNSEQUENCED, COMMAND_THROTTLE_CONFIGURE, HEADER_SIZE_SENT_TIME,
    MAXIMUM_FRAGMENT_COUNT, MAXIMUM_PEER_ID, MAXIMUM_WINDOW_SIZE,
};

pub const DEFAULT_ROUND_TRIP_TIME: u32 = 500;
pub const DEFAULT_PACKET_THROTTLE: u32 = 32;
pub const PACKET_THROTTLE_SCALE: u32 = 32;
pub const PACKET_THROTTLE_COUNTER: u32 = 7;
pub const PACKET_THROTTLE_ACCELERATION: u32 = 2;
pub const PACKET_THROTTLE_DECELERATION: u32 = 2;
pub const PACKET_THROTTLE_INTERVAL: u32 = 5000;
pub const PACKET_LOSS_SCALE: u32 = 1 << 16;
pub const PACKET_LOSS_INTERVAL: u32 = 10_000;
pub const WINDOW_SIZE_SCALE: u32 = 64 * 1024;
pub const TIMEOUT_LIMIT: u32 = 32;
pub const TIMEOUT_MINIMUM: u32 = 5000;
pub const TIMEOUT_MAXIMUM: u32 = 30_000;
pub const PING_INTERVAL: u32 = 500;
pub const UNSEQUENCED_WINDOWS: u32 = 64;
pub const UNSEQUENCED_WINDOW_SIZE: u32 = 1024;
pub const FREE_UNSEQUENCED_WINDOWS: u32 = 32;

/// Stable handle to a peer slot on a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub(crate) usize);

impl PeerId {
    /// Slot index on the owning host.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Connection state machine. Variant order matches the protocol's state
/// numbering; ordered comparisons rely on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PeerState {
    Disconnected,
    Connecting,
    AcknowledgingConnect,
    ConnectionPending,
    ConnectionSucceeded,
    Connected,
    DisconnectLater,
    Disconnecting,
    AcknowledgingDisconnect,
    Zombie,
}

pub(crate) struct Acknowledgement {
    pub sent_time: u16,
    pub command: Command,
}

pub(crate) struct OutgoingCommand {
    pub reliable_sequence_number: u16,
    pub unreliable_sequence_number: u16,
    pub sent_time: u32,
    pub round_trip_timeout: u32,
    pub round_trip_timeout_limit: u32,
    pub fragment_offset: u32,
    pub fragment_length: u16,
    pub send_attempts: u16,
    pub command: Command,
    pub packet: Option<Packet>,
}

impl OutgoingCommand {
    fn new(command: Command, packet: Option<Packet>, offset: u32, length: u16) -> Self {
        Self {
            reliable_sequence_number: 0,
            unreliable_sequence_number: 0,
            sent_time: 0,
            round_trip_timeout: 0,
            round_trip_timeout_limit: 0,
            fragment_offset: offset,
            fragment_length: length,
            send_attempts: 0,
            command,
            packet,
        }
    }

    /// Release the packet reference, tagging the packet as fully sent when
    /// this was the last queue holding it.
    pub fn release_packet(&mut self) {
        if let Some(packet) = self.packet.take() {
            if packet.reference_count() == 1 {
                packet.mark_sent();
            }
        }
    }
}

pub(crate) struct IncomingCommand {
    pub reliable_sequence_number: u16,
    pub unreliable_sequence_number: u16,
    pub command: Command,
    pub fragment_count: u32,
    pub fragments_remaining: u32,
    /// One bit per fragment already applied.
    pub fragments: Vec<u32>,
    pub data: Vec<u8>,
    pub flags: u32,
}

impl IncomingCommand {
    pub fn into_packet(self) -> Packet {
        Packet::from_vec(self.data, self.flags)
    }

    pub fn has_fragment(&self, number: u32) -> bool {
        self.fragments[(number / 32) as usize] & (1 << (number % 32)) != 0
    }

    pub fn mark_fragment(&mut self, number: u32) {
        self.fragments[(number / 32) as usize] |= 1 << (number % 32);
    }
}

/// Outcome of queueing an incoming command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IncomingResult {
    Queued,
    /// Benign drop (duplicate, stale window, draining peer).
    Discarded,
    /// Back-pressure or resource failure; the datagram is abandoned.
    Exhausted,
}

pub(crate) struct Peer {
    pub state: PeerState,
    pub incoming_peer_id: u16,
    pub outgoing_peer_id: u16,
    pub connect_id: u32,
    pub outgoing_session_id: u8,
    pub incoming_session_id: u8,
    pub address: Address,
    pub channels: Vec<Channel>,
    pub incoming_bandwidth: u32,
    pub outgoing_bandwidth: u32,
    pub incoming_bandwidth_throttle_epoch: u32,
    pub outgoing_bandwidth_throttle_epoch: u32,
    pub incoming_data_total: u32,
    pub outgoing_data_total: u32,
    pub last_send_time: u32,
    pub last_receive_time: u32,
    pub next_timeout: u32,
    pub earliest_timeout: u32,
    pub packet_loss_epoch: u32,
    pub packets_sent: u32,
    pub packets_lost: u32,
    pub packet_loss: u32,
    pub packet_loss_variance: u32,
    pub packet_throttle: u32,
    pub packet_throttle_limit: u32,
    pub packet_throttle_counter: u32,
    pub packet_throttle_epoch: u32,
    pub packet_throttle_acceleration: u32,
    pub packet_throttle_deceleration: u32,
    pub packet_throttle_interval: u32,
    pub ping_interval: u32,
    pub timeout_limit: u32,
    pub timeout_minimum: u32,
    pub timeout_maximum: u32,
    pub last_round_trip_time: u32,
    pub lowest_round_trip_time: u32,
    pub last_round_trip_time_variance: u32,
    pub highest_round_trip_time_variance: u32,
    pub round_trip_time: u32,
    pub round_trip_time_variance: u32,
    pub mtu: u32,
    pub window_size: u32,
    pub reliable_data_in_transit: u32,
    pub outgoing_reliable_sequence_number: u16,
    pub acknowledgements: VecDeque<Acknowledgement>,
    pub sent_reliable_commands: VecDeque<OutgoingCommand>,
    pub sent_unreliable_commands: VecDeque<OutgoingCommand>,
    pub outgoing_reliable_commands: VecDeque<OutgoingCommand>,
    pub outgoing_unreliable_commands: VecDeque<OutgoingCommand>,
    pub dispatched_commands: VecDeque<IncomingCommand>,
    /// True while the peer sits in the host's dispatch queue.
    pub needs_dispatch: bool,
    pub incoming_unsequenced_group: u16,
    pub outgoing_unsequenced_group: u16,
    pub unsequenced_window: [u32; (UNSEQUENCED_WINDOW_SIZE / 32) as usize],
    pub event_data: u32,
    pub total_waiting_data: usize,
}

impl Peer {
    pub fn new(incoming_peer_id: u16, host_mtu: u32) -> Self {
        let mut peer = Self {
            state: PeerState::Disconnected,
            incoming_peer_id,
            outgoing_peer_id: MAXIMUM_PEER_ID,
            connect_id: 0,
            outgoing_session_id: 0xFF,
            incoming_session_id: 0xFF,
            address: Address::default(),
            channels: Vec::new(),
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            incoming_bandwidth_throttle_epoch: 0,
            outgoing_bandwidth_throttle_epoch: 0,
            incoming_data_total: 0,
            outgoing_data_total: 0,
            last_send_time: 0,
            last_receive_time: 0,
            next_timeout: 0,
            earliest_timeout: 0,
            packet_loss_epoch: 0,
            packets_sent: 0,
            packets_lost: 0,
            packet_loss: 0,
            packet_loss_variance: 0,
            packet_throttle: 0,
            packet_throttle_limit: 0,
            packet_throttle_counter: 0,
            packet_throttle_epoch: 0,
            packet_throttle_acceleration: 0,
            packet_throttle_deceleration: 0,
            packet_throttle_interval: 0,
            ping_interval: PING_INTERVAL,
            timeout_limit: TIMEOUT_LIMIT,
            timeout_minimum: TIMEOUT_MINIMUM,
            timeout_maximum: TIMEOUT_MAXIMUM,
            last_round_trip_time: 0,
            lowest_round_trip_time: 0,
            last_round_trip_time_variance: 0,
            highest_round_trip_time_variance: 0,
            round_trip_time: 0,
            round_trip_time_variance: 0,
            mtu: host_mtu,
            window_size: MAXIMUM_WINDOW_SIZE,
            reliable_data_in_transit: 0,
            outgoing_reliable_sequence_number: 0,
            acknowledgements: VecDeque::new(),
            sent_reliable_commands: VecDeque::new(),
            sent_unreliable_commands: VecDeque::new(),
            outgoing_reliable_commands: VecDeque::new(),
            outgoing_unreliable_commands: VecDeque::new(),
            dispatched_commands: VecDeque::new(),
            needs_dispatch: false,
            incoming_unsequenced_group: 0,
            outgoing_unsequenced_group: 0,
            unsequenced_window: [0; (UNSEQUENCED_WINDOW_SIZE / 32) as usize],
            event_data: 0,
            total_waiting_data: 0,
        };
        peer.reset(host_mtu);
        peer
    }

    /// Return the peer to the disconnected baseline. Idempotent.
    pub fn reset(&mut self, host_mtu: u32) {
        self.outgoing_peer_id = MAXIMUM_PEER_ID;
        self.connect_id = 0;
        self.state = PeerState::Disconnected;
        self.incoming_bandwidth = 0;
        self.outgoing_bandwidth = 0;
        self.incoming_bandwidth_throttle_epoch = 0;
        self.outgoing_bandwidth_throttle_epoch = 0;
        self.incoming_data_total = 0;
        self.outgoing_data_total = 0;
        self.last_send_time = 0;
        self.last_receive_time = 0;
        self.next_timeout = 0;
        self.earliest_timeout = 0;
        self.packet_loss_epoch = 0;
        self.packets_sent = 0;
        self.packets_lost = 0;
        self.packet_loss = 0;
        self.packet_loss_variance = 0;
        self.packet_throttle = DEFAULT_PACKET_THROTTLE;
        self.packet_throttle_limit = PACKET_THROTTLE_SCALE;
        self.packet_throttle_counter = 0;
        self.packet_throttle_epoch = 0;
        self.packet_throttle_acceleration = PACKET_THROTTLE_ACCELERATION;
        self.packet_throttle_deceleration = PACKET_THROTTLE_DECELERATION;
        self.packet_throttle_interval = PACKET_THROTTLE_INTERVAL;
        self.ping_interval = PING_INTERVAL;
        self.timeout_limit = TIMEOUT_LIMIT;
        self.timeout_minimum = TIMEOUT_MINIMUM;
        self.timeout_maximum = TIMEOUT_MAXIMUM;
        self.last_round_trip_time = DEFAULT_ROUND_TRIP_TIME;
        self.lowest_round_trip_time = DEFAULT_ROUND_TRIP_TIME;
        self.last_round_trip_time_variance = 0;
        self.highest_round_trip_time_variance = 0;
        self.round_trip_time = DEFAULT_ROUND_TRIP_TIME;
        self.round_trip_time_variance = 0;
        self.mtu = host_mtu;
        self.reliable_data_in_transit = 0;
        self.outgoing_reliable_sequence_number = 0;
        self.window_size = MAXIMUM_WINDOW_SIZE;
        self.incoming_unsequenced_group = 0;
        self.outgoing_unsequenced_group = 0;
        self.event_data = 0;
        self.total_waiting_data = 0;
        self.unsequenced_window = [0; (UNSEQUENCED_WINDOW_SIZE / 32) as usize];

        self.reset_queues();
    }

    /// Drop every queued command, acknowledgement and channel.
    pub fn reset_queues(&mut self) {
        self.acknowledgements.clear();
        for queue in [
            &mut self.sent_reliable_commands,
            &mut self.sent_unreliable_commands,
            &mut self.outgoing_reliable_commands,
            &mut self.outgoing_unreliable_commands,
        ] {
            queue.clear();
        }
        self.dispatched_commands.clear();
        self.channels.clear();
    }

    /// Adjust the unreliable-send probability from one RTT measurement.
    pub fn throttle(&mut self, rtt: u32) -> i32 {
        if self.last_round_trip_time <= self.last_round_trip_time_variance {
            self.packet_throttle = self.packet_throttle_limit;
        } else if rtt < self.last_round_trip_time {
            self.packet_throttle += self.packet_throttle_acceleration;
            if self.packet_throttle > self.packet_throttle_limit {
                self.packet_throttle = self.packet_throttle_limit;
            }
            return 1;
        } else if rtt > self.last_round_trip_time + 2 * self.last_round_trip_time_variance {
            if self.packet_throttle > self.packet_throttle_deceleration {
                self.packet_throttle -= self.packet_throttle_deceleration;
            } else {
                self.packet_throttle = 0;
            }
            return -1;
        }
        0
    }

    /// Reconfigure the throttle and tell the remote side.
    pub fn throttle_configure(&mut self, interval: u32, acceleration: u32, deceleration: u32) {
        self.packet_throttle_interval = interval;
        self.packet_throttle_acceleration = acceleration;
        self.packet_throttle_deceleration = deceleration;

        let command = Command::new(
            COMMAND_THROTTLE_CONFIGURE | COMMAND_FLAG_ACKNOWLEDGE,
            0xFF,
            CommandBody::ThrottleConfigure {
                interval,
                acceleration,
                deceleration,
            },
        );
        self.queue_outgoing_command(command, None, 0, 0);
    }

    /// Queue a packet for delivery, fragmenting when it exceeds the MTU.
    pub fn send(
        &mut self,
        channel_id: u8,
        packet: Packet,
        maximum_packet_size: usize,
        has_checksum: bool,
    ) -> Result<()> {
        if self.state != PeerState::Connected {
            return Err(TetherError::InvalidArgument("peer is not connected"));
        }
        if channel_id as usize >= self.channels.len() {
            return Err(TetherError::InvalidArgument("channel id out of range"));
        }
        if packet.len() > maximum_packet_size {
            return Err(TetherError::ResourceExhausted("packet exceeds maximum size"));
        }

        let mut fragment_length =
            self.mtu as usize - HEADER_SIZE_SENT_TIME - command_size(COMMAND_SEND_FRAGMENT);
        if has_checksum {
            fragment_length -= CHECKSUM_SIZE;
        }

        if packet.len() > fragment_length {
            return self.send_fragments(channel_id, packet, fragment_length);
        }

        let data_length = packet.len() as u16;
        let flags = packet.raw_flags();
        let channel = &self.channels[channel_id as usize];

        let command = if flags & (FLAG_RELIABLE | FLAG_UNSEQUENCED) == FLAG_UNSEQUENCED {
            Command::new(
                COMMAND_SEND_UNSEQUENCED | COMMAND_FLAG_UNSEQUENCED,
                channel_id,
                CommandBody::SendUnsequenced {
                    unsequenced_group: 0,
                    data_length,
                },
            )
        } else if flags & FLAG_RELIABLE != 0
            || channel.outgoing_unreliable_sequence_number >= 0xFFFF
        {
            Command::new(
                COMMAND_SEND_RELIABLE | COMMAND_FLAG_ACKNOWLEDGE,
                channel_id,
                CommandBody::SendReliable { data_length },
            )
        } else {
            Command::new(
                COMMAND_SEND_UNRELIABLE,
                channel_id,
                CommandBody::SendUnreliable {
                    unreliable_sequence_number: 0,
                    data_length,
                },
            )
        };

        let length = packet.len() as u16;
        self.queue_outgoing_command(command, Some(packet), 0, length);
        Ok(())
    }

    fn send_fragments(
        &mut self,
        channel_id: u8,
        packet: Packet,
        fragment_length: usize,
    ) -> Result<()> {
        let fragment_count = (packet.len() + fragment_length - 1) / fragment_length;
        if fragment_count as u32 > MAXIMUM_FRAGMENT_COUNT {
            return Err(TetherError::ResourceExhausted("fragment count exceeds maximum"));
        }

        let channel = &self.channels[channel_id as usize];
        let flags = packet.raw_flags();
        let (command_number, start_sequence_number) = if flags
            & (FLAG_RELIABLE | FLAG_UNRELIABLE_FRAGMENT)
            == FLAG_UNRELIABLE_FRAGMENT
            && channel.outgoing_unreliable_sequence_number < 0xFFFF
        {
            (
                COMMAND_SEND_UNRELIABLE_FRAGMENT,
                channel.outgoing_unreliable_sequence_number.wrapping_add(1),
            )
        } else {
            (
                COMMAND_SEND_FRAGMENT | COMMAND_FLAG_ACKNOWLEDGE,
                channel.outgoing_reliable_sequence_number.wrapping_add(1),
            )
        };

        let total_length = packet.len() as u32;
        let mut fragment_number = 0u32;
        let mut fragment_offset = 0usize;

        while fragment_offset < packet.len() {
            let this_length = fragment_length.min(packet.len() - fragment_offset);
            let command = Command::new(
                command_number,
                channel_id,
                CommandBody::SendFragment(FragmentBody {
                    start_sequence_number,
                    data_length: this_length as u16,
                    fragment_count: fragment_count as u32,
                    fragment_number,
                    total_length,
                    fragment_offset: fragment_offset as u32,
                }),
            );
            self.queue_outgoing_command(
                command,
                Some(packet.clone()),
                fragment_offset as u32,
                this_length as u16,
            );

            fragment_number += 1;
            fragment_offset += this_length;
        }

        Ok(())
    }

    /// Dequeue the next packet dispatched to the application.
    pub fn receive(&mut self) -> Option<(u8, Packet)> {
        let incoming = self.dispatched_commands.pop_front()?;
        let channel_id = incoming.command.channel_id;
        self.total_waiting_data = self.total_waiting_data.saturating_sub(incoming.data.len());
        Some((channel_id, incoming.into_packet()))
    }

    /// Queue a ping; pings keep RTT estimates fresh between payloads.
    pub fn ping(&mut self) {
        if self.state != PeerState::Connected {
            return;
        }
        let command = Command::new(
            COMMAND_PING | COMMAND_FLAG_ACKNOWLEDGE,
            0xFF,
            CommandBody::Ping,
        );
        self.queue_outgoing_command(command, None, 0, 0);
    }

    pub fn set_ping_interval(&mut self, interval: u32) {
        self.ping_interval = if interval != 0 { interval } else { PING_INTERVAL };
    }

    pub fn set_timeout(&mut self, limit: u32, minimum: u32, maximum: u32) {
        self.timeout_limit = if limit != 0 { limit } else { TIMEOUT_LIMIT };
        self.timeout_minimum = if minimum != 0 { minimum } else { TIMEOUT_MINIMUM };
        self.timeout_maximum = if maximum != 0 { maximum } else { TIMEOUT_MAXIMUM };
    }

    /// Record an acknowledgement to be sent. Returns false when the
    /// command sits too deep in a future window and must be ignored.
    pub fn queue_acknowledgement(&mut self, command: &Command, sent_time: u16) -> bool {
        if (command.channel_id as usize) < self.channels.len() {
            let channel = &self.channels[command.channel_id as usize];
            let mut reliable_window = Channel::reliable_window(command.reliable_sequence_number);
            let current_window =
                Channel::reliable_window(channel.incoming_reliable_sequence_number);

            if command.reliable_sequence_number < channel.incoming_reliable_sequence_number {
                reliable_window += RELIABLE_WINDOWS;
            }
            if reliable_window >= current_window + FREE_RELIABLE_WINDOWS - 1
                && reliable_window <= current_window + FREE_RELIABLE_WINDOWS
            {
                return false;
            }
        }

        self.outgoing_data_total += command_size(COMMAND_ACKNOWLEDGE) as u32;
        self.acknowledgements.push_back(Acknowledgement {
            sent_time,
            command: *command,
        });
        true
    }

    /// Stamp sequence numbers onto a freshly queued command and file it
    /// into the reliable or unreliable outgoing queue.
    pub fn setup_outgoing_command(&mut self, mut outgoing: OutgoingCommand) {
        self.outgoing_data_total +=
            command_size(outgoing.command.command) as u32 + outgoing.fragment_length as u32;

        if outgoing.command.channel_id == 0xFF {
            self.outgoing_reliable_sequence_number =
                self.outgoing_reliable_sequence_number.wrapping_add(1);
            outgoing.reliable_sequence_number = self.outgoing_reliable_sequence_number;
            outgoing.unreliable_sequence_number = 0;
        } else if outgoing.command.wants_acknowledge() {
            let channel = &mut self.channels[outgoing.command.channel_id as usize];
            channel.outgoing_reliable_sequence_number =
                channel.outgoing_reliable_sequence_number.wrapping_add(1);
            channel.outgoing_unreliable_sequence_number = 0;
            outgoing.reliable_sequence_number = channel.outgoing_reliable_sequence_number;
            outgoing.unreliable_sequence_number = 0;
        } else if outgoing.command.is_unsequenced() {
            self.outgoing_unsequenced_group = self.outgoing_unsequenced_group.wrapping_add(1);
            outgoing.reliable_sequence_number = 0;
            outgoing.unreliable_sequence_number = 0;
        } else {
            let channel = &mut self.channels[outgoing.command.channel_id as usize];
            if outgoing.fragment_offset == 0 {
                channel.outgoing_unreliable_sequence_number =
                    channel.outgoing_unreliable_sequence_number.wrapping_add(1);
            }
            outgoing.reliable_sequence_number = channel.outgoing_reliable_sequence_number;
            outgoing.unreliable_sequence_number = channel.outgoing_unreliable_sequence_number;
        }

        outgoing.send_attempts = 0;
        outgoing.sent_time = 0;
        outgoing.round_trip_timeout = 0;
        outgoing.round_trip_timeout_limit = 0;
        outgoing.command.reliable_sequence_number = outgoing.reliable_sequence_number;

        match &mut outgoing.command.body {
            CommandBody::SendUnreliable {
                unreliable_sequence_number,
                ..
            } => *unreliable_sequence_number = outgoing.unreliable_sequence_number,
            CommandBody::SendUnsequenced {
                unsequenced_group, ..
            } => *unsequenced_group = self.outgoing_unsequenced_group,
            _ => {}
        }

        if outgoing.command.wants_acknowledge() {
            self.outgoing_reliable_commands.push_back(outgoing);
        } else {
            self.outgoing_unreliable_commands.push_back(outgoing);
        }
    }

    pub fn queue_outgoing_command(
        &mut self,
        command: Command,
        packet: Option<Packet>,
        offset: u32,
        length: u16,
    ) {
        self.setup_outgoing_command(OutgoingCommand::new(command, packet, offset, length));
    }

    /// File a parsed command into the channel's incoming lists, keeping
    /// them ordered and deduplicated, then dispatch whatever became ready.
    ///
    /// `data_length` may exceed `data.len()` only for fragment
    /// placeholders, which allocate a zeroed buffer of the total length.
    pub fn queue_incoming_command(
        &mut self,
        command: Command,
        data: &[u8],
        data_length: usize,
        flags: u32,
        fragment_count: u32,
        maximum_waiting_data: usize,
    ) -> IncomingResult {
        let discard = |fragment_count: u32| {
            if fragment_count > 0 {
                IncomingResult::Exhausted
            } else {
                IncomingResult::Discarded
            }
        };

        if self.state == PeerState::DisconnectLater {
            return discard(fragment_count);
        }

        let channel_index = command.channel_id as usize;
        let number = command.number();
        let reliable_sequence_number = command.reliable_sequence_number;
        let mut unreliable_sequence_number: u32 = 0;

        if number != COMMAND_SEND_UNSEQUENCED {
            let channel = &self.channels[channel_index];
            let mut reliable_window = Channel::reliable_window(reliable_sequence_number);
            let current_window =
                Channel::reliable_window(channel.incoming_reliable_sequence_number);

            if reliable_sequence_number < channel.incoming_reliable_sequence_number {
                reliable_window += RELIABLE_WINDOWS;
            }
            if reliable_window < current_window
                || reliable_window >= current_window + FREE_RELIABLE_WINDOWS - 1
            {
                return discard(fragment_count);
            }
        }

        // Find the insertion slot, scanning each list from the back the
        // way arrivals usually land.
        let into_unreliable;
        let insert_at;
        match number {
            COMMAND_SEND_FRAGMENT | COMMAND_SEND_RELIABLE => {
                into_unreliable = false;
                let channel = &self.channels[channel_index];
                if reliable_sequence_number == channel.incoming_reliable_sequence_number {
                    return discard(fragment_count);
                }

                let list = &channel.incoming_reliable_commands;
                let mut position = 0usize;
                let mut duplicate = false;
                for i in (0..list.len()).rev() {
                    let existing = &list[i];
                    if reliable_sequence_number >= channel.incoming_reliable_sequence_number {
                        if existing.reliable_sequence_number
                            < channel.incoming_reliable_sequence_number
                        {
                            continue;
                        }
                    } else if existing.reliable_sequence_number
                        >= channel.incoming_reliable_sequence_number
                    {
                        position = i + 1;
                        break;
                    }

                    if existing.reliable_sequence_number <= reliable_sequence_number {
                        if existing.reliable_sequence_number < reliable_sequence_number {
                            position = i + 1;
                        } else {
                            duplicate = true;
                        }
                        break;
                    }
                }
                if duplicate {
                    return discard(fragment_count);
                }
                insert_at = position;
            }
            COMMAND_SEND_UNRELIABLE | COMMAND_SEND_UNRELIABLE_FRAGMENT => {
                into_unreliable = true;
                unreliable_sequence_number = match command.body {
                    CommandBody::SendUnreliable {
                        unreliable_sequence_number,
                        ..
                    } => unreliable_sequence_number as u32,
                    CommandBody::SendFragment(body) => body.start_sequence_number as u32,
                    _ => 0,
                };

                let channel = &self.channels[channel_index];
                if reliable_sequence_number == channel.incoming_reliable_sequence_number
                    && unreliable_sequence_number
                        <= channel.incoming_unreliable_sequence_number as u32
                {
                    return discard(fragment_count);
                }

                let list = &channel.incoming_unreliable_commands;
                let mut position = 0usize;
                let mut duplicate = false;
                for i in (0..list.len()).rev() {
                    let existing = &list[i];
                    if reliable_sequence_number >= channel.incoming_reliable_sequence_number {
                        if existing.reliable_sequence_number
                            < channel.incoming_reliable_sequence_number
                        {
                            continue;
                        }
                    } else if existing.reliable_sequence_number
                        >= channel.incoming_reliable_sequence_number
                    {
                        position = i + 1;
                        break;
                    }

                    if existing.reliable_sequence_number < reliable_sequence_number {
                        position = i + 1;
                        break;
                    }
                    if existing.reliable_sequence_number > reliable_sequence_number {
                        continue;
                    }

                    if existing.unreliable_sequence_number as u32 <= unreliable_sequence_number {
                        if (existing.unreliable_sequence_number as u32)
                            < unreliable_sequence_number
                        {
                            position = i + 1;
                        } else {
                            duplicate = true;
                        }
                        break;
                    }
                }
                if duplicate {
                    return discard(fragment_count);
                }
                insert_at = position;
            }
            COMMAND_SEND_UNSEQUENCED => {
                into_unreliable = true;
                insert_at = 0;
            }
            _ => return discard(fragment_count),
        }

        if self.total_waiting_data >= maximum_waiting_data {
            return IncomingResult::Exhausted;
        }
        if fragment_count > MAXIMUM_FRAGMENT_COUNT {
            return IncomingResult::Exhausted;
        }

        let buffer = if data.is_empty() && data_length > 0 {
            vec![0u8; data_length]
        } else {
            data.to_vec()
        };

        let incoming = IncomingCommand {
            reliable_sequence_number: command.reliable_sequence_number,
            unreliable_sequence_number: (unreliable_sequence_number & 0xFFFF) as u16,
            command,
            fragment_count,
            fragments_remaining: fragment_count,
            fragments: if fragment_count > 0 {
                vec![0u32; ((fragment_count + 31) / 32) as usize]
            } else {
                Vec::new()
            },
            data: buffer,
            flags,
        };
        self.total_waiting_data += data_length;

        let channel = &mut self.channels[channel_index];
        if into_unreliable {
            channel.incoming_unreliable_commands.insert(insert_at, incoming);
        } else {
            channel.incoming_reliable_commands.insert(insert_at, incoming);
        }

        match number {
            COMMAND_SEND_FRAGMENT | COMMAND_SEND_RELIABLE => {
                self.dispatch_incoming_reliable_commands(command.channel_id);
            }
            _ => self.dispatch_incoming_unreliable_commands(command.channel_id),
        }

        IncomingResult::Queued
    }

    /// Move every in-order, fully reassembled reliable command to the
    /// dispatched queue, advancing the channel's sequence counter.
    pub fn dispatch_incoming_reliable_commands(&mut self, channel_id: u8) {
        let channel = &mut self.channels[channel_id as usize];

        let mut ready = 0usize;
        for incoming in channel.incoming_reliable_commands.iter() {
            if incoming.fragments_remaining > 0
                || incoming.reliable_sequence_number
                    != channel.incoming_reliable_sequence_number.wrapping_add(1)
            {
                break;
            }
            channel.incoming_reliable_sequence_number = incoming.reliable_sequence_number;
            if incoming.fragment_count > 0 {
                channel.incoming_reliable_sequence_number = channel
                    .incoming_reliable_sequence_number
                    .wrapping_add(incoming.fragment_count as u16 - 1);
            }
            ready += 1;
        }
        if ready == 0 {
            return;
        }

        channel.incoming_unreliable_sequence_number = 0;
        let dispatched: Vec<IncomingCommand> =
            channel.incoming_reliable_commands.drain(..ready).collect();
        let more_unreliable = !channel.incoming_unreliable_commands.is_empty();
        self.dispatched_commands.extend(dispatched);

        if more_unreliable {
            self.dispatch_incoming_unreliable_commands(channel_id);
        }
    }

    /// Flush deliverable unreliable commands for the channel: unsequenced
    /// ones go out as-is, completed ones within the current reliable
    /// context advance the unreliable counter, stale ones are dropped, and
    /// scanning stops at the first command awaiting a future reliable
    /// sequence number.
    pub fn dispatch_incoming_unreliable_commands(&mut self, channel_id: u8) {
        let channel = &mut self.channels[channel_id as usize];
        let incoming_reliable = channel.incoming_reliable_sequence_number;
        let current_window = Channel::reliable_window(incoming_reliable);

        let mut dispatched: Vec<IncomingCommand> = Vec::new();
        let mut retained: VecDeque<IncomingCommand> = VecDeque::new();
        let mut stopped = false;

        for incoming in channel.incoming_unreliable_commands.drain(..) {
            if stopped {
                retained.push_back(incoming);
                continue;
            }

            if incoming.command.number() == COMMAND_SEND_UNSEQUENCED {
                dispatched.push(incoming);
                continue;
            }

            if incoming.reliable_sequence_number == incoming_reliable {
                if incoming.fragments_remaining == 0 {
                    channel.incoming_unreliable_sequence_number =
                        incoming.unreliable_sequence_number;
                    dispatched.push(incoming);
                } else {
                    retained.push_back(incoming);
                }
                continue;
            }

            let mut reliable_window = Channel::reliable_window(incoming.reliable_sequence_number);
            if incoming.reliable_sequence_number < incoming_reliable {
                reliable_window += RELIABLE_WINDOWS;
            }
            if reliable_window >= current_window
                && reliable_window < current_window + FREE_RELIABLE_WINDOWS - 1
            {
                // Waiting on a future reliable sequence number; everything
                // from here on stays queued.
                stopped = true;
                retained.push_back(incoming);
            }
            // Out-of-range leftovers from an abandoned window are dropped.
        }

        channel.incoming_unreliable_commands = retained;
        self.dispatched_commands.extend(dispatched);
    }

    /// True when nothing outgoing remains in flight or queued.
    pub fn outgoing_queues_empty(&self) -> bool {
        self.outgoing_reliable_commands.is_empty()
            && self.outgoing_unreliable_commands.is_empty()
            && self.sent_reliable_commands.is_empty()
    }
}
