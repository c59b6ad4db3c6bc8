//! The engine pump: datagram parsing, command handling, acknowledgement
//! and (re)transmission scheduling, event dispatch.
//!
//! One `service` invocation dispatches pending events, throttles
//! bandwidth, sends outgoing commands (retransmitting timed-out reliable
//! ones), drains the socket, sends again and finally waits on the socket
//! for whatever remains of the timeout.

use crate::address::HOST_BROADCAST;
use crate::channel::{Channel, FREE_RELIABLE_WINDOWS, RELIABLE_WINDOWS};
use crate::error::{Result, TetherError};
use crate::event::Event;
use crate::host::{negotiated_window_size, Host, Intercept, BANDWIDTH_THROTTLE_INTERVAL};
use crate::packet::{FLAG_RELIABLE, FLAG_UNRELIABLE_FRAGMENT, FLAG_UNSEQUENCED};
use crate::peer::{
    IncomingResult, PeerId, PeerState, FREE_UNSEQUENCED_WINDOWS, PACKET_THROTTLE_COUNTER,
    PACKET_THROTTLE_SCALE, UNSEQUENCED_WINDOW_SIZE,
};
use crate::protocol::{
    command_size, Command, CommandBody, VerifyConnectBody, CHECKSUM_SIZE, COMMAND_ACKNOWLEDGE,
    COMMAND_BANDWIDTH_LIMIT, COMMAND_CONNECT, COMMAND_DISCONNECT, COMMAND_FLAG_ACKNOWLEDGE,
    COMMAND_PING, COMMAND_SEND_FRAGMENT, COMMAND_SEND_RELIABLE, COMMAND_SEND_UNRELIABLE,
    COMMAND_SEND_UNRELIABLE_FRAGMENT, COMMAND_SEND_UNSEQUENCED, COMMAND_THROTTLE_CONFIGURE,
    COMMAND_VERIFY_CONNECT, HEADER_FLAG_COMPRESSED, HEADER_FLAG_MASK, HEADER_FLAG_SENT_TIME,
    HEADER_SESSION_MASK, HEADER_SESSION_SHIFT, HEADER_SIZE_MINIMAL, HEADER_SIZE_SENT_TIME,
    MAXIMUM_FRAGMENT_COUNT, MAXIMUM_MTU, MAXIMUM_PACKET_COMMANDS, MAXIMUM_PEER_ID,
    MINIMUM_CHANNEL_COUNT, MINIMUM_MTU,
};
use crate::time::{time_difference, time_greater_equal, time_less};
use crate::{trace_debug, trace_warn};

/// Datagrams drained per receive pump before bailing out.
const RECEIVE_BURST_LIMIT: usize = 256;

impl Host {
    /// Pump the protocol once, waiting up to `timeout` milliseconds for an
    /// event. `Ok(None)` means the timeout elapsed quietly.
    pub fn service(&mut self, timeout: u32) -> Result<Option<Event>> {
        let mut event = None;

        if self.dispatch_incoming_commands(&mut event) {
            return Ok(event);
        }

        self.service_time = self.clock.now();
        let deadline = self.service_time.wrapping_add(timeout);

        loop {
            if time_difference(self.service_time, self.bandwidth_throttle_epoch)
                >= BANDWIDTH_THROTTLE_INTERVAL
            {
                self.bandwidth_throttle();
            }

            if self.send_outgoing_commands(&mut event, true, true)? {
                return Ok(event);
            }
            if self.receive_incoming_commands(&mut event)? {
                return Ok(event);
            }
            if self.send_outgoing_commands(&mut event, true, true)? {
                return Ok(event);
            }
            if self.dispatch_incoming_commands(&mut event) {
                return Ok(event);
            }

            if time_greater_equal(self.service_time, deadline) {
                return Ok(None);
            }

            loop {
                self.service_time = self.clock.now();
                if time_greater_equal(self.service_time, deadline) {
                    return Ok(None);
                }
                if self
                    .socket
                    .wait(time_difference(deadline, self.service_time))?
                {
                    break;
                }
            }

            self.service_time = self.clock.now();
        }
    }

    /// Send every queued command now without receiving or dispatching.
    pub fn flush(&mut self) {
        self.service_time = self.clock.now();
        let mut event = None;
        if let Err(error) = self.send_outgoing_commands(&mut event, false, false) {
            trace_warn!("flush failed: {error}");
            let _ = error;
        }
    }

    /// Pop the next pending event without touching the socket.
    pub fn check_events(&mut self) -> Option<Event> {
        let mut event = None;
        self.dispatch_incoming_commands(&mut event);
        event
    }

    // -- event dispatch --

    fn dispatch_incoming_commands(&mut self, event: &mut Option<Event>) -> bool {
        while let Some(index) = self.dispatch_queue.pop_front() {
            self.peers[index].needs_dispatch = false;

            match self.peers[index].state {
                PeerState::ConnectionPending | PeerState::ConnectionSucceeded => {
                    self.change_state(index, PeerState::Connected);
                    *event = Some(Event::Connect {
                        peer: PeerId(index),
                        data: self.peers[index].event_data,
                    });
                    return true;
                }

                PeerState::Zombie => {
                    self.recalculate_bandwidth_limits = true;
                    *event = Some(Event::Disconnect {
                        peer: PeerId(index),
                        data: self.peers[index].event_data,
                    });
                    self.reset_peer(index);
                    return true;
                }

                PeerState::Connected => {
                    let peer = &mut self.peers[index];
                    let Some((channel_id, packet)) = peer.receive() else {
                        continue;
                    };
                    if !peer.dispatched_commands.is_empty() {
                        peer.needs_dispatch = true;
                        self.dispatch_queue.push_back(index);
                    }
                    *event = Some(Event::Receive {
                        peer: PeerId(index),
                        channel_id,
                        packet,
                    });
                    return true;
                }

                _ => {}
            }
        }
        false
    }

    fn notify_connect(&mut self, index: usize, event: &mut Option<Event>, deliver: bool) {
        self.recalculate_bandwidth_limits = true;

        if deliver {
            self.change_state(index, PeerState::Connected);
            *event = Some(Event::Connect {
                peer: PeerId(index),
                data: self.peers[index].event_data,
            });
        } else {
            let state = if self.peers[index].state == PeerState::Connecting {
                PeerState::ConnectionSucceeded
            } else {
                PeerState::ConnectionPending
            };
            self.dispatch_state(index, state);
        }
    }

    fn notify_disconnect(&mut self, index: usize, event: &mut Option<Event>, deliver: bool) {
        let state = self.peers[index].state;

        if state >= PeerState::ConnectionPending {
            self.recalculate_bandwidth_limits = true;
        }

        if state != PeerState::Connecting && state < PeerState::ConnectionSucceeded {
            self.reset_peer(index);
        } else if deliver {
            *event = Some(Event::Disconnect {
                peer: PeerId(index),
                data: 0,
            });
            self.reset_peer(index);
        } else {
            self.peers[index].event_data = 0;
            self.dispatch_state(index, PeerState::Zombie);
        }
    }

    // -- receiving --

    fn receive_incoming_commands(&mut self, event: &mut Option<Event>) -> Result<bool> {
        for _ in 0..RECEIVE_BURST_LIMIT {
            let mut buffer = std::mem::take(&mut self.receive_buffer);

            let received = match self.socket.receive(&mut buffer) {
                Ok(received) => received,
                Err(error) => {
                    self.receive_buffer = buffer;
                    return Err(error.into());
                }
            };
            let Some((length, address)) = received else {
                self.receive_buffer = buffer;
                return Ok(false);
            };

            self.received_address = address;
            self.total_received_data = self.total_received_data.wrapping_add(length as u32);
            self.total_received_packets = self.total_received_packets.wrapping_add(1);

            if let Some(intercept) = self.intercept.as_mut() {
                match intercept(address, &buffer[..length]) {
                    Intercept::Consume => {
                        self.receive_buffer = buffer;
                        continue;
                    }
                    Intercept::Error => {
                        self.receive_buffer = buffer;
                        return Err(TetherError::ProtocolViolation("datagram intercept failed"));
                    }
                    Intercept::Pass => {}
                }
            }

            let produced = self.handle_datagram_buffer(&mut buffer, length, event);
            self.receive_buffer = buffer;
            if produced {
                return Ok(true);
            }
        }

        Err(TetherError::ResourceExhausted("receive burst limit hit"))
    }

    fn handle_datagram_buffer(
        &mut self,
        buffer: &mut [u8],
        length: usize,
        event: &mut Option<Event>,
    ) -> bool {
        if length < HEADER_SIZE_MINIMAL {
            return false;
        }

        let peer_field = u16::from_be_bytes([buffer[0], buffer[1]]);
        let session_id = ((peer_field & HEADER_SESSION_MASK) >> HEADER_SESSION_SHIFT) as u8;
        let flags = peer_field & HEADER_FLAG_MASK;
        let peer_id = peer_field & !(HEADER_FLAG_MASK | HEADER_SESSION_MASK);

        let mut header_size = if flags & HEADER_FLAG_SENT_TIME != 0 {
            HEADER_SIZE_SENT_TIME
        } else {
            HEADER_SIZE_MINIMAL
        };
        if self.checksum.is_some() {
            header_size += CHECKSUM_SIZE;
        }
        if length < header_size {
            return false;
        }

        let peer_index = if peer_id == MAXIMUM_PEER_ID {
            None
        } else if peer_id as usize >= self.peers.len() {
            return false;
        } else {
            let peer = &self.peers[peer_id as usize];
            let address_matches = (self.received_address.host == peer.address.host
                && self.received_address.port == peer.address.port)
                || peer.address.host == HOST_BROADCAST;
            if peer.state == PeerState::Disconnected
                || peer.state == PeerState::Zombie
                || !address_matches
                || (peer.outgoing_peer_id < MAXIMUM_PEER_ID
                    && session_id != peer.incoming_session_id)
            {
                return false;
            }
            Some(peer_id as usize)
        };

        if flags & HEADER_FLAG_COMPRESSED != 0 {
            let Some(mut compressor) = self.compressor.take() else {
                return false;
            };
            let mut scratch = std::mem::take(&mut self.decompress_scratch);
            scratch.resize(MAXIMUM_MTU as usize, 0);
            scratch[..header_size].copy_from_slice(&buffer[..header_size]);

            let produced = compressor.decompress(
                &buffer[header_size..length],
                &mut scratch[header_size..MAXIMUM_MTU as usize],
            );
            self.compressor = Some(compressor);

            if produced == 0 || produced > MAXIMUM_MTU as usize - header_size {
                self.decompress_scratch = scratch;
                return false;
            }

            let total = header_size + produced;
            let result =
                self.process_commands(&mut scratch[..total], header_size, flags, peer_index, event);
            self.decompress_scratch = scratch;
            return result;
        }

        self.process_commands(&mut buffer[..length], header_size, flags, peer_index, event)
    }

    /// Walk the command stream of one (already decompressed) datagram.
    /// Malformed commands stop the walk; everything before them sticks.
    fn process_commands(
        &mut self,
        data: &mut [u8],
        header_size: usize,
        flags: u16,
        mut peer_index: Option<usize>,
        event: &mut Option<Event>,
    ) -> bool {
        if let Some(checksum_fn) = &self.checksum {
            let slot = header_size - CHECKSUM_SIZE;
            let desired = u32::from_be_bytes([
                data[slot],
                data[slot + 1],
                data[slot + 2],
                data[slot + 3],
            ]);
            let connect_id = peer_index.map_or(0, |index| self.peers[index].connect_id);
            data[slot..slot + 4].copy_from_slice(&connect_id.to_be_bytes());
            if checksum_fn(data) != desired {
                trace_debug!("dropping datagram with bad checksum");
                return false;
            }
        }

        if let Some(index) = peer_index {
            let peer = &mut self.peers[index];
            peer.address = self.received_address;
            peer.incoming_data_total = peer.incoming_data_total.wrapping_add(data.len() as u32);
        }

        let sent_time = if flags & HEADER_FLAG_SENT_TIME != 0 {
            u16::from_be_bytes([data[2], data[3]])
        } else {
            0
        };

        let mut current = header_size;
        while current < data.len() {
            let Some((command, consumed)) = Command::decode(&data[current..]) else {
                break;
            };
            current += consumed;

            let payload_length = command.payload_length();
            if payload_length > data.len() - current {
                break;
            }
            let payload_start = current;
            current += payload_length;

            if peer_index.is_none() && command.number() != COMMAND_CONNECT {
                break;
            }

            let handled = match command.number() {
                COMMAND_ACKNOWLEDGE => {
                    self.handle_acknowledge(peer_index.unwrap(), &command, event)
                }
                COMMAND_CONNECT => {
                    if peer_index.is_some() {
                        false
                    } else {
                        match self.handle_connect(&command) {
                            Some(index) => {
                                peer_index = Some(index);
                                true
                            }
                            None => false,
                        }
                    }
                }
                COMMAND_VERIFY_CONNECT => {
                    self.handle_verify_connect(peer_index.unwrap(), &command, event)
                }
                COMMAND_DISCONNECT => self.handle_disconnect(peer_index.unwrap(), &command),
                COMMAND_PING => self.handle_ping(peer_index.unwrap()),
                COMMAND_SEND_RELIABLE => self.handle_send_reliable(
                    peer_index.unwrap(),
                    &command,
                    &data[payload_start..payload_start + payload_length],
                ),
                COMMAND_SEND_UNRELIABLE => self.handle_send_unreliable(
                    peer_index.unwrap(),
                    &command,
                    &data[payload_start..payload_start + payload_length],
                ),
                COMMAND_SEND_UNSEQUENCED => self.handle_send_unsequenced(
                    peer_index.unwrap(),
                    &command,
                    &data[payload_start..payload_start + payload_length],
                ),
                COMMAND_SEND_FRAGMENT => self.handle_send_fragment(
                    peer_index.unwrap(),
                    &command,
                    &data[payload_start..payload_start + payload_length],
                ),
                COMMAND_SEND_UNRELIABLE_FRAGMENT => self.handle_send_unreliable_fragment(
                    peer_index.unwrap(),
                    &command,
                    &data[payload_start..payload_start + payload_length],
                ),
                COMMAND_BANDWIDTH_LIMIT => {
                    self.handle_bandwidth_limit(peer_index.unwrap(), &command)
                }
                COMMAND_THROTTLE_CONFIGURE => {
                    self.handle_throttle_configure(peer_index.unwrap(), &command)
                }
                _ => false,
            };

            if let Some(index) = peer_index {
                self.schedule_dispatch(index);
            }
            if !handled {
                break;
            }

            if let Some(index) = peer_index {
                if command.wants_acknowledge() {
                    if flags & HEADER_FLAG_SENT_TIME == 0 {
                        break;
                    }
                    match self.peers[index].state {
                        PeerState::Disconnecting
                        | PeerState::AcknowledgingConnect
                        | PeerState::Disconnected
                        | PeerState::Zombie => {}
                        PeerState::AcknowledgingDisconnect => {
                            if command.number() == COMMAND_DISCONNECT {
                                self.peers[index].queue_acknowledgement(&command, sent_time);
                            }
                        }
                        _ => {
                            self.peers[index].queue_acknowledgement(&command, sent_time);
                        }
                    }
                }
            }
        }

        event.is_some()
    }

    // -- command handlers --

    fn handle_acknowledge(
        &mut self,
        index: usize,
        command: &Command,
        event: &mut Option<Event>,
    ) -> bool {
        let CommandBody::Acknowledge {
            received_reliable_sequence_number,
            received_sent_time,
        } = command.body
        else {
            return false;
        };

        let state = self.peers[index].state;
        if state == PeerState::Disconnected || state == PeerState::Zombie {
            return true;
        }

        let service_time = self.service_time;
        let mut received_sent_time = received_sent_time as u32 | (service_time & 0xFFFF_0000);
        if (received_sent_time & 0x8000) > (service_time & 0x8000) {
            received_sent_time = received_sent_time.wrapping_sub(0x10000);
        }
        if time_less(service_time, received_sent_time) {
            return true;
        }

        {
            let peer = &mut self.peers[index];
            peer.last_receive_time = service_time;
            peer.earliest_timeout = 0;

            let round_trip_time = time_difference(service_time, received_sent_time);
            peer.throttle(round_trip_time);

            peer.round_trip_time_variance -= peer.round_trip_time_variance / 4;
            if round_trip_time >= peer.round_trip_time {
                peer.round_trip_time += (round_trip_time - peer.round_trip_time) / 8;
                peer.round_trip_time_variance += (round_trip_time - peer.round_trip_time) / 4;
            } else {
                peer.round_trip_time -= (peer.round_trip_time - round_trip_time) / 8;
                peer.round_trip_time_variance += (peer.round_trip_time - round_trip_time) / 4;
            }

            if peer.round_trip_time < peer.lowest_round_trip_time {
                peer.lowest_round_trip_time = peer.round_trip_time;
            }
            if peer.round_trip_time_variance > peer.highest_round_trip_time_variance {
                peer.highest_round_trip_time_variance = peer.round_trip_time_variance;
            }

            if peer.packet_throttle_epoch == 0
                || time_difference(service_time, peer.packet_throttle_epoch)
                    >= peer.packet_throttle_interval
            {
                peer.last_round_trip_time = peer.lowest_round_trip_time;
                peer.last_round_trip_time_variance = peer.highest_round_trip_time_variance;
                peer.lowest_round_trip_time = peer.round_trip_time;
                peer.highest_round_trip_time_variance = peer.round_trip_time_variance;
                peer.packet_throttle_epoch = service_time;
            }
        }

        let acknowledged = self.remove_sent_reliable_command(
            index,
            received_reliable_sequence_number,
            command.channel_id,
        );

        match self.peers[index].state {
            PeerState::AcknowledgingConnect => {
                if acknowledged != Some(COMMAND_VERIFY_CONNECT) {
                    return false;
                }
                self.notify_connect(index, event, true);
            }
            PeerState::Disconnecting => {
                if acknowledged != Some(COMMAND_DISCONNECT) {
                    return false;
                }
                self.notify_disconnect(index, event, true);
            }
            PeerState::DisconnectLater => {
                if self.peers[index].outgoing_queues_empty() {
                    let data = self.peers[index].event_data;
                    self.disconnect(PeerId(index), data);
                }
            }
            _ => {}
        }

        true
    }

    fn handle_connect(&mut self, command: &Command) -> Option<usize> {
        let CommandBody::Connect(body) = command.body else {
            return None;
        };

        let mut channel_count = body.channel_count as usize;
        if !(MINIMUM_CHANNEL_COUNT..=crate::protocol::MAXIMUM_CHANNEL_COUNT)
            .contains(&channel_count)
        {
            return None;
        }

        let mut slot = None;
        let mut duplicate_peers = 0usize;
        for (index, peer) in self.peers.iter().enumerate() {
            if peer.state == PeerState::Disconnected {
                if slot.is_none() {
                    slot = Some(index);
                }
            } else if peer.state != PeerState::Connecting
                && peer.address.host == self.received_address.host
            {
                if peer.address.port == self.received_address.port
                    && peer.connect_id == body.connect_id
                {
                    return None;
                }
                duplicate_peers += 1;
            }
        }
        let index = slot?;
        if duplicate_peers >= self.duplicate_peers {
            return None;
        }

        if channel_count > self.channel_limit {
            channel_count = self.channel_limit;
        }

        let verify_window_size = {
            let incoming = self.incoming_bandwidth;
            let mut window_size = if incoming == 0 {
                crate::protocol::MAXIMUM_WINDOW_SIZE
            } else {
                (incoming / crate::peer::WINDOW_SIZE_SCALE) * crate::protocol::MINIMUM_WINDOW_SIZE
            };
            if window_size > body.window_size {
                window_size = body.window_size;
            }
            window_size.clamp(
                crate::protocol::MINIMUM_WINDOW_SIZE,
                crate::protocol::MAXIMUM_WINDOW_SIZE,
            )
        };

        let host_incoming_bandwidth = self.incoming_bandwidth;
        let host_outgoing_bandwidth = self.outgoing_bandwidth;
        let received_address = self.received_address;

        let peer = &mut self.peers[index];
        peer.channels = (0..channel_count).map(|_| Channel::new()).collect();
        peer.state = PeerState::AcknowledgingConnect;
        peer.connect_id = body.connect_id;
        peer.address = received_address;
        peer.outgoing_peer_id = body.outgoing_peer_id;
        peer.incoming_bandwidth = body.incoming_bandwidth;
        peer.outgoing_bandwidth = body.outgoing_bandwidth;
        peer.packet_throttle_interval = body.packet_throttle_interval;
        peer.packet_throttle_acceleration = body.packet_throttle_acceleration;
        peer.packet_throttle_deceleration = body.packet_throttle_deceleration;
        peer.event_data = body.data;

        let session_modulo = (HEADER_SESSION_MASK >> HEADER_SESSION_SHIFT) as u8;
        let mut incoming_session_id = if body.incoming_session_id == 0xFF {
            peer.outgoing_session_id
        } else {
            body.incoming_session_id
        };
        incoming_session_id = incoming_session_id.wrapping_add(1) & session_modulo;
        if incoming_session_id == peer.outgoing_session_id {
            incoming_session_id = incoming_session_id.wrapping_add(1) & session_modulo;
        }
        peer.outgoing_session_id = incoming_session_id;

        let mut outgoing_session_id = if body.outgoing_session_id == 0xFF {
            peer.incoming_session_id
        } else {
            body.outgoing_session_id
        };
        outgoing_session_id = outgoing_session_id.wrapping_add(1) & session_modulo;
        if outgoing_session_id == peer.incoming_session_id {
            outgoing_session_id = outgoing_session_id.wrapping_add(1) & session_modulo;
        }
        peer.incoming_session_id = outgoing_session_id;

        peer.mtu = body.mtu.clamp(MINIMUM_MTU, MAXIMUM_MTU);
        peer.window_size = negotiated_window_size(host_outgoing_bandwidth, peer.incoming_bandwidth);

        let verify = Command::new(
            COMMAND_VERIFY_CONNECT | COMMAND_FLAG_ACKNOWLEDGE,
            0xFF,
            CommandBody::VerifyConnect(VerifyConnectBody {
                outgoing_peer_id: peer.incoming_peer_id,
                incoming_session_id,
                outgoing_session_id,
                mtu: peer.mtu,
                window_size: verify_window_size,
                channel_count: channel_count as u32,
                incoming_bandwidth: host_incoming_bandwidth,
                outgoing_bandwidth: host_outgoing_bandwidth,
                packet_throttle_interval: peer.packet_throttle_interval,
                packet_throttle_acceleration: peer.packet_throttle_acceleration,
                packet_throttle_deceleration: peer.packet_throttle_deceleration,
                connect_id: peer.connect_id,
            }),
        );
        peer.queue_outgoing_command(verify, None, 0, 0);

        trace_debug!("accepted connection from {}", received_address);
        Some(index)
    }

    fn handle_verify_connect(
        &mut self,
        index: usize,
        command: &Command,
        event: &mut Option<Event>,
    ) -> bool {
        let CommandBody::VerifyConnect(body) = command.body else {
            return false;
        };

        if self.peers[index].state != PeerState::Connecting {
            return true;
        }

        let channel_count = body.channel_count as usize;
        let peer_params_match = {
            let peer = &self.peers[index];
            (MINIMUM_CHANNEL_COUNT..=crate::protocol::MAXIMUM_CHANNEL_COUNT)
                .contains(&channel_count)
                && body.packet_throttle_interval == peer.packet_throttle_interval
                && body.packet_throttle_acceleration == peer.packet_throttle_acceleration
                && body.packet_throttle_deceleration == peer.packet_throttle_deceleration
                && body.connect_id == peer.connect_id
        };
        if !peer_params_match {
            self.peers[index].event_data = 0;
            self.dispatch_state(index, PeerState::Zombie);
            return false;
        }

        self.remove_sent_reliable_command(index, 1, 0xFF);

        let peer = &mut self.peers[index];
        if channel_count < peer.channels.len() {
            peer.channels.truncate(channel_count);
        }
        peer.outgoing_peer_id = body.outgoing_peer_id;
        peer.incoming_session_id = body.incoming_session_id;
        peer.outgoing_session_id = body.outgoing_session_id;

        let mtu = body.mtu.clamp(MINIMUM_MTU, MAXIMUM_MTU);
        if mtu < peer.mtu {
            peer.mtu = mtu;
        }

        let window_size = body.window_size.clamp(
            crate::protocol::MINIMUM_WINDOW_SIZE,
            crate::protocol::MAXIMUM_WINDOW_SIZE,
        );
        if window_size < peer.window_size {
            peer.window_size = window_size;
        }

        peer.incoming_bandwidth = body.incoming_bandwidth;
        peer.outgoing_bandwidth = body.outgoing_bandwidth;

        self.notify_connect(index, event, true);
        true
    }

    fn handle_disconnect(&mut self, index: usize, command: &Command) -> bool {
        let CommandBody::Disconnect { data } = command.body else {
            return false;
        };

        let state = self.peers[index].state;
        if matches!(
            state,
            PeerState::Disconnected | PeerState::Zombie | PeerState::AcknowledgingDisconnect
        ) {
            return true;
        }

        self.reset_peer_queues(index);

        if matches!(
            state,
            PeerState::ConnectionSucceeded | PeerState::Disconnecting | PeerState::Connecting
        ) {
            self.dispatch_state(index, PeerState::Zombie);
        } else if state != PeerState::Connected && state != PeerState::DisconnectLater {
            if state == PeerState::ConnectionPending {
                self.recalculate_bandwidth_limits = true;
            }
            self.reset_peer(index);
        } else if command.wants_acknowledge() {
            self.change_state(index, PeerState::AcknowledgingDisconnect);
        } else {
            self.dispatch_state(index, PeerState::Zombie);
        }

        if self.peers[index].state != PeerState::Disconnected {
            self.peers[index].event_data = data;
        }

        true
    }

    fn handle_ping(&mut self, index: usize) -> bool {
        matches!(
            self.peers[index].state,
            PeerState::Connected | PeerState::DisconnectLater
        )
    }

    fn handle_bandwidth_limit(&mut self, index: usize, command: &Command) -> bool {
        let CommandBody::BandwidthLimit {
            incoming_bandwidth,
            outgoing_bandwidth,
        } = command.body
        else {
            return false;
        };

        if !matches!(
            self.peers[index].state,
            PeerState::Connected | PeerState::DisconnectLater
        ) {
            return false;
        }

        {
            let peer = &self.peers[index];
            if peer.incoming_bandwidth != 0 {
                self.bandwidth_limited_peers -= 1;
            }
        }

        let host_outgoing_bandwidth = self.outgoing_bandwidth;
        let peer = &mut self.peers[index];
        peer.incoming_bandwidth = incoming_bandwidth;
        peer.outgoing_bandwidth = outgoing_bandwidth;
        if peer.incoming_bandwidth != 0 {
            self.bandwidth_limited_peers += 1;
        }
        let peer = &mut self.peers[index];
        peer.window_size =
            negotiated_window_size(peer.incoming_bandwidth, host_outgoing_bandwidth);

        true
    }

    fn handle_throttle_configure(&mut self, index: usize, command: &Command) -> bool {
        let CommandBody::ThrottleConfigure {
            interval,
            acceleration,
            deceleration,
        } = command.body
        else {
            return false;
        };

        if !matches!(
            self.peers[index].state,
            PeerState::Connected | PeerState::DisconnectLater
        ) {
            return false;
        }

        let peer = &mut self.peers[index];
        peer.packet_throttle_interval = interval;
        peer.packet_throttle_acceleration = acceleration;
        peer.packet_throttle_deceleration = deceleration;
        true
    }

    fn channel_and_state_valid(&self, index: usize, command: &Command) -> bool {
        (command.channel_id as usize) < self.peers[index].channels.len()
            && matches!(
                self.peers[index].state,
                PeerState::Connected | PeerState::DisconnectLater
            )
    }

    fn handle_send_reliable(&mut self, index: usize, command: &Command, payload: &[u8]) -> bool {
        if !self.channel_and_state_valid(index, command) {
            return false;
        }
        if payload.len() > self.maximum_packet_size {
            return false;
        }

        let maximum_waiting_data = self.maximum_waiting_data;
        self.peers[index].queue_incoming_command(
            *command,
            payload,
            payload.len(),
            FLAG_RELIABLE,
            0,
            maximum_waiting_data,
        ) != IncomingResult::Exhausted
    }

    fn handle_send_unreliable(&mut self, index: usize, command: &Command, payload: &[u8]) -> bool {
        if !self.channel_and_state_valid(index, command) {
            return false;
        }
        if payload.len() > self.maximum_packet_size {
            return false;
        }

        let maximum_waiting_data = self.maximum_waiting_data;
        self.peers[index].queue_incoming_command(
            *command,
            payload,
            payload.len(),
            0,
            0,
            maximum_waiting_data,
        ) != IncomingResult::Exhausted
    }

    fn handle_send_unsequenced(&mut self, index: usize, command: &Command, payload: &[u8]) -> bool {
        if !self.channel_and_state_valid(index, command) {
            return false;
        }
        if payload.len() > self.maximum_packet_size {
            return false;
        }

        let CommandBody::SendUnsequenced {
            unsequenced_group, ..
        } = command.body
        else {
            return false;
        };

        let maximum_waiting_data = self.maximum_waiting_data;
        let peer = &mut self.peers[index];

        let mut group = unsequenced_group as u32;
        let group_index = group % UNSEQUENCED_WINDOW_SIZE;
        if group < peer.incoming_unsequenced_group as u32 {
            group += 0x10000;
        }
        if group
            >= peer.incoming_unsequenced_group as u32
                + FREE_UNSEQUENCED_WINDOWS * UNSEQUENCED_WINDOW_SIZE
        {
            return true;
        }
        let group = group & 0xFFFF;

        if (group - group_index) as u16 != peer.incoming_unsequenced_group {
            peer.incoming_unsequenced_group = (group - group_index) as u16;
            peer.unsequenced_window.fill(0);
        } else if peer.unsequenced_window[(group_index / 32) as usize] & (1 << (group_index % 32))
            != 0
        {
            return true;
        }

        if peer.queue_incoming_command(
            *command,
            payload,
            payload.len(),
            FLAG_UNSEQUENCED,
            0,
            maximum_waiting_data,
        ) == IncomingResult::Exhausted
        {
            return false;
        }

        self.peers[index].unsequenced_window[(group_index / 32) as usize] |=
            1 << (group_index % 32);
        true
    }

    fn handle_send_fragment(&mut self, index: usize, command: &Command, payload: &[u8]) -> bool {
        if !self.channel_and_state_valid(index, command) {
            return false;
        }
        if payload.len() > self.maximum_packet_size {
            return false;
        }

        let CommandBody::SendFragment(body) = command.body else {
            return false;
        };
        let channel_id = command.channel_id;
        let start_sequence_number = body.start_sequence_number;

        {
            let channel = &self.peers[index].channels[channel_id as usize];
            let mut start_window = Channel::reliable_window(start_sequence_number);
            let current_window =
                Channel::reliable_window(channel.incoming_reliable_sequence_number);
            if start_sequence_number < channel.incoming_reliable_sequence_number {
                start_window += RELIABLE_WINDOWS;
            }
            if start_window < current_window
                || start_window >= current_window + FREE_RELIABLE_WINDOWS - 1
            {
                return true;
            }
        }

        if body.fragment_count > MAXIMUM_FRAGMENT_COUNT
            || body.fragment_number >= body.fragment_count
            || body.total_length as usize > self.maximum_packet_size
            || body.fragment_offset >= body.total_length
            || payload.len() as u32 > body.total_length - body.fragment_offset
        {
            return false;
        }

        let found = self.find_reliable_fragment_start(
            index,
            channel_id,
            start_sequence_number,
            body.total_length,
            body.fragment_count,
        );
        let start_index = match found {
            FragmentLookup::Corrupt => return false,
            FragmentLookup::Found(at) => Some(at),
            FragmentLookup::Missing => None,
        };

        let start_index = match start_index {
            Some(at) => at,
            None => {
                let mut placeholder = *command;
                placeholder.reliable_sequence_number = start_sequence_number;
                let maximum_waiting_data = self.maximum_waiting_data;
                if self.peers[index].queue_incoming_command(
                    placeholder,
                    &[],
                    body.total_length as usize,
                    FLAG_RELIABLE,
                    body.fragment_count,
                    maximum_waiting_data,
                ) == IncomingResult::Exhausted
                {
                    return false;
                }
                match self.find_reliable_fragment_start(
                    index,
                    channel_id,
                    start_sequence_number,
                    body.total_length,
                    body.fragment_count,
                ) {
                    FragmentLookup::Found(at) => at,
                    _ => return false,
                }
            }
        };

        let completed = {
            let channel = &mut self.peers[index].channels[channel_id as usize];
            let incoming = &mut channel.incoming_reliable_commands[start_index];
            apply_fragment(incoming, body.fragment_number, body.fragment_offset, payload)
        };
        if completed {
            self.peers[index].dispatch_incoming_reliable_commands(channel_id);
        }

        true
    }

    fn handle_send_unreliable_fragment(
        &mut self,
        index: usize,
        command: &Command,
        payload: &[u8],
    ) -> bool {
        if !self.channel_and_state_valid(index, command) {
            return false;
        }
        if payload.len() > self.maximum_packet_size {
            return false;
        }

        let CommandBody::SendFragment(body) = command.body else {
            return false;
        };
        let channel_id = command.channel_id;
        let reliable_sequence_number = command.reliable_sequence_number;
        let start_sequence_number = body.start_sequence_number;

        {
            let channel = &self.peers[index].channels[channel_id as usize];
            let mut reliable_window = Channel::reliable_window(reliable_sequence_number);
            let current_window =
                Channel::reliable_window(channel.incoming_reliable_sequence_number);
            if reliable_sequence_number < channel.incoming_reliable_sequence_number {
                reliable_window += RELIABLE_WINDOWS;
            }
            if reliable_window < current_window
                || reliable_window >= current_window + FREE_RELIABLE_WINDOWS - 1
            {
                return true;
            }
            if reliable_sequence_number == channel.incoming_reliable_sequence_number
                && start_sequence_number <= channel.incoming_unreliable_sequence_number
            {
                return true;
            }
        }

        if body.fragment_count > MAXIMUM_FRAGMENT_COUNT
            || body.fragment_number >= body.fragment_count
            || body.total_length as usize > self.maximum_packet_size
            || body.fragment_offset >= body.total_length
            || payload.len() as u32 > body.total_length - body.fragment_offset
        {
            return false;
        }

        let found = self.find_unreliable_fragment_start(
            index,
            channel_id,
            reliable_sequence_number,
            start_sequence_number,
            body.total_length,
            body.fragment_count,
        );
        let start_index = match found {
            FragmentLookup::Corrupt => return false,
            FragmentLookup::Found(at) => Some(at),
            FragmentLookup::Missing => None,
        };

        let start_index = match start_index {
            Some(at) => at,
            None => {
                let maximum_waiting_data = self.maximum_waiting_data;
                if self.peers[index].queue_incoming_command(
                    *command,
                    &[],
                    body.total_length as usize,
                    FLAG_UNRELIABLE_FRAGMENT,
                    body.fragment_count,
                    maximum_waiting_data,
                ) == IncomingResult::Exhausted
                {
                    return false;
                }
                match self.find_unreliable_fragment_start(
                    index,
                    channel_id,
                    reliable_sequence_number,
                    start_sequence_number,
                    body.total_length,
                    body.fragment_count,
                ) {
                    FragmentLookup::Found(at) => at,
                    _ => return false,
                }
            }
        };

        let completed = {
            let channel = &mut self.peers[index].channels[channel_id as usize];
            let incoming = &mut channel.incoming_unreliable_commands[start_index];
            apply_fragment(incoming, body.fragment_number, body.fragment_offset, payload)
        };
        if completed {
            self.peers[index].dispatch_incoming_unreliable_commands(channel_id);
        }

        true
    }

    fn find_reliable_fragment_start(
        &self,
        index: usize,
        channel_id: u8,
        start_sequence_number: u16,
        total_length: u32,
        fragment_count: u32,
    ) -> FragmentLookup {
        let channel = &self.peers[index].channels[channel_id as usize];
        let incoming_reliable = channel.incoming_reliable_sequence_number;
        let list = &channel.incoming_reliable_commands;

        for at in (0..list.len()).rev() {
            let existing = &list[at];
            if start_sequence_number >= incoming_reliable {
                if existing.reliable_sequence_number < incoming_reliable {
                    continue;
                }
            } else if existing.reliable_sequence_number >= incoming_reliable {
                break;
            }

            if existing.reliable_sequence_number <= start_sequence_number {
                if existing.reliable_sequence_number < start_sequence_number {
                    break;
                }
                if existing.command.number() != COMMAND_SEND_FRAGMENT
                    || existing.data.len() as u32 != total_length
                    || existing.fragment_count != fragment_count
                {
                    return FragmentLookup::Corrupt;
                }
                return FragmentLookup::Found(at);
            }
        }
        FragmentLookup::Missing
    }

    fn find_unreliable_fragment_start(
        &self,
        index: usize,
        channel_id: u8,
        reliable_sequence_number: u16,
        start_sequence_number: u16,
        total_length: u32,
        fragment_count: u32,
    ) -> FragmentLookup {
        let channel = &self.peers[index].channels[channel_id as usize];
        let incoming_reliable = channel.incoming_reliable_sequence_number;
        let list = &channel.incoming_unreliable_commands;

        for at in (0..list.len()).rev() {
            let existing = &list[at];
            if reliable_sequence_number >= incoming_reliable {
                if existing.reliable_sequence_number < incoming_reliable {
                    continue;
                }
            } else if existing.reliable_sequence_number >= incoming_reliable {
                break;
            }

            if existing.reliable_sequence_number < reliable_sequence_number {
                break;
            }
            if existing.reliable_sequence_number > reliable_sequence_number {
                continue;
            }

            if existing.unreliable_sequence_number <= start_sequence_number {
                if existing.unreliable_sequence_number < start_sequence_number {
                    break;
                }
                if existing.command.number() != COMMAND_SEND_UNRELIABLE_FRAGMENT
                    || existing.data.len() as u32 != total_length
                    || existing.fragment_count != fragment_count
                {
                    return FragmentLookup::Corrupt;
                }
                return FragmentLookup::Found(at);
            }
        }
        FragmentLookup::Missing
    }

    // -- reliability bookkeeping --

    fn remove_sent_reliable_command(
        &mut self,
        index: usize,
        reliable_sequence_number: u16,
        channel_id: u8,
    ) -> Option<u8> {
        let peer = &mut self.peers[index];

        let mut was_sent = true;
        let mut position = peer.sent_reliable_commands.iter().position(|outgoing| {
            outgoing.reliable_sequence_number == reliable_sequence_number
                && outgoing.command.channel_id == channel_id
        });
        let mut outgoing = match position {
            Some(at) => peer.sent_reliable_commands.remove(at).unwrap(),
            None => {
                for (at, outgoing) in peer.outgoing_reliable_commands.iter().enumerate() {
                    if outgoing.send_attempts < 1 {
                        return None;
                    }
                    if outgoing.reliable_sequence_number == reliable_sequence_number
                        && outgoing.command.channel_id == channel_id
                    {
                        position = Some(at);
                        break;
                    }
                }
                was_sent = false;
                peer.outgoing_reliable_commands.remove(position?).unwrap()
            }
        };

        if (channel_id as usize) < peer.channels.len() {
            let channel = &mut peer.channels[channel_id as usize];
            let reliable_window = Channel::reliable_window(reliable_sequence_number) as usize;
            if channel.reliable_windows[reliable_window] > 0 {
                channel.reliable_windows[reliable_window] -= 1;
                if channel.reliable_windows[reliable_window] == 0 {
                    channel.used_reliable_windows &= !(1 << reliable_window);
                }
            }
        }

        let command_number = outgoing.command.number();

        if outgoing.packet.is_some() {
            if was_sent {
                peer.reliable_data_in_transit = peer
                    .reliable_data_in_transit
                    .saturating_sub(outgoing.fragment_length as u32);
            }
            outgoing.release_packet();
        }

        if let Some(front) = peer.sent_reliable_commands.front() {
            peer.next_timeout = front.sent_time.wrapping_add(front.round_trip_timeout);
        }

        Some(command_number)
    }

    fn remove_sent_unreliable_commands(&mut self, index: usize) {
        let peer = &mut self.peers[index];
        while let Some(mut outgoing) = peer.sent_unreliable_commands.pop_front() {
            outgoing.release_packet();
        }
    }

    /// Requeue reliable commands whose retransmission timer lapsed;
    /// returns true when the peer blew through its timeout budget and was
    /// disconnected.
    fn check_timeouts(&mut self, index: usize, event: &mut Option<Event>, deliver: bool) -> bool {
        let service_time = self.service_time;
        let mut requeued = Vec::new();
        let mut timed_out_peer = false;

        {
            let peer = &mut self.peers[index];
            let mut at = 0usize;
            while at < peer.sent_reliable_commands.len() {
                let (sent_time, round_trip_timeout, round_trip_timeout_limit) = {
                    let outgoing = &peer.sent_reliable_commands[at];
                    (
                        outgoing.sent_time,
                        outgoing.round_trip_timeout,
                        outgoing.round_trip_timeout_limit,
                    )
                };

                if time_difference(service_time, sent_time) < round_trip_timeout {
                    at += 1;
                    continue;
                }

                if peer.earliest_timeout == 0 || time_less(sent_time, peer.earliest_timeout) {
                    peer.earliest_timeout = sent_time;
                }

                if peer.earliest_timeout != 0
                    && (time_difference(service_time, peer.earliest_timeout)
                        >= peer.timeout_maximum
                        || (round_trip_timeout >= round_trip_timeout_limit
                            && time_difference(service_time, peer.earliest_timeout)
                                >= peer.timeout_minimum))
                {
                    timed_out_peer = true;
                    break;
                }

                let mut outgoing = peer.sent_reliable_commands.remove(at).unwrap();
                if outgoing.packet.is_some() {
                    peer.reliable_data_in_transit = peer
                        .reliable_data_in_transit
                        .saturating_sub(outgoing.fragment_length as u32);
                }
                peer.packets_lost += 1;
                outgoing.round_trip_timeout *= 2;
                requeued.push(outgoing);
            }

            for outgoing in requeued.into_iter().rev() {
                peer.outgoing_reliable_commands.push_front(outgoing);
            }

            if !timed_out_peer {
                if let Some(front) = peer.sent_reliable_commands.front() {
                    peer.next_timeout = front.sent_time.wrapping_add(front.round_trip_timeout);
                }
            }
        }

        if timed_out_peer {
            trace_debug!("peer {index} exceeded its timeout budget");
            self.notify_disconnect(index, event, deliver);
            return true;
        }
        false
    }

    // -- sending --

    fn send_acknowledgements(&mut self, index: usize) {
        loop {
            let peer = &mut self.peers[index];
            let Some(acknowledgement) = peer.acknowledgements.front() else {
                break;
            };

            if self.command_count >= MAXIMUM_PACKET_COMMANDS
                || (peer.mtu as usize - self.packet_size) < command_size(COMMAND_ACKNOWLEDGE)
            {
                self.continue_sending = true;
                break;
            }

            let reliable_sequence_number = acknowledgement.command.reliable_sequence_number;
            let channel_id = acknowledgement.command.channel_id;
            let acknowledged_number = acknowledgement.command.number();
            let sent_time = acknowledgement.sent_time;
            peer.acknowledgements.pop_front();

            let mut ack = Command::new(
                COMMAND_ACKNOWLEDGE,
                channel_id,
                CommandBody::Acknowledge {
                    received_reliable_sequence_number: reliable_sequence_number,
                    received_sent_time: sent_time,
                },
            );
            ack.reliable_sequence_number = reliable_sequence_number;
            ack.encode_into(&mut self.command_buffer);
            self.packet_size += command_size(COMMAND_ACKNOWLEDGE);
            self.command_count += 1;

            if acknowledged_number == COMMAND_DISCONNECT {
                self.dispatch_state(index, PeerState::Zombie);
            }
        }
    }

    fn send_reliable_outgoing_commands(&mut self, index: usize) -> bool {
        let service_time = self.service_time;
        let mut window_exceeded = false;
        let mut window_wrap = false;
        let mut can_ping = true;
        let mut at = 0usize;

        loop {
            let peer = &mut self.peers[index];
            if at >= peer.outgoing_reliable_commands.len() {
                break;
            }

            let (channel_exists, reliable_window, first_send, has_packet, fragment_length, size) = {
                let outgoing = &peer.outgoing_reliable_commands[at];
                (
                    (outgoing.command.channel_id as usize) < peer.channels.len(),
                    Channel::reliable_window(outgoing.reliable_sequence_number),
                    outgoing.send_attempts < 1,
                    outgoing.packet.is_some(),
                    outgoing.fragment_length,
                    command_size(outgoing.command.command),
                )
            };

            if channel_exists {
                let outgoing = &peer.outgoing_reliable_commands[at];
                let channel = &peer.channels[outgoing.command.channel_id as usize];
                if !window_wrap
                    && first_send
                    && outgoing.reliable_sequence_number % crate::channel::RELIABLE_WINDOW_SIZE
                        == 0
                {
                    let previous_window =
                        (reliable_window + RELIABLE_WINDOWS - 1) % RELIABLE_WINDOWS;
                    let free_mask = (1u32 << FREE_RELIABLE_WINDOWS) - 1;
                    let wrap_mask = ((free_mask << reliable_window)
                        | (free_mask >> (RELIABLE_WINDOWS - reliable_window)))
                        as u16;
                    if channel.reliable_windows[previous_window as usize]
                        >= crate::channel::RELIABLE_WINDOW_SIZE
                        || channel.used_reliable_windows & wrap_mask != 0
                    {
                        window_wrap = true;
                    }
                }
                if window_wrap {
                    at += 1;
                    continue;
                }
            }

            if has_packet {
                if !window_exceeded {
                    let window_size =
                        (peer.packet_throttle * peer.window_size) / PACKET_THROTTLE_SCALE;
                    if peer.reliable_data_in_transit + fragment_length as u32
                        > window_size.max(peer.mtu)
                    {
                        window_exceeded = true;
                    }
                }
                if window_exceeded {
                    at += 1;
                    continue;
                }
            }

            can_ping = false;

            if self.command_count >= MAXIMUM_PACKET_COMMANDS
                || (peer.mtu as usize - self.packet_size) < size
                || (has_packet
                    && (peer.mtu as usize - self.packet_size) < size + fragment_length as usize)
            {
                self.continue_sending = true;
                break;
            }

            let mut outgoing = peer.outgoing_reliable_commands.remove(at).unwrap();

            if channel_exists && outgoing.send_attempts < 1 {
                let channel = &mut peer.channels[outgoing.command.channel_id as usize];
                channel.used_reliable_windows |= 1 << reliable_window;
                channel.reliable_windows[reliable_window as usize] += 1;
            }

            outgoing.send_attempts += 1;
            if outgoing.round_trip_timeout == 0 {
                outgoing.round_trip_timeout =
                    peer.round_trip_time + 4 * peer.round_trip_time_variance;
                outgoing.round_trip_timeout_limit =
                    peer.timeout_limit * outgoing.round_trip_timeout;
            }

            if peer.sent_reliable_commands.is_empty() {
                peer.next_timeout = service_time.wrapping_add(outgoing.round_trip_timeout);
            }

            outgoing.sent_time = service_time;
            self.header_flags |= HEADER_FLAG_SENT_TIME;

            outgoing.command.encode_into(&mut self.command_buffer);
            self.packet_size += size;

            if let Some(packet) = &outgoing.packet {
                let start = outgoing.fragment_offset as usize;
                let end = start + outgoing.fragment_length as usize;
                self.command_buffer.extend_from_slice(&packet.data()[start..end]);
                self.packet_size += outgoing.fragment_length as usize;
                peer.reliable_data_in_transit += outgoing.fragment_length as u32;
            }

            self.command_count += 1;
            peer.packets_sent += 1;
            peer.sent_reliable_commands.push_back(outgoing);
        }

        can_ping
    }

    fn send_unreliable_outgoing_commands(&mut self, index: usize) {
        let mut at = 0usize;

        loop {
            let peer = &mut self.peers[index];
            if at >= peer.outgoing_unreliable_commands.len() {
                break;
            }

            let (has_packet, fragment_offset, fragment_length, size) = {
                let outgoing = &peer.outgoing_unreliable_commands[at];
                (
                    outgoing.packet.is_some(),
                    outgoing.fragment_offset,
                    outgoing.fragment_length,
                    command_size(outgoing.command.command),
                )
            };

            if self.command_count >= MAXIMUM_PACKET_COMMANDS
                || (peer.mtu as usize - self.packet_size) < size
                || (has_packet
                    && (peer.mtu as usize - self.packet_size) < size + fragment_length as usize)
            {
                self.continue_sending = true;
                break;
            }

            if has_packet && fragment_offset == 0 {
                peer.packet_throttle_counter += PACKET_THROTTLE_COUNTER;
                peer.packet_throttle_counter %= PACKET_THROTTLE_SCALE;
                if peer.packet_throttle_counter > peer.packet_throttle {
                    let (reliable_sequence_number, unreliable_sequence_number) = {
                        let outgoing = &peer.outgoing_unreliable_commands[at];
                        (
                            outgoing.reliable_sequence_number,
                            outgoing.unreliable_sequence_number,
                        )
                    };

                    // Drop the packet and all of its fragments.
                    peer.outgoing_unreliable_commands.remove(at);
                    while at < peer.outgoing_unreliable_commands.len() {
                        let next = &peer.outgoing_unreliable_commands[at];
                        if next.reliable_sequence_number != reliable_sequence_number
                            || next.unreliable_sequence_number != unreliable_sequence_number
                        {
                            break;
                        }
                        peer.outgoing_unreliable_commands.remove(at);
                    }
                    continue;
                }
            }

            let outgoing = peer.outgoing_unreliable_commands.remove(at).unwrap();
            outgoing.command.encode_into(&mut self.command_buffer);
            self.packet_size += size;
            self.command_count += 1;

            if let Some(packet) = &outgoing.packet {
                let start = outgoing.fragment_offset as usize;
                let end = start + outgoing.fragment_length as usize;
                self.command_buffer.extend_from_slice(&packet.data()[start..end]);
                self.packet_size += outgoing.fragment_length as usize;
                peer.sent_unreliable_commands.push_back(outgoing);
            }
        }

        let peer = &self.peers[index];
        if peer.state == PeerState::DisconnectLater && peer.outgoing_queues_empty() {
            let data = peer.event_data;
            self.disconnect(PeerId(index), data);
        }
    }

    pub(crate) fn send_outgoing_commands(
        &mut self,
        event: &mut Option<Event>,
        deliver: bool,
        check_for_timeouts: bool,
    ) -> Result<bool> {
        self.continue_sending = true;

        while self.continue_sending {
            self.continue_sending = false;

            for index in 0..self.peers.len() {
                {
                    let peer = &self.peers[index];
                    if peer.state == PeerState::Disconnected || peer.state == PeerState::Zombie {
                        continue;
                    }
                }

                self.header_flags = 0;
                self.command_count = 0;
                self.packet_size = HEADER_SIZE_SENT_TIME;
                self.command_buffer.clear();

                if !self.peers[index].acknowledgements.is_empty() {
                    self.send_acknowledgements(index);
                }

                if check_for_timeouts
                    && !self.peers[index].sent_reliable_commands.is_empty()
                    && time_greater_equal(self.service_time, self.peers[index].next_timeout)
                    && self.check_timeouts(index, event, deliver)
                {
                    if deliver && event.is_some() {
                        return Ok(true);
                    }
                    continue;
                }

                let can_ping = self.peers[index].outgoing_reliable_commands.is_empty()
                    || self.send_reliable_outgoing_commands(index);
                if can_ping
                    && self.peers[index].sent_reliable_commands.is_empty()
                    && time_difference(self.service_time, self.peers[index].last_receive_time)
                        >= self.peers[index].ping_interval
                    && (self.peers[index].mtu as usize - self.packet_size)
                        >= command_size(COMMAND_PING)
                {
                    self.peers[index].ping();
                    self.send_reliable_outgoing_commands(index);
                }

                if !self.peers[index].outgoing_unreliable_commands.is_empty() {
                    self.send_unreliable_outgoing_commands(index);
                }

                if self.command_count == 0 {
                    continue;
                }

                self.update_packet_loss(index);
                self.transmit_datagram(index)?;
            }
        }

        Ok(false)
    }

    fn update_packet_loss(&mut self, index: usize) {
        let service_time = self.service_time;
        let peer = &mut self.peers[index];

        if peer.packet_loss_epoch == 0 {
            peer.packet_loss_epoch = service_time;
        } else if time_difference(service_time, peer.packet_loss_epoch)
            >= crate::peer::PACKET_LOSS_INTERVAL
            && peer.packets_sent > 0
        {
            let packet_loss = (peer.packets_lost as u64 * crate::peer::PACKET_LOSS_SCALE as u64
                / peer.packets_sent as u64) as u32;

            peer.packet_loss_variance -= peer.packet_loss_variance / 4;
            if packet_loss >= peer.packet_loss {
                peer.packet_loss += (packet_loss - peer.packet_loss) / 8;
                peer.packet_loss_variance += (packet_loss - peer.packet_loss) / 4;
            } else {
                peer.packet_loss -= (peer.packet_loss - packet_loss) / 8;
                peer.packet_loss_variance += (peer.packet_loss - packet_loss) / 4;
            }

            peer.packet_loss_epoch = service_time;
            peer.packets_sent = 0;
            peer.packets_lost = 0;
        }
    }

    /// Assemble the header (flags, session, sent time, checksum slot) and
    /// queued command bytes into one datagram and put it on the wire.
    fn transmit_datagram(&mut self, index: usize) -> Result<()> {
        let mut should_compress = 0usize;
        if let Some(mut compressor) = self.compressor.take() {
            let original_size = self.command_buffer.len();
            let mut scratch = std::mem::take(&mut self.compress_scratch);
            scratch.resize(original_size, 0);
            let compressed_size = compressor.compress(&self.command_buffer, &mut scratch);
            if compressed_size > 0 && compressed_size < original_size {
                self.header_flags |= HEADER_FLAG_COMPRESSED;
                should_compress = compressed_size;
            }
            self.compress_scratch = scratch;
            self.compressor = Some(compressor);
        }

        let (outgoing_peer_id, outgoing_session_id, connect_id, address) = {
            let peer = &self.peers[index];
            (
                peer.outgoing_peer_id,
                peer.outgoing_session_id,
                peer.connect_id,
                peer.address,
            )
        };

        if outgoing_peer_id < MAXIMUM_PEER_ID {
            self.header_flags |= (outgoing_session_id as u16) << HEADER_SESSION_SHIFT;
        }

        let mut datagram = std::mem::take(&mut self.send_scratch);
        datagram.clear();
        datagram.extend_from_slice(&(outgoing_peer_id | self.header_flags).to_be_bytes());
        if self.header_flags & HEADER_FLAG_SENT_TIME != 0 {
            datagram.extend_from_slice(&((self.service_time & 0xFFFF) as u16).to_be_bytes());
        }

        let checksum_slot = if self.checksum.is_some() {
            let slot = datagram.len();
            let slot_value = if outgoing_peer_id < MAXIMUM_PEER_ID {
                connect_id
            } else {
                0
            };
            datagram.extend_from_slice(&slot_value.to_be_bytes());
            Some(slot)
        } else {
            None
        };

        let header_length = datagram.len();
        datagram.extend_from_slice(&self.command_buffer);

        if let (Some(slot), Some(checksum_fn)) = (checksum_slot, self.checksum.as_ref()) {
            let checksum = checksum_fn(&datagram);
            datagram[slot..slot + 4].copy_from_slice(&checksum.to_be_bytes());
        }

        if should_compress > 0 {
            datagram.truncate(header_length);
            datagram.extend_from_slice(&self.compress_scratch[..should_compress]);
        }

        self.peers[index].last_send_time = self.service_time;
        let sent = self.socket.send(address, &datagram);
        self.send_scratch = datagram;

        self.remove_sent_unreliable_commands(index);

        let sent_length = sent?;
        self.total_sent_data = self.total_sent_data.wrapping_add(sent_length as u32);
        self.total_sent_packets = self.total_sent_packets.wrapping_add(1);
        Ok(())
    }
}

enum FragmentLookup {
    Found(usize),
    Missing,
    Corrupt,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::channel::RELIABLE_WINDOW_SIZE;
    use crate::host::HostConfig;
    use crate::packet::Packet;

    /// Host whose first peer slot is wired up as if a handshake finished.
    /// The peer address points at a dead port, so transmissions vanish.
    fn host_with_connected_peer() -> Host {
        let mut host = Host::bind(
            None,
            HostConfig {
                peer_count: 2,
                ..HostConfig::default()
            },
        )
        .unwrap();
        let peer = &mut host.peers[0];
        peer.state = PeerState::Connected;
        peer.channels = vec![Channel::new()];
        peer.address = Address::new(0x7F00_0001, 9);
        peer.outgoing_peer_id = 0;
        host.connected_peers = 1;
        host
    }

    fn begin_datagram(host: &mut Host) {
        host.header_flags = 0;
        host.command_count = 0;
        host.packet_size = HEADER_SIZE_SENT_TIME;
        host.command_buffer.clear();
    }

    #[test]
    fn reliable_queue_stalls_until_the_previous_window_drains() {
        let mut host = host_with_connected_peer();
        {
            let peer = &mut host.peers[0];
            let channel = &mut peer.channels[0];
            // The next reliable send opens window 1 while window 0 still
            // has a full complement of unacknowledged commands.
            channel.outgoing_reliable_sequence_number = RELIABLE_WINDOW_SIZE - 1;
            channel.reliable_windows[0] = RELIABLE_WINDOW_SIZE;
            channel.used_reliable_windows = 1;
            peer.send(0, Packet::new(b"stalled", FLAG_RELIABLE), usize::MAX, false)
                .unwrap();
        }

        host.service_time = 1_000;
        begin_datagram(&mut host);
        host.send_reliable_outgoing_commands(0);
        assert_eq!(host.peers[0].outgoing_reliable_commands.len(), 1);
        assert!(host.peers[0].sent_reliable_commands.is_empty());
        assert_eq!(host.command_count, 0);

        // Acknowledgements drained window 0; the stalled command moves.
        {
            let channel = &mut host.peers[0].channels[0];
            channel.reliable_windows[0] = 0;
            channel.used_reliable_windows = 0;
        }
        begin_datagram(&mut host);
        host.send_reliable_outgoing_commands(0);
        assert!(host.peers[0].outgoing_reliable_commands.is_empty());
        assert_eq!(host.peers[0].sent_reliable_commands.len(), 1);
        assert_eq!(host.command_count, 1);
    }

    #[test]
    fn timed_out_reliable_command_requeues_with_doubled_timeout() {
        let mut host = host_with_connected_peer();
        {
            let peer = &mut host.peers[0];
            peer.send(0, Packet::new(b"x", FLAG_RELIABLE), usize::MAX, false)
                .unwrap();
            let mut outgoing = peer.outgoing_reliable_commands.pop_front().unwrap();
            outgoing.sent_time = 100;
            outgoing.send_attempts = 1;
            outgoing.round_trip_timeout = 500;
            outgoing.round_trip_timeout_limit = 500 * 32;
            peer.sent_reliable_commands.push_back(outgoing);
            peer.reliable_data_in_transit = 1;
        }

        host.service_time = 700;
        let mut event = None;
        assert!(!host.check_timeouts(0, &mut event, true));
        assert!(event.is_none());

        let peer = &host.peers[0];
        assert!(peer.sent_reliable_commands.is_empty());
        assert_eq!(peer.outgoing_reliable_commands.len(), 1);
        assert_eq!(peer.outgoing_reliable_commands[0].round_trip_timeout, 1_000);
        assert_eq!(peer.packets_lost, 1);
        assert_eq!(peer.reliable_data_in_transit, 0);
    }

    #[test]
    fn exhausted_timeout_budget_disconnects_the_peer() {
        let mut host = host_with_connected_peer();
        {
            let peer = &mut host.peers[0];
            peer.send(0, Packet::new(b"x", FLAG_RELIABLE), usize::MAX, false)
                .unwrap();
            let mut outgoing = peer.outgoing_reliable_commands.pop_front().unwrap();
            outgoing.sent_time = 100;
            outgoing.send_attempts = 1;
            outgoing.round_trip_timeout = 500;
            outgoing.round_trip_timeout_limit = 500 * 32;
            peer.sent_reliable_commands.push_back(outgoing);
        }

        host.service_time = 100 + host.peers[0].timeout_maximum + 1;
        let mut event = None;
        assert!(host.check_timeouts(0, &mut event, true));
        assert!(matches!(event, Some(Event::Disconnect { data: 0, .. })));
        assert_eq!(host.peers[0].state, PeerState::Disconnected);
    }
}

/// Copy one fragment into the packet under reassembly. Re-deliveries are
/// ignored. Returns true when this was the last missing fragment.
fn apply_fragment(
    incoming: &mut crate::peer::IncomingCommand,
    fragment_number: u32,
    fragment_offset: u32,
    payload: &[u8],
) -> bool {
    if incoming.has_fragment(fragment_number) {
        return false;
    }

    incoming.fragments_remaining -= 1;
    incoming.mark_fragment(fragment_number);

    let mut fragment_length = payload.len();
    if fragment_offset as usize + fragment_length > incoming.data.len() {
        fragment_length = incoming.data.len() - fragment_offset as usize;
    }
    incoming.data[fragment_offset as usize..fragment_offset as usize + fragment_length]
        .copy_from_slice(&payload[..fragment_length]);

    incoming.fragments_remaining == 0
}
