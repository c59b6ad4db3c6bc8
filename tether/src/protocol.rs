//! Protocol commands and their wire form.
//!
//! Every datagram is a 2- or 4-byte header (peer id / session / flags,
//! optionally followed by a 16-bit sent time and a 32-bit checksum slot)
//! and then up to [`MAXIMUM_PACKET_COMMANDS`] commands. Commands are
//! byte-packed and big-endian; nothing here relies on memory layout.

/// Smallest MTU a peer may negotiate.
pub const MINIMUM_MTU: u32 = 576;
/// Largest MTU a peer may negotiate.
pub const MAXIMUM_MTU: u32 = 4096;
/// Upper bound on commands batched into one datagram.
pub const MAXIMUM_PACKET_COMMANDS: usize = 32;
/// Smallest reliable window, in bytes.
pub const MINIMUM_WINDOW_SIZE: u32 = 4096;
/// Largest reliable window, in bytes.
pub const MAXIMUM_WINDOW_SIZE: u32 = 65536;
pub const MINIMUM_CHANNEL_COUNT: usize = 1;
pub const MAXIMUM_CHANNEL_COUNT: usize = 255;
/// Peer ids are 12 bits; this value doubles as "no peer yet".
pub const MAXIMUM_PEER_ID: u16 = 0xFFF;
pub const MAXIMUM_FRAGMENT_COUNT: u32 = 1024 * 1024;

/// Command-byte flag: the command must be acknowledged.
pub const COMMAND_FLAG_ACKNOWLEDGE: u8 = 1 << 7;
/// Command-byte flag: the command is outside any sequence.
pub const COMMAND_FLAG_UNSEQUENCED: u8 = 1 << 6;
/// Low bits of the command byte carrying the command number.
pub const COMMAND_MASK: u8 = 0x0F;

/// Datagram-header flag: the command stream is compressed.
pub const HEADER_FLAG_COMPRESSED: u16 = 1 << 14;
/// Datagram-header flag: a 16-bit sent time follows the peer id.
pub const HEADER_FLAG_SENT_TIME: u16 = 1 << 15;
pub const HEADER_FLAG_MASK: u16 = HEADER_FLAG_COMPRESSED | HEADER_FLAG_SENT_TIME;
pub const HEADER_SESSION_MASK: u16 = 3 << 12;
pub const HEADER_SESSION_SHIFT: u16 = 12;

/// Peer-id field alone.
pub const HEADER_SIZE_MINIMAL: usize = 2;
/// Peer-id field plus sent time.
pub const HEADER_SIZE_SENT_TIME: usize = 4;
pub const CHECKSUM_SIZE: usize = 4;
/// Command byte, channel id, reliable sequence number.
pub const COMMAND_HEADER_SIZE: usize = 4;

pub const COMMAND_ACKNOWLEDGE: u8 = 1;
pub const COMMAND_CONNECT: u8 = 2;
pub const COMMAND_VERIFY_CONNECT: u8 = 3;
pub const COMMAND_DISCONNECT: u8 = 4;
pub const COMMAND_PING: u8 = 5;
pub const COMMAND_SEND_RELIABLE: u8 = 6;
pub const COMMAND_SEND_UNRELIABLE: u8 = 7;
pub const COMMAND_SEND_FRAGMENT: u8 = 8;
pub const COMMAND_SEND_UNSEQUENCED: u8 = 9;
pub const COMMAND_BANDWIDTH_LIMIT: u8 = 10;
pub const COMMAND_THROTTLE_CONFIGURE: u8 = 11;
pub const COMMAND_SEND_UNRELIABLE_FRAGMENT: u8 = 12;
pub const COMMAND_COUNT: u8 = 13;

/// Encoded size of a command, including its 4-byte header. 0 for invalid
/// command numbers.
pub fn command_size(command_byte: u8) -> usize {
    match command_byte & COMMAND_MASK {
        COMMAND_ACKNOWLEDGE => 8,
        COMMAND_CONNECT => 48,
        COMMAND_VERIFY_CONNECT => 44,
        COMMAND_DISCONNECT => 8,
        COMMAND_PING => 4,
        COMMAND_SEND_RELIABLE => 6,
        COMMAND_SEND_UNRELIABLE => 8,
        COMMAND_SEND_FRAGMENT | COMMAND_SEND_UNRELIABLE_FRAGMENT => 24,
        COMMAND_SEND_UNSEQUENCED => 8,
        COMMAND_BANDWIDTH_LIMIT => 12,
        COMMAND_THROTTLE_CONFIGURE => 16,
        _ => 0,
    }
}

/// Connection parameters proposed by the initiating side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectBody {
    pub outgoing_peer_id: u16,
    pub incoming_session_id: u8,
    pub outgoing_session_id: u8,
    pub mtu: u32,
    pub window_size: u32,
    pub channel_count: u32,
    pub incoming_bandwidth: u32,
    pub outgoing_bandwidth: u32,
    pub packet_throttle_interval: u32,
    pub packet_throttle_acceleration: u32,
    pub packet_throttle_deceleration: u32,
    pub connect_id: u32,
    pub data: u32,
}

/// Parameters echoed back by the accepting side after negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyConnectBody {
    pub outgoing_peer_id: u16,
    pub incoming_session_id: u8,
    pub outgoing_session_id: u8,
    pub mtu: u32,
    pub window_size: u32,
    pub channel_count: u32,
    pub incoming_bandwidth: u32,
    pub outgoing_bandwidth: u32,
    pub packet_throttle_interval: u32,
    pub packet_throttle_acceleration: u32,
    pub packet_throttle_deceleration: u32,
    pub connect_id: u32,
}

/// Shared body of reliable and unreliable fragment commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentBody {
    pub start_sequence_number: u16,
    pub data_length: u16,
    pub fragment_count: u32,
    pub fragment_number: u32,
    pub total_length: u32,
    pub fragment_offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBody {
    Acknowledge {
        received_reliable_sequence_number: u16,
        received_sent_time: u16,
    },
    Connect(ConnectBody),
    VerifyConnect(VerifyConnectBody),
    Disconnect {
        data: u32,
    },
    Ping,
    SendReliable {
        data_length: u16,
    },
    SendUnreliable {
        unreliable_sequence_number: u16,
        data_length: u16,
    },
    /// Used by both the reliable and the unreliable fragment commands;
    /// the command byte distinguishes them.
    SendFragment(FragmentBody),
    SendUnsequenced {
        unsequenced_group: u16,
        data_length: u16,
    },
    BandwidthLimit {
        incoming_bandwidth: u32,
        outgoing_bandwidth: u32,
    },
    ThrottleConfigure {
        interval: u32,
        acceleration: u32,
        deceleration: u32,
    },
}

/// One protocol command: the raw command byte (number plus flag bits),
/// channel id, reliable sequence number and the typed body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub command: u8,
    pub channel_id: u8,
    pub reliable_sequence_number: u16,
    pub body: CommandBody,
}

#[inline]
fn u16_at(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

#[inline]
fn u32_at(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

impl Command {
    pub fn new(command: u8, channel_id: u8, body: CommandBody) -> Self {
        Self {
            command,
            channel_id,
            reliable_sequence_number: 0,
            body,
        }
    }

    /// Command number with flag bits stripped.
    #[inline]
    pub fn number(&self) -> u8 {
        self.command & COMMAND_MASK
    }

    #[inline]
    pub fn wants_acknowledge(&self) -> bool {
        self.command & COMMAND_FLAG_ACKNOWLEDGE != 0
    }

    #[inline]
    pub fn is_unsequenced(&self) -> bool {
        self.command & COMMAND_FLAG_UNSEQUENCED != 0
    }

    /// Encoded size including the command header.
    pub fn size(&self) -> usize {
        command_size(self.command)
    }

    /// Append the wire form to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.command);
        out.push(self.channel_id);
        out.extend_from_slice(&self.reliable_sequence_number.to_be_bytes());

        match self.body {
            CommandBody::Acknowledge {
                received_reliable_sequence_number,
                received_sent_time,
            } => {
                out.extend_from_slice(&received_reliable_sequence_number.to_be_bytes());
                out.extend_from_slice(&received_sent_time.to_be_bytes());
            }
            CommandBody::Connect(body) => {
                out.extend_from_slice(&body.outgoing_peer_id.to_be_bytes());
                out.push(body.incoming_session_id);
                out.push(body.outgoing_session_id);
                out.extend_from_slice(&body.mtu.to_be_bytes());
                out.extend_from_slice(&body.window_size.to_be_bytes());
                out.extend_from_slice(&body.channel_count.to_be_bytes());
                out.extend_from_slice(&body.incoming_bandwidth.to_be_bytes());
                out.extend_from_slice(&body.outgoing_bandwidth.to_be_bytes());
                out.extend_from_slice(&body.packet_throttle_interval.to_be_bytes());
                out.extend_from_slice(&body.packet_throttle_acceleration.to_be_bytes());
                out.extend_from_slice(&body.packet_throttle_deceleration.to_be_bytes());
                out.extend_from_slice(&body.connect_id.to_be_bytes());
                out.extend_from_slice(&body.data.to_be_bytes());
            }
            CommandBody::VerifyConnect(body) => {
                out.extend_from_slice(&body.outgoing_peer_id.to_be_bytes());
                out.push(body.incoming_session_id);
                out.push(body.outgoing_session_id);
                out.extend_from_slice(&body.mtu.to_be_bytes());
                out.extend_from_slice(&body.window_size.to_be_bytes());
                out.extend_from_slice(&body.channel_count.to_be_bytes());
                out.extend_from_slice(&body.incoming_bandwidth.to_be_bytes());
                out.extend_from_slice(&body.outgoing_bandwidth.to_be_bytes());
                out.extend_from_slice(&body.packet_throttle_interval.to_be_bytes());
                out.extend_from_slice(&body.packet_throttle_acceleration.to_be_bytes());
                out.extend_from_slice(&body.packet_throttle_deceleration.to_be_bytes());
                out.extend_from_slice(&body.connect_id.to_be_bytes());
            }
            CommandBody::Disconnect { data } => {
                out.extend_from_slice(&data.to_be_bytes());
            }
            CommandBody::Ping => {}
            CommandBody::SendReliable { data_length } => {
                out.extend_from_slice(&data_length.to_be_bytes());
            }
            CommandBody::SendUnreliable {
                unreliable_sequence_number,
                data_length,
            } => {
                out.extend_from_slice(&unreliable_sequence_number.to_be_bytes());
                out.extend_from_slice(&data_length.to_be_bytes());
            }
            CommandBody::SendFragment(body) => {
                out.extend_from_slice(&body.start_sequence_number.to_be_bytes());
                out.extend_from_slice(&body.data_length.to_be_bytes());
                out.extend_from_slice(&body.fragment_count.to_be_bytes());
                out.extend_from_slice(&body.fragment_number.to_be_bytes());
                out.extend_from_slice(&body.total_length.to_be_bytes());
                out.extend_from_slice(&body.fragment_offset.to_be_bytes());
            }
            CommandBody::SendUnsequenced {
                unsequenced_group,
                data_length,
            } => {
                out.extend_from_slice(&unsequenced_group.to_be_bytes());
                out.extend_from_slice(&data_length.to_be_bytes());
            }
            CommandBody::BandwidthLimit {
                incoming_bandwidth,
                outgoing_bandwidth,
            } => {
                out.extend_from_slice(&incoming_bandwidth.to_be_bytes());
                out.extend_from_slice(&outgoing_bandwidth.to_be_bytes());
            }
            CommandBody::ThrottleConfigure {
                interval,
                acceleration,
                deceleration,
            } => {
                out.extend_from_slice(&interval.to_be_bytes());
                out.extend_from_slice(&acceleration.to_be_bytes());
                out.extend_from_slice(&deceleration.to_be_bytes());
            }
        }
    }

    /// Parse one command from the front of `buf`. Returns the command and
    /// the number of bytes consumed, or `None` for unknown numbers or a
    /// truncated buffer. Payload bytes of send commands follow the command
    /// and are not consumed here.
    pub fn decode(buf: &[u8]) -> Option<(Command, usize)> {
        if buf.len() < COMMAND_HEADER_SIZE {
            return None;
        }

        let command = buf[0];
        let size = command_size(command);
        if size == 0 || buf.len() < size {
            return None;
        }

        let channel_id = buf[1];
        let reliable_sequence_number = u16_at(buf, 2);

        let body = match command & COMMAND_MASK {
            COMMAND_ACKNOWLEDGE => CommandBody::Acknowledge {
                received_reliable_sequence_number: u16_at(buf, 4),
                received_sent_time: u16_at(buf, 6),
            },
            COMMAND_CONNECT => CommandBody::Connect(ConnectBody {
                outgoing_peer_id: u16_at(buf, 4),
                incoming_session_id: buf[6],
                outgoing_session_id: buf[7],
                mtu: u32_at(buf, 8),
                window_size: u32_at(buf, 12),
                channel_count: u32_at(buf, 16),
                incoming_bandwidth: u32_at(buf, 20),
                outgoing_bandwidth: u32_at(buf, 24),
                packet_throttle_interval: u32_at(buf, 28),
                packet_throttle_acceleration: u32_at(buf, 32),
                packet_throttle_deceleration: u32_at(buf, 36),
                connect_id: u32_at(buf, 40),
                data: u32_at(buf, 44),
            }),
            COMMAND_VERIFY_CONNECT => CommandBody::VerifyConnect(VerifyConnectBody {
                outgoing_peer_id: u16_at(buf, 4),
                incoming_session_id: buf[6],
                outgoing_session_id: buf[7],
                mtu: u32_at(buf, 8),
                window_size: u32_at(buf, 12),
                channel_count: u32_at(buf, 16),
                incoming_bandwidth: u32_at(buf, 20),
                outgoing_bandwidth: u32_at(buf, 24),
                packet_throttle_interval: u32_at(buf, 28),
                packet_throttle_acceleration: u32_at(buf, 32),
                packet_throttle_deceleration: u32_at(buf, 36),
                connect_id: u32_at(buf, 40),
            }),
            COMMAND_DISCONNECT => CommandBody::Disconnect {
                data: u32_at(buf, 4),
            },
            COMMAND_PING => CommandBody::Ping,
            COMMAND_SEND_RELIABLE => CommandBody::SendReliable {
                data_length: u16_at(buf, 4),
            },
            COMMAND_SEND_UNRELIABLE => CommandBody::SendUnreliable {
                unreliable_sequence_number: u16_at(buf, 4),
                data_length: u16_at(buf, 6),
            },
            COMMAND_SEND_FRAGMENT | COMMAND_SEND_UNRELIABLE_FRAGMENT => {
                CommandBody::SendFragment(FragmentBody {
                    start_sequence_number: u16_at(buf, 4),
                    data_length: u16_at(buf, 6),
                    fragment_count: u32_at(buf, 8),
                    fragment_number: u32_at(buf, 12),
                    total_length: u32_at(buf, 16),
                    fragment_offset: u32_at(buf, 20),
                })
            }
            COMMAND_SEND_UNSEQUENCED => CommandBody::SendUnsequenced {
                unsequenced_group: u16_at(buf, 4),
                data_length: u16_at(buf, 6),
            },
            COMMAND_BANDWIDTH_LIMIT => CommandBody::BandwidthLimit {
                incoming_bandwidth: u32_at(buf, 4),
                outgoing_bandwidth: u32_at(buf, 8),
            },
            COMMAND_THROTTLE_CONFIGURE => CommandBody::ThrottleConfigure {
                interval: u32_at(buf, 4),
                acceleration: u32_at(buf, 8),
                deceleration: u32_at(buf, 12),
            },
            _ => return None,
        };

        Some((
            Command {
                command,
                channel_id,
                reliable_sequence_number,
                body,
            },
            size,
        ))
    }

    /// Length of payload bytes that follow this command in the stream.
    pub fn payload_length(&self) -> usize {
        match self.body {
            CommandBody::SendReliable { data_length }
            | CommandBody::SendUnreliable { data_length, .. }
            | CommandBody::SendUnsequenced { data_length, .. } => data_length as usize,
            CommandBody::SendFragment(body) => body.data_length as usize,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(cmd: Command) {
        let mut buf = Vec::new();
        cmd.encode_into(&mut buf);
        assert_eq!(buf.len(), cmd.size());
        let (decoded, consumed) = Command::decode(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn roundtrip_every_command_kind() {
        roundtrip(Command {
            command: COMMAND_ACKNOWLEDGE,
            channel_id: 3,
            reliable_sequence_number: 0x1234,
            body: CommandBody::Acknowledge {
                received_reliable_sequence_number: 0xBEEF,
                received_sent_time: 0x00FF,
            },
        });
        roundtrip(Command {
            command: COMMAND_CONNECT | COMMAND_FLAG_ACKNOWLEDGE,
            channel_id: 0xFF,
            reliable_sequence_number: 1,
            body: CommandBody::Connect(ConnectBody {
                outgoing_peer_id: 7,
                incoming_session_id: 0xFF,
                outgoing_session_id: 0xFF,
                mtu: 1400,
                window_size: 32768,
                channel_count: 2,
                incoming_bandwidth: 0,
                outgoing_bandwidth: 57600,
                packet_throttle_interval: 5000,
                packet_throttle_acceleration: 2,
                packet_throttle_deceleration: 2,
                connect_id: 0xDEADBEEF,
                data: 42,
            }),
        });
        roundtrip(Command {
            command: COMMAND_VERIFY_CONNECT | COMMAND_FLAG_ACKNOWLEDGE,
            channel_id: 0xFF,
            reliable_sequence_number: 1,
            body: CommandBody::VerifyConnect(VerifyConnectBody {
                outgoing_peer_id: 0,
                incoming_session_id: 1,
                outgoing_session_id: 2,
                mtu: 1400,
                window_size: 65536,
                channel_count: 2,
                incoming_bandwidth: 0,
                outgoing_bandwidth: 0,
                packet_throttle_interval: 5000,
                packet_throttle_acceleration: 2,
                packet_throttle_deceleration: 2,
                connect_id: 99,
            }),
        });
        roundtrip(Command {
            command: COMMAND_DISCONNECT,
            channel_id: 0xFF,
            reliable_sequence_number: 0,
            body: CommandBody::Disconnect { data: 7 },
        });
        roundtrip(Command {
            command: COMMAND_PING | COMMAND_FLAG_ACKNOWLEDGE,
            channel_id: 0xFF,
            reliable_sequence_number: 9,
            body: CommandBody::Ping,
        });
        roundtrip(Command {
            command: COMMAND_SEND_RELIABLE | COMMAND_FLAG_ACKNOWLEDGE,
            channel_id: 0,
            reliable_sequence_number: 2,
            body: CommandBody::SendReliable { data_length: 512 },
        });
        roundtrip(Command {
            command: COMMAND_SEND_UNRELIABLE,
            channel_id: 1,
            reliable_sequence_number: 2,
            body: CommandBody::SendUnreliable {
                unreliable_sequence_number: 77,
                data_length: 8,
            },
        });
        roundtrip(Command {
            command: COMMAND_SEND_FRAGMENT | COMMAND_FLAG_ACKNOWLEDGE,
            channel_id: 0,
            reliable_sequence_number: 10,
            body: CommandBody::SendFragment(FragmentBody {
                start_sequence_number: 10,
                data_length: 1372,
                fragment_count: 48,
                fragment_number: 3,
                total_length: 65000,
                fragment_offset: 4116,
            }),
        });
        roundtrip(Command {
            command: COMMAND_SEND_UNRELIABLE_FRAGMENT,
            channel_id: 2,
            reliable_sequence_number: 5,
            body: CommandBody::SendFragment(FragmentBody {
                start_sequence_number: 6,
                data_length: 1000,
                fragment_count: 2,
                fragment_number: 1,
                total_length: 2000,
                fragment_offset: 1000,
            }),
        });
        roundtrip(Command {
            command: COMMAND_SEND_UNSEQUENCED | COMMAND_FLAG_UNSEQUENCED,
            channel_id: 0,
            reliable_sequence_number: 0,
            body: CommandBody::SendUnsequenced {
                unsequenced_group: 1024,
                data_length: 16,
            },
        });
        roundtrip(Command {
            command: COMMAND_BANDWIDTH_LIMIT | COMMAND_FLAG_ACKNOWLEDGE,
            channel_id: 0xFF,
            reliable_sequence_number: 3,
            body: CommandBody::BandwidthLimit {
                incoming_bandwidth: 57600,
                outgoing_bandwidth: 14400,
            },
        });
        roundtrip(Command {
            command: COMMAND_THROTTLE_CONFIGURE | COMMAND_FLAG_ACKNOWLEDGE,
            channel_id: 0xFF,
            reliable_sequence_number: 4,
            body: CommandBody::ThrottleConfigure {
                interval: 5000,
                acceleration: 2,
                deceleration: 2,
            },
        });
    }

    #[test]
    fn rejects_unknown_command_number() {
        let buf = [0u8, 0, 0, 0];
        assert!(Command::decode(&buf).is_none());
        let buf = [COMMAND_COUNT, 0, 0, 0];
        assert!(Command::decode(&buf).is_none());
    }

    #[test]
    fn rejects_truncated_command() {
        let cmd = Command {
            command: COMMAND_CONNECT,
            channel_id: 0xFF,
            reliable_sequence_number: 0,
            body: CommandBody::Connect(ConnectBody {
                outgoing_peer_id: 0,
                incoming_session_id: 0,
                outgoing_session_id: 0,
                mtu: 1400,
                window_size: 4096,
                channel_count: 1,
                incoming_bandwidth: 0,
                outgoing_bandwidth: 0,
                packet_throttle_interval: 5000,
                packet_throttle_acceleration: 2,
                packet_throttle_deceleration: 2,
                connect_id: 1,
                data: 0,
            }),
        };
        let mut buf = Vec::new();
        cmd.encode_into(&mut buf);
        assert!(Command::decode(&buf[..buf.len() - 1]).is_none());
    }

    #[test]
    fn wire_is_big_endian() {
        let cmd = Command {
            command: COMMAND_SEND_RELIABLE | COMMAND_FLAG_ACKNOWLEDGE,
            channel_id: 2,
            reliable_sequence_number: 0x0102,
            body: CommandBody::SendReliable { data_length: 0x0304 },
        };
        let mut buf = Vec::new();
        cmd.encode_into(&mut buf);
        assert_eq!(
            buf,
            [
                COMMAND_SEND_RELIABLE | COMMAND_FLAG_ACKNOWLEDGE,
                2,
                0x01,
                0x02,
                0x03,
                0x04
            ]
        );
    }
}
