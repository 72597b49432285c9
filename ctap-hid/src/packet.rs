use byteorder::{BigEndian, ByteOrder};
use std::cmp;
use std::collections::VecDeque;
use thiserror::Error;

use crate::channel::ChannelId;
use crate::CommandType;

pub const HID_REPORT_LEN: usize = 64;
pub(crate) const INITIAL_PACKET_DATA_LEN: usize = HID_REPORT_LEN - 7;
pub(crate) const CONTINUATION_PACKET_DATA_LEN: usize = HID_REPORT_LEN - 5;
pub(crate) const MAX_SEQUENCE_NUMBER: u8 = 0x7f;

const FRAME_TYPE_INIT: u8 = 0b1000_0000;
const FRAME_TYPE_MASK: u8 = 0b1000_0000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("HID report is {0} bytes, expected {HID_REPORT_LEN}")]
    ReportLength(usize),
}

#[derive(PartialEq, Eq, Debug, Clone)]
pub enum Packet {
    /// An initialization packet is the first packet sent in a message, it starts a new transaction.
    ///
    /// Offset  Length  Mnemonic  Description
    /// ------------------------------------------------------------------------------
    /// 0       4       CID       Channel identifier
    /// 4       1       CMD       Command identifier (bit 7 always set)
    /// 5       1       BCNTH     High part of payload length
    /// 6       1       BCNTL     Low part of payload length
    /// 7       (s - 7) DATA      Payload data (s is equal to the fixed packet size)
    Initialization {
        channel_id: ChannelId,
        command: CommandType,
        data: Vec<u8>,
        payload_len: u16,
    },
    /// When a message does not fit in one packet, one or more continuation packets must be sent
    /// in strict assending order of sequence to complete the message transfer.
    ///
    /// Offset  Length  Mnemonic  Description
    /// ------------------------------------------------------------------------------
    /// 0       4       CID       Channel identifier
    /// 4       1       SEQ       Packet sequence 0x00..0x7f (bit 7 always cleared)
    /// 5       (s - 5) DATA      Payload data (s is equal to the fixed packet size)
    Continuation {
        channel_id: ChannelId,
        sequence_number: u8,
        data: Vec<u8>,
    },
}

impl Packet {
    pub fn channel_id(&self) -> ChannelId {
        match self {
            Packet::Initialization { channel_id, .. } => *channel_id,
            Packet::Continuation { channel_id, .. } => *channel_id,
        }
    }

    /// Parses one HID report. Bytes past the report length are ignored.
    pub fn from_bytes(bytes: &[u8]) -> Result<Packet, PacketError> {
        if bytes.len() < HID_REPORT_LEN {
            return Err(PacketError::ReportLength(bytes.len()));
        }

        let channel_id = ChannelId(BigEndian::read_u32(&bytes[0..4]));
        let first_byte = bytes[4];
        if first_byte & FRAME_TYPE_MASK == FRAME_TYPE_INIT {
            Ok(Packet::Initialization {
                channel_id,
                command: CommandType::from_byte(first_byte),
                payload_len: BigEndian::read_u16(&bytes[5..7]),
                data: bytes[7..HID_REPORT_LEN].to_vec(),
            })
        } else {
            Ok(Packet::Continuation {
                channel_id,
                sequence_number: first_byte,
                data: bytes[5..HID_REPORT_LEN].to_vec(),
            })
        }
    }

    /// Serializes into one zero-padded HID report. Data beyond the capacity of the frame is not
    /// representable and is left out; [`Packet::encode_message`] never produces such packets.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; HID_REPORT_LEN];
        match self {
            Packet::Initialization {
                channel_id,
                command,
                data,
                payload_len,
            } => {
                BigEndian::write_u32(&mut bytes[0..4], channel_id.0);
                bytes[4] = command.to_byte() | FRAME_TYPE_INIT;
                BigEndian::write_u16(&mut bytes[5..7], *payload_len);
                let len = cmp::min(data.len(), INITIAL_PACKET_DATA_LEN);
                bytes[7..7 + len].copy_from_slice(&data[..len]);
            }
            Packet::Continuation {
                channel_id,
                sequence_number,
                data,
            } => {
                BigEndian::write_u32(&mut bytes[0..4], channel_id.0);
                bytes[4] = sequence_number & !FRAME_TYPE_MASK;
                let len = cmp::min(data.len(), CONTINUATION_PACKET_DATA_LEN);
                bytes[5..5 + len].copy_from_slice(&data[..len]);
            }
        }
        bytes
    }

    /// Splits a message into an initialization packet followed by continuation packets.
    ///
    /// `data` must not exceed [`MAX_PAYLOAD_LEN`](crate::MAX_PAYLOAD_LEN).
    pub(crate) fn encode_message(
        channel_id: ChannelId,
        command: CommandType,
        data: &[u8],
    ) -> VecDeque<Packet> {
        debug_assert!(data.len() <= crate::MAX_PAYLOAD_LEN);
        let mut packets = VecDeque::new();
        let payload_len = data.len() as u16;
        let split_index = cmp::min(data.len(), INITIAL_PACKET_DATA_LEN);
        let (initial, remaining) = data.split_at(split_index);
        packets.push_back(Packet::Initialization {
            channel_id,
            command,
            payload_len,
            data: initial.to_vec(),
        });
        for (i, chunk) in remaining.chunks(CONTINUATION_PACKET_DATA_LEN).enumerate() {
            packets.push_back(Packet::Continuation {
                channel_id,
                sequence_number: i as u8,
                data: chunk.to_vec(),
            });
        }
        packets
    }

    /// Reassembles a complete message from its packets, as a host would on receipt.
    ///
    /// Returns `None` if the packets do not form exactly one well-ordered message.
    pub(crate) fn decode_message(packets: &[Packet]) -> Option<(ChannelId, CommandType, Vec<u8>)> {
        let (first, rest) = packets.split_first()?;
        let (channel_id, command, mut payload, payload_len) = match first {
            Packet::Initialization {
                channel_id,
                command,
                data,
                payload_len,
            } => (*channel_id, *command, data.clone(), *payload_len as usize),
            Packet::Continuation { .. } => return None,
        };

        for (expected_sequence_number, packet) in rest.iter().enumerate() {
            match packet {
                Packet::Continuation {
                    channel_id: packet_channel_id,
                    sequence_number,
                    data,
                } if *packet_channel_id == channel_id
                    && *sequence_number as usize == expected_sequence_number =>
                {
                    payload.extend_from_slice(data);
                }
                _ => return None,
            }
        }

        if payload.len() < payload_len {
            return None;
        }
        payload.truncate(payload_len);
        Some((channel_id, command, payload))
    }
}

#[cfg(test)]
mod tests {
    use crate::channel::BROADCAST_CHANNEL_ID;

    use super::*;

    #[test]
    fn packet_to_bytes_and_back() {
        let mut data = vec![0u8; INITIAL_PACKET_DATA_LEN];
        data[..8].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let packet = Packet::Initialization {
            channel_id: ChannelId(0x12345678),
            command: CommandType::Ping,
            data,
            payload_len: 0x08,
        };

        let bytes = packet.to_bytes();

        assert_eq!(&bytes[..8], &[0x12, 0x34, 0x56, 0x78, 0x81, 0x00, 0x08, 0x01]);
        assert_eq!(Packet::from_bytes(&bytes).unwrap(), packet);
    }

    #[test]
    fn continuation_layout() {
        let bytes = Packet::Continuation {
            channel_id: ChannelId(1),
            sequence_number: 3,
            data: vec![0xaa, 0xbb],
        }
        .to_bytes();

        assert_eq!(bytes.len(), HID_REPORT_LEN);
        assert_eq!(&bytes[..7], &[0, 0, 0, 1, 3, 0xaa, 0xbb]);
        assert!(bytes[7..].iter().all(|&b| b == 0));
    }

    #[test]
    fn short_report_is_an_error() {
        assert_eq!(
            Packet::from_bytes(&[0u8; 10]),
            Err(PacketError::ReportLength(10))
        );
    }

    #[test]
    fn encode_message() {
        let data: Vec<u8> = (1..=127).collect();
        let packets = Vec::from(Packet::encode_message(
            BROADCAST_CHANNEL_ID,
            CommandType::Init,
            &data,
        ));

        assert_eq!(
            packets,
            vec![
                Packet::Initialization {
                    channel_id: BROADCAST_CHANNEL_ID,
                    command: CommandType::Init,
                    data: (1..=57).collect(),
                    payload_len: 127,
                },
                Packet::Continuation {
                    channel_id: BROADCAST_CHANNEL_ID,
                    data: (58..=116).collect(),
                    sequence_number: 0,
                },
                Packet::Continuation {
                    channel_id: BROADCAST_CHANNEL_ID,
                    data: (117..=127).collect(),
                    sequence_number: 1,
                }
            ]
        );
    }

    #[test]
    fn reassembly_at_frame_boundaries() {
        let boundaries = [
            0,
            1,
            INITIAL_PACKET_DATA_LEN,
            INITIAL_PACKET_DATA_LEN + 1,
            INITIAL_PACKET_DATA_LEN + CONTINUATION_PACKET_DATA_LEN,
            crate::MAX_PAYLOAD_LEN,
        ];
        for len in boundaries {
            let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let packets: Vec<Packet> =
                Packet::encode_message(ChannelId(7), CommandType::Msg, &data)
                    .into_iter()
                    .map(|packet| Packet::from_bytes(&packet.to_bytes()).unwrap())
                    .collect();

            assert_eq!(
                Packet::decode_message(&packets),
                Some((ChannelId(7), CommandType::Msg, data)),
                "payload of {} bytes",
                len
            );
        }
    }

    #[test]
    fn max_payload_uses_all_sequence_numbers() {
        let packets = Packet::encode_message(
            ChannelId(1),
            CommandType::Cbor,
            &vec![0; crate::MAX_PAYLOAD_LEN],
        );
        assert_eq!(packets.len(), 129);
        assert_eq!(
            packets.back().map(|packet| match packet {
                Packet::Continuation {
                    sequence_number, ..
                } => *sequence_number,
                Packet::Initialization { .. } => 0xff,
            }),
            Some(MAX_SEQUENCE_NUMBER)
        );
    }

    #[test]
    fn decode_message_rejects_out_of_order() {
        let mut packets = Vec::from(Packet::encode_message(
            ChannelId(1),
            CommandType::Msg,
            &[0u8; 200],
        ));
        packets.swap(1, 2);
        assert_eq!(Packet::decode_message(&packets), None);
    }
}
