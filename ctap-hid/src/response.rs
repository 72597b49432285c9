use byteorder::{BigEndian, ByteOrder};
use std::collections::VecDeque;
use thiserror::Error;

use crate::{channel::ChannelId, packet::Packet, CapabilityFlags, CommandType, ErrorCode};

const INIT_RESPONSE_LEN: usize = 17;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ping {
        data: Vec<u8>,
    },
    Msg {
        data: Vec<u8>,
    },
    Init {
        nonce: [u8; 8],
        new_channel_id: ChannelId,
        ctaphid_protocol_version: u8,
        major_device_version_number: u8,
        minor_device_version_number: u8,
        build_device_version_number: u8,
        capabilities: CapabilityFlags,
    },
    Cbor {
        data: Vec<u8>,
    },
    KeepAlive {
        status: KeepAliveStatus,
    },
    Error {
        code: ErrorCode,
    },
    Wink,
    Lock,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ResponseMessage {
    pub channel_id: ChannelId,
    pub response: Response,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveStatus {
    Processing = 0x01,
    UserPresenceNeeded = 0x02,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResponseDecodeError {
    #[error("Invalid command: {0}")]
    InvalidCommand(CommandType),

    #[error("Payload of {actual_len} bytes is too short for {command}, expected {expected_len}")]
    PayloadLength {
        command: CommandType,
        expected_len: usize,
        actual_len: usize,
    },
}

fn expect_len(
    command: CommandType,
    data: &[u8],
    expected_len: usize,
) -> Result<(), ResponseDecodeError> {
    if data.len() < expected_len {
        Err(ResponseDecodeError::PayloadLength {
            command,
            expected_len,
            actual_len: data.len(),
        })
    } else {
        Ok(())
    }
}

impl Response {
    /// Decodes a response as a host would. Used by clients and tests.
    pub fn decode(command: CommandType, data: &[u8]) -> Result<Response, ResponseDecodeError> {
        match command {
            CommandType::Msg => Ok(Response::Msg {
                data: data.to_vec(),
            }),
            CommandType::Ping => Ok(Response::Ping {
                data: data.to_vec(),
            }),
            CommandType::Init => {
                expect_len(command, data, INIT_RESPONSE_LEN)?;
                let mut nonce = [0u8; 8];
                nonce.copy_from_slice(&data[0..8]);
                Ok(Response::Init {
                    nonce,
                    new_channel_id: ChannelId(BigEndian::read_u32(&data[8..12])),
                    ctaphid_protocol_version: data[12],
                    major_device_version_number: data[13],
                    minor_device_version_number: data[14],
                    build_device_version_number: data[15],
                    capabilities: CapabilityFlags::from_bits_truncate(data[16]),
                })
            }
            CommandType::Cbor => Ok(Response::Cbor {
                data: data.to_vec(),
            }),
            CommandType::KeepAlive => {
                expect_len(command, data, 1)?;
                let status = match data[0] {
                    0x02 => KeepAliveStatus::UserPresenceNeeded,
                    _ => KeepAliveStatus::Processing,
                };
                Ok(Response::KeepAlive { status })
            }
            CommandType::Error => {
                expect_len(command, data, 1)?;
                Ok(Response::Error {
                    code: ErrorCode::from_byte(data[0]),
                })
            }
            CommandType::Wink => Ok(Response::Wink),
            CommandType::Lock => Ok(Response::Lock),
            CommandType::Cancel | CommandType::Vendor { .. } | CommandType::Unknown { .. } => {
                Err(ResponseDecodeError::InvalidCommand(command))
            }
        }
    }
}

impl ResponseMessage {
    /// Reassembles a response from the packets the device sent.
    pub fn decode(packets: &[Packet]) -> Option<Result<Self, ResponseDecodeError>> {
        let (channel_id, command, payload) = Packet::decode_message(packets)?;
        Some(
            Response::decode(command, &payload).map(|response| ResponseMessage {
                channel_id,
                response,
            }),
        )
    }

    pub fn to_packets(&self) -> VecDeque<Packet> {
        let channel_id = self.channel_id;
        match &self.response {
            Response::Ping { data } => Packet::encode_message(channel_id, CommandType::Ping, data),
            Response::Msg { data } => Packet::encode_message(channel_id, CommandType::Msg, data),
            Response::Init {
                nonce,
                new_channel_id,
                ctaphid_protocol_version,
                major_device_version_number,
                minor_device_version_number,
                build_device_version_number,
                capabilities,
            } => {
                let mut data = Vec::with_capacity(INIT_RESPONSE_LEN);
                data.extend_from_slice(nonce);
                data.extend_from_slice(&new_channel_id.to_bytes());
                data.push(*ctaphid_protocol_version);
                data.push(*major_device_version_number);
                data.push(*minor_device_version_number);
                data.push(*build_device_version_number);
                data.push(capabilities.bits());
                Packet::encode_message(channel_id, CommandType::Init, &data)
            }
            Response::Cbor { data } => Packet::encode_message(channel_id, CommandType::Cbor, data),
            Response::KeepAlive { status } => {
                Packet::encode_message(channel_id, CommandType::KeepAlive, &[*status as u8])
            }
            Response::Error { code } => {
                Packet::encode_message(channel_id, CommandType::Error, &[code.to_byte()])
            }
            Response::Wink => Packet::encode_message(channel_id, CommandType::Wink, &[]),
            Response::Lock => Packet::encode_message(channel_id, CommandType::Lock, &[]),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::CommandType;

    use super::*;

    #[test]
    fn response_message_encode_multi_packet_msg() {
        assert_eq!(
            ResponseMessage {
                channel_id: ChannelId(1),
                response: Response::Msg {
                    data: (0u8..128).collect()
                }
            }
            .to_packets(),
            vec![
                Packet::Initialization {
                    channel_id: ChannelId(1),
                    command: CommandType::Msg,
                    data: (0u8..57).collect(),
                    payload_len: 128,
                },
                Packet::Continuation {
                    channel_id: ChannelId(1),
                    sequence_number: 0,
                    data: (57u8..116).collect()
                },
                Packet::Continuation {
                    channel_id: ChannelId(1),
                    sequence_number: 1,
                    data: (116u8..128).collect()
                }
            ]
        );
    }

    #[test]
    fn init_response_layout() {
        let packets = ResponseMessage {
            channel_id: ChannelId(0xffff_ffff),
            response: Response::Init {
                nonce: [1, 2, 3, 4, 5, 6, 7, 8],
                new_channel_id: ChannelId(0x0a0b0c0d),
                ctaphid_protocol_version: 2,
                major_device_version_number: 0,
                minor_device_version_number: 5,
                build_device_version_number: 0,
                capabilities: CapabilityFlags::WINK | CapabilityFlags::CBOR,
            },
        }
        .to_packets();

        assert_eq!(
            packets.front(),
            Some(&Packet::Initialization {
                channel_id: ChannelId(0xffff_ffff),
                command: CommandType::Init,
                data: vec![1, 2, 3, 4, 5, 6, 7, 8, 0x0a, 0x0b, 0x0c, 0x0d, 2, 0, 5, 0, 0x05],
                payload_len: 17,
            })
        );
    }

    #[test]
    fn error_and_keepalive_carry_one_byte() {
        let error = ResponseMessage {
            channel_id: ChannelId(3),
            response: Response::Error {
                code: ErrorCode::ChannelBusy,
            },
        };
        let keepalive = ResponseMessage {
            channel_id: ChannelId(3),
            response: Response::KeepAlive {
                status: KeepAliveStatus::Processing,
            },
        };

        assert_eq!(
            error.to_packets()[0].to_bytes()[4..8],
            [0xbf, 0x00, 0x01, 0x06]
        );
        assert_eq!(
            keepalive.to_packets()[0].to_bytes()[4..8],
            [0xbb, 0x00, 0x01, 0x01]
        );
        assert_eq!(
            ResponseMessage::decode(&Vec::from(error.to_packets())),
            Some(Ok(error))
        );
    }

    #[test]
    fn short_init_response_is_an_error() {
        assert!(Response::decode(CommandType::Init, &[0; 8]).is_err());
    }
}
