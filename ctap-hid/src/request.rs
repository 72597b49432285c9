use std::{collections::VecDeque, time::Duration};
use thiserror::Error;

use crate::{
    channel::ChannelId, packet::Packet, CommandType, ErrorCode, COMMAND_INIT_DATA_LEN,
    MAX_LOCK_SECONDS,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Ping { data: Vec<u8> },
    Msg { data: Vec<u8> },
    Init { nonce: [u8; 8] },
    Cbor { data: Vec<u8> },
    Cancel,
    // Lock time in seconds 0..10. A value of 0 immediately releases the lock
    Lock { lock_time: Duration },
    Wink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMessage {
    pub channel_id: ChannelId,
    pub request: Request,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestDecodeError {
    #[error("Payload length ({actual_len}) does not match expected ({expected_len})")]
    PayloadLength {
        expected_len: usize,
        actual_len: usize,
    },

    #[error("Lock time of {0} seconds is out of range")]
    LockTime(u8),

    #[error("Invalid command: {0}")]
    InvalidCommand(CommandType),
}

impl RequestDecodeError {
    /// The CTAPHID_ERROR code reported to the host for this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            RequestDecodeError::PayloadLength { .. } => ErrorCode::InvalidMessageLength,
            RequestDecodeError::LockTime(_) => ErrorCode::InvalidParameter,
            RequestDecodeError::InvalidCommand(_) => ErrorCode::InvalidCommand,
        }
    }
}

fn expect_len(data: &[u8], expected_len: usize) -> Result<(), RequestDecodeError> {
    if data.len() == expected_len {
        Ok(())
    } else {
        Err(RequestDecodeError::PayloadLength {
            expected_len,
            actual_len: data.len(),
        })
    }
}

impl Request {
    pub fn decode(command: CommandType, data: &[u8]) -> Result<Request, RequestDecodeError> {
        match command {
            CommandType::Msg => Ok(Request::Msg {
                data: data.to_vec(),
            }),
            CommandType::Ping => Ok(Request::Ping {
                data: data.to_vec(),
            }),
            CommandType::Init => {
                expect_len(data, COMMAND_INIT_DATA_LEN)?;
                let mut nonce = [0u8; COMMAND_INIT_DATA_LEN];
                nonce.copy_from_slice(data);
                Ok(Request::Init { nonce })
            }
            CommandType::Cbor => Ok(Request::Cbor {
                data: data.to_vec(),
            }),
            CommandType::Cancel => {
                expect_len(data, 0)?;
                Ok(Request::Cancel)
            }
            CommandType::Lock => {
                expect_len(data, 1)?;
                let seconds = data[0];
                if seconds > MAX_LOCK_SECONDS {
                    return Err(RequestDecodeError::LockTime(seconds));
                }
                Ok(Request::Lock {
                    lock_time: Duration::from_secs(seconds.into()),
                })
            }
            CommandType::Wink => {
                expect_len(data, 0)?;
                Ok(Request::Wink)
            }
            // Only ever sent by the device
            CommandType::KeepAlive | CommandType::Error => {
                Err(RequestDecodeError::InvalidCommand(command))
            }
            CommandType::Vendor { .. } => Err(RequestDecodeError::InvalidCommand(command)),
            CommandType::Unknown { .. } => {
                // The Fido v2.0 specification is backwards compatible with U2F
                // authenticators if they responded to unknown messages with
                // the error message InvalidCommand (0x01).
                // https://fidoalliance.org/specs/fido-v2.0-rd-20170927/fido-client-to-authenticator-protocol-v2.0-rd-20170927.html#interoperating-with-ctap1-u2f-authenticators
                Err(RequestDecodeError::InvalidCommand(command))
            }
        }
    }
}

impl RequestMessage {
    /// Reassembles a request from the packets a host sent.
    pub fn decode(packets: &[Packet]) -> Option<Result<Self, RequestDecodeError>> {
        let (channel_id, command, payload) = Packet::decode_message(packets)?;
        Some(Request::decode(command, &payload).map(|request| RequestMessage {
            channel_id,
            request,
        }))
    }

    /// Fragments the request the way a host would send it.
    pub fn to_packets(&self) -> VecDeque<Packet> {
        let channel_id = self.channel_id;
        match &self.request {
            Request::Ping { data } => Packet::encode_message(channel_id, CommandType::Ping, data),
            Request::Msg { data } => Packet::encode_message(channel_id, CommandType::Msg, data),
            Request::Init { nonce } => Packet::encode_message(channel_id, CommandType::Init, nonce),
            Request::Cbor { data } => Packet::encode_message(channel_id, CommandType::Cbor, data),
            Request::Cancel => Packet::encode_message(channel_id, CommandType::Cancel, &[]),
            Request::Lock { lock_time } => {
                Packet::encode_message(channel_id, CommandType::Lock, &[lock_time.as_secs() as u8])
            }
            Request::Wink => Packet::encode_message(channel_id, CommandType::Wink, &[]),
        }
    }
}
