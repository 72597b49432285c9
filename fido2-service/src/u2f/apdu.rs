use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

const HEADER_LEN: usize = 4;

/// Status words terminating every U2F response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusWord {
    /// The command completed successfully without error.
    NoError,
    /// The request was rejected due to test-of-user-presence being required.
    ConditionsNotSatisfied,
    /// The request was rejected due to an invalid key handle.
    WrongData,
    /// The length of the request was invalid.
    WrongLength,
    /// The Class byte of the request is not supported.
    ClaNotSupported,
    /// The Instruction of the request is not supported.
    InsNotSupported,
    /// No precise diagnosis.
    Unknown,
}

impl StatusWord {
    pub fn to_u16(self) -> u16 {
        match self {
            StatusWord::NoError => 0x9000,
            StatusWord::ConditionsNotSatisfied => 0x6985,
            StatusWord::WrongData => 0x6A80,
            StatusWord::WrongLength => 0x6700,
            StatusWord::ClaNotSupported => 0x6E00,
            StatusWord::InsNotSupported => 0x6D00,
            StatusWord::Unknown => 0x6F00,
        }
    }

    pub fn to_bytes(self) -> [u8; 2] {
        let mut bytes = [0u8; 2];
        BigEndian::write_u16(&mut bytes, self.to_u16());
        bytes
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApduError {
    #[error("APDU header requires 4 bytes, got {0}")]
    TruncatedHeader(usize),

    #[error("Short length encoding is not supported")]
    ShortEncoding,

    #[error("Invalid extended length encoding, {0} bytes follow the header")]
    InvalidLength(usize),
}

impl ApduError {
    pub fn status_word(&self) -> StatusWord {
        match self {
            ApduError::TruncatedHeader(_) => StatusWord::WrongData,
            ApduError::ShortEncoding | ApduError::InvalidLength(_) => StatusWord::WrongLength,
        }
    }
}

/// Command APDU as carried in a CTAPHID_MSG payload. Only extended length encoding is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Apdu {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
    /// Ne, zero when the Le field was omitted.
    pub max_response_len: usize,
}

impl Apdu {
    pub fn decode(bytes: &[u8]) -> Result<Self, ApduError> {
        if bytes.len() < HEADER_LEN {
            return Err(ApduError::TruncatedHeader(bytes.len()));
        }
        let (header, body) = bytes.split_at(HEADER_LEN);

        let (data, max_response_len) = match body.len() {
            // Case 1: header only
            0 => (Vec::new(), 0),
            // Case 2: 00 Le1 Le2
            3 => {
                if body[0] != 0 {
                    return Err(ApduError::ShortEncoding);
                }
                (Vec::new(), decode_le(&body[1..]))
            }
            len if len < 3 => return Err(ApduError::InvalidLength(len)),
            len => {
                // Case 3 and 4: 00 Lc1 Lc2 data [Le1 Le2]
                if body[0] != 0 {
                    return Err(ApduError::ShortEncoding);
                }
                let data_len = BigEndian::read_u16(&body[1..3]) as usize;
                if data_len == 0 {
                    return Err(ApduError::InvalidLength(len));
                }
                let rest = &body[3..];
                let max_response_len = match rest.len().checked_sub(data_len) {
                    Some(0) => 0,
                    Some(2) => decode_le(&rest[data_len..]),
                    _ => return Err(ApduError::InvalidLength(len)),
                };
                (rest[..data_len].to_vec(), max_response_len)
            }
        };

        Ok(Apdu {
            cla: header[0],
            ins: header[1],
            p1: header[2],
            p2: header[3],
            data,
            max_response_len,
        })
    }
}

// When Ne = 65 536, Le1 = 0 and Le2 = 0
fn decode_le(bytes: &[u8]) -> usize {
    match BigEndian::read_u16(bytes) {
        0 => 65536,
        value => value as usize,
    }
}
