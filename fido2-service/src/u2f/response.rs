use byteorder::{BigEndian, ByteOrder};
use fido2_api::{CredentialId, Signature};

use super::apdu::StatusWord;

const REGISTRATION_RESERVED_BYTE: u8 = 0x05;
const USER_PRESENT_FLAG: u8 = 0x01;
pub(crate) const VERSION_STRING: &str = "U2F_V2";

pub(crate) fn user_presence_byte(user_present: bool) -> u8 {
    if user_present {
        USER_PRESENT_FLAG
    } else {
        0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Response {
    Registration {
        user_public_key: Vec<u8>,
        key_handle: CredentialId,
        attestation_certificate: Vec<u8>,
        signature: Signature,
    },
    Authentication {
        user_present: bool,
        counter: u32,
        signature: Signature,
    },
    Version,
    Status(StatusWord),
}

impl Response {
    pub fn into_bytes(self) -> Vec<u8> {
        let mut bytes = Vec::new();
        let status = match self {
            Response::Registration {
                user_public_key,
                key_handle,
                attestation_certificate,
                signature,
            } => {
                // reserved byte [1 byte], which for legacy reasons has the value 0x05.
                bytes.push(REGISTRATION_RESERVED_BYTE);

                // user public key [65 bytes], uncompressed P-256 point
                bytes.extend_from_slice(&user_public_key);

                // key handle length byte [1 byte], then the key handle
                let key_handle = key_handle.as_ref();
                bytes.push(key_handle.len() as u8);
                bytes.extend_from_slice(key_handle);

                // An attestation certificate in X.509 DER format
                bytes.extend_from_slice(&attestation_certificate);

                // A signature [variable length, 71-73 bytes]
                bytes.extend_from_slice(signature.as_ref());
                StatusWord::NoError
            }
            Response::Authentication {
                user_present,
                counter,
                signature,
            } => {
                bytes.push(user_presence_byte(user_present));

                let mut counter_bytes = [0u8; 4];
                BigEndian::write_u32(&mut counter_bytes, counter);
                bytes.extend_from_slice(&counter_bytes);

                bytes.extend_from_slice(signature.as_ref());
                StatusWord::NoError
            }
            Response::Version => {
                // ASCII 'U2F_V2' without any NUL terminator
                bytes.extend_from_slice(VERSION_STRING.as_bytes());
                StatusWord::NoError
            }
            Response::Status(status) => status,
        };

        // Status word [2 bytes]
        bytes.extend_from_slice(&status.to_bytes());
        bytes
    }
}
