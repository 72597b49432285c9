use std::convert::TryInto;

use fido2_api::{CredentialId, Sha256};

use super::apdu::{Apdu, StatusWord};

const REGISTER_COMMAND_CODE: u8 = 0x01;
const AUTHENTICATE_COMMAND_CODE: u8 = 0x02;
const VERSION_COMMAND_CODE: u8 = 0x03;

const AUTH_ENFORCE: u8 = 0x03; // Enforce user presence and sign
const AUTH_CHECK_ONLY: u8 = 0x07; // Check only
const AUTH_DONT_ENFORCE: u8 = 0x08; // Don't enforce user presence and sign

const PARAMETER_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlCode {
    CheckOnly,
    EnforceUserPresenceAndSign,
    DontEnforceUserPresenceAndSign,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Request {
    Register {
        challenge: Sha256,
        application: Sha256,
    },
    Authenticate {
        control_code: ControlCode,
        challenge: Sha256,
        application: Sha256,
        key_handle: CredentialId,
    },
    Version,
}

impl Request {
    pub fn from_apdu(apdu: &Apdu) -> Result<Self, StatusWord> {
        // CLA: Reserved to be used by the underlying transport protocol
        if apdu.cla != 0 {
            return Err(StatusWord::ClaNotSupported);
        }

        match apdu.ins {
            REGISTER_COMMAND_CODE => {
                if apdu.data.len() != 2 * PARAMETER_LEN {
                    return Err(StatusWord::WrongLength);
                }
                // The challenge parameter [32 bytes] then the application parameter [32 bytes].
                let (challenge, application) = apdu.data.split_at(PARAMETER_LEN);
                Ok(Request::Register {
                    challenge: parameter(challenge)?,
                    application: parameter(application)?,
                })
            }
            AUTHENTICATE_COMMAND_CODE => {
                // Control byte (P1).
                let control_code = match apdu.p1 {
                    AUTH_CHECK_ONLY => ControlCode::CheckOnly,
                    AUTH_ENFORCE => ControlCode::EnforceUserPresenceAndSign,
                    AUTH_DONT_ENFORCE => ControlCode::DontEnforceUserPresenceAndSign,
                    _ => return Err(StatusWord::WrongData),
                };

                // challenge [32 bytes], application [32 bytes], key handle length byte [1 byte],
                // key handle [length specified in previous field]
                let data = &apdu.data;
                if data.len() <= 2 * PARAMETER_LEN {
                    return Err(StatusWord::WrongLength);
                }
                let key_handle_len = data[2 * PARAMETER_LEN] as usize;
                let key_handle = &data[2 * PARAMETER_LEN + 1..];
                if key_handle.len() != key_handle_len {
                    return Err(StatusWord::WrongLength);
                }

                Ok(Request::Authenticate {
                    control_code,
                    challenge: parameter(&data[..PARAMETER_LEN])?,
                    application: parameter(&data[PARAMETER_LEN..2 * PARAMETER_LEN])?,
                    key_handle: CredentialId::new(key_handle),
                })
            }
            VERSION_COMMAND_CODE => {
                if !apdu.data.is_empty() {
                    return Err(StatusWord::WrongLength);
                }
                Ok(Request::Version)
            }
            _ => Err(StatusWord::InsNotSupported),
        }
    }
}

fn parameter(bytes: &[u8]) -> Result<Sha256, StatusWord> {
    let bytes: [u8; PARAMETER_LEN] = bytes.try_into().map_err(|_| StatusWord::WrongLength)?;
    Ok(Sha256::new(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apdu(cla: u8, ins: u8, p1: u8, data: Vec<u8>) -> Apdu {
        Apdu {
            cla,
            ins,
            p1,
            p2: 0,
            data,
            max_response_len: 65536,
        }
    }

    fn authenticate_data(key_handle: &[u8]) -> Vec<u8> {
        let mut data = vec![0x11; 32];
        data.extend_from_slice(&[0x22; 32]);
        data.push(key_handle.len() as u8);
        data.extend_from_slice(key_handle);
        data
    }

    #[test]
    fn register() {
        let mut data = vec![0x11; 32];
        data.extend_from_slice(&[0x22; 32]);

        assert_eq!(
            Request::from_apdu(&apdu(0, 0x01, 0, data)),
            Ok(Request::Register {
                challenge: Sha256::new([0x11; 32]),
                application: Sha256::new([0x22; 32]),
            })
        );
    }

    #[test]
    fn register_wrong_length() {
        assert_eq!(
            Request::from_apdu(&apdu(0, 0x01, 0, vec![0; 63])),
            Err(StatusWord::WrongLength)
        );
    }

    #[test]
    fn authenticate() {
        assert_eq!(
            Request::from_apdu(&apdu(0, 0x02, 0x03, authenticate_data(&[1, 2, 3]))),
            Ok(Request::Authenticate {
                control_code: ControlCode::EnforceUserPresenceAndSign,
                challenge: Sha256::new([0x11; 32]),
                application: Sha256::new([0x22; 32]),
                key_handle: CredentialId::new(&[1, 2, 3]),
            })
        );
    }

    #[test]
    fn authenticate_control_codes() {
        let control_code = |p1| match Request::from_apdu(&apdu(0, 0x02, p1, authenticate_data(&[1]))) {
            Ok(Request::Authenticate { control_code, .. }) => Ok(control_code),
            Ok(other) => panic!("unexpected request {:?}", other),
            Err(status) => Err(status),
        };

        assert_eq!(control_code(0x07), Ok(ControlCode::CheckOnly));
        assert_eq!(control_code(0x08), Ok(ControlCode::DontEnforceUserPresenceAndSign));
        assert_eq!(control_code(0x05), Err(StatusWord::WrongData));
    }

    #[test]
    fn authenticate_key_handle_length_mismatch() {
        let mut data = authenticate_data(&[1, 2, 3]);
        data.pop();

        assert_eq!(
            Request::from_apdu(&apdu(0, 0x02, 0x03, data)),
            Err(StatusWord::WrongLength)
        );
        assert_eq!(
            Request::from_apdu(&apdu(0, 0x02, 0x03, vec![0; 64])),
            Err(StatusWord::WrongLength)
        );
    }

    #[test]
    fn version_ignores_parameters() {
        assert_eq!(
            Request::from_apdu(&apdu(0, 0x03, 0xff, vec![])),
            Ok(Request::Version)
        );
    }

    #[test]
    fn unsupported() {
        assert_eq!(
            Request::from_apdu(&apdu(0, 0x40, 0, vec![])),
            Err(StatusWord::InsNotSupported)
        );
        assert_eq!(
            Request::from_apdu(&apdu(0x80, 0x03, 0, vec![])),
            Err(StatusWord::ClaNotSupported)
        );
    }
}
