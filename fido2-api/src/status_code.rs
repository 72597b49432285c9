use thiserror::Error;

const CTAP1_ERR_INVALID_COMMAND: u8 = 0x01;
const CTAP1_ERR_INVALID_PARAMETER: u8 = 0x02;
const CTAP1_ERR_INVALID_LENGTH: u8 = 0x03;
const CTAP2_ERR_CBOR_UNEXPECTED_TYPE: u8 = 0x11;
const CTAP2_ERR_INVALID_CBOR: u8 = 0x12;
const CTAP2_ERR_MISSING_PARAMETER: u8 = 0x14;
const CTAP2_ERR_CREDENTIAL_EXCLUDED: u8 = 0x19;
const CTAP2_ERR_UNSUPPORTED_ALGORITHM: u8 = 0x26;
const CTAP2_ERR_OPERATION_DENIED: u8 = 0x27;
const CTAP2_ERR_UNSUPPORTED_OPTION: u8 = 0x2b;
const CTAP2_ERR_KEEPALIVE_CANCEL: u8 = 0x2d;
const CTAP2_ERR_NO_CREDENTIALS: u8 = 0x2e;
const CTAP2_ERR_INVALID_SUBCOMMAND: u8 = 0x3e;
const CTAP1_ERR_OTHER: u8 = 0x7f;

/// Status byte that prefixes every successful response.
pub const CTAP2_OK: u8 = 0x00;

/// https://fidoalliance.org/specs/fido-v2.1-ps-20210615/fido-client-to-authenticator-protocol-v2.1-ps-20210615.html#error-responses
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// The command is not a valid CTAP command.
    #[error("Invalid command")]
    InvalidCommand,
    /// The command included an invalid parameter.
    #[error("Invalid parameter")]
    InvalidParameter,
    /// Invalid message or item length.
    #[error("Invalid length")]
    InvalidLength,
    #[error("Unexpected CBOR type")]
    CborUnexpectedType,
    /// Error when parsing CBOR
    #[error("Invalid CBOR")]
    InvalidCbor,
    /// Missing non-optional parameter
    #[error("Missing parameter")]
    MissingParameter,
    /// Valid credential found in the exclude list.
    #[error("Credential excluded")]
    CredentialExcluded,
    /// Authenticator does not support requested algorithm.
    #[error("Unsupported algorithm")]
    UnsupportedAlgorithm,
    /// Not authorized for requested operation.
    #[error("Operation denied")]
    OperationDenied,
    #[error("Unsupported option")]
    UnsupportedOption,
    /// The ongoing request was cancelled by the host.
    #[error("Keepalive cancel")]
    KeepaliveCancel,
    /// No valid credentials provided.
    #[error("No credentials")]
    NoCredentials,
    #[error("Invalid subcommand")]
    InvalidSubcommand,
    /// Other unspecified error
    #[error("Other error")]
    Other,
}

impl StatusCode {
    pub fn to_u8(&self) -> u8 {
        match self {
            StatusCode::InvalidCommand => CTAP1_ERR_INVALID_COMMAND,
            StatusCode::InvalidParameter => CTAP1_ERR_INVALID_PARAMETER,
            StatusCode::InvalidLength => CTAP1_ERR_INVALID_LENGTH,
            StatusCode::CborUnexpectedType => CTAP2_ERR_CBOR_UNEXPECTED_TYPE,
            StatusCode::InvalidCbor => CTAP2_ERR_INVALID_CBOR,
            StatusCode::MissingParameter => CTAP2_ERR_MISSING_PARAMETER,
            StatusCode::CredentialExcluded => CTAP2_ERR_CREDENTIAL_EXCLUDED,
            StatusCode::UnsupportedAlgorithm => CTAP2_ERR_UNSUPPORTED_ALGORITHM,
            StatusCode::OperationDenied => CTAP2_ERR_OPERATION_DENIED,
            StatusCode::UnsupportedOption => CTAP2_ERR_UNSUPPORTED_OPTION,
            StatusCode::KeepaliveCancel => CTAP2_ERR_KEEPALIVE_CANCEL,
            StatusCode::NoCredentials => CTAP2_ERR_NO_CREDENTIALS,
            StatusCode::InvalidSubcommand => CTAP2_ERR_INVALID_SUBCOMMAND,
            StatusCode::Other => CTAP1_ERR_OTHER,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_bytes() {
        assert_eq!(StatusCode::InvalidLength.to_u8(), 0x03);
        assert_eq!(StatusCode::CredentialExcluded.to_u8(), 0x19);
        assert_eq!(StatusCode::KeepaliveCancel.to_u8(), 0x2d);
        assert_eq!(StatusCode::Other.to_u8(), 0x7f);
    }
}
