mod authenticator;
mod identity;
mod presence;
mod self_signed;
mod transport;
mod u2f;

use std::convert::Infallible;

use fido2_api::StatusCode;
use thiserror::Error;

pub use crate::authenticator::Authenticator;
pub use crate::identity::{Credential, IdentityProvider};
pub use crate::presence::{AutoApprove, UserPresence};
pub use crate::self_signed::{IdentityError, SelfSignedIdentity, CREDENTIAL_ID_LEN};
pub use crate::transport::process_cbor;
pub use crate::u2f::{Apdu, ApduError, StatusWord};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Identity provider error: {0}")]
    Identity(#[from] IdentityError),

    #[error("{0}")]
    Status(#[from] StatusCode),

    #[error("Unsupported algorithm")]
    UnsupportedAlgorithm,

    #[error("Unsupported option")]
    UnsupportedOption,

    #[error("Invalid parameter")]
    InvalidParameter,

    #[error("Credential excluded")]
    CredentialExcluded,

    #[error("No credentials")]
    NoCredentials,

    #[error("Operation denied by user")]
    OperationDenied,

    #[error("Invalid subcommand")]
    InvalidSubcommand,
}

impl From<Infallible> for Error {
    fn from(never: Infallible) -> Self {
        match never {}
    }
}

impl From<Error> for StatusCode {
    fn from(err: Error) -> StatusCode {
        match err {
            Error::Identity(_) => StatusCode::Other,
            Error::Status(status) => status,
            Error::UnsupportedAlgorithm => StatusCode::UnsupportedAlgorithm,
            Error::UnsupportedOption => StatusCode::UnsupportedOption,
            Error::InvalidParameter => StatusCode::InvalidParameter,
            Error::CredentialExcluded => StatusCode::CredentialExcluded,
            Error::NoCredentials => StatusCode::NoCredentials,
            Error::OperationDenied => StatusCode::OperationDenied,
            Error::InvalidSubcommand => StatusCode::InvalidSubcommand,
        }
    }
}
