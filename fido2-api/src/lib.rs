//! CTAP2 commands and responses as carried in CTAPHID_CBOR messages, along with the WebAuthn
//! structures they embed.
//!
//! Encoding follows the CTAP2 canonical CBOR rules: integer map keys, shortest form integers and
//! text keys ordered by length then bytewise.
//!
//! See https://fidoalliance.org/specs/fido-v2.1-ps-20210615/fido-client-to-authenticator-protocol-v2.1-ps-20210615.html

mod api;
mod ctap2;
mod status_code;
mod webauthn;

pub use api::{Aaguid, AuthenticatorAPI, Sha256, VersionInfo};
pub use ctap2::*;
pub use status_code::{StatusCode, CTAP2_OK};
pub use webauthn::*;
