use async_trait::async_trait;
use minicbor::{Decode, Encode};
use ring::digest;
use std::fmt::Debug;
use std::result::Result;

use crate::{
    ClientPinCommand, ClientPinResponse, GetAssertionCommand, GetAssertionResponse,
    GetInfoResponse, MakeCredentialCommand, MakeCredentialResponse, StatusCode,
};

/// https://fidoalliance.org/specs/fido-v2.1-ps-20210615/fido-client-to-authenticator-protocol-v2.1-ps-20210615.html#authenticator-api
#[async_trait]
pub trait AuthenticatorAPI: Send + Sync {
    type Error: Into<StatusCode> + Debug + Send;

    fn version(&self) -> VersionInfo;

    /// https://fidoalliance.org/specs/fido-v2.1-ps-20210615/fido-client-to-authenticator-protocol-v2.1-ps-20210615.html#authenticatorMakeCredential
    async fn make_credential(
        &self,
        cmd: MakeCredentialCommand,
    ) -> Result<MakeCredentialResponse, Self::Error>;

    /// If an authenticator supports both CTAP1/U2F and CTAP2 then a credential created using CTAP1/U2F MUST be assertable over CTAP2. (Credentials created over CTAP1/U2F MUST NOT be discoverable credentials though.)
    /// https://fidoalliance.org/specs/fido-v2.1-ps-20210615/fido-client-to-authenticator-protocol-v2.1-ps-20210615.html#authenticatorGetAssertion
    async fn get_assertion(
        &self,
        cmd: GetAssertionCommand,
    ) -> Result<GetAssertionResponse, Self::Error>;

    fn get_info(&self) -> Result<GetInfoResponse, Self::Error>;

    /// https://fidoalliance.org/specs/fido-v2.1-ps-20210615/fido-client-to-authenticator-protocol-v2.1-ps-20210615.html#authenticatorClientPIN
    async fn client_pin(&self, cmd: ClientPinCommand) -> Result<ClientPinResponse, Self::Error>;

    /// Forgets every credential. Requires user presence.
    async fn reset(&self) -> Result<(), Self::Error>;

    async fn wink(&self) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
    pub version_major: u8,
    pub version_minor: u8,
    pub version_build: u8,
    pub wink_supported: bool,
}

/// aaguid is a byte string uniquely identifying the authenticator make and model.
///
/// Identical values mean that they refer to the same authenticator model and
/// different values mean they refer to different authenticator models.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub struct Aaguid(pub uuid::Uuid);

impl<C> Encode<C> for Aaguid {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.bytes(self.0.as_bytes())?.ok()
    }
}

impl AsRef<[u8]> for Aaguid {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub struct Sha256([u8; 32]);

impl Sha256 {
    pub fn digest(data: &[u8]) -> Self {
        let mut value = [0u8; 32];
        value.copy_from_slice(digest::digest(&digest::SHA256, data).as_ref());
        Sha256(value)
    }

    pub fn new(value: [u8; 32]) -> Self {
        Sha256(value)
    }
}

impl<C> Encode<C> for Sha256 {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.bytes(&self.0)?.ok()
    }
}

impl<'b, C> Decode<'b, C> for Sha256 {
    fn decode(d: &mut minicbor::Decoder<'b>, _ctx: &mut C) -> Result<Self, minicbor::decode::Error> {
        let position = d.position();
        let bytes = d.bytes()?;
        let value: [u8; 32] = bytes.try_into().map_err(|_| {
            minicbor::decode::Error::message(format!(
                "Expected 32 byte hash, got {} bytes",
                bytes.len()
            ))
            .at(position)
        })?;
        Ok(Sha256(value))
    }
}

impl AsRef<[u8]> for Sha256 {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_digest() {
        // SHA-256("abc")
        assert_eq!(
            Sha256::digest(b"abc").as_ref()[..4],
            [0xba, 0x78, 0x16, 0xbf]
        );
    }

    #[test]
    fn sha256_decode_rejects_wrong_length() {
        // Byte string of length 31
        let mut buffer = vec![0x58, 31];
        buffer.extend_from_slice(&[0u8; 31]);
        let result: Result<Sha256, _> = minicbor::decode(&buffer);
        assert!(result.is_err());
    }
}
