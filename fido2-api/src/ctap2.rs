use crate::api::Aaguid;
use crate::api::Sha256;
use crate::status_code::CTAP2_OK;
use crate::webauthn::sized_map;
use crate::webauthn::AuthenticatorData;
use crate::webauthn::PublicKeyCredentialDescriptor;
use crate::webauthn::PublicKeyCredentialParameters;
use crate::webauthn::PublicKeyCredentialRpEntity;
use crate::webauthn::PublicKeyCredentialUserEntity;
use crate::AttestationStatement;
use crate::RelyingPartyIdentifier;
use crate::Signature;
use crate::StatusCode;

use minicbor_derive::{Decode, Encode};
use std::fmt::Debug;

///! CTAP2 protocol
///!
///! Messages are encoded as CTAP2 canonical CBOR: https://fidoalliance.org/specs/fido-v2.1-ps-20210615/fido-client-to-authenticator-protocol-v2.1-ps-20210615.html#ctap2-canonical-cbor-encoding-form

const MAKE_CREDENTIAL: u8 = 0x01;
const GET_ASSERTION: u8 = 0x02;
const GET_INFO: u8 = 0x04;
const CLIENT_PIN: u8 = 0x06;
const RESET: u8 = 0x07;

/// Messages from the host to authenticator, called "commands" in the CTAP2 protocol
#[derive(Debug, PartialEq)]
pub enum Command {
    MakeCredential(MakeCredentialCommand),
    GetAssertion(GetAssertionCommand),
    GetInfo,
    ClientPin(ClientPinCommand),
    Reset,
}

impl Command {
    /// Decodes a command byte followed by its CBOR parameters, mapping failures to the status
    /// the authenticator answers with.
    pub fn decode_cbor(data: &[u8]) -> Result<Self, StatusCode> {
        let (&command, parameters) = data.split_first().ok_or(StatusCode::InvalidLength)?;
        match command {
            MAKE_CREDENTIAL => Ok(Command::MakeCredential(decode_parameters(parameters)?)),
            GET_ASSERTION => Ok(Command::GetAssertion(decode_parameters(parameters)?)),
            GET_INFO => Ok(Command::GetInfo),
            CLIENT_PIN => {
                let raw: RawClientPinCommand = decode_parameters(parameters)?;
                Ok(Command::ClientPin(ClientPinCommand {
                    pin_uv_auth_protocol: raw.pin_uv_auth_protocol,
                    sub_command: raw
                        .sub_command
                        .map(ClientPinSubCommand::from_u8)
                        .ok_or(StatusCode::MissingParameter)?,
                }))
            }
            RESET => Ok(Command::Reset),
            _ => Err(StatusCode::InvalidCommand),
        }
    }
}

fn decode_parameters<T>(parameters: &[u8]) -> Result<T, StatusCode>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    minicbor::decode(parameters).map_err(|_| StatusCode::InvalidCbor)
}

/// https://fidoalliance.org/specs/fido-v2.1-ps-20210615/fido-client-to-authenticator-protocol-v2.1-ps-20210615.html#authenticatorMakeCredential
#[derive(Debug, Decode, PartialEq)]
#[cbor(map)]
pub struct MakeCredentialCommand {
    #[n(0x01)]
    pub client_data_hash: Sha256,
    #[n(0x02)]
    pub rp: PublicKeyCredentialRpEntity,
    #[n(0x03)]
    pub user: PublicKeyCredentialUserEntity,
    #[n(0x04)]
    pub pub_key_cred_params: Vec<PublicKeyCredentialParameters>,
    #[n(0x05)]
    pub exclude_list: Option<Vec<PublicKeyCredentialDescriptor>>,
    #[n(0x06)]
    pub extensions: Option<Extensions>,
    #[n(0x07)]
    pub options: Option<AuthenticatorOptions>,
    #[n(0x08)]
    pub pin_uv_auth_param: Option<PinUvAuthParam>,
    #[n(0x09)]
    pub pin_uv_auth_protocol: Option<u8>,
    #[n(0x0a)]
    pub enterprise_attestation: Option<u8>,
}

/// Identifiers of the extensions the platform asked for. Their inputs are not interpreted.
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct Extensions(pub Vec<String>);

impl<'b, C> minicbor::Decode<'b, C> for Extensions {
    fn decode(
        d: &mut minicbor::Decoder<'b>,
        _ctx: &mut C,
    ) -> Result<Self, minicbor::decode::Error> {
        let map_len = sized_map(d, "Extensions")?;
        let mut identifiers = Vec::new();
        for _ in 0..map_len {
            identifiers.push(d.str()?.to_string());
            d.skip()?;
        }
        Ok(Extensions(identifiers))
    }
}

/// Options as sent by the platform. Absent keys are `None` so defaults can differ per command.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct AuthenticatorOptions {
    /// Resident key, create a discoverable credential.
    pub rk: Option<bool>,
    /// User presence.
    pub up: Option<bool>,
    /// User verification.
    pub uv: Option<bool>,
}

impl<'b, C> minicbor::Decode<'b, C> for AuthenticatorOptions {
    fn decode(
        d: &mut minicbor::Decoder<'b>,
        _ctx: &mut C,
    ) -> Result<Self, minicbor::decode::Error> {
        let map_len = sized_map(d, "AuthenticatorOptions")?;
        let mut options = AuthenticatorOptions::default();
        for _ in 0..map_len {
            match d.str()? {
                "rk" => options.rk = Some(d.bool()?),
                "up" => options.up = Some(d.bool()?),
                "uv" => options.uv = Some(d.bool()?),
                // Option keys that are not understood are treated as absent
                _ => d.skip()?,
            }
        }
        Ok(options)
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PinUvAuthParam(pub Vec<u8>);

impl<'b, C> minicbor::Decode<'b, C> for PinUvAuthParam {
    fn decode(
        d: &mut minicbor::Decoder<'b>,
        _ctx: &mut C,
    ) -> Result<Self, minicbor::decode::Error> {
        Ok(PinUvAuthParam(d.bytes()?.to_vec()))
    }
}

/// https://fidoalliance.org/specs/fido-v2.1-ps-20210615/fido-client-to-authenticator-protocol-v2.1-ps-20210615.html#authenticatorGetAssertion
#[derive(Debug, Decode, PartialEq)]
#[cbor(map)]
pub struct GetAssertionCommand {
    #[n(0x01)]
    pub rp_id: RelyingPartyIdentifier,
    #[n(0x02)]
    pub client_data_hash: Sha256,

    /// An array of allowed credentials. The authenticator MUST only generate an assertion for one
    /// of the listed credentials, if the list is present. The list MUST NOT be empty, if the list
    /// would be empty the platform MUST omit the field.
    #[n(0x03)]
    pub allow_list: Option<Vec<PublicKeyCredentialDescriptor>>,
    #[n(0x04)]
    pub extensions: Option<Extensions>,
    #[n(0x05)]
    pub options: Option<AuthenticatorOptions>,
    #[n(0x06)]
    pub pin_uv_auth_param: Option<PinUvAuthParam>,
    #[n(0x07)]
    pub pin_uv_auth_protocol: Option<u8>,
}

/// https://fidoalliance.org/specs/fido-v2.1-ps-20210615/fido-client-to-authenticator-protocol-v2.1-ps-20210615.html#authenticatorClientPIN
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ClientPinCommand {
    pub pin_uv_auth_protocol: Option<u8>,
    pub sub_command: ClientPinSubCommand,
}

#[derive(Debug, Decode)]
#[cbor(map)]
struct RawClientPinCommand {
    #[n(0x01)]
    pin_uv_auth_protocol: Option<u8>,
    #[n(0x02)]
    sub_command: Option<u8>,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ClientPinSubCommand {
    GetPinRetries,
    GetKeyAgreement,
    SetPin,
    ChangePin,
    GetPinToken,
    Other(u8),
}

impl ClientPinSubCommand {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x01 => ClientPinSubCommand::GetPinRetries,
            0x02 => ClientPinSubCommand::GetKeyAgreement,
            0x03 => ClientPinSubCommand::SetPin,
            0x04 => ClientPinSubCommand::ChangePin,
            0x05 => ClientPinSubCommand::GetPinToken,
            value => ClientPinSubCommand::Other(value),
        }
    }
}

/// Messages from authenticator to the host, called a "response" in the CTAP2 protocol
#[derive(Debug, PartialEq)]
pub enum Response {
    MakeCredential(MakeCredentialResponse),
    GetAssertion(GetAssertionResponse),
    GetInfo(GetInfoResponse),
    ClientPin(ClientPinResponse),
    Reset,
}

impl Response {
    /// Success status byte followed by the CBOR encoded response, if the command has one.
    pub fn to_cbor(&self) -> Result<Vec<u8>, StatusCode> {
        let mut buffer = vec![CTAP2_OK];
        let result = match self {
            Response::MakeCredential(response) => minicbor::encode(response, &mut buffer),
            Response::GetAssertion(response) => minicbor::encode(response, &mut buffer),
            Response::GetInfo(info) => minicbor::encode(info, &mut buffer),
            Response::ClientPin(response) => minicbor::encode(response, &mut buffer),
            Response::Reset => Ok(()),
        };
        result.map_err(|_| StatusCode::Other)?;
        Ok(buffer)
    }
}

#[derive(Debug, PartialEq)]
pub struct MakeCredentialResponse {
    pub auth_data: AuthenticatorData,
    pub att_stmt: AttestationStatement,
}

impl<C> minicbor::Encode<C> for MakeCredentialResponse {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.map(3)?;

        e.u8(0x01)?;
        e.str(self.att_stmt.format())?;

        e.u8(0x02)?;
        e.encode(&self.auth_data)?;

        e.u8(0x03)?;
        e.encode(&self.att_stmt)?;

        Ok(())
    }
}

#[derive(Debug, Encode, PartialEq)]
#[cbor(map)]
pub struct GetAssertionResponse {
    #[n(0x01)]
    pub credential: PublicKeyCredentialDescriptor,
    #[n(0x02)]
    pub auth_data: AuthenticatorData,
    #[n(0x03)]
    pub signature: Signature,
    /// Only returned for discoverable credentials.
    #[n(0x04)]
    pub user: Option<PublicKeyCredentialUserEntity>,
    #[n(0x05)]
    pub number_of_credentials: Option<u32>,
}

#[derive(Debug, PartialEq)]
pub struct GetInfoResponse {
    pub versions: Vec<String>,
    pub extensions: Option<Vec<String>>,
    pub aaguid: Aaguid,
    pub options: Option<InfoOptions>,
    pub max_msg_size: Option<u32>,
    pub pin_uv_auth_protocols: Option<Vec<u8>>,
    pub transports: Option<Vec<String>>,
    pub algorithms: Option<Vec<PublicKeyCredentialParameters>>,
}

impl<C> minicbor::Encode<C> for GetInfoResponse {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        let optional = [
            self.extensions.is_some(),
            self.options.is_some(),
            self.max_msg_size.is_some(),
            self.pin_uv_auth_protocols.is_some(),
            self.transports.is_some(),
            self.algorithms.is_some(),
        ];
        let len = 2 + optional.iter().filter(|present| **present).count() as u64;
        e.map(len)?;

        e.u8(0x01)?;
        e.encode(&self.versions)?;

        if let Some(ref extensions) = self.extensions {
            e.u8(0x02)?;
            e.encode(extensions)?;
        }

        e.u8(0x03)?;
        e.encode(&self.aaguid)?;

        if let Some(ref options) = self.options {
            e.u8(0x04)?;
            e.encode(options)?;
        }

        if let Some(max_msg_size) = self.max_msg_size {
            e.u8(0x05)?;
            e.u32(max_msg_size)?;
        }

        if let Some(ref protocols) = self.pin_uv_auth_protocols {
            e.u8(0x06)?;
            e.encode(protocols)?;
        }

        if let Some(ref transports) = self.transports {
            e.u8(0x09)?;
            e.encode(transports)?;
        }

        if let Some(ref algorithms) = self.algorithms {
            e.u8(0x0A)?;
            e.encode(algorithms)?;
        }

        Ok(())
    }
}

/// Authenticator capabilities advertised by GetInfo.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct InfoOptions {
    /// Can store discoverable credentials.
    pub rk: bool,
    /// Can test user presence.
    pub up: bool,
    /// Attached to the platform, not roaming.
    pub plat: bool,
}

impl<C> minicbor::Encode<C> for InfoOptions {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        // Canonical order sorts shorter keys first
        e.map(3)?
            .str("rk")?
            .bool(self.rk)?
            .str("up")?
            .bool(self.up)?
            .str("plat")?
            .bool(self.plat)?
            .ok()
    }
}

#[derive(Debug, Encode, PartialEq, Eq)]
#[cbor(map)]
pub struct ClientPinResponse {
    #[n(0x03)]
    pub pin_retries: Option<u8>,
}
