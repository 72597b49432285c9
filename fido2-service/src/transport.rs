use async_trait::async_trait;
use ctap_hid::{CapabilityFlags, CtapHidApi, VersionInfo};
use fido2_api::{AuthenticatorAPI, Command, Response, StatusCode};
use tracing::{debug, trace};

use crate::identity::IdentityProvider;
use crate::presence::UserPresence;
use crate::{Authenticator, Error};

/// Decodes one CTAP2 request, dispatches it and encodes the response.
///
/// The result always starts with a status byte; any failure is reduced to that byte alone.
pub async fn process_cbor<A: AuthenticatorAPI>(api: &A, data: &[u8]) -> Vec<u8> {
    match dispatch(api, data).await {
        Ok(response) => response,
        Err(status) => {
            debug!(?status, "CTAP2 command failed");
            vec![status.to_u8()]
        }
    }
}

async fn dispatch<A: AuthenticatorAPI>(api: &A, data: &[u8]) -> Result<Vec<u8>, StatusCode> {
    let command = Command::decode_cbor(data)?;
    trace!(?command, "Dispatching CTAP2 command");

    let response = match command {
        Command::MakeCredential(cmd) => api.make_credential(cmd).await.map(Response::MakeCredential),
        Command::GetAssertion(cmd) => api.get_assertion(cmd).await.map(Response::GetAssertion),
        Command::GetInfo => api.get_info().map(Response::GetInfo),
        Command::ClientPin(cmd) => api.client_pin(cmd).await.map(Response::ClientPin),
        Command::Reset => api.reset().await.map(|()| Response::Reset),
    }
    .map_err(Into::<StatusCode>::into)?;

    response.to_cbor()
}

#[async_trait]
impl<Identity, Presence> CtapHidApi for Authenticator<Identity, Presence>
where
    Identity: IdentityProvider + 'static,
    Presence: UserPresence + 'static,
    Error: From<Identity::Error>,
    Error: From<Presence::Error>,
{
    type Error = Error;

    fn version(&self) -> VersionInfo {
        let version = AuthenticatorAPI::version(self);
        VersionInfo {
            major: version.version_major,
            minor: version.version_minor,
            build: version.version_build,
            capabilities: if version.wink_supported {
                CapabilityFlags::WINK | CapabilityFlags::CBOR
            } else {
                CapabilityFlags::CBOR
            },
        }
    }

    async fn wink(&self) -> Result<(), Self::Error> {
        AuthenticatorAPI::wink(self).await
    }

    async fn msg(&self, msg: Vec<u8>) -> Result<Vec<u8>, Self::Error> {
        Ok(self.process_apdu(&msg).await)
    }

    async fn cbor(&self, cbor: Vec<u8>) -> Result<Vec<u8>, Self::Error> {
        Ok(process_cbor(self, &cbor).await)
    }
}
