//! Legacy U2F (CTAP1) raw messages carried by CTAPHID_MSG.
//!
//! See https://fidoalliance.org/specs/fido-u2f-v1.2-ps-20170411/fido-u2f-raw-message-formats-v1.2-ps-20170411.html

mod apdu;
mod request;
mod response;

use std::fmt::Debug;

use fido2_api::Sha256;
use tracing::{debug, error, info, warn};

pub use self::apdu::{Apdu, ApduError, StatusWord};
use self::request::{ControlCode, Request};
use self::response::{user_presence_byte, Response};
use crate::identity::IdentityProvider;
use crate::presence::UserPresence;
use crate::Authenticator;

const REGISTRATION_SIGNATURE_PREFIX: u8 = 0x00;

fn provider_failure<E: Debug>(err: E) -> StatusWord {
    error!(?err, "U2F request failed");
    StatusWord::Unknown
}

impl<Identity, Presence> Authenticator<Identity, Presence>
where
    Identity: IdentityProvider,
    Presence: UserPresence,
{
    /// Processes one U2F request APDU, always producing a response that ends in a status word.
    pub async fn process_apdu(&self, data: &[u8]) -> Vec<u8> {
        let request = Apdu::decode(data)
            .map_err(|err| {
                warn!(?err, "Invalid APDU");
                err.status_word()
            })
            .and_then(|apdu| Request::from_apdu(&apdu));

        let response = match request {
            Ok(request) => match self.handle_u2f(request).await {
                Ok(response) => response,
                Err(status) => Response::Status(status),
            },
            Err(status) => {
                debug!(?status, "Rejected U2F request");
                Response::Status(status)
            }
        };
        response.into_bytes()
    }

    async fn handle_u2f(&self, request: Request) -> Result<Response, StatusWord> {
        match request {
            Request::Register {
                challenge,
                application,
            } => self.u2f_register(challenge, application).await,
            Request::Authenticate {
                control_code,
                challenge,
                application,
                key_handle,
            } => {
                let credential = self
                    .identity
                    .find_credential(&application, &key_handle)
                    .map_err(provider_failure)?
                    .ok_or_else(|| {
                        debug!("Unknown key handle");
                        StatusWord::WrongData
                    })?;

                let user_present = match control_code {
                    ControlCode::CheckOnly => return Err(StatusWord::ConditionsNotSatisfied),
                    ControlCode::EnforceUserPresenceAndSign => {
                        let approved = self
                            .presence
                            .approve_authentication(&hex::encode(application))
                            .await
                            .map_err(provider_failure)?;
                        if !approved {
                            return Err(StatusWord::ConditionsNotSatisfied);
                        }
                        true
                    }
                    ControlCode::DontEnforceUserPresenceAndSign => false,
                };

                let counter = self
                    .identity
                    .increment_counter(&credential.id)
                    .map_err(provider_failure)?;

                // application parameter [32 bytes], user presence byte, counter [4 bytes], challenge [32 bytes]
                let mut message = Vec::with_capacity(32 + 1 + 4 + 32);
                message.extend_from_slice(application.as_ref());
                message.push(user_presence_byte(user_present));
                message.extend_from_slice(&counter.to_be_bytes());
                message.extend_from_slice(challenge.as_ref());

                let signature = self
                    .identity
                    .sign(&credential.id, &message)
                    .map_err(provider_failure)?;
                info!(counter, user_present, "U2F authenticated");

                Ok(Response::Authentication {
                    user_present,
                    counter,
                    signature,
                })
            }
            Request::Version => Ok(Response::Version),
        }
    }

    async fn u2f_register(
        &self,
        challenge: Sha256,
        application: Sha256,
    ) -> Result<Response, StatusWord> {
        let approved = self
            .presence
            .approve_registration(&hex::encode(application))
            .await
            .map_err(provider_failure)?;
        if !approved {
            return Err(StatusWord::ConditionsNotSatisfied);
        }

        let credential = self
            .identity
            .generate_credential(&application, None)
            .map_err(provider_failure)?;
        let user_public_key = credential.public_key.to_uncompressed_point();

        // 0x00, application parameter, challenge parameter, key handle, user public key
        let mut message = vec![REGISTRATION_SIGNATURE_PREFIX];
        message.extend_from_slice(application.as_ref());
        message.extend_from_slice(challenge.as_ref());
        message.extend_from_slice(credential.id.as_ref());
        message.extend_from_slice(&user_public_key);

        let signature = self.identity.attest(&message).map_err(provider_failure)?;
        info!(key_handle = ?credential.id, "U2F registered");

        Ok(Response::Registration {
            user_public_key,
            key_handle: credential.id,
            attestation_certificate: self.identity.attestation_certificate().attestation_certificate,
            signature,
        })
    }
}
