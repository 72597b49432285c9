use std::result::Result;

use async_trait::async_trait;
use fido2_api::Aaguid;
use fido2_api::AttestationStatement;
use fido2_api::AttestedCredentialData;
use fido2_api::AuthenticatorAPI;
use fido2_api::AuthenticatorData;
use fido2_api::ClientPinCommand;
use fido2_api::ClientPinResponse;
use fido2_api::ClientPinSubCommand;
use fido2_api::COSEAlgorithmIdentifier;
use fido2_api::GetAssertionCommand;
use fido2_api::GetAssertionResponse;
use fido2_api::GetInfoResponse;
use fido2_api::InfoOptions;
use fido2_api::MakeCredentialCommand;
use fido2_api::MakeCredentialResponse;
use fido2_api::PackedAttestationStatement;
use fido2_api::PublicKeyCredentialParameters;
use fido2_api::PublicKeyCredentialType;
use fido2_api::Sha256;
use tracing::debug;
use tracing::info;
use tracing::trace;

use crate::identity::IdentityProvider;
use crate::presence::UserPresence;
use crate::Error;

/// Retries reported by getPINRetries. No PIN can be set, so nothing ever decrements it.
const PIN_RETRIES: u8 = 8;

/// Service implementing the FIDO authenticator API.
///
/// Methods are defined by the FIDO specification and implemented in terms of pluggable dependencies
/// that perform the actual cryptographic operations, secret storage, and user interaction.
///
/// See https://fidoalliance.org/specs/fido-v2.1-ps-20210615/fido-client-to-authenticator-protocol-v2.1-ps-20210615.html#authenticator-api
pub struct Authenticator<Identity, Presence>
where
    Identity: IdentityProvider,
    Presence: UserPresence,
{
    pub(crate) identity: Identity,
    pub(crate) presence: Presence,
    pub(crate) aaguid: Aaguid,
}

impl<Identity, Presence> Authenticator<Identity, Presence>
where
    Identity: IdentityProvider,
    Presence: UserPresence,
{
    pub fn new(identity: Identity, presence: Presence, aaguid: Aaguid) -> Self {
        Self {
            identity,
            presence,
            aaguid,
        }
    }

    fn get_info_internal(&self) -> GetInfoResponse {
        GetInfoResponse {
            versions: vec![String::from("U2F_V2"), String::from("FIDO_2_0")],
            extensions: None,
            aaguid: self.aaguid,
            options: Some(InfoOptions {
                rk: true,
                up: true,
                plat: false,
            }),
            max_msg_size: Some(ctap_hid::MAX_PAYLOAD_LEN as u32),
            pin_uv_auth_protocols: None,
            transports: Some(vec![String::from("usb")]),
            algorithms: Some(vec![PublicKeyCredentialParameters::es256()]),
        }
    }
}

fn signed_data(auth_data: &AuthenticatorData, client_data_hash: &Sha256) -> Result<Vec<u8>, Error> {
    let mut data = auth_data.to_bytes()?;
    data.extend_from_slice(client_data_hash.as_ref());
    Ok(data)
}

#[async_trait]
impl<Identity, Presence> AuthenticatorAPI for Authenticator<Identity, Presence>
where
    Identity: IdentityProvider,
    Presence: UserPresence,
    Error: From<Identity::Error>,
    Error: From<Presence::Error>,
{
    type Error = Error;

    fn version(&self) -> fido2_api::VersionInfo {
        fido2_api::VersionInfo {
            version_major: pkg_version::pkg_version_major!(),
            version_minor: pkg_version::pkg_version_minor!(),
            version_build: pkg_version::pkg_version_patch!(),
            wink_supported: true,
        }
    }

    async fn make_credential(
        &self,
        cmd: MakeCredentialCommand,
    ) -> Result<MakeCredentialResponse, Error> {
        let MakeCredentialCommand {
            client_data_hash,
            rp,
            user,
            pub_key_cred_params,
            exclude_list,
            extensions,
            options,
            pin_uv_auth_param,
            pin_uv_auth_protocol: _,
            enterprise_attestation,
        } = cmd;
        debug!(%rp, user = ?user.id, "make_credential");

        // Numbered steps follow the authenticatorMakeCredential algorithm from the FIDO specification:
        // https://fidoalliance.org/specs/fido-v2.1-ps-20210615/fido-client-to-authenticator-protocol-v2.1-ps-20210615.html#sctn-makeCred-authnr-alg

        // 1, 2. This authenticator does not support pinUvAuthParam or pinUvAuthProtocol features
        if pin_uv_auth_param.is_some() {
            return Err(Error::InvalidParameter);
        }

        // 3. Select the first supported algorithm in pubKeyCredParams
        let algorithm = pub_key_cred_params
            .iter()
            .find(|param| {
                param.alg == COSEAlgorithmIdentifier::ES256
                    && param.type_ == PublicKeyCredentialType::PublicKey
            })
            .ok_or(Error::UnsupportedAlgorithm)?
            .alg;

        // 5. Process options parameter if present, treat any option keys that are not understood as absent.
        let options = options.unwrap_or_default();
        if options.uv == Some(true) {
            // There is no built-in user verification method
            return Err(Error::UnsupportedOption);
        }
        let discoverable = options.rk.unwrap_or(false);

        // 9. Enterprise attestation is not supported
        if enterprise_attestation.is_some() {
            return Err(Error::InvalidParameter);
        }

        let rp_id_hash = rp.id.hash();

        // 12. If the excludeList parameter is present and contains a credential ID created by this authenticator, that is bound to the specified rp.id:
        for descriptor in exclude_list.iter().flatten() {
            if self
                .identity
                .find_credential(&rp_id_hash, &descriptor.id)?
                .is_some()
            {
                info!(%rp, "Credential excluded");
                return Err(Error::CredentialExcluded);
            }
        }

        // 14. Collect user presence
        if !self.presence.approve_registration(rp.id.as_str()).await? {
            return Err(Error::OperationDenied);
        }

        // 15. Extensions are not processed
        if let Some(extensions) = extensions {
            trace!(?extensions, "Ignoring extensions");
        }

        // 16-18. Generate a new credential key pair, discoverable only if "rk" was requested
        let credential = self
            .identity
            .generate_credential(&rp_id_hash, discoverable.then(|| user))?;

        let auth_data = AuthenticatorData {
            rp_id_hash,
            user_present: true,
            user_verified: false,
            sign_count: self.identity.current_counter(&credential.id)?,
            attested_credential_data: Some(AttestedCredentialData {
                aaguid: self.aaguid,
                credential_id: credential.id.clone(),
                credential_public_key: credential.public_key.clone(),
            }),
        };

        // 19. Generate an attestation statement for the newly-created credential using clientDataHash
        trace!("Generate attestation statement");
        let sig = self
            .identity
            .attest(&signed_data(&auth_data, &client_data_hash)?)?;

        Ok(MakeCredentialResponse {
            auth_data,
            att_stmt: AttestationStatement::Packed(PackedAttestationStatement {
                alg: algorithm,
                sig,
                x5c: Some(self.identity.attestation_certificate()),
            }),
        })
    }

    async fn get_assertion(
        &self,
        cmd: GetAssertionCommand,
    ) -> Result<GetAssertionResponse, Self::Error> {
        let GetAssertionCommand {
            rp_id,
            client_data_hash,
            allow_list,
            extensions: _,
            options,
            pin_uv_auth_param,
            pin_uv_auth_protocol: _,
        } = cmd;
        debug!(%rp_id, "get_assertion");

        // Numbered steps follow the authenticatorGetAssertion algorithm from the FIDO specification:
        // https://fidoalliance.org/specs/fido-v2.1-ps-20210615/fido-client-to-authenticator-protocol-v2.1-ps-20210615.html#sctn-getAssert-authnr-alg

        // 1, 2. pinUvAuthParam is not supported
        if pin_uv_auth_param.is_some() {
            return Err(Error::InvalidParameter);
        }

        // 5. Process options, "rk" is not valid for assertions
        let options = options.unwrap_or_default();
        if options.uv == Some(true) || options.rk.is_some() {
            return Err(Error::UnsupportedOption);
        }
        let user_present = options.up.unwrap_or(true);
        let user_verified = false;

        let rp_id_hash = rp_id.hash();

        // 7. Locate all credentials that are eligible for retrieval.
        let allow_list = allow_list.filter(|list| !list.is_empty());
        let applicable_credentials = if let Some(ref allow_list) = allow_list {
            // 7.1. If the allowList parameter is present and is non-empty, locate all denoted credentials
            // created by this authenticator and bound to the specified rpId.
            let mut located = Vec::new();
            for descriptor in allow_list {
                if let Some(credential) =
                    self.identity.find_credential(&rp_id_hash, &descriptor.id)?
                {
                    located.push(credential);
                }
            }
            located
        } else {
            // 7.2. If an allowList is not present (or empty), locate all discoverable credentials that are
            // created by this authenticator and bound to the specified rpId.
            self.identity.discoverable_credentials(&rp_id_hash)?
        };

        // 8. If no applicable credentials were found, return CTAP2_ERR_NO_CREDENTIALS.
        // Most recent discoverable credential first, any from the allow list
        let credential = applicable_credentials
            .into_iter()
            .next()
            .ok_or(Error::NoCredentials)?;
        trace!(id = ?credential.id, "Selected credential");

        // 9. Collect user presence if required
        if user_present
            && !self
                .presence
                .approve_authentication(rp_id.as_str())
                .await?
        {
            return Err(Error::OperationDenied);
        }

        let auth_data = AuthenticatorData {
            rp_id_hash,
            user_present,
            user_verified,
            sign_count: self.identity.increment_counter(&credential.id)?,
            attested_credential_data: None,
        };
        let signature = self
            .identity
            .sign(&credential.id, &signed_data(&auth_data, &client_data_hash)?)?;

        Ok(GetAssertionResponse {
            credential: credential.descriptor(),
            auth_data,
            signature,
            user: credential.user,
            number_of_credentials: None,
        })
    }

    fn get_info(&self) -> Result<GetInfoResponse, Error> {
        Ok(self.get_info_internal())
    }

    async fn client_pin(&self, cmd: ClientPinCommand) -> Result<ClientPinResponse, Self::Error> {
        debug!(sub_command = ?cmd.sub_command, "client_pin");
        match cmd.sub_command {
            ClientPinSubCommand::GetPinRetries => Ok(ClientPinResponse {
                pin_retries: Some(PIN_RETRIES),
            }),
            _ => Err(Error::InvalidSubcommand),
        }
    }

    async fn reset(&self) -> Result<(), Self::Error> {
        if !self.presence.approve_reset().await? {
            return Err(Error::OperationDenied);
        }
        info!("Resetting authenticator");
        self.identity.reset()?;
        Ok(())
    }

    async fn wink(&self) -> Result<(), Self::Error> {
        self.presence.wink().await?;
        Ok(())
    }
}
