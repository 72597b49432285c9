use std::fmt::Debug;

use fido2_api::{
    AttestationCertificate, CredentialId, CredentialPublicKey, PublicKeyCredentialDescriptor,
    PublicKeyCredentialType, PublicKeyCredentialUserEntity, Sha256, Signature,
};

/// A credential key pair held by an [`IdentityProvider`]. The private half never leaves it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub id: CredentialId,
    /// SHA-256 of the RP ID, the U2F application parameter.
    pub rp_id_hash: Sha256,
    pub public_key: CredentialPublicKey,
    /// Present only for discoverable credentials.
    pub user: Option<PublicKeyCredentialUserEntity>,
}

impl Credential {
    pub fn is_discoverable(&self) -> bool {
        self.user.is_some()
    }

    pub fn descriptor(&self) -> PublicKeyCredentialDescriptor {
        PublicKeyCredentialDescriptor {
            type_: PublicKeyCredentialType::PublicKey,
            id: self.id.clone(),
        }
    }
}

/// Owns credential key material, use counters and the attestation identity.
///
/// Both the U2F and the CTAP2 processors are written against this trait; they only shape
/// requests and responses and leave every cryptographic operation to the provider.
pub trait IdentityProvider: Send + Sync {
    type Error: Debug + Send;

    /// Creates an ES256 key pair scoped to `rp_id_hash`. Passing a user makes it discoverable.
    fn generate_credential(
        &self,
        rp_id_hash: &Sha256,
        user: Option<PublicKeyCredentialUserEntity>,
    ) -> Result<Credential, Self::Error>;

    /// Looks up a credential by id, only if it was created for `rp_id_hash`.
    fn find_credential(
        &self,
        rp_id_hash: &Sha256,
        id: &CredentialId,
    ) -> Result<Option<Credential>, Self::Error>;

    /// Discoverable credentials for `rp_id_hash`, most recently created first.
    fn discoverable_credentials(&self, rp_id_hash: &Sha256)
        -> Result<Vec<Credential>, Self::Error>;

    /// ECDSA P-256 SHA-256 signature over `data` with the credential's private key, DER encoded.
    fn sign(&self, id: &CredentialId, data: &[u8]) -> Result<Signature, Self::Error>;

    fn current_counter(&self, id: &CredentialId) -> Result<u32, Self::Error>;

    /// Advances the use counter and returns the new value.
    fn increment_counter(&self, id: &CredentialId) -> Result<u32, Self::Error>;

    /// Signs `data` with the attestation key.
    fn attest(&self, data: &[u8]) -> Result<Signature, Self::Error>;

    /// DER attestation certificate followed by the chain up to the root.
    fn attestation_certificate(&self) -> AttestationCertificate;

    /// Forgets every credential.
    fn reset(&self) -> Result<(), Self::Error>;
}
