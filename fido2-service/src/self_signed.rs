use std::sync::{Mutex, MutexGuard};

use fido2_api::{
    AttestationCertificate, CredentialId, CredentialPublicKey, PublicKeyCredentialUserEntity,
    Sha256, Signature,
};
use openssl::{
    asn1::Asn1Time,
    bn::{BigNum, BigNumContext, MsbOption},
    ec::{EcGroup, EcKey, PointConversionForm},
    error::ErrorStack,
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    sign::Signer,
    x509::{
        extension::{
            AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage,
            SubjectKeyIdentifier,
        },
        X509Name, X509NameBuilder, X509,
    },
};
use thiserror::Error;
use tracing::{debug, trace};

use crate::identity::{Credential, IdentityProvider};

pub const CREDENTIAL_ID_LEN: usize = 32;

const ORGANIZATION: &str = "Self-Signed Virtual FIDO";
const ATTESTATION_UNIT: &str = "Authenticator Attestation";
const COUNTRY: &str = "US";
const VALIDITY_DAYS: u32 = 10 * 365;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] ErrorStack),

    #[error("Unknown credential")]
    UnknownCredential,

    #[error("Signature counter exhausted")]
    CounterExhausted,

    #[error("Credential table poisoned")]
    Poisoned,
}

struct StoredCredential {
    credential: Credential,
    key: PKey<Private>,
    counter: u32,
}

/// In-memory identity provider with a freshly generated attestation chain.
///
/// A self-signed P-256 certificate authority is created on startup and used to sign the
/// attestation certificate. Credentials and counters are lost when the process exits.
pub struct SelfSignedIdentity {
    attestation_key: PKey<Private>,
    attestation_certificate: Vec<u8>,
    ca_certificate: Vec<u8>,
    credentials: Mutex<Vec<StoredCredential>>,
}

impl SelfSignedIdentity {
    pub fn generate(common_name: &str) -> Result<Self, IdentityError> {
        let ca_key = generate_key()?;
        let ca_certificate = ca_certificate(&ca_key)?;
        let attestation_key = generate_key()?;
        let attestation_certificate =
            attestation_certificate(common_name, &attestation_key, &ca_certificate, &ca_key)?;
        debug!(common_name, "Generated self-signed attestation identity");

        Ok(Self {
            attestation_key,
            attestation_certificate: attestation_certificate.to_der()?,
            ca_certificate: ca_certificate.to_der()?,
            credentials: Mutex::new(Vec::new()),
        })
    }

    fn credentials(&self) -> Result<MutexGuard<'_, Vec<StoredCredential>>, IdentityError> {
        self.credentials.lock().map_err(|_| IdentityError::Poisoned)
    }
}

impl IdentityProvider for SelfSignedIdentity {
    type Error = IdentityError;

    fn generate_credential(
        &self,
        rp_id_hash: &Sha256,
        user: Option<PublicKeyCredentialUserEntity>,
    ) -> Result<Credential, Self::Error> {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
        let ec_key = EcKey::generate(&group)?;
        let public_key = credential_public_key(&ec_key)?;
        let key = PKey::from_ec_key(ec_key)?;

        let mut id = [0u8; CREDENTIAL_ID_LEN];
        openssl::rand::rand_bytes(&mut id)?;

        let credential = Credential {
            id: CredentialId::new(&id),
            rp_id_hash: *rp_id_hash,
            public_key,
            user,
        };
        trace!(id = ?credential.id, discoverable = credential.is_discoverable(), "Generated credential");

        self.credentials()?.push(StoredCredential {
            credential: credential.clone(),
            key,
            counter: 0,
        });
        Ok(credential)
    }

    fn find_credential(
        &self,
        rp_id_hash: &Sha256,
        id: &CredentialId,
    ) -> Result<Option<Credential>, Self::Error> {
        Ok(self
            .credentials()?
            .iter()
            .find(|stored| stored.credential.id == *id && stored.credential.rp_id_hash == *rp_id_hash)
            .map(|stored| stored.credential.clone()))
    }

    fn discoverable_credentials(
        &self,
        rp_id_hash: &Sha256,
    ) -> Result<Vec<Credential>, Self::Error> {
        Ok(self
            .credentials()?
            .iter()
            .rev()
            .filter(|stored| {
                stored.credential.is_discoverable() && stored.credential.rp_id_hash == *rp_id_hash
            })
            .map(|stored| stored.credential.clone())
            .collect())
    }

    fn sign(&self, id: &CredentialId, data: &[u8]) -> Result<Signature, Self::Error> {
        let credentials = self.credentials()?;
        let stored = credentials
            .iter()
            .find(|stored| stored.credential.id == *id)
            .ok_or(IdentityError::UnknownCredential)?;
        Ok(sign(&stored.key, data)?)
    }

    fn current_counter(&self, id: &CredentialId) -> Result<u32, Self::Error> {
        self.credentials()?
            .iter()
            .find(|stored| stored.credential.id == *id)
            .map(|stored| stored.counter)
            .ok_or(IdentityError::UnknownCredential)
    }

    fn increment_counter(&self, id: &CredentialId) -> Result<u32, Self::Error> {
        let mut credentials = self.credentials()?;
        let stored = credentials
            .iter_mut()
            .find(|stored| stored.credential.id == *id)
            .ok_or(IdentityError::UnknownCredential)?;
        stored.counter = stored
            .counter
            .checked_add(1)
            .ok_or(IdentityError::CounterExhausted)?;
        Ok(stored.counter)
    }

    fn attest(&self, data: &[u8]) -> Result<Signature, Self::Error> {
        Ok(sign(&self.attestation_key, data)?)
    }

    fn attestation_certificate(&self) -> AttestationCertificate {
        AttestationCertificate {
            attestation_certificate: self.attestation_certificate.clone(),
            ca_certificate_chain: vec![self.ca_certificate.clone()],
        }
    }

    fn reset(&self) -> Result<(), Self::Error> {
        let mut credentials = self.credentials()?;
        debug!(count = credentials.len(), "Forgetting all credentials");
        credentials.clear();
        Ok(())
    }
}

fn generate_key() -> Result<PKey<Private>, ErrorStack> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    PKey::from_ec_key(EcKey::generate(&group)?)
}

fn sign(key: &PKey<Private>, data: &[u8]) -> Result<Signature, ErrorStack> {
    let mut signer = Signer::new(MessageDigest::sha256(), key)?;
    signer.update(data)?;
    Ok(Signature::from(signer.sign_to_vec()?))
}

fn credential_public_key(key: &EcKey<Private>) -> Result<CredentialPublicKey, ErrorStack> {
    let mut ctx = BigNumContext::new()?;
    let point = key
        .public_key()
        .to_bytes(key.group(), PointConversionForm::UNCOMPRESSED, &mut ctx)?;
    // P-256 points are always 65 bytes uncompressed
    CredentialPublicKey::from_uncompressed_point(&point).ok_or_else(ErrorStack::get)
}

fn name(common_name: &str, unit: Option<&str>) -> Result<X509Name, ErrorStack> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COUNTRYNAME, COUNTRY)?;
    name.append_entry_by_nid(Nid::ORGANIZATIONNAME, ORGANIZATION)?;
    if let Some(unit) = unit {
        name.append_entry_by_nid(Nid::ORGANIZATIONALUNITNAME, unit)?;
    }
    name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
    Ok(name.build())
}

fn serial_number() -> Result<openssl::asn1::Asn1Integer, ErrorStack> {
    let mut serial = BigNum::new()?;
    serial.rand(127, MsbOption::MAYBE_ZERO, false)?;
    serial.to_asn1_integer()
}

fn ca_certificate(key: &PKey<Private>) -> Result<X509, ErrorStack> {
    let name = name(ORGANIZATION, None)?;

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    let serial: openssl::asn1::Asn1Integer = serial_number()?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(key)?;
    let not_before: Asn1Time = Asn1Time::days_from_now(0)?;
    let not_after: Asn1Time = Asn1Time::days_from_now(VALIDITY_DAYS)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .digital_signature()
            .key_cert_sign()
            .build()?,
    )?;
    let subject_key_identifier =
        SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
    builder.append_extension(subject_key_identifier)?;
    builder.sign(key, MessageDigest::sha256())?;
    Ok(builder.build())
}

fn attestation_certificate(
    common_name: &str,
    key: &PKey<Private>,
    ca_certificate: &X509,
    ca_key: &PKey<Private>,
) -> Result<X509, ErrorStack> {
    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    let serial: openssl::asn1::Asn1Integer = serial_number()?;
    builder.set_serial_number(&serial)?;
    let subject_name: X509Name = name(common_name, Some(ATTESTATION_UNIT))?;
    builder.set_subject_name(&subject_name)?;
    builder.set_issuer_name(ca_certificate.subject_name())?;
    builder.set_pubkey(key)?;
    let not_before: Asn1Time = Asn1Time::days_from_now(0)?;
    let not_after: Asn1Time = Asn1Time::days_from_now(VALIDITY_DAYS)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    builder.append_extension(BasicConstraints::new().build()?)?;
    builder.append_extension(KeyUsage::new().critical().digital_signature().build()?)?;
    builder.append_extension(
        ExtendedKeyUsage::new()
            .client_auth()
            .server_auth()
            .build()?,
    )?;
    let authority_key_identifier = AuthorityKeyIdentifier::new()
        .keyid(false)
        .build(&builder.x509v3_context(Some(&**ca_certificate), None))?;
    builder.append_extension(authority_key_identifier)?;
    builder.sign(ca_key, MessageDigest::sha256())?;
    Ok(builder.build())
}
