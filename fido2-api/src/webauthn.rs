use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder};
use minicbor::{Decode, Encode};
use std::{convert::Infallible, fmt, str::FromStr};

use crate::{Aaguid, Sha256, StatusCode};

/// Reads the header of a definite length map, the only kind CTAP2 canonical CBOR allows.
pub(crate) fn sized_map(
    d: &mut minicbor::Decoder<'_>,
    type_name: &str,
) -> Result<u64, minicbor::decode::Error> {
    let position = d.position();
    d.map()?.ok_or_else(|| {
        minicbor::decode::Error::message(format!("Expected sized map for {}", type_name))
            .at(position)
    })
}

fn missing(key: &str, type_name: &str, position: usize) -> minicbor::decode::Error {
    minicbor::decode::Error::message(format!(
        "Required key {} not present decoding {}",
        key, type_name
    ))
    .at(position)
}

/// See https://www.w3.org/TR/2019/PR-webauthn-20190117/#typedefdef-cosealgorithmidentifier
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum COSEAlgorithmIdentifier {
    ES256, // ECDSA w/ SHA-256, first default option
    EdDSA,
    ES384,
    ES512,
    PS256,
    RS256,
    Unknown(i32),
}

impl COSEAlgorithmIdentifier {
    pub fn value(self) -> i32 {
        match self {
            COSEAlgorithmIdentifier::ES256 => -7,
            COSEAlgorithmIdentifier::EdDSA => -8,
            COSEAlgorithmIdentifier::ES384 => -35,
            COSEAlgorithmIdentifier::ES512 => -36,
            COSEAlgorithmIdentifier::PS256 => -37,
            COSEAlgorithmIdentifier::RS256 => -257,
            COSEAlgorithmIdentifier::Unknown(value) => value,
        }
    }

    pub fn from_value(value: i32) -> Self {
        match value {
            -7 => COSEAlgorithmIdentifier::ES256,
            -8 => COSEAlgorithmIdentifier::EdDSA,
            -35 => COSEAlgorithmIdentifier::ES384,
            -36 => COSEAlgorithmIdentifier::ES512,
            -37 => COSEAlgorithmIdentifier::PS256,
            -257 => COSEAlgorithmIdentifier::RS256,
            value => COSEAlgorithmIdentifier::Unknown(value),
        }
    }
}

impl<C> Encode<C> for COSEAlgorithmIdentifier {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.i32(self.value())?.ok()
    }
}

// Unrecognized identifiers are kept so the caller can skip them when choosing an algorithm
impl<'b, C> Decode<'b, C> for COSEAlgorithmIdentifier {
    fn decode(
        d: &mut minicbor::Decoder<'b>,
        _ctx: &mut C,
    ) -> Result<Self, minicbor::decode::Error> {
        Ok(COSEAlgorithmIdentifier::from_value(d.i32()?))
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PublicKeyCredentialDescriptor {
    pub type_: PublicKeyCredentialType,
    pub id: CredentialId,
}

impl<C> Encode<C> for PublicKeyCredentialDescriptor {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.map(2)?
            .str("id")?
            .encode(&self.id)?
            .str("type")?
            .encode(&self.type_)?
            .ok()
    }
}

impl<'b, C> Decode<'b, C> for PublicKeyCredentialDescriptor {
    fn decode(d: &mut minicbor::Decoder<'b>, ctx: &mut C) -> Result<Self, minicbor::decode::Error> {
        let map_len = sized_map(d, "PublicKeyCredentialDescriptor")?;

        let mut id = None;
        let mut type_ = None;
        for _ in 0..map_len {
            match d.str()? {
                "id" => id = Some(Decode::decode(d, ctx)?),
                "type" => type_ = Some(Decode::decode(d, ctx)?),
                // transports are a hint for the platform, not the authenticator
                _ => d.skip()?,
            }
        }

        let position = d.position();
        Ok(PublicKeyCredentialDescriptor {
            id: id.ok_or_else(|| missing("id", "PublicKeyCredentialDescriptor", position))?,
            type_: type_
                .ok_or_else(|| missing("type", "PublicKeyCredentialDescriptor", position))?,
        })
    }
}

/// Parameters for Credential Generation from WebAuthn spec
/// https://www.w3.org/TR/webauthn-2/#dictionary-credential-params
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PublicKeyCredentialParameters {
    pub alg: COSEAlgorithmIdentifier,
    pub type_: PublicKeyCredentialType,
}

impl PublicKeyCredentialParameters {
    pub fn es256() -> Self {
        Self {
            alg: COSEAlgorithmIdentifier::ES256,
            type_: PublicKeyCredentialType::PublicKey,
        }
    }
}

impl<C> Encode<C> for PublicKeyCredentialParameters {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.map(2)?
            .str("alg")?
            .encode(self.alg)?
            .str("type")?
            .encode(&self.type_)?
            .ok()
    }
}

impl<'b, C> Decode<'b, C> for PublicKeyCredentialParameters {
    fn decode(d: &mut minicbor::Decoder<'b>, ctx: &mut C) -> Result<Self, minicbor::decode::Error> {
        let map_len = sized_map(d, "PublicKeyCredentialParameters")?;

        let mut alg = None;
        let mut type_ = None;
        for _ in 0..map_len {
            match d.str()? {
                "alg" => alg = Some(Decode::decode(d, ctx)?),
                "type" => type_ = Some(Decode::decode(d, ctx)?),
                _ => d.skip()?,
            }
        }

        let position = d.position();
        Ok(PublicKeyCredentialParameters {
            alg: alg.ok_or_else(|| missing("alg", "PublicKeyCredentialParameters", position))?,
            type_: type_
                .ok_or_else(|| missing("type", "PublicKeyCredentialParameters", position))?,
        })
    }
}

/// https://www.w3.org/TR/webauthn-2/#enumdef-publickeycredentialtype
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum PublicKeyCredentialType {
    PublicKey,
    Unknown(String),
}

impl fmt::Display for PublicKeyCredentialType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PublicKeyCredentialType::PublicKey => write!(f, "public-key"),
            PublicKeyCredentialType::Unknown(type_) => write!(f, "{}", type_),
        }
    }
}

impl FromStr for PublicKeyCredentialType {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public-key" => Ok(PublicKeyCredentialType::PublicKey),
            s => Ok(PublicKeyCredentialType::Unknown(s.to_owned())),
        }
    }
}

impl<C> Encode<C> for PublicKeyCredentialType {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.str(&self.to_string())?.ok()
    }
}

impl<'b, C> Decode<'b, C> for PublicKeyCredentialType {
    fn decode(
        d: &mut minicbor::Decoder<'b>,
        _ctx: &mut C,
    ) -> Result<Self, minicbor::decode::Error> {
        let type_ = d.str()?;
        match Self::from_str(type_) {
            Ok(type_) => Ok(type_),
            Err(never) => match never {},
        }
    }
}

/// Relying Party attribute map, used when creating a new credential
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PublicKeyCredentialRpEntity {
    // A unique identifier for the Relying Party entity, used as the RP ID
    pub id: RelyingPartyIdentifier,

    // A human-palatable name for the Relying Party, intended only for display
    pub name: String,
}

impl fmt::Display for PublicKeyCredentialRpEntity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.name)
    }
}

impl<C> Encode<C> for PublicKeyCredentialRpEntity {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.map(2)?
            .str("id")?
            .str(&self.id.0)?
            .str("name")?
            .str(&self.name)?
            .ok()
    }
}

impl<'b, C> Decode<'b, C> for PublicKeyCredentialRpEntity {
    fn decode(d: &mut minicbor::Decoder<'b>, _ctx: &mut C) -> Result<Self, minicbor::decode::Error> {
        let map_len = sized_map(d, "PublicKeyCredentialRpEntity")?;

        let mut id = None;
        let mut name = None;
        for _ in 0..map_len {
            match d.str()? {
                "id" => id = Some(d.str()?.to_string()),
                "name" => name = Some(d.str()?.to_string()),
                // icon was removed from later revisions but older platforms still send it
                _ => d.skip()?,
            }
        }

        let position = d.position();
        Ok(PublicKeyCredentialRpEntity {
            id: RelyingPartyIdentifier(
                id.ok_or_else(|| missing("id", "PublicKeyCredentialRpEntity", position))?,
            ),
            name: name.unwrap_or_default(),
        })
    }
}

// Additional user account attribute map used when creating a new credential
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PublicKeyCredentialUserEntity {
    /// The user handle of the user account. Authentication and authorization
    /// decisions MUST be made on the basis of this member, not displayName or name
    pub id: UserHandle,

    pub display_name: String,

    /// Human-palatable identifier for a user account, intended only for display.
    /// May be used to help the user differentiate accounts with similar display names.
    /// Fox example "alexm", "alex.mueller@example.com" or "+14255551234".
    pub name: String,
}

impl<C> Encode<C> for PublicKeyCredentialUserEntity {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        let mut len = 1;
        if !self.name.is_empty() {
            len += 1;
        }
        if !self.display_name.is_empty() {
            len += 1;
        }
        e.map(len)?.str("id")?.encode(&self.id)?;
        if !self.name.is_empty() {
            e.str("name")?.str(&self.name)?;
        }
        if !self.display_name.is_empty() {
            e.str("displayName")?.str(&self.display_name)?;
        }
        Ok(())
    }
}

impl<'b, C> Decode<'b, C> for PublicKeyCredentialUserEntity {
    fn decode(d: &mut minicbor::Decoder<'b>, ctx: &mut C) -> Result<Self, minicbor::decode::Error> {
        let map_len = sized_map(d, "PublicKeyCredentialUserEntity")?;

        let mut id = None;
        let mut display_name = None;
        let mut name = None;

        for _ in 0..map_len {
            match d.str()? {
                "id" => {
                    id = Some(Decode::decode(d, ctx)?);
                }
                "displayName" => {
                    display_name = Some(d.str()?.to_string());
                }
                "name" => {
                    name = Some(d.str()?.to_string());
                }
                _ => d.skip()?,
            }
        }

        let position = d.position();
        Ok(PublicKeyCredentialUserEntity {
            id: id.ok_or_else(|| missing("id", "PublicKeyCredentialUserEntity", position))?,
            name: name.unwrap_or_default(),
            display_name: display_name.unwrap_or_default(),
        })
    }
}

/// Opaque byte sequence with a maximum size of 64 bytes. Not meant for display
/// to the user. MUST NOT contain personally identifying information and
/// MUST NOT be empty.
#[derive(Debug, Hash, PartialEq, Eq, Clone)]
pub struct UserHandle(Vec<u8>);

impl UserHandle {
    pub const MAX_LEN: usize = 64;

    pub fn new(id: Vec<u8>) -> Result<Self, StatusCode> {
        if id.is_empty() || id.len() > Self::MAX_LEN {
            return Err(StatusCode::InvalidLength);
        }
        Ok(UserHandle(id))
    }
}

impl<C> Encode<C> for UserHandle {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.bytes(&self.0)?.ok()
    }
}

impl<'b, C> Decode<'b, C> for UserHandle {
    fn decode(
        d: &mut minicbor::Decoder<'b>,
        _ctx: &mut C,
    ) -> Result<Self, minicbor::decode::Error> {
        let position = d.position();
        let bytes = d.bytes()?;
        UserHandle::new(bytes.to_vec()).map_err(|_| {
            minicbor::decode::Error::message(format!(
                "User handle must be 1 to 64 bytes, got {}",
                bytes.len()
            ))
            .at(position)
        })
    }
}

impl AsRef<[u8]> for UserHandle {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl TryFrom<Vec<u8>> for UserHandle {
    type Error = StatusCode;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        UserHandle::new(value)
    }
}

/// A probabilistically-unique byte sequence identifying a public key credential source and its authentication assertions.
/// Must be at least 16 bytes and include at least 100 bits of entropy.
#[derive(Debug, Hash, PartialEq, Eq, Clone)]
pub struct CredentialId(Vec<u8>);

impl CredentialId {
    pub fn new(value: &[u8]) -> Self {
        CredentialId(value.to_vec())
    }
}

impl<C> Encode<C> for CredentialId {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.bytes(&self.0)?.ok()
    }
}

impl<'b, C> Decode<'b, C> for CredentialId {
    fn decode(
        d: &mut minicbor::Decoder<'b>,
        _ctx: &mut C,
    ) -> Result<Self, minicbor::decode::Error> {
        Ok(Self(d.bytes()?.to_vec()))
    }
}

impl AsRef<[u8]> for CredentialId {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl From<Vec<u8>> for CredentialId {
    fn from(value: Vec<u8>) -> Self {
        CredentialId(value)
    }
}

/// A valid domain string identifying on whose behalf a registration or
/// autentication ceremony is being performed. A credential may only be used
/// for authentication with the same identifier it was registered with.
///
/// aka RP ID
///
/// For WebAuthn it will be the origin's effective domain or a suffix thereof.
/// https://www.w3.org/TR/webauthn-2/#relying-party-identifier
#[derive(
    Debug, minicbor_derive::Encode, minicbor_derive::Decode, Hash, PartialEq, Eq, Clone,
)]
#[cbor(transparent)]
pub struct RelyingPartyIdentifier(#[n(0)] String);

impl RelyingPartyIdentifier {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The application parameter U2F and the authenticator data use to scope a credential.
    pub fn hash(&self) -> Sha256 {
        Sha256::digest(self.0.as_bytes())
    }
}

impl fmt::Display for RelyingPartyIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<[u8]> for RelyingPartyIdentifier {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

/// The authenticator data structure is a byte array of 37 bytes or more that
/// encodes contextual bindings made by the authenticator.
/// https://www.w3.org/TR/webauthn-2/#authenticator-data
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct AuthenticatorData {
    /// SHA-256 hash of the RP ID the credential is scoped to.
    pub rp_id_hash: Sha256,

    // flags
    pub user_present: bool,
    pub user_verified: bool,

    /// Signature counter, 32-bit unsigned big-endian integer.
    pub sign_count: u32,

    /// Attested credential data (if present)
    pub attested_credential_data: Option<AttestedCredentialData>,
}

impl AuthenticatorData {
    pub fn flags(&self) -> AuthenticatorDataFlags {
        let mut flags = AuthenticatorDataFlags::empty();
        if self.user_present {
            flags |= AuthenticatorDataFlags::UP;
        }
        if self.user_verified {
            flags |= AuthenticatorDataFlags::UV;
        }
        if self.attested_credential_data.is_some() {
            flags |= AuthenticatorDataFlags::AT;
        }
        flags
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, StatusCode> {
        let mut buf = Vec::with_capacity(37);
        buf.extend_from_slice(self.rp_id_hash.as_ref());
        buf.push(self.flags().bits());

        let mut sign_count = [0u8; 4];
        BigEndian::write_u32(&mut sign_count, self.sign_count);
        buf.extend_from_slice(&sign_count);

        if let Some(ref attested) = self.attested_credential_data {
            buf.extend_from_slice(attested.aaguid.as_ref());

            let credential_id = attested.credential_id.as_ref();
            let mut credential_id_len = [0u8; 2];
            BigEndian::write_u16(
                &mut credential_id_len,
                credential_id
                    .len()
                    .try_into()
                    .map_err(|_| StatusCode::InvalidLength)?,
            );
            buf.extend_from_slice(&credential_id_len);
            buf.extend_from_slice(credential_id);

            minicbor::encode(&attested.credential_public_key, &mut buf)
                .map_err(|_| StatusCode::Other)?;
        }
        Ok(buf)
    }
}

impl<C> minicbor::Encode<C> for AuthenticatorData {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        let bytes = self.to_bytes().map_err(minicbor::encode::Error::message)?;
        e.bytes(&bytes)?;
        Ok(())
    }
}

bitflags! {
    pub struct AuthenticatorDataFlags: u8 {
        const UP = 0b0000_0001; // Indicates the user is present
        const UV = 0b0000_0100; // Indicates the user is verified
        const AT = 0b0100_0000; // Indicates the authenticator added attested credential data
        const ED = 0b1000_0000; // Indicates the authenticator data has extensions
    }
}

/// https://www.w3.org/TR/webauthn-2/#sctn-attested-credential-data
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct AttestedCredentialData {
    pub aaguid: Aaguid,
    pub credential_id: CredentialId,
    pub credential_public_key: CredentialPublicKey,
}

/// A credential public key is the public key portion of a credential key pair.
///
/// Encoded in COSE_Key format, as defined in Section 7 of [RFC8152], using the CTAP2 canonical
/// CBOR encoding form. The COSE_Key-encoded credential public key MUST contain the "alg"
/// parameter and MUST NOT contain any other OPTIONAL parameters.
///
/// Note: The credential public key is referred to as the user public key in FIDO UAF and U2F.
/// https://www.w3.org/TR/webauthn-2/#credential-public-key
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct CredentialPublicKey {
    pub kty: KeyType,
    pub alg: COSEAlgorithmIdentifier,
    pub crv: EllipticCurve,
    pub x: [u8; 32],
    pub y: [u8; 32],
}

impl CredentialPublicKey {
    /// Builds an ES256 key from an uncompressed SEC1 point: 0x04 || x || y.
    pub fn from_uncompressed_point(point: &[u8]) -> Option<Self> {
        if point.len() != 65 || point[0] != 0x04 {
            return None;
        }
        let mut x = [0u8; 32];
        let mut y = [0u8; 32];
        x.copy_from_slice(&point[1..33]);
        y.copy_from_slice(&point[33..65]);
        Some(CredentialPublicKey {
            kty: KeyType::EC2,
            alg: COSEAlgorithmIdentifier::ES256,
            crv: EllipticCurve::P256,
            x,
            y,
        })
    }

    pub fn to_uncompressed_point(&self) -> Vec<u8> {
        let mut point = Vec::with_capacity(65);
        point.push(0x04);
        point.extend_from_slice(&self.x);
        point.extend_from_slice(&self.y);
        point
    }
}

impl<C> Encode<C> for CredentialPublicKey {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.map(5)?
            .i8(1)?
            .encode(self.kty)?
            .i8(3)?
            .encode(self.alg)?
            .i8(-1)?
            .encode(self.crv)?
            .i8(-2)?
            .bytes(&self.x)?
            .i8(-3)?
            .bytes(&self.y)?
            .ok()
    }
}

/// Key types define a format for transmitting pblic and private keys.
/// https://www.rfc-editor.org/rfc/rfc8152#section-13
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum KeyType {
    /// This value is reserved
    Reserved = 0,
    /// Octet Key Pair
    OKP = 1,
    /// Elliptic Curve Keys w/ x- and y-coordinate pair
    EC2 = 2,
    /// Symmetric Keys
    Symmetric = 4,
}

impl<C> Encode<C> for KeyType {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.u8(*self as u8)?.ok()
    }
}

/// https://www.rfc-editor.org/rfc/rfc8152#section-13.1
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum EllipticCurve {
    /// NIST P-256 also known as secp256r1, uses KeyType::EC2
    P256 = 1,
}

impl<C> Encode<C> for EllipticCurve {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.u8(*self as u8)?.ok()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum AttestationStatement {
    /// https://www.w3.org/TR/webauthn-2/#sctn-packed-attestation
    Packed(PackedAttestationStatement),

    /// https://www.w3.org/TR/webauthn-2/#sctn-none-attestation
    None,
}

impl AttestationStatement {
    pub fn format(&self) -> &str {
        match self {
            AttestationStatement::Packed(_) => "packed",
            AttestationStatement::None => "none",
        }
    }
}

impl<C> Encode<C> for AttestationStatement {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        match self {
            AttestationStatement::Packed(statement) => e.encode(statement)?.ok(),
            AttestationStatement::None => e.map(0)?.ok(),
        }
    }
}

/// https://www.w3.org/TR/webauthn-2/#sctn-packed-attestation
#[derive(Debug, PartialEq, Eq)]
pub struct PackedAttestationStatement {
    pub alg: COSEAlgorithmIdentifier,
    pub sig: Signature,
    pub x5c: Option<AttestationCertificate>,
}

impl<C> Encode<C> for PackedAttestationStatement {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        let len = if self.x5c.is_some() { 3 } else { 2 };
        e.map(len)?
            .str("alg")?
            .encode(self.alg)?
            .str("sig")?
            .bytes(self.sig.as_ref())?;
        if let Some(ref x5c) = self.x5c {
            e.str("x5c")?
                .array(1 + x5c.ca_certificate_chain.len() as u64)?
                .bytes(&x5c.attestation_certificate)?;
            for certificate in &x5c.ca_certificate_chain {
                e.bytes(certificate)?;
            }
        }
        Ok(())
    }
}

/// An attestation certificate and its certificate chain (if any), each encoded in X.509 format
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct AttestationCertificate {
    pub attestation_certificate: Vec<u8>,
    pub ca_certificate_chain: Vec<Vec<u8>>,
}

/// A WebAuthn signature is the result of signing authenticator data and the client data hash.
/// It can be an attestation signature or assertion signature.
/// https://www.w3.org/TR/webauthn-2/#webauthn-signature
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Signature(Vec<u8>);

impl Signature {
    pub fn new(value: &[u8]) -> Signature {
        Signature(value.to_vec())
    }
}

impl From<Vec<u8>> for Signature {
    fn from(value: Vec<u8>) -> Self {
        Signature(value)
    }
}

impl<C> Encode<C> for Signature {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.bytes(&self.0)?.ok()
    }
}

impl AsRef<[u8]> for Signature {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}
