//! HSM/PKCS#11-backed [`Signer`].
//!
//! Real device builds select a PKCS#11 provider library by `engine_name`
//! (e.g. a SoftHSM2 or TPM2 PKCS#11 module path) and reference a key object
//! by URI (RFC 7512 `pkcs11:` URI), exactly as `cryptoki`-based agents do —
//! grounded in `other_examples/manifests/thin-edge-thin-edge.io`, which
//! depends on `cryptoki = "0.12.0"` for this same "sign without exposing the
//! private key" contract.

use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::mechanism::Mechanism;
use cryptoki::object::{Attribute, AttributeType, ObjectClass, ObjectHandle};
use cryptoki::session::{Session, UserType};
use cryptoki::types::AuthPin;
use ed25519_dalek::pkcs8::EncodePublicKey as _;
use ed25519_dalek::VerifyingKey;
use rsa::pkcs8::{EncodePublicKey as _, LineEnding};
use rsa::{BigUint, RsaPublicKey};

use super::{KeyKind, Signer};
use crate::error::{KeystoreError, Result};

/// A key object resident in a PKCS#11 token; signing never exposes the
/// private key material to the process.
pub struct Pkcs11Signer {
    session: Session,
    key: ObjectHandle,
    public_key: Option<ObjectHandle>,
    kind: KeyKind,
}

impl Pkcs11Signer {
    /// Open the PKCS#11 module at `engine_name` (a shared-library path) and
    /// locate the key object identified by `key_uri` (its PKCS#11 label).
    pub fn connect(engine_name: &str, key_uri: &str) -> Result<Self> {
        let pkcs11 = Pkcs11::new(engine_name)
            .map_err(|e| KeystoreError::Setup(format!("loading PKCS#11 module: {e}")))?;
        pkcs11
            .initialize(CInitializeArgs::OsThreads)
            .map_err(|e| KeystoreError::Setup(format!("initializing PKCS#11 module: {e}")))?;

        let slot = *pkcs11
            .get_slots_with_token()
            .map_err(|e| KeystoreError::Setup(format!("listing PKCS#11 slots: {e}")))?
            .first()
            .ok_or_else(|| KeystoreError::Setup("no PKCS#11 token present".into()))?;

        let session = pkcs11
            .open_rw_session(slot)
            .map_err(|e| KeystoreError::Setup(format!("opening PKCS#11 session: {e}")))?;
        session
            .login(UserType::User, Some(&AuthPin::new(String::new())))
            .ok();

        let template = vec![Attribute::Label(key_uri.as_bytes().to_vec())];
        let handles = session
            .find_objects(&template)
            .map_err(|e| KeystoreError::Setup(format!("locating key object: {e}")))?;
        let key = *handles
            .first()
            .ok_or_else(|| KeystoreError::Setup(format!("no key object labeled {key_uri}")))?;

        let key_type = session
            .get_attributes(key, &[AttributeType::KeyType])
            .map_err(|e| KeystoreError::Setup(format!("reading key attributes: {e}")))?;
        let kind = match key_type.first() {
            Some(Attribute::KeyType(cryptoki::object::KeyType::RSA)) => KeyKind::Rsa,
            _ => KeyKind::Ed25519,
        };

        // The public half is usually a separate token object sharing the
        // same label; the private/signing object rarely carries readable
        // Modulus/PublicExponent/EcPoint attributes itself.
        let public_template = vec![
            Attribute::Label(key_uri.as_bytes().to_vec()),
            Attribute::Class(ObjectClass::PUBLIC_KEY),
        ];
        let public_key = session
            .find_objects(&public_template)
            .ok()
            .and_then(|handles| handles.first().copied());

        Ok(Self {
            session,
            key,
            public_key,
            kind,
        })
    }
}

impl Signer for Pkcs11Signer {
    fn sign(&self, digest: &[u8]) -> Result<Vec<u8>> {
        let mechanism = match self.kind {
            // `digest` is already the SHA-256 hash of the message (see
            // `Keystore::sign`); `RsaPkcs` signs the supplied bytes
            // as-is (wrapping them in a DigestInfo), unlike
            // `Sha256RsaPkcs`, which would hash them again.
            KeyKind::Rsa => Mechanism::RsaPkcs,
            KeyKind::Ed25519 => Mechanism::Eddsa,
        };
        self.session
            .sign(&mechanism, self.key, digest)
            .map_err(|e| KeystoreError::Setup(format!("HSM signing failed: {e}")).into())
    }

    fn public_pem(&self) -> Result<String> {
        let public_key = self.public_key.ok_or_else(|| {
            KeystoreError::Setup(format!(
                "no public key object found alongside this HSM {:?} key",
                self.kind
            ))
        })?;

        match self.kind {
            KeyKind::Rsa => {
                let attrs = self
                    .session
                    .get_attributes(
                        public_key,
                        &[AttributeType::Modulus, AttributeType::PublicExponent],
                    )
                    .map_err(|e| KeystoreError::Setup(format!("reading public key: {e}")))?;
                let mut modulus = None;
                let mut exponent = None;
                for attr in attrs {
                    match attr {
                        Attribute::Modulus(bytes) => modulus = Some(bytes),
                        Attribute::PublicExponent(bytes) => exponent = Some(bytes),
                        _ => {}
                    }
                }
                let modulus = modulus
                    .ok_or_else(|| KeystoreError::Setup("HSM key has no modulus".to_string()))?;
                let exponent = exponent.ok_or_else(|| {
                    KeystoreError::Setup("HSM key has no public exponent".to_string())
                })?;
                let public = RsaPublicKey::new(
                    BigUint::from_bytes_be(&modulus),
                    BigUint::from_bytes_be(&exponent),
                )
                .map_err(|e| KeystoreError::Setup(format!("rebuilding public key: {e}")))?;
                public
                    .to_public_key_pem(LineEnding::LF)
                    .map_err(|e| KeystoreError::Setup(format!("encoding public key: {e}")).into())
            }
            KeyKind::Ed25519 => {
                let attrs = self
                    .session
                    .get_attributes(public_key, &[AttributeType::EcPoint])
                    .map_err(|e| KeystoreError::Setup(format!("reading public key: {e}")))?;
                let point = attrs
                    .into_iter()
                    .find_map(|attr| match attr {
                        Attribute::EcPoint(bytes) => Some(bytes),
                        _ => None,
                    })
                    .ok_or_else(|| KeystoreError::Setup("HSM key has no EC point".to_string()))?;
                let raw = decode_der_octet_string(&point)?;
                let bytes: [u8; 32] = raw.try_into().map_err(|_| {
                    KeystoreError::Setup("HSM Ed25519 point is not 32 bytes".to_string())
                })?;
                let verifying = VerifyingKey::from_bytes(&bytes)
                    .map_err(|e| KeystoreError::Setup(format!("invalid Ed25519 point: {e}")))?;
                verifying
                    .to_public_key_pem(LineEnding::LF)
                    .map_err(|e| KeystoreError::Setup(format!("encoding public key: {e}")).into())
            }
        }
    }

    fn kind(&self) -> KeyKind {
        self.kind
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// `CKA_EC_POINT` is a DER `OCTET STRING` wrapping the raw point; unwrap the
/// short-form tag/length header to get at the raw bytes.
fn decode_der_octet_string(der: &[u8]) -> Result<Vec<u8>> {
    if der.len() >= 2 && der[0] == 0x04 && (der[1] as usize) == der.len() - 2 {
        Ok(der[2..].to_vec())
    } else {
        Err(KeystoreError::Setup("malformed CKA_EC_POINT encoding".to_string()).into())
    }
}
