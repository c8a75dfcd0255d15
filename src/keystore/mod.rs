//! Keystore: load or generate an asymmetric key pair, sign digests, and
//! export the public key as PEM (spec §4.1).
//!
//! Abstracts "key on disk" vs. "key in an HSM" behind the [`Signer`] trait so
//! the [`crate::auth::Authenticator`] never needs to know which backend
//! produced a signature.

mod ed25519_signer;
mod pkcs11;
mod rsa_signer;

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

pub use ed25519_signer::Ed25519Signer;
pub use pkcs11::Pkcs11Signer;
pub use rsa_signer::RsaSigner;

use crate::error::{KeystoreError, Result};

/// Which asymmetric algorithm backs a loaded/generated key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// RSA, PKCS#1 v1.5 signatures over SHA-256.
    Rsa,
    /// Pure Ed25519 (no pre-hash).
    Ed25519,
}

/// Capability needed by the Authenticator: sign a digest, export a public
/// key as PEM. Implemented by on-disk key material and by HSM-backed keys
/// alike.
pub trait Signer: Send + Sync + std::any::Any {
    /// Sign `digest` (already hashed for RSA; raw message for Ed25519, see
    /// [`Keystore::sign`]) and return the raw signature bytes.
    fn sign(&self, digest: &[u8]) -> Result<Vec<u8>>;

    /// PEM-encoded SubjectPublicKeyInfo for the public half of this key.
    fn public_pem(&self) -> Result<String>;

    /// Which algorithm this signer implements.
    fn kind(&self) -> KeyKind;

    /// Type-erased self, used to recover the concrete on-disk signer when
    /// exporting a private key (HSM-backed signers never reach this path).
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Whether a keystore's key material may be regenerated, or is fixed
/// (externally supplied, e.g. provisioned at manufacturing time).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mutability {
    Dynamic,
    Static,
}

/// Loads or creates an asymmetric key pair; signs digests; exports the
/// public key in PEM.
pub struct Keystore {
    signer: Option<Box<dyn Signer>>,
    mutability: Mutability,
}

impl Keystore {
    /// Create an empty, dynamic keystore (no key loaded yet).
    #[must_use]
    pub fn new() -> Self {
        Self {
            signer: None,
            mutability: Mutability::Dynamic,
        }
    }

    /// Create a keystore whose key was supplied externally and must never be
    /// regenerated (`generate` will return [`KeystoreError::StaticKey`]).
    #[must_use]
    pub fn new_static(signer: Box<dyn Signer>) -> Self {
        Self {
            signer: Some(signer),
            mutability: Mutability::Static,
        }
    }

    /// Load a PEM-encoded private key from `path`.
    ///
    /// An empty `passphrase` means "not encrypted". Returns
    /// [`KeystoreError::NoKey`] if the file is absent.
    pub fn load(&mut self, path: &Path, passphrase: Option<&str>) -> Result<()> {
        if !path.exists() {
            return Err(KeystoreError::NoKey.into());
        }
        let pem = std::fs::read_to_string(path)
            .map_err(|e| KeystoreError::Setup(format!("reading {}: {e}", path.display())))?;

        let signer: Box<dyn Signer> = if pem.contains("ED25519 PRIVATE KEY")
            || pem.contains("BEGIN PRIVATE KEY") && looks_like_ed25519(&pem)
        {
            Box::new(Ed25519Signer::from_pem(&pem, passphrase)?)
        } else {
            Box::new(RsaSigner::from_pem(&pem, passphrase)?)
        };
        self.signer = Some(signer);
        Ok(())
    }

    /// Select an HSM/PKCS#11 provider by `engine_name` and load the key
    /// referenced by `key_uri`.
    pub fn load_from_hsm(&mut self, engine_name: &str, key_uri: &str) -> Result<()> {
        let signer = Pkcs11Signer::connect(engine_name, key_uri)?;
        self.signer = Some(Box::new(signer));
        Ok(())
    }

    /// Generate a fresh key pair. Fails with [`KeystoreError::StaticKey`] if
    /// this keystore was created via [`Keystore::new_static`].
    pub fn generate(&mut self, kind: KeyKind, bits: usize) -> Result<()> {
        if self.mutability == Mutability::Static {
            return Err(KeystoreError::StaticKey.into());
        }
        let signer: Box<dyn Signer> = match kind {
            KeyKind::Rsa => Box::new(RsaSigner::generate(bits)?),
            KeyKind::Ed25519 => Box::new(Ed25519Signer::generate()),
        };
        self.signer = Some(signer);
        Ok(())
    }

    /// Generate an RSA-3072/e=65537 key, matching spec §4.1's default.
    pub fn generate_default(&mut self) -> Result<()> {
        self.generate(KeyKind::Rsa, 3072)
    }

    /// Write a PEM-encoded private key to `path`. Only meaningful for
    /// on-disk signers; HSM-backed keys never leave the device and this is
    /// a no-op for them in practice, but the on-disk signers implement the
    /// real serialization.
    pub fn save(&self, path: &PathBuf) -> Result<()> {
        let signer = self.require_signer()?;
        if let Some(rsa) = signer_as_rsa(signer) {
            rsa.save_pem(path)
        } else if let Some(ed) = signer_as_ed25519(signer) {
            ed.save_pem(path)
        } else {
            Err(KeystoreError::Setup("signer does not support export".into()).into())
        }
    }

    /// PEM-encoded SubjectPublicKeyInfo for the currently loaded key.
    pub fn public_pem(&self) -> Result<String> {
        self.require_signer()?.public_pem()
    }

    /// Which algorithm the active key uses.
    pub fn key_kind(&self) -> Result<KeyKind> {
        Ok(self.require_signer()?.kind())
    }

    /// Sign `message`.
    ///
    /// For RSA: PKCS#1 v1.5 over SHA-256 of `message`.
    /// For Ed25519: pure Ed25519 over `message` directly (no pre-hash).
    ///
    /// Never succeeds unless a key has been loaded or generated.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let signer = self.require_signer()?;
        match signer.kind() {
            KeyKind::Rsa => {
                let mut hasher = Sha256::new();
                hasher.update(message);
                let digest = hasher.finalize();
                signer.sign(&digest)
            }
            KeyKind::Ed25519 => signer.sign(message),
        }
    }

    fn require_signer(&self) -> Result<&dyn Signer> {
        self.signer
            .as_deref()
            .ok_or_else(|| KeystoreError::Setup("no key loaded".into()).into())
    }
}

impl Default for Keystore {
    fn default() -> Self {
        Self::new()
    }
}

fn looks_like_ed25519(pem: &str) -> bool {
    // A PKCS#8 "PRIVATE KEY" blob's algorithm OID determines the key type;
    // on-disk we distinguish by trying Ed25519 first elsewhere. This helper
    // only handles the unambiguous PEM label case.
    pem.contains("ED25519")
}

fn signer_as_rsa(signer: &dyn Signer) -> Option<&RsaSigner> {
    signer.as_any().downcast_ref::<RsaSigner>()
}

fn signer_as_ed25519(signer: &dyn Signer) -> Option<&Ed25519Signer> {
    signer.as_any().downcast_ref::<Ed25519Signer>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_fails_without_loaded_key() {
        let ks = Keystore::new();
        assert!(ks.sign(b"hello").is_err());
    }

    #[test]
    fn generate_then_sign_roundtrips() {
        let mut ks = Keystore::new();
        ks.generate(KeyKind::Ed25519, 0).unwrap();
        let sig = ks.sign(b"hello world").unwrap();
        assert!(!sig.is_empty());
        let pem = ks.public_pem().unwrap();
        assert!(pem.contains("PUBLIC KEY"));
    }

    #[test]
    fn static_keystore_refuses_generate() {
        let signer = Ed25519Signer::generate();
        let mut ks = Keystore::new_static(Box::new(signer));
        let err = ks.generate(KeyKind::Rsa, 3072).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Keystore(KeystoreError::StaticKey)
        ));
    }

    #[test]
    fn rsa_sign_produces_pkcs1v15_signature_of_expected_length() {
        let mut ks = Keystore::new();
        ks.generate(KeyKind::Rsa, 2048).unwrap();
        let sig = ks.sign(b"some digest input").unwrap();
        // 2048-bit modulus -> 256-byte signature.
        assert_eq!(sig.len(), 256);
    }
}
