//! Ed25519-backed [`Signer`]: pure Ed25519 over the message, no pre-hash.

use std::path::Path;

use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use ed25519_dalek::{Signer as DalekSigner, SigningKey};

use super::{KeyKind, Signer};
use crate::error::{KeystoreError, Result};

/// An Ed25519 private key loaded from disk or freshly generated.
pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    /// Generate a fresh Ed25519 key pair.
    #[must_use]
    pub fn generate() -> Self {
        // `ed25519-dalek`'s own re-export, not the workspace `rand` crate's
        // `OsRng` — their `rand_core` major versions don't line up.
        let mut rng = ed25519_dalek::rand_core::OsRng;
        Self {
            key: SigningKey::generate(&mut rng),
        }
    }

    /// Parse a PEM-encoded PKCS#8 Ed25519 private key. `passphrase` is
    /// accepted for interface symmetry with [`super::RsaSigner`] but
    /// encrypted PKCS#8 is not supported for Ed25519 keys in this agent.
    pub fn from_pem(pem: &str, passphrase: Option<&str>) -> Result<Self> {
        if passphrase.is_some_and(|p| !p.is_empty()) {
            return Err(
                KeystoreError::Setup("encrypted Ed25519 keys are not supported".into()).into(),
            );
        }
        let key = SigningKey::from_pkcs8_pem(pem)
            .map_err(|e| KeystoreError::Setup(format!("parsing Ed25519 key: {e}")))?;
        Ok(Self { key })
    }

    /// Write the key as a PKCS#8 PEM file.
    pub fn save_pem(&self, path: &Path) -> Result<()> {
        let pem = self
            .key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| KeystoreError::Setup(format!("encoding key: {e}")))?;
        std::fs::write(path, pem.as_bytes())
            .map_err(|e| KeystoreError::Setup(format!("writing {}: {e}", path.display())))?;
        Ok(())
    }
}

impl Signer for Ed25519Signer {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        Ok(self.key.sign(message).to_bytes().to_vec())
    }

    fn public_pem(&self) -> Result<String> {
        self.key
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| KeystoreError::Setup(format!("encoding public key: {e}")).into())
    }

    fn kind(&self) -> KeyKind {
        KeyKind::Ed25519
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
