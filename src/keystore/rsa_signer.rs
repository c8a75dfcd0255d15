//! RSA-backed [`Signer`]: PKCS#1 v1.5 signatures over a SHA-256 digest.

use std::path::Path;

use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::sha2::Sha256;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};

use super::{KeyKind, Signer};
use crate::error::{KeystoreError, Result};

/// An RSA private key loaded from disk or freshly generated.
pub struct RsaSigner {
    key: RsaPrivateKey,
}

impl RsaSigner {
    /// Generate a fresh RSA key with the given modulus size and the
    /// standard `e = 65537` public exponent.
    pub fn generate(bits: usize) -> Result<Self> {
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| KeystoreError::Setup(format!("RSA keygen failed: {e}")))?;
        Ok(Self { key })
    }

    /// Parse a PEM-encoded RSA private key, PKCS#1 or PKCS#8, optionally
    /// passphrase-protected (passphrase-protected PKCS#8 only; encrypted
    /// PKCS#1 is legacy and unsupported here).
    pub fn from_pem(pem: &str, passphrase: Option<&str>) -> Result<Self> {
        let key = if let Some(pass) = passphrase.filter(|p| !p.is_empty()) {
            RsaPrivateKey::from_pkcs8_encrypted_pem(pem, pass.as_bytes())
                .map_err(|e| KeystoreError::Setup(format!("decrypting key: {e}")))?
        } else if pem.contains("BEGIN RSA PRIVATE KEY") {
            RsaPrivateKey::from_pkcs1_pem(pem)
                .map_err(|e| KeystoreError::Setup(format!("parsing PKCS#1 key: {e}")))?
        } else {
            RsaPrivateKey::from_pkcs8_pem(pem)
                .map_err(|e| KeystoreError::Setup(format!("parsing PKCS#8 key: {e}")))?
        };
        Ok(Self { key })
    }

    /// Write the key as PEM, PKCS#1 when possible, PKCS#8 otherwise.
    pub fn save_pem(&self, path: &Path) -> Result<()> {
        let pem = self
            .key
            .to_pkcs1_pem(LineEnding::LF)
            .or_else(|_| self.key.to_pkcs8_pem(LineEnding::LF))
            .map_err(|e| KeystoreError::Setup(format!("encoding key: {e}")))?;
        std::fs::write(path, pem.as_bytes())
            .map_err(|e| KeystoreError::Setup(format!("writing {}: {e}", path.display())))?;
        Ok(())
    }
}

impl Signer for RsaSigner {
    fn sign(&self, digest: &[u8]) -> Result<Vec<u8>> {
        let scheme = Pkcs1v15Sign::new::<Sha256>();
        self.key
            .sign(scheme, digest)
            .map_err(|e| KeystoreError::Setup(format!("signing failed: {e}")).into())
    }

    fn public_pem(&self) -> Result<String> {
        let public: RsaPublicKey = self.key.to_public_key();
        public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| KeystoreError::Setup(format!("encoding public key: {e}")).into())
    }

    fn kind(&self) -> KeyKind {
        KeyKind::Rsa
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
