//! Ed25519 signatures over encoded writer metadata.

use ed25519_dalek::Signature;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tlfkeys_core::byte_array_type;
use tlfkeys_core::codec::b64;
use zeroize::Zeroize;

pub const SIGNATURE_VERSION_ED25519: u8 = 1;

byte_array_type! {
    /// Device signing public key.
    pub struct VerifyingKey([u8; 32]);
}

/// Device signing key. The inner key zeroizes itself on drop.
pub struct SigningKey(ed25519_dalek::SigningKey);

impl SigningKey {
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        let key = Self::from_bytes(&seed);
        seed.zeroize();
        key
    }

    pub fn from_bytes(seed: &[u8; 32]) -> Self {
        Self(ed25519_dalek::SigningKey::from_bytes(seed))
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("verifying_key", &Signer::verifying_key(self))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// A detached signature and the key that made it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureInfo {
    #[serde(rename = "v")]
    pub version: u8,
    #[serde(rename = "s", with = "b64")]
    pub signature: Vec<u8>,
    #[serde(rename = "k")]
    pub verifying_key: VerifyingKey,
}

impl SignatureInfo {
    pub fn verify(&self, msg: &[u8]) -> anyhow::Result<()> {
        if self.version != SIGNATURE_VERSION_ED25519 {
            anyhow::bail!("unsupported signature version {}", self.version);
        }
        let key = ed25519_dalek::VerifyingKey::from_bytes(self.verifying_key.as_bytes())
            .map_err(|e| anyhow::anyhow!("invalid verifying key: {e}"))?;
        let sig = Signature::from_slice(&self.signature)
            .map_err(|e| anyhow::anyhow!("malformed signature: {e}"))?;
        key.verify_strict(msg, &sig)
            .map_err(|_| anyhow::anyhow!("signature verification failed"))
    }
}

pub trait Signer: Send + Sync {
    fn sign(&self, msg: &[u8]) -> anyhow::Result<SignatureInfo>;

    fn verifying_key(&self) -> VerifyingKey;
}

impl Signer for SigningKey {
    fn sign(&self, msg: &[u8]) -> anyhow::Result<SignatureInfo> {
        use ed25519_dalek::Signer as _;
        let sig = self.0.sign(msg);
        Ok(SignatureInfo {
            version: SIGNATURE_VERSION_ED25519,
            signature: sig.to_bytes().to_vec(),
            verifying_key: Signer::verifying_key(self),
        })
    }

    fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey::from_bytes(self.0.verifying_key().to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let key = SigningKey::generate();
        let sig = key.sign(b"writer metadata").unwrap();
        assert_eq!(sig.verifying_key, key.verifying_key());
        sig.verify(b"writer metadata").unwrap();
    }

    #[test]
    fn test_verify_rejects_other_message() {
        let key = SigningKey::generate();
        let sig = key.sign(b"a").unwrap();
        assert!(sig.verify(b"b").is_err());
    }

    #[test]
    fn test_verify_rejects_swapped_key() {
        let key = SigningKey::from_bytes(&[1u8; 32]);
        let other = SigningKey::from_bytes(&[2u8; 32]);
        let mut sig = key.sign(b"a").unwrap();
        sig.verifying_key = other.verifying_key();
        assert!(sig.verify(b"a").is_err());
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = SigningKey::from_bytes(&[1u8; 32]);
        assert!(format!("{key:?}").contains("REDACTED"));
    }
}
