//! Versioned XChaCha20-Poly1305 ciphertext record.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tlfkeys_core::codec::b64;
use zeroize::Zeroizing;

use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EncryptionVersion(pub u8);

impl EncryptionVersion {
    pub const XCHACHA20_POLY1305: EncryptionVersion = EncryptionVersion(1);
}

/// Ciphertext plus everything needed to open it except the key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedData {
    #[serde(rename = "v")]
    pub version: EncryptionVersion,
    #[serde(rename = "e", with = "b64")]
    pub data: Vec<u8>,
    #[serde(rename = "n", with = "b64")]
    pub nonce: Vec<u8>,
}

impl EncryptedData {
    /// Encrypt `plaintext` under `key` with a fresh random nonce.
    pub fn seal(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> anyhow::Result<Self> {
        let cipher = XChaCha20Poly1305::new(key.into());

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng()
            .try_fill_bytes(&mut nonce_bytes)
            .map_err(|e| anyhow::anyhow!("nonce generation failed: {e}"))?;
        let nonce = XNonce::from_slice(&nonce_bytes);

        let data = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| anyhow::anyhow!("encryption failed: {e}"))?;

        Ok(Self {
            version: EncryptionVersion::XCHACHA20_POLY1305,
            data,
            nonce: nonce_bytes.to_vec(),
        })
    }

    /// Decrypt and authenticate. The returned buffer is zeroized on drop.
    pub fn open(&self, key: &[u8; KEY_SIZE]) -> anyhow::Result<Zeroizing<Vec<u8>>> {
        if self.version != EncryptionVersion::XCHACHA20_POLY1305 {
            anyhow::bail!("unsupported encryption version {}", self.version.0);
        }
        if self.nonce.len() != NONCE_SIZE {
            anyhow::bail!(
                "nonce has wrong size: {} bytes (expected {})",
                self.nonce.len(),
                NONCE_SIZE
            );
        }
        if self.data.len() < TAG_SIZE {
            anyhow::bail!(
                "ciphertext too short: {} bytes (expected at least {})",
                self.data.len(),
                TAG_SIZE
            );
        }

        let cipher = XChaCha20Poly1305::new(key.into());
        let nonce = XNonce::from_slice(&self.nonce);
        let plaintext = cipher
            .decrypt(nonce, self.data.as_slice())
            .map_err(|_| anyhow::anyhow!("decryption failed: wrong key or corrupted data"))?;
        Ok(Zeroizing::new(plaintext))
    }

    /// Open a record that must hold exactly one 256-bit key.
    pub fn open_key(&self, key: &[u8; KEY_SIZE]) -> anyhow::Result<[u8; KEY_SIZE]> {
        let plaintext = self.open(key)?;
        if plaintext.len() != KEY_SIZE {
            anyhow::bail!(
                "decrypted key has wrong size: {} bytes (expected {})",
                plaintext.len(),
                KEY_SIZE
            );
        }
        let mut out = [0u8; KEY_SIZE];
        out.copy_from_slice(&plaintext);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = [9u8; KEY_SIZE];
        let sealed = EncryptedData::seal(&key, b"hello").unwrap();
        assert_eq!(sealed.version, EncryptionVersion::XCHACHA20_POLY1305);
        assert_eq!(sealed.nonce.len(), NONCE_SIZE);
        assert_eq!(sealed.data.len(), 5 + TAG_SIZE);
        assert_eq!(sealed.open(&key).unwrap().as_slice(), b"hello");
    }

    #[test]
    fn test_open_wrong_key() {
        let sealed = EncryptedData::seal(&[1u8; KEY_SIZE], b"secret").unwrap();
        assert!(sealed.open(&[2u8; KEY_SIZE]).is_err());
    }

    #[test]
    fn test_open_tampered() {
        let key = [1u8; KEY_SIZE];
        let mut sealed = EncryptedData::seal(&key, b"secret").unwrap();
        sealed.data[0] ^= 0xFF;
        assert!(sealed.open(&key).is_err());
    }

    #[test]
    fn test_open_rejects_unknown_version() {
        let key = [1u8; KEY_SIZE];
        let mut sealed = EncryptedData::seal(&key, b"secret").unwrap();
        sealed.version = EncryptionVersion(7);
        let err = sealed.open(&key).unwrap_err();
        assert!(err.to_string().contains("unsupported encryption version"));
    }

    #[test]
    fn test_open_key_rejects_wrong_length() {
        let key = [1u8; KEY_SIZE];
        let sealed = EncryptedData::seal(&key, &[0u8; 16]).unwrap();
        assert!(sealed.open_key(&key).is_err());
    }

    #[test]
    fn test_short_field_tags() {
        let sealed = EncryptedData::seal(&[1u8; KEY_SIZE], b"x").unwrap();
        let json = serde_json::to_value(&sealed).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 3);
        assert!(obj.contains_key("v") && obj.contains_key("e") && obj.contains_key("n"));
    }
}
