//! Key derivation: HKDF-SHA256 with per-purpose domain labels

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::KEY_SIZE;

/// Box key for a client half, derived from an X25519 shared secret.
pub const CLIENT_HALF_DOMAIN: &[u8] = b"tlfkeys-client-half-v1";

/// Key that seals the previous generation's crypt key.
pub const HISTORIC_KEY_DOMAIN: &[u8] = b"tlfkeys-historic-key-v1";

/// Prefix mixed into every ServerHalfId.
pub const SERVER_HALF_ID_DOMAIN: &[u8] = b"tlfkeys-server-half-id-v1";

/// HKDF-SHA256 key derivation with a domain-specific info string.
pub fn hkdf_derive(ikm: &[u8; KEY_SIZE], info: &[u8]) -> anyhow::Result<Zeroizing<[u8; KEY_SIZE]>> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = Zeroizing::new([0u8; KEY_SIZE]);
    hkdf.expand(info, &mut okm[..])
        .map_err(|e| anyhow::anyhow!("HKDF expand failed: {e}"))?;
    Ok(okm)
}
