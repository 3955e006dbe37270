//! Client-half boxes: a client half encrypted to one device under a rekey's
//! ephemeral key.

use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::encrypted::EncryptedData;
use crate::kdf::{hkdf_derive, CLIENT_HALF_DOMAIN};
use crate::keys::{ClientHalf, CryptPrivateKey, CryptPublicKey, EphemeralPrivateKey, EphemeralPublicKey};
use crate::KEY_SIZE;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncryptedClientHalf(pub EncryptedData);

/// X25519 agreement followed by HKDF; both sides of the box derive the same key.
fn box_key(
    secret: &[u8; KEY_SIZE],
    public: &[u8; KEY_SIZE],
) -> anyhow::Result<Zeroizing<[u8; KEY_SIZE]>> {
    let secret = StaticSecret::from(*secret);
    let shared = secret.diffie_hellman(&X25519PublicKey::from(*public));
    if !shared.was_contributory() {
        anyhow::bail!("key agreement produced a non-contributory shared secret");
    }
    hkdf_derive(shared.as_bytes(), CLIENT_HALF_DOMAIN)
}

pub fn encrypt_client_half(
    ephemeral: &EphemeralPrivateKey,
    device: &CryptPublicKey,
    client_half: &ClientHalf,
) -> anyhow::Result<EncryptedClientHalf> {
    let key = box_key(ephemeral.as_bytes(), device.as_bytes())?;
    Ok(EncryptedClientHalf(EncryptedData::seal(
        &key,
        client_half.as_bytes(),
    )?))
}

pub fn decrypt_client_half(
    device: &CryptPrivateKey,
    ephemeral: &EphemeralPublicKey,
    encrypted: &EncryptedClientHalf,
) -> anyhow::Result<ClientHalf> {
    let key = box_key(device.as_bytes(), ephemeral.as_bytes())?;
    let bytes = encrypted
        .0
        .open_key(&key)
        .map_err(|e| anyhow::anyhow!("client half: {e}"))?;
    Ok(ClientHalf::from_bytes(bytes))
}
