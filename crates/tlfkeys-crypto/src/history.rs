//! Historic key links.
//!
//! Generation g's crypt key is sealed under a key derived from generation
//! g+1's crypt key. Anyone holding the latest key can walk the links
//! backward to any earlier generation; nobody can walk forward.

use crate::encrypted::EncryptedData;
use crate::kdf::{hkdf_derive, HISTORIC_KEY_DOMAIN};
use crate::keys::TlfCryptKey;

pub fn encrypt_historic_key(
    previous: &TlfCryptKey,
    next: &TlfCryptKey,
) -> anyhow::Result<EncryptedData> {
    let link_key = hkdf_derive(next.as_bytes(), HISTORIC_KEY_DOMAIN)?;
    EncryptedData::seal(&link_key, previous.as_bytes())
}

pub fn decrypt_historic_key(link: &EncryptedData, next: &TlfCryptKey) -> anyhow::Result<TlfCryptKey> {
    let link_key = hkdf_derive(next.as_bytes(), HISTORIC_KEY_DOMAIN)?;
    let bytes = link
        .open_key(&link_key)
        .map_err(|e| anyhow::anyhow!("historic key link: {e}"))?;
    Ok(TlfCryptKey::from_bytes(bytes))
}
