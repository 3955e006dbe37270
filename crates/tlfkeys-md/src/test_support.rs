//! Shared fixtures for unit tests.

use tlfkeys_core::UserId;
use tlfkeys_crypto::{
    ClientHalf, CryptPrivateKey, CryptPublicKey, CryptoPure, EncryptedClientHalf, EncryptedData,
    EphemeralPrivateKey, EphemeralPublicKey, ServerHalf, ServerHalfId, SignatureInfo, StdCrypto,
    TlfCryptKey,
};

/// Delegates to `StdCrypto` except that server half generation always fails.
pub struct FailingCrypto;

impl CryptoPure for FailingCrypto {
    fn make_random_server_half(&self) -> anyhow::Result<ServerHalf> {
        anyhow::bail!("entropy source unavailable")
    }

    fn encrypt_client_half(
        &self,
        ephemeral: &EphemeralPrivateKey,
        device: &CryptPublicKey,
        client_half: &ClientHalf,
    ) -> anyhow::Result<EncryptedClientHalf> {
        StdCrypto.encrypt_client_half(ephemeral, device, client_half)
    }

    fn decrypt_client_half(
        &self,
        device: &CryptPrivateKey,
        ephemeral: &EphemeralPublicKey,
        encrypted: &EncryptedClientHalf,
    ) -> anyhow::Result<ClientHalf> {
        StdCrypto.decrypt_client_half(device, ephemeral, encrypted)
    }

    fn server_half_id(
        &self,
        uid: &UserId,
        device: &CryptPublicKey,
        half: &ServerHalf,
    ) -> anyhow::Result<ServerHalfId> {
        StdCrypto.server_half_id(uid, device, half)
    }

    fn encrypt_historic_key(
        &self,
        previous: &TlfCryptKey,
        next: &TlfCryptKey,
    ) -> anyhow::Result<EncryptedData> {
        StdCrypto.encrypt_historic_key(previous, next)
    }

    fn decrypt_historic_key(
        &self,
        link: &EncryptedData,
        next: &TlfCryptKey,
    ) -> anyhow::Result<TlfCryptKey> {
        StdCrypto.decrypt_historic_key(link, next)
    }

    fn verify(&self, msg: &[u8], sig: &SignatureInfo) -> anyhow::Result<()> {
        StdCrypto.verify(msg, sig)
    }
}

/// A device key that is stable across runs, for map-shape assertions.
pub fn fake_device(tag: u8) -> CryptPublicKey {
    CryptPublicKey::from_bytes([tag; 32])
}

pub fn fake_half(tag: u8) -> ServerHalf {
    let mut bytes = [0u8; 32];
    bytes[0] = tag;
    ServerHalf::from_bytes(bytes)
}
