//! The stateless crypto capability consumed by key splitting and metadata
//! validation. Implementations must be shareable across threads so device
//! splits can fan out.

use rand::RngCore;
use tlfkeys_core::UserId;

use crate::encrypted::EncryptedData;
use crate::keys::{
    ClientHalf, CryptPrivateKey, CryptPublicKey, EphemeralPrivateKey, EphemeralPublicKey,
    ServerHalf, TlfCryptKey,
};
use crate::seal::EncryptedClientHalf;
use crate::server_half::ServerHalfId;
use crate::signing::SignatureInfo;
use crate::KEY_SIZE;

pub trait CryptoPure: Send + Sync {
    fn make_random_server_half(&self) -> anyhow::Result<ServerHalf>;

    fn encrypt_client_half(
        &self,
        ephemeral: &EphemeralPrivateKey,
        device: &CryptPublicKey,
        client_half: &ClientHalf,
    ) -> anyhow::Result<EncryptedClientHalf>;

    fn decrypt_client_half(
        &self,
        device: &CryptPrivateKey,
        ephemeral: &EphemeralPublicKey,
        encrypted: &EncryptedClientHalf,
    ) -> anyhow::Result<ClientHalf>;

    fn server_half_id(
        &self,
        uid: &UserId,
        device: &CryptPublicKey,
        half: &ServerHalf,
    ) -> anyhow::Result<ServerHalfId>;

    fn encrypt_historic_key(
        &self,
        previous: &TlfCryptKey,
        next: &TlfCryptKey,
    ) -> anyhow::Result<EncryptedData>;

    fn decrypt_historic_key(
        &self,
        link: &EncryptedData,
        next: &TlfCryptKey,
    ) -> anyhow::Result<TlfCryptKey>;

    fn verify(&self, msg: &[u8], sig: &SignatureInfo) -> anyhow::Result<()>;
}

/// Default implementation backed by the OS-seeded thread RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdCrypto;

impl CryptoPure for StdCrypto {
    fn make_random_server_half(&self) -> anyhow::Result<ServerHalf> {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng()
            .try_fill_bytes(&mut bytes)
            .map_err(|e| anyhow::anyhow!("server half generation failed: {e}"))?;
        Ok(ServerHalf::from_bytes(bytes))
    }

    fn encrypt_client_half(
        &self,
        ephemeral: &EphemeralPrivateKey,
        device: &CryptPublicKey,
        client_half: &ClientHalf,
    ) -> anyhow::Result<EncryptedClientHalf> {
        crate::seal::encrypt_client_half(ephemeral, device, client_half)
    }

    fn decrypt_client_half(
        &self,
        device: &CryptPrivateKey,
        ephemeral: &EphemeralPublicKey,
        encrypted: &EncryptedClientHalf,
    ) -> anyhow::Result<ClientHalf> {
        crate::seal::decrypt_client_half(device, ephemeral, encrypted)
    }

    fn server_half_id(
        &self,
        uid: &UserId,
        device: &CryptPublicKey,
        half: &ServerHalf,
    ) -> anyhow::Result<ServerHalfId> {
        Ok(crate::server_half::server_half_id(uid, device, half))
    }

    fn encrypt_historic_key(
        &self,
        previous: &TlfCryptKey,
        next: &TlfCryptKey,
    ) -> anyhow::Result<EncryptedData> {
        crate::history::encrypt_historic_key(previous, next)
    }

    fn decrypt_historic_key(
        &self,
        link: &EncryptedData,
        next: &TlfCryptKey,
    ) -> anyhow::Result<TlfCryptKey> {
        crate::history::decrypt_historic_key(link, next)
    }

    fn verify(&self, msg: &[u8], sig: &SignatureInfo) -> anyhow::Result<()> {
        sig.verify(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_halves_are_random() {
        let a = StdCrypto.make_random_server_half().unwrap();
        let b = StdCrypto.make_random_server_half().unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_usable_as_trait_object() {
        let crypto: &dyn CryptoPure = &StdCrypto;
        let half = crypto.make_random_server_half().unwrap();
        let uid = UserId::new("u");
        let device = CryptPublicKey::from_bytes([1u8; KEY_SIZE]);
        assert_eq!(
            crypto.server_half_id(&uid, &device, &half).unwrap(),
            crate::server_half::server_half_id(&uid, &device, &half)
        );
    }
}
