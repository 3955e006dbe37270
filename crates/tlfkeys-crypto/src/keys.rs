//! Key material: secret 256-bit keys, X25519 key pairs, and the
//! server-half/client-half split of a TLF crypt key.

use rand::RngCore;
use tlfkeys_core::byte_array_type;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::KEY_SIZE;

macro_rules! secret_key_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name {
            bytes: [u8; KEY_SIZE],
        }

        impl $name {
            pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
                Self { bytes }
            }

            pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
                &self.bytes
            }

            pub fn is_zero(&self) -> bool {
                self.bytes.iter().all(|b| *b == 0)
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                self.bytes.zeroize();
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("bytes", &"[REDACTED]")
                    .finish()
            }
        }
    };
}

secret_key_type! {
    /// Symmetric key protecting one key generation of a folder. Zeroized on drop.
    TlfCryptKey
}

secret_key_type! {
    /// Random half of a split crypt key, stored by the metadata server.
    ServerHalf
}

secret_key_type! {
    /// `server half XOR crypt key`; only ever stored encrypted to a device.
    ClientHalf
}

secret_key_type! {
    /// Folder private key (X25519), paired with the bundle's `TlfPublicKey`.
    TlfPrivateKey
}

secret_key_type! {
    /// Device encryption private key (X25519).
    CryptPrivateKey
}

secret_key_type! {
    /// Per-rekey ephemeral private key (X25519).
    EphemeralPrivateKey
}

byte_array_type! {
    /// Folder public key recorded in the writer bundle.
    pub struct TlfPublicKey([u8; 32]);
}

byte_array_type! {
    /// Device encryption public key; indexes device key maps.
    pub struct CryptPublicKey([u8; 32]);
}

byte_array_type! {
    /// Public half of a rekey's ephemeral key pair, recorded in bundles.
    pub struct EphemeralPublicKey([u8; 32]);
}

impl TlfCryptKey {
    /// The zero key, passed as "current key" when a folder has no generation yet.
    pub fn zero() -> Self {
        Self::from_bytes([0u8; KEY_SIZE])
    }
}

impl Default for TlfCryptKey {
    fn default() -> Self {
        Self::zero()
    }
}

fn random_key_bytes() -> [u8; KEY_SIZE] {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

fn x25519_public(secret: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    let secret = StaticSecret::from(*secret);
    X25519PublicKey::from(&secret).to_bytes()
}

impl CryptPrivateKey {
    pub fn generate() -> Self {
        Self::from_bytes(random_key_bytes())
    }

    pub fn public_key(&self) -> CryptPublicKey {
        CryptPublicKey::from_bytes(x25519_public(&self.bytes))
    }
}

impl EphemeralPrivateKey {
    pub fn generate() -> Self {
        Self::from_bytes(random_key_bytes())
    }

    pub fn public_key(&self) -> EphemeralPublicKey {
        EphemeralPublicKey::from_bytes(x25519_public(&self.bytes))
    }
}

impl TlfPrivateKey {
    pub fn generate() -> Self {
        Self::from_bytes(random_key_bytes())
    }

    pub fn public_key(&self) -> TlfPublicKey {
        TlfPublicKey::from_bytes(x25519_public(&self.bytes))
    }
}

/// Generate a random 256-bit TLF crypt key.
pub fn generate_tlf_crypt_key() -> TlfCryptKey {
    TlfCryptKey::from_bytes(random_key_bytes())
}

pub fn generate_crypt_keypair() -> (CryptPublicKey, CryptPrivateKey) {
    let private = CryptPrivateKey::generate();
    (private.public_key(), private)
}

pub fn generate_ephemeral_keypair() -> (EphemeralPublicKey, EphemeralPrivateKey) {
    let private = EphemeralPrivateKey::generate();
    (private.public_key(), private)
}

pub fn generate_tlf_keypair() -> (TlfPublicKey, TlfPrivateKey) {
    let private = TlfPrivateKey::generate();
    (private.public_key(), private)
}

fn xor(a: &[u8; KEY_SIZE], b: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    let mut out = [0u8; KEY_SIZE];
    for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b.iter())) {
        *o = x ^ y;
    }
    out
}

/// `client half = server half XOR key`
pub fn mask_tlf_crypt_key(server_half: &ServerHalf, key: &TlfCryptKey) -> ClientHalf {
    ClientHalf::from_bytes(xor(server_half.as_bytes(), key.as_bytes()))
}

/// `key = client half XOR server half`
pub fn unmask_tlf_crypt_key(server_half: &ServerHalf, client_half: &ClientHalf) -> TlfCryptKey {
    TlfCryptKey::from_bytes(xor(server_half.as_bytes(), client_half.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_crypt_key_generation() {
        let k1 = generate_tlf_crypt_key();
        let k2 = generate_tlf_crypt_key();
        assert_ne!(k1.as_bytes(), k2.as_bytes(), "random keys must differ");
        assert!(!k1.is_zero());
        assert!(TlfCryptKey::zero().is_zero());
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = TlfCryptKey::from_bytes([7u8; KEY_SIZE]);
        let dbg = format!("{key:?}");
        assert!(dbg.contains("REDACTED"));
        assert!(!dbg.contains('7'));
    }

    #[test]
    fn test_public_key_is_stable() {
        let private = CryptPrivateKey::from_bytes([3u8; KEY_SIZE]);
        assert_eq!(private.public_key(), private.public_key());
        assert_ne!(
            private.public_key(),
            CryptPrivateKey::from_bytes([4u8; KEY_SIZE]).public_key()
        );
    }

    #[test]
    fn test_public_key_json_map_key() {
        let (public, _) = generate_crypt_keypair();
        let mut map = std::collections::BTreeMap::new();
        map.insert(public, 1u8);
        let json = serde_json::to_string(&map).unwrap();
        let back: std::collections::BTreeMap<CryptPublicKey, u8> =
            serde_json::from_str(&json).unwrap();
        assert_eq!(map, back);
    }

    proptest! {
        #[test]
        fn mask_unmask_roundtrip(key in any::<[u8; 32]>(), half in any::<[u8; 32]>()) {
            let key = TlfCryptKey::from_bytes(key);
            let server = ServerHalf::from_bytes(half);
            let client = mask_tlf_crypt_key(&server, &key);
            let back = unmask_tlf_crypt_key(&server, &client);
            prop_assert_eq!(key.as_bytes(), back.as_bytes());
        }
    }
}
