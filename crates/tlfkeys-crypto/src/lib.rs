//! tlfkeys-crypto: key material for folder key bundles
//!
//! A folder's content key never leaves a client in the clear. Each device
//! gets its own split:
//!
//! ```text
//! TLF crypt key (per key generation, 256-bit random)
//!   ├── Server half (256-bit random, held by the metadata server)
//!   │   └── ServerHalfId = BLAKE3-keyed(server half; uid || device key)
//!   ├── Client half = server half XOR crypt key
//!   │   └── Box: X25519(ephemeral, device) → HKDF-SHA256 → XChaCha20-Poly1305
//!   └── Historic link: previous generation's key sealed under
//!       HKDF(this generation's key, domain="tlfkeys-historic-key")
//! ```
//!
//! Writer metadata is signed with Ed25519 device signing keys.

pub mod encrypted;
pub mod history;
pub mod kdf;
pub mod keys;
pub mod pure;
pub mod seal;
pub mod server_half;
pub mod signing;

pub use encrypted::{EncryptedData, EncryptionVersion};
pub use history::{decrypt_historic_key, encrypt_historic_key};
pub use keys::{
    generate_crypt_keypair, generate_ephemeral_keypair, generate_tlf_crypt_key,
    generate_tlf_keypair, mask_tlf_crypt_key, unmask_tlf_crypt_key, ClientHalf, CryptPrivateKey,
    CryptPublicKey, EphemeralPrivateKey, EphemeralPublicKey, ServerHalf, TlfCryptKey,
    TlfPrivateKey, TlfPublicKey,
};
pub use pure::{CryptoPure, StdCrypto};
pub use seal::{decrypt_client_half, encrypt_client_half, EncryptedClientHalf};
pub use server_half::{server_half_id, ServerHalfId};
pub use signing::{SignatureInfo, Signer, SigningKey, VerifyingKey};

/// Size of every symmetric and X25519 key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;
