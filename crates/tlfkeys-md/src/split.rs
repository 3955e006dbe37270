//! KeySplitter: one device's share of a TLF crypt key.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tlfkeys_core::{TlfKeysError, TlfKeysResult, UnknownFields, UserId};
use tlfkeys_crypto::{
    mask_tlf_crypt_key, CryptPublicKey, CryptoPure, EncryptedClientHalf, EphemeralPrivateKey,
    ServerHalf, ServerHalfId, TlfCryptKey,
};
use tracing::debug;

/// Missing-device count at which splitting moves onto the rayon pool.
pub const DEFAULT_PARALLEL_SPLIT_THRESHOLD: usize = 8;

/// What one device needs (besides its server half) to recover a crypt key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlfCryptKeyInfo {
    #[serde(rename = "c")]
    pub client_half: EncryptedClientHalf,
    #[serde(rename = "s")]
    pub server_half_id: ServerHalfId,
    /// Position of the ephemeral public key in the owning bundle.
    #[serde(rename = "i", default, skip_serializing_if = "is_zero")]
    pub ephemeral_index: i32,
    #[serde(flatten)]
    pub unknown: UnknownFields,
}

fn is_zero(index: &i32) -> bool {
    *index == 0
}

/// Split `key` for one device: a fresh random server half, and the matching
/// client half boxed to `device` under the rekey's ephemeral key.
pub fn split_tlf_crypt_key<C: CryptoPure + ?Sized>(
    crypto: &C,
    uid: &UserId,
    key: &TlfCryptKey,
    ephemeral: &EphemeralPrivateKey,
    ephemeral_index: i32,
    device: &CryptPublicKey,
) -> TlfKeysResult<(TlfCryptKeyInfo, ServerHalf)> {
    if ephemeral_index < 0 {
        return Err(TlfKeysError::negative_index(ephemeral_index));
    }

    let server_half = crypto
        .make_random_server_half()
        .map_err(TlfKeysError::Crypto)?;
    let client_half = mask_tlf_crypt_key(&server_half, key);
    let client_half = crypto
        .encrypt_client_half(ephemeral, device, &client_half)
        .map_err(TlfKeysError::Crypto)?;
    let server_half_id = crypto
        .server_half_id(uid, device, &server_half)
        .map_err(TlfKeysError::Crypto)?;

    let info = TlfCryptKeyInfo {
        client_half,
        server_half_id,
        ephemeral_index,
        unknown: UnknownFields::new(),
    };
    Ok((info, server_half))
}

/// Binds a crypto implementation to a splitting policy.
pub struct KeySplitter<'a, C: ?Sized> {
    crypto: &'a C,
    parallel_threshold: Option<usize>,
}

impl<'a, C: CryptoPure + ?Sized> KeySplitter<'a, C> {
    pub fn new(crypto: &'a C) -> Self {
        Self {
            crypto,
            parallel_threshold: Some(DEFAULT_PARALLEL_SPLIT_THRESHOLD),
        }
    }

    /// Never fan out, regardless of device count.
    pub fn sequential(crypto: &'a C) -> Self {
        Self {
            crypto,
            parallel_threshold: None,
        }
    }

    pub fn with_parallel_threshold(mut self, threshold: Option<usize>) -> Self {
        self.parallel_threshold = threshold;
        self
    }

    pub fn crypto(&self) -> &'a C {
        self.crypto
    }

    pub fn split(
        &self,
        uid: &UserId,
        key: &TlfCryptKey,
        ephemeral: &EphemeralPrivateKey,
        ephemeral_index: i32,
        device: &CryptPublicKey,
    ) -> TlfKeysResult<(TlfCryptKeyInfo, ServerHalf)> {
        split_tlf_crypt_key(self.crypto, uid, key, ephemeral, ephemeral_index, device)
    }

    /// Split for every device in `devices`. Fails as a whole if any split
    /// fails; results come back in input order.
    pub(crate) fn split_devices(
        &self,
        uid: &UserId,
        key: &TlfCryptKey,
        ephemeral: &EphemeralPrivateKey,
        ephemeral_index: i32,
        devices: &[CryptPublicKey],
    ) -> TlfKeysResult<Vec<(CryptPublicKey, TlfCryptKeyInfo, ServerHalf)>> {
        let split_one = |device: &CryptPublicKey| {
            self.split(uid, key, ephemeral, ephemeral_index, device)
                .map(|(info, half)| (*device, info, half))
        };

        match self.parallel_threshold {
            Some(threshold) if devices.len() >= threshold.max(2) => {
                debug!(%uid, devices = devices.len(), "splitting crypt key in parallel");
                devices.par_iter().map(split_one).collect()
            }
            _ => devices.iter().map(split_one).collect(),
        }
    }
}
