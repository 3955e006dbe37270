use tlfkeys_core::{byte_array_type, UserId};

use crate::kdf::SERVER_HALF_ID_DOMAIN;
use crate::keys::{CryptPublicKey, ServerHalf};

byte_array_type! {
    /// Handle for a server half, used to ask the server to delete it.
    ///
    /// Keyed by the server half itself, so it reveals nothing about the half
    /// while still binding the (user, device) it was issued for.
    pub struct ServerHalfId([u8; 32]);
}

pub fn server_half_id(uid: &UserId, device: &CryptPublicKey, half: &ServerHalf) -> ServerHalfId {
    let uid = uid.as_str().as_bytes();
    let mut hasher = blake3::Hasher::new_keyed(half.as_bytes());
    hasher.update(SERVER_HALF_ID_DOMAIN);
    hasher.update(&(uid.len() as u64).to_be_bytes());
    hasher.update(uid);
    hasher.update(device.as_bytes());
    ServerHalfId::from_bytes(*hasher.finalize().as_bytes())
}
