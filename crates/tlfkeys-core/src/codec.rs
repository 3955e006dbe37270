//! Encoding capability used for every persisted record.
//!
//! Bundle and metadata identifiers are hashes of the encoded form, so an
//! implementation must be deterministic: the same value always encodes to the
//! same bytes. `JsonCodec` gets that from fixed struct field order and
//! `BTreeMap` everywhere a map appears.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::TlfKeysResult;

/// Fields a record did not recognise when it was decoded.
///
/// Every versioned record flattens one of these so that a newer writer's
/// optional fields survive a decode/encode cycle by an older reader.
pub type UnknownFields = BTreeMap<String, serde_json::Value>;

pub trait Codec: Send + Sync {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> TlfKeysResult<Vec<u8>>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> TlfKeysResult<T>;

    /// Re-encode `value` and decode it as `U`, e.g. to move a record between
    /// two types that share a wire layout.
    fn update<T: Serialize + ?Sized, U: DeserializeOwned>(&self, value: &T) -> TlfKeysResult<U> {
        let bytes = self.encode(value)?;
        self.decode(&bytes)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> TlfKeysResult<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> TlfKeysResult<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Base64 helpers for `Vec<u8>` fields (`#[serde(with = "tlfkeys_core::codec::b64")]`).
pub mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, T>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<[u8]>,
    {
        serializer.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

pub fn encode_base64(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn decode_base64(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(s)
}

/// Declares a fixed-size byte-array newtype that encodes as a base64 string.
///
/// String encoding keeps these usable as JSON map keys, which is how device
/// public keys index a device map.
#[macro_export]
macro_rules! byte_array_type {
    ($(#[$meta:meta])* $vis:vis struct $name:ident([u8; $len:expr]);) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        $vis struct $name([u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub const fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }

            pub fn to_base64(&self) -> String {
                $crate::codec::encode_base64(&self.0)
            }

            pub fn from_base64(s: &str) -> ::std::result::Result<Self, String> {
                let raw = $crate::codec::decode_base64(s).map_err(|e| e.to_string())?;
                let bytes: [u8; $len] = raw.as_slice().try_into().map_err(|_| {
                    format!(
                        "{}: expected {} bytes, got {}",
                        stringify!($name),
                        $len,
                        raw.len()
                    )
                })?;
                Ok(Self(bytes))
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_base64())
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(&self.to_base64())
            }
        }

        impl ::serde::Serialize for $name {
            fn serialize<S: ::serde::Serializer>(
                &self,
                serializer: S,
            ) -> ::std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_base64())
            }
        }

        impl<'de> ::serde::Deserialize<'de> for $name {
            fn deserialize<D: ::serde::Deserializer<'de>>(
                deserializer: D,
            ) -> ::std::result::Result<Self, D::Error> {
                let s = <String as ::serde::Deserialize>::deserialize(deserializer)?;
                Self::from_base64(&s).map_err(::serde::de::Error::custom)
            }
        }
    };
}
