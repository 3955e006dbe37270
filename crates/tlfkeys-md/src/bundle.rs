//! Writer and reader key bundles for one key generation.

use serde::{Deserialize, Serialize};
use tlfkeys_core::{byte_array_type, Codec, TlfKeysError, TlfKeysResult, UnknownFields, UserId};
use tlfkeys_crypto::{
    CryptPublicKey, CryptoPure, EncryptedClientHalf, EncryptedData, EphemeralPrivateKey,
    EphemeralPublicKey, ServerHalfId, TlfCryptKey, TlfPublicKey,
};

use crate::device_map::{UserDeviceKeyInfoMap, UserDeviceKeyServerHalves, UserDevicePublicKeys};
use crate::split::KeySplitter;

/// Everything a device needs from a bundle to ask for its server half and
/// unbox its client half.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptKeyParams {
    pub ephemeral_public_key: EphemeralPublicKey,
    pub client_half: EncryptedClientHalf,
    pub server_half_id: ServerHalfId,
}

/// Behavior shared by writer and reader bundles.
pub trait KeyBundle {
    fn keys(&self) -> &UserDeviceKeyInfoMap;

    fn keys_mut(&mut self) -> &mut UserDeviceKeyInfoMap;

    fn ephemeral_public_keys(&self) -> &[EphemeralPublicKey];

    fn push_ephemeral_public_key(&mut self, key: EphemeralPublicKey);

    fn ephemeral_public_key(&self, index: i32) -> TlfKeysResult<EphemeralPublicKey> {
        let keys = self.ephemeral_public_keys();
        let pos = usize::try_from(index).map_err(|_| TlfKeysError::negative_index(index))?;
        keys.get(pos)
            .copied()
            .ok_or_else(|| TlfKeysError::index_out_of_range(index, keys.len()))
    }

    /// With `device = None`, any device of `uid` counts.
    fn is_member(&self, uid: &UserId, device: Option<&CryptPublicKey>) -> bool {
        match (self.keys().get(uid), device) {
            (Some(dkim), Some(device)) => dkim.contains_key(device),
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    fn crypt_key_params(
        &self,
        uid: &UserId,
        device: &CryptPublicKey,
    ) -> TlfKeysResult<Option<CryptKeyParams>> {
        let Some(info) = self.keys().get(uid).and_then(|dkim| dkim.get(device)) else {
            return Ok(None);
        };
        let ephemeral_public_key = self.ephemeral_public_key(info.ephemeral_index)?;
        Ok(Some(CryptKeyParams {
            ephemeral_public_key,
            client_half: info.client_half.clone(),
            server_half_id: info.server_half_id,
        }))
    }

    /// Every device entry must point at an ephemeral key this bundle holds.
    fn validate_ephemeral_indices(&self) -> TlfKeysResult<()> {
        for dkim in self.keys().values() {
            for info in dkim.values() {
                self.ephemeral_public_key(info.ephemeral_index)?;
            }
        }
        Ok(())
    }

    /// Split `key` for every missing device in `targets`. The new entries
    /// point at the next ephemeral key slot, which is only used (and
    /// `ephemeral_public_key` only appended) when at least one split was made.
    fn fill_in<C: CryptoPure + ?Sized>(
        &mut self,
        splitter: &KeySplitter<'_, C>,
        targets: &UserDevicePublicKeys,
        ephemeral_public_key: EphemeralPublicKey,
        ephemeral_private_key: &EphemeralPrivateKey,
        key: &TlfCryptKey,
    ) -> TlfKeysResult<UserDeviceKeyServerHalves>
    where
        Self: Sized,
    {
        let len = self.ephemeral_public_keys().len();
        let index = i32::try_from(len)
            .map_err(|_| TlfKeysError::precondition("bundle has too many ephemeral keys"))?;

        let halves =
            self.keys_mut()
                .fill_in_user_infos(splitter, index, targets, ephemeral_private_key, key)?;
        if !halves.is_empty() {
            self.push_ephemeral_public_key(ephemeral_public_key);
        }
        Ok(halves)
    }
}

fn is_empty_map(map: &UserDeviceKeyInfoMap) -> bool {
    map.is_empty()
}

// ── Writer bundle ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterKeyBundle {
    #[serde(rename = "wKeys", default)]
    pub keys: UserDeviceKeyInfoMap,
    #[serde(rename = "pubKey")]
    pub tlf_public_key: TlfPublicKey,
    #[serde(rename = "ePubKey", default, skip_serializing_if = "Vec::is_empty")]
    pub ephemeral_public_keys: Vec<EphemeralPublicKey>,
    /// Historic key links for generations FIRST..this one, oldest first.
    /// Only populated in the segregated format.
    #[serde(rename = "oldKeys", default, skip_serializing_if = "Vec::is_empty")]
    pub historic_tlf_crypt_keys: Vec<EncryptedData>,
    #[serde(flatten)]
    pub unknown: UnknownFields,
}

impl WriterKeyBundle {
    pub fn new(tlf_public_key: TlfPublicKey) -> Self {
        Self {
            tlf_public_key,
            ..Default::default()
        }
    }
}

impl KeyBundle for WriterKeyBundle {
    fn keys(&self) -> &UserDeviceKeyInfoMap {
        &self.keys
    }

    fn keys_mut(&mut self) -> &mut UserDeviceKeyInfoMap {
        &mut self.keys
    }

    fn ephemeral_public_keys(&self) -> &[EphemeralPublicKey] {
        &self.ephemeral_public_keys
    }

    fn push_ephemeral_public_key(&mut self, key: EphemeralPublicKey) {
        self.ephemeral_public_keys.push(key);
    }
}

// ── Reader bundle ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderKeyBundle {
    /// May be empty; an empty map is omitted on encode so that it hashes
    /// the same as a missing one.
    #[serde(rename = "rKeys", default, skip_serializing_if = "is_empty_map")]
    pub keys: UserDeviceKeyInfoMap,
    #[serde(rename = "rEPubKey", default, skip_serializing_if = "Vec::is_empty")]
    pub ephemeral_public_keys: Vec<EphemeralPublicKey>,
    #[serde(flatten)]
    pub unknown: UnknownFields,
}

impl KeyBundle for ReaderKeyBundle {
    fn keys(&self) -> &UserDeviceKeyInfoMap {
        &self.keys
    }

    fn keys_mut(&mut self) -> &mut UserDeviceKeyInfoMap {
        &mut self.keys
    }

    fn ephemeral_public_keys(&self) -> &[EphemeralPublicKey] {
        &self.ephemeral_public_keys
    }

    fn push_ephemeral_public_key(&mut self, key: EphemeralPublicKey) {
        self.ephemeral_public_keys.push(key);
    }
}

// ── Bundle IDs ───────────────────────────────────────────────────────────

byte_array_type! {
    /// BLAKE3 of an encoded writer bundle.
    pub struct WriterKeyBundleId([u8; 32]);
}

byte_array_type! {
    /// BLAKE3 of an encoded reader bundle.
    pub struct ReaderKeyBundleId([u8; 32]);
}

/// A writer bundle without any user is rejected; a folder always has at
/// least one writer.
pub fn make_writer_key_bundle_id<C: Codec>(
    codec: &C,
    bundle: &WriterKeyBundle,
) -> TlfKeysResult<WriterKeyBundleId> {
    if bundle.keys.is_empty() {
        return Err(TlfKeysError::precondition(
            "writer key bundle has no writer keys",
        ));
    }
    let encoded = codec.encode(bundle)?;
    Ok(WriterKeyBundleId::from_bytes(*blake3::hash(&encoded).as_bytes()))
}

pub fn make_reader_key_bundle_id<C: Codec>(
    codec: &C,
    bundle: &ReaderKeyBundle,
) -> TlfKeysResult<ReaderKeyBundleId> {
    let encoded = codec.encode(bundle)?;
    Ok(ReaderKeyBundleId::from_bytes(*blake3::hash(&encoded).as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_map::{DeviceKeyInfoMap, DevicePublicKeys};
    use crate::split::TlfCryptKeyInfo;
    use crate::test_support::fake_device;
    use tlfkeys_core::JsonCodec;
    use tlfkeys_crypto::{
        generate_crypt_keypair, generate_ephemeral_keypair, generate_tlf_crypt_key,
        generate_tlf_keypair, StdCrypto,
    };

    #[test]
    fn test_writer_bundle_id_requires_keys() {
        let codec = JsonCodec;
        let mut wkb = WriterKeyBundle::default();
        assert!(matches!(
            make_writer_key_bundle_id(&codec, &wkb),
            Err(TlfKeysError::Precondition(_))
        ));

        wkb.keys.insert(UserId::new("u"), DeviceKeyInfoMap::new());
        make_writer_key_bundle_id(&codec, &wkb).unwrap();
    }

    #[test]
    fn test_reader_bundle_id_nil_vs_empty() {
        let codec = JsonCodec;
        let nil: ReaderKeyBundle = codec.decode(b"{}").unwrap();
        let empty: ReaderKeyBundle = codec.decode(br#"{"rKeys":{}}"#).unwrap();
        assert_eq!(
            make_reader_key_bundle_id(&codec, &nil).unwrap(),
            make_reader_key_bundle_id(&codec, &empty).unwrap()
        );
        assert_eq!(
            make_reader_key_bundle_id(&codec, &ReaderKeyBundle::default()).unwrap(),
            make_reader_key_bundle_id(&codec, &empty).unwrap()
        );
    }

    #[test]
    fn test_unknown_fields_change_bundle_id_and_survive() {
        let codec = JsonCodec;
        let wire = br#"{"rKeys":{},"zFuture":[1,2,3]}"#;
        let rkb: ReaderKeyBundle = codec.decode(wire).unwrap();
        assert_eq!(rkb.unknown["zFuture"], serde_json::json!([1, 2, 3]));

        let reencoded: ReaderKeyBundle = codec.decode(&codec.encode(&rkb).unwrap()).unwrap();
        assert_eq!(rkb, reencoded);
        assert_ne!(
            make_reader_key_bundle_id(&codec, &rkb).unwrap(),
            make_reader_key_bundle_id(&codec, &ReaderKeyBundle::default()).unwrap()
        );
    }

    #[test]
    fn test_ephemeral_index_bounds() {
        let mut rkb = ReaderKeyBundle::default();
        let (eph_pub, _) = generate_ephemeral_keypair();
        rkb.push_ephemeral_public_key(eph_pub);

        assert_eq!(rkb.ephemeral_public_key(0).unwrap(), eph_pub);
        assert!(matches!(
            rkb.ephemeral_public_key(1),
            Err(TlfKeysError::InvalidIndex { index: 1, .. })
        ));
        assert!(matches!(
            rkb.ephemeral_public_key(-1),
            Err(TlfKeysError::InvalidIndex { index: -1, .. })
        ));
    }

    #[test]
    fn test_validate_rejects_dangling_index() {
        let mut rkb = ReaderKeyBundle::default();
        let dkim: DeviceKeyInfoMap = [(
            fake_device(1),
            TlfCryptKeyInfo {
                ephemeral_index: 0,
                ..Default::default()
            },
        )]
        .into_iter()
        .collect();
        rkb.keys.insert(UserId::new("r"), dkim);
        assert!(rkb.validate_ephemeral_indices().is_err());

        rkb.push_ephemeral_public_key(generate_ephemeral_keypair().0);
        rkb.validate_ephemeral_indices().unwrap();
    }

    #[test]
    fn test_fill_in_appends_ephemeral_key_only_when_used() {
        let splitter = KeySplitter::new(&StdCrypto);
        let (tlf_pub, _) = generate_tlf_keypair();
        let key = generate_tlf_crypt_key();
        let uid = UserId::new("w");
        let (device, _) = generate_crypt_keypair();
        let targets: UserDevicePublicKeys =
            [(uid.clone(), DevicePublicKeys::from([device]))].into();

        let mut wkb = WriterKeyBundle::new(tlf_pub);
        let (eph_pub, eph_priv) = generate_ephemeral_keypair();
        let halves = wkb
            .fill_in(&splitter, &targets, eph_pub, &eph_priv, &key)
            .unwrap();
        assert_eq!(halves.len(), 1);
        assert_eq!(wkb.ephemeral_public_keys, vec![eph_pub]);

        let (eph_pub2, eph_priv2) = generate_ephemeral_keypair();
        let halves = wkb
            .fill_in(&splitter, &targets, eph_pub2, &eph_priv2, &key)
            .unwrap();
        assert!(halves.is_empty());
        assert_eq!(wkb.ephemeral_public_keys.len(), 1);

        let params = wkb.crypt_key_params(&uid, &device).unwrap().unwrap();
        assert_eq!(params.ephemeral_public_key, eph_pub);
        assert!(wkb.is_member(&uid, Some(&device)));
        assert!(wkb.is_member(&uid, None));
        assert!(!wkb.is_member(&UserId::new("other"), None));
        assert!(wkb.crypt_key_params(&uid, &fake_device(9)).unwrap().is_none());
    }
}
