//! Per-device and per-user key info maps.
//!
//! `DeviceKeyInfoMap` is one user's devices for one key generation;
//! `UserDeviceKeyInfoMap` is every user's. Both are `BTreeMap`s underneath so
//! encoding order, and therefore bundle IDs, never depend on insertion order.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};
use tlfkeys_core::{TlfKeysResult, UserId};
use tlfkeys_crypto::{CryptPublicKey, CryptoPure, EphemeralPrivateKey, ServerHalf, TlfCryptKey};
use tracing::debug;

use crate::removal::{ServerHalfRemovalInfo, UserServerHalfRemovalInfo};
use crate::split::{KeySplitter, TlfCryptKeyInfo};

/// A user's current set of device encryption keys.
pub type DevicePublicKeys = BTreeSet<CryptPublicKey>;

/// Every user's current device keys, as resolved by the identity layer.
pub type UserDevicePublicKeys = BTreeMap<UserId, DevicePublicKeys>;

/// Newly created server halves for one user, to be uploaded.
pub type DeviceKeyServerHalves = BTreeMap<CryptPublicKey, ServerHalf>;

pub type UserDeviceKeyServerHalves = BTreeMap<UserId, DeviceKeyServerHalves>;

// ── DeviceKeyInfoMap ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceKeyInfoMap(BTreeMap<CryptPublicKey, TlfCryptKeyInfo>);

impl DeviceKeyInfoMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn public_keys(&self) -> DevicePublicKeys {
        self.0.keys().copied().collect()
    }

    /// Split `key` for every device in `targets` that has no entry yet.
    ///
    /// All splits complete before anything is inserted, so a failure leaves
    /// the map as it was. Devices already present are skipped; calling this
    /// twice with the same targets returns nothing the second time.
    pub fn fill_in_device_infos<C: CryptoPure + ?Sized>(
        &mut self,
        splitter: &KeySplitter<'_, C>,
        uid: &UserId,
        key: &TlfCryptKey,
        ephemeral: &EphemeralPrivateKey,
        ephemeral_index: i32,
        targets: &DevicePublicKeys,
    ) -> TlfKeysResult<DeviceKeyServerHalves> {
        let missing: Vec<CryptPublicKey> = targets
            .iter()
            .filter(|device| !self.0.contains_key(*device))
            .copied()
            .collect();
        if missing.is_empty() {
            return Ok(DeviceKeyServerHalves::new());
        }

        debug!(%uid, missing = missing.len(), ephemeral_index, "filling in device key infos");
        let splits = splitter.split_devices(uid, key, ephemeral, ephemeral_index, &missing)?;

        let mut halves = DeviceKeyServerHalves::new();
        for (device, info, half) in splits {
            self.0.insert(device, info);
            halves.insert(device, half);
        }
        Ok(halves)
    }

    /// Drop devices not in `allowed`, returning their removal record, or
    /// `None` when nothing was dropped.
    fn remove_devices_not_in(
        &mut self,
        allowed: &DevicePublicKeys,
    ) -> Option<UserServerHalfRemovalInfo> {
        let mut removed = BTreeMap::new();
        self.0.retain(|device, info| {
            if allowed.contains(device) {
                true
            } else {
                removed.insert(*device, vec![info.server_half_id]);
                false
            }
        });
        if removed.is_empty() {
            return None;
        }
        Some(UserServerHalfRemovalInfo {
            user_removed: false,
            device_server_half_ids: removed,
        })
    }

    fn into_full_removal(self) -> UserServerHalfRemovalInfo {
        UserServerHalfRemovalInfo {
            user_removed: true,
            device_server_half_ids: self
                .0
                .into_iter()
                .map(|(device, info)| (device, vec![info.server_half_id]))
                .collect(),
        }
    }
}

impl Deref for DeviceKeyInfoMap {
    type Target = BTreeMap<CryptPublicKey, TlfCryptKeyInfo>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for DeviceKeyInfoMap {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl FromIterator<(CryptPublicKey, TlfCryptKeyInfo)> for DeviceKeyInfoMap {
    fn from_iter<I: IntoIterator<Item = (CryptPublicKey, TlfCryptKeyInfo)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for DeviceKeyInfoMap {
    type Item = (CryptPublicKey, TlfCryptKeyInfo);
    type IntoIter = std::collections::btree_map::IntoIter<CryptPublicKey, TlfCryptKeyInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

// ── UserDeviceKeyInfoMap ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserDeviceKeyInfoMap(BTreeMap<UserId, DeviceKeyInfoMap>);

impl UserDeviceKeyInfoMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Project to the device public keys each user currently holds.
    pub fn to_public_keys(&self) -> UserDevicePublicKeys {
        self.0
            .iter()
            .map(|(uid, dkim)| (uid.clone(), dkim.public_keys()))
            .collect()
    }

    /// Ensure every target user and device has an entry for this generation.
    ///
    /// Users not yet present get an empty map first. Only users for whom at
    /// least one new split was made appear in the result.
    pub fn fill_in_user_infos<C: CryptoPure + ?Sized>(
        &mut self,
        splitter: &KeySplitter<'_, C>,
        ephemeral_index: i32,
        targets: &UserDevicePublicKeys,
        ephemeral: &EphemeralPrivateKey,
        key: &TlfCryptKey,
    ) -> TlfKeysResult<UserDeviceKeyServerHalves> {
        let mut server_halves = UserDeviceKeyServerHalves::new();
        for (uid, devices) in targets {
            let dkim = self.0.entry(uid.clone()).or_default();
            let halves =
                dkim.fill_in_device_infos(splitter, uid, key, ephemeral, ephemeral_index, devices)?;
            if !halves.is_empty() {
                server_halves.insert(uid.clone(), halves);
            }
        }
        Ok(server_halves)
    }

    /// Bring the map in line with `membership`.
    ///
    /// A user absent from `membership` is deleted and reported with
    /// `user_removed = true`. A user still listed, even with no devices, keeps
    /// an entry and only loses the devices no longer listed. Users that lose
    /// nothing are not reported.
    pub fn remove_devices_not_in(
        &mut self,
        membership: &UserDevicePublicKeys,
    ) -> ServerHalfRemovalInfo {
        let mut removal = ServerHalfRemovalInfo::new();
        let mut departed = Vec::new();

        for (uid, dkim) in self.0.iter_mut() {
            match membership.get(uid) {
                Some(allowed) => {
                    if let Some(info) = dkim.remove_devices_not_in(allowed) {
                        removal.insert(uid.clone(), info);
                    }
                }
                None => departed.push(uid.clone()),
            }
        }

        for uid in departed {
            if let Some(dkim) = self.0.remove(&uid) {
                removal.insert(uid, dkim.into_full_removal());
            }
        }

        if !removal.is_empty() {
            debug!(users = removal.len(), "removed devices from key info map");
        }
        removal
    }

    /// Move `uid`'s devices in from `other`, keeping entries this map already
    /// has for the same device.
    pub(crate) fn merge_user(&mut self, uid: &UserId, devices: DeviceKeyInfoMap) {
        let dkim = self.0.entry(uid.clone()).or_default();
        for (device, info) in devices {
            dkim.entry(device).or_insert(info);
        }
    }
}

impl Deref for UserDeviceKeyInfoMap {
    type Target = BTreeMap<UserId, DeviceKeyInfoMap>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for UserDeviceKeyInfoMap {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl FromIterator<(UserId, DeviceKeyInfoMap)> for UserDeviceKeyInfoMap {
    fn from_iter<I: IntoIterator<Item = (UserId, DeviceKeyInfoMap)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for UserDeviceKeyInfoMap {
    type Item = (UserId, DeviceKeyInfoMap);
    type IntoIter = std::collections::btree_map::IntoIter<UserId, DeviceKeyInfoMap>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
