//! Bookkeeping for server halves that must be deleted after a revocation.
//!
//! The metadata server keeps one server half per (user, device, key
//! generation). When devices or users lose access, the caller needs the
//! exact list of server half IDs to delete; this is that list.

use std::collections::BTreeMap;

use serde::Serialize;
use tlfkeys_core::{TlfKeysError, TlfKeysResult, UserId};
use tlfkeys_crypto::{CryptPublicKey, ServerHalfId};

/// Removed server half IDs per device, one entry per affected key generation.
pub type DeviceServerHalfRemovalInfo = BTreeMap<CryptPublicKey, Vec<ServerHalfId>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UserServerHalfRemovalInfo {
    /// True when the user lost access entirely, false when only some of
    /// their devices did. A member left with zero devices is `false`.
    pub user_removed: bool,
    pub device_server_half_ids: DeviceServerHalfRemovalInfo,
}

impl UserServerHalfRemovalInfo {
    /// Fold in one more key generation's removals for the same user. Every
    /// device must appear exactly once in `generation` and already be known.
    pub fn add_generation(
        &mut self,
        uid: &UserId,
        generation: UserServerHalfRemovalInfo,
    ) -> TlfKeysResult<()> {
        if self.user_removed != generation.user_removed {
            return Err(TlfKeysError::precondition(format!(
                "user_removed={} != generation user_removed={} for user {uid}",
                self.user_removed, generation.user_removed
            )));
        }
        if self.device_server_half_ids.len() != generation.device_server_half_ids.len() {
            return Err(TlfKeysError::precondition(format!(
                "device count {} != generation device count {} for user {uid}",
                self.device_server_half_ids.len(),
                generation.device_server_half_ids.len()
            )));
        }

        for (device, ids) in generation.device_server_half_ids {
            let [id] = ids.as_slice() else {
                return Err(TlfKeysError::precondition(format!(
                    "expected exactly one server half id for device {device} of user {uid}, got {}",
                    ids.len()
                )));
            };
            let existing = self.device_server_half_ids.get_mut(&device).ok_or_else(|| {
                TlfKeysError::precondition(format!(
                    "device {device} of user {uid} not present in earlier generations"
                ))
            })?;
            existing.push(*id);
        }
        Ok(())
    }
}

/// Removal bookkeeping for every affected user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ServerHalfRemovalInfo(BTreeMap<UserId, UserServerHalfRemovalInfo>);

impl ServerHalfRemovalInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, uid: &UserId) -> Option<&UserServerHalfRemovalInfo> {
        self.0.get(uid)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&UserId, &UserServerHalfRemovalInfo)> {
        self.0.iter()
    }

    pub(crate) fn insert(&mut self, uid: UserId, info: UserServerHalfRemovalInfo) {
        self.0.insert(uid, info);
    }

    /// Flatten to `(user, device, server half id)` triples, the shape a
    /// deletion request takes.
    pub fn server_half_ids(&self) -> Vec<(&UserId, &CryptPublicKey, &ServerHalfId)> {
        self.0
            .iter()
            .flat_map(|(uid, info)| {
                info.device_server_half_ids
                    .iter()
                    .flat_map(move |(device, ids)| ids.iter().map(move |id| (uid, device, id)))
            })
            .collect()
    }

    /// Union two disjoint removal sets, e.g. the writer and reader results
    /// of one generation. A user present in both is an error.
    pub fn merge_users(mut self, other: ServerHalfRemovalInfo) -> TlfKeysResult<Self> {
        for (uid, info) in other.0 {
            if self.0.contains_key(&uid) {
                return Err(TlfKeysError::precondition(format!(
                    "user {uid} is in both removal sets"
                )));
            }
            self.0.insert(uid, info);
        }
        Ok(self)
    }

    /// Fold in the removals of a later revocation of the same revision. A
    /// user removed by either is removed; device IDs are unioned.
    pub fn union(mut self, other: ServerHalfRemovalInfo) -> Self {
        for (uid, info) in other.0 {
            let existing = self.0.entry(uid).or_default();
            existing.user_removed |= info.user_removed;
            for (device, ids) in info.device_server_half_ids {
                let known = existing.device_server_half_ids.entry(device).or_default();
                for id in ids {
                    if !known.contains(&id) {
                        known.push(id);
                    }
                }
            }
        }
        self
    }

    /// Append one more generation's removals. The set of users must match.
    pub fn add_generation(&mut self, generation: ServerHalfRemovalInfo) -> TlfKeysResult<()> {
        if self.0.len() != generation.0.len() {
            return Err(TlfKeysError::precondition(format!(
                "user count {} != generation user count {}",
                self.0.len(),
                generation.0.len()
            )));
        }
        for (uid, info) in generation.0 {
            let existing = self.0.get_mut(&uid).ok_or_else(|| {
                TlfKeysError::precondition(format!(
                    "user {uid} not present in earlier generations"
                ))
            })?;
            existing.add_generation(&uid, info)?;
        }
        Ok(())
    }
}

impl IntoIterator for ServerHalfRemovalInfo {
    type Item = (UserId, UserServerHalfRemovalInfo);
    type IntoIter = std::collections::btree_map::IntoIter<UserId, UserServerHalfRemovalInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<(UserId, UserServerHalfRemovalInfo)> for ServerHalfRemovalInfo {
    fn from_iter<I: IntoIterator<Item = (UserId, UserServerHalfRemovalInfo)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fake_device;

    fn id(tag: u8) -> ServerHalfId {
        ServerHalfId::from_bytes([tag; 32])
    }

    fn single(user_removed: bool, device: u8, half: u8) -> UserServerHalfRemovalInfo {
        UserServerHalfRemovalInfo {
            user_removed,
            device_server_half_ids: [(fake_device(device), vec![id(half)])].into(),
        }
    }

    #[test]
    fn test_merge_disjoint_users() {
        let a: ServerHalfRemovalInfo = [(UserId::new("a"), single(true, 1, 1))].into_iter().collect();
        let b: ServerHalfRemovalInfo = [(UserId::new("b"), single(false, 2, 2))].into_iter().collect();
        let merged = a.merge_users(b).unwrap();
        assert_eq!(merged.len(), 2);
        assert!(merged.get(&UserId::new("a")).unwrap().user_removed);
        assert!(!merged.get(&UserId::new("b")).unwrap().user_removed);
    }

    #[test]
    fn test_merge_overlapping_user_fails() {
        let a: ServerHalfRemovalInfo = [(UserId::new("a"), single(true, 1, 1))].into_iter().collect();
        let b: ServerHalfRemovalInfo = [(UserId::new("a"), single(true, 1, 2))].into_iter().collect();
        let err = a.merge_users(b).unwrap_err();
        assert!(matches!(err, TlfKeysError::Precondition(_)));
    }

    #[test]
    fn test_union_folds_repeat_users() {
        let uid = UserId::new("a");
        let partial: ServerHalfRemovalInfo = [(uid.clone(), single(false, 1, 1))].into_iter().collect();
        let mut full = single(true, 2, 2);
        full.device_server_half_ids.insert(fake_device(1), vec![id(1)]);
        let later: ServerHalfRemovalInfo = [
            (uid.clone(), full),
            (UserId::new("b"), single(false, 3, 3)),
        ]
        .into_iter()
        .collect();

        let all = partial.union(later);
        assert_eq!(all.len(), 2);
        let info = all.get(&uid).unwrap();
        assert!(info.user_removed);
        assert_eq!(info.device_server_half_ids[&fake_device(1)], vec![id(1)]);
        assert_eq!(info.device_server_half_ids[&fake_device(2)], vec![id(2)]);
        assert_eq!(all.server_half_ids().len(), 3);
    }

    #[test]
    fn test_add_generation_appends_ids() {
        let uid = UserId::new("a");
        let mut all: ServerHalfRemovalInfo = [(uid.clone(), single(false, 1, 1))].into_iter().collect();
        let gen2: ServerHalfRemovalInfo = [(uid.clone(), single(false, 1, 2))].into_iter().collect();
        all.add_generation(gen2).unwrap();

        let info = all.get(&uid).unwrap();
        assert_eq!(info.device_server_half_ids[&fake_device(1)], vec![id(1), id(2)]);
        assert_eq!(all.server_half_ids().len(), 2);
    }

    #[test]
    fn test_add_generation_rejects_mismatches() {
        let uid = UserId::new("a");
        let base: ServerHalfRemovalInfo = [(uid.clone(), single(false, 1, 1))].into_iter().collect();

        let mut flipped = base.clone();
        let gen: ServerHalfRemovalInfo = [(uid.clone(), single(true, 1, 2))].into_iter().collect();
        assert!(flipped.add_generation(gen).is_err());

        let mut other_device = base.clone();
        let gen: ServerHalfRemovalInfo = [(uid.clone(), single(false, 9, 2))].into_iter().collect();
        assert!(other_device.add_generation(gen).is_err());

        let mut other_user = base.clone();
        let gen: ServerHalfRemovalInfo =
            [(UserId::new("b"), single(false, 1, 2))].into_iter().collect();
        assert!(other_user.add_generation(gen).is_err());

        let mut two_ids = base;
        let gen: ServerHalfRemovalInfo = [(
            uid,
            UserServerHalfRemovalInfo {
                user_removed: false,
                device_server_half_ids: [(fake_device(1), vec![id(2), id(3)])].into(),
            },
        )]
        .into_iter()
        .collect();
        assert!(two_ids.add_generation(gen).is_err());
    }
}
