//! Team membership lookups, answered by the identity layer.

use std::collections::{BTreeMap, BTreeSet};

use tlfkeys_core::{TlfKeysResult, UserId};
use tlfkeys_crypto::VerifyingKey;

/// Resolves whether a user belongs to a team folder's team.
///
/// Private and public folders list their members in the metadata itself and
/// never consult this.
pub trait MembershipChecker: Send + Sync {
    /// `verifying_key` is the key the user signed with; an implementation
    /// may require it to belong to the user.
    fn is_team_writer(
        &self,
        team: &UserId,
        uid: &UserId,
        verifying_key: &VerifyingKey,
    ) -> TlfKeysResult<bool>;

    fn is_team_reader(&self, team: &UserId, uid: &UserId) -> TlfKeysResult<bool>;
}

/// Fixed in-memory team rosters. Writers are also readers.
#[derive(Debug, Clone, Default)]
pub struct StaticTeamMembership {
    writers: BTreeMap<UserId, BTreeSet<UserId>>,
    readers: BTreeMap<UserId, BTreeSet<UserId>>,
}

impl StaticTeamMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_writer(&mut self, team: UserId, uid: UserId) -> &mut Self {
        self.writers.entry(team).or_default().insert(uid);
        self
    }

    pub fn add_reader(&mut self, team: UserId, uid: UserId) -> &mut Self {
        self.readers.entry(team).or_default().insert(uid);
        self
    }

    fn contains(map: &BTreeMap<UserId, BTreeSet<UserId>>, team: &UserId, uid: &UserId) -> bool {
        map.get(team).is_some_and(|members| members.contains(uid))
    }
}

impl MembershipChecker for StaticTeamMembership {
    fn is_team_writer(
        &self,
        team: &UserId,
        uid: &UserId,
        _verifying_key: &VerifyingKey,
    ) -> TlfKeysResult<bool> {
        Ok(Self::contains(&self.writers, team, uid))
    }

    fn is_team_reader(&self, team: &UserId, uid: &UserId) -> TlfKeysResult<bool> {
        Ok(Self::contains(&self.readers, team, uid) || Self::contains(&self.writers, team, uid))
    }
}
