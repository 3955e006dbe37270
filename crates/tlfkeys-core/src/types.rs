use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::byte_array_type;
use crate::error::{TlfKeysError, TlfKeysResult};

/// A user (or team) identifier as resolved by the identity layer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Access-control class of a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlfType {
    /// Per-device key bundles; only listed devices can read.
    Private,
    /// Readable by anyone; writers listed explicitly.
    Public,
    /// Membership delegated to a single team.
    Team,
}

byte_array_type! {
    /// Random identifier of a folder.
    pub struct TlfId([u8; 16]);
}

impl TlfId {
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }
}

byte_array_type! {
    /// Identifier of an unmerged branch of a folder's history.
    pub struct BranchId([u8; 16]);
}

impl BranchId {
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }
}

byte_array_type! {
    /// Content-derived identifier of one encoded metadata revision.
    pub struct MdId([u8; 32]);
}

/// Key generation number. Generations start at [`KeyGen::FIRST_VALID`] and
/// only ever grow.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct KeyGen(pub i32);

impl KeyGen {
    /// Reported by public folders, which have no keys.
    pub const PUBLIC: KeyGen = KeyGen(-1);
    /// A private folder that has not been keyed yet.
    pub const UNSPECIFIED: KeyGen = KeyGen(0);
    pub const FIRST_VALID: KeyGen = KeyGen(1);

    pub fn next(self) -> TlfKeysResult<KeyGen> {
        self.0
            .checked_add(1)
            .map(KeyGen)
            .ok_or_else(|| {
                TlfKeysError::invalid_metadata(format!("key generation {self} has no successor"))
            })
    }

    pub fn is_valid(self) -> bool {
        self >= Self::FIRST_VALID
    }

    /// Zero-based position of this generation in a per-generation list.
    pub fn index(self) -> Option<usize> {
        self.0
            .checked_sub(Self::FIRST_VALID.0)
            .and_then(|i| usize::try_from(i).ok())
    }
}

impl fmt::Display for KeyGen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Metadata revision number.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Revision(pub u64);

impl Revision {
    pub const UNINITIALIZED: Revision = Revision(0);
    pub const INITIAL: Revision = Revision(1);

    pub fn next(self) -> TlfKeysResult<Revision> {
        self.0
            .checked_add(1)
            .map(Revision)
            .ok_or_else(|| TlfKeysError::successor(format!("revision {self} has no successor")))
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeStatus {
    Merged,
    Unmerged,
}

/// Metadata format version.
///
/// Versions 1 and 2 embed every key generation's bundles in the revision
/// itself; version 3 stores only bundle IDs and keeps the bundles alongside.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(into = "u8", try_from = "u8")]
pub struct MetadataVersion(u8);

impl MetadataVersion {
    pub const PRE_EXTRA: MetadataVersion = MetadataVersion(1);
    pub const INITIAL_EXTRA: MetadataVersion = MetadataVersion(2);
    pub const SEGREGATED_KEY_BUNDLES: MetadataVersion = MetadataVersion(3);

    pub const FIRST_VALID: MetadataVersion = Self::PRE_EXTRA;
    pub const LATEST: MetadataVersion = Self::SEGREGATED_KEY_BUNDLES;

    /// Validates a raw version number against the supported range.
    pub fn new(raw: u8) -> TlfKeysResult<Self> {
        let v = MetadataVersion(raw);
        if v < Self::FIRST_VALID || v > Self::LATEST {
            return Err(TlfKeysError::UnsupportedVersion(raw));
        }
        Ok(v)
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn has_segregated_key_bundles(self) -> bool {
        self >= Self::SEGREGATED_KEY_BUNDLES
    }
}

impl TryFrom<u8> for MetadataVersion {
    type Error = TlfKeysError;

    fn try_from(raw: u8) -> TlfKeysResult<Self> {
        Self::new(raw)
    }
}

impl From<MetadataVersion> for u8 {
    fn from(v: MetadataVersion) -> u8 {
        v.0
    }
}

impl fmt::Display for MetadataVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
