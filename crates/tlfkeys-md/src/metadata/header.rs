//! Fields shared by every metadata format.

use serde::{Deserialize, Serialize};
use tlfkeys_core::codec::b64;
use tlfkeys_core::{
    BranchId, MdId, Revision, TlfId, TlfKeysError, TlfKeysResult, TlfType, UnknownFields, UserId,
};
use tlfkeys_crypto::SignatureInfo;

macro_rules! bit_flags {
    ($(#[$meta:meta])* $name:ident { $($(#[$fmeta:meta])* $flag:ident = $bit:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u8);

        impl $name {
            $($(#[$fmeta])* pub const $flag: $name = $name($bit);)+

            pub fn bits(self) -> u8 {
                self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0 == 0
            }

            pub fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn insert(&mut self, other: $name) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: $name) {
                self.0 &= !other.0;
            }
        }
    };
}

bit_flags! {
    /// Header bits, set by whoever produced the revision.
    MetadataFlags {
        /// Some device still lacks keys; a writer should rekey.
        REKEY = 1,
        /// Writer metadata was carried over unchanged, so its signature
        /// belongs to an earlier writer.
        WRITER_METADATA_COPIED = 2,
        /// Last revision of a folder that has been reset.
        FINAL = 4,
    }
}

bit_flags! {
    WriterFlags {
        UNMERGED = 1,
    }
}

/// The part of a revision only writers may change, covered by the writer
/// signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterMetadata {
    #[serde(rename = "data", with = "b64", default)]
    pub serialized_private_metadata: Vec<u8>,
    #[serde(rename = "lmw")]
    pub last_modifying_writer: UserId,
    /// Explicit writers, for public folders; the team id, for team folders.
    /// Private folders list writers in their key bundles instead.
    #[serde(rename = "writers", default, skip_serializing_if = "Vec::is_empty")]
    pub writers: Vec<UserId>,
    #[serde(rename = "id")]
    pub tlf_id: TlfId,
    #[serde(rename = "t")]
    pub tlf_type: TlfType,
    #[serde(rename = "bid", default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<BranchId>,
    #[serde(rename = "wFlags", default, skip_serializing_if = "WriterFlags::is_empty")]
    pub flags: WriterFlags,
    #[serde(rename = "diskUsage", default)]
    pub disk_usage: u64,
    #[serde(rename = "refBytes", default)]
    pub ref_bytes: u64,
    #[serde(rename = "unrefBytes", default)]
    pub unref_bytes: u64,
    #[serde(flatten)]
    pub unknown: UnknownFields,
}

impl WriterMetadata {
    pub fn new(tlf_id: TlfId, tlf_type: TlfType, writer: UserId, writers: Vec<UserId>) -> Self {
        Self {
            serialized_private_metadata: Vec::new(),
            last_modifying_writer: writer,
            writers,
            tlf_id,
            tlf_type,
            branch_id: None,
            flags: WriterFlags::default(),
            disk_usage: 0,
            ref_bytes: 0,
            unref_bytes: 0,
            unknown: UnknownFields::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataHeader {
    #[serde(rename = "lmu")]
    pub last_modifying_user: UserId,
    #[serde(rename = "flags", default, skip_serializing_if = "MetadataFlags::is_empty")]
    pub flags: MetadataFlags,
    #[serde(rename = "rev")]
    pub revision: Revision,
    #[serde(rename = "prevRoot", default, skip_serializing_if = "Option::is_none")]
    pub prev_root: Option<MdId>,
    #[serde(rename = "wmdSig", default, skip_serializing_if = "Option::is_none")]
    pub writer_signature: Option<SignatureInfo>,
    #[serde(flatten)]
    pub unknown: UnknownFields,
}

impl MetadataHeader {
    pub fn new(user: UserId) -> Self {
        Self {
            last_modifying_user: user,
            flags: MetadataFlags::default(),
            revision: Revision::INITIAL,
            prev_root: None,
            writer_signature: None,
            unknown: UnknownFields::new(),
        }
    }
}

/// Key bundle operations only make sense for folders with per-device keys.
pub(crate) fn require_private(tlf_type: TlfType, op: &str) -> TlfKeysResult<()> {
    if tlf_type != TlfType::Private {
        return Err(TlfKeysError::precondition(format!(
            "{op} called on a {tlf_type:?} folder"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let mut flags = MetadataFlags::default();
        assert!(flags.is_empty());
        flags.insert(MetadataFlags::REKEY);
        flags.insert(MetadataFlags::FINAL);
        assert!(flags.contains(MetadataFlags::REKEY));
        assert!(!flags.contains(MetadataFlags::WRITER_METADATA_COPIED));
        flags.remove(MetadataFlags::REKEY);
        assert_eq!(flags, MetadataFlags::FINAL);
        assert_eq!(flags.bits(), 4);
    }

    #[test]
    fn test_header_omits_empty_optionals() {
        let header = MetadataHeader::new(UserId::new("u"));
        let json = serde_json::to_value(&header).unwrap();
        assert_eq!(json, serde_json::json!({"lmu": "u", "rev": 1}));
    }

    #[test]
    fn test_require_private() {
        assert!(require_private(TlfType::Private, "op").is_ok());
        let err = require_private(TlfType::Public, "add_key_generation").unwrap_err();
        assert!(err.to_string().contains("add_key_generation"));
    }
}
