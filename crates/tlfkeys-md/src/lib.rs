//! tlfkeys-md: key bundles and the rekey engine for encrypted folders
//!
//! Data flow for one rekey:
//!
//! ```text
//! caller ──► RekeyEngine ──► RootMetadata (V2 embedded | V3 segregated)
//!                 │                 │
//!                 │                 └── WriterKeyBundle / ReaderKeyBundle
//!                 │                          └── UserDeviceKeyInfoMap
//!                 │                                   └── DeviceKeyInfoMap
//!                 └── KeySplitter (per missing device, optionally on rayon)
//! ```
//!
//! Nothing here performs I/O. Uploading server halves, deleting revoked ones,
//! and publishing the revision belong to the caller; `RekeyEngine::check_publishable`
//! is the gate a revision must pass first.

pub mod bundle;
pub mod device_map;
pub mod dump;
pub mod extra;
pub mod membership;
pub mod metadata;
pub mod rekey;
pub mod removal;
pub mod split;

#[cfg(test)]
pub(crate) mod test_support;

pub use bundle::{
    make_reader_key_bundle_id, make_writer_key_bundle_id, CryptKeyParams, KeyBundle,
    ReaderKeyBundle, ReaderKeyBundleId, WriterKeyBundle, WriterKeyBundleId,
};
pub use device_map::{
    DeviceKeyInfoMap, DeviceKeyServerHalves, DevicePublicKeys, UserDeviceKeyInfoMap,
    UserDeviceKeyServerHalves, UserDevicePublicKeys,
};
pub use extra::ExtraMetadata;
pub use membership::{MembershipChecker, StaticTeamMembership};
pub use metadata::{
    make_initial_root_metadata, BundleUpdate, MetadataFormat, NewKeyGeneration, RootMetadata,
    RootMetadataV2, RootMetadataV3,
};
pub use rekey::{RekeyBatch, RekeyEngine, RekeyOptions, RekeyOutcome, SuccessorKind};
pub use removal::{ServerHalfRemovalInfo, UserServerHalfRemovalInfo};
pub use split::{split_tlf_crypt_key, KeySplitter, TlfCryptKeyInfo};
