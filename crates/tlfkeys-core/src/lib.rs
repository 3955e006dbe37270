//! tlfkeys-core: identifiers, errors, configuration, and the codec shared by
//! every tlfkeys crate.

pub mod codec;
pub mod config;
pub mod error;
pub mod types;

pub use codec::{Codec, JsonCodec, UnknownFields};
pub use error::{TlfKeysError, TlfKeysResult};
pub use types::{
    BranchId, KeyGen, MdId, MergeStatus, MetadataVersion, Revision, TlfId, TlfType, UserId,
};
