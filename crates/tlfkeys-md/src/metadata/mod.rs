//! Versioned root metadata.
//!
//! Two formats share one contract:
//!
//! - `RootMetadataV2` (versions 1 and 2) embeds a writer and a reader bundle
//!   for every key generation. Old keys stay recoverable only through the
//!   per-device entries of old generations.
//! - `RootMetadataV3` (version 3) stores only bundle IDs. The bundles travel
//!   separately as `ExtraMetadata` and cover the latest generation only;
//!   older keys are recovered by walking the historic key links backward.
//!
//! `RootMetadata` is the closed set of both; `MetadataFormat` is the
//! capability each implements. Everything format-independent (successor
//! rules, signature checks, role checks) lives on `RootMetadata`.

mod header;
mod v2;
mod v3;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tlfkeys_core::{
    BranchId, Codec, KeyGen, MdId, MergeStatus, MetadataVersion, Revision, TlfId, TlfKeysError,
    TlfKeysResult, TlfType, UserId,
};
use tlfkeys_crypto::{
    CryptPublicKey, CryptoPure, EphemeralPrivateKey, EphemeralPublicKey, Signer, TlfCryptKey,
    TlfPublicKey, VerifyingKey,
};
use tracing::debug;

pub use header::{MetadataFlags, MetadataHeader, WriterFlags, WriterMetadata};
pub(crate) use header::require_private;
pub use v2::RootMetadataV2;
pub use v3::RootMetadataV3;

use crate::bundle::{CryptKeyParams, ReaderKeyBundleId, WriterKeyBundleId};
use crate::device_map::{UserDeviceKeyServerHalves, UserDevicePublicKeys};
use crate::extra::ExtraMetadata;
use crate::membership::MembershipChecker;
use crate::removal::ServerHalfRemovalInfo;
use crate::split::KeySplitter;

/// Target device sets and the ephemeral key pair for one rekey pass.
#[derive(Clone, Copy)]
pub struct BundleUpdate<'a> {
    pub writers: &'a UserDevicePublicKeys,
    pub readers: &'a UserDevicePublicKeys,
    pub ephemeral_public_key: EphemeralPublicKey,
    pub ephemeral_private_key: &'a EphemeralPrivateKey,
}

/// Inputs for a new key generation. `current_key` is the latest existing
/// generation's key in formats that chain history, and zero otherwise.
#[derive(Clone, Copy)]
pub struct NewKeyGeneration<'a> {
    pub update: BundleUpdate<'a>,
    pub tlf_public_key: TlfPublicKey,
    pub current_key: &'a TlfCryptKey,
    pub next_key: &'a TlfCryptKey,
}

/// Format-specific behavior of a metadata revision.
///
/// `extra` carries the bundles of segregated formats; embedded formats
/// ignore it.
pub trait MetadataFormat {
    fn version(&self) -> MetadataVersion;

    fn writer_metadata(&self) -> &WriterMetadata;

    fn writer_metadata_mut(&mut self) -> &mut WriterMetadata;

    fn header(&self) -> &MetadataHeader;

    fn header_mut(&mut self) -> &mut MetadataHeader;

    /// Whether old keys are chained symmetrically (true) or only
    /// recoverable per device (false).
    fn stores_historic_tlf_crypt_keys(&self) -> bool;

    /// `KeyGen::PUBLIC` for public folders.
    fn latest_key_generation(&self) -> KeyGen;

    /// Half-open range of generations a rekey must touch. Empty when there
    /// is nothing to update.
    fn key_generations_to_update(&self) -> TlfKeysResult<(KeyGen, KeyGen)>;

    /// The bytes the writer signature covers.
    fn serialized_writer_metadata<C: Codec>(&self, codec: &C) -> TlfKeysResult<Vec<u8>>;

    /// Confirm `extra` belongs to this revision.
    fn check_extra<C: Codec>(&self, codec: &C, extra: Option<&ExtraMetadata>)
        -> TlfKeysResult<()>;

    /// Current writer and reader devices, from the latest generation.
    fn user_device_public_keys(
        &self,
        extra: Option<&ExtraMetadata>,
    ) -> TlfKeysResult<(UserDevicePublicKeys, UserDevicePublicKeys)>;

    fn current_tlf_public_key(&self, extra: Option<&ExtraMetadata>) -> TlfKeysResult<TlfPublicKey>;

    fn crypt_key_params(
        &self,
        key_gen: KeyGen,
        uid: &UserId,
        device: &CryptPublicKey,
        extra: Option<&ExtraMetadata>,
    ) -> TlfKeysResult<Option<CryptKeyParams>>;

    fn is_private_writer(
        &self,
        uid: &UserId,
        device: Option<&CryptPublicKey>,
        extra: Option<&ExtraMetadata>,
    ) -> TlfKeysResult<bool>;

    fn is_private_reader(
        &self,
        uid: &UserId,
        device: Option<&CryptPublicKey>,
        extra: Option<&ExtraMetadata>,
    ) -> TlfKeysResult<bool>;

    /// Append a generation keyed with `gen.next_key` and fill it for every
    /// target device. Returns the new extra (segregated formats only) and
    /// the server halves to upload.
    fn add_key_generation<C: CryptoPure + ?Sized>(
        &mut self,
        splitter: &KeySplitter<'_, C>,
        extra: Option<&ExtraMetadata>,
        gen: NewKeyGeneration<'_>,
    ) -> TlfKeysResult<(Option<ExtraMetadata>, UserDeviceKeyServerHalves)>;

    /// `keys` holds one crypt key per generation in
    /// `key_generations_to_update`, ascending; so does the result.
    fn update_key_bundles<C: CryptoPure + ?Sized>(
        &mut self,
        splitter: &KeySplitter<'_, C>,
        extra: Option<&mut ExtraMetadata>,
        update: BundleUpdate<'_>,
        keys: &[TlfCryptKey],
    ) -> TlfKeysResult<Vec<UserDeviceKeyServerHalves>>;

    fn promote_readers(
        &mut self,
        uids: &BTreeSet<UserId>,
        extra: Option<&mut ExtraMetadata>,
    ) -> TlfKeysResult<()>;

    fn revoke_removed_devices(
        &mut self,
        writers: &UserDevicePublicKeys,
        readers: &UserDevicePublicKeys,
        extra: Option<&mut ExtraMetadata>,
    ) -> TlfKeysResult<ServerHalfRemovalInfo>;

    fn finalize_rekey<C: Codec>(
        &mut self,
        codec: &C,
        extra: Option<&mut ExtraMetadata>,
    ) -> TlfKeysResult<()>;

    fn historic_tlf_crypt_key<C: CryptoPure + ?Sized>(
        &self,
        crypto: &C,
        target: KeyGen,
        current_key: &TlfCryptKey,
        extra: Option<&ExtraMetadata>,
    ) -> TlfKeysResult<TlfCryptKey>;

    /// Blank every field a rekey is allowed to change in the bundles.
    fn clear_key_bundle_fields(&mut self);
}

#[derive(Deserialize)]
struct VersionProbe {
    ver: u8,
}

/// One revision of a folder's metadata, in whichever format it was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum RootMetadata {
    V2(RootMetadataV2),
    V3(RootMetadataV3),
}

macro_rules! dispatch {
    ($self:expr, $md:ident => $body:expr) => {
        match $self {
            RootMetadata::V2($md) => $body,
            RootMetadata::V3($md) => $body,
        }
    };
}

impl MetadataFormat for RootMetadata {
    fn version(&self) -> MetadataVersion {
        dispatch!(self, md => md.version())
    }

    fn writer_metadata(&self) -> &WriterMetadata {
        dispatch!(self, md => md.writer_metadata())
    }

    fn writer_metadata_mut(&mut self) -> &mut WriterMetadata {
        dispatch!(self, md => md.writer_metadata_mut())
    }

    fn header(&self) -> &MetadataHeader {
        dispatch!(self, md => md.header())
    }

    fn header_mut(&mut self) -> &mut MetadataHeader {
        dispatch!(self, md => md.header_mut())
    }

    fn stores_historic_tlf_crypt_keys(&self) -> bool {
        dispatch!(self, md => md.stores_historic_tlf_crypt_keys())
    }

    fn latest_key_generation(&self) -> KeyGen {
        dispatch!(self, md => md.latest_key_generation())
    }

    fn key_generations_to_update(&self) -> TlfKeysResult<(KeyGen, KeyGen)> {
        dispatch!(self, md => md.key_generations_to_update())
    }

    fn serialized_writer_metadata<C: Codec>(&self, codec: &C) -> TlfKeysResult<Vec<u8>> {
        dispatch!(self, md => md.serialized_writer_metadata(codec))
    }

    fn check_extra<C: Codec>(
        &self,
        codec: &C,
        extra: Option<&ExtraMetadata>,
    ) -> TlfKeysResult<()> {
        dispatch!(self, md => md.check_extra(codec, extra))
    }

    fn user_device_public_keys(
        &self,
        extra: Option<&ExtraMetadata>,
    ) -> TlfKeysResult<(UserDevicePublicKeys, UserDevicePublicKeys)> {
        dispatch!(self, md => md.user_device_public_keys(extra))
    }

    fn current_tlf_public_key(&self, extra: Option<&ExtraMetadata>) -> TlfKeysResult<TlfPublicKey> {
        dispatch!(self, md => md.current_tlf_public_key(extra))
    }

    fn crypt_key_params(
        &self,
        key_gen: KeyGen,
        uid: &UserId,
        device: &CryptPublicKey,
        extra: Option<&ExtraMetadata>,
    ) -> TlfKeysResult<Option<CryptKeyParams>> {
        dispatch!(self, md => md.crypt_key_params(key_gen, uid, device, extra))
    }

    fn is_private_writer(
        &self,
        uid: &UserId,
        device: Option<&CryptPublicKey>,
        extra: Option<&ExtraMetadata>,
    ) -> TlfKeysResult<bool> {
        dispatch!(self, md => md.is_private_writer(uid, device, extra))
    }

    fn is_private_reader(
        &self,
        uid: &UserId,
        device: Option<&CryptPublicKey>,
        extra: Option<&ExtraMetadata>,
    ) -> TlfKeysResult<bool> {
        dispatch!(self, md => md.is_private_reader(uid, device, extra))
    }

    fn add_key_generation<C: CryptoPure + ?Sized>(
        &mut self,
        splitter: &KeySplitter<'_, C>,
        extra: Option<&ExtraMetadata>,
        gen: NewKeyGeneration<'_>,
    ) -> TlfKeysResult<(Option<ExtraMetadata>, UserDeviceKeyServerHalves)> {
        dispatch!(self, md => md.add_key_generation(splitter, extra, gen))
    }

    fn update_key_bundles<C: CryptoPure + ?Sized>(
        &mut self,
        splitter: &KeySplitter<'_, C>,
        extra: Option<&mut ExtraMetadata>,
        update: BundleUpdate<'_>,
        keys: &[TlfCryptKey],
    ) -> TlfKeysResult<Vec<UserDeviceKeyServerHalves>> {
        dispatch!(self, md => md.update_key_bundles(splitter, extra, update, keys))
    }

    fn promote_readers(
        &mut self,
        uids: &BTreeSet<UserId>,
        extra: Option<&mut ExtraMetadata>,
    ) -> TlfKeysResult<()> {
        dispatch!(self, md => md.promote_readers(uids, extra))
    }

    fn revoke_removed_devices(
        &mut self,
        writers: &UserDevicePublicKeys,
        readers: &UserDevicePublicKeys,
        extra: Option<&mut ExtraMetadata>,
    ) -> TlfKeysResult<ServerHalfRemovalInfo> {
        dispatch!(self, md => md.revoke_removed_devices(writers, readers, extra))
    }

    fn finalize_rekey<C: Codec>(
        &mut self,
        codec: &C,
        extra: Option<&mut ExtraMetadata>,
    ) -> TlfKeysResult<()> {
        dispatch!(self, md => md.finalize_rekey(codec, extra))
    }

    fn historic_tlf_crypt_key<C: CryptoPure + ?Sized>(
        &self,
        crypto: &C,
        target: KeyGen,
        current_key: &TlfCryptKey,
        extra: Option<&ExtraMetadata>,
    ) -> TlfKeysResult<TlfCryptKey> {
        dispatch!(self, md => md.historic_tlf_crypt_key(crypto, target, current_key, extra))
    }

    fn clear_key_bundle_fields(&mut self) {
        dispatch!(self, md => md.clear_key_bundle_fields())
    }
}

/// Start a folder at `Revision::INITIAL`.
///
/// Private folders must pass no `writers`; their writers live in the key
/// bundles and are added by the first rekey. Public folders list their
/// writers explicitly. Team folders pass exactly one entry, the team.
pub fn make_initial_root_metadata(
    version: u8,
    tlf_id: TlfId,
    tlf_type: TlfType,
    creator: UserId,
    writers: Vec<UserId>,
) -> TlfKeysResult<RootMetadata> {
    let version = MetadataVersion::new(version)?;
    match tlf_type {
        TlfType::Private if !writers.is_empty() => {
            return Err(TlfKeysError::precondition(
                "private folders keep their writers in key bundles",
            ));
        }
        TlfType::Public if writers.is_empty() => {
            return Err(TlfKeysError::precondition(
                "public folders need at least one writer",
            ));
        }
        TlfType::Team if writers.len() != 1 => {
            return Err(TlfKeysError::precondition(format!(
                "team folders need exactly one team writer, got {}",
                writers.len()
            )));
        }
        TlfType::Team if !version.has_segregated_key_bundles() => {
            return Err(TlfKeysError::precondition(format!(
                "team folders need metadata version {} or later",
                MetadataVersion::SEGREGATED_KEY_BUNDLES
            )));
        }
        _ => {}
    }

    let wmd = WriterMetadata::new(tlf_id, tlf_type, creator.clone(), writers);
    let header = MetadataHeader::new(creator);
    Ok(if version.has_segregated_key_bundles() {
        RootMetadata::V3(RootMetadataV3::new(wmd, header))
    } else {
        RootMetadata::V2(RootMetadataV2::new(version, wmd, header))
    })
}

impl RootMetadata {
    // ── Encoding ─────────────────────────────────────────────────────────

    pub fn encode<C: Codec>(&self, codec: &C) -> TlfKeysResult<Vec<u8>> {
        codec.encode(self)
    }

    /// Decode by the embedded `ver` tag. Versions outside the supported
    /// range fail with `UnsupportedVersion`.
    pub fn decode<C: Codec>(codec: &C, bytes: &[u8]) -> TlfKeysResult<Self> {
        let probe: VersionProbe = codec.decode(bytes)?;
        let version = MetadataVersion::new(probe.ver)?;
        if version.has_segregated_key_bundles() {
            Ok(RootMetadata::V3(codec.decode(bytes)?))
        } else {
            Ok(RootMetadata::V2(codec.decode(bytes)?))
        }
    }

    /// Content-derived identifier; the next revision's `prev_root`.
    pub fn md_id<C: Codec>(&self, codec: &C) -> TlfKeysResult<MdId> {
        let encoded = self.encode(codec)?;
        Ok(MdId::from_bytes(*blake3::hash(&encoded).as_bytes()))
    }

    pub fn deep_copy(&self) -> Self {
        self.clone()
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn tlf_id(&self) -> TlfId {
        self.writer_metadata().tlf_id
    }

    pub fn tlf_type(&self) -> TlfType {
        self.writer_metadata().tlf_type
    }

    pub fn revision(&self) -> Revision {
        self.header().revision
    }

    pub fn prev_root(&self) -> Option<MdId> {
        self.header().prev_root
    }

    pub fn last_modifying_writer(&self) -> &UserId {
        &self.writer_metadata().last_modifying_writer
    }

    pub fn last_modifying_user(&self) -> &UserId {
        &self.header().last_modifying_user
    }

    pub fn writers(&self) -> &[UserId] {
        &self.writer_metadata().writers
    }

    pub fn serialized_private_metadata(&self) -> &[u8] {
        &self.writer_metadata().serialized_private_metadata
    }

    pub fn disk_usage(&self) -> u64 {
        self.writer_metadata().disk_usage
    }

    pub fn ref_bytes(&self) -> u64 {
        self.writer_metadata().ref_bytes
    }

    pub fn unref_bytes(&self) -> u64 {
        self.writer_metadata().unref_bytes
    }

    pub fn branch_id(&self) -> Option<BranchId> {
        self.writer_metadata().branch_id
    }

    pub fn merged_status(&self) -> MergeStatus {
        if self.is_unmerged_set() {
            MergeStatus::Unmerged
        } else {
            MergeStatus::Merged
        }
    }

    pub fn is_unmerged_set(&self) -> bool {
        self.writer_metadata().flags.contains(WriterFlags::UNMERGED)
    }

    pub fn is_rekey_set(&self) -> bool {
        self.header().flags.contains(MetadataFlags::REKEY)
    }

    pub fn is_writer_metadata_copied_set(&self) -> bool {
        self.header()
            .flags
            .contains(MetadataFlags::WRITER_METADATA_COPIED)
    }

    pub fn is_final(&self) -> bool {
        self.header().flags.contains(MetadataFlags::FINAL)
    }

    /// `None` for embedded formats, and for segregated revisions not yet
    /// finalized.
    pub fn writer_key_bundle_id(&self) -> Option<WriterKeyBundleId> {
        match self {
            RootMetadata::V2(_) => None,
            RootMetadata::V3(md) => md.writer_key_bundle_id(),
        }
    }

    pub fn reader_key_bundle_id(&self) -> Option<ReaderKeyBundleId> {
        match self {
            RootMetadata::V2(_) => None,
            RootMetadata::V3(md) => md.reader_key_bundle_id(),
        }
    }

    // ── Setters ──────────────────────────────────────────────────────────

    pub fn set_revision(&mut self, revision: Revision) {
        self.header_mut().revision = revision;
    }

    pub fn set_prev_root(&mut self, id: MdId) {
        self.header_mut().prev_root = Some(id);
    }

    pub fn set_last_modifying_writer(&mut self, uid: UserId) {
        self.writer_metadata_mut().last_modifying_writer = uid;
    }

    pub fn set_last_modifying_user(&mut self, uid: UserId) {
        self.header_mut().last_modifying_user = uid;
    }

    pub fn set_serialized_private_metadata(&mut self, data: Vec<u8>) {
        self.writer_metadata_mut().serialized_private_metadata = data;
    }

    pub fn set_disk_usage(&mut self, bytes: u64) {
        self.writer_metadata_mut().disk_usage = bytes;
    }

    pub fn set_ref_bytes(&mut self, bytes: u64) {
        self.writer_metadata_mut().ref_bytes = bytes;
    }

    pub fn set_unref_bytes(&mut self, bytes: u64) {
        self.writer_metadata_mut().unref_bytes = bytes;
    }

    pub fn set_unmerged(&mut self, branch_id: BranchId) {
        let wmd = self.writer_metadata_mut();
        wmd.flags.insert(WriterFlags::UNMERGED);
        wmd.branch_id = Some(branch_id);
    }

    pub fn set_rekey_bit(&mut self) {
        self.header_mut().flags.insert(MetadataFlags::REKEY);
    }

    pub fn clear_rekey_bit(&mut self) {
        self.header_mut().flags.remove(MetadataFlags::REKEY);
    }

    pub fn set_writer_metadata_copied_bit(&mut self) {
        self.header_mut()
            .flags
            .insert(MetadataFlags::WRITER_METADATA_COPIED);
    }

    pub fn clear_writer_metadata_copied_bit(&mut self) {
        self.header_mut()
            .flags
            .remove(MetadataFlags::WRITER_METADATA_COPIED);
    }

    pub fn set_final_bit(&mut self) {
        self.header_mut().flags.insert(MetadataFlags::FINAL);
    }

    pub fn clear_final_bit(&mut self) {
        self.header_mut().flags.remove(MetadataFlags::FINAL);
    }

    /// Team folders get their keys from the team; the generation number is
    /// only recorded here.
    pub fn set_latest_key_generation_for_team(&mut self, key_gen: KeyGen) -> TlfKeysResult<()> {
        match self {
            RootMetadata::V3(md) if md.writer_metadata().tlf_type == TlfType::Team => {
                md.set_latest_key_generation(key_gen);
                Ok(())
            }
            _ => Err(TlfKeysError::precondition(
                "latest key generation can only be set directly on team folders",
            )),
        }
    }

    // ── Roles ────────────────────────────────────────────────────────────

    /// Sign the writer metadata as its last modifying writer.
    pub fn sign_writer_metadata<C: Codec, S: Signer + ?Sized>(
        &mut self,
        codec: &C,
        signer: &S,
    ) -> TlfKeysResult<()> {
        let bytes = self.serialized_writer_metadata(codec)?;
        let sig = signer.sign(&bytes).map_err(TlfKeysError::Crypto)?;
        self.header_mut().writer_signature = Some(sig);
        Ok(())
    }

    /// With `device = None`, any of the user's devices counts.
    pub fn is_writer<M: MembershipChecker + ?Sized>(
        &self,
        uid: &UserId,
        device: Option<&CryptPublicKey>,
        verifying_key: &VerifyingKey,
        membership: &M,
        extra: Option<&ExtraMetadata>,
    ) -> TlfKeysResult<bool> {
        match self.tlf_type() {
            TlfType::Private => self.is_private_writer(uid, device, extra),
            TlfType::Public => Ok(self.writers().contains(uid)),
            TlfType::Team => {
                let team = self.team_id()?;
                membership.is_team_writer(team, uid, verifying_key)
            }
        }
    }

    pub fn is_reader<M: MembershipChecker + ?Sized>(
        &self,
        uid: &UserId,
        device: Option<&CryptPublicKey>,
        membership: &M,
        extra: Option<&ExtraMetadata>,
    ) -> TlfKeysResult<bool> {
        match self.tlf_type() {
            TlfType::Private => self.is_private_reader(uid, device, extra),
            TlfType::Public => Ok(true),
            TlfType::Team => {
                let team = self.team_id()?;
                membership.is_team_reader(team, uid)
            }
        }
    }

    fn team_id(&self) -> TlfKeysResult<&UserId> {
        match self.writers() {
            [team] => Ok(team),
            other => Err(TlfKeysError::invalid_metadata(format!(
                "team folder lists {} writers, expected exactly one",
                other.len()
            ))),
        }
    }

    /// Confirm `uid`, signing with `verifying_key`, produced this revision.
    pub fn is_last_modified_by(&self, uid: &UserId, verifying_key: &VerifyingKey) -> TlfKeysResult<()> {
        if !self.is_writer_metadata_copied_set() {
            let writer = self.last_modifying_writer();
            if writer != uid {
                return Err(TlfKeysError::authorization(format!(
                    "last writer {writer} != {uid}"
                )));
            }
            let signed_by = self.header().writer_signature.as_ref().map(|sig| sig.verifying_key);
            if signed_by.as_ref() != Some(verifying_key) {
                return Err(TlfKeysError::authorization(format!(
                    "writer metadata not signed by {verifying_key}"
                )));
            }
        }

        let user = self.last_modifying_user();
        if user != uid {
            return Err(TlfKeysError::authorization(format!(
                "last modifier {user} != {uid}"
            )));
        }
        Ok(())
    }

    // ── Validity ─────────────────────────────────────────────────────────

    /// First check on any revision from an untrusted source: structure,
    /// writer signature, and the roles of the last writer and modifier.
    pub fn is_valid_and_signed<C, Cr, M>(
        &self,
        codec: &C,
        crypto: &Cr,
        membership: &M,
        extra: Option<&ExtraMetadata>,
        writer_verifying_key: &VerifyingKey,
    ) -> TlfKeysResult<()>
    where
        C: Codec,
        Cr: CryptoPure + ?Sized,
        M: MembershipChecker + ?Sized,
    {
        if self.revision() < Revision::INITIAL {
            return Err(TlfKeysError::invalid_metadata(format!(
                "revision {} is below the initial revision",
                self.revision()
            )));
        }
        if self.tlf_type() == TlfType::Private && !self.latest_key_generation().is_valid() {
            return Err(TlfKeysError::invalid_metadata(
                "private folder has no key generations",
            ));
        }
        self.check_extra(codec, extra)?;

        let sig = self.header().writer_signature.as_ref().ok_or_else(|| {
            TlfKeysError::authorization("writer metadata is not signed")
        })?;
        let bytes = self.serialized_writer_metadata(codec)?;
        crypto
            .verify(&bytes, sig)
            .map_err(|e| TlfKeysError::authorization(format!("writer signature: {e:#}")))?;

        if !self.is_writer_metadata_copied_set() && sig.verifying_key != *writer_verifying_key {
            return Err(TlfKeysError::authorization(format!(
                "writer metadata signed by {}, expected {writer_verifying_key}",
                sig.verifying_key
            )));
        }

        let writer = self.last_modifying_writer();
        if !self.is_writer(writer, None, writer_verifying_key, membership, extra)? {
            return Err(TlfKeysError::authorization(format!(
                "last writer {writer} is not a writer"
            )));
        }
        let user = self.last_modifying_user();
        if !self.is_reader(user, None, membership, extra)? {
            return Err(TlfKeysError::authorization(format!(
                "last modifier {user} is not a reader"
            )));
        }
        Ok(())
    }

    /// Whether `next` may follow this revision, whose ID is `current_id`.
    pub fn check_valid_successor(&self, current_id: &MdId, next: &RootMetadata) -> TlfKeysResult<()> {
        if self.is_final() {
            return Err(TlfKeysError::successor(format!(
                "revision {} is final",
                self.revision()
            )));
        }
        if self.tlf_id() != next.tlf_id() {
            return Err(TlfKeysError::successor(format!(
                "folder {} != {}",
                self.tlf_id(),
                next.tlf_id()
            )));
        }
        let expected = self.revision().next()?;
        if next.revision() != expected {
            return Err(TlfKeysError::successor(format!(
                "expected revision {expected}, got {}",
                next.revision()
            )));
        }
        if next.prev_root().as_ref() != Some(current_id) {
            return Err(TlfKeysError::successor(format!(
                "previous root {:?} != current {current_id}",
                next.prev_root()
            )));
        }
        if next.version() < self.version() {
            return Err(TlfKeysError::successor(format!(
                "metadata version went from {} to {}",
                self.version(),
                next.version()
            )));
        }
        if self.merged_status() == next.merged_status() && self.branch_id() != next.branch_id() {
            return Err(TlfKeysError::successor(format!(
                "branch changed from {:?} to {:?}",
                self.branch_id(),
                next.branch_id()
            )));
        }

        let expected_usage = if next.is_writer_metadata_copied_set() {
            Some(self.disk_usage())
        } else {
            self.disk_usage()
                .checked_add(next.ref_bytes())
                .and_then(|usage| usage.checked_sub(next.unref_bytes()))
        };
        if expected_usage != Some(next.disk_usage()) {
            return Err(TlfKeysError::successor(format!(
                "disk usage {} inconsistent with {} + {} - {}",
                next.disk_usage(),
                self.disk_usage(),
                next.ref_bytes(),
                next.unref_bytes()
            )));
        }
        Ok(())
    }

    /// `check_valid_successor`, and nothing outside the rekey fields changed.
    /// A rekey writes no data, so its ref and unref counts must be zero.
    pub fn check_valid_rekey_successor<C: Codec>(
        &self,
        codec: &C,
        current_id: &MdId,
        next: &RootMetadata,
    ) -> TlfKeysResult<()> {
        self.check_valid_successor(current_id, next)?;
        if next.ref_bytes() != 0 || next.unref_bytes() != 0 {
            return Err(TlfKeysError::successor(format!(
                "rekey references {} bytes and unreferences {}",
                next.ref_bytes(),
                next.unref_bytes()
            )));
        }
        if !differs_only_in_rekey_fields(codec, self, next)? {
            return Err(TlfKeysError::successor(
                "rekey changed fields outside the key bundles",
            ));
        }
        Ok(())
    }

    /// Whether this revision is a rekey by `user` on top of `prev` that
    /// left the writer metadata alone.
    pub fn is_valid_rekey_request<C: Codec>(
        &self,
        codec: &C,
        prev: &RootMetadata,
        user: &UserId,
    ) -> TlfKeysResult<bool> {
        if !self.is_writer_metadata_copied_set() || self.last_modifying_user() != user {
            return Ok(false);
        }
        differs_only_in_rekey_fields(codec, prev, self)
    }

    // ── Successors ───────────────────────────────────────────────────────

    /// Build the next revision: revision + 1, `prev_root` pointing here, the
    /// rekey, copied and final bits cleared, and no bytes referenced or
    /// unreferenced yet.
    ///
    /// An embedded private revision is up-converted to the segregated format
    /// when `latest_version` allows it and the caller can read the folder
    /// and write to it. `key_getter` then supplies every generation's crypt
    /// key, oldest first, to build the historic links.
    pub fn make_successor_copy<C, Cr, F>(
        &self,
        codec: &C,
        crypto: &Cr,
        extra: Option<&ExtraMetadata>,
        latest_version: MetadataVersion,
        key_getter: F,
        is_readable_and_writer: bool,
    ) -> TlfKeysResult<(RootMetadata, Option<ExtraMetadata>)>
    where
        C: Codec,
        Cr: CryptoPure + ?Sized,
        F: FnOnce() -> TlfKeysResult<Vec<TlfCryptKey>>,
    {
        let current_id = self.md_id(codec)?;

        let (mut next, next_extra) = match self {
            RootMetadata::V2(md)
                if is_readable_and_writer && latest_version.has_segregated_key_bundles() =>
            {
                debug!(tlf = %self.tlf_id(), from = %md.version(), "up-converting metadata");
                let (v3, extra) = md.upconvert(codec, crypto, key_getter)?;
                (RootMetadata::V3(v3), extra)
            }
            _ => (
                self.clone(),
                extra.map(ExtraMetadata::make_successor_copy),
            ),
        };

        next.set_revision(self.revision().next()?);
        next.set_prev_root(current_id);
        next.set_ref_bytes(0);
        next.set_unref_bytes(0);
        next.clear_rekey_bit();
        next.clear_writer_metadata_copied_bit();
        next.clear_final_bit();
        Ok((next, next_extra))
    }
}

/// Compare two revisions with every rekey-mutable field blanked.
fn differs_only_in_rekey_fields<C: Codec>(
    codec: &C,
    prev: &RootMetadata,
    next: &RootMetadata,
) -> TlfKeysResult<bool> {
    if prev.version() != next.version() {
        return Ok(false);
    }
    let prev = blank_rekey_fields(prev);
    let next = blank_rekey_fields(next);
    Ok(codec.encode(&prev)? == codec.encode(&next)?)
}

fn blank_rekey_fields(md: &RootMetadata) -> RootMetadata {
    let mut md = md.clone();
    md.clear_key_bundle_fields();

    let header = md.header_mut();
    header.writer_signature = None;
    header.revision = Revision::UNINITIALIZED;
    header.prev_root = None;
    header.last_modifying_user = UserId::new("");
    header.flags.remove(MetadataFlags::REKEY);
    header.flags.remove(MetadataFlags::WRITER_METADATA_COPIED);

    // Per-revision counters; disk usage still has to carry over.
    let wmd = md.writer_metadata_mut();
    wmd.flags.remove(WriterFlags::UNMERGED);
    wmd.branch_id = None;
    wmd.ref_bytes = 0;
    wmd.unref_bytes = 0;
    md
}

/// Segregated formats cannot work without their bundles.
pub(crate) fn require_extra<'a>(
    extra: Option<&'a ExtraMetadata>,
) -> TlfKeysResult<&'a ExtraMetadata> {
    extra.ok_or_else(|| TlfKeysError::invalid_metadata("segregated metadata needs its key bundles"))
}

pub(crate) fn require_extra_mut<'a>(
    extra: Option<&'a mut ExtraMetadata>,
) -> TlfKeysResult<&'a mut ExtraMetadata> {
    extra.ok_or_else(|| TlfKeysError::invalid_metadata("segregated metadata needs its key bundles"))
}
