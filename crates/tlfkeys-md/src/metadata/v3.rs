//! Segregated format: the revision carries bundle IDs, the bundles travel
//! as `ExtraMetadata` and hold only the latest key generation.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tlfkeys_core::{
    Codec, KeyGen, MetadataVersion, TlfKeysError, TlfKeysResult, TlfType, UnknownFields, UserId,
};
use tlfkeys_crypto::{CryptPublicKey, CryptoPure, TlfCryptKey, TlfPublicKey};

use super::{
    require_extra, require_extra_mut, require_private, BundleUpdate, MetadataFormat,
    MetadataHeader, NewKeyGeneration, WriterMetadata,
};
use crate::bundle::{
    make_reader_key_bundle_id, make_writer_key_bundle_id, CryptKeyParams, KeyBundle,
    ReaderKeyBundle, ReaderKeyBundleId, WriterKeyBundle, WriterKeyBundleId,
};
use crate::device_map::{UserDeviceKeyServerHalves, UserDevicePublicKeys};
use crate::extra::ExtraMetadata;
use crate::rekey::{promote_readers_in_bundles, revoke_in_bundles, update_bundle_pair};
use crate::removal::ServerHalfRemovalInfo;
use crate::split::KeySplitter;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootMetadataV3 {
    #[serde(rename = "ver")]
    version: MetadataVersion,
    #[serde(rename = "wmd")]
    writer_metadata: WriterMetadata,
    #[serde(rename = "lkg")]
    latest_key_generation: KeyGen,
    #[serde(rename = "wkbID", default, skip_serializing_if = "Option::is_none")]
    writer_key_bundle_id: Option<WriterKeyBundleId>,
    #[serde(rename = "rkbID", default, skip_serializing_if = "Option::is_none")]
    reader_key_bundle_id: Option<ReaderKeyBundleId>,
    #[serde(rename = "hdr")]
    header: MetadataHeader,
    #[serde(flatten)]
    unknown: UnknownFields,
}

/// What the writer signature covers.
#[derive(Serialize)]
struct SignedFields<'a> {
    wmd: &'a WriterMetadata,
    lkg: KeyGen,
    #[serde(rename = "wkbID", skip_serializing_if = "Option::is_none")]
    wkb_id: Option<WriterKeyBundleId>,
}

impl RootMetadataV3 {
    pub(crate) fn new(writer_metadata: WriterMetadata, header: MetadataHeader) -> Self {
        let latest_key_generation = match writer_metadata.tlf_type {
            TlfType::Public => KeyGen::PUBLIC,
            TlfType::Private | TlfType::Team => KeyGen::UNSPECIFIED,
        };
        Self::from_parts(writer_metadata, header, latest_key_generation, None, None)
    }

    pub(crate) fn from_parts(
        writer_metadata: WriterMetadata,
        header: MetadataHeader,
        latest_key_generation: KeyGen,
        writer_key_bundle_id: Option<WriterKeyBundleId>,
        reader_key_bundle_id: Option<ReaderKeyBundleId>,
    ) -> Self {
        Self {
            version: MetadataVersion::SEGREGATED_KEY_BUNDLES,
            writer_metadata,
            latest_key_generation,
            writer_key_bundle_id,
            reader_key_bundle_id,
            header,
            unknown: UnknownFields::new(),
        }
    }

    pub fn writer_key_bundle_id(&self) -> Option<WriterKeyBundleId> {
        self.writer_key_bundle_id
    }

    pub fn reader_key_bundle_id(&self) -> Option<ReaderKeyBundleId> {
        self.reader_key_bundle_id
    }

    pub(crate) fn set_latest_key_generation(&mut self, key_gen: KeyGen) {
        self.latest_key_generation = key_gen;
    }

    /// Unkeyed folders may run without bundles; keyed ones may not.
    fn bundles<'e>(
        &self,
        extra: Option<&'e ExtraMetadata>,
    ) -> TlfKeysResult<Option<&'e ExtraMetadata>> {
        if self.latest_key_generation.is_valid() {
            require_extra(extra).map(Some)
        } else {
            Ok(extra)
        }
    }
}

impl MetadataFormat for RootMetadataV3 {
    fn version(&self) -> MetadataVersion {
        self.version
    }

    fn writer_metadata(&self) -> &WriterMetadata {
        &self.writer_metadata
    }

    fn writer_metadata_mut(&mut self) -> &mut WriterMetadata {
        &mut self.writer_metadata
    }

    fn header(&self) -> &MetadataHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut MetadataHeader {
        &mut self.header
    }

    fn stores_historic_tlf_crypt_keys(&self) -> bool {
        true
    }

    fn latest_key_generation(&self) -> KeyGen {
        self.latest_key_generation
    }

    fn key_generations_to_update(&self) -> TlfKeysResult<(KeyGen, KeyGen)> {
        let latest = self.latest_key_generation;
        if latest.is_valid() {
            Ok((latest, latest.next()?))
        } else {
            Ok((KeyGen::UNSPECIFIED, KeyGen::UNSPECIFIED))
        }
    }

    fn serialized_writer_metadata<C: Codec>(&self, codec: &C) -> TlfKeysResult<Vec<u8>> {
        codec.encode(&SignedFields {
            wmd: &self.writer_metadata,
            lkg: self.latest_key_generation,
            wkb_id: self.writer_key_bundle_id,
        })
    }

    fn check_extra<C: Codec>(
        &self,
        codec: &C,
        extra: Option<&ExtraMetadata>,
    ) -> TlfKeysResult<()> {
        if self.writer_metadata.tlf_type != TlfType::Private {
            if extra.is_some() {
                return Err(TlfKeysError::invalid_metadata(format!(
                    "{:?} folder carries key bundles",
                    self.writer_metadata.tlf_type
                )));
            }
            return Ok(());
        }
        let Some(extra) = self.bundles(extra)? else {
            return Ok(());
        };
        if !self.latest_key_generation.is_valid() {
            return Ok(());
        }

        let wkb = extra.writer_bundle();
        let rkb = extra.reader_bundle();
        if self.writer_key_bundle_id != Some(make_writer_key_bundle_id(codec, wkb)?) {
            return Err(TlfKeysError::invalid_metadata(
                "writer key bundle does not match its ID",
            ));
        }
        if self.reader_key_bundle_id != Some(make_reader_key_bundle_id(codec, rkb)?) {
            return Err(TlfKeysError::invalid_metadata(
                "reader key bundle does not match its ID",
            ));
        }
        wkb.validate_ephemeral_indices()?;
        rkb.validate_ephemeral_indices()?;

        let links = wkb.historic_tlf_crypt_keys.len();
        let expected = self.latest_key_generation.index().unwrap_or(0);
        if links != expected {
            return Err(TlfKeysError::invalid_metadata(format!(
                "{links} historic key links for generation {}",
                self.latest_key_generation
            )));
        }
        Ok(())
    }

    fn user_device_public_keys(
        &self,
        extra: Option<&ExtraMetadata>,
    ) -> TlfKeysResult<(UserDevicePublicKeys, UserDevicePublicKeys)> {
        if self.writer_metadata.tlf_type != TlfType::Private
            || !self.latest_key_generation.is_valid()
        {
            return Ok(Default::default());
        }
        let extra = require_extra(extra)?;
        Ok((
            extra.writer_bundle().keys.to_public_keys(),
            extra.reader_bundle().keys.to_public_keys(),
        ))
    }

    fn current_tlf_public_key(&self, extra: Option<&ExtraMetadata>) -> TlfKeysResult<TlfPublicKey> {
        Ok(require_extra(extra)?.writer_bundle().tlf_public_key)
    }

    fn crypt_key_params(
        &self,
        key_gen: KeyGen,
        uid: &UserId,
        device: &CryptPublicKey,
        extra: Option<&ExtraMetadata>,
    ) -> TlfKeysResult<Option<CryptKeyParams>> {
        if key_gen != self.latest_key_generation {
            return Err(TlfKeysError::precondition(format!(
                "only generation {} has per-device keys, asked for {key_gen}",
                self.latest_key_generation
            )));
        }
        let extra = require_extra(extra)?;
        match extra.writer_bundle().crypt_key_params(uid, device)? {
            Some(params) => Ok(Some(params)),
            None => extra.reader_bundle().crypt_key_params(uid, device),
        }
    }

    fn is_private_writer(
        &self,
        uid: &UserId,
        device: Option<&CryptPublicKey>,
        extra: Option<&ExtraMetadata>,
    ) -> TlfKeysResult<bool> {
        Ok(self
            .bundles(extra)?
            .is_some_and(|extra| extra.writer_bundle().is_member(uid, device)))
    }

    fn is_private_reader(
        &self,
        uid: &UserId,
        device: Option<&CryptPublicKey>,
        extra: Option<&ExtraMetadata>,
    ) -> TlfKeysResult<bool> {
        Ok(self.bundles(extra)?.is_some_and(|extra| {
            extra.writer_bundle().is_member(uid, device)
                || extra.reader_bundle().is_member(uid, device)
        }))
    }

    fn add_key_generation<C: CryptoPure + ?Sized>(
        &mut self,
        splitter: &KeySplitter<'_, C>,
        extra: Option<&ExtraMetadata>,
        gen: NewKeyGeneration<'_>,
    ) -> TlfKeysResult<(Option<ExtraMetadata>, UserDeviceKeyServerHalves)> {
        require_private(self.writer_metadata.tlf_type, "add_key_generation")?;
        let latest = self.latest_key_generation;

        let historic = if latest.is_valid() {
            if gen.current_key.is_zero() {
                return Err(TlfKeysError::precondition(format!(
                    "adding a generation after {latest} needs the current crypt key"
                )));
            }
            let mut links = require_extra(extra)?
                .writer_bundle()
                .historic_tlf_crypt_keys
                .clone();
            let expected = latest.index().unwrap_or(0);
            if links.len() != expected {
                return Err(TlfKeysError::invalid_metadata(format!(
                    "{} historic key links for generation {latest}, expected {expected}",
                    links.len()
                )));
            }
            let link = splitter
                .crypto()
                .encrypt_historic_key(gen.current_key, gen.next_key)
                .map_err(TlfKeysError::Crypto)?;
            links.push(link);
            links
        } else {
            if !gen.current_key.is_zero() {
                return Err(TlfKeysError::precondition(
                    "the first key generation has no current crypt key",
                ));
            }
            Vec::new()
        };

        let mut wkb = WriterKeyBundle::new(gen.tlf_public_key);
        wkb.historic_tlf_crypt_keys = historic;
        let mut rkb = ReaderKeyBundle::default();
        let halves = update_bundle_pair(splitter, &mut wkb, &mut rkb, gen.update, gen.next_key)?;

        self.latest_key_generation = latest.next()?;
        self.writer_key_bundle_id = None;
        self.reader_key_bundle_id = None;
        Ok((Some(ExtraMetadata::new(wkb, rkb, true, true)), halves))
    }

    fn update_key_bundles<C: CryptoPure + ?Sized>(
        &mut self,
        splitter: &KeySplitter<'_, C>,
        extra: Option<&mut ExtraMetadata>,
        update: BundleUpdate<'_>,
        keys: &[TlfCryptKey],
    ) -> TlfKeysResult<Vec<UserDeviceKeyServerHalves>> {
        require_private(self.writer_metadata.tlf_type, "update_key_bundles")?;
        if !self.latest_key_generation.is_valid() {
            if !keys.is_empty() {
                return Err(TlfKeysError::precondition(format!(
                    "folder has no key generations but {} keys were given",
                    keys.len()
                )));
            }
            return Ok(Vec::new());
        }
        let [key] = keys else {
            return Err(TlfKeysError::precondition(format!(
                "expected exactly one crypt key, got {}",
                keys.len()
            )));
        };

        let (wkb, rkb) = require_extra_mut(extra)?.bundles_mut();
        let halves = update_bundle_pair(splitter, wkb, rkb, update, key)?;
        Ok(vec![halves])
    }

    fn promote_readers(
        &mut self,
        uids: &BTreeSet<UserId>,
        extra: Option<&mut ExtraMetadata>,
    ) -> TlfKeysResult<()> {
        require_private(self.writer_metadata.tlf_type, "promote_readers")?;
        let (wkb, rkb) = require_extra_mut(extra)?.bundles_mut();
        promote_readers_in_bundles(wkb, rkb, uids)
    }

    fn revoke_removed_devices(
        &mut self,
        writers: &UserDevicePublicKeys,
        readers: &UserDevicePublicKeys,
        extra: Option<&mut ExtraMetadata>,
    ) -> TlfKeysResult<ServerHalfRemovalInfo> {
        require_private(self.writer_metadata.tlf_type, "revoke_removed_devices")?;
        if !self.latest_key_generation.is_valid() {
            return Ok(ServerHalfRemovalInfo::new());
        }
        let (wkb, rkb) = require_extra_mut(extra)?.bundles_mut();
        revoke_in_bundles(wkb, rkb, writers, readers)
    }

    fn finalize_rekey<C: Codec>(
        &mut self,
        codec: &C,
        extra: Option<&mut ExtraMetadata>,
    ) -> TlfKeysResult<()> {
        if self.writer_metadata.tlf_type != TlfType::Private
            || !self.latest_key_generation.is_valid()
        {
            return Ok(());
        }
        let extra = require_extra_mut(extra)?;
        let wkb_id = make_writer_key_bundle_id(codec, extra.writer_bundle())?;
        let rkb_id = make_reader_key_bundle_id(codec, extra.reader_bundle())?;

        let wkb_changed = self.writer_key_bundle_id != Some(wkb_id);
        let rkb_changed = self.reader_key_bundle_id != Some(rkb_id);
        self.writer_key_bundle_id = Some(wkb_id);
        self.reader_key_bundle_id = Some(rkb_id);
        extra.update_new(wkb_changed, rkb_changed);
        Ok(())
    }

    fn historic_tlf_crypt_key<C: CryptoPure + ?Sized>(
        &self,
        crypto: &C,
        target: KeyGen,
        current_key: &TlfCryptKey,
        extra: Option<&ExtraMetadata>,
    ) -> TlfKeysResult<TlfCryptKey> {
        require_private(self.writer_metadata.tlf_type, "historic_tlf_crypt_key")?;
        let latest = self.latest_key_generation;
        if !target.is_valid() || target > latest {
            return Err(TlfKeysError::precondition(format!(
                "generation {target} outside {}..={latest}",
                KeyGen::FIRST_VALID
            )));
        }
        if target == latest {
            return Ok(current_key.clone());
        }

        let links = &require_extra(extra)?.writer_bundle().historic_tlf_crypt_keys;
        let mut key = current_key.clone();
        let mut gen = latest;
        while gen > target {
            let prev = KeyGen(gen.0 - 1);
            // Link i seals generation i+1 under generation i+2.
            let link = prev.index().and_then(|i| links.get(i)).ok_or_else(|| {
                TlfKeysError::invalid_metadata(format!(
                    "no historic key link for generation {prev}"
                ))
            })?;
            key = crypto
                .decrypt_historic_key(link, &key)
                .map_err(TlfKeysError::Crypto)?;
            gen = prev;
        }
        Ok(key)
    }

    fn clear_key_bundle_fields(&mut self) {
        self.latest_key_generation = KeyGen::UNSPECIFIED;
        self.writer_key_bundle_id = None;
        self.reader_key_bundle_id = None;
    }
}
