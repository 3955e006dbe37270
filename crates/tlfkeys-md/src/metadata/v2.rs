//! Embedded format: every key generation's writer and reader bundle lives
//! inside the revision.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tlfkeys_core::{
    Codec, KeyGen, MetadataVersion, TlfKeysError, TlfKeysResult, TlfType, UnknownFields, UserId,
};
use tlfkeys_crypto::{CryptPublicKey, CryptoPure, TlfCryptKey, TlfPublicKey};

use super::{
    require_private, BundleUpdate, MetadataFormat, MetadataHeader, NewKeyGeneration,
    RootMetadataV3, WriterMetadata,
};
use crate::bundle::{
    make_reader_key_bundle_id, make_writer_key_bundle_id, CryptKeyParams, KeyBundle,
    ReaderKeyBundle, WriterKeyBundle,
};
use crate::device_map::{UserDeviceKeyServerHalves, UserDevicePublicKeys};
use crate::extra::ExtraMetadata;
use crate::rekey::{promote_readers_in_bundles, revoke_in_bundles, update_bundle_pair};
use crate::removal::ServerHalfRemovalInfo;
use crate::split::KeySplitter;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootMetadataV2 {
    #[serde(rename = "ver")]
    version: MetadataVersion,
    #[serde(rename = "wmd")]
    writer_metadata: WriterMetadata,
    #[serde(rename = "wKeyGens", default, skip_serializing_if = "Vec::is_empty")]
    writer_key_bundles: Vec<WriterKeyBundle>,
    #[serde(rename = "rKeyGens", default, skip_serializing_if = "Vec::is_empty")]
    reader_key_bundles: Vec<ReaderKeyBundle>,
    #[serde(rename = "hdr")]
    header: MetadataHeader,
    #[serde(flatten)]
    unknown: UnknownFields,
}

#[derive(Serialize)]
struct SignedFields<'a> {
    wmd: &'a WriterMetadata,
    #[serde(rename = "wKeyGens")]
    writer_key_bundles: &'a [WriterKeyBundle],
}

impl RootMetadataV2 {
    pub(crate) fn new(
        version: MetadataVersion,
        writer_metadata: WriterMetadata,
        header: MetadataHeader,
    ) -> Self {
        Self {
            version,
            writer_metadata,
            writer_key_bundles: Vec::new(),
            reader_key_bundles: Vec::new(),
            header,
            unknown: UnknownFields::new(),
        }
    }

    fn latest_bundles(&self) -> Option<(&WriterKeyBundle, &ReaderKeyBundle)> {
        self.writer_key_bundles
            .last()
            .zip(self.reader_key_bundles.last())
    }

    fn check_generation_counts(&self) -> TlfKeysResult<()> {
        if self.writer_key_bundles.len() != self.reader_key_bundles.len() {
            return Err(TlfKeysError::invalid_metadata(format!(
                "{} writer generations but {} reader generations",
                self.writer_key_bundles.len(),
                self.reader_key_bundles.len()
            )));
        }
        Ok(())
    }

    fn bundle_pairs_mut(
        &mut self,
    ) -> TlfKeysResult<impl Iterator<Item = (&mut WriterKeyBundle, &mut ReaderKeyBundle)>> {
        self.check_generation_counts()?;
        Ok(self
            .writer_key_bundles
            .iter_mut()
            .zip(self.reader_key_bundles.iter_mut()))
    }

    /// Rewrite as the segregated format. Only the latest generation's
    /// bundles carry over; older keys become historic links built from
    /// `key_getter`, which must return every generation's key, oldest first.
    ///
    /// The writer signature is dropped since the signed fields change shape.
    pub(crate) fn upconvert<C, Cr, F>(
        &self,
        codec: &C,
        crypto: &Cr,
        key_getter: F,
    ) -> TlfKeysResult<(RootMetadataV3, Option<ExtraMetadata>)>
    where
        C: Codec,
        Cr: CryptoPure + ?Sized,
        F: FnOnce() -> TlfKeysResult<Vec<TlfCryptKey>>,
    {
        let mut header = self.header.clone();
        header.writer_signature = None;
        let wmd = self.writer_metadata.clone();
        let latest = self.latest_key_generation();

        if wmd.tlf_type != TlfType::Private || !latest.is_valid() {
            let v3 = RootMetadataV3::from_parts(wmd, header, latest, None, None);
            return Ok((v3, None));
        }

        self.check_generation_counts()?;
        let (wkb, rkb) = self
            .latest_bundles()
            .ok_or_else(|| TlfKeysError::invalid_metadata("no bundles for the latest generation"))?;
        wkb.validate_ephemeral_indices()?;
        rkb.validate_ephemeral_indices()?;
        let mut wkb = wkb.clone();
        let rkb = rkb.clone();

        let keys = key_getter()?;
        if keys.len() != self.writer_key_bundles.len() {
            return Err(TlfKeysError::precondition(format!(
                "up-converting {} generations needs as many keys, got {}",
                self.writer_key_bundles.len(),
                keys.len()
            )));
        }
        wkb.historic_tlf_crypt_keys = keys
            .windows(2)
            .map(|pair| {
                crypto
                    .encrypt_historic_key(&pair[0], &pair[1])
                    .map_err(TlfKeysError::Crypto)
            })
            .collect::<TlfKeysResult<Vec<_>>>()?;

        let wkb_id = make_writer_key_bundle_id(codec, &wkb)?;
        let rkb_id = make_reader_key_bundle_id(codec, &rkb)?;
        let v3 = RootMetadataV3::from_parts(wmd, header, latest, Some(wkb_id), Some(rkb_id));
        Ok((v3, Some(ExtraMetadata::new(wkb, rkb, true, true))))
    }
}

impl MetadataFormat for RootMetadataV2 {
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
        false
    }

    fn latest_key_generation(&self) -> KeyGen {
        if self.writer_metadata.tlf_type == TlfType::Public {
            return KeyGen::PUBLIC;
        }
        KeyGen(i32::try_from(self.writer_key_bundles.len()).unwrap_or(i32::MAX))
    }

    fn key_generations_to_update(&self) -> TlfKeysResult<(KeyGen, KeyGen)> {
        let latest = self.latest_key_generation();
        if latest.is_valid() {
            Ok((KeyGen::FIRST_VALID, latest.next()?))
        } else {
            Ok((KeyGen::UNSPECIFIED, KeyGen::UNSPECIFIED))
        }
    }

    fn serialized_writer_metadata<C: Codec>(&self, codec: &C) -> TlfKeysResult<Vec<u8>> {
        codec.encode(&SignedFields {
            wmd: &self.writer_metadata,
            writer_key_bundles: &self.writer_key_bundles,
        })
    }

    fn check_extra<C: Codec>(
        &self,
        _codec: &C,
        extra: Option<&ExtraMetadata>,
    ) -> TlfKeysResult<()> {
        if extra.is_some() {
            return Err(TlfKeysError::invalid_metadata(
                "embedded metadata carries its bundles inline",
            ));
        }
        self.check_generation_counts()?;
        for (wkb, rkb) in self.writer_key_bundles.iter().zip(&self.reader_key_bundles) {
            wkb.validate_ephemeral_indices()?;
            rkb.validate_ephemeral_indices()?;
        }
        Ok(())
    }

    fn user_device_public_keys(
        &self,
        _extra: Option<&ExtraMetadata>,
    ) -> TlfKeysResult<(UserDevicePublicKeys, UserDevicePublicKeys)> {
        Ok(self
            .latest_bundles()
            .map(|(wkb, rkb)| (wkb.keys.to_public_keys(), rkb.keys.to_public_keys()))
            .unwrap_or_default())
    }

    fn current_tlf_public_key(&self, _extra: Option<&ExtraMetadata>) -> TlfKeysResult<TlfPublicKey> {
        self.writer_key_bundles
            .last()
            .map(|wkb| wkb.tlf_public_key)
            .ok_or_else(|| TlfKeysError::precondition("folder has no key generations"))
    }

    fn crypt_key_params(
        &self,
        key_gen: KeyGen,
        uid: &UserId,
        device: &CryptPublicKey,
        _extra: Option<&ExtraMetadata>,
    ) -> TlfKeysResult<Option<CryptKeyParams>> {
        let bundles = key_gen.index().and_then(|i| {
            self.writer_key_bundles
                .get(i)
                .zip(self.reader_key_bundles.get(i))
        });
        let Some((wkb, rkb)) = bundles else {
            return Err(TlfKeysError::precondition(format!(
                "generation {key_gen} outside {}..={}",
                KeyGen::FIRST_VALID,
                self.latest_key_generation()
            )));
        };
        match wkb.crypt_key_params(uid, device)? {
            Some(params) => Ok(Some(params)),
            None => rkb.crypt_key_params(uid, device),
        }
    }

    fn is_private_writer(
        &self,
        uid: &UserId,
        device: Option<&CryptPublicKey>,
        _extra: Option<&ExtraMetadata>,
    ) -> TlfKeysResult<bool> {
        Ok(self
            .writer_key_bundles
            .last()
            .is_some_and(|wkb| wkb.is_member(uid, device)))
    }

    fn is_private_reader(
        &self,
        uid: &UserId,
        device: Option<&CryptPublicKey>,
        _extra: Option<&ExtraMetadata>,
    ) -> TlfKeysResult<bool> {
        Ok(self
            .latest_bundles()
            .is_some_and(|(wkb, rkb)| wkb.is_member(uid, device) || rkb.is_member(uid, device)))
    }

    fn add_key_generation<C: CryptoPure + ?Sized>(
        &mut self,
        splitter: &KeySplitter<'_, C>,
        _extra: Option<&ExtraMetadata>,
        gen: NewKeyGeneration<'_>,
    ) -> TlfKeysResult<(Option<ExtraMetadata>, UserDeviceKeyServerHalves)> {
        require_private(self.writer_metadata.tlf_type, "add_key_generation")?;
        if !gen.current_key.is_zero() {
            return Err(TlfKeysError::precondition(
                "embedded metadata does not chain keys; current key must be zero",
            ));
        }
        self.check_generation_counts()?;

        let mut wkb = WriterKeyBundle::new(gen.tlf_public_key);
        let mut rkb = ReaderKeyBundle::default();
        let halves = update_bundle_pair(splitter, &mut wkb, &mut rkb, gen.update, gen.next_key)?;
        self.writer_key_bundles.push(wkb);
        self.reader_key_bundles.push(rkb);
        Ok((None, halves))
    }

    fn update_key_bundles<C: CryptoPure + ?Sized>(
        &mut self,
        splitter: &KeySplitter<'_, C>,
        _extra: Option<&mut ExtraMetadata>,
        update: BundleUpdate<'_>,
        keys: &[TlfCryptKey],
    ) -> TlfKeysResult<Vec<UserDeviceKeyServerHalves>> {
        require_private(self.writer_metadata.tlf_type, "update_key_bundles")?;
        let (start, end) = self.key_generations_to_update()?;
        let count = usize::try_from(end.0 - start.0).unwrap_or(0);
        if keys.len() != count {
            return Err(TlfKeysError::precondition(format!(
                "expected {count} crypt keys, got {}",
                keys.len()
            )));
        }

        self.bundle_pairs_mut()?
            .zip(keys)
            .map(|((wkb, rkb), key)| update_bundle_pair(splitter, wkb, rkb, update, key))
            .collect()
    }

    fn promote_readers(
        &mut self,
        uids: &BTreeSet<UserId>,
        _extra: Option<&mut ExtraMetadata>,
    ) -> TlfKeysResult<()> {
        require_private(self.writer_metadata.tlf_type, "promote_readers")?;
        for (wkb, rkb) in self.bundle_pairs_mut()? {
            promote_readers_in_bundles(wkb, rkb, uids)?;
        }
        Ok(())
    }

    fn revoke_removed_devices(
        &mut self,
        writers: &UserDevicePublicKeys,
        readers: &UserDevicePublicKeys,
        _extra: Option<&mut ExtraMetadata>,
    ) -> TlfKeysResult<ServerHalfRemovalInfo> {
        require_private(self.writer_metadata.tlf_type, "revoke_removed_devices")?;
        let mut total: Option<ServerHalfRemovalInfo> = None;
        for (wkb, rkb) in self.bundle_pairs_mut()? {
            let generation = revoke_in_bundles(wkb, rkb, writers, readers)?;
            match total.as_mut() {
                Some(total) => total.add_generation(generation)?,
                None => total = Some(generation),
            }
        }
        Ok(total.unwrap_or_default())
    }

    fn finalize_rekey<C: Codec>(
        &mut self,
        _codec: &C,
        _extra: Option<&mut ExtraMetadata>,
    ) -> TlfKeysResult<()> {
        Ok(())
    }

    fn historic_tlf_crypt_key<C: CryptoPure + ?Sized>(
        &self,
        _crypto: &C,
        _target: KeyGen,
        _current_key: &TlfCryptKey,
        _extra: Option<&ExtraMetadata>,
    ) -> TlfKeysResult<TlfCryptKey> {
        Err(TlfKeysError::precondition(
            "embedded metadata keeps old keys per device, not as historic links",
        ))
    }

    fn clear_key_bundle_fields(&mut self) {
        self.writer_key_bundles.clear();
        self.reader_key_bundles.clear();
    }
}
