//! Rekey orchestration.
//!
//! A rekey runs a fixed sequence against one metadata revision:
//!
//! ```text
//! [revoke_removed_devices] → [add_key_generation] → update_key_bundles
//!     → [promote_readers] → finalize → sign → check_publishable
//! ```
//!
//! Every step either applies completely or leaves the revision, its extra
//! and the collected bookkeeping exactly as they were.

use std::collections::BTreeSet;

use tlfkeys_core::config::RekeyConfig;
use tlfkeys_core::{Codec, KeyGen, MdId, TlfKeysError, TlfKeysResult, UserId};
use tlfkeys_crypto::{CryptoPure, Signer, TlfCryptKey, TlfPublicKey};
use tracing::{debug, info, warn};

use crate::bundle::{KeyBundle, ReaderKeyBundle, WriterKeyBundle};
use crate::device_map::{DeviceKeyInfoMap, UserDeviceKeyServerHalves, UserDevicePublicKeys};
use crate::extra::ExtraMetadata;
use crate::metadata::{BundleUpdate, MetadataFormat, NewKeyGeneration, RootMetadata};
use crate::removal::ServerHalfRemovalInfo;
use crate::split::{KeySplitter, DEFAULT_PARALLEL_SPLIT_THRESHOLD};

// ── Bundle-pair operations shared by both formats ───────────────────────

/// Fill one generation's writer and reader bundles for their targets.
pub(crate) fn update_bundle_pair<C: CryptoPure + ?Sized>(
    splitter: &KeySplitter<'_, C>,
    wkb: &mut WriterKeyBundle,
    rkb: &mut ReaderKeyBundle,
    update: BundleUpdate<'_>,
    key: &TlfCryptKey,
) -> TlfKeysResult<UserDeviceKeyServerHalves> {
    if let Some(uid) = update
        .writers
        .keys()
        .find(|uid| update.readers.contains_key(*uid))
    {
        return Err(TlfKeysError::precondition(format!(
            "user {uid} is listed as both writer and reader"
        )));
    }

    let mut halves = wkb.fill_in(
        splitter,
        update.writers,
        update.ephemeral_public_key,
        update.ephemeral_private_key,
        key,
    )?;
    let reader_halves = rkb.fill_in(
        splitter,
        update.readers,
        update.ephemeral_public_key,
        update.ephemeral_private_key,
        key,
    )?;
    halves.extend(reader_halves);
    Ok(halves)
}

/// Move `uids` from the reader bundle to the writer bundle.
///
/// Device entries keep their client halves. Their ephemeral indices are
/// remapped into the writer bundle's list, reusing a key already there.
/// A uid that already has writer devices keeps them; its reader devices
/// are merged in, and a device present in both keeps its writer entry.
pub(crate) fn promote_readers_in_bundles(
    wkb: &mut WriterKeyBundle,
    rkb: &mut ReaderKeyBundle,
    uids: &BTreeSet<UserId>,
) -> TlfKeysResult<()> {
    let mut writer_keys = wkb.ephemeral_public_keys.clone();
    let mut moved: Vec<(&UserId, DeviceKeyInfoMap)> = Vec::with_capacity(uids.len());

    for uid in uids {
        let mut dkim = rkb
            .keys
            .get(uid)
            .cloned()
            .ok_or_else(|| TlfKeysError::precondition(format!("user {uid} is not a reader")))?;
        if let Some(existing) = wkb.keys.get(uid) {
            dkim.retain(|device, _| !existing.contains_key(device));
        }

        for info in dkim.values_mut() {
            let key = rkb.ephemeral_public_key(info.ephemeral_index)?;
            let pos = match writer_keys.iter().position(|k| *k == key) {
                Some(pos) => pos,
                None => {
                    writer_keys.push(key);
                    writer_keys.len() - 1
                }
            };
            info.ephemeral_index = i32::try_from(pos)
                .map_err(|_| TlfKeysError::precondition("bundle has too many ephemeral keys"))?;
        }
        moved.push((uid, dkim));
    }

    wkb.ephemeral_public_keys = writer_keys;
    for (uid, dkim) in moved {
        rkb.keys.remove(uid);
        wkb.keys.merge_user(uid, dkim);
    }
    Ok(())
}

/// Drop every device not in `writers` / `readers` from one generation.
pub(crate) fn revoke_in_bundles(
    wkb: &mut WriterKeyBundle,
    rkb: &mut ReaderKeyBundle,
    writers: &UserDevicePublicKeys,
    readers: &UserDevicePublicKeys,
) -> TlfKeysResult<ServerHalfRemovalInfo> {
    let writer_removal = wkb.keys.remove_devices_not_in(writers);
    let reader_removal = rkb.keys.remove_devices_not_in(readers);
    writer_removal.merge_users(reader_removal)
}

// ── Engine ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RekeyOptions {
    /// Device count at which splitting moves to the rayon pool; `None`
    /// keeps it on the calling thread.
    pub parallel_split_threshold: Option<usize>,
}

impl Default for RekeyOptions {
    fn default() -> Self {
        Self {
            parallel_split_threshold: Some(DEFAULT_PARALLEL_SPLIT_THRESHOLD),
        }
    }
}

impl From<&RekeyConfig> for RekeyOptions {
    fn from(config: &RekeyConfig) -> Self {
        Self {
            parallel_split_threshold: config
                .parallel_split
                .then_some(config.parallel_split_threshold),
        }
    }
}

/// Which successor rules the rekeyed revision must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessorKind {
    /// Any valid successor.
    Full,
    /// Only key bundle fields may differ from the predecessor.
    RekeyOnly,
}

/// Server halves created for one key generation.
#[derive(Debug, Clone)]
pub struct RekeyBatch {
    pub key_gen: KeyGen,
    pub server_halves: UserDeviceKeyServerHalves,
}

#[derive(Debug, Clone)]
pub struct RekeyOutcome {
    pub md: RootMetadata,
    pub extra: Option<ExtraMetadata>,
    /// To upload before publishing, in key generation order.
    pub server_halves: Vec<RekeyBatch>,
    /// To delete after publishing.
    pub removal: ServerHalfRemovalInfo,
}

pub struct RekeyEngine<'a, C: Codec, Cr: CryptoPure + ?Sized> {
    codec: &'a C,
    splitter: KeySplitter<'a, Cr>,
    md: RootMetadata,
    extra: Option<ExtraMetadata>,
    server_halves: Vec<RekeyBatch>,
    removal: ServerHalfRemovalInfo,
    finalized: bool,
}

impl<'a, C: Codec, Cr: CryptoPure + ?Sized> RekeyEngine<'a, C, Cr> {
    /// `md` is normally a fresh successor copy; `extra` is its bundles for
    /// segregated revisions that already have a key generation.
    pub fn new(
        codec: &'a C,
        crypto: &'a Cr,
        md: RootMetadata,
        extra: Option<ExtraMetadata>,
        options: RekeyOptions,
    ) -> Self {
        Self {
            codec,
            splitter: KeySplitter::new(crypto).with_parallel_threshold(options.parallel_split_threshold),
            md,
            extra,
            server_halves: Vec::new(),
            removal: ServerHalfRemovalInfo::new(),
            finalized: false,
        }
    }

    pub fn md(&self) -> &RootMetadata {
        &self.md
    }

    pub fn extra(&self) -> Option<&ExtraMetadata> {
        self.extra.as_ref()
    }

    pub fn server_halves(&self) -> &[RekeyBatch] {
        &self.server_halves
    }

    pub fn removal(&self) -> &ServerHalfRemovalInfo {
        &self.removal
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Run `op` against the engine state, restoring it if `op` fails.
    fn transact<T>(
        &mut self,
        name: &str,
        op: impl FnOnce(&mut Self) -> TlfKeysResult<T>,
    ) -> TlfKeysResult<T> {
        if self.finalized {
            return Err(TlfKeysError::precondition(format!(
                "{name} after the rekey was finalized"
            )));
        }
        let md = self.md.clone();
        let extra = self.extra.clone();
        let removal = self.removal.clone();
        let batches = self.server_halves.len();

        op(self).inspect_err(|e| {
            warn!(tlf = %self.md.tlf_id(), step = name, "rekey step failed: {e}");
            self.md = md;
            self.extra = extra;
            self.removal = removal;
            self.server_halves.truncate(batches);
        })
    }

    /// Every touched generation gets a batch, even an empty one, so batches
    /// line up with generations.
    fn record(&mut self, key_gen: KeyGen, server_halves: UserDeviceKeyServerHalves) {
        match self.server_halves.iter_mut().find(|b| b.key_gen == key_gen) {
            Some(batch) => {
                for (uid, halves) in server_halves {
                    batch.server_halves.entry(uid).or_default().extend(halves);
                }
            }
            None => self.server_halves.push(RekeyBatch {
                key_gen,
                server_halves,
            }),
        }
    }

    /// Start a new key generation keyed with `next_key`. `current_key` is
    /// the latest existing generation's key for formats that chain history,
    /// and zero otherwise.
    pub fn add_key_generation(
        &mut self,
        update: BundleUpdate<'_>,
        tlf_public_key: TlfPublicKey,
        current_key: &TlfCryptKey,
        next_key: &TlfCryptKey,
    ) -> TlfKeysResult<KeyGen> {
        self.transact("add_key_generation", |this| {
            let gen = NewKeyGeneration {
                update,
                tlf_public_key,
                current_key,
                next_key,
            };
            let (extra, halves) =
                this.md
                    .add_key_generation(&this.splitter, this.extra.as_ref(), gen)?;
            if extra.is_some() {
                this.extra = extra;
            }
            let key_gen = this.md.latest_key_generation();
            info!(
                tlf = %this.md.tlf_id(),
                key_gen = %key_gen,
                users = halves.len(),
                "added key generation"
            );
            this.record(key_gen, halves);
            Ok(key_gen)
        })
    }

    /// Give every target device without keys an entry in each generation
    /// the format keeps per-device keys for. `keys` holds those
    /// generations' crypt keys, oldest first.
    pub fn update_key_bundles(
        &mut self,
        update: BundleUpdate<'_>,
        keys: &[TlfCryptKey],
    ) -> TlfKeysResult<()> {
        self.transact("update_key_bundles", |this| {
            let (start, _) = this.md.key_generations_to_update()?;
            let per_gen =
                this.md
                    .update_key_bundles(&this.splitter, this.extra.as_mut(), update, keys)?;
            let mut key_gen = start;
            for (i, halves) in per_gen.into_iter().enumerate() {
                if i > 0 {
                    key_gen = key_gen.next()?;
                }
                debug!(tlf = %this.md.tlf_id(), key_gen = %key_gen, users = halves.len(), "updated key bundles");
                this.record(key_gen, halves);
            }
            Ok(())
        })
    }

    pub fn promote_readers(&mut self, uids: &BTreeSet<UserId>) -> TlfKeysResult<()> {
        self.transact("promote_readers", |this| {
            this.md.promote_readers(uids, this.extra.as_mut())?;
            info!(tlf = %this.md.tlf_id(), users = uids.len(), "promoted readers to writers");
            Ok(())
        })
    }

    /// Drop devices and users no longer in `writers` / `readers`. Returns
    /// what this call removed; the engine also accumulates it for the
    /// outcome.
    pub fn revoke_removed_devices(
        &mut self,
        writers: &UserDevicePublicKeys,
        readers: &UserDevicePublicKeys,
    ) -> TlfKeysResult<ServerHalfRemovalInfo> {
        self.transact("revoke_removed_devices", |this| {
            let removal = this
                .md
                .revoke_removed_devices(writers, readers, this.extra.as_mut())?;
            if !removal.is_empty() {
                info!(
                    tlf = %this.md.tlf_id(),
                    users = removal.len(),
                    server_halves = removal.server_half_ids().len(),
                    "revoked devices"
                );
                let collected = std::mem::take(&mut this.removal);
                this.removal = collected.union(removal.clone());
            }
            Ok(removal)
        })
    }

    /// Compute bundle IDs and mark changed bundles for upload. No further
    /// bundle changes are accepted afterwards.
    pub fn finalize(&mut self) -> TlfKeysResult<()> {
        self.transact("finalize", |this| {
            this.md.finalize_rekey(this.codec, this.extra.as_mut())?;
            this.finalized = true;
            debug!(tlf = %this.md.tlf_id(), "rekey finalized");
            Ok(())
        })
    }

    /// Sign the finalized revision as its last modifying writer.
    pub fn sign_writer_metadata<S: Signer + ?Sized>(&mut self, signer: &S) -> TlfKeysResult<()> {
        if !self.finalized {
            return Err(TlfKeysError::precondition(
                "sign_writer_metadata before the rekey was finalized",
            ));
        }
        self.md.sign_writer_metadata(self.codec, signer)
    }

    /// Whether the rekeyed revision may be published after `prev`, whose ID
    /// is `prev_id`.
    pub fn check_publishable(
        &self,
        prev: &RootMetadata,
        prev_id: &MdId,
        kind: SuccessorKind,
    ) -> TlfKeysResult<()> {
        if !self.finalized {
            return Err(TlfKeysError::precondition(
                "check_publishable before the rekey was finalized",
            ));
        }
        self.md.check_extra(self.codec, self.extra.as_ref())?;
        match kind {
            SuccessorKind::Full => prev.check_valid_successor(prev_id, &self.md),
            SuccessorKind::RekeyOnly => {
                prev.check_valid_rekey_successor(self.codec, prev_id, &self.md)
            }
        }
    }

    pub fn into_outcome(self) -> RekeyOutcome {
        RekeyOutcome {
            md: self.md,
            extra: self.extra,
            server_halves: self.server_halves,
            removal: self.removal,
        }
    }
}
