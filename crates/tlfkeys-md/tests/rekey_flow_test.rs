//! End-to-end rekey flows over both metadata formats.
//!
//! Each test plays the writer (running the engine) and the devices (recovering
//! the folder key from their bundle entry plus the uploaded server half), with
//! no I/O in between.

use std::collections::BTreeSet;

use tlfkeys_core::{JsonCodec, KeyGen, MetadataVersion, TlfId, TlfKeysError, TlfType, UserId};
use tlfkeys_crypto::{
    generate_crypt_keypair, generate_ephemeral_keypair, generate_tlf_crypt_key,
    generate_tlf_keypair, unmask_tlf_crypt_key, CryptPrivateKey, CryptPublicKey, CryptoPure,
    Signer, SigningKey, StdCrypto, TlfCryptKey,
};
use tlfkeys_md::{
    make_initial_root_metadata, BundleUpdate, DevicePublicKeys, ExtraMetadata, MetadataFormat,
    RekeyEngine, RekeyOptions, RekeyOutcome, RootMetadata, StaticTeamMembership, SuccessorKind,
    UserDevicePublicKeys,
};

struct Device {
    uid: UserId,
    public: CryptPublicKey,
    private: CryptPrivateKey,
}

impl Device {
    fn new(uid: &str) -> Self {
        let (public, private) = generate_crypt_keypair();
        Self {
            uid: UserId::new(uid),
            public,
            private,
        }
    }
}

fn targets(devices: &[&Device]) -> UserDevicePublicKeys {
    let mut out = UserDevicePublicKeys::new();
    for device in devices {
        out.entry(device.uid.clone())
            .or_insert_with(DevicePublicKeys::new)
            .insert(device.public);
    }
    out
}

/// What a device does after a rekey: fetch its params, fetch its server half,
/// unbox, unmask.
fn recover_key(
    md: &RootMetadata,
    extra: Option<&ExtraMetadata>,
    outcome_halves: &[tlfkeys_md::RekeyBatch],
    key_gen: KeyGen,
    device: &Device,
) -> TlfCryptKey {
    let params = md
        .crypt_key_params(key_gen, &device.uid, &device.public, extra)
        .unwrap()
        .expect("device has an entry");
    let server_half = outcome_halves
        .iter()
        .find(|batch| batch.key_gen == key_gen)
        .and_then(|batch| batch.server_halves.get(&device.uid))
        .and_then(|halves| halves.get(&device.public))
        .expect("server half was produced");
    assert_eq!(
        StdCrypto
            .server_half_id(&device.uid, &device.public, server_half)
            .unwrap(),
        params.server_half_id
    );
    let client_half = StdCrypto
        .decrypt_client_half(&device.private, &params.ephemeral_public_key, &params.client_half)
        .unwrap();
    unmask_tlf_crypt_key(server_half, &client_half)
}

fn first_key_generation(
    md: RootMetadata,
    writers: &UserDevicePublicKeys,
    readers: &UserDevicePublicKeys,
    key: &TlfCryptKey,
    signer: &SigningKey,
) -> RekeyOutcome {
    let codec = JsonCodec;
    let (tlf_pub, _) = generate_tlf_keypair();
    let (eph_pub, eph_priv) = generate_ephemeral_keypair();
    let mut engine = RekeyEngine::new(&codec, &StdCrypto, md, None, RekeyOptions::default());
    engine
        .add_key_generation(
            BundleUpdate {
                writers,
                readers,
                ephemeral_public_key: eph_pub,
                ephemeral_private_key: &eph_priv,
            },
            tlf_pub,
            &TlfCryptKey::zero(),
            key,
        )
        .unwrap();
    engine.finalize().unwrap();
    engine.sign_writer_metadata(signer).unwrap();
    engine.into_outcome()
}

#[test]
fn segregated_rekey_revoke_and_history() {
    let codec = JsonCodec;
    let membership = StaticTeamMembership::new();
    let alice_key = SigningKey::generate();
    let alice = Device::new("alice");
    let bob = Device::new("bob");
    let k1 = generate_tlf_crypt_key();

    let md0 = make_initial_root_metadata(3, TlfId::random(), TlfType::Private, alice.uid.clone(), vec![])
        .unwrap();
    let first = first_key_generation(
        md0,
        &targets(&[&alice]),
        &targets(&[&bob]),
        &k1,
        &alice_key,
    );
    let md1 = first.md.clone();
    let extra1 = first.extra.clone().unwrap();
    assert_eq!(md1.latest_key_generation(), KeyGen(1));
    md1.is_valid_and_signed(&codec, &StdCrypto, &membership, Some(&extra1), &alice_key.verifying_key())
        .unwrap();

    for device in [&alice, &bob] {
        let key = recover_key(&md1, Some(&extra1), &first.server_halves, KeyGen(1), device);
        assert_eq!(key.as_bytes(), k1.as_bytes());
    }
    assert!(md1
        .is_writer(&alice.uid, Some(&alice.public), &alice_key.verifying_key(), &membership, Some(&extra1))
        .unwrap());
    assert!(!md1
        .is_writer(&bob.uid, None, &alice_key.verifying_key(), &membership, Some(&extra1))
        .unwrap());
    assert!(md1.is_reader(&bob.uid, None, &membership, Some(&extra1)).unwrap());

    // Bob loses access: revoke, then key a new generation without him.
    let md1_id = md1.md_id(&codec).unwrap();
    let (md2, extra2) = md1
        .make_successor_copy(&codec, &StdCrypto, Some(&extra1), MetadataVersion::LATEST, || Ok(Vec::new()), true)
        .unwrap();
    assert!(!extra2.as_ref().unwrap().is_writer_bundle_new());

    let writers = targets(&[&alice]);
    let readers = UserDevicePublicKeys::new();
    let k2 = generate_tlf_crypt_key();
    let (tlf_pub, _) = generate_tlf_keypair();
    let (eph_pub, eph_priv) = generate_ephemeral_keypair();
    let mut engine = RekeyEngine::new(&codec, &StdCrypto, md2, extra2, RekeyOptions::default());

    let removal = engine.revoke_removed_devices(&writers, &readers).unwrap();
    let bob_removal = removal.get(&bob.uid).unwrap();
    assert!(bob_removal.user_removed);
    assert_eq!(removal.server_half_ids().len(), 1);

    engine
        .add_key_generation(
            BundleUpdate {
                writers: &writers,
                readers: &readers,
                ephemeral_public_key: eph_pub,
                ephemeral_private_key: &eph_priv,
            },
            tlf_pub,
            &k1,
            &k2,
        )
        .unwrap();
    engine.finalize().unwrap();
    engine.sign_writer_metadata(&alice_key).unwrap();
    engine
        .check_publishable(&md1, &md1_id, SuccessorKind::Full)
        .unwrap();
    engine
        .check_publishable(&md1, &md1_id, SuccessorKind::RekeyOnly)
        .unwrap();

    let second = engine.into_outcome();
    let md2 = &second.md;
    let extra2 = second.extra.as_ref().unwrap();
    assert_eq!(second.removal, removal);
    md2.is_valid_and_signed(&codec, &StdCrypto, &membership, Some(extra2), &alice_key.verifying_key())
        .unwrap();
    assert!(!md2.is_reader(&bob.uid, None, &membership, Some(extra2)).unwrap());

    let latest = recover_key(md2, Some(extra2), &second.server_halves, KeyGen(2), &alice);
    assert_eq!(latest.as_bytes(), k2.as_bytes());
    let old = md2
        .historic_tlf_crypt_key(&StdCrypto, KeyGen(1), &latest, Some(extra2))
        .unwrap();
    assert_eq!(old.as_bytes(), k1.as_bytes());

    // Anything beyond the bundles makes it no longer a pure rekey.
    let mut tampered = md2.clone();
    tampered.set_serialized_private_metadata(vec![7; 16]);
    assert!(matches!(
        md1.check_valid_rekey_successor(&codec, &md1_id, &tampered),
        Err(TlfKeysError::Successor(_))
    ));
}

#[test]
fn embedded_rekey_adds_devices_to_every_generation() {
    let codec = JsonCodec;
    let membership = StaticTeamMembership::new();
    let alice_key = SigningKey::generate();
    let alice = Device::new("alice");
    let laptop = Device::new("alice");
    let k1 = generate_tlf_crypt_key();

    let md0 = make_initial_root_metadata(2, TlfId::random(), TlfType::Private, alice.uid.clone(), vec![])
        .unwrap();
    let first = first_key_generation(
        md0,
        &targets(&[&alice]),
        &UserDevicePublicKeys::new(),
        &k1,
        &alice_key,
    );
    assert!(first.extra.is_none());
    let md1 = first.md;
    md1.is_valid_and_signed(&codec, &StdCrypto, &membership, None, &alice_key.verifying_key())
        .unwrap();
    let md1_id = md1.md_id(&codec).unwrap();

    let (md2, extra2) = md1
        .make_successor_copy(&codec, &StdCrypto, None, MetadataVersion::INITIAL_EXTRA, || Ok(Vec::new()), true)
        .unwrap();
    assert!(extra2.is_none());
    assert!(matches!(md2, RootMetadata::V2(_)));

    let both = targets(&[&alice, &laptop]);
    let readers = UserDevicePublicKeys::new();
    let (eph_pub, eph_priv) = generate_ephemeral_keypair();
    let update = BundleUpdate {
        writers: &both,
        readers: &readers,
        ephemeral_public_key: eph_pub,
        ephemeral_private_key: &eph_priv,
    };
    let mut engine = RekeyEngine::new(&codec, &StdCrypto, md2, None, RekeyOptions::default());
    engine
        .update_key_bundles(update, std::slice::from_ref(&k1))
        .unwrap();

    // A generation can't name both a writer and a reader; the failed call
    // leaves everything as it was.
    let before = engine.md().clone();
    let overlap = targets(&[&laptop]);
    assert!(matches!(
        engine.update_key_bundles(
            BundleUpdate {
                readers: &overlap,
                ..update
            },
            std::slice::from_ref(&k1),
        ),
        Err(TlfKeysError::Precondition(_))
    ));
    assert_eq!(engine.md(), &before);

    let k2 = generate_tlf_crypt_key();
    let (tlf_pub, _) = generate_tlf_keypair();
    engine
        .add_key_generation(update, tlf_pub, &TlfCryptKey::zero(), &k2)
        .unwrap();
    engine.finalize().unwrap();
    engine.sign_writer_metadata(&alice_key).unwrap();
    engine.check_publishable(&md1, &md1_id, SuccessorKind::Full).unwrap();

    let outcome = engine.into_outcome();
    assert_eq!(
        outcome.server_halves.iter().map(|b| b.key_gen).collect::<Vec<_>>(),
        vec![KeyGen(1), KeyGen(2)]
    );
    let old = recover_key(&outcome.md, None, &outcome.server_halves, KeyGen(1), &laptop);
    assert_eq!(old.as_bytes(), k1.as_bytes());
    let new = recover_key(&outcome.md, None, &outcome.server_halves, KeyGen(2), &laptop);
    assert_eq!(new.as_bytes(), k2.as_bytes());
    assert!(outcome
        .md
        .historic_tlf_crypt_key(&StdCrypto, KeyGen(1), &k2, None)
        .is_err());
}

#[test]
fn embedded_successor_upconverts_for_writers() {
    let codec = JsonCodec;
    let membership = StaticTeamMembership::new();
    let alice_key = SigningKey::generate();
    let alice = Device::new("alice");
    let k1 = generate_tlf_crypt_key();

    let md0 = make_initial_root_metadata(1, TlfId::random(), TlfType::Private, alice.uid.clone(), vec![])
        .unwrap();
    let first = first_key_generation(
        md0,
        &targets(&[&alice]),
        &UserDevicePublicKeys::new(),
        &k1,
        &alice_key,
    );
    let md1 = first.md;
    let md1_id = md1.md_id(&codec).unwrap();

    // A reader-only client keeps the old format and never needs the keys.
    let (kept, _) = md1
        .make_successor_copy(
            &codec,
            &StdCrypto,
            None,
            MetadataVersion::LATEST,
            || panic!("keys are only needed to up-convert"),
            false,
        )
        .unwrap();
    assert_eq!(kept.version(), MetadataVersion::PRE_EXTRA);

    let (md2, extra2) = md1
        .make_successor_copy(&codec, &StdCrypto, None, MetadataVersion::LATEST, || Ok(vec![k1.clone()]), true)
        .unwrap();
    assert_eq!(md2.version(), MetadataVersion::SEGREGATED_KEY_BUNDLES);
    assert_eq!(md2.latest_key_generation(), KeyGen(1));
    let extra2 = extra2.unwrap();
    assert!(extra2.is_writer_bundle_new() && extra2.is_reader_bundle_new());
    assert!(md2.header().writer_signature.is_none());

    let mut engine = RekeyEngine::new(&codec, &StdCrypto, md2, Some(extra2), RekeyOptions::default());
    engine.finalize().unwrap();
    engine.sign_writer_metadata(&alice_key).unwrap();
    engine.check_publishable(&md1, &md1_id, SuccessorKind::Full).unwrap();

    let outcome = engine.into_outcome();
    let extra = outcome.extra.as_ref().unwrap();
    assert!(extra.is_writer_bundle_new());
    outcome
        .md
        .is_valid_and_signed(&codec, &StdCrypto, &membership, Some(extra), &alice_key.verifying_key())
        .unwrap();

    // The device entry carried over intact: the old server half still opens it.
    let key = recover_key(&outcome.md, Some(extra), &first.server_halves, KeyGen(1), &alice);
    assert_eq!(key.as_bytes(), k1.as_bytes());
}

#[test]
fn reader_promotion_keeps_device_keys() {
    let codec = JsonCodec;
    let alice_key = SigningKey::generate();
    let alice = Device::new("alice");
    let bob = Device::new("bob");
    let k1 = generate_tlf_crypt_key();

    let md0 = make_initial_root_metadata(3, TlfId::random(), TlfType::Private, alice.uid.clone(), vec![])
        .unwrap();
    let first = first_key_generation(md0, &targets(&[&alice]), &targets(&[&bob]), &k1, &alice_key);
    let md1 = first.md.clone();
    let md1_id = md1.md_id(&codec).unwrap();

    let (md2, extra2) = md1
        .make_successor_copy(&codec, &StdCrypto, first.extra.as_ref(), MetadataVersion::LATEST, || Ok(Vec::new()), true)
        .unwrap();
    let mut engine = RekeyEngine::new(&codec, &StdCrypto, md2, extra2, RekeyOptions::default());
    let promoted: BTreeSet<UserId> = [bob.uid.clone()].into_iter().collect();
    engine.promote_readers(&promoted).unwrap();
    assert!(matches!(
        engine.promote_readers(&promoted),
        Err(TlfKeysError::Precondition(_))
    ));
    engine.finalize().unwrap();
    engine.sign_writer_metadata(&alice_key).unwrap();
    engine
        .check_publishable(&md1, &md1_id, SuccessorKind::RekeyOnly)
        .unwrap();

    let outcome = engine.into_outcome();
    let extra = outcome.extra.as_ref().unwrap();
    assert!(extra.is_writer_bundle_new());
    assert!(extra.is_reader_bundle_new());
    assert!(outcome
        .md
        .is_writer(&bob.uid, Some(&bob.public), &alice_key.verifying_key(), &StaticTeamMembership::new(), Some(extra))
        .unwrap());

    let key = recover_key(&outcome.md, Some(extra), &first.server_halves, KeyGen(1), &bob);
    assert_eq!(key.as_bytes(), k1.as_bytes());
}

#[test]
fn promotion_merges_into_writer_after_data_writes() {
    let codec = JsonCodec;
    let membership = StaticTeamMembership::new();
    let alice_key = SigningKey::generate();
    let alice = Device::new("alice");
    let bob_phone = Device::new("bob");
    let bob_laptop = Device::new("bob");
    let k1 = generate_tlf_crypt_key();

    let md0 = make_initial_root_metadata(3, TlfId::random(), TlfType::Private, alice.uid.clone(), vec![])
        .unwrap();
    let first = first_key_generation(md0, &targets(&[&alice]), &targets(&[&bob_phone]), &k1, &alice_key);

    // A data write on top of the keyed revision.
    let md1_id = first.md.md_id(&codec).unwrap();
    let (mut md2, extra2) = first
        .md
        .make_successor_copy(&codec, &StdCrypto, first.extra.as_ref(), MetadataVersion::LATEST, || Ok(Vec::new()), true)
        .unwrap();
    md2.set_ref_bytes(4096);
    md2.set_unref_bytes(1024);
    md2.set_disk_usage(3072);
    md2.sign_writer_metadata(&codec, &alice_key).unwrap();
    first.md.check_valid_successor(&md1_id, &md2).unwrap();
    let md2_id = md2.md_id(&codec).unwrap();

    // Bob gets a writer device, then his reader device is promoted into it.
    let (md3, extra3) = md2
        .make_successor_copy(&codec, &StdCrypto, extra2.as_ref(), MetadataVersion::LATEST, || Ok(Vec::new()), true)
        .unwrap();
    assert_eq!((md3.ref_bytes(), md3.unref_bytes(), md3.disk_usage()), (0, 0, 3072));

    let writers = targets(&[&alice, &bob_laptop]);
    let readers = UserDevicePublicKeys::new();
    let (eph_pub, eph_priv) = generate_ephemeral_keypair();
    let mut engine = RekeyEngine::new(&codec, &StdCrypto, md3, extra3, RekeyOptions::default());
    engine
        .update_key_bundles(
            BundleUpdate {
                writers: &writers,
                readers: &readers,
                ephemeral_public_key: eph_pub,
                ephemeral_private_key: &eph_priv,
            },
            std::slice::from_ref(&k1),
        )
        .unwrap();
    assert_eq!(engine.server_halves().len(), 1);

    let promoted: BTreeSet<UserId> = [bob_phone.uid.clone()].into_iter().collect();
    engine.promote_readers(&promoted).unwrap();
    engine.finalize().unwrap();
    engine.sign_writer_metadata(&alice_key).unwrap();
    engine
        .check_publishable(&md2, &md2_id, SuccessorKind::RekeyOnly)
        .unwrap();

    let outcome = engine.into_outcome();
    let extra = outcome.extra.as_ref().unwrap();
    outcome
        .md
        .is_valid_and_signed(&codec, &StdCrypto, &membership, Some(extra), &alice_key.verifying_key())
        .unwrap();
    assert!(extra.reader_bundle().keys.is_empty());

    let verifier = alice_key.verifying_key();
    for device in [&bob_phone, &bob_laptop] {
        assert!(outcome
            .md
            .is_writer(&device.uid, Some(&device.public), &verifier, &membership, Some(extra))
            .unwrap());
    }
    let from_laptop = recover_key(&outcome.md, Some(extra), &outcome.server_halves, KeyGen(1), &bob_laptop);
    assert_eq!(from_laptop.as_bytes(), k1.as_bytes());
    let from_phone = recover_key(&outcome.md, Some(extra), &first.server_halves, KeyGen(1), &bob_phone);
    assert_eq!(from_phone.as_bytes(), k1.as_bytes());
}
