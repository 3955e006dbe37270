use tlfkeys_core::UserId;
use tlfkeys_crypto::{
    decrypt_client_half, encrypt_client_half, encrypt_historic_key, generate_crypt_keypair,
    generate_ephemeral_keypair, generate_tlf_crypt_key, mask_tlf_crypt_key, server_half_id,
    CryptoPure, StdCrypto,
};

#[divan::bench]
fn bench_encrypt_client_half(bencher: divan::Bencher) {
    let (device_pub, _) = generate_crypt_keypair();
    let (_, eph_priv) = generate_ephemeral_keypair();
    let key = generate_tlf_crypt_key();
    let half = StdCrypto.make_random_server_half().unwrap();
    let client = mask_tlf_crypt_key(&half, &key);
    bencher.bench(|| {
        encrypt_client_half(
            divan::black_box(&eph_priv),
            divan::black_box(&device_pub),
            divan::black_box(&client),
        )
        .unwrap()
    });
}

#[divan::bench]
fn bench_decrypt_client_half(bencher: divan::Bencher) {
    let (device_pub, device_priv) = generate_crypt_keypair();
    let (eph_pub, eph_priv) = generate_ephemeral_keypair();
    let key = generate_tlf_crypt_key();
    let half = StdCrypto.make_random_server_half().unwrap();
    let sealed = encrypt_client_half(&eph_priv, &device_pub, &mask_tlf_crypt_key(&half, &key))
        .unwrap();
    bencher.bench(|| {
        decrypt_client_half(
            divan::black_box(&device_priv),
            divan::black_box(&eph_pub),
            divan::black_box(&sealed),
        )
        .unwrap()
    });
}

#[divan::bench]
fn bench_server_half_id(bencher: divan::Bencher) {
    let uid = UserId::new("bench-user");
    let (device_pub, _) = generate_crypt_keypair();
    let half = StdCrypto.make_random_server_half().unwrap();
    bencher.bench(|| {
        server_half_id(
            divan::black_box(&uid),
            divan::black_box(&device_pub),
            divan::black_box(&half),
        )
    });
}

#[divan::bench]
fn bench_historic_link(bencher: divan::Bencher) {
    let previous = generate_tlf_crypt_key();
    let next = generate_tlf_crypt_key();
    bencher.bench(|| {
        encrypt_historic_key(divan::black_box(&previous), divan::black_box(&next)).unwrap()
    });
}

fn main() {
    divan::main();
}
