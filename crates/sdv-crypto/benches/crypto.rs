use sdv_crypto::{encrypt, IdentityCodec, Pepper, RecipientKey, StretchCost};
use secrecy::SecretString;

const CODENAME: &str = "abandon ability able about above absent absorb";

fn payload(len: usize) -> Vec<u8> {
    let mut state = 0x9e37_79b9_u32;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

/// Production Argon2id cost: what a source waits for on login.
#[divan::bench]
fn derive_filesystem_id(bencher: divan::Bencher) {
    let codec = IdentityCodec::new(Pepper::new(b"bench-id-pepper", StretchCost::default()), 7);
    let secret = SecretString::from(CODENAME.to_string());
    bencher.bench(|| codec.derive_filesystem_id(divan::black_box(&secret)).unwrap());
}

#[divan::bench]
fn generate_codename(bencher: divan::Bencher) {
    let codec = IdentityCodec::new(Pepper::new(b"bench-id-pepper", StretchCost::default()), 7);
    bencher.bench(|| codec.generate_secret().unwrap());
}

/// Source key plus organization key, as every submission is stored.
#[divan::bench(args = [4 * 1024, 256 * 1024, 4 * 1024 * 1024])]
fn encrypt_for_source_and_org(bencher: divan::Bencher, len: usize) {
    let recipients = [
        RecipientKey::from(&age::x25519::Identity::generate().to_public()),
        RecipientKey::from(&age::x25519::Identity::generate().to_public()),
    ];
    let submission = payload(len);
    bencher
        .counter(divan::counter::BytesCount::new(len))
        .bench(|| encrypt(divan::black_box(&submission), &recipients).unwrap());
}

fn main() {
    divan::main();
}
