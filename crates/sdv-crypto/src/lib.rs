//! sdv-crypto: identity derivation and per-source encryption for sdvault
//!
//! Key hierarchy:
//! ```text
//! Codename (random BIP-39 words, held only by the source)
//!   ├── Filesystem id   = hex(Argon2id(codename, id_pepper))
//!   └── Unlock key      = HKDF(Argon2id(codename, key_pepper), "sdvault-identity-seal")
//!         └── seals the source's age X25519 identity (XChaCha20-Poly1305, AAD = filesystem id)
//! ```
//!
//! Every stored submission and reply is an age envelope addressed to the
//! source's public key and the organizational recipient.

pub mod codename;
pub mod envelope;
pub mod keystore;
pub mod seal;
pub mod selftest;

pub use codename::{EntropySource, IdentityCodec, OsEntropy, Pepper, StretchCost};
pub use envelope::{decrypt, encrypt, RecipientKey};
pub use keystore::KeyStore;
pub use selftest::{run_startup_check, BackendProbe, RoundTripProbe};

/// Size of a derived symmetric key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;
