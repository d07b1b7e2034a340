//! Source identities: random codenames, derived filesystem ids, display labels
//!
//! A codename is a sequence of BIP-39 English words drawn from the OS CSPRNG.
//! Both the filesystem id and the key that seals the source's private key
//! are Argon2id stretches of the codename, each under its own deployment
//! pepper. The display label is drawn independently so that a leaked label
//! reveals nothing about either.

use std::sync::Arc;

use argon2::{Algorithm, Argon2, Params, Version};
use bip39::Language;
use rand::RngCore;
use sdv_core::config::KeyConfig;
use sdv_core::{DisplayLabel, FilesystemId, VaultError, VaultResult};
use secrecy::{ExposeSecret, SecretString};
use zeroize::{Zeroize, Zeroizing};

use crate::KEY_SIZE;

pub use sdv_core::config::MAX_CODENAME_LEN;

/// Words in a generated display label
const LABEL_WORDS: usize = 2;

/// Source of cryptographically secure random bytes.
pub trait EntropySource: Send + Sync {
    fn fill(&self, dest: &mut [u8]) -> Result<(), String>;
}

/// The operating system CSPRNG
#[derive(Debug, Default, Clone, Copy)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn fill(&self, dest: &mut [u8]) -> Result<(), String> {
        rand::rngs::OsRng
            .try_fill_bytes(dest)
            .map_err(|e| e.to_string())
    }
}

/// Argon2id work factors for stretching a codename
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StretchCost {
    pub memory_kib: u32,
    pub passes: u32,
    pub lanes: u32,
}

impl Default for StretchCost {
    fn default() -> Self {
        Self {
            memory_kib: 64 * 1024,
            passes: 3,
            lanes: 4,
        }
    }
}

impl From<&KeyConfig> for StretchCost {
    fn from(config: &KeyConfig) -> Self {
        Self {
            memory_kib: config.argon2_mem_cost_kib,
            passes: config.argon2_time_cost,
            lanes: config.argon2_parallelism,
        }
    }
}

/// A deployment-wide secret used as the Argon2id salt.
///
/// There is one pepper per purpose (filesystem ids, key sealing) so the
/// outputs for one codename are unrelated. The salt is fixed rather than
/// random because a codename must always stretch to the same bytes.
#[derive(Clone)]
pub struct Pepper {
    bytes: Zeroizing<Vec<u8>>,
    cost: StretchCost,
}

impl std::fmt::Debug for Pepper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pepper")
            .field("bytes", &"[REDACTED]")
            .field("cost", &self.cost)
            .finish()
    }
}

impl Pepper {
    pub fn new(bytes: &[u8], cost: StretchCost) -> Self {
        Self {
            bytes: Zeroizing::new(bytes.to_vec()),
            cost,
        }
    }

    pub fn cost(&self) -> StretchCost {
        self.cost
    }

    /// Argon2id of a valid codename under this pepper.
    pub fn stretch(&self, codename: &SecretString) -> VaultResult<Zeroizing<[u8; KEY_SIZE]>> {
        let phrase = codename.expose_secret();
        validate_codename(phrase)?;

        let StretchCost {
            memory_kib,
            passes,
            lanes,
        } = self.cost;
        let params = Params::new(memory_kib, passes, lanes, Some(KEY_SIZE))
            .map_err(|e| VaultError::Config(format!("argon2 cost rejected: {e}")))?;

        let mut out = Zeroizing::new([0u8; KEY_SIZE]);
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
            .hash_password_into(phrase.as_bytes(), &self.bytes, &mut out[..])
            .map_err(|e| VaultError::Config(format!("argon2 rejected pepper: {e}")))?;
        Ok(out)
    }
}

/// Generates and derives source identities.
#[derive(Clone)]
pub struct IdentityCodec {
    id_pepper: Pepper,
    words: usize,
    entropy: Arc<dyn EntropySource>,
}

impl std::fmt::Debug for IdentityCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityCodec")
            .field("id_pepper", &self.id_pepper)
            .field("words", &self.words)
            .finish_non_exhaustive()
    }
}

impl IdentityCodec {
    pub fn new(id_pepper: Pepper, words: usize) -> Self {
        Self {
            id_pepper,
            words,
            entropy: Arc::new(OsEntropy),
        }
    }

    pub fn from_config(config: &KeyConfig) -> Self {
        Self::new(
            Pepper::new(config.id_pepper.as_bytes(), StretchCost::from(config)),
            config.codename_words,
        )
    }

    /// Replace the random source (tests use this to simulate a dead RNG).
    pub fn with_entropy(mut self, entropy: Arc<dyn EntropySource>) -> Self {
        self.entropy = entropy;
        self
    }

    /// Generate a fresh codename of `words` space-separated words.
    pub fn generate_secret(&self) -> VaultResult<SecretString> {
        let words = self.random_words(self.words)?;
        Ok(SecretString::from(words.join(" ")))
    }

    /// Derive the filesystem id for a codename.
    ///
    /// Deterministic and one-way: the same codename always yields the same
    /// id, and the id cannot be inverted without brute-forcing Argon2id.
    pub fn derive_filesystem_id(&self, secret: &SecretString) -> VaultResult<FilesystemId> {
        let digest = self.id_pepper.stretch(secret)?;
        FilesystemId::parse(&hex::encode(&digest[..]))
    }

    /// Generate a random display label such as `quiet_harbor`.
    pub fn generate_display_label(&self) -> VaultResult<DisplayLabel> {
        let words = self.random_words(LABEL_WORDS)?;
        DisplayLabel::parse(&words.join("_"))
    }

    fn random_words(&self, count: usize) -> VaultResult<Vec<&'static str>> {
        let wordlist = Language::English.word_list();
        let mut buf = vec![0u8; count * 2];
        self.entropy
            .fill(&mut buf)
            .map_err(VaultError::EntropyUnavailable)?;

        // 65536 is a multiple of the 2048-word list, so the modulo is unbiased.
        let words = buf
            .chunks_exact(2)
            .map(|pair| {
                let index = usize::from(u16::from_be_bytes([pair[0], pair[1]]));
                wordlist[index % wordlist.len()]
            })
            .collect();
        buf.zeroize();
        Ok(words)
    }
}

/// Cheap Argon2id settings so tests do not spend seconds per derivation
#[cfg(test)]
pub(crate) fn test_pepper(bytes: &[u8]) -> Pepper {
    Pepper::new(
        bytes,
        StretchCost {
            memory_kib: 1024,
            passes: 1,
            lanes: 1,
        },
    )
}

/// Reject codenames that could never have been generated.
pub fn validate_codename(codename: &str) -> VaultResult<()> {
    if codename.is_empty() {
        return Err(VaultError::InvalidCodename("empty"));
    }
    if codename.len() > MAX_CODENAME_LEN {
        return Err(VaultError::InvalidCodename("too long"));
    }
    if !codename.bytes().all(|b| b.is_ascii_lowercase() || b == b' ') {
        return Err(VaultError::InvalidCodename(
            "only lowercase words separated by spaces are allowed",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn codec() -> IdentityCodec {
        IdentityCodec::new(test_pepper(b"test-id-pepper"), 7)
    }

    struct DeadEntropy;

    impl EntropySource for DeadEntropy {
        fn fill(&self, _dest: &mut [u8]) -> Result<(), String> {
            Err("getrandom: device not configured".into())
        }
    }

    #[test]
    fn test_generate_secret_word_count() {
        let secret = codec().generate_secret().unwrap();
        let words: Vec<&str> = secret.expose_secret().split(' ').collect();
        assert_eq!(words.len(), 7);
        let wordlist = Language::English.word_list();
        assert!(words.iter().all(|w| wordlist.contains(w)));
    }

    #[test]
    fn test_generated_secrets_are_unique() {
        let codec = codec();
        let secrets: HashSet<String> = (0..200)
            .map(|_| codec.generate_secret().unwrap().expose_secret().to_string())
            .collect();
        assert_eq!(secrets.len(), 200);
    }

    #[test]
    fn test_generated_secret_is_valid_codename() {
        let secret = codec().generate_secret().unwrap();
        assert!(validate_codename(secret.expose_secret()).is_ok());
    }

    #[test]
    fn test_derive_is_deterministic() {
        let codec = codec();
        let secret = codec.generate_secret().unwrap();
        let id1 = codec.derive_filesystem_id(&secret).unwrap();
        let id2 = codec.derive_filesystem_id(&secret).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(id1.as_str().len(), sdv_core::types::FILESYSTEM_ID_LEN);
    }

    #[test]
    fn test_derive_depends_on_pepper() {
        let secret = SecretString::from("abandon ability able about above absent absorb");
        let a = IdentityCodec::new(test_pepper(b"pepper-aaaa"), 7);
        let b = IdentityCodec::new(test_pepper(b"pepper-bbbb"), 7);
        assert_ne!(
            a.derive_filesystem_id(&secret).unwrap(),
            b.derive_filesystem_id(&secret).unwrap()
        );
    }

    #[test]
    fn test_derive_does_not_embed_secret() {
        let codec = codec();
        let secret = SecretString::from("zoo zoo zoo zoo zoo zoo zoo");
        let id = codec.derive_filesystem_id(&secret).unwrap();
        assert!(!id.as_str().contains("zoo"));
    }

    #[test]
    fn test_derive_rejects_invalid_codenames() {
        let codec = codec();
        for bad in ["", "Upper Case", "../../etc", "semi;colon"] {
            let err = codec
                .derive_filesystem_id(&SecretString::from(bad))
                .unwrap_err();
            assert!(matches!(err, VaultError::InvalidCodename(_)), "{bad:?}");
        }
        let long = "a".repeat(MAX_CODENAME_LEN + 1);
        assert!(codec.derive_filesystem_id(&SecretString::from(long)).is_err());
    }

    #[test]
    fn test_short_pepper_is_a_config_error() {
        let codec = IdentityCodec::new(test_pepper(b"short"), 7);
        let err = codec
            .derive_filesystem_id(&SecretString::from("zoo zoo zoo zoo"))
            .unwrap_err();
        assert!(matches!(err, VaultError::Config(_)));
    }

    #[test]
    fn test_stretch_cost_from_config() {
        let config = KeyConfig {
            argon2_mem_cost_kib: 2048,
            argon2_time_cost: 2,
            argon2_parallelism: 1,
            ..Default::default()
        };
        let cost = StretchCost::from(&config);
        assert_eq!(
            cost,
            StretchCost {
                memory_kib: 2048,
                passes: 2,
                lanes: 1
            }
        );
    }

    #[test]
    fn test_pepper_debug_is_redacted() {
        let rendered = format!("{:?}", test_pepper(b"very-secret-pepper"));
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("very-secret"));
    }

    #[test]
    fn test_longest_codename_fits() {
        let longest = Language::English
            .word_list()
            .iter()
            .map(|w| w.len())
            .max()
            .unwrap();
        let words = sdv_core::config::MAX_CODENAME_WORDS;
        assert!(words * longest + (words - 1) <= MAX_CODENAME_LEN);

        let codec = IdentityCodec::new(test_pepper(b"test-id-pepper"), words);
        for _ in 0..20 {
            let secret = codec.generate_secret().unwrap();
            assert!(validate_codename(secret.expose_secret()).is_ok());
        }
    }

    #[test]
    fn test_display_label_shape() {
        let label = codec().generate_display_label().unwrap();
        let parts: Vec<&str> = label.as_str().split('_').collect();
        assert_eq!(parts.len(), LABEL_WORDS);
    }

    #[test]
    fn test_dead_entropy_is_reported() {
        let codec = codec().with_entropy(Arc::new(DeadEntropy));
        assert!(matches!(
            codec.generate_secret(),
            Err(VaultError::EntropyUnavailable(_))
        ));
        assert!(matches!(
            codec.generate_display_label(),
            Err(VaultError::EntropyUnavailable(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_distinct_secrets_distinct_ids(
            a in "[a-z]{3,12}( [a-z]{3,12}){3,6}",
            b in "[a-z]{3,12}( [a-z]{3,12}){3,6}",
        ) {
            prop_assume!(a != b);
            let codec = codec();
            let id_a = codec.derive_filesystem_id(&SecretString::from(a)).unwrap();
            let id_b = codec.derive_filesystem_id(&SecretString::from(b)).unwrap();
            prop_assert_ne!(id_a, id_b);
        }
    }
}
