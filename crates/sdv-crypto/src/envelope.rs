//! Multi-recipient age envelopes (age 0.11 API)

use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::str::FromStr;

use sdv_core::{VaultError, VaultResult};
use serde::{Deserialize, Serialize};

/// An age X25519 public key (`age1...`) used as an encryption recipient.
///
/// Construction does not validate; malformed keys surface as
/// `EncryptionFailed` when used.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecipientKey(String);

impl RecipientKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check the key parses as an age X25519 recipient.
    pub fn validate(&self) -> VaultResult<()> {
        self.to_age().map(|_| ())
    }

    fn to_age(&self) -> VaultResult<age::x25519::Recipient> {
        age::x25519::Recipient::from_str(&self.0).map_err(|e| {
            VaultError::EncryptionFailed(format!("malformed recipient {:?}: {e}", self.0))
        })
    }
}

impl From<&age::x25519::Recipient> for RecipientKey {
    fn from(recipient: &age::x25519::Recipient) -> Self {
        Self(recipient.to_string())
    }
}

impl std::fmt::Display for RecipientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Encrypt `plaintext` so that any one of `recipients` can decrypt it.
///
/// Duplicate recipients are collapsed. Nothing touches disk; the caller
/// decides where the ciphertext goes.
pub fn encrypt(plaintext: &[u8], recipients: &[RecipientKey]) -> VaultResult<Vec<u8>> {
    let unique: BTreeSet<&RecipientKey> = recipients.iter().collect();
    if unique.is_empty() {
        return Err(VaultError::EncryptionFailed("no recipients".into()));
    }
    let parsed = unique
        .into_iter()
        .map(RecipientKey::to_age)
        .collect::<VaultResult<Vec<_>>>()?;

    let encryptor =
        age::Encryptor::with_recipients(parsed.iter().map(|r| r as &dyn age::Recipient))
            .map_err(|e| VaultError::EncryptionFailed(e.to_string()))?;

    let mut ciphertext = Vec::with_capacity(plaintext.len() + 256 * parsed.len());
    let mut writer = encryptor
        .wrap_output(&mut ciphertext)
        .map_err(|e| VaultError::EncryptionFailed(format!("opening age stream: {e}")))?;
    writer
        .write_all(plaintext)
        .map_err(|e| VaultError::EncryptionFailed(format!("writing age stream: {e}")))?;
    writer
        .finish()
        .map_err(|e| VaultError::EncryptionFailed(format!("finishing age stream: {e}")))?;

    Ok(ciphertext)
}

/// Decrypt an envelope produced by [`encrypt`] with one recipient's identity.
pub fn decrypt(ciphertext: &[u8], identity: &age::x25519::Identity) -> VaultResult<Vec<u8>> {
    let decryptor = age::Decryptor::new(ciphertext)
        .map_err(|e| VaultError::DecryptionFailed(format!("reading age header: {e}")))?;

    // Stored envelopes are always recipient-based; never prompt for a passphrase.
    if decryptor.is_scrypt() {
        return Err(VaultError::DecryptionFailed(
            "passphrase-encrypted envelopes are not accepted".into(),
        ));
    }

    let mut reader = decryptor
        .decrypt(std::iter::once(identity as &dyn age::Identity))
        .map_err(|e| VaultError::DecryptionFailed(e.to_string()))?;

    let mut plaintext = Vec::new();
    reader
        .read_to_end(&mut plaintext)
        .map_err(|e| VaultError::DecryptionFailed(format!("reading age stream: {e}")))?;
    Ok(plaintext)
}
