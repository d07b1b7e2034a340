//! Sealing private key material under a codename-derived key
//!
//! Sealed format (binary):
//! ```text
//! [24 bytes: random nonce][N bytes: ciphertext][16 bytes: Poly1305 tag]
//! ```
//! The AAD binds the sealed blob to the identity it belongs to, so a record
//! copied under another filesystem id will not open.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// Symmetric key material, wiped on drop
pub type SealKey = Zeroizing<[u8; KEY_SIZE]>;

/// HKDF-SHA256 subkey of `ikm` for the domain named by `info`.
pub fn derive_subkey(ikm: &[u8; KEY_SIZE], info: &[u8]) -> anyhow::Result<SealKey> {
    let mut okm = Zeroizing::new([0u8; KEY_SIZE]);
    Hkdf::<Sha256>::new(None, ikm)
        .expand(info, &mut okm[..])
        .map_err(|e| anyhow::anyhow!("HKDF expand failed: {e}"))?;
    Ok(okm)
}

/// Seal `plaintext` with XChaCha20-Poly1305 under `key`, authenticating `aad`.
pub fn seal(key: &[u8; KEY_SIZE], aad: &[u8], plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rngs::OsRng
        .try_fill_bytes(&mut nonce_bytes)
        .map_err(|e| anyhow::anyhow!("nonce generation failed: {e}"))?;
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| anyhow::anyhow!("sealing failed: {e}"))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Open a blob produced by [`seal`]. The plaintext is zeroized on drop.
pub fn open(
    key: &[u8; KEY_SIZE],
    aad: &[u8],
    sealed: &[u8],
) -> anyhow::Result<Zeroizing<Vec<u8>>> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        anyhow::bail!(
            "sealed blob too short: {} bytes (minimum {})",
            sealed.len(),
            NONCE_SIZE + TAG_SIZE
        );
    }

    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
    let nonce = XNonce::from_slice(nonce_bytes);
    let cipher = XChaCha20Poly1305::new(key.into());

    let plaintext = cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| anyhow::anyhow!("unsealing failed: wrong key or corrupted data"))?;

    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; KEY_SIZE] {
        [42u8; KEY_SIZE]
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let key = test_key();
        let sealed = seal(&key, b"owner-a", b"AGE-SECRET-KEY-1XYZ").unwrap();
        let opened = open(&key, b"owner-a", &sealed).unwrap();
        assert_eq!(opened.as_slice(), b"AGE-SECRET-KEY-1XYZ");
    }

    #[test]
    fn test_open_wrong_key_fails() {
        let sealed = seal(&[1u8; KEY_SIZE], b"a", b"secret").unwrap();
        let result = open(&[2u8; KEY_SIZE], b"a", &sealed);
        assert!(result.is_err());
    }

    #[test]
    fn test_open_wrong_aad_fails() {
        let key = test_key();
        let sealed = seal(&key, b"owner-a", b"secret").unwrap();
        assert!(open(&key, b"owner-b", &sealed).is_err());
    }

    #[test]
    fn test_open_truncated_fails() {
        let key = test_key();
        let sealed = seal(&key, b"a", b"secret").unwrap();
        assert!(open(&key, b"a", &sealed[..NONCE_SIZE]).is_err());
    }

    #[test]
    fn test_sealed_size() {
        let sealed = seal(&test_key(), b"", &[0u8; 10]).unwrap();
        assert_eq!(sealed.len(), NONCE_SIZE + 10 + TAG_SIZE);
    }

    #[test]
    fn test_subkeys_differ_by_domain() {
        let key = test_key();
        let a = derive_subkey(&key, b"sdvault-identity-seal").unwrap();
        let b = derive_subkey(&key, b"sdvault-other").unwrap();
        assert_ne!(*a, *b);
    }
}
