//! Startup self-check of the encryption backend
//!
//! The vault refuses to serve until a probe round-trips a known plaintext
//! through a known key pair. The probe is a trait object so callers (and
//! tests) can substitute their own.

use std::str::FromStr;

use sdv_core::{VaultError, VaultResult};

use crate::envelope::{self, RecipientKey};

/// Fixed X25519 test identity (scalar = 32 × 0x42, the age test vector).
/// Only ever used to exercise the backend; never a recipient of real data.
pub const SELF_TEST_IDENTITY: &str =
    "AGE-SECRET-KEY-1GFPYYSJZGFPYYSJZGFPYYSJZGFPYYSJZGFPYYSJZGFPYYSJZGFPQ4EGAEX";

const SELF_TEST_PLAINTEXT: &[u8] = b"sdvault backend self-test";

/// A check that the crypto backend works before any request is served.
pub trait BackendProbe: Send + Sync {
    fn name(&self) -> &str;
    fn probe(&self) -> anyhow::Result<()>;
}

/// Encrypts to the fixed test identity and decrypts again.
///
/// Extra recipients (the organizational key) are included in the envelope,
/// so a malformed configured key is caught at startup too.
#[derive(Debug, Clone, Default)]
pub struct RoundTripProbe {
    extra_recipients: Vec<RecipientKey>,
}

impl RoundTripProbe {
    pub fn new(extra_recipients: Vec<RecipientKey>) -> Self {
        Self { extra_recipients }
    }
}

impl BackendProbe for RoundTripProbe {
    fn name(&self) -> &str {
        "age-roundtrip"
    }

    fn probe(&self) -> anyhow::Result<()> {
        let identity = age::x25519::Identity::from_str(SELF_TEST_IDENTITY)
            .map_err(|e| anyhow::anyhow!("parsing self-test identity: {e}"))?;

        let mut recipients = vec![RecipientKey::from(&identity.to_public())];
        recipients.extend(self.extra_recipients.iter().cloned());

        let ciphertext = envelope::encrypt(SELF_TEST_PLAINTEXT, &recipients)?;
        if ciphertext
            .windows(SELF_TEST_PLAINTEXT.len())
            .any(|w| w == SELF_TEST_PLAINTEXT)
        {
            anyhow::bail!("ciphertext contains the plaintext");
        }

        let plaintext = envelope::decrypt(&ciphertext, &identity)?;
        if plaintext != SELF_TEST_PLAINTEXT {
            anyhow::bail!("round-trip produced different plaintext");
        }
        Ok(())
    }
}

/// Run `probe`, mapping any failure to `CryptoBackendUnhealthy`.
pub fn run_startup_check(probe: &dyn BackendProbe) -> VaultResult<()> {
    match probe.probe() {
        Ok(()) => {
            tracing::info!(probe = probe.name(), "crypto backend self-check passed");
            Ok(())
        }
        Err(e) => {
            tracing::error!(
                target: "sdvault::audit",
                probe = probe.name(),
                error = %format!("{e:#}"),
                "crypto backend self-check failed; refusing to serve"
            );
            Err(VaultError::CryptoBackendUnhealthy(format!("{}: {e:#}", probe.name())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenProbe;

    impl BackendProbe for BrokenProbe {
        fn name(&self) -> &str {
            "broken"
        }

        fn probe(&self) -> anyhow::Result<()> {
            anyhow::bail!("decryption returned garbage")
        }
    }

    #[test]
    fn test_self_test_identity_is_known_pair() {
        let identity = age::x25519::Identity::from_str(SELF_TEST_IDENTITY).unwrap();
        assert_eq!(
            identity.to_public().to_string(),
            "age1zvkyg2lqzraa2lnjvqej32nkuu0ues2s82hzrye869xeexvn73equnujwj"
        );
    }

    #[test]
    fn test_roundtrip_self_check_passes() {
        assert!(run_startup_check(&RoundTripProbe::default()).is_ok());
    }

    #[test]
    fn test_roundtrip_self_check_with_org_key() {
        let org = age::x25519::Identity::generate();
        let probe = RoundTripProbe::new(vec![RecipientKey::from(&org.to_public())]);
        assert!(run_startup_check(&probe).is_ok());
    }

    #[test]
    fn test_malformed_org_key_is_unhealthy() {
        let probe = RoundTripProbe::new(vec![RecipientKey::new("age1broken")]);
        assert!(matches!(
            run_startup_check(&probe),
            Err(VaultError::CryptoBackendUnhealthy(_))
        ));
    }

    #[test]
    fn test_failing_self_check_is_unhealthy() {
        let err = run_startup_check(&BrokenProbe).unwrap_err();
        assert!(err.is_security_event());
        assert!(err.to_string().contains("broken"));
    }
}
