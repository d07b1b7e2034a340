//! End-to-end tests: sources, submissions, replies, relabel, export, purge

use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sdv_core::{DisplayLabel, SdvConfig, SourceRecord, VaultError};
use sdv_crypto::{BackendProbe, RoundTripProbe};
use sdv_store::Vault;
use secrecy::{ExposeSecret, SecretString};

struct FailingProbe;

impl BackendProbe for FailingProbe {
    fn name(&self) -> &str {
        "stub"
    }

    fn probe(&self) -> anyhow::Result<()> {
        anyhow::bail!("round-trip mismatch")
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    config: SdvConfig,
    org: age::x25519::Identity,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let org = age::x25519::Identity::generate();

    let mut config = SdvConfig::default();
    config.store.root = dir.path().join("store");
    config.keys.keyring_dir = dir.path().join("keys");
    config.keys.recipient_public_key = Some(org.to_public().to_string());
    config.keys.id_pepper = "test-id-pepper".into();
    config.keys.key_pepper = "test-key-pepper".into();
    config.keys.argon2_mem_cost_kib = 1024;
    config.keys.argon2_time_cost = 1;
    config.keys.argon2_parallelism = 1;
    config.jobs.workers = 2;
    config.jobs.poll_interval_ms = 10;
    config.jobs.keygen_timeout_secs = 30;

    Harness {
        _dir: dir,
        config,
        org,
    }
}

fn open(h: &Harness) -> Vault {
    Vault::open(&h.config, &RoundTripProbe::default()).unwrap()
}

fn untar(archive: &[u8]) -> Vec<(String, Vec<u8>)> {
    let mut tar = tar::Archive::new(Cursor::new(archive));
    tar.entries()
        .unwrap()
        .map(|entry| {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents).unwrap();
            (name, contents)
        })
        .collect()
}

fn count_entries(dir: &Path) -> usize {
    std::fs::read_dir(dir).map_or(0, |entries| entries.count())
}

#[test]
fn test_startup_refused_when_self_check_fails() {
    let h = harness();
    let err = Vault::open(&h.config, &FailingProbe).unwrap_err();
    assert!(matches!(err, VaultError::CryptoBackendUnhealthy(_)));
    assert!(!h.config.store.root.exists());
}

#[test]
fn test_startup_requires_org_key() {
    let mut h = harness();
    h.config.keys.recipient_public_key = None;
    assert!(matches!(
        Vault::open(&h.config, &RoundTripProbe::default()),
        Err(VaultError::Config(_))
    ));

    h.config.keys.recipient_public_key = Some("age1garbage".into());
    assert!(matches!(
        Vault::open(&h.config, &RoundTripProbe::default()),
        Err(VaultError::Config(_))
    ));
}

#[tokio::test]
async fn test_create_source_and_submit() {
    let h = harness();
    let vault = open(&h);

    let source = vault.create_source().await.unwrap();
    let identity = &source.identity;
    let label = identity.display_label();
    assert!(vault.keys().has_key(identity.filesystem_id()));
    assert_eq!(source.codename.expose_secret().split(' ').count(), 7);

    let msg = vault
        .save_message_submission(identity, "meet at the usual place")
        .unwrap();
    let doc = vault.save_file_submission(identity, b"%PDF-1.7 ...").unwrap();
    assert_eq!(msg.filename(), format!("1-{label}-msg.gpg"));
    assert_eq!(doc.filename(), format!("2-{label}-doc.gpg"));
    assert_eq!(identity.interaction_count(), 2);

    let listed: Vec<String> = vault
        .list_files(identity.filesystem_id())
        .unwrap()
        .iter()
        .map(|f| f.filename())
        .collect();
    assert_eq!(listed, vec![msg.filename(), doc.filename()]);

    // Nothing on disk is plaintext
    let raw = vault
        .layout()
        .read_file(identity.filesystem_id(), &msg.filename())
        .unwrap();
    assert!(!raw.windows(9).any(|w| w == b"usual pla"));

    // Organization and source can both decrypt
    let by_org = sdv_crypto::decrypt(&raw, &h.org).unwrap();
    assert_eq!(by_org, b"meet at the usual place");
    let by_source = vault
        .read_for_source(&source.codename, &doc.filename())
        .unwrap();
    assert_eq!(by_source, b"%PDF-1.7 ...");
}

#[tokio::test]
async fn test_reply_readable_by_source() {
    let h = harness();
    let vault = open(&h);
    let source = vault.create_source().await.unwrap();

    vault
        .save_message_submission(&source.identity, "hello")
        .unwrap();
    let reply = vault
        .save_reply(&source.identity, "thanks, we received it")
        .unwrap();
    assert!(reply.filename().ends_with("-reply.gpg"));
    assert_eq!(reply.name.sequence, 2);

    let plaintext = vault
        .read_for_source(&source.codename, &reply.filename())
        .unwrap();
    assert_eq!(plaintext, b"thanks, we received it");
}

#[tokio::test]
async fn test_wrong_codename_reads_nothing() {
    let h = harness();
    let vault = open(&h);
    let source = vault.create_source().await.unwrap();
    let reply = vault.save_reply(&source.identity, "x").unwrap();

    let stranger = SecretString::from("abandon ability able about above absent".to_string());
    assert!(matches!(
        vault.read_for_source(&stranger, &reply.filename()),
        Err(VaultError::KeyNotFound(_))
    ));
}

#[tokio::test]
async fn test_bulk_archive_matches_stored_bytes() {
    let h = harness();
    let vault = open(&h);
    let source = vault.create_source().await.unwrap();
    let id = source.identity.filesystem_id().clone();

    let first = vault
        .save_message_submission(&source.identity, "one")
        .unwrap();
    let second = vault.save_reply(&source.identity, "two").unwrap();

    let archive = vault
        .bulk_archive(&[
            (id.clone(), first.filename()),
            (id.clone(), second.filename()),
            (id.clone(), first.filename()),
        ])
        .unwrap();
    let entries = untar(&archive);

    assert_eq!(entries.len(), 3);
    for ((name, bytes), stored) in entries.iter().zip([&first, &second, &first]) {
        assert_eq!(name, &stored.filename());
        assert!(!name.contains(id.as_str()));
        assert_eq!(
            bytes,
            &vault.layout().read_file(&id, &stored.filename()).unwrap()
        );
    }

    let err = vault
        .bulk_archive(&[(id.clone(), "../../keys/x.json".into())])
        .unwrap_err();
    assert!(matches!(err, VaultError::PathEscape(_)));
}

#[tokio::test]
async fn test_relabel_renames_every_file() {
    let h = harness();
    let vault = open(&h);
    let source = vault.create_source().await.unwrap();
    let id = source.identity.filesystem_id().clone();
    let old = source.identity.display_label();

    vault
        .save_message_submission(&source.identity, "a")
        .unwrap();
    vault.save_reply(&source.identity, "b").unwrap();

    let bob = DisplayLabel::parse("bob").unwrap();
    let renamed = vault.relabel(&source.identity, &bob).unwrap();
    assert_eq!(
        renamed,
        vec![
            (format!("1-{old}-msg.gpg"), "1-bob-msg.gpg".to_string()),
            (format!("2-{old}-reply.gpg"), "2-bob-reply.gpg".to_string()),
        ]
    );

    let listed: Vec<String> = vault
        .list_files(&id)
        .unwrap()
        .iter()
        .map(|f| f.filename())
        .collect();
    assert_eq!(listed, vec!["1-bob-msg.gpg", "2-bob-reply.gpg"]);
    assert!(listed.iter().all(|f| !f.contains(old.as_str())));

    // Renamed files still decrypt
    assert_eq!(
        vault
            .read_for_source(&source.codename, "2-bob-reply.gpg")
            .unwrap(),
        b"b"
    );
    assert_eq!(source.identity.to_record().display_label, bob);
}

#[tokio::test]
async fn test_delete_source_cascades() {
    let h = harness();
    let vault = open(&h);
    let source = vault.create_source().await.unwrap();
    let id = source.identity.filesystem_id().clone();
    vault
        .save_message_submission(&source.identity, "bye")
        .unwrap();

    assert!(vault.delete_source(&id).unwrap());
    assert!(!vault.keys().has_key(&id));
    assert!(matches!(vault.list_files(&id), Err(VaultError::NotFound(_))));
    assert!(!vault.delete_source(&id).unwrap());
}

#[tokio::test]
async fn test_concurrent_submissions_get_distinct_sequences() {
    let h = harness();
    let vault = Arc::new(open(&h));
    let source = vault.create_source().await.unwrap();

    std::thread::scope(|scope| {
        for t in 0..4 {
            let vault = vault.clone();
            let identity = source.identity.clone();
            scope.spawn(move || {
                for i in 0..5 {
                    vault
                        .save_message_submission(&identity, &format!("{t}/{i}"))
                        .unwrap();
                }
            });
        }
    });

    let sequences: Vec<u64> = vault
        .list_files(source.identity.filesystem_id())
        .unwrap()
        .iter()
        .map(|f| f.name.sequence)
        .collect();
    assert_eq!(sequences, (1..=20).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_load_source_resumes_counter() {
    let h = harness();
    let source_record: SourceRecord;
    {
        let vault = open(&h);
        let source = vault.create_source().await.unwrap();
        vault
            .save_message_submission(&source.identity, "first run")
            .unwrap();
        source_record = source.identity.to_record();
    }

    // A fresh process sees only the persisted record
    let vault = open(&h);
    let identity = vault.load_source(&source_record);
    let next = vault
        .save_message_submission(&identity, "second run")
        .unwrap();
    assert_eq!(next.name.sequence, 2);

    let same = vault.load_source(&SourceRecord {
        interaction_count: 0,
        ..source_record.clone()
    });
    assert!(Arc::ptr_eq(&identity, &same));
    assert_eq!(same.interaction_count(), 2);
}

#[tokio::test]
async fn test_submissions_racing_relabel_follow_new_label() {
    let h = harness();
    let vault = Arc::new(open(&h));
    let source = vault.create_source().await.unwrap();

    std::thread::scope(|scope| {
        for t in 0..3 {
            let vault = vault.clone();
            let identity = source.identity.clone();
            scope.spawn(move || {
                for i in 0..4 {
                    vault
                        .save_message_submission(&identity, &format!("{t}/{i}"))
                        .unwrap();
                }
            });
        }
        let vault = vault.clone();
        let identity = source.identity.clone();
        scope.spawn(move || {
            for next in ["bob", "carol"] {
                vault
                    .relabel(&identity, &DisplayLabel::parse(next).unwrap())
                    .unwrap();
            }
        });
    });

    let carol = DisplayLabel::parse("carol").unwrap();
    let listed = vault.list_files(source.identity.filesystem_id()).unwrap();
    assert_eq!(listed.len(), 12);
    assert!(listed.iter().all(|f| f.name.label == carol));
}

#[tokio::test]
async fn test_keygen_timeout_abandons_source() {
    let mut h = harness();
    h.config.jobs.keygen_timeout_secs = 0;
    let vault = open(&h);

    let err = vault.create_source().await.unwrap_err();
    assert!(matches!(err, VaultError::JobTimeout { .. }));

    // Key generation still finishes, then the abandoned source is removed
    let mut cleaned = false;
    for _ in 0..200 {
        if count_entries(&h.config.store.root) == 0 && count_entries(&h.config.keys.keyring_dir) == 0
        {
            cleaned = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(cleaned, "abandoned source left directory or key behind");
}

#[tokio::test]
async fn test_pending_source_can_be_awaited_again() {
    let h = harness();
    let vault = open(&h);

    let pending = vault.start_source().await.unwrap();
    assert!(matches!(
        vault.finish_source(&pending, Duration::ZERO).await,
        Err(VaultError::JobTimeout { .. })
    ));

    let source = vault
        .finish_source(&pending, Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(source.identity.filesystem_id(), pending.filesystem_id());
    assert!(vault.keys().has_key(pending.filesystem_id()));

    let reply = vault.save_reply(&source.identity, "still here").unwrap();
    assert_eq!(
        vault
            .read_for_source(&source.codename, &reply.filename())
            .unwrap(),
        b"still here"
    );
}
