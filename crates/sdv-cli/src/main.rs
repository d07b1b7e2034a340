//! sdvault: administrative CLI for the sdvault store
//!
//! Commands:
//!   self-test                 - crypto backend round-trip + store health
//!   config show               - display current configuration (peppers redacted)
//!   codename [-n N]           - generate codenames without creating sources
//!   create-source             - create a source; prints its codename once
//!   submit --id --label FILE  - encrypt and store a message, document, or reply
//!   relabel --id --label NEW  - give a source a new display label
//!   export -o OUT ID/FILE...  - tar stored files in the given order
//!   read FILENAME             - decrypt a source's file (prompts for codename)
//!   verify-path PATH          - check a path stays inside the storage root

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use secrecy::{ExposeSecret, SecretString};

use sdv_core::{DisplayLabel, FileKind, FilesystemId, SdvConfig, SourceRecord, VaultError};
use sdv_crypto::{run_startup_check, IdentityCodec, RecipientKey, RoundTripProbe};
use sdv_store::{health, PathGuard, SourceIdentity, Vault};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "sdvault",
    version,
    about = "Encrypted submission store",
    long_about = "sdvault: create source identities, store encrypted submissions and replies, export bundles"
)]
struct Cli {
    /// Path to sdvault.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "SDVAULT_CONFIG",
        default_value = "/etc/sdvault/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [log].level
    #[arg(long, env = "SDVAULT_LOG")]
    log: Option<String>,

    /// Log format; overrides [log].format
    #[arg(long, env = "SDVAULT_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check the crypto backend and the storage root
    #[command(name = "self-test")]
    SelfTest,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Print freshly generated codenames (nothing is stored)
    Codename {
        /// How many to generate
        #[arg(long, short = 'n', default_value_t = 1)]
        count: usize,
    },

    /// Create a new source identity and its key
    ///
    /// The codename is printed once and never stored; hand it to the source.
    #[command(name = "create-source")]
    CreateSource,

    /// Encrypt a payload for a source and store it
    Submit {
        #[command(flatten)]
        source: SourceArgs,
        /// What the payload is
        #[arg(long, value_enum, default_value = "msg")]
        kind: KindArg,
        /// Payload file (default: stdin)
        input: Option<PathBuf>,
    },

    /// Rename a source's display label and all of its stored files
    Relabel {
        #[command(flatten)]
        source: SourceArgs,
        /// New display label ([a-z0-9_])
        new_label: String,
    },

    /// Bundle stored files into a tar archive
    Export {
        /// Archive destination
        #[arg(long, short = 'o')]
        output: PathBuf,
        /// Entries as {filesystem_id}/{filename}, archived in this order
        #[arg(required = true)]
        files: Vec<String>,
    },

    /// Decrypt one of a source's files by presenting its codename
    Read {
        /// Stored filename, e.g. 3-quiet_harbor-reply.gpg
        filename: String,
        /// Write plaintext here (default: stdout)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },

    /// Check whether a path is confined to the storage root
    #[command(name = "verify-path")]
    VerifyPath {
        /// Absolute, or relative to the storage root
        path: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

/// Source record fields, as held by the record layer
#[derive(Args, Debug)]
struct SourceArgs {
    /// Source filesystem id (64 hex chars)
    #[arg(long = "id")]
    filesystem_id: String,
    /// Current display label
    #[arg(long)]
    label: String,
    /// Last persisted interaction count
    #[arg(long, default_value_t = 0)]
    count: u64,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KindArg {
    Msg,
    Doc,
    Reply,
}

impl From<KindArg> for FileKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Msg => FileKind::Message,
            KindArg::Doc => FileKind::Document,
            KindArg::Reply => FileKind::Reply,
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, found) = load_config(&cli.config).await?;

    let level = cli.log.as_deref().unwrap_or(&config.log.level);
    let format = match cli.log_format {
        Some(format) => format,
        None if config.log.format == "json" => LogFormat::Json,
        None => LogFormat::Text,
    };
    init_logging(level, &format);
    if !found {
        tracing::warn!(
            "config file not found: {}  (using defaults)",
            cli.config.display()
        );
    }

    let result = match cli.command {
        Commands::SelfTest => cmd_self_test(&config),
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &cli.config),
        Commands::Codename { count } => cmd_codename(&config, count),
        Commands::CreateSource => cmd_create_source(&config).await,
        Commands::Submit {
            source,
            kind,
            input,
        } => cmd_submit(&config, &source, kind.into(), input.as_deref()),
        Commands::Relabel { source, new_label } => cmd_relabel(&config, &source, &new_label),
        Commands::Export { output, files } => cmd_export(&config, &output, &files),
        Commands::Read { filename, output } => cmd_read(&config, &filename, output.as_deref()),
        Commands::VerifyPath { path } => cmd_verify_path(&config, &path),
    };

    if let Some(err) = result
        .as_ref()
        .err()
        .and_then(|e| e.downcast_ref::<VaultError>())
    {
        if err.is_security_event() {
            tracing::warn!(target: "sdvault::audit", error = %err, "security event");
        }
    }
    result
}

// ── Config loading ────────────────────────────────────────────────────────────

/// Returns the config and whether it came from a file.
async fn load_config(path: &Path) -> Result<(SdvConfig, bool)> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((SdvConfig::default(), false))
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Logs go to stderr; stdout carries command output
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn org_recipients(config: &SdvConfig) -> Vec<RecipientKey> {
    config
        .keys
        .recipient_public_key
        .iter()
        .map(RecipientKey::new)
        .collect()
}

fn open_vault(config: &SdvConfig) -> Result<Vault> {
    let probe = RoundTripProbe::new(org_recipients(config));
    Vault::open(config, &probe).context("opening vault")
}

/// Rebuild the live identity from CLI-supplied record fields.
fn load_source(vault: &Vault, args: &SourceArgs) -> Result<Arc<SourceIdentity>> {
    let filesystem_id = FilesystemId::parse(&args.filesystem_id)?;
    let display_label = DisplayLabel::parse(&args.label)?;

    // Never reuse a sequence already on disk, even if --count is stale
    let on_disk = vault
        .list_files(&filesystem_id)
        .with_context(|| format!("unknown source {filesystem_id}"))?
        .iter()
        .map(|f| f.name.sequence)
        .max()
        .unwrap_or(0);

    Ok(vault.load_source(&SourceRecord {
        filesystem_id,
        display_label,
        interaction_count: args.count.max(on_disk),
    }))
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("serializing output")?;
    println!("{rendered}");
    Ok(())
}

// ── `sdvault self-test` ───────────────────────────────────────────────────────

fn cmd_self_test(config: &SdvConfig) -> Result<()> {
    let probe = RoundTripProbe::new(org_recipients(config));
    run_startup_check(&probe).context("crypto backend")?;
    println!("crypto backend:  ok");

    health::check_health(&config.store.root)?;
    println!("storage root:    ok ({})", config.store.root.display());

    match config.validate() {
        Ok(()) => println!("configuration:   ok"),
        Err(e) => println!("configuration:   {e}"),
    }
    Ok(())
}

// ── `sdvault config show` ─────────────────────────────────────────────────────

fn cmd_config_show(config: &SdvConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!(
            "# Configuration: defaults (no file at {})",
            config_path.display()
        );
    }
    println!();

    let mut shown = config.clone();
    for pepper in [&mut shown.keys.id_pepper, &mut shown.keys.key_pepper] {
        if !pepper.is_empty() {
            *pepper = "<redacted>".into();
        }
    }
    let rendered = toml::to_string_pretty(&shown).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

// ── `sdvault codename` ────────────────────────────────────────────────────────

fn cmd_codename(config: &SdvConfig, count: usize) -> Result<()> {
    let codec = IdentityCodec::from_config(&config.keys);
    for _ in 0..count {
        let codename = codec.generate_secret()?;
        println!("{}", codename.expose_secret());
    }
    Ok(())
}

// ── `sdvault create-source` ───────────────────────────────────────────────────

async fn cmd_create_source(config: &SdvConfig) -> Result<()> {
    let vault = open_vault(config)?;
    let source = vault.create_source().await.context("creating source")?;
    let record = source.identity.to_record();

    eprintln!("The codename below is shown once and is not stored anywhere.");
    print_json(&serde_json::json!({
        "codename": source.codename.expose_secret(),
        "filesystem_id": record.filesystem_id,
        "display_label": record.display_label,
        "interaction_count": record.interaction_count,
    }))
}

// ── `sdvault submit` ──────────────────────────────────────────────────────────

fn cmd_submit(
    config: &SdvConfig,
    args: &SourceArgs,
    kind: FileKind,
    input: Option<&Path>,
) -> Result<()> {
    let vault = open_vault(config)?;
    let identity = load_source(&vault, args)?;

    let mut payload = Vec::new();
    match input {
        Some(path) => {
            payload = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?
        }
        None => {
            std::io::stdin()
                .read_to_end(&mut payload)
                .context("reading stdin")?;
        }
    }

    let stored = match kind {
        FileKind::Document => vault.save_file_submission(&identity, &payload)?,
        FileKind::Message | FileKind::Reply => {
            let text = String::from_utf8(payload).context("messages must be UTF-8 text")?;
            if kind == FileKind::Reply {
                vault.save_reply(&identity, &text)?
            } else {
                vault.save_message_submission(&identity, &text)?
            }
        }
    };

    print_json(&serde_json::json!({
        "file": stored,
        "source": identity.to_record(),
    }))
}

// ── `sdvault relabel` ─────────────────────────────────────────────────────────

fn cmd_relabel(config: &SdvConfig, args: &SourceArgs, new_label: &str) -> Result<()> {
    let vault = open_vault(config)?;
    let identity = load_source(&vault, args)?;
    let new_label = DisplayLabel::parse(new_label)?;

    let renamed = vault.relabel(&identity, &new_label)?;
    print_json(&serde_json::json!({
        "renamed": renamed,
        "source": identity.to_record(),
    }))
}

// ── `sdvault export` ──────────────────────────────────────────────────────────

fn cmd_export(config: &SdvConfig, output: &Path, entries: &[String]) -> Result<()> {
    let vault = open_vault(config)?;

    let files = entries
        .iter()
        .map(|entry| {
            let (id, filename) = entry
                .split_once('/')
                .with_context(|| format!("expected {{filesystem_id}}/{{filename}}, got {entry:?}"))?;
            Ok((FilesystemId::parse(id)?, filename.to_string()))
        })
        .collect::<Result<Vec<_>>>()?;

    let archive = vault.bulk_archive(&files)?;
    std::fs::write(output, &archive)
        .with_context(|| format!("writing archive: {}", output.display()))?;
    println!(
        "wrote {} files ({} bytes) to {}",
        files.len(),
        archive.len(),
        output.display()
    );
    Ok(())
}

// ── `sdvault read` ────────────────────────────────────────────────────────────

fn cmd_read(config: &SdvConfig, filename: &str, output: Option<&Path>) -> Result<()> {
    let vault = open_vault(config)?;
    let codename = SecretString::from(
        rpassword::prompt_password("Codename: ").context("reading codename")?,
    );

    let plaintext = vault.read_for_source(&codename, filename)?;
    match output {
        Some(path) => std::fs::write(path, &plaintext)
            .with_context(|| format!("writing {}", path.display()))?,
        None => std::io::stdout()
            .write_all(&plaintext)
            .context("writing stdout")?,
    }
    Ok(())
}

// ── `sdvault verify-path` ─────────────────────────────────────────────────────

fn cmd_verify_path(config: &SdvConfig, path: &Path) -> Result<()> {
    let guard = PathGuard::new(&config.store.root)?;
    let safe = guard.verify(path)?;
    println!("ok: {}", safe.as_path().display());
    Ok(())
}
