//! dumpseal: sealed database dumps
//!
//! Commands:
//!   backup              - dump the configured database into a sealed artifact
//!   restore <artifact>  - verify an artifact and replay it into the database
//!   verify <artifact>   - decode an artifact end to end without a consumer
//!   inspect <artifact>  - show header and metadata without decrypting
//!   config show         - display the active configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::SecretString;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dumpseal_backup::{
    dump_command, read_sidecar, recorded_format, resolve_password, restore_command, run_backup,
    run_restore, verify_artifact, BackupJob, BackupResult, CliProbe, ProgressFn, RestoreJob,
    RestoreResult, VerifyReport,
};
use dumpseal_compress::detect;
use dumpseal_core::config::DumpsealConfig;
use dumpseal_core::CompressionAlgorithm;
use dumpseal_crypto::{derive_stream_key, looks_encrypted, KdfParams, Key, StreamHeader, HEADER_LEN};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "dumpseal",
    version,
    about = "Compressed, encrypted database dumps",
    long_about = "dumpseal: stream MySQL/PostgreSQL dumps through compression and chunked \
                  authenticated encryption, and restore them with end-to-end verification"
)]
struct Cli {
    /// Path to dumpseal.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "DUMPSEAL_CONFIG",
        default_value = "/etc/dumpseal/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, env = "DUMPSEAL_LOG")]
    log: Option<String>,

    /// Log format; overrides the config file
    #[arg(long, env = "DUMPSEAL_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    /// Read the passphrase from this file instead of the environment
    #[arg(long, env = "DUMPSEAL_PASSPHRASE_FILE", global = true)]
    passphrase_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Dump the configured database into a new artifact
    ///
    /// The database password is read from the variable named by
    /// connection.password_env, the passphrase from crypto.passphrase_env.
    Backup {
        /// Directory for the artifact (overrides backup.output_dir)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
        /// none, gzip or zstd (overrides backup.compression)
        #[arg(long)]
        compression: Option<CompressionAlgorithm>,
        /// Compression level (overrides backup.compression_level)
        #[arg(long, allow_negative_numbers = true)]
        level: Option<i32>,
        /// Write an unencrypted artifact
        #[arg(long)]
        no_encrypt: bool,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Replay an artifact into the configured database
    Restore {
        artifact: PathBuf,
        /// Skip the full decode pass before the client starts
        #[arg(long)]
        skip_verify: bool,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Decode an artifact end to end and check its recorded checksum
    Verify {
        artifact: PathBuf,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show an artifact's header and metadata without decrypting it
    Inspect { artifact: PathBuf },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config).await?;

    let level = cli.log.clone().unwrap_or_else(|| config.logging.level.clone());
    let format = cli
        .log_format
        .unwrap_or_else(|| config_log_format(&config.logging.format));
    init_logging(&level, format);
    debug!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "dumpseal starting"
    );
    if !cli.config.exists() {
        warn!(config = %cli.config.display(), "config file not found, using defaults");
    }

    let pass_file = cli.passphrase_file.as_deref();
    match cli.command {
        Commands::Backup {
            output,
            compression,
            level,
            no_encrypt,
            json,
        } => {
            let overrides = BackupOverrides {
                output,
                compression,
                level,
                no_encrypt,
            };
            cmd_backup(&config, pass_file, overrides, json, cancel_on_ctrl_c()).await
        }
        Commands::Restore {
            artifact,
            skip_verify,
            json,
        } => cmd_restore(&config, pass_file, &artifact, skip_verify, json, cancel_on_ctrl_c()).await,
        Commands::Verify { artifact, json } => cmd_verify(&config, pass_file, &artifact, json).await,
        Commands::Inspect { artifact } => cmd_inspect(&artifact),
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &cli.config),
    }
}

// ── Config and logging ────────────────────────────────────────────────────────

async fn load_config(path: &Path) -> Result<DumpsealConfig> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        DumpsealConfig::from_toml(&content)
            .with_context(|| format!("parsing config: {}", path.display()))
    } else {
        Ok(DumpsealConfig::default())
    }
}

fn config_log_format(format: &str) -> LogFormat {
    if format.eq_ignore_ascii_case("json") {
        LogFormat::Json
    } else {
        LogFormat::Text
    }
}

fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

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

/// Ctrl-C cancels the running job; the job then cleans up after itself.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            trigger.cancel();
        }
    });
    token
}

// ── Passphrase and keys ───────────────────────────────────────────────────────

/// Passphrase from `--passphrase-file`, else from the configured env var.
fn resolve_passphrase(config: &DumpsealConfig, file: Option<&Path>) -> Result<Option<SecretString>> {
    if let Some(path) = file {
        let mut raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading passphrase file: {}", path.display()))?;
        let len = raw.trim_end_matches(['\r', '\n']).len();
        raw.truncate(len);
        if raw.is_empty() {
            anyhow::bail!("passphrase file is empty: {}", path.display());
        }
        return Ok(Some(SecretString::from(raw)));
    }
    match std::env::var(&config.crypto.passphrase_env) {
        Ok(value) if !value.is_empty() => Ok(Some(SecretString::from(value))),
        _ => Ok(None),
    }
}

fn require_key(config: &DumpsealConfig, file: Option<&Path>) -> Result<Key> {
    let passphrase = resolve_passphrase(config, file)?.with_context(|| {
        format!(
            "a passphrase is required\n\
             Set {} or pass --passphrase-file.",
            config.crypto.passphrase_env
        )
    })?;
    let params = KdfParams {
        iterations: config.crypto.kdf_iterations,
    };
    derive_stream_key(&passphrase, &params).context("deriving stream key")
}

/// First bytes of an artifact: enough for the stream header and any
/// compression magic.
fn peek_header(path: &Path) -> Result<Vec<u8>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("opening artifact: {}", path.display()))?;
    let mut head = Vec::with_capacity(HEADER_LEN);
    file.take(HEADER_LEN as u64)
        .read_to_end(&mut head)
        .with_context(|| format!("reading artifact: {}", path.display()))?;
    Ok(head)
}

/// A key only when the artifact is sealed: as recorded, else as its header
/// suggests.
fn key_for_artifact(config: &DumpsealConfig, file: Option<&Path>, artifact: &Path) -> Result<Option<Key>> {
    let recorded = recorded_format(artifact)
        .context("reading metadata sidecar")?
        .encrypted;
    let sealed = match recorded {
        Some(sealed) => sealed,
        None => looks_encrypted(&peek_header(artifact)?),
    };
    if sealed {
        require_key(config, file).map(Some)
    } else {
        Ok(None)
    }
}

// ── Progress helpers ──────────────────────────────────────────────────────────

fn make_spinner(prefix: &str, hidden: bool) -> ProgressBar {
    if hidden {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}") {
        pb.set_style(style);
    }
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn spinner_progress(pb: &ProgressBar) -> ProgressFn {
    let pb = pb.clone();
    Arc::new(move |done: u64, msg: &str| {
        pb.set_message(format!("{msg} {}", fmt_bytes(done)));
    })
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serializing result")?);
    Ok(())
}

// ── `dumpseal backup` ─────────────────────────────────────────────────────────

#[derive(Debug)]
struct BackupOverrides {
    output: Option<PathBuf>,
    compression: Option<CompressionAlgorithm>,
    level: Option<i32>,
    no_encrypt: bool,
}

async fn cmd_backup(
    config: &DumpsealConfig,
    pass_file: Option<&Path>,
    overrides: BackupOverrides,
    json: bool,
    cancel: CancellationToken,
) -> Result<()> {
    let mut backup = config.backup.clone();
    if let Some(dir) = overrides.output {
        backup.output_dir = dir;
    }
    if let Some(compression) = overrides.compression {
        backup.compression = compression;
    }
    if overrides.level.is_some() {
        backup.compression_level = overrides.level;
    }
    if overrides.no_encrypt {
        backup.encrypt = false;
    }

    let conn = &config.connection;
    let password = resolve_password(conn);
    let dump = dump_command(conn, password.clone()).context("building dump command")?;
    let probe = Arc::new(CliProbe::new(conn.clone(), password));
    let key = if backup.encrypt {
        Some(require_key(config, pass_file)?)
    } else {
        None
    };

    let pb = make_spinner("backup", json);
    let job = BackupJob::from_config(conn, &backup, dump, probe, key)?
        .with_progress(spinner_progress(&pb));
    info!(
        database = %conn.database,
        artifact = %job.artifact.display(),
        "starting backup"
    );

    let result = run_backup(job, cancel).await;
    pb.finish_and_clear();
    let result = result.context("backup failed")?;

    if json {
        return print_json(&result);
    }
    print_backup(&result);
    Ok(())
}

fn print_backup(result: &BackupResult) {
    println!("Backup complete:");
    println!("  artifact:    {}", result.artifact.display());
    println!("  dump:        {}", fmt_bytes(result.raw_bytes));
    println!("  stored:      {}", fmt_bytes(result.artifact_bytes));
    println!("  compression: {}", result.compression);
    println!("  encrypted:   {}", yes_no(result.encrypted));
    if let Some(checksum) = &result.checksum {
        println!("  checksum:    {checksum}");
    }
    if let Some(position) = &result.replication {
        println!("  replication: {position}");
    }
    println!("  duration:    {}", fmt_duration_ms(result.duration_ms));
}

// ── `dumpseal restore` ────────────────────────────────────────────────────────

async fn cmd_restore(
    config: &DumpsealConfig,
    pass_file: Option<&Path>,
    artifact: &Path,
    skip_verify: bool,
    json: bool,
    cancel: CancellationToken,
) -> Result<()> {
    let key = key_for_artifact(config, pass_file, artifact)?;

    let conn = &config.connection;
    let password = resolve_password(conn);
    let client = restore_command(conn, password.clone()).context("building restore command")?;
    let probe = Arc::new(CliProbe::new(conn.clone(), password));

    let mut restore = config.restore.clone();
    if skip_verify {
        warn!("skipping verification: a damaged artifact will be caught only mid-restore");
        restore.verify_first = false;
    }

    let pb = make_spinner("restore", json);
    let job = RestoreJob::from_config(artifact.to_path_buf(), &restore, client, probe, key)
        .with_progress(spinner_progress(&pb));
    info!(
        database = %conn.database,
        artifact = %artifact.display(),
        "starting restore"
    );

    let result = run_restore(job, cancel).await;
    pb.finish_and_clear();
    let result = result.context("restore failed")?;

    if json {
        return print_json(&result);
    }
    print_restore(&result);
    Ok(())
}

fn print_restore(result: &RestoreResult) {
    println!("Restore complete:");
    println!("  artifact:    {}", result.artifact.display());
    println!("  replayed:    {}", fmt_bytes(result.raw_bytes));
    println!("  compression: {}", result.compression);
    println!("  encrypted:   {}", yes_no(result.encrypted));
    println!("  verified:    {}", yes_no(result.verified_first));
    println!("  checksum:    {}", if result.checksum_verified { "matched" } else { "not recorded" });
    println!("  duration:    {}", fmt_duration_ms(result.duration_ms));
}

// ── `dumpseal verify` ─────────────────────────────────────────────────────────

async fn cmd_verify(config: &DumpsealConfig, pass_file: Option<&Path>, artifact: &Path, json: bool) -> Result<()> {
    let key = key_for_artifact(config, pass_file, artifact)?;
    let path = artifact.to_path_buf();

    let pb = make_spinner("verify", json);
    pb.set_message(artifact.display().to_string());
    let report = tokio::task::spawn_blocking(move || verify_artifact(&path, key.as_ref()))
        .await
        .context("verification task")?;
    pb.finish_and_clear();
    let report = report.with_context(|| format!("verifying {}", artifact.display()))?;

    if json {
        return print_json(&report);
    }
    print_verify(&report);
    Ok(())
}

fn print_verify(report: &VerifyReport) {
    println!("Artifact OK:");
    println!("  artifact:    {}", report.artifact.display());
    println!("  stored:      {}", fmt_bytes(report.artifact_bytes));
    println!("  dump:        {}", fmt_bytes(report.raw_bytes));
    println!("  compression: {}", report.compression);
    println!("  encrypted:   {}", yes_no(report.encrypted));
    match &report.checksum {
        Some(checksum) => println!("  checksum:    {checksum} (matched)"),
        None => println!("  checksum:    not recorded"),
    }
}

// ── `dumpseal inspect` ────────────────────────────────────────────────────────

fn cmd_inspect(artifact: &Path) -> Result<()> {
    let size = std::fs::metadata(artifact)
        .with_context(|| format!("reading artifact: {}", artifact.display()))?
        .len();
    let head = peek_header(artifact)?;

    let recorded = recorded_format(artifact).context("reading metadata sidecar")?;

    println!("artifact:    {}", artifact.display());
    println!("size:        {}", fmt_bytes(size));
    if recorded.encrypted.unwrap_or_else(|| looks_encrypted(&head)) {
        let buf: [u8; HEADER_LEN] = head
            .as_slice()
            .try_into()
            .context("artifact is shorter than a stream header")?;
        let header = StreamHeader::from_bytes(&buf).context("parsing stream header")?;
        println!(
            "encrypted:   yes (format v{}, {} chunks)",
            header.version,
            fmt_bytes(u64::from(header.chunk_size))
        );
    } else {
        println!("encrypted:   no");
        match recorded.compression {
            Some(compression) => println!("compression: {compression}"),
            None => println!("compression: {} (guessed from magic bytes)", detect(&head)),
        }
    }

    match read_sidecar(artifact).context("reading metadata sidecar")? {
        Some(meta) => {
            println!("metadata:");
            println!("  database:    {} ({:?})", meta.database, meta.engine);
            println!("  started at:  {} (unix)", meta.started_at);
            println!("  dump:        {}", fmt_bytes(meta.raw_bytes));
            println!("  compression: {}", meta.compression);
            if let Some(checksum) = &meta.checksum {
                println!("  checksum:    {checksum}");
            }
            if let Some(position) = &meta.replication {
                println!("  replication: {position}");
            }
            println!("  state:       {}", meta.state);
        }
        None => println!("metadata:    none"),
    }
    Ok(())
}

// ── `dumpseal config show` ────────────────────────────────────────────────────

fn cmd_config_show(config: &DumpsealConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

// ── Formatting ────────────────────────────────────────────────────────────────

fn yes_no(b: bool) -> &'static str {
    if b {
        "yes"
    } else {
        "no"
    }
}

fn fmt_duration_ms(ms: u64) -> String {
    if ms >= 1000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{ms}ms")
    }
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
