use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::DumpsealError;
use crate::types::{ChecksumAlgorithm, CompressionAlgorithm};

/// Default plaintext bytes per AEAD chunk (64 KiB)
pub const DEFAULT_CHUNK_SIZE: u32 = 64 * 1024;

/// Top-level configuration (loaded from dumpseal.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DumpsealConfig {
    pub logging: LoggingConfig,
    pub connection: ConnectionConfig,
    pub backup: BackupConfig,
    pub restore: RestoreConfig,
    pub crypto: CryptoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseEngine {
    #[default]
    Mysql,
    Postgres,
}

impl DatabaseEngine {
    pub fn default_port(self) -> u16 {
        match self {
            DatabaseEngine::Mysql => 3306,
            DatabaseEngine::Postgres => 5432,
        }
    }
}

/// Target database. The password itself never lives in this file; it is read
/// from the environment variable named by `password_env`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub engine: DatabaseEngine,
    pub host: String,
    /// Defaults to the engine's standard port
    pub port: Option<u16>,
    pub user: String,
    pub database: String,
    /// Environment variable holding the database password
    pub password_env: Option<String>,
    /// Override the dump executable (default: mysqldump / pg_dump)
    pub dump_program: Option<String>,
    /// Override the restore/client executable (default: mysql / psql)
    pub client_program: Option<String>,
    /// Extra arguments appended to the dump command
    pub extra_dump_args: Vec<String>,
    /// Extra arguments appended to the restore command
    pub extra_restore_args: Vec<String>,
}

impl ConnectionConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.engine.default_port())
    }
}

/// What happens to a partially written artifact when a backup fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Rename to `<artifact>.incomplete`
    #[default]
    MarkIncomplete,
    /// Remove the partial file
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Directory for artifacts when no explicit output path is given
    pub output_dir: PathBuf,
    pub compression: CompressionAlgorithm,
    /// Compression level (default: algorithm default)
    pub compression_level: Option<i32>,
    /// Seal the artifact with the chunked AEAD codec (default: true)
    pub encrypt: bool,
    /// Plaintext bytes per AEAD chunk
    pub chunk_size: u32,
    /// Artifact checksum; `None` disables it
    pub checksum: Option<ChecksumAlgorithm>,
    /// Write `<artifact>.meta.json` next to the artifact
    pub write_metadata: bool,
    /// Capture binlog / WAL position alongside the dump
    pub capture_replication: bool,
    /// Give up on replication capture after this many seconds
    pub replication_timeout_secs: u64,
    pub on_failure: FailurePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    /// Decode the whole artifact before starting the restore process
    pub verify_first: bool,
    /// Check the artifact against its metadata sidecar checksum, when present
    pub verify_checksum: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// PBKDF2-HMAC-SHA256 iterations (minimum 10000)
    pub kdf_iterations: u32,
    /// Environment variable holding the passphrase
    pub passphrase_env: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            engine: DatabaseEngine::Mysql,
            host: "127.0.0.1".into(),
            port: None,
            user: "root".into(),
            database: String::new(),
            password_env: Some("DUMPSEAL_DB_PASSWORD".into()),
            dump_program: None,
            client_program: None,
            extra_dump_args: Vec::new(),
            extra_restore_args: Vec::new(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            compression: CompressionAlgorithm::Zstd,
            compression_level: None,
            encrypt: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
            checksum: Some(ChecksumAlgorithm::Sha256),
            write_metadata: true,
            capture_replication: true,
            replication_timeout_secs: 10,
            on_failure: FailurePolicy::MarkIncomplete,
        }
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            verify_first: true,
            verify_checksum: true,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            kdf_iterations: 100_000,
            passphrase_env: "DUMPSEAL_PASSPHRASE".into(),
        }
    }
}

impl DumpsealConfig {
    pub fn from_toml(s: &str) -> Result<Self, DumpsealError> {
        toml::from_str(s).map_err(|e| DumpsealError::Config(e.to_string()))
    }

    /// Load from `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, DumpsealError> {
        if !path.exists() {
            tracing::warn!("config file not found: {}  (using defaults)", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| DumpsealError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml(&content)
            .map_err(|e| DumpsealError::Config(format!("parsing {}: {e}", path.display())))
    }
}
