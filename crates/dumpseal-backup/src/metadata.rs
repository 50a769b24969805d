//! Job results and the `.meta.json` sidecar written next to each artifact.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use dumpseal_core::config::DatabaseEngine;
use dumpseal_core::{CompressionAlgorithm, DumpsealError, ReplicationPosition};

use crate::artifact::{format_from_name, metadata_path, ArtifactFormat};
use crate::checksum::Checksum;
use crate::state::JobState;

/// Outcome of a backup. Also the sidecar's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupResult {
    pub database: String,
    pub engine: DatabaseEngine,
    pub artifact: PathBuf,
    /// Bytes on disk
    pub artifact_bytes: u64,
    /// Dump bytes before compression and encryption
    pub raw_bytes: u64,
    pub compression: CompressionAlgorithm,
    pub encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Checksum>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication: Option<ReplicationPosition>,
    /// Unix seconds when the dump started
    pub started_at: u64,
    pub duration_ms: u64,
    pub state: JobState,
}

impl BackupResult {
    /// Stage stack the artifact was written with.
    pub fn format(&self) -> ArtifactFormat {
        ArtifactFormat {
            compression: Some(self.compression),
            encrypted: Some(self.encrypted),
        }
    }
}

/// Outcome of a restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreResult {
    pub artifact: PathBuf,
    pub artifact_bytes: u64,
    /// Dump bytes fed to the client
    pub raw_bytes: u64,
    pub compression: CompressionAlgorithm,
    pub encrypted: bool,
    /// A full decode pass succeeded before the client started
    pub verified_first: bool,
    /// The sidecar checksum matched the artifact
    pub checksum_verified: bool,
    pub duration_ms: u64,
    pub state: JobState,
}

/// Write `result` to the artifact's sidecar: temp file, then rename.
pub fn write_sidecar(result: &BackupResult) -> Result<PathBuf, DumpsealError> {
    let path = metadata_path(&result.artifact);
    let json = serde_json::to_string_pretty(result)
        .map_err(|e| DumpsealError::InvalidInput(format!("serializing backup metadata: {e}")))?;

    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, &path)?;
    tracing::debug!(path = %path.display(), "wrote metadata sidecar");
    Ok(path)
}

/// How `artifact` was written: from its sidecar when there is one, else from
/// its file name.
pub fn recorded_format(artifact: &Path) -> Result<ArtifactFormat, DumpsealError> {
    Ok(match read_sidecar(artifact)? {
        Some(meta) => meta.format(),
        None => format_from_name(artifact),
    })
}

/// Read the sidecar next to `artifact`; `Ok(None)` when there is none.
pub fn read_sidecar(artifact: &Path) -> Result<Option<BackupResult>, DumpsealError> {
    let path = metadata_path(artifact);
    let json = match std::fs::read_to_string(&path) {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_str(&json).map(Some).map_err(|e| {
        DumpsealError::UnsupportedFormat(format!("metadata {}: {e}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dumpseal_core::ChecksumAlgorithm;

    fn sample(artifact: PathBuf) -> BackupResult {
        BackupResult {
            database: "shop".into(),
            engine: DatabaseEngine::Mysql,
            artifact,
            artifact_bytes: 1234,
            raw_bytes: 9876,
            compression: CompressionAlgorithm::Zstd,
            encrypted: true,
            chunk_size: Some(65_536),
            checksum: Some(Checksum {
                algorithm: ChecksumAlgorithm::Sha256,
                hex: "ab".repeat(32),
            }),
            replication: Some(ReplicationPosition {
                log_file: Some("binlog.000042".into()),
                log_position: Some(157),
                gtid_set: None,
            }),
            started_at: 1_714_564_800,
            duration_ms: 4200,
            state: JobState::Completed,
        }
    }

    #[test]
    fn sidecar_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("shop-1714564800.sql.zst.enc");
        let result = sample(artifact.clone());

        let path = write_sidecar(&result).unwrap();
        assert!(path.to_string_lossy().ends_with(".sql.zst.enc.meta.json"));
        assert_eq!(read_sidecar(&artifact).unwrap(), Some(result));
    }

    #[test]
    fn sidecar_json_shape() {
        let json = serde_json::to_value(sample(PathBuf::from("a.sql"))).unwrap();
        assert_eq!(json["compression"], "zstd");
        assert_eq!(json["engine"], "mysql");
        assert_eq!(json["state"]["state"], "completed");
        assert_eq!(json["checksum"]["algorithm"], "sha256");
    }

    #[test]
    fn recorded_format_prefers_the_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("renamed.sql");
        assert_eq!(
            recorded_format(&artifact).unwrap(),
            ArtifactFormat {
                compression: Some(CompressionAlgorithm::None),
                encrypted: Some(false),
            }
        );

        write_sidecar(&sample(artifact.clone())).unwrap();
        assert_eq!(
            recorded_format(&artifact).unwrap(),
            ArtifactFormat {
                compression: Some(CompressionAlgorithm::Zstd),
                encrypted: Some(true),
            }
        );
    }

    #[test]
    fn missing_sidecar_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_sidecar(&dir.path().join("nothing.sql")).unwrap().is_none());
    }

    #[test]
    fn garbage_sidecar_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("x.sql");
        std::fs::write(metadata_path(&artifact), "{ not json").unwrap();
        let err = read_sidecar(&artifact).unwrap_err();
        assert_eq!(err.kind(), dumpseal_core::ErrorKind::UnsupportedFormat);
    }
}
