use std::fs::File;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use dumpseal_core::{Close, CompressionAlgorithm, DumpsealError};
use dumpseal_crypto::Key;
use dumpseal_pipeline::{build_read_pipeline, ReadOptions};

use crate::artifact::{format_from_name, ArtifactFormat};
use crate::checksum::{verify_checksum, Checksum};
use crate::metadata::{read_sidecar, BackupResult};
use crate::process::pump;

/// What a verification pass established about an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub artifact: PathBuf,
    pub artifact_bytes: u64,
    /// Dump bytes recovered by the full decode
    pub raw_bytes: u64,
    pub compression: CompressionAlgorithm,
    pub encrypted: bool,
    /// Sidecar checksum that matched, when a sidecar with one exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Checksum>,
}

/// Bytes and shape of one full decode.
pub(crate) struct Decoded {
    pub raw_bytes: u64,
    pub compression: CompressionAlgorithm,
    pub encrypted: bool,
}

/// Decode `path` end to end, discarding the output. Every chunk is
/// authenticated and the final marker must be present.
pub(crate) fn decode_to_sink(
    path: &Path,
    key: Option<&Key>,
    format: ArtifactFormat,
    cancel: &CancellationToken,
) -> Result<Decoded, DumpsealError> {
    let opts = ReadOptions {
        key,
        compression: format.compression,
        encrypted: format.encrypted,
        ..Default::default()
    };
    let mut pipeline = build_read_pipeline(File::open(path)?, &opts)?;
    let raw_bytes = match pump(&mut pipeline, &mut std::io::sink(), cancel, None, "verifying") {
        Ok(n) => n,
        Err(e) => {
            if let Err(abort) = pipeline.abort() {
                tracing::debug!("aborting verification pipeline: {abort}");
            }
            return Err(e);
        }
    };
    pipeline.close()?;
    Ok(Decoded {
        raw_bytes,
        compression: pipeline.compression(),
        encrypted: pipeline.is_encrypted(),
    })
}

/// Check the sidecar checksum (if recorded) and decode the whole artifact.
///
/// Blocking; run it on a blocking thread from async code.
pub fn verify_artifact(path: &Path, key: Option<&Key>) -> Result<VerifyReport, DumpsealError> {
    let artifact_bytes = std::fs::metadata(path)?.len();

    let sidecar = read_sidecar(path)?;
    let format = sidecar
        .as_ref()
        .map(BackupResult::format)
        .unwrap_or_else(|| format_from_name(path));

    let checksum = match sidecar.and_then(|meta| meta.checksum) {
        Some(expected) => {
            verify_checksum(path, &expected)?;
            Some(expected)
        }
        None => None,
    };

    let decoded = decode_to_sink(path, key, format, &CancellationToken::new())?;
    tracing::info!(
        artifact = %path.display(),
        raw_bytes = decoded.raw_bytes,
        compression = %decoded.compression,
        encrypted = decoded.encrypted,
        "artifact verified"
    );
    Ok(VerifyReport {
        artifact: path.to_path_buf(),
        artifact_bytes,
        raw_bytes: decoded.raw_bytes,
        compression: decoded.compression,
        encrypted: decoded.encrypted,
        checksum,
    })
}
