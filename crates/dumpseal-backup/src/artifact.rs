//! Artifact naming and the fate of partial output.
//!
//! A backup streams into `<artifact>.partial` and is renamed into place only
//! after every stage closed cleanly, so a file under the final name is always
//! complete.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use dumpseal_core::config::FailurePolicy;
use dumpseal_core::CompressionAlgorithm;

pub const PARTIAL_SUFFIX: &str = ".partial";
pub const INCOMPLETE_SUFFIX: &str = ".incomplete";
pub const METADATA_SUFFIX: &str = ".meta.json";
pub const ENCRYPTED_EXTENSION: &str = "enc";

/// `<database>-<unix seconds>.sql[.gz|.zst][.enc]`
pub fn artifact_file_name(
    database: &str,
    compression: CompressionAlgorithm,
    encrypted: bool,
    timestamp: u64,
) -> String {
    let mut name = format!("{}-{timestamp}.sql", sanitize(database));
    if let Some(ext) = compression.extension() {
        name.push('.');
        name.push_str(ext);
    }
    if encrypted {
        name.push('.');
        name.push_str(ENCRYPTED_EXTENSION);
    }
    name
}

fn sanitize(database: &str) -> String {
    database
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

pub fn partial_path(artifact: &Path) -> PathBuf {
    with_suffix(artifact, PARTIAL_SUFFIX)
}

pub fn incomplete_path(artifact: &Path) -> PathBuf {
    with_suffix(artifact, INCOMPLETE_SUFFIX)
}

pub fn metadata_path(artifact: &Path) -> PathBuf {
    with_suffix(artifact, METADATA_SUFFIX)
}

/// Whether the file name says the artifact was sealed.
pub fn is_encrypted_name(artifact: &Path) -> bool {
    artifact
        .extension()
        .is_some_and(|ext| ext == ENCRYPTED_EXTENSION)
}

/// An artifact's stage stack as far as it is known without decoding it.
/// `None` fields are unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArtifactFormat {
    pub compression: Option<CompressionAlgorithm>,
    pub encrypted: Option<bool>,
}

const ALGORITHMS: [CompressionAlgorithm; 3] = [
    CompressionAlgorithm::None,
    CompressionAlgorithm::Gzip,
    CompressionAlgorithm::Zstd,
];

/// Read the stage stack back out of a name built by [`artifact_file_name`].
/// Names that do not follow that pattern say nothing beyond a trailing `.enc`.
pub fn format_from_name(artifact: &Path) -> ArtifactFormat {
    let Some(name) = artifact.file_name().and_then(|n| n.to_str()) else {
        return ArtifactFormat::default();
    };
    let sealed = is_encrypted_name(artifact);
    let stem = if sealed {
        &name[..name.len() - ENCRYPTED_EXTENSION.len() - 1]
    } else {
        name
    };
    let compression = ALGORITHMS.into_iter().find(|algorithm| match algorithm.extension() {
        Some(ext) => stem.ends_with(&format!(".sql.{ext}")),
        None => stem.ends_with(".sql"),
    });
    ArtifactFormat {
        compression,
        encrypted: (sealed || compression.is_some()).then_some(sealed),
    }
}

/// Apply `policy` to the partial output of a failed backup. Returns where the
/// bytes ended up, if they were kept. Cleanup failures are logged, not raised:
/// the backup error is what the caller reports.
pub fn discard_partial(partial: &Path, artifact: &Path, policy: FailurePolicy) -> Option<PathBuf> {
    if !partial.exists() {
        return None;
    }
    match policy {
        FailurePolicy::MarkIncomplete => {
            let target = incomplete_path(artifact);
            match std::fs::rename(partial, &target) {
                Ok(()) => {
                    tracing::warn!(path = %target.display(), "kept incomplete backup");
                    Some(target)
                }
                Err(e) => {
                    tracing::warn!(path = %partial.display(), "could not mark backup incomplete: {e}");
                    Some(partial.to_path_buf())
                }
            }
        }
        FailurePolicy::Delete => match std::fs::remove_file(partial) {
            Ok(()) => {
                tracing::info!(path = %partial.display(), "removed partial backup");
                None
            }
            Err(e) => {
                tracing::warn!(path = %partial.display(), "could not remove partial backup: {e}");
                Some(partial.to_path_buf())
            }
        },
    }
}
