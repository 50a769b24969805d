use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DumpsealError;

/// Compression applied before encryption on backup, after decryption on restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    None,
    Gzip,
    #[default]
    Zstd,
}

impl CompressionAlgorithm {
    /// Stable one-byte tag for this algorithm.
    pub fn tag(self) -> u8 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Gzip => 1,
            CompressionAlgorithm::Zstd => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, DumpsealError> {
        match tag {
            0 => Ok(CompressionAlgorithm::None),
            1 => Ok(CompressionAlgorithm::Gzip),
            2 => Ok(CompressionAlgorithm::Zstd),
            other => Err(DumpsealError::UnsupportedFormat(format!(
                "unknown compression tag {other:#04x}"
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Gzip => "gzip",
            CompressionAlgorithm::Zstd => "zstd",
        }
    }

    /// File extension appended to artifact names, without the dot.
    pub fn extension(self) -> Option<&'static str> {
        match self {
            CompressionAlgorithm::None => None,
            CompressionAlgorithm::Gzip => Some("gz"),
            CompressionAlgorithm::Zstd => Some("zst"),
        }
    }

    pub fn is_none(self) -> bool {
        self == CompressionAlgorithm::None
    }
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CompressionAlgorithm {
    type Err = DumpsealError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(CompressionAlgorithm::None),
            "gzip" | "gz" => Ok(CompressionAlgorithm::Gzip),
            "zstd" | "zst" => Ok(CompressionAlgorithm::Zstd),
            other => Err(DumpsealError::UnsupportedFormat(format!(
                "unknown compression algorithm '{other}' (expected none, gzip, or zstd)"
            ))),
        }
    }
}

/// Digest used for the artifact checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    #[default]
    Sha256,
    Blake3,
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumAlgorithm::Sha256 => f.write_str("sha256"),
            ChecksumAlgorithm::Blake3 => f.write_str("blake3"),
        }
    }
}

/// Database log coordinate captured alongside a dump.
///
/// MySQL fills `log_file` + `log_position` (and `gtid_set` when GTIDs are on);
/// PostgreSQL stores its WAL LSN in `gtid_set`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationPosition {
    pub log_file: Option<String>,
    pub log_position: Option<u64>,
    pub gtid_set: Option<String>,
}

impl ReplicationPosition {
    pub fn is_empty(&self) -> bool {
        self.log_file.is_none() && self.log_position.is_none() && self.gtid_set.is_none()
    }
}

impl fmt::Display for ReplicationPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.log_file, self.log_position, &self.gtid_set) {
            (Some(file), Some(pos), Some(gtid)) => write!(f, "{file}:{pos} (gtid {gtid})"),
            (Some(file), Some(pos), None) => write!(f, "{file}:{pos}"),
            (_, _, Some(gtid)) => f.write_str(gtid),
            _ => f.write_str("(none)"),
        }
    }
}
