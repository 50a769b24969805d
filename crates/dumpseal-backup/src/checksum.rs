use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use dumpseal_core::{ChecksumAlgorithm, DumpsealError};

const READ_BUFFER: usize = 64 * 1024;

/// Digest of a finished artifact, stored in its metadata sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    /// Lowercase hex
    pub hex: String,
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

enum Hasher {
    Sha256(Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl Hasher {
    fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            ChecksumAlgorithm::Blake3 => Hasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Blake3(h) => {
                h.update(data);
            }
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Hasher::Sha256(h) => h.finalize().iter().map(|b| format!("{b:02x}")).collect(),
            Hasher::Blake3(h) => h.finalize().to_hex().to_string(),
        }
    }
}

/// Digest everything `reader` yields, one 64 KiB buffer at a time.
pub fn checksum_reader<R: Read>(
    mut reader: R,
    algorithm: ChecksumAlgorithm,
) -> Result<Checksum, DumpsealError> {
    let mut hasher = Hasher::new(algorithm);
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Checksum {
        algorithm,
        hex: hasher.finalize_hex(),
    })
}

/// Streaming digest of the file at `path`.
pub fn checksum_file(path: &Path, algorithm: ChecksumAlgorithm) -> Result<Checksum, DumpsealError> {
    let file = File::open(path)?;
    checksum_reader(file, algorithm)
}

/// Recompute the digest of `path` and compare it with `expected`.
pub fn verify_checksum(path: &Path, expected: &Checksum) -> Result<(), DumpsealError> {
    let actual = checksum_file(path, expected.algorithm)?;
    if !actual.hex.eq_ignore_ascii_case(&expected.hex) {
        return Err(DumpsealError::ChecksumMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    tracing::debug!(path = %path.display(), checksum = %actual, "checksum verified");
    Ok(())
}
