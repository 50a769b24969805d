//! Compression levels
//!
//! gzip accepts 0..=9; zstd accepts whatever range the linked libzstd reports
//! (negative "fast" levels included).

use dumpseal_core::{CompressionAlgorithm, DumpsealError};

/// gzip default, same as `gzip -6`
pub const GZIP_DEFAULT_LEVEL: i32 = 6;

pub fn default_level(algorithm: CompressionAlgorithm) -> Option<i32> {
    match algorithm {
        CompressionAlgorithm::None => None,
        CompressionAlgorithm::Gzip => Some(GZIP_DEFAULT_LEVEL),
        CompressionAlgorithm::Zstd => Some(zstd::DEFAULT_COMPRESSION_LEVEL),
    }
}

/// Turn an optional user-supplied level into the level to use.
///
/// `None` picks the algorithm default. A level paired with
/// `CompressionAlgorithm::None` is ignored.
pub fn resolve_level(
    algorithm: CompressionAlgorithm,
    level: Option<i32>,
) -> Result<Option<i32>, DumpsealError> {
    let Some(level) = level else {
        return Ok(default_level(algorithm));
    };
    match algorithm {
        CompressionAlgorithm::None => {
            tracing::debug!(level, "compression level ignored: compression disabled");
            Ok(None)
        }
        CompressionAlgorithm::Gzip if (0..=9).contains(&level) => Ok(Some(level)),
        CompressionAlgorithm::Gzip => Err(DumpsealError::InvalidInput(format!(
            "gzip level {level} out of range 0..=9"
        ))),
        CompressionAlgorithm::Zstd => {
            let range = zstd::compression_level_range();
            if range.contains(&level) {
                Ok(Some(level))
            } else {
                Err(DumpsealError::InvalidInput(format!(
                    "zstd level {level} out of range {}..={}",
                    range.start(),
                    range.end()
                )))
            }
        }
    }
}
