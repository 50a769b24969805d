//! Magic-number sniffing
//!
//! ```text
//! gzip  1f 8b
//! zstd  28 b5 2f fd
//! ```
//! Anything else is treated as uncompressed.

use dumpseal_core::CompressionAlgorithm;

/// Bytes needed to tell every supported format apart.
pub const MAGIC_PEEK_LEN: usize = 4;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

pub fn detect(prefix: &[u8]) -> CompressionAlgorithm {
    if prefix.starts_with(&ZSTD_MAGIC) {
        CompressionAlgorithm::Zstd
    } else if prefix.starts_with(&GZIP_MAGIC) {
        CompressionAlgorithm::Gzip
    } else {
        CompressionAlgorithm::None
    }
}
