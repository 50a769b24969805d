//! dumpseal-crypto: streaming authenticated encryption for database dumps
//!
//! Architecture: fixed-size chunks, each sealed with ChaCha20-Poly1305
//!
//! Stream layout:
//! ```text
//! header  [version=1][base nonce, 12 bytes][chunk size, u32 big-endian]
//! chunk 0 [0x00][chunk_size + 16 sealed bytes]
//! chunk 1 [0x00][chunk_size + 16 sealed bytes]
//! ...
//! chunk n [0x01][0..=chunk_size + 16 sealed bytes]   <- final, runs to EOF
//! ```
//!
//! Key schedule:
//! ```text
//! passphrase ──PBKDF2-HMAC-SHA256(app salt, ≥10k iterations)──▶ 256-bit stream key
//!   └── chunk i: nonce = base_nonce XOR i, AAD = header || i || marker
//! ```
//!
//! A stream whose final chunk never arrived fails with `TruncatedStream`; any
//! modified, reordered or foreign chunk fails with `AuthenticationFailure`.

pub mod chunk;
pub mod header;
pub mod kdf;
pub mod nonce;
pub mod reader;
pub mod writer;

pub use chunk::{ChunkCipher, ChunkKind};
pub use header::{looks_encrypted, StreamHeader};
pub use kdf::{derive_key, derive_key_material, derive_stream_key, KdfParams, Key, APP_SALT};
pub use reader::DecodingReader;
pub use writer::EncodingWriter;

/// Size of a stream key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of a ChaCha20-Poly1305 nonce (96-bit)
pub const NONCE_SIZE: usize = 12;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Encoded stream header length
pub const HEADER_LEN: usize = 1 + NONCE_SIZE + 4;

/// Only stream format this build reads or writes
pub const FORMAT_VERSION: u8 = 1;

/// Largest accepted chunk size (16 MiB)
pub const MAX_CHUNK_SIZE: u32 = 16 * 1024 * 1024;

pub use dumpseal_core::config::DEFAULT_CHUNK_SIZE;
