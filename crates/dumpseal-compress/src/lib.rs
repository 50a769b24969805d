//! dumpseal-compress: streaming compression stages for the dump pipeline
//!
//! # Overview
//! - `level`: per-algorithm default levels and validation
//! - `detect`: algorithm detection from a stream's own magic number
//! - `writer`: `CompressingWriter`, a `Write + Close` stage that emits the
//!   compressor footer on close and skips it on abort
//! - `reader`: `DecompressingReader`, the mirror `Read + Close` stage
//!
//! Compressed output carries no framing of its own beyond what gzip and zstd
//! already write, so artifacts stay readable with stock `gunzip` / `zstd -d`
//! once decrypted.

pub mod detect;
pub mod level;
pub mod reader;
pub mod writer;

pub use detect::{detect, MAGIC_PEEK_LEN};
pub use level::{default_level, resolve_level};
pub use reader::{wrap_reader, wrap_reader_detected, DecompressingReader};
pub use writer::{wrap_writer, CompressingWriter};

pub use dumpseal_core::CompressionAlgorithm;
