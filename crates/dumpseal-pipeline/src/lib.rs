//! dumpseal-pipeline: composes compression and encryption around a byte sink
//! or source.
//!
//! ```text
//! write:  raw ──▶ [Compress] ──▶ [Encrypt] ──▶ sink       built sink-first
//! read:   source ──▶ [Decrypt] ──▶ [Decompress] ──▶ raw   built source-first
//! close:  outermost stage first, sink/source last
//! ```
//!
//! Each stage owns the one beneath it, so a single `close()` on the pipeline
//! runs every stage's finalization in reverse construction order: the
//! compressor footer reaches the encoder before the final AEAD chunk is sealed,
//! and both are in the sink before it is synced.
//!
//! The read side never has to be told how an encrypted stream was compressed:
//! the first plaintext byte is the algorithm tag, authenticated with chunk 0.
//! Plain streams have no room for a tag, so their format comes from
//! [`ReadOptions`] (recorded by the caller) and magic-byte sniffing is only a
//! last resort.

pub mod read;
pub mod stage;
pub mod write;

pub use read::{build_read_pipeline, ReadOptions, ReadPipeline};
pub use stage::{Stage, StageObserver};
pub use write::{build_write_pipeline, WriteOptions, WritePipeline};
