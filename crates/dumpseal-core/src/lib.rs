pub mod config;
pub mod error;
pub mod io;
pub mod types;

pub use error::{DumpsealError, DumpsealResult, ErrorKind};
pub use io::{Close, PeekReader, StageReader, StageWriter};
pub use types::{ChecksumAlgorithm, CompressionAlgorithm, ReplicationPosition};
