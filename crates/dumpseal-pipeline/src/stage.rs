//! Stage descriptors and close/abort observation.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

use dumpseal_core::{Close, CompressionAlgorithm};

/// One layer of a pipeline, as recorded in [`crate::WritePipeline::stages`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Sink,
    Source,
    Encrypt { chunk_size: u32 },
    Decrypt { chunk_size: u32 },
    Compress(CompressionAlgorithm),
    Decompress(CompressionAlgorithm),
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Sink => f.write_str("sink"),
            Stage::Source => f.write_str("source"),
            Stage::Encrypt { chunk_size } => write!(f, "encrypt({chunk_size})"),
            Stage::Decrypt { chunk_size } => write!(f, "decrypt({chunk_size})"),
            Stage::Compress(a) => write!(f, "compress({a})"),
            Stage::Decompress(a) => write!(f, "decompress({a})"),
        }
    }
}

/// Notified as each stage's close or abort is invoked, before the stage does
/// its own work.
pub trait StageObserver: Send + Sync {
    fn on_close(&self, _stage: &Stage) {}
    fn on_abort(&self, _stage: &Stage) {}
}

/// Wraps a stage so its close/abort is logged and observed.
pub(crate) struct Traced<S> {
    inner: S,
    stage: Stage,
    observer: Option<Arc<dyn StageObserver>>,
}

impl<S> Traced<S> {
    pub(crate) fn new(inner: S, stage: Stage, observer: Option<Arc<dyn StageObserver>>) -> Self {
        Self {
            inner,
            stage,
            observer,
        }
    }
}

impl<S: Write> Write for Traced<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<S: Read> Read for Traced<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<S: Close> Close for Traced<S> {
    fn close(&mut self) -> io::Result<()> {
        tracing::debug!(stage = %self.stage, "closing stage");
        if let Some(observer) = &self.observer {
            observer.on_close(&self.stage);
        }
        self.inner.close()
    }

    fn abort(&mut self) -> io::Result<()> {
        tracing::debug!(stage = %self.stage, "aborting stage");
        if let Some(observer) = &self.observer {
            observer.on_abort(&self.stage);
        }
        self.inner.abort()
    }
}
