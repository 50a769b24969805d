//! Write-side composition: sink → encrypt → compress.

use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use dumpseal_compress::wrap_writer;
use dumpseal_core::config::DEFAULT_CHUNK_SIZE;
use dumpseal_core::{Close, CompressionAlgorithm, DumpsealError, StageWriter};
use dumpseal_crypto::{EncodingWriter, Key};

use crate::stage::{Stage, StageObserver, Traced};

pub struct WriteOptions<'a> {
    pub compression: CompressionAlgorithm,
    /// `None` uses the algorithm default
    pub compression_level: Option<i32>,
    /// `None` writes plaintext (after compression)
    pub encryption: Option<&'a Key>,
    pub chunk_size: u32,
    pub observer: Option<Arc<dyn StageObserver>>,
}

impl Default for WriteOptions<'_> {
    fn default() -> Self {
        Self {
            compression: CompressionAlgorithm::default(),
            compression_level: None,
            encryption: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            observer: None,
        }
    }
}

impl fmt::Debug for WriteOptions<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteOptions")
            .field("compression", &self.compression)
            .field("compression_level", &self.compression_level)
            .field("encrypted", &self.encryption.is_some())
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

/// A composed writer. Write raw bytes in; `close()` finalizes every stage.
pub struct WritePipeline {
    writer: Box<dyn StageWriter>,
    stages: Vec<Stage>,
    bytes_in: u64,
    finished: bool,
}

/// Build the write pipeline around `sink`.
///
/// Stages are constructed innermost first, so `stages()` reads
/// `[Sink, Encrypt, Compress]` for a full pipeline. Disabled stages are left
/// out entirely. An encrypted stream opens with a one-byte compression tag
/// ([`CompressionAlgorithm::tag`]) ahead of the compressed body.
pub fn build_write_pipeline<W>(sink: W, opts: &WriteOptions<'_>) -> Result<WritePipeline, DumpsealError>
where
    W: Write + Close + Send + 'static,
{
    let observer = opts.observer.clone();
    let mut stages = vec![Stage::Sink];
    let mut writer: Box<dyn StageWriter> = Box::new(Traced::new(sink, Stage::Sink, observer.clone()));

    if let Some(key) = opts.encryption {
        let stage = Stage::Encrypt {
            chunk_size: opts.chunk_size,
        };
        let mut encoder = EncodingWriter::new(writer, key, opts.chunk_size)?;
        // sealed with the first chunk, so the reader learns the algorithm
        // from authenticated bytes instead of guessing
        encoder.write_all(&[opts.compression.tag()])?;
        writer = Box::new(Traced::new(encoder, stage, observer.clone()));
        stages.push(stage);
    }

    if !opts.compression.is_none() {
        let stage = Stage::Compress(opts.compression);
        let compressor = wrap_writer(writer, opts.compression, opts.compression_level)?;
        writer = Box::new(Traced::new(compressor, stage, observer));
        stages.push(stage);
    }

    tracing::debug!(?stages, "write pipeline built");
    Ok(WritePipeline {
        writer,
        stages,
        bytes_in: 0,
        finished: false,
    })
}

impl WritePipeline {
    /// Stage descriptors in construction order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn is_encrypted(&self) -> bool {
        self.stages.iter().any(|s| matches!(s, Stage::Encrypt { .. }))
    }

    /// Raw bytes accepted so far.
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Write for WritePipeline {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.writer.write(buf)?;
        self.bytes_in += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl Close for WritePipeline {
    fn close(&mut self) -> io::Result<()> {
        self.writer.close()?;
        self.finished = true;
        Ok(())
    }

    fn abort(&mut self) -> io::Result<()> {
        self.finished = true;
        self.writer.abort()
    }
}
