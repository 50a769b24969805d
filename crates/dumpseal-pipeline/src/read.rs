//! Read-side composition: source → decrypt → decompress.

use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;

use dumpseal_compress::{detect, wrap_reader, MAGIC_PEEK_LEN};
use dumpseal_core::{Close, CompressionAlgorithm, DumpsealError, PeekReader, StageReader};
use dumpseal_crypto::{looks_encrypted, DecodingReader, Key, HEADER_LEN};

use crate::stage::{Stage, StageObserver, Traced};

#[derive(Default)]
pub struct ReadOptions<'a> {
    /// Required for encrypted input; unkeyed reads of ciphertext are refused
    pub key: Option<&'a Key>,
    /// Recorded algorithm of a plain stream. Encrypted streams carry their
    /// own tag, which wins. `None` on a plain stream falls back to sniffing
    /// the magic number.
    pub compression: Option<CompressionAlgorithm>,
    /// Recorded encryption flag. `None` decides from the key and, when
    /// unkeyed, refuses anything that looks like a stream header.
    pub encrypted: Option<bool>,
    pub observer: Option<Arc<dyn StageObserver>>,
}

impl fmt::Debug for ReadOptions<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadOptions")
            .field("keyed", &self.key.is_some())
            .field("compression", &self.compression)
            .field("encrypted", &self.encrypted)
            .finish()
    }
}

/// A composed reader yielding the raw dump bytes.
pub struct ReadPipeline {
    reader: Box<dyn StageReader>,
    stages: Vec<Stage>,
    compression: CompressionAlgorithm,
    bytes_out: u64,
}

pub fn build_read_pipeline<R>(source: R, opts: &ReadOptions<'_>) -> Result<ReadPipeline, DumpsealError>
where
    R: Read + Close + Send + 'static,
{
    let observer = opts.observer.clone();
    let mut stages = vec![Stage::Source];
    let mut reader: Box<dyn StageReader> =
        Box::new(Traced::new(source, Stage::Source, observer.clone()));

    let tagged = match (opts.key, opts.encrypted) {
        (Some(key), None | Some(true)) => {
            let mut decoder = DecodingReader::new(reader, key)?;
            let tagged = read_compression_tag(&mut decoder)?;
            let stage = Stage::Decrypt {
                chunk_size: decoder.header().chunk_size,
            };
            reader = Box::new(Traced::new(decoder, stage, observer.clone()));
            stages.push(stage);
            Some(tagged)
        }
        (None, Some(true)) => {
            return Err(DumpsealError::InvalidInput(
                "input is an encrypted stream; a passphrase is required to read it".into(),
            ))
        }
        (_, Some(false)) => None,
        (None, None) => {
            let peek = PeekReader::new(reader, HEADER_LEN)?;
            if looks_encrypted(peek.peeked()) {
                return Err(DumpsealError::InvalidInput(
                    "input looks like an encrypted stream; a passphrase is required to read it"
                        .into(),
                ));
            }
            reader = Box::new(peek);
            None
        }
    };

    let compression = match (tagged, opts.compression) {
        (Some(tagged), requested) => {
            if let Some(requested) = requested.filter(|r| *r != tagged) {
                tracing::warn!(%tagged, %requested, "stream tag overrides requested compression");
            }
            tagged
        }
        (None, Some(recorded)) => recorded,
        (None, None) => {
            let peek = PeekReader::new(reader, MAGIC_PEEK_LEN)?;
            let algorithm = detect(peek.peeked());
            tracing::info!(%algorithm, "no recorded compression; guessed from magic bytes");
            reader = Box::new(peek);
            algorithm
        }
    };
    if !compression.is_none() {
        let stage = Stage::Decompress(compression);
        let decompressor = wrap_reader(reader, compression)?;
        reader = Box::new(Traced::new(decompressor, stage, observer));
        stages.push(stage);
    }

    tracing::debug!(?stages, "read pipeline built");
    Ok(ReadPipeline {
        reader,
        stages,
        compression,
        bytes_out: 0,
    })
}

/// First plaintext byte of an encrypted stream names its compression.
fn read_compression_tag<R: Read>(
    decoder: &mut DecodingReader<R>,
) -> Result<CompressionAlgorithm, DumpsealError> {
    let mut tag = [0u8; 1];
    loop {
        match decoder.read(&mut tag) {
            Ok(0) => {
                return Err(DumpsealError::UnsupportedFormat(
                    "encrypted stream carries no compression tag".into(),
                ))
            }
            Ok(_) => return CompressionAlgorithm::from_tag(tag[0]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

impl ReadPipeline {
    /// Stage descriptors in construction order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Compression in effect, whether given or detected.
    pub fn compression(&self) -> CompressionAlgorithm {
        self.compression
    }

    pub fn is_encrypted(&self) -> bool {
        self.stages.iter().any(|s| matches!(s, Stage::Decrypt { .. }))
    }

    /// Raw bytes produced so far.
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }
}

impl Read for ReadPipeline {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.reader.read(buf)?;
        self.bytes_out += n as u64;
        Ok(n)
    }
}

impl Close for ReadPipeline {
    fn close(&mut self) -> io::Result<()> {
        self.reader.close()
    }

    fn abort(&mut self) -> io::Result<()> {
        self.reader.abort()
    }
}
