//! Decompressing read stage

use std::io::{self, BufReader, Read};

use flate2::bufread::MultiGzDecoder;

use dumpseal_core::{Close, CompressionAlgorithm, DumpsealError, PeekReader};

use crate::detect::{detect, MAGIC_PEEK_LEN};

enum Decoder<R: Read> {
    Plain(R),
    Gzip(MultiGzDecoder<BufReader<Upstream<R>>>),
    Zstd(zstd::stream::read::Decoder<'static, BufReader<Upstream<R>>>),
}

/// Source handed to a codec. Remembers whether the last failure came from
/// below so codec errors and transport errors can be told apart.
struct Upstream<R> {
    inner: R,
    failed: bool,
}

impl<R> Upstream<R> {
    fn new(inner: R) -> Self {
        Upstream {
            inner,
            failed: false,
        }
    }
}

impl<R: Read> Read for Upstream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let result = self.inner.read(buf);
        if let Err(e) = &result {
            self.failed = e.kind() != io::ErrorKind::Interrupted;
        }
        result
    }
}

/// Decompresses a stage's output on read.
pub struct DecompressingReader<R: Read + Close> {
    decoder: Decoder<R>,
    algorithm: CompressionAlgorithm,
}

pub fn wrap_reader<R: Read + Close>(
    source: R,
    algorithm: CompressionAlgorithm,
) -> Result<DecompressingReader<R>, DumpsealError> {
    let decoder = match algorithm {
        CompressionAlgorithm::None => Decoder::Plain(source),
        CompressionAlgorithm::Gzip => {
            Decoder::Gzip(MultiGzDecoder::new(BufReader::new(Upstream::new(source))))
        }
        CompressionAlgorithm::Zstd => Decoder::Zstd(zstd::stream::read::Decoder::with_buffer(
            BufReader::new(Upstream::new(source)),
        )?),
    };
    Ok(DecompressingReader { decoder, algorithm })
}

/// Sniff the magic number off `source` and wrap it in the matching decoder.
pub fn wrap_reader_detected<R: Read + Close>(
    source: R,
) -> Result<DecompressingReader<PeekReader<R>>, DumpsealError> {
    let peek = PeekReader::new(source, MAGIC_PEEK_LEN)?;
    let algorithm = detect(peek.peeked());
    tracing::debug!(%algorithm, "detected compression");
    wrap_reader(peek, algorithm)
}

impl<R: Read + Close> DecompressingReader<R> {
    pub fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm
    }

    fn source(&mut self) -> &mut R {
        match &mut self.decoder {
            Decoder::Plain(r) => r,
            Decoder::Gzip(d) => &mut d.get_mut().get_mut().inner,
            Decoder::Zstd(d) => &mut d.get_mut().get_mut().inner,
        }
    }

    fn upstream(&mut self) -> Option<&mut Upstream<R>> {
        match &mut self.decoder {
            Decoder::Plain(_) => None,
            Decoder::Gzip(d) => Some(d.get_mut().get_mut()),
            Decoder::Zstd(d) => Some(d.get_mut().get_mut()),
        }
    }

    /// Errors from the stage below pass through untouched. Anything the
    /// codec raises on its own becomes typed: an early end is truncation,
    /// every other decoder complaint is a corrupt stream.
    fn classify(&mut self, err: io::Error) -> io::Error {
        let from_source = match self.upstream() {
            Some(upstream) => std::mem::take(&mut upstream.failed),
            None => true,
        };
        let typed = err
            .get_ref()
            .is_some_and(|inner| inner.is::<DumpsealError>());
        if from_source || typed || err.kind() == io::ErrorKind::Interrupted {
            return err;
        }
        let mapped = match err.kind() {
            io::ErrorKind::UnexpectedEof => DumpsealError::TruncatedStream(format!(
                "{} stream ended early: {err}",
                self.algorithm
            )),
            _ => DumpsealError::UnsupportedFormat(format!("corrupt {} stream: {err}", self.algorithm)),
        };
        mapped.into()
    }
}

impl<R: Read + Close> Read for DecompressingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let result = match &mut self.decoder {
            Decoder::Plain(r) => r.read(buf),
            Decoder::Gzip(d) => d.read(buf),
            Decoder::Zstd(d) => d.read(buf),
        };
        result.map_err(|e| self.classify(e))
    }
}

impl<R: Read + Close> Close for DecompressingReader<R> {
    fn close(&mut self) -> io::Result<()> {
        self.source().close()
    }

    fn abort(&mut self) -> io::Result<()> {
        self.source().abort()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wrap_writer;
    use dumpseal_core::ErrorKind;
    use std::io::{Cursor, Write};

    fn compressed(algorithm: CompressionAlgorithm, data: &[u8]) -> Vec<u8> {
        let mut w = wrap_writer(Vec::new(), algorithm, None).unwrap();
        w.write_all(data).unwrap();
        w.close().unwrap();
        w.get_ref().clone()
    }

    #[test]
    fn detected_roundtrip_for_every_algorithm() {
        let data = b"CREATE TABLE users (id INT PRIMARY KEY);\n".repeat(50);
        for algorithm in [
            CompressionAlgorithm::None,
            CompressionAlgorithm::Gzip,
            CompressionAlgorithm::Zstd,
        ] {
            let blob = compressed(algorithm, &data);
            let mut r = wrap_reader_detected(Cursor::new(blob)).unwrap();
            assert_eq!(r.algorithm(), algorithm);
            let mut out = Vec::new();
            r.read_to_end(&mut out).unwrap();
            assert_eq!(out, data, "{algorithm} round-trip");
        }
    }

    #[test]
    fn concatenated_gzip_members_are_read() {
        let mut blob = compressed(CompressionAlgorithm::Gzip, b"first;");
        blob.extend(compressed(CompressionAlgorithm::Gzip, b"second;"));
        let mut r = wrap_reader(Cursor::new(blob), CompressionAlgorithm::Gzip).unwrap();
        let mut out = String::new();
        r.read_to_string(&mut out).unwrap();
        assert_eq!(out, "first;second;");
    }

    #[test]
    fn truncated_zstd_is_typed() {
        let data: Vec<u8> = (0..50_000u32).map(|i| (i * 31 % 255) as u8).collect();
        let blob = compressed(CompressionAlgorithm::Zstd, &data);
        let cut = blob[..blob.len() / 2].to_vec();
        let mut r = wrap_reader(Cursor::new(cut), CompressionAlgorithm::Zstd).unwrap();
        let err = r.read_to_end(&mut Vec::new()).unwrap_err();
        let kind = DumpsealError::from(err).kind();
        assert!(
            kind == ErrorKind::TruncatedStream || kind == ErrorKind::UnsupportedFormat,
            "got {kind:?}"
        );
    }

    #[test]
    fn corrupt_zstd_after_magic_is_unsupported_format() {
        let mut blob = vec![0x28, 0xB5, 0x2F, 0xFD];
        blob.extend([0xEEu8; 256]);
        let mut r = wrap_reader(Cursor::new(blob), CompressionAlgorithm::Zstd).unwrap();
        let err = r.read_to_end(&mut Vec::new()).unwrap_err();
        assert_eq!(DumpsealError::from(err).kind(), ErrorKind::UnsupportedFormat);
    }

    /// Hands out `good` and then fails like a dropped connection.
    struct FailingSource {
        good: Cursor<Vec<u8>>,
    }

    impl Read for FailingSource {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.good.read(buf)? {
                0 => Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer went away")),
                n => Ok(n),
            }
        }
    }

    impl Close for FailingSource {
        fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn source_failure_stays_upstream_io() {
        let data: Vec<u8> = (0..50_000u32).map(|i| (i * 31 % 255) as u8).collect();
        for algorithm in [CompressionAlgorithm::Gzip, CompressionAlgorithm::Zstd] {
            let blob = compressed(algorithm, &data);
            let good = Cursor::new(blob[..blob.len() / 2].to_vec());
            let mut r = wrap_reader(FailingSource { good }, algorithm).unwrap();
            let err = r.read_to_end(&mut Vec::new()).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::ConnectionReset, "{algorithm}");
            assert_eq!(DumpsealError::from(err).kind(), ErrorKind::UpstreamIo, "{algorithm}");
        }
    }

    #[test]
    fn tiny_input_detects_as_plain() {
        let mut r = wrap_reader_detected(Cursor::new(b"ab".to_vec())).unwrap();
        assert_eq!(r.algorithm(), CompressionAlgorithm::None);
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"ab");
    }
}
