//! Compressing write stage

use std::io::{self, Write};

use flate2::write::GzEncoder;
use flate2::Compression;

use dumpseal_core::{Close, CompressionAlgorithm, DumpsealError};

use crate::level::resolve_level;

/// Sits between the encoder and the next stage. Once shut, it refuses all
/// output, which keeps an encoder's drop-time finish from writing a footer
/// after an abort.
struct Gate<W> {
    inner: W,
    open: bool,
}

impl<W: Write> Write for Gate<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.open {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "compression stage shut"));
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.open {
            return Ok(());
        }
        self.inner.flush()
    }
}

enum Encoder<W: Write> {
    Plain(Gate<W>),
    Gzip(GzEncoder<Gate<W>>),
    Zstd(zstd::stream::write::Encoder<'static, Gate<W>>),
}

impl<W: Write> Encoder<W> {
    fn gate(&mut self) -> &mut Gate<W> {
        match self {
            Encoder::Plain(g) => g,
            Encoder::Gzip(e) => e.get_mut(),
            Encoder::Zstd(e) => e.get_mut(),
        }
    }

    fn gate_ref(&self) -> &Gate<W> {
        match self {
            Encoder::Plain(g) => g,
            Encoder::Gzip(e) => e.get_ref(),
            Encoder::Zstd(e) => e.get_ref(),
        }
    }
}

/// Compresses everything written to it into the wrapped stage.
pub struct CompressingWriter<W: Write + Close> {
    encoder: Encoder<W>,
    algorithm: CompressionAlgorithm,
    bytes_in: u64,
    closed: bool,
    failed: bool,
}

/// Wrap `sink` in a compressor. `level: None` uses the algorithm default.
pub fn wrap_writer<W: Write + Close>(
    sink: W,
    algorithm: CompressionAlgorithm,
    level: Option<i32>,
) -> Result<CompressingWriter<W>, DumpsealError> {
    let level = resolve_level(algorithm, level)?;
    let gate = Gate {
        inner: sink,
        open: true,
    };
    let encoder = match (algorithm, level) {
        (CompressionAlgorithm::Gzip, Some(level)) => {
            Encoder::Gzip(GzEncoder::new(gate, Compression::new(level as u32)))
        }
        (CompressionAlgorithm::Zstd, Some(level)) => {
            Encoder::Zstd(zstd::stream::write::Encoder::new(gate, level)?)
        }
        _ => Encoder::Plain(gate),
    };
    tracing::debug!(%algorithm, ?level, "compression stage ready");
    Ok(CompressingWriter {
        encoder,
        algorithm,
        bytes_in: 0,
        closed: false,
        failed: false,
    })
}

impl<W: Write + Close> CompressingWriter<W> {
    pub fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm
    }

    /// Uncompressed bytes accepted so far.
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    pub fn get_ref(&self) -> &W {
        &self.encoder.gate_ref().inner
    }
}

impl<W: Write + Close> Write for CompressingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed || self.failed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write to a closed compression stage",
            ));
        }
        let n = match &mut self.encoder {
            Encoder::Plain(g) => g.write(buf)?,
            Encoder::Gzip(e) => e.write(buf)?,
            Encoder::Zstd(e) => e.write(buf)?,
        };
        self.bytes_in += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.encoder {
            Encoder::Plain(g) => g.flush(),
            Encoder::Gzip(e) => e.flush(),
            Encoder::Zstd(e) => e.flush(),
        }
    }
}

impl<W: Write + Close> Close for CompressingWriter<W> {
    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        if self.failed {
            return Err(io::Error::other("compression stage failed to close earlier"));
        }
        match &mut self.encoder {
            Encoder::Plain(_) => {}
            Encoder::Gzip(e) => e.try_finish()?,
            Encoder::Zstd(e) => e.do_finish()?,
        }
        let gate = self.encoder.gate();
        gate.open = false;
        if let Err(e) = gate.inner.flush().and_then(|()| gate.inner.close()) {
            self.failed = true;
            return Err(e);
        }
        self.closed = true;
        tracing::debug!(algorithm = %self.algorithm, bytes_in = self.bytes_in, "compression stage closed");
        Ok(())
    }

    fn abort(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        let gate = self.encoder.gate();
        gate.open = false;
        if let Err(e) = gate.inner.abort() {
            self.failed = true;
            return Err(e);
        }
        self.closed = true;
        tracing::debug!(algorithm = %self.algorithm, "compression stage aborted without footer");
        Ok(())
    }
}
