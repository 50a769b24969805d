//! The stage lifecycle contract shared by every pipeline layer.
//!
//! `Write::flush` cannot express "this stream is over": a compressor has a
//! footer to emit and the AEAD encoder has a final chunk to seal. Each stage
//! therefore implements [`Close`], which finalizes the stage itself and then
//! closes the layer it wraps. Calling `close` on the outermost stage closes the
//! whole chain in reverse construction order.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Cursor, Read, Write};

pub trait Close {
    /// Emit trailing data, flush, and close the wrapped layer. Idempotent.
    fn close(&mut self) -> io::Result<()>;

    /// Release the stage without emitting trailing data, so the output can
    /// never be mistaken for a complete stream. Stages without trailers
    /// simply close.
    fn abort(&mut self) -> io::Result<()> {
        self.close()
    }
}

/// Object-safe write stage: what the pipeline composer nests.
pub trait StageWriter: Write + Close + Send {}

impl<T: Write + Close + Send> StageWriter for T {}

/// Object-safe read stage.
pub trait StageReader: Read + Close + Send {}

impl<T: Read + Close + Send> StageReader for T {}

impl<C: Close + ?Sized> Close for Box<C> {
    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }

    fn abort(&mut self) -> io::Result<()> {
        (**self).abort()
    }
}

impl<C: Close + ?Sized> Close for &mut C {
    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }

    fn abort(&mut self) -> io::Result<()> {
        (**self).abort()
    }
}

impl Close for File {
    fn close(&mut self) -> io::Result<()> {
        self.flush()?;
        // Read-only handles (restore sources) cannot be synced on every
        // platform; sync only matters for artifacts we wrote.
        match self.sync_all() {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl<W: Write + Close> Close for BufWriter<W> {
    fn close(&mut self) -> io::Result<()> {
        self.flush()?;
        self.get_mut().close()
    }

    fn abort(&mut self) -> io::Result<()> {
        self.flush()?;
        self.get_mut().abort()
    }
}

impl Close for Vec<u8> {
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<T> Close for Cursor<T> {
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Close for &[u8] {
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Close for io::Sink {
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<R: Read + Close> Close for BufReader<R> {
    fn close(&mut self) -> io::Result<()> {
        self.get_mut().close()
    }

    fn abort(&mut self) -> io::Result<()> {
        self.get_mut().abort()
    }
}

impl Close for std::process::ChildStdout {
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A reader that has already pulled its first bytes off the source, so a
/// caller can sniff the format before choosing a decoder. The peeked bytes are
/// replayed before the rest of the source.
pub struct PeekReader<R> {
    head: Vec<u8>,
    pos: usize,
    inner: R,
}

impl<R: Read> PeekReader<R> {
    /// Pull up to `len` bytes; fewer only if the source ends first.
    pub fn new(mut inner: R, len: usize) -> io::Result<Self> {
        let mut head = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            match inner.read(&mut head[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        head.truncate(filled);
        Ok(Self {
            head,
            pos: 0,
            inner,
        })
    }

    /// Bytes pulled ahead and not yet consumed.
    pub fn peeked(&self) -> &[u8] {
        &self.head[self.pos..]
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }
}

impl<R: Read> Read for PeekReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.pos < self.head.len() {
            let n = (self.head.len() - self.pos).min(out.len());
            out[..n].copy_from_slice(&self.head[self.pos..self.pos + n]);
            self.pos += n;
            return Ok(n);
        }
        self.inner.read(out)
    }
}

impl<R: Read + Close> Close for PeekReader<R> {
    fn close(&mut self) -> io::Result<()> {
        self.inner.close()
    }

    fn abort(&mut self) -> io::Result<()> {
        self.inner.abort()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_close_flushes_to_disk() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut file = File::create(tmp.path()).unwrap();
        file.write_all(b"sealed").unwrap();
        file.close().unwrap();
        assert_eq!(std::fs::read(tmp.path()).unwrap(), b"sealed");
    }

    #[test]
    fn bufwriter_close_flushes_buffer() {
        let mut w = BufWriter::new(Vec::new());
        w.write_all(b"buffered").unwrap();
        w.close().unwrap();
        assert_eq!(w.get_ref().as_slice(), b"buffered");
    }

    #[test]
    fn boxed_stage_delegates() {
        let mut boxed: Box<dyn StageWriter> = Box::new(Vec::<u8>::new());
        boxed.write_all(b"x").unwrap();
        boxed.close().unwrap();
        boxed.abort().unwrap();
    }

    #[test]
    fn peek_reader_replays_prefix() {
        let mut r = PeekReader::new(&b"\x28\xb5\x2f\xfdrest of stream"[..], 4).unwrap();
        assert_eq!(r.peeked(), b"\x28\xb5\x2f\xfd");
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"\x28\xb5\x2f\xfdrest of stream");
    }

    #[test]
    fn peek_reader_short_source() {
        let mut r = PeekReader::new(&b"ab"[..], 17).unwrap();
        assert_eq!(r.peeked(), b"ab");
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"ab");
    }
}
