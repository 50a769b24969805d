//! Streaming encoder: plaintext `Write` in, sealed chunk stream out.

use std::io::{self, Write};

use zeroize::Zeroizing;

use dumpseal_core::{Close, DumpsealError};

use crate::chunk::{ChunkCipher, ChunkKind};
use crate::header::StreamHeader;
use crate::kdf::Key;
use crate::nonce::random_base_nonce;
use crate::{NONCE_SIZE, TAG_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Closed,
    Poisoned,
}

/// Encrypts everything written to it into the chunked stream format.
///
/// At most one chunk of plaintext is buffered. A full buffer is sealed as a
/// data chunk only once more plaintext arrives; whatever is buffered when
/// [`Close::close`] runs becomes the final chunk. Dropping the writer without
/// closing it leaves a stream that decodes to `TruncatedStream`.
pub struct EncodingWriter<W: Write> {
    inner: W,
    cipher: ChunkCipher,
    header: StreamHeader,
    header_written: bool,
    buf: Zeroizing<Vec<u8>>,
    chunk_size: usize,
    seq: u64,
    state: State,
}

impl<W: Write> EncodingWriter<W> {
    pub fn new(inner: W, key: &Key, chunk_size: u32) -> Result<Self, DumpsealError> {
        Self::with_base_nonce(inner, key, chunk_size, random_base_nonce())
    }

    /// Like [`EncodingWriter::new`] with a caller-chosen base nonce.
    ///
    /// Reusing a base nonce under the same key destroys confidentiality; this
    /// exists for reproducible test vectors.
    pub fn with_base_nonce(
        inner: W,
        key: &Key,
        chunk_size: u32,
        base_nonce: [u8; NONCE_SIZE],
    ) -> Result<Self, DumpsealError> {
        let header = StreamHeader::new(base_nonce, chunk_size)?;
        let chunk_size = chunk_size as usize;
        Ok(Self {
            inner,
            cipher: ChunkCipher::new(key, &header),
            header,
            header_written: false,
            buf: Zeroizing::new(Vec::with_capacity(chunk_size + TAG_SIZE)),
            chunk_size,
            seq: 0,
            state: State::Open,
        })
    }

    pub fn header(&self) -> &StreamHeader {
        &self.header
    }

    /// Chunks emitted so far (the final chunk counts once closed).
    pub fn chunks_written(&self) -> u64 {
        self.seq
    }

    /// Capacity of the plaintext buffer; stays at one sealed chunk.
    pub fn buffer_capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn ensure_header(&mut self) -> io::Result<()> {
        if !self.header_written {
            self.header.write_to(&mut self.inner)?;
            self.header_written = true;
        }
        Ok(())
    }

    fn emit(&mut self, kind: ChunkKind) -> io::Result<()> {
        self.ensure_header()?;
        self.cipher.seal_in_place(self.seq, kind, &mut self.buf)?;
        self.inner.write_all(&[kind.marker()])?;
        self.inner.write_all(&self.buf)?;
        tracing::trace!(seq = self.seq, kind = ?kind, sealed = self.buf.len(), "chunk sealed");
        self.buf.clear();
        self.seq += 1;
        Ok(())
    }

    fn check_open(&self) -> io::Result<()> {
        match self.state {
            State::Open => Ok(()),
            State::Closed => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write to a closed encoding stream",
            )),
            State::Poisoned => Err(io::Error::other(
                "encoding stream failed earlier and cannot accept more data",
            )),
        }
    }

    fn poison_on_err<T>(&mut self, result: io::Result<T>) -> io::Result<T> {
        if result.is_err() {
            self.state = State::Poisoned;
            self.buf.clear();
        }
        result
    }
}

impl<W: Write> Write for EncodingWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.check_open()?;
        let mut rest = data;
        while !rest.is_empty() {
            if self.buf.len() == self.chunk_size {
                let sealed = self.emit(ChunkKind::Data);
                self.poison_on_err(sealed)?;
            }
            let take = (self.chunk_size - self.buf.len()).min(rest.len());
            self.buf.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
        }
        Ok(data.len())
    }

    /// Flushes the sink. A partial chunk stays buffered: sealing it early
    /// would fix the chunk boundary and waste a chunk per flush.
    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Write + Close> Close for EncodingWriter<W> {
    fn close(&mut self) -> io::Result<()> {
        match self.state {
            State::Closed => return Ok(()),
            State::Poisoned => {
                return Err(io::Error::other("cannot close a failed encoding stream"))
            }
            State::Open => {}
        }
        let sealed = self.emit(ChunkKind::Final);
        self.poison_on_err(sealed)?;
        // The final chunk is out; a sink that fails to close leaves the
        // stream failed, never closed.
        let closed = self.inner.flush().and_then(|()| self.inner.close());
        self.poison_on_err(closed)?;
        self.state = State::Closed;
        tracing::debug!(chunks = self.seq, "encoding stream closed");
        Ok(())
    }

    fn abort(&mut self) -> io::Result<()> {
        if self.state == State::Closed {
            return Ok(());
        }
        self.buf.clear();
        let aborted = self.inner.flush().and_then(|()| self.inner.abort());
        self.poison_on_err(aborted)?;
        self.state = State::Closed;
        tracing::debug!(chunks = self.seq, "encoding stream aborted without final chunk");
        Ok(())
    }
}
