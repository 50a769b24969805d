//! Streaming decoder: sealed chunk stream in, verified plaintext `Read` out.

use std::io::{self, Read};

use zeroize::Zeroizing;

use dumpseal_core::{Close, DumpsealError};

use crate::chunk::{ChunkCipher, ChunkKind};
use crate::header::{read_full, StreamHeader};
use crate::kdf::Key;
use crate::TAG_SIZE;

/// Decrypts a stream produced by [`crate::EncodingWriter`].
///
/// Plaintext is released one verified chunk at a time, so nothing from a
/// forged or damaged chunk ever reaches the caller. The first failure sticks:
/// every later `read` returns the same error kind.
pub struct DecodingReader<R: Read> {
    inner: R,
    cipher: ChunkCipher,
    header: StreamHeader,
    buf: Zeroizing<Vec<u8>>,
    pos: usize,
    seq: u64,
    finished: bool,
    failed: Option<DumpsealError>,
}

impl<R: Read> DecodingReader<R> {
    /// Read and validate the stream header, then prepare to decode chunks.
    pub fn new(mut inner: R, key: &Key) -> Result<Self, DumpsealError> {
        let header = StreamHeader::read_from(&mut inner)?;
        tracing::debug!(chunk_size = header.chunk_size, "decoding stream header accepted");
        Ok(Self {
            inner,
            cipher: ChunkCipher::new(key, &header),
            buf: Zeroizing::new(Vec::with_capacity(header.chunk_size as usize + TAG_SIZE + 1)),
            header,
            pos: 0,
            seq: 0,
            finished: false,
            failed: None,
        })
    }

    pub fn header(&self) -> &StreamHeader {
        &self.header
    }

    /// Chunks verified so far.
    pub fn chunks_read(&self) -> u64 {
        self.seq
    }

    /// Has the authenticated final chunk been seen?
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn sealed_len(&self) -> usize {
        self.header.chunk_size as usize + TAG_SIZE
    }

    /// Pull, verify and decrypt the next chunk into `buf`.
    fn next_chunk(&mut self) -> Result<(), DumpsealError> {
        let mut marker = [0u8; 1];
        if read_full(&mut self.inner, &mut marker)? == 0 {
            return Err(DumpsealError::TruncatedStream(format!(
                "stream ended after {} chunk(s) without a final chunk",
                self.seq
            )));
        }
        let sealed_len = self.sealed_len();
        self.buf.clear();
        let Some(kind) = ChunkKind::from_marker(marker[0]) else {
            (&mut self.inner)
                .take(sealed_len as u64 + 1)
                .read_to_end(&mut self.buf)?;
            let unmarked = self.opens_as_unmarked_final(marker[0]);
            self.buf.clear();
            return Err(if unmarked {
                self.missing_end_marker()
            } else {
                DumpsealError::AuthenticationFailure {
                    chunk: self.seq,
                    reason: format!("unknown chunk marker {:#04x}", marker[0]),
                }
            });
        };

        match kind {
            ChunkKind::Data => {
                self.buf.resize(sealed_len, 0);
                let got = read_full(&mut self.inner, &mut self.buf)?;
                if got < sealed_len {
                    self.buf.clear();
                    return Err(DumpsealError::TruncatedStream(format!(
                        "chunk {} cut short: {got} of {sealed_len} bytes",
                        self.seq
                    )));
                }
            }
            ChunkKind::Final => {
                // one byte past the limit tells an oversized tail from a full one
                let limit = sealed_len as u64 + 1;
                (&mut self.inner).take(limit).read_to_end(&mut self.buf)?;
                if self.buf.len() > sealed_len {
                    self.buf.clear();
                    return Err(DumpsealError::AuthenticationFailure {
                        chunk: self.seq,
                        reason: "trailing data after final chunk".into(),
                    });
                }
                if self.buf.len() < TAG_SIZE {
                    self.buf.clear();
                    return Err(DumpsealError::TruncatedStream(format!(
                        "final chunk {} shorter than its tag",
                        self.seq
                    )));
                }
            }
        }

        let sealed_final = (kind == ChunkKind::Final).then(|| Zeroizing::new(self.buf.to_vec()));
        if let Err(err) = self.cipher.open_in_place(self.seq, kind, &mut self.buf) {
            // the marker slot may hold the first sealed byte of a final chunk
            // whose marker was cut out
            if let Some(sealed) = sealed_final {
                self.buf.extend_from_slice(&sealed);
                let unmarked = self.opens_as_unmarked_final(marker[0]);
                self.buf.clear();
                if unmarked {
                    return Err(self.missing_end_marker());
                }
            }
            return Err(err);
        }
        tracing::trace!(seq = self.seq, kind = ?kind, plain = self.buf.len(), "chunk verified");
        self.seq += 1;
        self.pos = 0;
        if kind == ChunkKind::Final {
            self.finished = true;
            tracing::debug!(chunks = self.seq, "decoding stream complete");
        }
        Ok(())
    }

    /// Does `first` followed by `buf` authenticate as this position's final
    /// chunk? Wipes the trial plaintext either way.
    fn opens_as_unmarked_final(&self, first: u8) -> bool {
        let mut candidate = Zeroizing::new(Vec::with_capacity(self.buf.len() + 1));
        candidate.push(first);
        candidate.extend_from_slice(&self.buf);
        self.cipher
            .open_in_place(self.seq, ChunkKind::Final, &mut candidate)
            .is_ok()
    }

    fn missing_end_marker(&self) -> DumpsealError {
        DumpsealError::TruncatedStream(format!("final chunk {} has no end marker", self.seq))
    }

    fn replay_failure(&self) -> Option<io::Error> {
        self.failed.as_ref().map(|err| io::Error::from(replay(err)))
    }
}

/// Rebuild a recorded failure so it can be returned again.
fn replay(err: &DumpsealError) -> DumpsealError {
    match err {
        DumpsealError::AuthenticationFailure { chunk, reason } => {
            DumpsealError::AuthenticationFailure {
                chunk: *chunk,
                reason: reason.clone(),
            }
        }
        DumpsealError::TruncatedStream(msg) => DumpsealError::TruncatedStream(msg.clone()),
        DumpsealError::UnsupportedFormat(msg) => DumpsealError::UnsupportedFormat(msg.clone()),
        DumpsealError::Io(e) => DumpsealError::Io(io::Error::new(e.kind(), e.to_string())),
        other => DumpsealError::Io(io::Error::other(other.to_string())),
    }
}

impl<R: Read> Read for DecodingReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if let Some(err) = self.replay_failure() {
            return Err(err);
        }
        if out.is_empty() {
            return Ok(0);
        }
        while self.pos == self.buf.len() {
            if self.finished {
                return Ok(0);
            }
            if let Err(err) = self.next_chunk() {
                self.failed = Some(replay(&err));
                return Err(io::Error::from(err));
            }
        }
        let n = (self.buf.len() - self.pos).min(out.len());
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl<R: Read + Close> Close for DecodingReader<R> {
    fn close(&mut self) -> io::Result<()> {
        self.buf.clear();
        self.pos = 0;
        self.inner.close()
    }

    fn abort(&mut self) -> io::Result<()> {
        self.buf.clear();
        self.pos = 0;
        self.inner.abort()
    }
}
