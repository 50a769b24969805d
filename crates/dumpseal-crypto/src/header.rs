//! Stream header: written once, before the first chunk
//!
//! ```text
//! [1 byte: format version][12 bytes: base nonce][4 bytes: chunk size, big-endian]
//! ```
//!
//! The header is validated before any chunk is touched and its raw bytes are
//! bound into every chunk's associated data, so a swapped chunk size or nonce
//! fails authentication.

use std::io::{self, Read, Write};

use dumpseal_core::DumpsealError;

use crate::{FORMAT_VERSION, HEADER_LEN, MAX_CHUNK_SIZE, NONCE_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    pub version: u8,
    pub base_nonce: [u8; NONCE_SIZE],
    pub chunk_size: u32,
}

impl StreamHeader {
    pub fn new(base_nonce: [u8; NONCE_SIZE], chunk_size: u32) -> Result<Self, DumpsealError> {
        validate_chunk_size(chunk_size).map_err(DumpsealError::InvalidInput)?;
        Ok(Self {
            version: FORMAT_VERSION,
            base_nonce,
            chunk_size,
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = self.version;
        out[1..1 + NONCE_SIZE].copy_from_slice(&self.base_nonce);
        out[1 + NONCE_SIZE..].copy_from_slice(&self.chunk_size.to_be_bytes());
        out
    }

    /// Parse and validate a header. Unknown versions fail closed.
    pub fn from_bytes(buf: &[u8; HEADER_LEN]) -> Result<Self, DumpsealError> {
        let version = buf[0];
        if version != FORMAT_VERSION {
            return Err(DumpsealError::UnsupportedFormat(format!(
                "unknown stream format version {version} (supported: {FORMAT_VERSION})"
            )));
        }

        let mut base_nonce = [0u8; NONCE_SIZE];
        base_nonce.copy_from_slice(&buf[1..1 + NONCE_SIZE]);

        let mut size = [0u8; 4];
        size.copy_from_slice(&buf[1 + NONCE_SIZE..]);
        let chunk_size = u32::from_be_bytes(size);
        validate_chunk_size(chunk_size).map_err(DumpsealError::UnsupportedFormat)?;

        Ok(Self {
            version,
            base_nonce,
            chunk_size,
        })
    }

    /// Read exactly one header. A source that ends early is truncated.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, DumpsealError> {
        let mut buf = [0u8; HEADER_LEN];
        let got = read_full(reader, &mut buf)?;
        if got < HEADER_LEN {
            return Err(DumpsealError::TruncatedStream(format!(
                "stream header needs {HEADER_LEN} bytes, found {got}"
            )));
        }
        Self::from_bytes(&buf)
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.to_bytes())
    }
}

/// Does `prefix` start with something that parses as a stream header?
///
/// Used by unkeyed readers to refuse ciphertext instead of passing it through.
pub fn looks_encrypted(prefix: &[u8]) -> bool {
    match prefix.get(..HEADER_LEN) {
        Some(head) => {
            let mut buf = [0u8; HEADER_LEN];
            buf.copy_from_slice(head);
            StreamHeader::from_bytes(&buf).is_ok()
        }
        None => false,
    }
}

fn validate_chunk_size(chunk_size: u32) -> Result<(), String> {
    if chunk_size == 0 {
        return Err("chunk size must be non-zero".into());
    }
    if chunk_size > MAX_CHUNK_SIZE {
        return Err(format!(
            "chunk size {chunk_size} exceeds maximum {MAX_CHUNK_SIZE}"
        ));
    }
    Ok(())
}

/// Fill `buf` as far as the reader allows; returns bytes read (short only at EOF).
pub(crate) fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
