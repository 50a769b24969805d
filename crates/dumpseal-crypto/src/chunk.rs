//! Per-chunk ChaCha20-Poly1305 sealing
//!
//! Chunk framing inside a stream:
//! ```text
//! [1 byte: marker][sealed: ciphertext || 16-byte Poly1305 tag]
//! marker 0x00 = data chunk   (exactly chunk_size plaintext bytes)
//! marker 0x01 = final chunk  (0..=chunk_size plaintext bytes, runs to EOF)
//! AAD = stream header (17 bytes) || sequence (8 bytes, big-endian) || marker
//! ```
//!
//! The AAD binds each chunk to its stream, its position, and its role, which
//! rules out reordering, cross-stream splicing, and dropping the final marker.

use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use zeroize::Zeroize;

use dumpseal_core::DumpsealError;

use crate::header::StreamHeader;
use crate::kdf::Key;
use crate::nonce::chunk_nonce;
use crate::{HEADER_LEN, NONCE_SIZE};

const AAD_LEN: usize = HEADER_LEN + 8 + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Data,
    Final,
}

impl ChunkKind {
    pub fn marker(self) -> u8 {
        match self {
            ChunkKind::Data => 0x00,
            ChunkKind::Final => 0x01,
        }
    }

    pub fn from_marker(marker: u8) -> Option<Self> {
        match marker {
            0x00 => Some(ChunkKind::Data),
            0x01 => Some(ChunkKind::Final),
            _ => None,
        }
    }
}

/// AEAD state for one stream: the cipher plus the header it is bound to.
pub struct ChunkCipher {
    aead: ChaCha20Poly1305,
    header: [u8; HEADER_LEN],
    base_nonce: [u8; NONCE_SIZE],
}

impl ChunkCipher {
    pub fn new(key: &Key, header: &StreamHeader) -> Self {
        Self {
            aead: ChaCha20Poly1305::new(key.as_bytes().into()),
            header: header.to_bytes(),
            base_nonce: header.base_nonce,
        }
    }

    /// Encrypt `buf` in place, appending the tag.
    pub fn seal_in_place(
        &self,
        seq: u64,
        kind: ChunkKind,
        buf: &mut Vec<u8>,
    ) -> Result<(), DumpsealError> {
        let nonce = chunk_nonce(&self.base_nonce, seq);
        let aad = self.aad(seq, kind);
        self.aead
            .encrypt_in_place(Nonce::from_slice(&nonce), &aad, buf)
            .map_err(|_| DumpsealError::InvalidInput(format!("sealing chunk {seq} failed")))
    }

    /// Verify and decrypt `buf` in place, stripping the tag.
    ///
    /// On failure the buffer is wiped, so no bytes of a rejected chunk can leak.
    pub fn open_in_place(
        &self,
        seq: u64,
        kind: ChunkKind,
        buf: &mut Vec<u8>,
    ) -> Result<(), DumpsealError> {
        let nonce = chunk_nonce(&self.base_nonce, seq);
        let aad = self.aad(seq, kind);
        match self.aead.decrypt_in_place(Nonce::from_slice(&nonce), &aad, buf) {
            Ok(()) => Ok(()),
            Err(_) => {
                buf.zeroize();
                buf.clear();
                Err(DumpsealError::AuthenticationFailure {
                    chunk: seq,
                    reason: "invalid key or corrupted chunk".into(),
                })
            }
        }
    }

    fn aad(&self, seq: u64, kind: ChunkKind) -> [u8; AAD_LEN] {
        let mut aad = [0u8; AAD_LEN];
        aad[..HEADER_LEN].copy_from_slice(&self.header);
        aad[HEADER_LEN..HEADER_LEN + 8].copy_from_slice(&seq.to_be_bytes());
        aad[AAD_LEN - 1] = kind.marker();
        aad
    }
}
