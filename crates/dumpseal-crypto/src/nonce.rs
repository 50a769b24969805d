//! Per-chunk nonce schedule
//!
//! `nonce_i = base_nonce XOR (0x00000000 || i as u64 big-endian)`
//!
//! The base nonce is 96 random bits per stream; the sequence number occupies
//! the low 64 bits, so nonces never repeat inside a stream and collide across
//! streams only with negligible probability.

use rand::RngCore;

use crate::NONCE_SIZE;

/// Fresh random base nonce for a new stream.
pub fn random_base_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Nonce for chunk `seq` of the stream whose base nonce is `base`.
pub fn chunk_nonce(base: &[u8; NONCE_SIZE], seq: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = *base;
    for (dst, src) in nonce[NONCE_SIZE - 8..].iter_mut().zip(seq.to_be_bytes()) {
        *dst ^= src;
    }
    nonce
}
