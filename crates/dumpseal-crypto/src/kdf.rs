//! Key derivation: PBKDF2-HMAC-SHA256 passphrase → stream key

use pbkdf2::pbkdf2_hmac;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use dumpseal_core::DumpsealError;

use crate::KEY_SIZE;

/// Static application salt. The passphrase alone must re-derive the key for
/// any artifact ever written, so the salt cannot be per-stream.
pub const APP_SALT: &[u8] = b"dumpseal/stream-key/v1";

/// Lowest iteration count accepted by the KDF
pub const MIN_ITERATIONS: u32 = 10_000;

/// A 256-bit stream key derived from a passphrase.
///
/// Zeroized on drop to prevent secrets lingering in memory. Deliberately not
/// `Clone`: each stream operation derives and owns its own key.
pub struct Key {
    bytes: [u8; KEY_SIZE],
}

impl Key {
    /// Wrap raw key bytes. Production keys come from [`derive_key`].
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for Key {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Key").field("bytes", &"[REDACTED]").finish()
    }
}

/// PBKDF2 parameters for stream keys
#[derive(Debug, Clone)]
pub struct KdfParams {
    /// Iterations (default: 100000)
    pub iterations: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self { iterations: 100_000 }
    }
}

/// Derive `output_len` bytes of key material from a passphrase.
///
/// Deterministic: identical inputs always produce identical output.
pub fn derive_key_material(
    passphrase: &[u8],
    salt: &[u8],
    iterations: u32,
    output_len: usize,
) -> Result<Zeroizing<Vec<u8>>, DumpsealError> {
    if passphrase.is_empty() {
        return Err(DumpsealError::InvalidInput("passphrase must not be empty".into()));
    }
    if iterations < MIN_ITERATIONS {
        return Err(DumpsealError::InvalidInput(format!(
            "KDF iterations {iterations} below minimum {MIN_ITERATIONS}"
        )));
    }
    if output_len == 0 {
        return Err(DumpsealError::InvalidInput("KDF output length must be non-zero".into()));
    }

    let mut out = Zeroizing::new(vec![0u8; output_len]);
    pbkdf2_hmac::<Sha256>(passphrase, salt, iterations, &mut out);
    Ok(out)
}

/// Derive a 256-bit [`Key`] from a passphrase and salt.
pub fn derive_key(passphrase: &[u8], salt: &[u8], iterations: u32) -> Result<Key, DumpsealError> {
    let material = derive_key_material(passphrase, salt, iterations, KEY_SIZE)?;
    let mut bytes = [0u8; KEY_SIZE];
    bytes.copy_from_slice(&material);
    Ok(Key::from_bytes(bytes))
}

/// Derive the stream key for a passphrase using the application salt.
pub fn derive_stream_key(passphrase: &SecretString, params: &KdfParams) -> Result<Key, DumpsealError> {
    derive_key(passphrase.expose_secret().as_bytes(), APP_SALT, params.iterations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dumpseal_core::ErrorKind;

    const FAST: u32 = MIN_ITERATIONS;

    #[test]
    fn test_kdf_deterministic() {
        let key1 = derive_key(b"test-passphrase-123", APP_SALT, FAST).unwrap();
        let key2 = derive_key(b"test-passphrase-123", APP_SALT, FAST).unwrap();

        assert_eq!(key1.as_bytes(), key2.as_bytes(), "KDF must be deterministic");
    }

    #[test]
    fn test_kdf_different_passphrases() {
        let key1 = derive_key(b"passphrase-a", APP_SALT, FAST).unwrap();
        let key2 = derive_key(b"passphrase-b", APP_SALT, FAST).unwrap();

        assert_ne!(
            key1.as_bytes(),
            key2.as_bytes(),
            "different passphrases must produce different keys"
        );
    }

    #[test]
    fn test_kdf_different_salts() {
        let key1 = derive_key(b"same-passphrase", b"salt-one", FAST).unwrap();
        let key2 = derive_key(b"same-passphrase", b"salt-two", FAST).unwrap();

        assert_ne!(
            key1.as_bytes(),
            key2.as_bytes(),
            "different salts must produce different keys"
        );
    }

    #[test]
    fn test_kdf_matches_pbkdf2_reference() {
        // RFC 7914 §11 PBKDF2-HMAC-SHA256 vector (P="Password", S="NaCl", c=80000)
        let out = derive_key_material(b"Password", b"NaCl", 80_000, 64).unwrap();
        assert_eq!(
            out[..8],
            [0x4d, 0xdc, 0xd8, 0xf6, 0x0b, 0x98, 0xbe, 0x21]
        );
    }

    #[test]
    fn test_output_length_honored() {
        let out = derive_key_material(b"pw", APP_SALT, FAST, 48).unwrap();
        assert_eq!(out.len(), 48);
    }

    #[test]
    fn test_empty_passphrase_rejected() {
        let err = derive_key(b"", APP_SALT, FAST).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_low_iterations_rejected() {
        let err = derive_key(b"pw", APP_SALT, MIN_ITERATIONS - 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_zero_output_rejected() {
        let err = derive_key_material(b"pw", APP_SALT, FAST, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_stream_key_uses_app_salt() {
        let secret = SecretString::from("correct-horse".to_string());
        let params = KdfParams { iterations: FAST };
        let a = derive_stream_key(&secret, &params).unwrap();
        let b = derive_key(b"correct-horse", APP_SALT, FAST).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_debug_redacts() {
        let key = Key::from_bytes([7u8; KEY_SIZE]);
        let dbg = format!("{key:?}");
        assert!(dbg.contains("REDACTED"));
        assert!(!dbg.contains('7'));
    }
}
