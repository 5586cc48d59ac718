//! Key material handling: hex decode, per-mode splitting, and a zeroizing
//! buffer so intermediate copies don't linger in memory past their use.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};
use crate::mountentry::CryptfsMode;

/// A key (or key fragment) that zeroizes its backing buffer on drop.
/// `Debug` is redacted so it can't leak into logs by accident.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes(Vec<u8>);

impl SecretBytes {
    pub fn from_hex(input: &str) -> Result<Self> {
        let out = hex::decode(input).map_err(|_| Error::KeyLengthMismatch {
            expected: input.len() + (input.len() % 2),
            actual: input.len(),
        })?;
        Ok(SecretBytes(out))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Split off the first `n` bytes, leaving the remainder in `self`.
    pub fn split_off_front(&mut self, n: usize) -> Result<SecretBytes> {
        if n > self.0.len() {
            return Err(Error::KeyLengthMismatch {
                expected: n,
                actual: self.0.len(),
            });
        }
        let head: Vec<u8> = self.0.drain(..n).collect();
        Ok(SecretBytes(head))
    }
}

impl std::fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretBytes({} bytes, redacted)", self.0.len())
    }
}

/// XTS crypto key length in bytes for `ENCRYPT_ONLY`/`INTEGRITY_ENCRYPT`.
pub const CRYPTO_KEY_BYTES: usize = 64;
/// HMAC-SHA256 integrity key length in bytes for
/// `INTEGRITY_ONLY`/`INTEGRITY_ENCRYPT`.
pub const INTEGRITY_KEY_BYTES: usize = 32;
/// Recommended whole-key length for `AUTHENC`'s combined cipher key.
/// Shorter keys are accepted with a warning (preserved current behavior,
/// see the module-level design notes on this).
pub const AUTHENC_RECOMMENDED_BYTES: usize = 96;

/// Per-mode key layout (spec §3's key-bytes-consumed table).
/// `INTEGRITY_ENCRYPT` is the only mode that splits one input key into
/// two independent halves; every other mode hands its whole key to the
/// one target that needs it.
pub struct SplitKeys {
    pub crypt_key: Option<SecretBytes>,
    pub integrity_key: Option<SecretBytes>,
}

pub fn split_for_mode(mode: CryptfsMode, raw: SecretBytes) -> Result<SplitKeys> {
    match mode {
        CryptfsMode::NotImplemented => Ok(SplitKeys {
            crypt_key: None,
            integrity_key: None,
        }),
        CryptfsMode::EncryptOnly => Ok(SplitKeys {
            crypt_key: Some(raw),
            integrity_key: None,
        }),
        CryptfsMode::IntegrityOnly => Ok(SplitKeys {
            crypt_key: None,
            integrity_key: Some(raw),
        }),
        CryptfsMode::AuthEnc => {
            if raw.len() < AUTHENC_RECOMMENDED_BYTES {
                tracing::warn!(
                    len = raw.len(),
                    recommended = AUTHENC_RECOMMENDED_BYTES,
                    "AUTHENC key shorter than recommended, proceeding with it anyway"
                );
            }
            Ok(SplitKeys {
                crypt_key: Some(raw),
                integrity_key: None,
            })
        }
        CryptfsMode::IntegrityEncrypt => {
            let expected = CRYPTO_KEY_BYTES + INTEGRITY_KEY_BYTES;
            if raw.len() != expected {
                return Err(Error::KeyLengthMismatch {
                    expected: expected * 2,
                    actual: raw.len() * 2,
                });
            }
            let mut raw = raw;
            let crypt_key = raw.split_off_front(CRYPTO_KEY_BYTES)?;
            Ok(SplitKeys {
                crypt_key: Some(crypt_key),
                integrity_key: Some(raw),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let k = SecretBytes::from_hex("deadbeef").unwrap();
        assert_eq!(k.as_bytes(), &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(k.to_hex(), "deadbeef");
    }

    #[test]
    fn odd_length_hex_rejected() {
        assert!(SecretBytes::from_hex("abc").is_err());
    }

    #[test]
    fn split_off_front_too_long_errors() {
        let mut k = SecretBytes::from_hex("deadbeef").unwrap();
        assert!(k.split_off_front(100).is_err());
    }

    #[test]
    fn encrypt_only_uses_whole_key() {
        let k = SecretBytes::from_hex("deadbeef").unwrap();
        let split = split_for_mode(CryptfsMode::EncryptOnly, k).unwrap();
        assert!(split.crypt_key.is_some());
        assert!(split.integrity_key.is_none());
    }

    #[test]
    fn integrity_encrypt_requires_exact_combined_length() {
        let short = SecretBytes::from_hex(&"aa".repeat(CRYPTO_KEY_BYTES)).unwrap();
        assert!(split_for_mode(CryptfsMode::IntegrityEncrypt, short).is_err());

        let exact =
            SecretBytes::from_hex(&"aa".repeat(CRYPTO_KEY_BYTES + INTEGRITY_KEY_BYTES)).unwrap();
        let split = split_for_mode(CryptfsMode::IntegrityEncrypt, exact).unwrap();
        assert_eq!(split.crypt_key.unwrap().len(), CRYPTO_KEY_BYTES);
        assert_eq!(split.integrity_key.unwrap().len(), INTEGRITY_KEY_BYTES);
    }

    #[test]
    fn authenc_keeps_whole_key_unsplit() {
        let k = SecretBytes::from_hex(&"aa".repeat(AUTHENC_RECOMMENDED_BYTES)).unwrap();
        let split = split_for_mode(CryptfsMode::AuthEnc, k).unwrap();
        assert_eq!(split.crypt_key.unwrap().len(), AUTHENC_RECOMMENDED_BYTES);
        assert!(split.integrity_key.is_none());
    }

    #[test]
    fn authenc_short_key_warns_but_still_succeeds() {
        let k = SecretBytes::from_hex("aabb").unwrap();
        assert!(split_for_mode(CryptfsMode::AuthEnc, k).is_ok());
    }

    #[test]
    fn not_implemented_splits_to_nothing() {
        let k = SecretBytes::from_hex("deadbeef").unwrap();
        let split = split_for_mode(CryptfsMode::NotImplemented, k).unwrap();
        assert!(split.crypt_key.is_none());
        assert!(split.integrity_key.is_none());
    }
}
