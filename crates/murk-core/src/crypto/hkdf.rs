//! HKDF-SHA-256 (RFC 5869) key derivation.
//!
//! Used to derive:
//! - Per-session symmetric keys from the ephemeral X25519 shared secret
//! - Per-peer packet keys from the static X25519 shared secret

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Computes HMAC-SHA-256 of a message using the given key.
pub fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(message);
    let result = mac.finalize();
    let mut output = [0u8; 32];
    output.copy_from_slice(&result.into_bytes());
    output
}

/// HKDF-SHA-256 key derivation as specified in RFC 5869.
///
/// # Arguments
/// * `ikm` - Input keying material
/// * `salt` - Optional salt value (empty salt treated as 32 zero bytes)
/// * `info` - Context and application specific information
/// * `length` - Length of output keying material (1-8160 bytes)
///
/// # Panics
/// Panics if length is 0 or exceeds 8160 bytes (255 * 32)
pub fn hkdf_sha256(ikm: &[u8], salt: &[u8], info: &[u8], length: usize) -> Vec<u8> {
    let n = (length + 31) / 32;
    assert!(n >= 1 && n <= 255, "HKDF output length must be 1-8160 bytes");

    // Extract: PRK = HMAC(salt, IKM)
    let prk = if salt.is_empty() {
        hmac_sha256(&[0u8; 32], ikm)
    } else {
        hmac_sha256(salt, ikm)
    };

    // Expand: T(i) = HMAC(PRK, T(i-1) || info || i)
    let mut output = Vec::with_capacity(length);
    let mut t = Vec::new();

    for i in 1..=n {
        let mut message = t.clone();
        message.extend_from_slice(info);
        message.push(i as u8);
        t = hmac_sha256(&prk, &message).to_vec();
        output.extend_from_slice(&t);
    }

    output.truncate(length);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    /// RFC 5869 Test Case 1
    #[test]
    fn test_rfc5869_case1() {
        let ikm = vec![0x0bu8; 22];
        let salt = hex::decode("000102030405060708090a0b0c").unwrap();
        let info = hex::decode("f0f1f2f3f4f5f6f7f8f9").unwrap();

        let okm = hkdf_sha256(&ikm, &salt, &info, 42);

        let expected = hex::decode(
            "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf34007208d5b887185865",
        )
        .unwrap();

        assert_eq!(okm, expected);
    }

    #[test]
    fn test_empty_salt_is_zero_salt() {
        let ikm = [0x11u8; 32];
        let info = b"murk/v1/test";

        let a = hkdf_sha256(&ikm, &[], info, 32);
        let b = hkdf_sha256(&ikm, &[0u8; 32], info, 32);
        assert_eq!(a, b);
    }

    #[test]
    fn test_info_separates_outputs() {
        let ikm = [0x22u8; 32];
        let a = hkdf_sha256(&ikm, &[], b"murk/v1/session-key", 32);
        let b = hkdf_sha256(&ikm, &[], b"murk/v1/packet-key", 32);
        assert_ne!(a, b);
    }
}
