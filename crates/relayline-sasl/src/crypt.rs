//! Encoding and digest helpers shared by the mechanisms and the AUTH exchange.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::Sha1;
use sha2::Sha256;

use crate::error::Result;

/// Digest used by the CRAM family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Digest {
    /// MD5 (CRAM-MD5).
    Md5,
    /// SHA-1 (CRAM-SHA1).
    Sha1,
    /// SHA-256 (CRAM-SHA256).
    Sha256,
}

/// Base64-encodes a client response for the wire.
#[must_use]
pub fn encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decodes a base64 server challenge.
///
/// Surrounding whitespace is ignored; an empty challenge decodes to an
/// empty buffer.
///
/// # Errors
///
/// Returns an error if the challenge is not valid base64.
pub fn decode(challenge: &str) -> Result<Vec<u8>> {
    let trimmed = challenge.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    Ok(STANDARD.decode(trimmed)?)
}

/// Computes `HMAC(key, data)` with the given digest, rendered as lowercase hex.
#[must_use]
pub fn hmac_hex(digest: Digest, key: &[u8], data: &[u8]) -> String {
    let tag = match digest {
        Digest::Md5 => mac::<Hmac<Md5>>(key, data),
        Digest::Sha1 => mac::<Hmac<Sha1>>(key, data),
        Digest::Sha256 => mac::<Hmac<Sha256>>(key, data),
    };
    hex::encode(tag)
}

fn mac<M: Mac + KeyInit>(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC takes keys of any length.
    let mut mac = match <M as KeyInit>::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    Mac::update(&mut mac, data);
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let encoded = encode(b"\0user\0pass");
        assert_eq!(encoded, "AHVzZXIAcGFzcw==");
        assert_eq!(decode(&encoded).unwrap(), b"\0user\0pass");
    }

    #[test]
    fn test_decode_empty_challenge() {
        assert!(decode("").unwrap().is_empty());
        assert!(decode("   ").unwrap().is_empty());
    }

    #[test]
    fn test_decode_invalid() {
        assert!(decode("not base64!").is_err());
    }

    #[test]
    fn test_hmac_md5_rfc2195() {
        let tag = hmac_hex(
            Digest::Md5,
            b"tanstaaftanstaaf",
            b"<1896.697170952@postoffice.reston.mci.net>",
        );
        assert_eq!(tag, "b913a602c7eda7a495b4e6e7334d3890");
    }

    #[test]
    fn test_hmac_sha1_rfc2202() {
        let tag = hmac_hex(Digest::Sha1, b"Jefe", b"what do ya want for nothing?");
        assert_eq!(tag, "effcdf6ae5eb2fa2d27416d5f184df9c259a7c79");
    }

    #[test]
    fn test_hmac_sha256_rfc4231() {
        let tag = hmac_hex(Digest::Sha256, b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            tag,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }
}
