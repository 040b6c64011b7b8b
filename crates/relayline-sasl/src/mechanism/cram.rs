//! CRAM-MD5 (RFC 2195) and its SHA-1 / SHA-256 variants.

use super::Mechanism;
use crate::credentials::Credentials;
use crate::crypt::{self, Digest};
use crate::error::{Error, Result};

/// Challenge-response with a keyed digest of the server's nonce.
///
/// The reply is `<username> <hex(HMAC(password, challenge))>`.
#[derive(Debug)]
pub struct Cram {
    digest: Digest,
    credentials: Credentials,
    step: u8,
}

impl Cram {
    /// Creates a CRAM exchange using `digest`.
    #[must_use]
    pub const fn new(digest: Digest, credentials: Credentials) -> Self {
        Self {
            digest,
            credentials,
            step: 0,
        }
    }
}

impl Mechanism for Cram {
    fn name(&self) -> &'static str {
        match self.digest {
            Digest::Md5 => "CRAM-MD5",
            Digest::Sha1 => "CRAM-SHA1",
            Digest::Sha256 => "CRAM-SHA256",
        }
    }

    fn next_step(&mut self, challenge: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        match self.step {
            0 => {
                self.step = 1;
                Ok(Some(Vec::new()))
            }
            1 => {
                let challenge = challenge.ok_or(Error::MissingChallenge(self.name()))?;
                self.step = 2;
                let tag = crypt::hmac_hex(
                    self.digest,
                    self.credentials.password.as_bytes(),
                    challenge,
                );
                Ok(Some(
                    format!("{} {tag}", self.credentials.username).into_bytes(),
                ))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cram_md5_rfc2195() {
        let mut cram = Cram::new(Digest::Md5, Credentials::new("tim", "tanstaaftanstaaf"));
        assert_eq!(cram.next_step(None).unwrap().unwrap(), b"");
        let response = cram
            .next_step(Some(b"<1896.697170952@postoffice.reston.mci.net>"))
            .unwrap()
            .unwrap();
        assert_eq!(
            String::from_utf8(response).unwrap(),
            "tim b913a602c7eda7a495b4e6e7334d3890"
        );
        assert_eq!(cram.next_step(Some(b"")).unwrap(), None);
    }

    #[test]
    fn test_cram_requires_challenge() {
        let mut cram = Cram::new(Digest::Sha256, Credentials::new("a", "b"));
        cram.next_step(None).unwrap();
        assert!(matches!(
            cram.next_step(None),
            Err(Error::MissingChallenge("CRAM-SHA256"))
        ));
    }

    #[test]
    fn test_cram_names() {
        let creds = Credentials::new("a", "b");
        assert_eq!(Cram::new(Digest::Sha1, creds.clone()).name(), "CRAM-SHA1");
        assert_eq!(Cram::new(Digest::Md5, creds).name(), "CRAM-MD5");
    }
}
