//! PLAIN (RFC 4616).

use super::Mechanism;
use crate::credentials::Credentials;
use crate::error::Result;

/// PLAIN sends `\0<username>\0<password>` as the initial response.
///
/// The authorization identity is left empty, meaning "same as the
/// authentication identity".
#[derive(Debug)]
pub struct Plain {
    credentials: Credentials,
    sent: bool,
}

impl Plain {
    /// Creates a PLAIN exchange.
    #[must_use]
    pub const fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            sent: false,
        }
    }
}

impl Mechanism for Plain {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    fn next_step(&mut self, _challenge: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        if self.sent {
            return Ok(None);
        }
        self.sent = true;
        let response = format!(
            "\0{}\0{}",
            self.credentials.username, self.credentials.password
        );
        Ok(Some(response.into_bytes()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_response_format() {
        let mut plain = Plain::new(Credentials::new("test", "pass"));
        assert_eq!(plain.next_step(None).unwrap().unwrap(), b"\0test\0pass");
    }

    #[test]
    fn test_plain_response_special_chars() {
        let mut plain = Plain::new(Credentials::new("user", "pass@word!"));
        let response = plain.next_step(None).unwrap().unwrap();
        assert_eq!(String::from_utf8(response).unwrap(), "\0user\0pass@word!");
    }

    #[test]
    fn test_plain_single_step() {
        let mut plain = Plain::new(Credentials::new("a", "b"));
        plain.next_step(None).unwrap();
        assert_eq!(plain.next_step(Some(b"more?")).unwrap(), None);
    }
}
