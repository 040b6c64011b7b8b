//! LOGIN (draft-murchison-sasl-login).

use super::Mechanism;
use crate::credentials::Credentials;
use crate::error::Result;

/// LOGIN answers the server's `Username:` and `Password:` prompts in turn.
///
/// The prompt text itself is ignored; only the order matters.
#[derive(Debug)]
pub struct Login {
    credentials: Credentials,
    step: u8,
}

impl Login {
    /// Creates a LOGIN exchange.
    #[must_use]
    pub const fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            step: 0,
        }
    }
}

impl Mechanism for Login {
    fn name(&self) -> &'static str {
        "LOGIN"
    }

    fn next_step(&mut self, _challenge: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        let response = match self.step {
            0 => Vec::new(),
            1 => self.credentials.username.as_bytes().to_vec(),
            2 => self.credentials.password.as_bytes().to_vec(),
            _ => return Ok(None),
        };
        self.step += 1;
        Ok(Some(response))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_login_sequence() {
        let mut login = Login::new(Credentials::new("alice", "s3cret"));
        assert_eq!(login.next_step(None).unwrap().unwrap(), b"");
        assert_eq!(login.next_step(Some(b"Username:")).unwrap().unwrap(), b"alice");
        assert_eq!(login.next_step(Some(b"Password:")).unwrap().unwrap(), b"s3cret");
        assert_eq!(login.next_step(Some(b"Again?")).unwrap(), None);
    }
}
