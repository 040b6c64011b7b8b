//! `OAuth2` bearer mechanisms.
//!
//! - OAUTHBEARER (RFC 7628), the standard form
//! - XOAUTH2, the Google/Microsoft legacy form
//!
//! On a bad token both send an `OAuth2` error document as a challenge
//! (`{"status":"401", "schemes":"bearer", "scope":"..."}`). The client must
//! answer it before the server issues the final failure reply.

use super::Mechanism;
use crate::credentials::Credentials;
use crate::error::Result;

/// Parses an `OAuth2` error response from the server.
///
/// # Errors
///
/// Returns an error if the response is not a JSON error document.
pub fn parse_oauth_error(response: &[u8]) -> std::result::Result<OAuthError, serde_json::Error> {
    serde_json::from_slice(response)
}

/// `OAuth2` error response from server.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct OAuthError {
    /// HTTP status code.
    pub status: String,
    /// Authentication schemes supported.
    pub schemes: String,
    /// `OAuth2` scope required.
    #[serde(default)]
    pub scope: Option<String>,
}

fn log_oauth_error(mechanism: &str, challenge: &[u8]) -> bool {
    match parse_oauth_error(challenge) {
        Ok(error) => {
            tracing::debug!(
                mechanism,
                status = %error.status,
                schemes = %error.schemes,
                scope = ?error.scope,
                "server rejected bearer token"
            );
            true
        }
        Err(_) => false,
    }
}

/// XOAUTH2 sends `user=<user>\x01auth=Bearer <token>\x01\x01`.
#[derive(Debug)]
pub struct XOAuth2 {
    credentials: Credentials,
    step: u8,
}

impl XOAuth2 {
    /// Creates an XOAUTH2 exchange. The credential secret is the access token.
    #[must_use]
    pub const fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            step: 0,
        }
    }
}

impl Mechanism for XOAuth2 {
    fn name(&self) -> &'static str {
        "XOAUTH2"
    }

    fn next_step(&mut self, challenge: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        let step = self.step;
        self.step = self.step.saturating_add(1);
        match (step, challenge) {
            (0, _) => Ok(Some(
                format!(
                    "user={}\x01auth=Bearer {}\x01\x01",
                    self.credentials.username, self.credentials.password
                )
                .into_bytes(),
            )),
            // An empty reply lets the server finish with its failure code.
            (1, Some(challenge)) if log_oauth_error(self.name(), challenge) => {
                Ok(Some(Vec::new()))
            }
            _ => Ok(None),
        }
    }
}

/// OAUTHBEARER sends `n,a=<user>,\x01auth=Bearer <token>\x01\x01`.
#[derive(Debug)]
pub struct OAuthBearer {
    credentials: Credentials,
    step: u8,
}

impl OAuthBearer {
    /// Creates an OAUTHBEARER exchange. The credential secret is the access token.
    #[must_use]
    pub const fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            step: 0,
        }
    }
}

impl Mechanism for OAuthBearer {
    fn name(&self) -> &'static str {
        "OAUTHBEARER"
    }

    fn next_step(&mut self, challenge: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        let step = self.step;
        self.step = self.step.saturating_add(1);
        match (step, challenge) {
            (0, _) => Ok(Some(
                format!(
                    "n,a={},\x01auth=Bearer {}\x01\x01",
                    self.credentials.username, self.credentials.password
                )
                .into_bytes(),
            )),
            // RFC 7628 section 3.2.3: a lone ^A acknowledges the error.
            (1, Some(challenge)) if log_oauth_error(self.name(), challenge) => {
                Ok(Some(b"\x01".to_vec()))
            }
            _ => Ok(None),
        }
    }
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

    const ERROR_JSON: &[u8] =
        br#"{"status":"401","schemes":"bearer","scope":"https://mail.google.com/"}"#;

    #[test]
    fn test_oauthbearer_format() {
        let mut m = OAuthBearer::new(Credentials::new("test@test.com", "abc"));
        let response = m.next_step(None).unwrap().unwrap();
        assert_eq!(
            String::from_utf8(response).unwrap(),
            "n,a=test@test.com,\x01auth=Bearer abc\x01\x01"
        );
    }

    #[test]
    fn test_xoauth2_format() {
        let mut m = XOAuth2::new(Credentials::new("test@test.com", "abc"));
        let response = m.next_step(None).unwrap().unwrap();
        assert_eq!(
            String::from_utf8(response).unwrap(),
            "user=test@test.com\x01auth=Bearer abc\x01\x01"
        );
    }

    #[test]
    fn test_parse_oauth_error() {
        let error = parse_oauth_error(ERROR_JSON).unwrap();

        assert_eq!(error.status, "401");
        assert_eq!(error.schemes, "bearer");
        assert_eq!(error.scope.as_deref(), Some("https://mail.google.com/"));
    }

    #[test]
    fn test_parse_oauth_error_without_scope() {
        let error = parse_oauth_error(br#"{"status":"400","schemes":"bearer"}"#).unwrap();
        assert_eq!(error.scope, None);
    }

    #[test]
    fn test_xoauth2_answers_error_challenge() {
        let mut m = XOAuth2::new(Credentials::new("u", "t"));
        m.next_step(None).unwrap();
        assert_eq!(m.next_step(Some(ERROR_JSON)).unwrap().unwrap(), b"");
        assert_eq!(m.next_step(Some(ERROR_JSON)).unwrap(), None);
    }

    #[test]
    fn test_xoauth2_unknown_challenge() {
        let mut m = XOAuth2::new(Credentials::new("u", "t"));
        m.next_step(None).unwrap();
        assert_eq!(m.next_step(Some(b"garbage")).unwrap(), None);
    }

    #[test]
    fn test_oauthbearer_answers_error_challenge() {
        let mut m = OAuthBearer::new(Credentials::new("u", "t"));
        m.next_step(None).unwrap();
        assert_eq!(m.next_step(Some(ERROR_JSON)).unwrap().unwrap(), b"\x01");
    }
}
