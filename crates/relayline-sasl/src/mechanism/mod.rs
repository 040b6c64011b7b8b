//! SASL client mechanisms.
//!
//! A [`Mechanism`] is driven one step at a time. The first call passes
//! `None` and yields the initial response (an empty buffer when the
//! mechanism waits for the server to speak first). Each later call passes
//! the decoded server challenge. `Ok(None)` means the mechanism has nothing
//! left to say, and the caller should cancel the exchange if the server is
//! still asking.

mod cram;
mod login;
mod oauth;
mod plain;

pub use cram::Cram;
pub use login::Login;
pub use oauth::{OAuthBearer, OAuthError, XOAuth2, parse_oauth_error};
pub use plain::Plain;

use crate::credentials::Credentials;
use crate::crypt::Digest;
use crate::error::{Error, Result};

/// Mechanism names this crate can drive, in no particular order.
pub const SUPPORTED: &[&str] = &[
    "PLAIN",
    "LOGIN",
    "CRAM-MD5",
    "CRAM-SHA1",
    "CRAM-SHA256",
    "XOAUTH2",
    "OAUTHBEARER",
];

/// A single-use client-side SASL exchange.
pub trait Mechanism: Send {
    /// Registered mechanism name, upper-case.
    fn name(&self) -> &'static str;

    /// Produces the next client response.
    ///
    /// # Errors
    ///
    /// Returns an error if the challenge is unusable for this mechanism.
    fn next_step(&mut self, challenge: Option<&[u8]>) -> Result<Option<Vec<u8>>>;
}

/// Returns true if `name` names a mechanism in [`SUPPORTED`].
///
/// The comparison ignores ASCII case.
#[must_use]
pub fn is_supported(name: &str) -> bool {
    SUPPORTED.iter().any(|m| m.eq_ignore_ascii_case(name))
}

/// Creates a fresh exchange for the named mechanism.
///
/// # Errors
///
/// Returns [`Error::UnsupportedMechanism`] if the name is not in [`SUPPORTED`].
pub fn mechanism(name: &str, credentials: &Credentials) -> Result<Box<dyn Mechanism>> {
    let upper = name.to_ascii_uppercase();
    let mechanism: Box<dyn Mechanism> = match upper.as_str() {
        "PLAIN" => Box::new(Plain::new(credentials.clone())),
        "LOGIN" => Box::new(Login::new(credentials.clone())),
        "CRAM-MD5" => Box::new(Cram::new(Digest::Md5, credentials.clone())),
        "CRAM-SHA1" => Box::new(Cram::new(Digest::Sha1, credentials.clone())),
        "CRAM-SHA256" => Box::new(Cram::new(Digest::Sha256, credentials.clone())),
        "XOAUTH2" => Box::new(XOAuth2::new(credentials.clone())),
        "OAUTHBEARER" => Box::new(OAuthBearer::new(credentials.clone())),
        _ => return Err(Error::UnsupportedMechanism(name.to_string())),
    };
    Ok(mechanism)
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
    fn test_is_supported_case_insensitive() {
        assert!(is_supported("plain"));
        assert!(is_supported("Cram-Md5"));
        assert!(is_supported("XOAUTH2"));
        assert!(!is_supported("DIGEST-MD5"));
        assert!(!is_supported("NTLM"));
    }

    #[test]
    fn test_factory_names() {
        let creds = Credentials::new("u", "p");
        for name in SUPPORTED {
            let m = mechanism(name, &creds).unwrap();
            assert_eq!(m.name(), *name);
        }
    }

    #[test]
    fn test_factory_lowercase() {
        let creds = Credentials::new("u", "p");
        assert_eq!(mechanism("login", &creds).unwrap().name(), "LOGIN");
    }

    #[test]
    fn test_factory_unknown() {
        let creds = Credentials::new("u", "p");
        let err = mechanism("GSSAPI", &creds).err().unwrap();
        assert!(matches!(err, Error::UnsupportedMechanism(name) if name == "GSSAPI"));
    }
}
