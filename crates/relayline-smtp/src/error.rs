//! Error types for SMTP operations.

use std::fmt;
use std::io;

use crate::types::{EnhancedStatusCode, Reply};

/// Result type alias for SMTP operations.
pub type Result<T> = std::result::Result<T, Error>;

/// SMTP error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transaction has no sender.
    #[error("Transaction has no sender")]
    MissingSender,

    /// Transaction has no recipients.
    #[error("Transaction has no recipients")]
    NoRecipients,

    /// Invalid email address.
    #[error("Invalid email address: {0}")]
    InvalidAddress(String),

    /// Message exceeds the size advertised by the server.
    #[error("Message exceeds allowed size limit: {size} bytes (limit {limit})")]
    MessageTooLarge {
        /// Encoded message size.
        size: u64,
        /// Server limit from the `SIZE` extension.
        limit: u64,
    },

    /// Message body contains a line feed without a carriage return.
    #[error("Message contains a bare line feed")]
    BareLineFeed,

    /// STARTTLS is required but the server does not offer it.
    #[error("STARTTLS is required but not supported by the server")]
    TlsRequired,

    /// Login is required but no advertised mechanism is allowed.
    #[error("Login is required, but no allowed AUTH mechanism is available")]
    NoAuthMechanism,

    /// Login is required but no credentials were configured.
    #[error("Login is required, but no credentials were supplied")]
    NoCredentials,

    /// Server returned an error reply.
    #[error(transparent)]
    Smtp(SmtpError),

    /// Every recipient was rejected.
    #[error("No recipients were accepted")]
    NoRecipientsAccepted,

    /// Every AUTH candidate was rejected; carries the last failure.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(Box<Error>),

    /// Malformed reply from the server.
    #[error("Malformed reply: {0}")]
    Format(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS setup or handshake error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Server closed the connection.
    #[error("Connection closed by server")]
    ConnectionClosed,

    /// Pool no longer accepts acquisitions.
    #[error("Pool is stopped")]
    PoolStopped,

    /// SASL mechanism failure.
    #[error("SASL error: {0}")]
    Sasl(#[from] relayline_sasl::Error),
}

impl Error {
    /// Returns true if this is a permanent error (5xx).
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Smtp(err) => err.is_permanent(),
            Self::AuthenticationFailed(inner) => inner.is_permanent(),
            _ => false,
        }
    }

    /// Returns true if this is a transient error (4xx).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Smtp(err) => err.is_transient(),
            Self::AuthenticationFailed(inner) => inner.is_transient(),
            _ => false,
        }
    }

    /// Returns the server reply code, if this error carries one.
    #[must_use]
    pub fn reply_code(&self) -> Option<u16> {
        match self {
            Self::Smtp(err) => Some(err.code),
            Self::AuthenticationFailed(inner) => inner.reply_code(),
            _ => None,
        }
    }

    /// Returns true if the error was raised before anything was written
    /// for the transaction, so the connection is still usable.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(
            self,
            Self::MissingSender
                | Self::NoRecipients
                | Self::InvalidAddress(_)
                | Self::MessageTooLarge { .. }
                | Self::BareLineFeed
                | Self::PoolStopped
        )
    }
}

impl From<SmtpError> for Error {
    fn from(err: SmtpError) -> Self {
        Self::Smtp(err)
    }
}

/// An error reply, with the stage that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpError {
    /// Command or stage the reply answered (`"MAIL FROM"`, `"greeting"`).
    pub context: &'static str,
    /// Reply code.
    pub code: u16,
    /// Reply text, one entry per line.
    pub lines: Vec<String>,
    /// Enhanced status code, when the server advertises them.
    pub enhanced: Option<EnhancedStatusCode>,
}

impl SmtpError {
    /// Builds an error from a reply.
    ///
    /// The enhanced status code is only parsed when `enhanced` is set, since
    /// servers that do not advertise `ENHANCEDSTATUSCODES` may start their
    /// text with anything.
    #[must_use]
    pub fn from_reply(context: &'static str, reply: &Reply, enhanced: bool) -> Self {
        let enhanced = if enhanced {
            reply
                .message
                .first()
                .and_then(|line| EnhancedStatusCode::parse(line))
        } else {
            None
        };
        Self {
            context,
            code: reply.code.as_u16(),
            lines: reply.message.clone(),
            enhanced,
        }
    }

    /// Returns true if this is a permanent error (5xx).
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    /// Returns true if this is a transient error (4xx).
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        self.code >= 400 && self.code < 500
    }
}

impl fmt::Display for SmtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: SMTP error {}", self.context, self.code)?;
        if let Some(enhanced) = self.enhanced {
            write!(f, " ({enhanced})")?;
        }
        write!(f, ": {}", self.lines.join(" "))
    }
}

impl std::error::Error for SmtpError {}

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
    use crate::types::ReplyCode;

    fn reply(code: u16, text: &str) -> Reply {
        Reply::new(ReplyCode::new(code), vec![text.to_string()])
    }

    #[test]
    fn test_classification() {
        let permanent = Error::from(SmtpError::from_reply("RCPT TO", &reply(550, "no"), false));
        assert!(permanent.is_permanent());
        assert!(!permanent.is_transient());
        assert_eq!(permanent.reply_code(), Some(550));

        let transient = Error::from(SmtpError::from_reply("RCPT TO", &reply(451, "later"), false));
        assert!(transient.is_transient());
        assert!(!transient.is_permanent());
    }

    #[test]
    fn test_auth_failure_delegates_classification() {
        let inner = Error::from(SmtpError::from_reply("AUTH", &reply(535, "bad"), false));
        let err = Error::AuthenticationFailed(Box::new(inner));
        assert!(err.is_permanent());
        assert_eq!(err.reply_code(), Some(535));
    }

    #[test]
    fn test_enhanced_code_only_when_advertised() {
        let r = reply(550, "5.1.1 User unknown");
        let plain = SmtpError::from_reply("RCPT TO", &r, false);
        assert_eq!(plain.enhanced, None);

        let enhanced = SmtpError::from_reply("RCPT TO", &r, true);
        let code = enhanced.enhanced.unwrap();
        assert_eq!((code.class, code.subject, code.detail), (5, 1, 1));
        assert_eq!(
            enhanced.to_string(),
            "RCPT TO failed: SMTP error 550 (5.1.1): 5.1.1 User unknown"
        );
    }

    #[test]
    fn test_is_local() {
        assert!(Error::MissingSender.is_local());
        assert!(Error::MessageTooLarge { size: 2, limit: 1 }.is_local());
        assert!(Error::BareLineFeed.is_local());
        assert!(!Error::ConnectionClosed.is_local());
        assert!(!Error::NoRecipientsAccepted.is_local());
        assert!(!Error::Format("x".into()).is_local());
    }

    #[test]
    fn test_format_distinct_from_smtp() {
        let err = Error::Format("bad line".into());
        assert_eq!(err.reply_code(), None);
        assert!(!err.is_permanent());
    }
}
