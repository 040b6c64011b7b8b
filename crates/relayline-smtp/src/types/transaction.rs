//! Mail transaction input and result.

use bytes::Bytes;

use super::Address;
use crate::error::{Error, Result};

/// One message to deliver: envelope plus the already-encoded body.
#[derive(Debug, Clone)]
pub struct Transaction {
    from: Address,
    to: Vec<Address>,
    message: Bytes,
    message_id: Option<String>,
}

impl Transaction {
    /// Creates a transaction builder.
    #[must_use]
    pub fn builder() -> TransactionBuilder {
        TransactionBuilder::default()
    }

    /// Envelope sender.
    #[must_use]
    pub const fn from(&self) -> &Address {
        &self.from
    }

    /// Envelope recipients, in `RCPT TO` order.
    #[must_use]
    pub fn to(&self) -> &[Address] {
        &self.to
    }

    /// Encoded message bytes (headers and body).
    #[must_use]
    pub const fn message(&self) -> &Bytes {
        &self.message
    }

    /// Message-ID reported back in the result.
    #[must_use]
    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }
}

/// Builder for [`Transaction`].
#[derive(Debug, Clone, Default)]
pub struct TransactionBuilder {
    from: Option<String>,
    to: Vec<String>,
    message: Bytes,
    message_id: Option<String>,
}

impl TransactionBuilder {
    /// Sets the envelope sender.
    #[must_use]
    pub fn from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Adds an envelope recipient.
    #[must_use]
    pub fn to(mut self, to: impl Into<String>) -> Self {
        self.to.push(to.into());
        self
    }

    /// Sets the encoded message.
    #[must_use]
    pub fn message(mut self, message: impl Into<Bytes>) -> Self {
        self.message = message.into();
        self
    }

    /// Sets the Message-ID reported in [`MailResult`].
    #[must_use]
    pub fn message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Validates the envelope and builds the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingSender`], [`Error::NoRecipients`], or
    /// [`Error::InvalidAddress`].
    pub fn build(self) -> Result<Transaction> {
        let from = self.from.ok_or(Error::MissingSender)?;
        if self.to.is_empty() {
            return Err(Error::NoRecipients);
        }
        Ok(Transaction {
            from: Address::new(from)?,
            to: self
                .to
                .into_iter()
                .map(Address::new)
                .collect::<Result<_>>()?,
            message: self.message,
            message_id: self.message_id,
        })
    }
}

/// Outcome of a delivered transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailResult {
    /// Recipients the server accepted.
    pub accepted_recipients: Vec<Address>,
    /// Message-ID from the transaction, if one was set.
    pub message_id: Option<String>,
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
    fn test_build() {
        let tx = Transaction::builder()
            .from("a@example.com")
            .to("b@example.com")
            .to("c@example.com")
            .message("Subject: hi\r\n\r\nbody\r\n")
            .message_id("<1@example.com>")
            .build()
            .unwrap();
        assert_eq!(tx.from().as_str(), "a@example.com");
        assert_eq!(tx.to().len(), 2);
        assert_eq!(tx.message_id(), Some("<1@example.com>"));
        assert!(tx.message().starts_with(b"Subject"));
    }

    #[test]
    fn test_missing_sender() {
        let err = Transaction::builder().to("b@example.com").build().unwrap_err();
        assert!(matches!(err, Error::MissingSender));
    }

    #[test]
    fn test_no_recipients() {
        let err = Transaction::builder().from("a@example.com").build().unwrap_err();
        assert!(matches!(err, Error::NoRecipients));
    }

    #[test]
    fn test_invalid_recipient() {
        let err = Transaction::builder()
            .from("a@example.com")
            .to("not-an-address")
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAddress(_)));
    }
}
