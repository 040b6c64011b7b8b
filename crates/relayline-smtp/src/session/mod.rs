//! Protocol state machine for one connection.
//!
//! ```text
//! Connecting -> Greeted -> NegotiatingHello -> CapabilitiesKnown
//!     [-> StartingTls -> TlsEstablished -> NegotiatingHello -> CapabilitiesKnown]
//!     -> Authenticating -> Ready -> SendingEnvelope -> SendingData -> Sent
//!     -> Closing -> Closed
//! ```
//!
//! `Failed` is reachable from every state and absorbs everything after it.

mod envelope;

use crate::auth::{self, AuthOutcome};
use crate::command::Command;
use crate::config::{Config, LoginMode, TlsMode};
use crate::connection::{Connection, ConnectionEvent, Connector, Transport};
use crate::error::{Error, Result, SmtpError};
use crate::types::{Capabilities, Reply};

/// Session progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the greeting.
    Connecting,
    /// Greeting accepted.
    Greeted,
    /// EHLO or HELO in flight.
    NegotiatingHello,
    /// Capabilities parsed.
    CapabilitiesKnown,
    /// STARTTLS sent.
    StartingTls,
    /// TLS handshake done; capabilities must be fetched again.
    TlsEstablished,
    /// Running the AUTH chain.
    Authenticating,
    /// Ready for a transaction.
    Ready,
    /// MAIL FROM / RCPT TO / DATA in flight.
    SendingEnvelope,
    /// Streaming the body.
    SendingData,
    /// Final reply accepted.
    Sent,
    /// QUIT in flight.
    Closing,
    /// Done.
    Closed,
    /// Aborted.
    Failed,
}

/// What the handshake found out about authentication.
#[derive(Debug)]
pub struct Handshake {
    /// Result of the AUTH chain.
    pub auth: AuthOutcome,
}

/// Drives the protocol over a borrowed connection.
#[derive(Debug)]
pub struct Session<'a, S> {
    conn: &'a mut Connection<S>,
    config: &'a Config,
    state: SessionState,
    esmtp: bool,
}

impl<'a, S: Transport> Session<'a, S> {
    /// Starts a session on a connection that has not been greeted yet.
    #[must_use]
    pub fn connecting(conn: &'a mut Connection<S>, config: &'a Config) -> Self {
        Self {
            conn,
            config,
            state: SessionState::Connecting,
            esmtp: false,
        }
    }

    /// Resumes a session on a connection that completed its handshake.
    #[must_use]
    pub fn ready(conn: &'a mut Connection<S>, config: &'a Config) -> Self {
        Self {
            conn,
            config,
            state: SessionState::Ready,
            esmtp: true,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        if self.state == SessionState::Failed {
            return;
        }
        tracing::trace!(connection = self.conn.id(), from = ?self.state, to = ?next, "session state");
        self.state = next;
    }

    fn fail(&mut self, err: Error) -> Error {
        tracing::debug!(connection = self.conn.id(), state = ?self.state, error = %err, "session failed");
        self.transition(SessionState::Failed);
        err
    }

    fn reply_error(&self, context: &'static str, reply: &Reply) -> Error {
        SmtpError::from_reply(context, reply, self.conn.capabilities().enhanced_status_codes)
            .into()
    }

    /// Greeting, EHLO/HELO, optional STARTTLS and AUTH.
    ///
    /// # Errors
    ///
    /// Returns the first failure; the session is then `Failed`.
    pub async fn handshake<C>(&mut self, connector: &C, preferred: Option<&str>) -> Result<Handshake>
    where
        C: Connector<Stream = S>,
    {
        match self.run_handshake(connector, preferred).await {
            Ok(handshake) => Ok(handshake),
            Err(err) => Err(self.fail(err)),
        }
    }

    async fn run_handshake<C>(&mut self, connector: &C, preferred: Option<&str>) -> Result<Handshake>
    where
        C: Connector<Stream = S>,
    {
        self.greet().await?;
        self.hello().await?;

        if self.wants_starttls()? {
            self.starttls(connector).await?;
            self.hello().await?;
            if self.config.starttls == TlsMode::Required && !self.conn.is_encrypted() {
                return Err(Error::TlsRequired);
            }
        }

        self.transition(SessionState::Authenticating);
        let auth = match auth::authenticate(self.conn, self.config, preferred).await? {
            AuthOutcome::Failed(err) if self.config.login == LoginMode::Required => {
                return Err(Error::AuthenticationFailed(Box::new(err)));
            }
            AuthOutcome::Failed(err) => {
                tracing::debug!(connection = self.conn.id(), error = %err, "continuing without authentication");
                AuthOutcome::Failed(err)
            }
            outcome => outcome,
        };

        self.conn.transition(ConnectionEvent::Ready);
        self.transition(SessionState::Ready);
        Ok(Handshake { auth })
    }

    async fn greet(&mut self) -> Result<()> {
        let greeting = self.conn.read_reply().await?;
        if !greeting.is_positive() {
            return Err(self.reply_error("greeting", &greeting));
        }
        self.esmtp = !self.config.disable_esmtp && greeting.message_text().contains("ESMTP");
        self.transition(SessionState::Greeted);
        Ok(())
    }

    async fn hello(&mut self) -> Result<()> {
        self.transition(SessionState::NegotiatingHello);
        let hostname = self.config.client_hostname.clone();

        if self.esmtp {
            let reply = self
                .conn
                .write(&Command::Ehlo {
                    hostname: hostname.clone(),
                })
                .await?;
            if reply.is_success() {
                self.conn.set_capabilities(Capabilities::from_ehlo(&reply));
                self.transition(SessionState::CapabilitiesKnown);
                return Ok(());
            }
            if !reply.is_transient_error() {
                return Err(self.reply_error("EHLO", &reply));
            }
            tracing::debug!(connection = self.conn.id(), code = reply.code.as_u16(), "EHLO refused, falling back to HELO");
            self.esmtp = false;
        }

        let reply = self.conn.write(&Command::Helo { hostname }).await?;
        if !reply.is_success() {
            return Err(self.reply_error("HELO", &reply));
        }
        self.conn.set_capabilities(Capabilities::default());
        self.transition(SessionState::CapabilitiesKnown);
        Ok(())
    }

    fn wants_starttls(&self) -> Result<bool> {
        if self.conn.is_encrypted() || self.config.starttls == TlsMode::Disabled {
            return Ok(false);
        }
        if self.conn.capabilities().starttls {
            return Ok(true);
        }
        if self.config.starttls == TlsMode::Required {
            return Err(Error::TlsRequired);
        }
        Ok(false)
    }

    async fn starttls<C>(&mut self, connector: &C) -> Result<()>
    where
        C: Connector<Stream = S>,
    {
        self.transition(SessionState::StartingTls);
        let reply = self.conn.write(&Command::StartTls).await?;
        if !reply.is_success() {
            return Err(self.reply_error("STARTTLS", &reply));
        }
        self.conn.upgrade_to_tls(connector).await?;
        // Capabilities from the plaintext EHLO no longer apply.
        self.conn.set_capabilities(Capabilities::default());
        self.transition(SessionState::TlsEstablished);
        Ok(())
    }

    /// Best-effort QUIT; the outcome is ignored.
    pub async fn close(&mut self) {
        self.transition(SessionState::Closing);
        self.conn.quit().await;
        self.transition(SessionState::Closed);
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
    use crate::types::Transaction;
    use tokio_test::io::{Builder, Mock};

    struct MockConnector;

    impl Connector for MockConnector {
        type Stream = Mock;

        async fn connect(&self) -> Result<Mock> {
            Err(Error::ConnectionClosed)
        }

        async fn upgrade_to_tls(&self, stream: Mock) -> Result<Mock> {
            Ok(stream)
        }
    }

    fn config() -> Config {
        Config::builder("mx").client_hostname("client.test").build()
    }

    #[tokio::test]
    async fn test_plain_smtp_greeting_uses_helo() {
        let mock = Builder::new()
            .read(b"220 mx.test Postfix\r\n")
            .write(b"HELO client.test\r\n")
            .read(b"250 mx.test\r\n")
            .build();
        let mut conn = Connection::new(1, mock);
        let config = config();
        let mut session = Session::connecting(&mut conn, &config);
        let handshake = session.handshake(&MockConnector, None).await.unwrap();
        assert!(matches!(handshake.auth, AuthOutcome::Skipped));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_disable_esmtp_forces_helo() {
        let mock = Builder::new()
            .read(b"220 mx.test ESMTP\r\n")
            .write(b"HELO client.test\r\n")
            .read(b"250 mx.test\r\n")
            .build();
        let mut conn = Connection::new(1, mock);
        let config = Config::builder("mx")
            .client_hostname("client.test")
            .disable_esmtp(true)
            .build();
        let mut session = Session::connecting(&mut conn, &config);
        session.handshake(&MockConnector, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_ehlo_falls_back_to_helo() {
        let mock = Builder::new()
            .read(b"220 mx.test ESMTP\r\n")
            .write(b"EHLO client.test\r\n")
            .read(b"402 try HELO\r\n")
            .write(b"HELO client.test\r\n")
            .read(b"250 mx.test\r\n")
            .build();
        let mut conn = Connection::new(1, mock);
        let config = config();
        let mut session = Session::connecting(&mut conn, &config);
        session.handshake(&MockConnector, None).await.unwrap();
        assert_eq!(conn.capabilities(), &Capabilities::default());
    }

    #[tokio::test]
    async fn test_permanent_ehlo_fails() {
        let mock = Builder::new()
            .read(b"220 mx.test ESMTP\r\n")
            .write(b"EHLO client.test\r\n")
            .read(b"550 go away\r\n")
            .build();
        let mut conn = Connection::new(1, mock);
        let config = config();
        let mut session = Session::connecting(&mut conn, &config);
        let err = session.handshake(&MockConnector, None).await.unwrap_err();
        assert_eq!(err.reply_code(), Some(550));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_rejected_greeting() {
        let mock = Builder::new().read(b"554 no service\r\n").build();
        let mut conn = Connection::new(1, mock);
        let config = config();
        let mut session = Session::connecting(&mut conn, &config);
        let err = session.handshake(&MockConnector, None).await.unwrap_err();
        assert!(matches!(err, Error::Smtp(ref e) if e.context == "greeting" && e.code == 554));
    }

    #[tokio::test]
    async fn test_required_tls_not_offered() {
        let mock = Builder::new()
            .read(b"220 mx.test ESMTP\r\n")
            .write(b"EHLO client.test\r\n")
            .read(b"250-mx.test\r\n250 PIPELINING\r\n")
            .build();
        let mut conn = Connection::new(1, mock);
        let config = Config::builder("mx")
            .client_hostname("client.test")
            .starttls(TlsMode::Required)
            .build();
        let mut session = Session::connecting(&mut conn, &config);
        let err = session.handshake(&MockConnector, None).await.unwrap_err();
        assert!(matches!(err, Error::TlsRequired));
    }

    #[tokio::test]
    async fn test_starttls_then_second_ehlo() {
        let mock = Builder::new()
            .read(b"220 mx.test ESMTP\r\n")
            .write(b"EHLO client.test\r\n")
            .read(b"250-mx.test\r\n250 STARTTLS\r\n")
            .write(b"STARTTLS\r\n")
            .read(b"220 ready\r\n")
            .write(b"EHLO client.test\r\n")
            .read(b"250-mx.test\r\n250 AUTH PLAIN\r\n")
            .build();
        let mut conn = Connection::new(1, mock);
        let config = config();
        let mut session = Session::connecting(&mut conn, &config);
        session.handshake(&MockConnector, None).await.unwrap();
        assert!(conn.capabilities().supports_auth("PLAIN"));
        assert!(!conn.capabilities().starttls);
    }

    #[tokio::test]
    async fn test_sequential_send_with_partial_recipients() {
        let mock = Builder::new()
            .write(b"MAIL FROM:<a@test>\r\n")
            .read(b"250 ok\r\n")
            .write(b"RCPT TO:<b@test>\r\n")
            .read(b"550 no\r\n")
            .write(b"RCPT TO:<c@test>\r\n")
            .read(b"250 ok\r\n")
            .write(b"DATA\r\n")
            .read(b"354 go\r\n")
            .write(b"Subject: x\r\n\r\n..dot\r\n.\r\n")
            .read(b"250 queued\r\n")
            .build();
        let mut conn = Connection::new(1, mock);
        let config = Config::builder("mx").allow_partial_recipients(true).build();
        let tx = Transaction::builder()
            .from("a@test")
            .to("b@test")
            .to("c@test")
            .message("Subject: x\r\n\r\n.dot\r\n")
            .build()
            .unwrap();
        let mut session = Session::ready(&mut conn, &config);
        let result = session.send(&tx).await.unwrap();
        assert_eq!(result.accepted_recipients.len(), 1);
        assert_eq!(result.accepted_recipients[0].as_str(), "c@test");
        assert_eq!(session.state(), SessionState::Sent);
        assert_eq!(conn.mails_sent(), 1);
    }

    #[tokio::test]
    async fn test_rejected_recipient_fails_without_partial() {
        let mock = Builder::new()
            .write(b"MAIL FROM:<a@test>\r\n")
            .read(b"250 ok\r\n")
            .write(b"RCPT TO:<b@test>\r\n")
            .read(b"550 no\r\n")
            .build();
        let mut conn = Connection::new(1, mock);
        let config = config();
        let tx = Transaction::builder()
            .from("a@test")
            .to("b@test")
            .message("hi\r\n")
            .build()
            .unwrap();
        let mut session = Session::ready(&mut conn, &config);
        let err = session.send(&tx).await.unwrap_err();
        assert!(matches!(err, Error::Smtp(ref e) if e.context == "RCPT TO"));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_size_precheck_is_local() {
        let mut conn = Connection::new(1, Builder::new().build());
        conn.set_capabilities(Capabilities {
            max_message_size: 4,
            ..Capabilities::default()
        });
        let config = config();
        let tx = Transaction::builder()
            .from("a@test")
            .to("b@test")
            .message("too long\r\n")
            .build()
            .unwrap();
        let mut session = Session::ready(&mut conn, &config);
        let err = session.send(&tx).await.unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge { size: 10, limit: 4 }));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_bare_lf_rejected_by_policy() {
        let mut conn = Connection::new(1, Builder::new().build());
        let config = Config::builder("mx").bare_lf(crate::config::BareLfPolicy::Reject).build();
        let tx = Transaction::builder()
            .from("a@test")
            .to("b@test")
            .message("a\nb\n")
            .build()
            .unwrap();
        let mut session = Session::ready(&mut conn, &config);
        assert!(matches!(session.send(&tx).await, Err(Error::BareLineFeed)));
    }
}
