//! One SMTP transport plus its lifecycle state and negotiated capabilities.

pub mod body;
mod state;
mod stream;

pub use state::{ConnectionEvent, ConnectionState};
pub use stream::{Connector, SmtpStream, TcpConnector, Transport};

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;

use crate::command::Command;
use crate::error::{Error, Result};
use crate::parser::ReplyParser;
use crate::types::{Capabilities, Reply};

/// Body bytes buffered before they are pushed to the transport.
const BODY_HIGH_WATER: usize = 64 * 1024;

/// Upper bound on waiting for the server to answer QUIT.
const QUIT_TIMEOUT: Duration = Duration::from_secs(5);

/// A single connection to the server.
///
/// Executes one command/reply cycle at a time, except for pipelined batches
/// where replies are matched to commands by position.
#[derive(Debug)]
pub struct Connection<S> {
    id: u64,
    stream: Option<S>,
    parser: ReplyParser,
    write_buf: BytesMut,
    state: ConnectionState,
    capabilities: Capabilities,
    closing: bool,
    created_at: Instant,
    last_used: Instant,
    mails_sent: u32,
}

impl<S: Transport> Connection<S> {
    /// Wraps a freshly opened transport.
    pub fn new(id: u64, stream: S) -> Self {
        let now = Instant::now();
        Self {
            id,
            stream: Some(stream),
            parser: ReplyParser::new(),
            write_buf: BytesMut::with_capacity(1024),
            state: ConnectionState::Establishing,
            capabilities: Capabilities::default(),
            closing: false,
            created_at: now,
            last_used: now,
            mails_sent: 0,
        }
    }

    /// Pool-assigned identifier.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Capabilities from the most recent successful EHLO.
    #[must_use]
    pub const fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Replaces the capability set after EHLO/HELO.
    pub fn set_capabilities(&mut self, capabilities: Capabilities) {
        self.capabilities = capabilities;
    }

    /// Returns true if the transport is TLS-protected.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.stream.as_ref().is_some_and(Transport::is_encrypted)
    }

    /// Time since the connection was opened.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the last command was written.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Number of transactions completed on this connection.
    #[must_use]
    pub const fn mails_sent(&self) -> u32 {
        self.mails_sent
    }

    /// Counts one completed transaction.
    pub const fn record_mail(&mut self) {
        self.mails_sent = self.mails_sent.saturating_add(1);
    }

    /// Applies a lifecycle event.
    pub fn transition(&mut self, event: ConnectionEvent) {
        let next = self.state.on(event);
        if next != self.state {
            tracing::trace!(connection = self.id, from = ?self.state, to = ?next, "connection state");
            self.state = next;
        }
    }

    /// Parks the connection as idle.
    pub fn mark_idle(&mut self) {
        self.transition(ConnectionEvent::Released);
    }

    /// Marks the connection as unusable.
    pub fn mark_broken(&mut self) {
        self.transition(ConnectionEvent::Failed);
    }

    /// Returns true if the connection may be handed out again.
    #[must_use]
    pub const fn is_reusable(&self) -> bool {
        self.state.is_reusable()
    }

    /// Sends a command and waits for its reply.
    ///
    /// # Errors
    ///
    /// Returns transport and format errors; the connection is then broken.
    /// An error reply from the server is returned as `Ok`.
    pub async fn write(&mut self, command: &Command) -> Result<Reply> {
        self.send(command).await?;
        self.read_reply().await
    }

    /// Writes every command in one write, then reads one reply per command
    /// in the same order.
    ///
    /// # Errors
    ///
    /// Returns transport and format errors; the connection is then broken.
    pub async fn write_batch(&mut self, commands: &[Command]) -> Result<Vec<Reply>> {
        self.write_buf.clear();
        for command in commands {
            tracing::trace!(connection = self.id, "C: {command}");
            command.encode(&mut self.write_buf);
        }
        self.flush_write_buf().await?;

        let mut replies = Vec::with_capacity(commands.len());
        for _ in commands {
            replies.push(self.read_reply().await?);
        }
        Ok(replies)
    }

    /// Sends a command without waiting for a reply.
    ///
    /// # Errors
    ///
    /// Returns transport errors; the connection is then broken.
    pub async fn send(&mut self, command: &Command) -> Result<()> {
        tracing::trace!(connection = self.id, "C: {command}");
        self.write_buf.clear();
        command.encode(&mut self.write_buf);
        self.flush_write_buf().await
    }

    /// Buffers one DATA line, dot-stuffed and CRLF-terminated.
    ///
    /// The buffer is pushed to the transport once it passes a high-water
    /// mark, so a slow server suspends the caller instead of letting the
    /// buffer grow.
    ///
    /// # Errors
    ///
    /// Returns transport errors; the connection is then broken.
    pub async fn write_body_line(&mut self, line: &[u8]) -> Result<()> {
        body::encode_line(line, &mut self.write_buf);
        if self.write_buf.len() >= BODY_HIGH_WATER {
            self.flush_write_buf().await?;
        }
        Ok(())
    }

    /// Streams a whole message followed by the end-of-data marker.
    ///
    /// # Errors
    ///
    /// Returns transport errors; the connection is then broken.
    pub async fn write_body(&mut self, message: &[u8]) -> Result<()> {
        self.write_buf.clear();
        for line in body::lines(message) {
            self.write_body_line(line).await?;
        }
        self.finish_body().await
    }

    /// Writes the lone `.` line that ends DATA.
    ///
    /// # Errors
    ///
    /// Returns transport errors; the connection is then broken.
    pub async fn finish_body(&mut self) -> Result<()> {
        tracing::trace!(connection = self.id, "C: .");
        self.write_buf.extend_from_slice(body::TERMINATOR);
        self.flush_write_buf().await
    }

    /// Reads the next complete reply.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] on EOF, [`Error::Format`] for a
    /// malformed reply, or an I/O error; the connection is then broken.
    pub async fn read_reply(&mut self) -> Result<Reply> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.parser.next_reply() {
                Ok(Some(reply)) => {
                    tracing::trace!(connection = self.id, code = reply.code.as_u16(), "S: {}", reply.message_text());
                    return Ok(reply);
                }
                Ok(None) => {}
                Err(err) => return Err(self.fail(err)),
            }

            let read = match self.stream.as_mut() {
                Some(stream) => stream.read(&mut chunk).await,
                None => return Err(Error::ConnectionClosed),
            };
            match read {
                Ok(0) => return Err(self.fail(Error::ConnectionClosed)),
                Ok(n) => self.parser.feed(&chunk[..n]),
                Err(err) => return Err(self.fail(err.into())),
            }
        }
    }

    /// Hands the transport to `connector` for the TLS handshake.
    ///
    /// Bytes buffered before the upgrade are discarded.
    ///
    /// # Errors
    ///
    /// Returns the handshake error; the connection is then broken.
    pub async fn upgrade_to_tls<C>(&mut self, connector: &C) -> Result<()>
    where
        C: Connector<Stream = S>,
    {
        let stream = self.stream.take().ok_or(Error::ConnectionClosed)?;
        match connector.upgrade_to_tls(stream).await {
            Ok(upgraded) => {
                self.stream = Some(upgraded);
                self.parser.reset();
                tracing::debug!(connection = self.id, "TLS established");
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Best-effort QUIT followed by transport shutdown.
    ///
    /// Errors are swallowed; the connection ends up closed either way.
    pub async fn quit(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.closing = true;
        if self.state != ConnectionState::Broken {
            let quit = tokio::time::timeout(QUIT_TIMEOUT, self.write(&Command::Quit)).await;
            if !matches!(quit, Ok(Ok(_))) {
                tracing::trace!(connection = self.id, "QUIT not acknowledged");
            }
        }
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        self.transition(ConnectionEvent::Closed);
    }

    async fn flush_write_buf(&mut self) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(Error::ConnectionClosed);
        };
        let result = match stream.write_all(&self.write_buf).await {
            Ok(()) => stream.flush().await,
            Err(err) => Err(err),
        };
        self.write_buf.clear();
        self.last_used = Instant::now();
        result.map_err(|err| self.fail(err.into()))
    }

    /// Breaks the connection on a transport or format error.
    ///
    /// During our own QUIT the failure is expected and only traced.
    fn fail(&mut self, err: Error) -> Error {
        if self.closing {
            tracing::trace!(connection = self.id, error = %err, "error during close");
        } else {
            tracing::debug!(connection = self.id, error = %err, "connection failed");
        }
        self.mark_broken();
        err
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
    use crate::types::Address;
    use tokio_test::io::{Builder, Mock};

    impl Transport for Mock {
        fn is_encrypted(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_write_reads_reply() {
        let mock = Builder::new()
            .write(b"NOOP\r\n")
            .read(b"250 2.0.0 OK\r\n")
            .build();
        let mut conn = Connection::new(1, mock);
        let reply = conn.write(&Command::Noop).await.unwrap();
        assert!(reply.is_success());
        assert_eq!(conn.state(), ConnectionState::Establishing);
    }

    #[tokio::test]
    async fn test_reply_split_across_reads() {
        let mock = Builder::new()
            .write(b"EHLO me\r\n")
            .read(b"250-mx\r\n250-PIPE")
            .read(b"LINING\r\n250 SIZE 10\r\n")
            .build();
        let mut conn = Connection::new(1, mock);
        let reply = conn
            .write(&Command::Ehlo {
                hostname: "me".into(),
            })
            .await
            .unwrap();
        assert_eq!(reply.message, vec!["mx", "PIPELINING", "SIZE 10"]);
    }

    #[tokio::test]
    async fn test_batch_is_one_write() {
        let from = Address::new("a@example.com").unwrap();
        let to = Address::new("b@example.com").unwrap();
        let mock = Builder::new()
            .write(b"MAIL FROM:<a@example.com>\r\nRCPT TO:<b@example.com>\r\nDATA\r\n")
            .read(b"250 ok\r\n250 ok\r\n354 go\r\n")
            .build();
        let mut conn = Connection::new(1, mock);
        let replies = conn
            .write_batch(&[
                Command::MailFrom { from, size: None },
                Command::RcptTo { to },
                Command::Data,
            ])
            .await
            .unwrap();
        let codes: Vec<u16> = replies.iter().map(|r| r.code.as_u16()).collect();
        assert_eq!(codes, vec![250, 250, 354]);
    }

    #[tokio::test]
    async fn test_write_body_stuffs_and_terminates() {
        let mock = Builder::new()
            .write(b"line\r\n..dot\r\n.\r\n")
            .build();
        let mut conn = Connection::new(1, mock);
        conn.write_body(b"line\n.dot\n").await.unwrap();
    }

    #[tokio::test]
    async fn test_eof_breaks_connection() {
        let mock = Builder::new().write(b"RSET\r\n").build();
        let mut conn = Connection::new(7, mock);
        let err = conn.write(&Command::Rset).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
        assert_eq!(conn.state(), ConnectionState::Broken);
        assert!(!conn.is_reusable());
    }

    #[tokio::test]
    async fn test_malformed_reply_breaks_connection() {
        let mock = Builder::new()
            .write(b"NOOP\r\n")
            .read(b"hello there\r\n")
            .build();
        let mut conn = Connection::new(1, mock);
        let err = conn.write(&Command::Noop).await.unwrap_err();
        assert!(matches!(err, Error::Format(_)));
        assert_eq!(conn.state(), ConnectionState::Broken);
    }

    #[tokio::test]
    async fn test_quit_swallows_errors() {
        let mock = Builder::new().write(b"QUIT\r\n").build();
        let mut conn = Connection::new(1, mock);
        conn.quit().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        conn.quit().await;
    }

    #[tokio::test]
    async fn test_lifecycle_marks() {
        let mock = Builder::new().build();
        let mut conn = Connection::new(1, mock);
        conn.transition(ConnectionEvent::Ready);
        assert_eq!(conn.state(), ConnectionState::Active);
        conn.mark_idle();
        assert_eq!(conn.state(), ConnectionState::Idle);
        conn.mark_broken();
        conn.mark_idle();
        assert_eq!(conn.state(), ConnectionState::Broken);
        assert_eq!(conn.mails_sent(), 0);
        conn.record_mail();
        assert_eq!(conn.mails_sent(), 1);
    }
}
