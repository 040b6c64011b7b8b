//! MAIL FROM / RCPT TO / DATA and the message body.

use super::{Session, SessionState};
use crate::command::Command;
use crate::config::BareLfPolicy;
use crate::connection::{Transport, body};
use crate::error::{Error, Result};
use crate::types::{Address, MailResult, Reply, Transaction};

impl<S: Transport> Session<'_, S> {
    /// Runs one mail transaction on a ready connection.
    ///
    /// Local checks (bare LF policy, advertised SIZE) run before anything
    /// is written; their errors leave the session `Ready`.
    ///
    /// # Errors
    ///
    /// Returns local validation errors, the first rejecting reply, or a
    /// transport error.
    pub async fn send(&mut self, tx: &Transaction) -> Result<MailResult> {
        self.precheck(tx)?;
        self.transition(SessionState::SendingEnvelope);
        match self.run_transaction(tx).await {
            Ok(result) => Ok(result),
            Err(err) => Err(self.fail(err)),
        }
    }

    fn precheck(&self, tx: &Transaction) -> Result<()> {
        if self.config.bare_lf == BareLfPolicy::Reject && body::has_bare_lf(tx.message()) {
            return Err(Error::BareLineFeed);
        }
        let limit = self.conn.capabilities().max_message_size;
        let size = tx.message().len() as u64;
        if limit > 0 && size > limit {
            return Err(Error::MessageTooLarge { size, limit });
        }
        Ok(())
    }

    async fn run_transaction(&mut self, tx: &Transaction) -> Result<MailResult> {
        let capabilities = self.conn.capabilities();
        let size = (capabilities.max_message_size > 0).then(|| tx.message().len() as u64);
        let pipelined = self.config.pipelining && capabilities.pipelining;

        let accepted = if pipelined {
            self.pipelined_envelope(tx, size).await?
        } else {
            self.sequential_envelope(tx, size).await?
        };

        self.transition(SessionState::SendingData);
        self.conn.write_body(tx.message()).await?;
        let reply = self.conn.read_reply().await?;
        if !reply.is_success() {
            return Err(self.reply_error("DATA", &reply));
        }

        self.conn.record_mail();
        self.transition(SessionState::Sent);
        tracing::debug!(
            connection = self.conn.id(),
            recipients = accepted.len(),
            message_id = tx.message_id(),
            "message accepted"
        );
        Ok(MailResult {
            accepted_recipients: accepted,
            message_id: tx.message_id().map(str::to_string),
        })
    }

    /// Sends the whole envelope in one write and matches replies by position.
    async fn pipelined_envelope(&mut self, tx: &Transaction, size: Option<u64>) -> Result<Vec<Address>> {
        let mut commands = Vec::with_capacity(tx.to().len() + 2);
        commands.push(Command::MailFrom {
            from: tx.from().clone(),
            size,
        });
        commands.extend(tx.to().iter().map(|to| Command::RcptTo { to: to.clone() }));
        commands.push(Command::Data);

        let replies = self.conn.write_batch(&commands).await?;
        let Some((data, envelope)) = replies.split_last() else {
            return Err(Error::Format("no replies to pipelined envelope".into()));
        };
        let Some((mail, rcpts)) = envelope.split_first() else {
            return Err(Error::Format("no reply to MAIL FROM".into()));
        };

        let mut accepted = Vec::with_capacity(tx.to().len());
        let evaluated = self.check_mail(mail).and_then(|()| {
            tx.to()
                .iter()
                .zip(rcpts)
                .try_for_each(|(to, reply)| self.check_rcpt(to, reply, &mut accepted))
        });

        let failure = match evaluated {
            Err(err) => Some(err),
            Ok(()) if accepted.is_empty() => Some(Error::NoRecipientsAccepted),
            Ok(()) => None,
        };
        if let Some(err) = failure {
            // The server may still be waiting for the body.
            if data.is_intermediate() {
                self.abort_data().await;
            }
            return Err(err);
        }

        if !data.is_intermediate() {
            return Err(self.reply_error("DATA", data));
        }
        Ok(accepted)
    }

    /// Sends each envelope command and waits for its reply.
    async fn sequential_envelope(&mut self, tx: &Transaction, size: Option<u64>) -> Result<Vec<Address>> {
        let reply = self
            .conn
            .write(&Command::MailFrom {
                from: tx.from().clone(),
                size,
            })
            .await?;
        self.check_mail(&reply)?;

        let mut accepted = Vec::with_capacity(tx.to().len());
        for to in tx.to() {
            let reply = self.conn.write(&Command::RcptTo { to: to.clone() }).await?;
            self.check_rcpt(to, &reply, &mut accepted)?;
        }
        if accepted.is_empty() {
            return Err(Error::NoRecipientsAccepted);
        }

        let reply = self.conn.write(&Command::Data).await?;
        if !reply.is_intermediate() {
            return Err(self.reply_error("DATA", &reply));
        }
        Ok(accepted)
    }

    fn check_mail(&self, reply: &Reply) -> Result<()> {
        if reply.is_success() {
            Ok(())
        } else {
            Err(self.reply_error("MAIL FROM", reply))
        }
    }

    fn check_rcpt(&self, to: &Address, reply: &Reply, accepted: &mut Vec<Address>) -> Result<()> {
        if reply.is_success() {
            accepted.push(to.clone());
            return Ok(());
        }
        if !self.config.allow_partial_recipients {
            return Err(self.reply_error("RCPT TO", reply));
        }
        tracing::debug!(
            connection = self.conn.id(),
            recipient = %to,
            code = reply.code.as_u16(),
            "recipient rejected, continuing"
        );
        Ok(())
    }

    /// Ends a DATA phase without sending any body.
    async fn abort_data(&mut self) {
        if self.conn.finish_body().await.is_ok() {
            let _ = self.conn.read_reply().await;
        }
    }
}
