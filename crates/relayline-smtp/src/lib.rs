//! # relayline-smtp
//!
//! An asynchronous SMTP client engine (RFC 5321) for submitting mail through
//! a single relay over a pool of reusable connections.
//!
//! ## Features
//!
//! - **Connection pool**: bounded size, FIFO waiters, RSET revalidation of
//!   idle connections, idle eviction and graceful shutdown
//! - **Session engine**: greeting, EHLO with HELO fallback, STARTTLS, SASL
//!   authentication and mail transactions, pipelined when advertised
//! - **Authentication chain**: PLAIN, LOGIN, CRAM-MD5/SHA1/SHA256, XOAUTH2 and
//!   OAUTHBEARER, tried in preference order
//! - **Incremental reply parser**: multi-line replies, CRLF or bare LF
//!   framing, enhanced status codes
//!
//! ## Quick Start
//!
//! ```ignore
//! use relayline_smtp::{Config, Pool, TcpConnector, TlsMode, Transaction};
//!
//! #[tokio::main]
//! async fn main() -> relayline_smtp::Result<()> {
//!     let config = Config::builder("smtp.example.com")
//!         .starttls(TlsMode::Required)
//!         .credentials("user@example.com", "password")
//!         .build();
//!     let pool = Pool::new(config.clone(), TcpConnector::new(&config));
//!
//!     let tx = Transaction::builder()
//!         .from("sender@example.com")
//!         .to("recipient@example.com")
//!         .message("Subject: Test\r\n\r\nHello, World!\r\n")
//!         .build()?;
//!     let result = pool.send(&tx).await?;
//!     println!("accepted: {:?}", result.accepted_recipients);
//!
//!     pool.stop().await;
//!     pool.closed().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`pool`]: connection pool
//! - [`session`]: per-connection protocol state machine
//! - [`auth`]: SASL mechanism chain
//! - [`connection`]: transport, framing and connection lifecycle
//! - [`parser`]: incremental reply parser
//! - [`command`]: SMTP command serialization
//! - [`types`]: addresses, replies, capabilities and transactions

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod auth;
pub mod command;
pub mod config;
pub mod connection;
mod error;
pub mod parser;
pub mod pool;
pub mod session;
pub mod types;

pub use config::{BareLfPolicy, Config, ConfigBuilder, LoginMode, TlsMode};
pub use connection::{Connector, SmtpStream, TcpConnector, Transport};
pub use error::{Error, Result, SmtpError};
pub use parser::ReplyParser;
pub use pool::{Pool, PooledConnection};
pub use relayline_sasl::Credentials;
pub use types::{
    Address, Capabilities, EnhancedStatusCode, Extension, MailResult, Reply, ReplyCode,
    Transaction, TransactionBuilder,
};
