//! # relayline-sasl
//!
//! Client-side SASL mechanisms used by the SMTP `AUTH` command (RFC 4954).
//!
//! Every mechanism is a small, single-use state machine: the caller feeds it
//! the decoded server challenge and gets back the raw client response. Base64
//! framing on the wire is left to the protocol layer.
//!
//! ## Mechanisms
//!
//! - PLAIN (RFC 4616)
//! - LOGIN (legacy, draft-murchison-sasl-login)
//! - CRAM-MD5 (RFC 2195), CRAM-SHA1, CRAM-SHA256
//! - XOAUTH2 (Google/Microsoft proprietary)
//! - OAUTHBEARER (RFC 7628)
//!
//! ## Example
//!
//! ```
//! use relayline_sasl::{Credentials, Mechanism, mechanism};
//!
//! let credentials = Credentials::new("user@example.com", "secret");
//! let mut plain = mechanism("PLAIN", &credentials).unwrap();
//!
//! let initial = plain.next_step(None).unwrap();
//! assert_eq!(initial.as_deref(), Some(&b"\0user@example.com\0secret"[..]));
//! assert_eq!(plain.next_step(Some(b"")).unwrap(), None);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod credentials;
pub mod crypt;
mod error;
pub mod mechanism;

pub use credentials::Credentials;
pub use error::{Error, Result};
pub use mechanism::{Mechanism, SUPPORTED, is_supported, mechanism};
