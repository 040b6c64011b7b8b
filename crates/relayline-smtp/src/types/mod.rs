//! Core SMTP types.

mod address;
mod capability;
mod reply;
mod transaction;

pub use address::Address;
pub use capability::{Capabilities, Extension};
pub use reply::{EnhancedStatusCode, Reply, ReplyCode};
pub use transaction::{MailResult, Transaction, TransactionBuilder};
