//! SQLite audit log for placement attempts.
//!
//! Writes never block the dispatcher: records go over a channel to a
//! dedicated writer thread that batches them into transactions, trims the
//! table to the configured retention and keeps a running-totals row.

pub mod schema;
pub mod types;
pub mod writer;

pub use types::{AuditRecord, AuditTotals};
pub use writer::{create_audit_channel, AuditChannel};
