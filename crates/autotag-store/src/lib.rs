//! Storage layer: DuckDB-backed tickets, messages and tag audits.

mod duck;
mod error;
mod tag_writer;

pub use duck::{MetricCounts, NewMessage, TicketStore, UnitOfWork};
pub use error::StoreError;
pub use tag_writer::{TagProposal, WriteOutcome};
