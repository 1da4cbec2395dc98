//! The tagging service: one atomic ingest cycle per inbound message, plus the
//! override, clarification, listing and maintenance operations around it.

mod error;
mod locks;
mod service;

pub use error::ServiceError;
pub use service::{IngestOutcome, Metrics, SeedReport, TaggingService};
