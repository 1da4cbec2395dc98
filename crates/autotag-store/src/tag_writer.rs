//! Idempotent tag upsert with an append-only audit trail.
//!
//! A write that would leave labels, source and confidence exactly as stored
//! is a no-op: nothing is updated and no audit entry is created. Any other
//! write records the old and new values before overwriting the ticket.

use autotag_core::{LabelPair, SourceKind, TagAudit, TagState, Ticket};
use chrono::Utc;
use duckdb::params;
use tracing::{debug, info};

use crate::{StoreError, UnitOfWork};

/// A label decision to apply to a ticket.
#[derive(Debug, Clone, Copy)]
pub struct TagProposal<'a> {
    pub labels: LabelPair,
    pub confidence: f64,
    pub source: SourceKind,
    /// Mandatory for [`SourceKind::Agent`].
    pub reason: Option<&'a str>,
}

impl TagProposal<'_> {
    fn matches(&self, current: &TagState) -> bool {
        current.labels == self.labels
            && current.source == Some(self.source)
            && current.confidence == Some(self.confidence)
    }
}

/// What a tag write did.
#[derive(Debug, Clone)]
pub enum WriteOutcome {
    Unchanged,
    Written(TagAudit),
}

impl WriteOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, Self::Written(_))
    }
}

impl UnitOfWork {
    /// Apply `proposal` to `ticket` inside this transaction.
    pub fn write_tags(
        &self,
        ticket: &mut Ticket,
        proposal: &TagProposal<'_>,
    ) -> Result<WriteOutcome, StoreError> {
        let reason = proposal.reason.map(str::trim).filter(|r| !r.is_empty());
        if proposal.source == SourceKind::Agent && reason.is_none() {
            return Err(StoreError::MissingReason);
        }

        if proposal.matches(&ticket.tags) {
            debug!(ticket_id = %ticket.ticket_id, "tags unchanged, skipping write");
            return Ok(WriteOutcome::Unchanged);
        }

        let audit_id: i64 = self
            .conn
            .query_row("SELECT nextval('audit_seq')", [], |row| row.get(0))?;
        let ts = Utc::now();
        let old = ticket.tags.labels;
        let new = proposal.labels;

        self.conn.execute(
            "INSERT INTO tag_audits (audit_id, ticket_id, old_service_type, old_category,
                                     new_service_type, new_category, confidence, source,
                                     reason, ts)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                audit_id,
                ticket.ticket_id,
                old.service_type.map(|s| s.as_str()),
                old.category.map(|c| c.as_str()),
                new.service_type.map(|s| s.as_str()),
                new.category.map(|c| c.as_str()),
                proposal.confidence,
                proposal.source.as_str(),
                reason,
                ts.timestamp_micros(),
            ],
        )?;

        self.conn.execute(
            "UPDATE tickets
             SET service_type = ?, category = ?, tag_confidence = ?, tag_source = ?
             WHERE ticket_id = ?",
            params![
                new.service_type.map(|s| s.as_str()),
                new.category.map(|c| c.as_str()),
                proposal.confidence,
                proposal.source.as_str(),
                ticket.ticket_id,
            ],
        )?;
        self.touch(ticket, ts)?;

        ticket.tags = TagState {
            labels: new,
            confidence: Some(proposal.confidence),
            source: Some(proposal.source),
        };

        info!(
            ticket_id = %ticket.ticket_id,
            old = %old,
            new = %new,
            confidence = proposal.confidence,
            source = %proposal.source,
            "tags written"
        );

        Ok(WriteOutcome::Written(TagAudit {
            audit_id,
            old,
            new,
            confidence: Some(proposal.confidence),
            source: proposal.source,
            reason: reason.map(str::to_string),
            ts,
        }))
    }
}
