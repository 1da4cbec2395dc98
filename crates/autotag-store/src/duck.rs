//! DuckDB storage for tickets, their messages and the tag audit trail.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use autotag_core::ticket::preview;
use autotag_core::{
    LabelPair, Message, SenderRole, SourceKind, TagAudit, TagState, Ticket, TicketDetail,
    TicketStatus, TicketSummary,
};
use chrono::{DateTime, Utc};
use duckdb::{Connection, params};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::StoreError;

const SCHEMA: &str = "
CREATE SEQUENCE IF NOT EXISTS ticket_seq START 1;
CREATE SEQUENCE IF NOT EXISTS message_seq START 1;
CREATE SEQUENCE IF NOT EXISTS audit_seq START 1;

CREATE TABLE IF NOT EXISTS tickets (
    ticket_id         VARCHAR PRIMARY KEY,
    seq               BIGINT NOT NULL,
    conversation_id   VARCHAR NOT NULL UNIQUE,
    service_type      VARCHAR,
    category          VARCHAR,
    tag_confidence    DOUBLE,
    tag_source        VARCHAR,
    status            VARCHAR NOT NULL,
    pending_clarifier VARCHAR,
    created_at        BIGINT NOT NULL,
    updated_at        BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    message_id     BIGINT PRIMARY KEY,
    ticket_id      VARCHAR NOT NULL,
    sender         VARCHAR NOT NULL,
    text           VARCHAR NOT NULL,
    lang           VARCHAR NOT NULL,
    pii_redactions VARCHAR NOT NULL,
    ts             BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS tag_audits (
    audit_id         BIGINT PRIMARY KEY,
    ticket_id        VARCHAR NOT NULL,
    old_service_type VARCHAR,
    old_category     VARCHAR,
    new_service_type VARCHAR,
    new_category     VARCHAR,
    confidence       DOUBLE,
    source           VARCHAR NOT NULL,
    reason           VARCHAR,
    ts               BIGINT NOT NULL
);
";

const TICKET_COLUMNS: &str = "ticket_id, conversation_id, service_type, category, \
     tag_confidence, tag_source, status, pending_clarifier, created_at, updated_at";

/// DuckDB store for tickets.
///
/// Reads go through the shared connection and only see committed data.
/// Writes go through a [`UnitOfWork`], which owns a cloned connection with an
/// open transaction so it can be held across `.await` points.
///
/// Use [`open`](Self::open) for an in-memory database and
/// [`open_persistent`](Self::open_persistent) for a file that survives restarts.
pub struct TicketStore {
    conn: Mutex<Connection>,
}

impl TicketStore {
    /// Open an in-memory DuckDB database.
    pub fn open() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    /// Open or create a persistent DuckDB database at the given path.
    pub fn open_persistent(path: &Path) -> Result<Self, StoreError> {
        let store = Self::init(Connection::open(path)?)?;
        info!(path = %path.display(), "opened ticket store");
        Ok(store)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // The guard only protects statement preparation; a panic elsewhere
        // leaves the connection usable.
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// The shared read connection, for ad-hoc SQL outside a unit of work.
    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn()
    }

    /// Start a transaction on a dedicated connection.
    pub fn begin(&self) -> Result<UnitOfWork, StoreError> {
        let conn = self.conn().try_clone()?;
        conn.execute_batch("BEGIN TRANSACTION")?;
        Ok(UnitOfWork {
            conn,
            finished: false,
        })
    }

    // ── Reads ──

    pub fn ticket(&self, ticket_id: &str) -> Result<Option<Ticket>, StoreError> {
        select_ticket(&self.conn(), "ticket_id", ticket_id)
    }

    pub fn ticket_by_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Ticket>, StoreError> {
        select_ticket(&self.conn(), "conversation_id", conversation_id)
    }

    /// Ticket with its messages (insertion order) and audit history (oldest first).
    pub fn detail(&self, ticket_id: &str) -> Result<Option<TicketDetail>, StoreError> {
        let conn = self.conn();
        let Some(ticket) = select_ticket(&conn, "ticket_id", ticket_id)? else {
            return Ok(None);
        };
        let messages = select_messages(&conn, ticket_id)?;
        let tag_history = select_audits(&conn, ticket_id)?;
        Ok(Some(TicketDetail {
            ticket,
            messages,
            tag_history,
        }))
    }

    /// All tickets, most recently updated first, ties broken by identifier.
    pub fn summaries(&self) -> Result<Vec<TicketSummary>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT t.ticket_id, t.conversation_id, t.service_type, t.category, t.status,
                    t.updated_at,
                    (SELECT count(*) FROM messages m WHERE m.ticket_id = t.ticket_id),
                    (SELECT m.text FROM messages m WHERE m.ticket_id = t.ticket_id
                     ORDER BY m.message_id DESC LIMIT 1)
             FROM tickets t
             ORDER BY t.updated_at DESC, t.seq ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(SummaryRow {
                    ticket_id: row.get(0)?,
                    conversation_id: row.get(1)?,
                    service_type: row.get(2)?,
                    category: row.get(3)?,
                    status: row.get(4)?,
                    updated_at: row.get(5)?,
                    message_count: row.get(6)?,
                    last_text: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(SummaryRow::into_summary).collect()
    }

    pub fn ticket_count(&self) -> Result<usize, StoreError> {
        count(&self.conn(), "SELECT count(*)::BIGINT FROM tickets")
    }

    /// Raw counts behind the tagging metrics.
    pub fn metric_counts(&self) -> Result<MetricCounts, StoreError> {
        let conn = self.conn();
        let tickets = count(&conn, "SELECT count(*)::BIGINT FROM tickets")?;
        let auto_tagged = count(
            &conn,
            &format!(
                "SELECT count(*)::BIGINT FROM tickets WHERE tag_source IN ({})",
                sql_list(SourceKind::ALL.iter().filter(|s| s.is_automated()))
            ),
        )?;
        let llm_tagged = count(
            &conn,
            &format!(
                "SELECT count(*)::BIGINT FROM tickets WHERE tag_source = '{}'",
                SourceKind::Llm
            ),
        )?;
        let agent_overrides = count(
            &conn,
            &format!(
                "SELECT count(*)::BIGINT FROM tag_audits WHERE source = '{}'",
                SourceKind::Agent
            ),
        )?;

        let mut stmt = conn.prepare(
            "SELECT service_type, category, count(*)::BIGINT
             FROM tickets GROUP BY service_type, category",
        )?;
        let groups = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let class_distribution = groups
            .into_iter()
            .map(|(svc, cat, n)| {
                let key = format!(
                    "{}::{}",
                    svc.as_deref().unwrap_or("unknown"),
                    cat.as_deref().unwrap_or("unknown")
                );
                (key, n.max(0) as usize)
            })
            .collect();

        Ok(MetricCounts {
            tickets,
            auto_tagged,
            llm_tagged,
            agent_overrides,
            class_distribution,
        })
    }
}

/// Counts behind the tagging metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricCounts {
    pub tickets: usize,
    /// Tickets whose current source is rule, ml or llm.
    pub auto_tagged: usize,
    pub llm_tagged: usize,
    /// Audit entries written by agents.
    pub agent_overrides: usize,
    /// `service::category` → ticket count, `unknown` for unset sides.
    pub class_distribution: BTreeMap<String, usize>,
}

/// A cleaned message ready to be appended.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender: SenderRole,
    pub text: String,
    pub lang: String,
    pub pii_redactions: Vec<String>,
}

// ── Unit of work ──

/// One open transaction. Rolled back on drop unless [`commit`](Self::commit)
/// succeeded.
pub struct UnitOfWork {
    pub(crate) conn: Connection,
    finished: bool,
}

impl UnitOfWork {
    pub fn ticket(&self, ticket_id: &str) -> Result<Option<Ticket>, StoreError> {
        select_ticket(&self.conn, "ticket_id", ticket_id)
    }

    /// Fetch the ticket for `conversation_id`, creating it when absent.
    /// The flag is `true` when a new ticket was created.
    pub fn find_or_create_ticket(
        &self,
        conversation_id: &str,
    ) -> Result<(Ticket, bool), StoreError> {
        if let Some(ticket) = select_ticket(&self.conn, "conversation_id", conversation_id)? {
            return Ok((ticket, false));
        }

        let seq: i64 = self
            .conn
            .query_row("SELECT nextval('ticket_seq')", [], |row| row.get(0))?;
        let now = Utc::now();
        let ticket = Ticket {
            ticket_id: format!("TK{seq:04}"),
            conversation_id: conversation_id.to_string(),
            tags: TagState::default(),
            status: TicketStatus::Open,
            pending_clarifier: None,
            created_at: now,
            updated_at: now,
        };
        self.conn.execute(
            "INSERT INTO tickets (ticket_id, seq, conversation_id, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                ticket.ticket_id,
                seq,
                ticket.conversation_id,
                ticket.status.as_str(),
                now.timestamp_micros(),
                now.timestamp_micros(),
            ],
        )?;
        debug!(ticket_id = %ticket.ticket_id, conversation_id, "created ticket");
        Ok((ticket, true))
    }

    /// Append a message and bump the ticket's `updated_at` to its timestamp.
    pub fn append_message(
        &self,
        ticket: &mut Ticket,
        message: NewMessage,
    ) -> Result<Message, StoreError> {
        let message_id: i64 = self
            .conn
            .query_row("SELECT nextval('message_seq')", [], |row| row.get(0))?;
        let ts = Utc::now();
        let redactions = serde_json::to_string(&message.pii_redactions)?;

        self.conn.execute(
            "INSERT INTO messages (message_id, ticket_id, sender, text, lang, pii_redactions, ts)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                message_id,
                ticket.ticket_id,
                message.sender.as_str(),
                message.text,
                message.lang,
                redactions,
                ts.timestamp_micros(),
            ],
        )?;
        self.touch(ticket, ts)?;

        Ok(Message {
            message_id,
            sender: message.sender,
            text: message.text,
            lang: message.lang,
            pii_redactions: message.pii_redactions,
            ts,
        })
    }

    /// Messages in insertion order.
    pub fn messages(&self, ticket_id: &str) -> Result<Vec<Message>, StoreError> {
        select_messages(&self.conn, ticket_id)
    }

    /// Record (or clear) the pending clarifying question and the matching status.
    pub fn set_pending_clarifier(
        &self,
        ticket: &mut Ticket,
        question_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let status = if question_id.is_some() {
            TicketStatus::AwaitingClarification
        } else {
            TicketStatus::Open
        };
        if ticket.status == status && ticket.pending_clarifier.as_deref() == question_id {
            return Ok(());
        }
        self.conn.execute(
            "UPDATE tickets SET status = ?, pending_clarifier = ? WHERE ticket_id = ?",
            params![status.as_str(), question_id, ticket.ticket_id],
        )?;
        ticket.status = status;
        ticket.pending_clarifier = question_id.map(str::to_string);
        Ok(())
    }

    pub(crate) fn touch(&self, ticket: &mut Ticket, ts: DateTime<Utc>) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE tickets SET updated_at = ? WHERE ticket_id = ?",
            params![ts.timestamp_micros(), ticket.ticket_id],
        )?;
        ticket.updated_at = ts;
        Ok(())
    }

    pub fn commit(mut self) -> Result<(), StoreError> {
        self.finished = true;
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    pub fn rollback(mut self) -> Result<(), StoreError> {
        self.finished = true;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        match self.conn.execute_batch("ROLLBACK") {
            Ok(()) => warn!("unit of work dropped without commit, rolled back"),
            Err(e) => warn!(error = %e, "rollback failed"),
        }
    }
}

// ── Row mapping ──

fn timestamp(table: &'static str, micros: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| StoreError::corrupt(table, format!("timestamp {micros} out of range")))
}

fn parse<T>(table: &'static str, value: &str) -> Result<T, StoreError>
where
    T: FromStr,
    T::Err: Display,
{
    value.parse().map_err(|e| StoreError::corrupt(table, e))
}

fn parse_opt<T>(table: &'static str, value: Option<String>) -> Result<Option<T>, StoreError>
where
    T: FromStr,
    T::Err: Display,
{
    value.as_deref().map(|v| parse(table, v)).transpose()
}

fn labels(
    table: &'static str,
    service_type: Option<String>,
    category: Option<String>,
) -> Result<LabelPair, StoreError> {
    Ok(LabelPair {
        service_type: parse_opt(table, service_type)?,
        category: parse_opt(table, category)?,
    })
}

/// Quoted, comma-separated SQL literal list of source kinds.
fn sql_list<'a>(sources: impl Iterator<Item = &'a SourceKind>) -> String {
    sources
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn count(conn: &Connection, sql: &str) -> Result<usize, StoreError> {
    let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
    Ok(n.max(0) as usize)
}

struct TicketRow {
    ticket_id: String,
    conversation_id: String,
    service_type: Option<String>,
    category: Option<String>,
    confidence: Option<f64>,
    source: Option<String>,
    status: String,
    pending_clarifier: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TicketRow {
    fn into_ticket(self) -> Result<Ticket, StoreError> {
        Ok(Ticket {
            ticket_id: self.ticket_id,
            conversation_id: self.conversation_id,
            tags: TagState {
                labels: labels("tickets", self.service_type, self.category)?,
                confidence: self.confidence,
                source: parse_opt::<SourceKind>("tickets", self.source)?,
            },
            status: parse("tickets", &self.status)?,
            pending_clarifier: self.pending_clarifier,
            created_at: timestamp("tickets", self.created_at)?,
            updated_at: timestamp("tickets", self.updated_at)?,
        })
    }
}

fn select_ticket(conn: &Connection, column: &str, key: &str) -> Result<Option<Ticket>, StoreError> {
    let sql = format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE {column} = ?");
    let row = conn.query_row(&sql, [key], |row| {
        Ok(TicketRow {
            ticket_id: row.get(0)?,
            conversation_id: row.get(1)?,
            service_type: row.get(2)?,
            category: row.get(3)?,
            confidence: row.get(4)?,
            source: row.get(5)?,
            status: row.get(6)?,
            pending_clarifier: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    });
    match row {
        Ok(row) => row.into_ticket().map(Some),
        Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn select_messages(conn: &Connection, ticket_id: &str) -> Result<Vec<Message>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT message_id, sender, text, lang, pii_redactions, ts
         FROM messages WHERE ticket_id = ? ORDER BY message_id",
    )?;
    let rows = stmt
        .query_map([ticket_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(message_id, sender, text, lang, redactions, ts)| {
            Ok(Message {
                message_id,
                sender: parse("messages", &sender)?,
                text,
                lang,
                pii_redactions: serde_json::from_str(&redactions)?,
                ts: timestamp("messages", ts)?,
            })
        })
        .collect()
}

struct AuditRow {
    audit_id: i64,
    old_service_type: Option<String>,
    old_category: Option<String>,
    new_service_type: Option<String>,
    new_category: Option<String>,
    confidence: Option<f64>,
    source: String,
    reason: Option<String>,
    ts: i64,
}

fn select_audits(conn: &Connection, ticket_id: &str) -> Result<Vec<TagAudit>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT audit_id, old_service_type, old_category, new_service_type, new_category,
                confidence, source, reason, ts
         FROM tag_audits WHERE ticket_id = ? ORDER BY audit_id",
    )?;
    let rows = stmt
        .query_map([ticket_id], |row| {
            Ok(AuditRow {
                audit_id: row.get(0)?,
                old_service_type: row.get(1)?,
                old_category: row.get(2)?,
                new_service_type: row.get(3)?,
                new_category: row.get(4)?,
                confidence: row.get(5)?,
                source: row.get(6)?,
                reason: row.get(7)?,
                ts: row.get(8)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|r| {
            Ok(TagAudit {
                audit_id: r.audit_id,
                old: labels("tag_audits", r.old_service_type, r.old_category)?,
                new: labels("tag_audits", r.new_service_type, r.new_category)?,
                confidence: r.confidence,
                source: parse("tag_audits", &r.source)?,
                reason: r.reason,
                ts: timestamp("tag_audits", r.ts)?,
            })
        })
        .collect()
}

struct SummaryRow {
    ticket_id: String,
    conversation_id: String,
    service_type: Option<String>,
    category: Option<String>,
    status: String,
    updated_at: i64,
    message_count: i64,
    last_text: Option<String>,
}

impl SummaryRow {
    fn into_summary(self) -> Result<TicketSummary, StoreError> {
        Ok(TicketSummary {
            ticket_id: self.ticket_id,
            conversation_id: self.conversation_id,
            labels: labels("tickets", self.service_type, self.category)?,
            status: parse("tickets", &self.status)?,
            updated_at: timestamp("tickets", self.updated_at)?,
            message_count: self.message_count.max(0) as usize,
            last_message_preview: self.last_text.as_deref().map(preview),
        })
    }
}
