//! Persisted ticket, message and audit records shared between the store,
//! the service layer and the CLI.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{LabelError, LabelPair, SourceKind};

/// Who wrote a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderRole {
    User,
    Agent,
    Bot,
}

impl SenderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
            Self::Bot => "bot",
        }
    }
}

impl fmt::Display for SenderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SenderRole {
    type Err = LabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "agent" => Ok(Self::Agent),
            "bot" => Ok(Self::Bot),
            other => Err(LabelError::UnknownSender(other.to_string())),
        }
    }
}

/// Ticket lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Open,
    /// A clarifying question was asked and has not been answered yet.
    AwaitingClarification,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::AwaitingClarification => "awaiting_clarification",
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketStatus {
    type Err = LabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "awaiting_clarification" => Ok(Self::AwaitingClarification),
            other => Err(LabelError::UnknownStatus(other.to_string())),
        }
    }
}

/// Current tag state of a ticket: the four fields the tag writer compares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TagState {
    pub labels: LabelPair,
    pub confidence: Option<f64>,
    pub source: Option<SourceKind>,
}

/// A support conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    /// `TK` followed by a zero-padded, monotonically increasing number.
    pub ticket_id: String,
    /// Foreign correlation key (thread id); unique.
    pub conversation_id: String,
    pub tags: TagState,
    pub status: TicketStatus,
    /// Catalog id of the clarifying question awaiting an answer, if any.
    pub pending_clarifier: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub sender: SenderRole,
    /// Scrubbed text.
    pub text: String,
    pub lang: String,
    pub pii_redactions: Vec<String>,
    pub ts: DateTime<Utc>,
}

/// Append-only record of one tag change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagAudit {
    pub audit_id: i64,
    pub old: LabelPair,
    pub new: LabelPair,
    pub confidence: Option<f64>,
    pub source: SourceKind,
    pub reason: Option<String>,
    pub ts: DateTime<Utc>,
}

/// Compact ticket row for list views.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketSummary {
    pub ticket_id: String,
    pub conversation_id: String,
    pub labels: LabelPair,
    pub status: TicketStatus,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
    pub last_message_preview: Option<String>,
}

/// A ticket with its full message and tag history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketDetail {
    pub ticket: Ticket,
    pub messages: Vec<Message>,
    pub tag_history: Vec<TagAudit>,
}

/// Preview length for the last message in a [`TicketSummary`].
pub const PREVIEW_CHARS: usize = 120;

/// Truncate to [`PREVIEW_CHARS`] characters on a char boundary.
pub fn preview(text: &str) -> String {
    text.chars().take(PREVIEW_CHARS).collect()
}
