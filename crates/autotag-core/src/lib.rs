pub mod config;
pub mod decision;
mod error;
pub mod labels;
pub mod normalize;
pub mod ticket;

pub use config::Settings;
pub use decision::{Decision, RoutingAction, SourceKind, Thresholds};
pub use error::{ConfigError, LabelError};
pub use labels::{Category, LabelPair, ServiceType};
pub use normalize::{Normalized, normalize};
pub use ticket::{
    Message, SenderRole, TagAudit, TagState, Ticket, TicketDetail, TicketStatus, TicketSummary,
};
