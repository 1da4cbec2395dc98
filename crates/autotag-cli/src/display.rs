//! Vertical card display for tickets and tagging results.
//!
//! Renders tickets, ingest outcomes and metrics as grouped, human-readable
//! cards on stdout. `--json` bypasses this module entirely.

use autotag_ai::TrainingMetrics;
use autotag_core::{LabelPair, TicketDetail, TicketSummary};
use autotag_service::{IngestOutcome, Metrics};
use chrono::{DateTime, Utc};

const MAX_LIST_ITEMS: usize = 10;
const TEXT_WIDTH: usize = 60;

// ── Public API ──

/// Print a ticket with its tags, messages and audit trail.
pub fn print_ticket_card(detail: &TicketDetail) {
    let t = &detail.ticket;
    println!("=== {} ===", t.ticket_id);
    println!("{}", t.conversation_id);
    println!();

    println!("Tags");
    field("service_type", opt(t.tags.labels.service_type));
    field("category", opt(t.tags.labels.category));
    field("confidence", opt(t.tags.confidence.map(pct)));
    field("source", opt(t.tags.source));
    println!();

    println!("Status");
    field("status", t.status);
    if let Some(q) = &t.pending_clarifier {
        field("pending_clarifier", q);
    }
    field("created_at", ts(&t.created_at));
    field("updated_at", ts(&t.updated_at));
    println!();

    print_messages(detail);
    print_history(detail);
}

/// Print ticket summaries as a table, most recently updated first.
pub fn print_ticket_list(tickets: &[TicketSummary]) {
    if tickets.is_empty() {
        println!("No tickets.");
        return;
    }
    println!(
        "{:<8} {:<18} {:<26} {:<22} {:>4}  {}",
        "TICKET", "CONVERSATION", "TAGS", "STATUS", "MSGS", "LAST MESSAGE"
    );
    for s in tickets {
        println!(
            "{:<8} {:<18} {:<26} {:<22} {:>4}  {}",
            s.ticket_id,
            shorten(&s.conversation_id, 18),
            labels(&s.labels),
            s.status.as_str(),
            s.message_count,
            s.last_message_preview
                .as_deref()
                .map(|p| shorten(p, TEXT_WIDTH))
                .unwrap_or_default(),
        );
    }
}

/// Print the result of one ingest cycle.
pub fn print_ingest(outcome: &IngestOutcome) {
    println!("=== {} ===", outcome.ticket_id);
    println!();

    println!("Decision");
    field("labels", labels(&outcome.labels));
    field("confidence", pct(outcome.confidence));
    field("source", outcome.source);
    field("action", outcome.action);
    field("committed", outcome.committed);
    if !outcome.rule_hits.is_empty() {
        field("rule_hits", outcome.rule_hits.join(", "));
    }
    if let Some(r) = &outcome.rationale {
        field("rationale", shorten(r, TEXT_WIDTH));
    }
    println!();

    if let Some(q) = outcome.clarifier {
        println!("Clarifying question ({})", q.id);
        println!("  {}", q.question);
        for option in q.options {
            println!("    - {option}");
        }
        println!();
    }
}

pub fn print_metrics(metrics: &Metrics) {
    println!("=== Tagging metrics ===");
    println!();
    println!("Rates");
    field("tickets", metrics.tickets);
    field("auto_tag_rate", pct(metrics.auto_tag_rate));
    field("llm_hit_rate", pct(metrics.llm_hit_rate));
    field("override_rate", pct(metrics.override_rate));
    println!();

    if !metrics.class_distribution.is_empty() {
        println!("Class distribution");
        for (class, n) in &metrics.class_distribution {
            field(class, n);
        }
        println!();
    }
}

pub fn print_training(metrics: &TrainingMetrics) {
    println!("=== Classifier retrained ===");
    println!();
    println!("Held-in evaluation ({} records)", metrics.records);
    field("service_type macro F1", format!("{:.3}", metrics.service_macro_f1));
    field("service_type micro F1", format!("{:.3}", metrics.service_micro_f1));
    field("category macro F1", format!("{:.3}", metrics.category_macro_f1));
    field("category micro F1", format!("{:.3}", metrics.category_micro_f1));
    println!();
}

// ── Section rendering ──

fn print_messages(detail: &TicketDetail) {
    let len = detail.messages.len();
    if len == 0 {
        return;
    }
    println!("Messages ({len})");

    let (skipped, shown) = tail(&detail.messages);
    if skipped > 0 {
        println!("    ... {skipped} earlier");
    }
    for m in shown {
        println!(
            "    {:<6} {}  {}",
            m.sender.as_str(),
            ts(&m.ts),
            shorten(&m.text, TEXT_WIDTH)
        );
        if !m.pii_redactions.is_empty() {
            println!("           redacted: {}", m.pii_redactions.join(", "));
        }
    }
    println!();
}

fn print_history(detail: &TicketDetail) {
    let len = detail.tag_history.len();
    if len == 0 {
        return;
    }
    println!("Tag history ({len})");
    let (skipped, shown) = tail(&detail.tag_history);
    if skipped > 0 {
        println!("    ... {skipped} earlier");
    }
    for a in shown {
        print!(
            "    {}  {:<5} {} -> {}",
            ts(&a.ts),
            a.source.as_str(),
            labels(&a.old),
            labels(&a.new)
        );
        if let Some(c) = a.confidence {
            print!("  ({})", pct(c));
        }
        println!();
        if let Some(reason) = &a.reason {
            println!("      reason: {}", shorten(reason, TEXT_WIDTH));
        }
    }
    println!();
}

// ── Formatting helpers ──

/// The last [`MAX_LIST_ITEMS`] entries and how many were left out before them.
fn tail<T>(items: &[T]) -> (usize, &[T]) {
    let skipped = items.len().saturating_sub(MAX_LIST_ITEMS);
    (skipped, &items[skipped..])
}

fn field(name: &str, value: impl std::fmt::Display) {
    println!("  {:<26} {}", name, value);
}

fn opt<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

fn labels(pair: &LabelPair) -> String {
    format!("{}/{}", opt(pair.service_type), opt(pair.category))
}

fn pct(x: f64) -> String {
    format!("{:.1}%", x * 100.0)
}

fn ts(t: &DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn shorten(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let head: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{head}...")
    } else {
        text.to_string()
    }
}
