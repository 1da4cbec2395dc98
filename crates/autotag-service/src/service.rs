//! Ingest cycle and the operations around it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use autotag_ai::clarify::{self, ClarifyingQuestion};
use autotag_ai::{
    Adjudicator, CentroidClassifier, HeuristicAdjudicator, RuleMatcher, TextClassifier,
    TrainingCorpus, TrainingMetrics, Verdict, fuse,
};
use autotag_core::{
    Category, LabelPair, RoutingAction, SenderRole, ServiceType, Settings, SourceKind,
    Thresholds, TicketDetail, TicketSummary, normalize,
};
use autotag_store::{MetricCounts, NewMessage, TagProposal, TicketStore, UnitOfWork};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::ServiceError;
use crate::locks::KeyedLocks;

/// Confidence recorded for agent overrides.
pub const OVERRIDE_CONFIDENCE: f64 = 1.0;

/// Result of one ingest cycle.
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub ticket_id: String,
    /// Best labels after fusion and, if it ran, adjudication.
    pub labels: LabelPair,
    pub confidence: f64,
    pub source: SourceKind,
    /// Route chosen by the fusion policy.
    pub action: RoutingAction,
    /// Whether the labels are now the ticket's stored tags.
    pub committed: bool,
    /// Question to put to the user, when the clarify path found one.
    pub clarifier: Option<&'static ClarifyingQuestion>,
    /// Adjudicator rationale, when it ran.
    pub rationale: Option<String>,
    pub rule_hits: Vec<String>,
}

/// Tagging health over all tickets.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metrics {
    pub auto_tag_rate: f64,
    pub override_rate: f64,
    pub llm_hit_rate: f64,
    pub class_distribution: BTreeMap<String, usize>,
    pub tickets: usize,
}

impl From<MetricCounts> for Metrics {
    fn from(c: MetricCounts) -> Self {
        let rate = |n: usize| {
            if c.tickets == 0 {
                0.0
            } else {
                n as f64 / c.tickets as f64
            }
        };
        Self {
            auto_tag_rate: rate(c.auto_tagged),
            override_rate: rate(c.agent_overrides),
            llm_hit_rate: rate(c.llm_tagged),
            class_distribution: c.class_distribution,
            tickets: c.tickets,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeedReport {
    pub ingested: usize,
    pub skipped: usize,
}

/// Working state of one cycle before it is committed.
struct Routed {
    labels: LabelPair,
    confidence: f64,
    source: SourceKind,
    commit: bool,
    rationale: Option<String>,
}

pub struct TaggingService {
    rules: Arc<RuleMatcher>,
    classifier: Arc<dyn TextClassifier>,
    adjudicator: Arc<dyn Adjudicator>,
    store: Arc<TicketStore>,
    thresholds: Thresholds,
    adjudicator_timeout: Duration,
    corpus_path: PathBuf,
    locks: KeyedLocks,
}

impl TaggingService {
    pub fn new(
        rules: Arc<RuleMatcher>,
        classifier: Arc<dyn TextClassifier>,
        adjudicator: Arc<dyn Adjudicator>,
        store: Arc<TicketStore>,
        thresholds: Thresholds,
    ) -> Self {
        let defaults = Settings::default();
        Self {
            rules,
            classifier,
            adjudicator,
            store,
            thresholds,
            adjudicator_timeout: Duration::from_millis(defaults.adjudicator_timeout_ms),
            corpus_path: defaults.corpus_path,
            locks: KeyedLocks::default(),
        }
    }

    pub fn with_adjudicator_timeout(mut self, timeout: Duration) -> Self {
        self.adjudicator_timeout = timeout;
        self
    }

    /// Corpus used by [`seed`](Self::seed).
    pub fn with_corpus_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.corpus_path = path.into();
        self
    }

    /// Wire every collaborator from settings: load rules, load or train the
    /// classifier, open the store and pick an adjudicator.
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        settings.validate().context("invalid settings")?;

        let rules = RuleMatcher::load(&settings.rules_path)
            .with_context(|| format!("loading rules from {}", settings.rules_path.display()))?;
        let classifier =
            CentroidClassifier::load_or_train(&settings.models_dir, &settings.corpus_path)
                .context("loading classifier")?;
        let store = match &settings.database_path {
            Some(path) => TicketStore::open_persistent(path)
                .with_context(|| format!("opening database {}", path.display()))?,
            None => TicketStore::open().context("opening in-memory database")?,
        };

        Ok(Self::new(
            Arc::new(rules),
            Arc::new(classifier),
            build_adjudicator(settings),
            Arc::new(store),
            settings.thresholds()?,
        )
        .with_adjudicator_timeout(settings.adjudicator_timeout()?)
        .with_corpus_path(&settings.corpus_path))
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    // ── Ingest ──

    /// Run one ingest cycle for a message on `conversation_id`.
    ///
    /// The ticket lookup or creation, message append, decision and tag write
    /// happen in one transaction. Any failure rolls all of it back.
    pub async fn ingest(
        &self,
        conversation_id: &str,
        sender: &str,
        text: &str,
    ) -> Result<IngestOutcome, ServiceError> {
        let conversation_id = conversation_id.trim();
        if conversation_id.is_empty() {
            return Err(ServiceError::validation("conversation id is empty"));
        }
        let sender: SenderRole = sender
            .parse()
            .map_err(|e| ServiceError::validation(format!("{e}")))?;
        if text.trim().is_empty() {
            return Err(ServiceError::validation("message text is empty"));
        }

        let cleaned = normalize(text);
        let _guard = self.locks.acquire(conversation_id).await;
        let uow = self.store.begin()?;

        let (mut ticket, created) = uow.find_or_create_ticket(conversation_id)?;
        if created {
            info!(ticket_id = %ticket.ticket_id, conversation_id, "new ticket");
        }
        uow.append_message(
            &mut ticket,
            NewMessage {
                sender,
                text: cleaned.text.clone(),
                lang: cleaned.lang.clone(),
                pii_redactions: cleaned.redactions,
            },
        )?;

        let conversation = conversation_text(&uow, &ticket.ticket_id)?;
        let conversation = if conversation.is_empty() {
            cleaned.text
        } else {
            conversation
        };

        let rule_outcome = self.rules.apply(&conversation, &cleaned.lang);
        let prediction = self.classifier.predict(&conversation);
        let decision = fuse(&rule_outcome, &prediction, &self.thresholds);
        debug!(
            ticket_id = %ticket.ticket_id,
            labels = %decision.labels,
            confidence = decision.confidence,
            source = %decision.source,
            action = %decision.action,
            hits = ?rule_outcome.hits,
            "fused decision"
        );

        let routed = match decision.action {
            RoutingAction::Auto => Routed {
                labels: decision.labels,
                confidence: decision.confidence,
                source: decision.source,
                commit: true,
                rationale: None,
            },
            RoutingAction::Llm => match self.adjudicate(&conversation, &decision.labels).await {
                Some(verdict) => Routed {
                    commit: verdict.confidence >= self.thresholds.high(),
                    labels: verdict.labels,
                    confidence: verdict.confidence,
                    source: SourceKind::Llm,
                    rationale: Some(verdict.rationale),
                },
                None => Routed {
                    labels: decision.labels,
                    confidence: decision.confidence,
                    source: decision.source,
                    commit: false,
                    rationale: None,
                },
            },
            RoutingAction::Clarify => Routed {
                labels: decision.labels,
                confidence: decision.confidence,
                source: decision.source,
                commit: false,
                rationale: None,
            },
        };

        let clarifier = if routed.commit {
            uow.write_tags(
                &mut ticket,
                &TagProposal {
                    labels: routed.labels,
                    confidence: routed.confidence,
                    source: routed.source,
                    reason: None,
                },
            )?;
            uow.set_pending_clarifier(&mut ticket, None)?;
            None
        } else {
            // A question left over from an earlier decision no longer applies.
            let question = clarify::maybe_question(&routed.labels);
            uow.set_pending_clarifier(&mut ticket, question.map(|q| q.id))?;
            question
        };

        uow.commit()?;

        info!(
            ticket_id = %ticket.ticket_id,
            labels = %routed.labels,
            confidence = routed.confidence,
            source = %routed.source,
            action = %decision.action,
            committed = routed.commit,
            clarifier = clarifier.map(|q| q.id),
            "ingested message"
        );

        Ok(IngestOutcome {
            ticket_id: ticket.ticket_id,
            labels: routed.labels,
            confidence: routed.confidence,
            source: routed.source,
            action: decision.action,
            committed: routed.commit,
            clarifier,
            rationale: routed.rationale,
            rule_hits: rule_outcome.hits,
        })
    }

    /// Second opinion under a timeout. `None` on timeout or failure.
    async fn adjudicate(&self, text: &str, current: &LabelPair) -> Option<Verdict> {
        match tokio::time::timeout(
            self.adjudicator_timeout,
            self.adjudicator.adjudicate(text, current),
        )
        .await
        {
            Ok(Ok(verdict)) => {
                debug!(
                    labels = %verdict.labels,
                    confidence = verdict.confidence,
                    rationale = %verdict.rationale,
                    "adjudicator verdict"
                );
                Some(verdict)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "adjudicator failed, routing to clarification");
                None
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.adjudicator_timeout.as_millis() as u64,
                    "adjudicator timed out, routing to clarification"
                );
                None
            }
        }
    }

    // ── Human input ──

    /// Force an agent-sourced tag with confidence 1.0.
    pub async fn override_tags(
        &self,
        ticket_id: &str,
        service_type: ServiceType,
        category: Category,
        reason: &str,
    ) -> Result<TicketDetail, ServiceError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(ServiceError::validation("override requires a reason"));
        }
        let conversation_id = self.conversation_of(ticket_id)?;
        let _guard = self.locks.acquire(&conversation_id).await;

        let uow = self.store.begin()?;
        let mut ticket = uow
            .ticket(ticket_id)?
            .ok_or_else(|| ServiceError::NotFound(ticket_id.to_string()))?;
        uow.write_tags(
            &mut ticket,
            &TagProposal {
                labels: LabelPair::new(service_type, category),
                confidence: OVERRIDE_CONFIDENCE,
                source: SourceKind::Agent,
                reason: Some(reason),
            },
        )?;
        uow.set_pending_clarifier(&mut ticket, None)?;
        uow.commit()?;

        info!(ticket_id, service_type = %service_type, category = %category, "agent override");
        self.get_ticket(ticket_id)
    }

    /// Apply the user's answer to the ticket's clarifying question.
    pub async fn resolve_clarifier(
        &self,
        ticket_id: &str,
        choice: &str,
    ) -> Result<TicketDetail, ServiceError> {
        let choice: Category = choice
            .trim()
            .parse()
            .map_err(|e| ServiceError::validation(format!("{e}")))?;
        let conversation_id = self.conversation_of(ticket_id)?;
        let _guard = self.locks.acquire(&conversation_id).await;

        let uow = self.store.begin()?;
        let mut ticket = uow
            .ticket(ticket_id)?
            .ok_or_else(|| ServiceError::NotFound(ticket_id.to_string()))?;

        let question = ticket
            .pending_clarifier
            .as_deref()
            .and_then(clarify::question_by_id)
            .or_else(|| clarify::maybe_question(&ticket.tags.labels))
            .ok_or_else(|| ServiceError::validation("no clarifying question is pending"))?;
        if !question.offers(choice) {
            return Err(ServiceError::validation(format!(
                "'{choice}' is not an option for question {}",
                question.id
            )));
        }

        let (labels, confidence) =
            clarify::resolve(&ticket.tags.labels, ticket.tags.confidence, choice);
        uow.write_tags(
            &mut ticket,
            &TagProposal {
                labels,
                confidence,
                source: SourceKind::User,
                reason: None,
            },
        )?;
        uow.set_pending_clarifier(&mut ticket, None)?;
        uow.commit()?;

        info!(ticket_id, question = question.id, choice = %choice, "clarifier resolved");
        self.get_ticket(ticket_id)
    }

    // ── Reads ──

    pub fn list_tickets(&self) -> Result<Vec<TicketSummary>, ServiceError> {
        Ok(self.store.summaries()?)
    }

    pub fn get_ticket(&self, ticket_id: &str) -> Result<TicketDetail, ServiceError> {
        self.store
            .detail(ticket_id)?
            .ok_or_else(|| ServiceError::NotFound(ticket_id.to_string()))
    }

    pub fn metrics(&self) -> Result<Metrics, ServiceError> {
        Ok(self.store.metric_counts()?.into())
    }

    fn conversation_of(&self, ticket_id: &str) -> Result<String, ServiceError> {
        self.store
            .ticket(ticket_id)?
            .map(|t| t.conversation_id)
            .ok_or_else(|| ServiceError::NotFound(ticket_id.to_string()))
    }

    // ── Maintenance ──

    /// Refit the classifier off the async runtime. Predictions switch to the
    /// new model only once it is complete.
    pub async fn retrain(&self) -> Result<TrainingMetrics, ServiceError> {
        let classifier = Arc::clone(&self.classifier);
        let metrics = tokio::task::spawn_blocking(move || classifier.retrain()).await??;
        info!(
            records = metrics.records,
            service_macro_f1 = metrics.service_macro_f1,
            category_macro_f1 = metrics.category_macro_f1,
            "classifier retrained"
        );
        Ok(metrics)
    }

    /// Ingest every corpus record as its own conversation `seed_<n>`
    /// (1-based), skipping conversations that already exist.
    pub async fn seed(&self) -> Result<SeedReport, ServiceError> {
        let corpus = load_corpus(&self.corpus_path)?;
        let mut report = SeedReport::default();

        for (idx, record) in corpus.records.iter().enumerate() {
            let conversation_id = format!("seed_{}", idx + 1);
            if self.store.ticket_by_conversation(&conversation_id)?.is_some() {
                report.skipped += 1;
                continue;
            }
            self.ingest(&conversation_id, SenderRole::User.as_str(), &record.text)
                .await?;
            report.ingested += 1;
        }

        info!(
            ingested = report.ingested,
            skipped = report.skipped,
            path = %self.corpus_path.display(),
            "seeded tickets"
        );
        Ok(report)
    }
}

fn load_corpus(path: &Path) -> Result<TrainingCorpus, ServiceError> {
    TrainingCorpus::from_jsonl(path).map_err(ServiceError::Corpus)
}

/// All message texts of a ticket, space-joined in insertion order.
fn conversation_text(uow: &UnitOfWork, ticket_id: &str) -> Result<String, ServiceError> {
    let messages = uow.messages(ticket_id)?;
    let joined = messages
        .iter()
        .map(|m| m.text.as_str())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    Ok(joined.trim().to_string())
}

fn build_adjudicator(settings: &Settings) -> Arc<dyn Adjudicator> {
    http_adjudicator(settings).unwrap_or_else(|| Arc::new(HeuristicAdjudicator))
}

#[cfg(feature = "http")]
const DEFAULT_ADJUDICATOR_MODEL: &str = "gpt-4o-mini";

#[cfg(feature = "http")]
fn http_adjudicator(settings: &Settings) -> Option<Arc<dyn Adjudicator>> {
    let url = settings.adjudicator_url.as_ref()?;
    let model = settings
        .adjudicator_model
        .clone()
        .unwrap_or_else(|| DEFAULT_ADJUDICATOR_MODEL.to_string());
    info!(url = %url, model = %model, "using HTTP adjudicator");
    Some(Arc::new(
        autotag_ai::HttpAdjudicator::new(url.clone(), model)
            .with_api_key(settings.adjudicator_api_key.clone()),
    ))
}

#[cfg(not(feature = "http"))]
fn http_adjudicator(settings: &Settings) -> Option<Arc<dyn Adjudicator>> {
    if settings.adjudicator_url.is_some() {
        warn!("adjudicator_url is set but the `http` feature is off, using heuristic");
    }
    None
}

#[cfg(test)]
mod tests;
