use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use autotag_ai::{AdjudicatorError, ClassifierError, Distribution, Prediction};
use autotag_core::TicketStatus;

use super::*;

const RULES: &str = r#"
service_type:
  - id: svc_wallet
    label: wallet
    pattern: '\bwallet\b'
    precision: high
category:
  - id: cat_topup
    label: top_up
    pattern: 'top[\s-]?up'
    precision: high
"#;

fn data_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../data")
}

// ── Stubs ──

/// Returns the same prediction for every text and records what it saw.
struct FixedClassifier {
    prediction: Prediction,
    seen: Mutex<Vec<String>>,
    retrains: AtomicUsize,
}

impl FixedClassifier {
    fn new(svc: ServiceType, svc_p: f64, cat: Category, cat_p: f64) -> Self {
        Self {
            prediction: Prediction {
                service: Distribution::new(vec![(svc, svc_p)]),
                category: Distribution::new(vec![(cat, cat_p)]),
            },
            seen: Mutex::new(Vec::new()),
            retrains: AtomicUsize::new(0),
        }
    }
}

impl TextClassifier for FixedClassifier {
    fn predict(&self, text: &str) -> Prediction {
        self.seen.lock().unwrap().push(text.to_string());
        self.prediction.clone()
    }

    fn retrain(&self) -> Result<TrainingMetrics, ClassifierError> {
        self.retrains.fetch_add(1, Ordering::SeqCst);
        Ok(TrainingMetrics {
            service_macro_f1: 1.0,
            service_micro_f1: 1.0,
            category_macro_f1: 1.0,
            category_micro_f1: 1.0,
            records: 3,
        })
    }
}

struct FixedAdjudicator(Verdict);

#[async_trait]
impl Adjudicator for FixedAdjudicator {
    async fn adjudicate(&self, _: &str, _: &LabelPair) -> Result<Verdict, AdjudicatorError> {
        Ok(self.0.clone())
    }
}

struct FailingAdjudicator;

#[async_trait]
impl Adjudicator for FailingAdjudicator {
    async fn adjudicate(&self, _: &str, _: &LabelPair) -> Result<Verdict, AdjudicatorError> {
        Err(AdjudicatorError::Server {
            status: 503,
            body: "overloaded".into(),
        })
    }
}

struct SlowAdjudicator;

#[async_trait]
impl Adjudicator for SlowAdjudicator {
    async fn adjudicate(
        &self,
        text: &str,
        current: &LabelPair,
    ) -> Result<Verdict, AdjudicatorError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(HeuristicAdjudicator.judge(text, current))
    }
}

/// Hands out verdicts in order, repeating the last one.
struct ScriptedAdjudicator(Mutex<Vec<Verdict>>);

impl ScriptedAdjudicator {
    fn new(verdicts: &[(ServiceType, Category, f64)]) -> Self {
        Self(Mutex::new(
            verdicts
                .iter()
                .map(|&(svc, cat, confidence)| Verdict {
                    labels: LabelPair::new(svc, cat),
                    confidence,
                    rationale: "scripted".into(),
                })
                .collect(),
        ))
    }
}

#[async_trait]
impl Adjudicator for ScriptedAdjudicator {
    async fn adjudicate(&self, _: &str, _: &LabelPair) -> Result<Verdict, AdjudicatorError> {
        let mut verdicts = self.0.lock().unwrap();
        if verdicts.len() > 1 {
            Ok(verdicts.remove(0))
        } else {
            Ok(verdicts[0].clone())
        }
    }
}

fn verdict(svc: ServiceType, cat: Category, confidence: f64) -> Arc<dyn Adjudicator> {
    Arc::new(FixedAdjudicator(Verdict {
        labels: LabelPair::new(svc, cat),
        confidence,
        rationale: "stub".into(),
    }))
}

fn service(classifier: Arc<FixedClassifier>, adjudicator: Arc<dyn Adjudicator>) -> TaggingService {
    TaggingService::new(
        Arc::new(RuleMatcher::from_yaml(RULES).unwrap()),
        classifier,
        adjudicator,
        Arc::new(TicketStore::open().unwrap()),
        Thresholds::default(),
    )
}

fn wallet_topup_classifier() -> Arc<FixedClassifier> {
    Arc::new(FixedClassifier::new(
        ServiceType::Wallet,
        0.7,
        Category::TopUp,
        0.6,
    ))
}

// ── Ingest ──

#[tokio::test]
async fn wallet_topup_end_to_end_with_bundled_data() {
    let tmp = tempfile::TempDir::new().unwrap();
    let settings = Settings {
        rules_path: data_dir().join("rules.yaml"),
        corpus_path: data_dir().join("sample_messages.jsonl"),
        models_dir: tmp.path().join("models"),
        ..Settings::default()
    };
    let svc = TaggingService::from_settings(&settings).unwrap();

    let out = svc
        .ingest("conv_auto", "user", "please top up my wallet asap")
        .await
        .unwrap();
    assert_eq!(out.source, SourceKind::Rule);
    assert_eq!(out.labels, LabelPair::new(ServiceType::Wallet, Category::TopUp));
    assert!(out.confidence >= 0.9);
    assert_eq!(out.action, RoutingAction::Auto);
    assert!(out.committed);
    assert!(out.clarifier.is_none());
    assert!(out.rule_hits.contains(&"svc_wallet".to_string()));
    assert!(out.rule_hits.contains(&"cat_topup".to_string()));

    let detail = svc.get_ticket(&out.ticket_id).unwrap();
    assert_eq!(detail.ticket.tags.source, Some(SourceKind::Rule));
    assert_eq!(detail.tag_history.len(), 1);
}

#[tokio::test]
async fn second_message_joins_ticket_and_uses_full_conversation() {
    let classifier = wallet_topup_classifier();
    let svc = service(Arc::clone(&classifier), Arc::new(HeuristicAdjudicator));

    let first = svc
        .ingest("conv_thread", "user", "please top up my wallet with some funds")
        .await
        .unwrap();
    let second = svc
        .ingest("conv_thread", "user", "any update on that request?")
        .await
        .unwrap();

    assert_eq!(first.ticket_id, second.ticket_id);
    assert_eq!(second.labels, LabelPair::new(ServiceType::Wallet, Category::TopUp));
    // Rules still fire because the decision sees both messages.
    assert_eq!(second.source, SourceKind::Rule);

    let seen = classifier.seen.lock().unwrap().clone();
    assert_eq!(
        seen.last().map(String::as_str),
        Some("please top up my wallet with some funds any update on that request?")
    );

    let detail = svc.get_ticket(&first.ticket_id).unwrap();
    assert_eq!(detail.messages.len(), 2);
    assert_eq!(detail.messages[1].text, "any update on that request?");

    let listing = svc.list_tickets().unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].message_count, 2);
    assert!(listing[0].last_message_preview.is_some());
}

#[tokio::test]
async fn repeated_identical_decision_writes_one_audit() {
    let svc = service(wallet_topup_classifier(), Arc::new(HeuristicAdjudicator));
    let a = svc.ingest("conv_idem", "user", "top up wallet").await.unwrap();
    svc.ingest("conv_idem", "user", "top up wallet").await.unwrap();

    let detail = svc.get_ticket(&a.ticket_id).unwrap();
    assert_eq!(detail.messages.len(), 2);
    assert_eq!(detail.tag_history.len(), 1);
}

#[tokio::test]
async fn pii_is_redacted_before_storage() {
    let svc = service(wallet_topup_classifier(), Arc::new(HeuristicAdjudicator));
    let out = svc
        .ingest("conv_pii", "user", "top up wallet, mail me at jo@example.com")
        .await
        .unwrap();
    let msg = &svc.get_ticket(&out.ticket_id).unwrap().messages[0];
    assert!(!msg.text.contains("jo@example.com"));
    assert_eq!(msg.pii_redactions, vec!["jo@example.com".to_string()]);
    assert_eq!(msg.lang, "en");
}

#[tokio::test]
async fn llm_band_commits_confident_verdict() {
    let svc = service(
        wallet_topup_classifier(),
        verdict(ServiceType::Wallet, Category::Withdraw, 0.9),
    );
    let out = svc
        .ingest("conv_llm", "user", "maybe let me move money out")
        .await
        .unwrap();

    assert_eq!(out.action, RoutingAction::Llm);
    assert_eq!(out.source, SourceKind::Llm);
    assert!(out.committed);
    assert_eq!(out.labels.category, Some(Category::Withdraw));
    assert_eq!(out.rationale.as_deref(), Some("stub"));

    let t = svc.get_ticket(&out.ticket_id).unwrap().ticket;
    assert_eq!(t.tags.source, Some(SourceKind::Llm));
    assert_eq!(t.tags.confidence, Some(0.9));
}

#[tokio::test]
async fn low_verdict_routes_to_clarification() {
    let svc = service(
        wallet_topup_classifier(),
        verdict(ServiceType::Flight, Category::Cancellation, 0.7),
    );
    let out = svc
        .ingest("conv_low", "user", "something about my trip")
        .await
        .unwrap();

    assert_eq!(out.action, RoutingAction::Llm);
    assert!(!out.committed);
    assert_eq!(out.clarifier.map(|q| q.id), Some("cancellation_modify"));

    let detail = svc.get_ticket(&out.ticket_id).unwrap();
    assert!(detail.tag_history.is_empty());
    assert_eq!(detail.ticket.status, TicketStatus::AwaitingClarification);
    assert_eq!(
        detail.ticket.pending_clarifier.as_deref(),
        Some("cancellation_modify")
    );
}

#[tokio::test]
async fn unanswered_question_is_dropped_when_next_decision_has_none() {
    let adjudicator = ScriptedAdjudicator::new(&[
        (ServiceType::Flight, Category::Cancellation, 0.7),
        (ServiceType::Wallet, Category::TopUp, 0.7),
    ]);
    let svc = service(wallet_topup_classifier(), Arc::new(adjudicator));

    let first = svc.ingest("conv_drift", "user", "about my trip").await.unwrap();
    assert_eq!(first.clarifier.map(|q| q.id), Some("cancellation_modify"));

    let second = svc
        .ingest("conv_drift", "user", "actually something else")
        .await
        .unwrap();
    assert!(!second.committed);
    assert!(second.clarifier.is_none());

    let t = svc.get_ticket(&second.ticket_id).unwrap().ticket;
    assert_eq!(t.status, TicketStatus::Open);
    assert_eq!(t.pending_clarifier, None);

    let err = svc
        .resolve_clarifier(&second.ticket_id, "modify")
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));
}

#[tokio::test]
async fn adjudicator_timeout_falls_back_to_clarify() {
    let classifier = Arc::new(FixedClassifier::new(
        ServiceType::Flight,
        0.65,
        Category::Modify,
        0.6,
    ));
    let svc = service(classifier, Arc::new(SlowAdjudicator))
        .with_adjudicator_timeout(Duration::from_millis(20));

    let out = svc
        .ingest("conv_slow", "user", "please do something with my trip")
        .await
        .unwrap();
    assert_eq!(out.action, RoutingAction::Llm);
    assert!(!out.committed);
    assert_eq!(out.source, SourceKind::Ml);
    assert!(out.rationale.is_none());
    assert_eq!(out.clarifier.map(|q| q.id), Some("cancellation_modify"));
    assert!(svc.get_ticket(&out.ticket_id).unwrap().tag_history.is_empty());
}

#[tokio::test]
async fn adjudicator_failure_is_not_user_visible() {
    let svc = service(wallet_topup_classifier(), Arc::new(FailingAdjudicator));
    let out = svc
        .ingest("conv_fail", "user", "hmm the balance thing")
        .await
        .unwrap();
    assert!(!out.committed);
    // wallet/top_up has no clarifying question: the ticket waits for an agent.
    assert!(out.clarifier.is_none());
    let t = svc.get_ticket(&out.ticket_id).unwrap().ticket;
    assert_eq!(t.status, TicketStatus::Open);
    assert_eq!(t.tags.source, None);
}

#[tokio::test]
async fn validation_errors_leave_no_trace() {
    let svc = service(wallet_topup_classifier(), Arc::new(HeuristicAdjudicator));

    let err = svc.ingest("conv_v", "user", "   ").await.unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));
    let err = svc.ingest("conv_v", "robot", "top up").await.unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));
    let err = svc.ingest("", "user", "top up").await.unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));

    assert!(svc.list_tickets().unwrap().is_empty());
}

#[tokio::test]
async fn storage_failure_rolls_back_the_whole_cycle() {
    let store = Arc::new(TicketStore::open().unwrap());
    let svc = TaggingService::new(
        Arc::new(RuleMatcher::from_yaml(RULES).unwrap()),
        wallet_topup_classifier(),
        verdict(ServiceType::Wallet, Category::TopUp, 0.5),
        Arc::clone(&store),
        Thresholds::default(),
    );
    let first = svc.ingest("conv_broken", "user", "hello there").await.unwrap();
    assert!(!first.committed);
    let before = svc.get_ticket(&first.ticket_id).unwrap();

    // Occupy the next audit id so the tag write fails after the message append.
    store
        .connection()
        .execute_batch(
            "INSERT INTO tag_audits (audit_id, ticket_id, source, ts)
             VALUES (1, 'TK9999', 'rule', 0)",
        )
        .unwrap();

    let err = svc
        .ingest("conv_broken", "user", "please top up my wallet")
        .await
        .unwrap_err();
    assert!(err.is_transient(), "got {err:?}");
    assert!(!matches!(err, ServiceError::Validation(_)));

    let listing = svc.list_tickets().unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].message_count, 1);

    let after = svc.get_ticket(&first.ticket_id).unwrap();
    assert_eq!(after.messages.len(), 1);
    assert_eq!(after.messages[0].text, "hello there");
    assert_eq!(after.ticket.tags, before.ticket.tags);
    assert_eq!(after.ticket.status, before.ticket.status);
    assert_eq!(after.ticket.updated_at, before.ticket.updated_at);
    assert!(after.tag_history.is_empty());
}

#[tokio::test]
async fn concurrent_ingests_on_one_conversation_serialise() {
    let svc = service(wallet_topup_classifier(), Arc::new(HeuristicAdjudicator));
    let texts = ["top up", "wallet", "top up", "wallet", "top up"];
    let results =
        futures::future::join_all(texts.map(|t| svc.ingest("conv_busy", "user", t))).await;
    let ids: Vec<String> = results.into_iter().map(|r| r.unwrap().ticket_id).collect();
    assert!(ids.iter().all(|id| id == &ids[0]));
    assert_eq!(svc.get_ticket(&ids[0]).unwrap().messages.len(), 5);
}

#[tokio::test]
async fn different_conversations_get_different_tickets() {
    let svc = service(wallet_topup_classifier(), Arc::new(HeuristicAdjudicator));
    let (a, b) = tokio::join!(
        svc.ingest("conv_a", "user", "top up wallet"),
        svc.ingest("conv_b", "agent", "top up wallet"),
    );
    assert_ne!(a.unwrap().ticket_id, b.unwrap().ticket_id);
    assert_eq!(svc.list_tickets().unwrap().len(), 2);
}

// ── Override ──

#[tokio::test]
async fn override_writes_agent_audit() {
    let svc = service(wallet_topup_classifier(), Arc::new(HeuristicAdjudicator));
    let out = svc.ingest("conv_o", "user", "top up wallet").await.unwrap();

    let detail = svc
        .override_tags(&out.ticket_id, ServiceType::Wallet, Category::Withdraw, "wrong tag")
        .await
        .unwrap();
    assert_eq!(detail.ticket.tags.source, Some(SourceKind::Agent));
    assert_eq!(detail.ticket.tags.confidence, Some(1.0));
    let last = detail.tag_history.last().unwrap();
    assert_eq!(last.source, SourceKind::Agent);
    assert_eq!(last.confidence, Some(1.0));
    assert_eq!(last.reason.as_deref(), Some("wrong tag"));
    assert_eq!(last.old, LabelPair::new(ServiceType::Wallet, Category::TopUp));

    // Same override again is a no-op.
    let again = svc
        .override_tags(&out.ticket_id, ServiceType::Wallet, Category::Withdraw, "still wrong")
        .await
        .unwrap();
    assert_eq!(again.tag_history.len(), detail.tag_history.len());
}

#[tokio::test]
async fn override_requires_reason_and_known_ticket() {
    let svc = service(wallet_topup_classifier(), Arc::new(HeuristicAdjudicator));
    let out = svc.ingest("conv_r", "user", "top up wallet").await.unwrap();

    let err = svc
        .override_tags(&out.ticket_id, ServiceType::Hotel, Category::Modify, "  ")
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));
    assert_eq!(svc.get_ticket(&out.ticket_id).unwrap().tag_history.len(), 1);

    let err = svc
        .override_tags("TK9999", ServiceType::Hotel, Category::Modify, "x")
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(id) if id == "TK9999"));
}

// ── Clarification ──

#[tokio::test]
async fn resolve_clarifier_switches_category() {
    let classifier = Arc::new(FixedClassifier::new(
        ServiceType::Flight,
        0.85,
        Category::Cancellation,
        0.85,
    ));
    let svc = service(classifier, Arc::new(HeuristicAdjudicator));
    let out = svc.ingest("conv_c", "user", "my trip").await.unwrap();
    assert!(out.committed);

    let detail = svc.resolve_clarifier(&out.ticket_id, "modify").await.unwrap();
    let tags = detail.ticket.tags;
    assert_eq!(tags.labels, LabelPair::new(ServiceType::Flight, Category::Modify));
    assert_eq!(tags.source, Some(SourceKind::User));
    assert_eq!(tags.confidence, Some(0.85));
    assert_eq!(detail.ticket.status, TicketStatus::Open);
}

#[tokio::test]
async fn resolve_clarifier_floors_confidence() {
    let classifier = Arc::new(FixedClassifier::new(
        ServiceType::Hotel,
        0.52,
        Category::Cancellation,
        0.52,
    ));
    let svc = TaggingService::new(
        Arc::new(RuleMatcher::from_yaml(RULES).unwrap()),
        classifier,
        Arc::new(HeuristicAdjudicator),
        Arc::new(TicketStore::open().unwrap()),
        Thresholds::new(0.5, 0.3).unwrap(),
    );
    let out = svc.ingest("conv_f", "user", "my room").await.unwrap();
    assert!(out.committed);

    let detail = svc.resolve_clarifier(&out.ticket_id, "modify").await.unwrap();
    assert_eq!(detail.ticket.tags.confidence, Some(0.6));
    assert_eq!(
        detail.ticket.tags.labels.service_type,
        Some(ServiceType::Hotel)
    );
}

#[tokio::test]
async fn resolve_pending_question_clears_status() {
    let svc = service(
        wallet_topup_classifier(),
        verdict(ServiceType::Flight, Category::Cancellation, 0.7),
    );
    let out = svc.ingest("conv_p", "user", "about my trip").await.unwrap();
    assert!(out.clarifier.is_some());

    let detail = svc
        .resolve_clarifier(&out.ticket_id, "cancellation")
        .await
        .unwrap();
    assert_eq!(detail.ticket.status, TicketStatus::Open);
    assert_eq!(detail.ticket.pending_clarifier, None);
    assert_eq!(detail.ticket.tags.labels.category, Some(Category::Cancellation));
    assert_eq!(detail.ticket.tags.source, Some(SourceKind::User));
    assert_eq!(detail.ticket.tags.confidence, Some(0.6));
}

#[tokio::test]
async fn resolve_rejects_bad_choices() {
    let svc = service(
        wallet_topup_classifier(),
        verdict(ServiceType::Flight, Category::Cancellation, 0.7),
    );
    let out = svc.ingest("conv_bad", "user", "about my trip").await.unwrap();

    for choice in ["top_up", "banana"] {
        let err = svc.resolve_clarifier(&out.ticket_id, choice).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)), "{choice}");
    }
    let detail = svc.get_ticket(&out.ticket_id).unwrap();
    assert!(detail.tag_history.is_empty());
    assert_eq!(detail.ticket.status, TicketStatus::AwaitingClarification);

    let err = svc.resolve_clarifier("TK9999", "modify").await.unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
}

#[tokio::test]
async fn resolve_without_question_is_rejected() {
    let svc = service(wallet_topup_classifier(), Arc::new(HeuristicAdjudicator));
    let out = svc.ingest("conv_nq", "user", "top up wallet").await.unwrap();
    let err = svc.resolve_clarifier(&out.ticket_id, "modify").await.unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));
}

// ── Maintenance ──

#[tokio::test]
async fn metrics_reflect_sources_and_overrides() {
    let svc = service(wallet_topup_classifier(), Arc::new(FailingAdjudicator));
    let a = svc.ingest("conv_1", "user", "top up wallet").await.unwrap();
    svc.ingest("conv_2", "user", "nothing matches").await.unwrap();
    svc.override_tags(&a.ticket_id, ServiceType::Wallet, Category::Withdraw, "wrong tag")
        .await
        .unwrap();

    let m = svc.metrics().unwrap();
    assert_eq!(m.tickets, 2);
    assert_eq!(m.auto_tag_rate, 0.0);
    assert_eq!(m.override_rate, 0.5);
    assert_eq!(m.llm_hit_rate, 0.0);
    assert_eq!(m.class_distribution.get("wallet::withdraw"), Some(&1));
    assert_eq!(m.class_distribution.get("unknown::unknown"), Some(&1));

    let empty = service(wallet_topup_classifier(), Arc::new(HeuristicAdjudicator));
    assert_eq!(empty.metrics().unwrap().auto_tag_rate, 0.0);
}

#[tokio::test]
async fn seed_is_idempotent() {
    let tmp = tempfile::TempDir::new().unwrap();
    let corpus = tmp.path().join("seed.jsonl");
    std::fs::write(
        &corpus,
        concat!(
            "{\"text\": \"top up wallet\", \"service_type\": \"wallet\", \"category\": \"top_up\"}\n",
            "{\"text\": \"cancel flight\", \"service_type\": \"flight\", \"category\": \"cancellation\"}\n",
        ),
    )
    .unwrap();
    let svc = service(wallet_topup_classifier(), Arc::new(HeuristicAdjudicator))
        .with_corpus_path(&corpus);

    let first = svc.seed().await.unwrap();
    assert_eq!(first, SeedReport { ingested: 2, skipped: 0 });
    let second = svc.seed().await.unwrap();
    assert_eq!(second, SeedReport { ingested: 0, skipped: 2 });

    let convs: Vec<String> = svc
        .list_tickets()
        .unwrap()
        .into_iter()
        .map(|t| t.conversation_id)
        .collect();
    assert!(convs.contains(&"seed_1".to_string()));
    assert!(convs.contains(&"seed_2".to_string()));
}

#[tokio::test]
async fn retrain_runs_classifier_refit() {
    let classifier = wallet_topup_classifier();
    let svc = service(Arc::clone(&classifier), Arc::new(HeuristicAdjudicator));
    let metrics = svc.retrain().await.unwrap();
    assert_eq!(metrics.records, 3);
    assert_eq!(classifier.retrains.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unknown_ticket_is_not_found() {
    let svc = service(wallet_topup_classifier(), Arc::new(HeuristicAdjudicator));
    assert!(matches!(
        svc.get_ticket("TK0404"),
        Err(ServiceError::NotFound(_))
    ));
}
