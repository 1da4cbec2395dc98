//! Second-opinion adjudicators for decisions in the `llm` band.
//!
//! The service treats every adjudicator as slow and unreliable: it wraps the
//! call in a timeout and falls back to clarification on any error. The
//! returned confidence is not expected to be monotonic in the input guess.

use async_trait::async_trait;
use autotag_core::{Category, LabelPair, ServiceType};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdjudicatorError {
    #[cfg(feature = "http")]
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Server { status: u16, body: String },

    #[error("unusable verdict: {0}")]
    Verdict(String),
}

/// A possibly-revised label pair with the adjudicator's own confidence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub labels: LabelPair,
    pub confidence: f64,
    pub rationale: String,
}

#[async_trait]
pub trait Adjudicator: Send + Sync {
    async fn adjudicate(&self, text: &str, current: &LabelPair)
    -> Result<Verdict, AdjudicatorError>;
}

// ── Heuristic ──

/// Keyword → category table, checked in order; first hit wins.
const CATEGORY_KEYWORDS: &[(&str, Category, f64)] = &[
    ("cancel", Category::Cancellation, 0.8),
    ("refund", Category::Cancellation, 0.75),
    ("top up", Category::TopUp, 0.78),
    ("withdraw", Category::Withdraw, 0.8),
    ("change", Category::Modify, 0.7),
    ("modify", Category::Modify, 0.7),
];

const BASE_CONFIDENCE: f64 = 0.65;
const WALLET_CONFIDENCE: f64 = 0.78;
const FLIGHT_CONFIDENCE: f64 = 0.76;

/// Deterministic keyword adjudicator. Never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicAdjudicator;

impl HeuristicAdjudicator {
    pub fn judge(&self, text: &str, current: &LabelPair) -> Verdict {
        let lower = text.to_lowercase();
        let mut labels = *current;
        let mut confidence = BASE_CONFIDENCE;
        let mut rationale = String::from("Using heuristic fallback");

        if let Some((key, category, conf)) = CATEGORY_KEYWORDS
            .iter()
            .find(|(key, _, _)| lower.contains(key))
        {
            labels.category = Some(*category);
            confidence = confidence.max(*conf);
            rationale = format!("Detected keyword '{key}'");
        }

        if lower.contains("wallet") {
            labels.service_type = Some(ServiceType::Wallet);
            confidence = confidence.max(WALLET_CONFIDENCE);
            rationale.push_str(" + wallet keyword");
        } else if lower.contains("flight") || lower.contains("pnr") {
            labels.service_type = Some(ServiceType::Flight);
            confidence = confidence.max(FLIGHT_CONFIDENCE);
            rationale.push_str(" + flight keyword");
        }

        Verdict {
            labels,
            confidence,
            rationale,
        }
    }
}

#[async_trait]
impl Adjudicator for HeuristicAdjudicator {
    async fn adjudicate(
        &self,
        text: &str,
        current: &LabelPair,
    ) -> Result<Verdict, AdjudicatorError> {
        Ok(self.judge(text, current))
    }
}

// ── Model reply parsing ──

/// JSON object the model is asked to reply with.
#[derive(Debug, Deserialize)]
struct RawVerdict {
    service_type: Option<String>,
    category: Option<String>,
    confidence: f64,
    #[serde(default)]
    rationale: String,
}

/// Parse a model reply into a [`Verdict`].
///
/// Missing or unrecognised labels fall back to `current`. Confidence outside
/// [0, 1] or non-JSON content is rejected.
pub fn parse_verdict(content: &str, current: &LabelPair) -> Result<Verdict, AdjudicatorError> {
    let body = strip_code_fence(content);
    let raw: RawVerdict =
        serde_json::from_str(body).map_err(|e| AdjudicatorError::Verdict(e.to_string()))?;

    if !(0.0..=1.0).contains(&raw.confidence) {
        return Err(AdjudicatorError::Verdict(format!(
            "confidence {} outside [0, 1]",
            raw.confidence
        )));
    }

    let service_type = raw
        .service_type
        .and_then(|s| s.parse::<ServiceType>().ok())
        .or(current.service_type);
    let category = raw
        .category
        .and_then(|c| c.parse::<Category>().ok())
        .or(current.category);

    Ok(Verdict {
        labels: LabelPair {
            service_type,
            category,
        },
        confidence: raw.confidence,
        rationale: raw.rationale,
    })
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map_or(trimmed, str::trim)
}

// ── HTTP ──

#[cfg(feature = "http")]
pub use http::HttpAdjudicator;

#[cfg(feature = "http")]
mod http {
    use super::*;
    use tracing::{debug, info};

    const SYSTEM_PROMPT: &str = "You label customer-support conversations. \
        Reply with a single JSON object: \
        {\"service_type\": one of flight|hotel|visa|esim|wallet|other, \
        \"category\": one of cancellation|modify|top_up|withdraw|order_recheck|pre_purchase|others, \
        \"confidence\": number between 0 and 1, \"rationale\": short string}.";

    /// Chat-completions adjudicator.
    pub struct HttpAdjudicator {
        client: reqwest::Client,
        base_url: String,
        model: String,
        api_key: Option<String>,
    }

    #[derive(Deserialize)]
    struct ChatMessage {
        content: String,
    }

    #[derive(Deserialize)]
    struct Choice {
        message: ChatMessage,
    }

    #[derive(Deserialize)]
    struct ChatResponse {
        choices: Vec<Choice>,
    }

    impl HttpAdjudicator {
        /// `base_url` like `http://localhost:11434`; a trailing slash is trimmed.
        pub fn new(base_url: String, model: String) -> Self {
            Self {
                client: reqwest::Client::new(),
                base_url: base_url.trim_end_matches('/').to_string(),
                model,
                api_key: None,
            }
        }

        pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
            self.api_key = api_key;
            self
        }

        fn user_prompt(text: &str, current: &LabelPair) -> String {
            format!("Current guess: {current}\n\nConversation:\n{text}")
        }
    }

    #[async_trait]
    impl Adjudicator for HttpAdjudicator {
        async fn adjudicate(
            &self,
            text: &str,
            current: &LabelPair,
        ) -> Result<Verdict, AdjudicatorError> {
            let url = format!("{}/v1/chat/completions", self.base_url);
            let body = serde_json::json!({
                "model": &self.model,
                "messages": [
                    {"role": "system", "content": SYSTEM_PROMPT},
                    {"role": "user", "content": Self::user_prompt(text, current)}
                ],
                "temperature": 0.1,
                "response_format": {"type": "json_object"}
            });

            info!(url = %url, model = %self.model, "requesting adjudication");
            let mut req = self.client.post(&url).json(&body);
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }
            let resp = req.send().await?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(AdjudicatorError::Server {
                    status: status.as_u16(),
                    body,
                });
            }

            let chat: ChatResponse = resp.json().await?;
            let content = chat
                .choices
                .into_iter()
                .next()
                .map(|c| c.message.content)
                .ok_or_else(|| AdjudicatorError::Verdict("no choices in reply".into()))?;
            debug!(content = %content, "adjudicator reply");
            parse_verdict(&content, current)
        }
    }

}
