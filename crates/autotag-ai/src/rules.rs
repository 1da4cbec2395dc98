//! Keyword rules for service type and category.
//!
//! The catalog is a YAML document with one ordered rule list per label
//! dimension. Every rule names its label explicitly:
//!
//! ```yaml
//! service_type:
//!   - id: svc_wallet
//!     label: wallet
//!     pattern: '\bwallet\b'
//!     lang: "*"
//!     precision: high
//! category:
//!   - id: cat_topup
//!     label: top_up
//!     pattern: 'top[\s-]?up'
//! ```
//!
//! Matching runs in two passes per dimension. Pass 1 collects every rule
//! that fires (for the hit list and the precision hint); pass 2 takes the
//! label of the first collected rule. A later match can raise the hint to
//! `high` but never replaces the chosen label.

use std::collections::HashSet;
use std::path::Path;

use autotag_core::{Category, ServiceType};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Language scope matching every conversation.
pub const ANY_LANG: &str = "*";

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("failed to read rule catalog {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("invalid rule catalog: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("rule {id}: invalid pattern: {source}")]
    Pattern { id: String, source: regex::Error },

    #[error("rule {0}: empty pattern")]
    EmptyPattern(String),

    #[error("duplicate rule id: {0}")]
    DuplicateId(String),
}

/// How much a rule's authors trust it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecisionTier {
    High,
    #[default]
    Normal,
}

#[derive(Deserialize)]
struct RuleSpec<L> {
    id: String,
    label: L,
    pattern: String,
    #[serde(default = "any_lang")]
    lang: String,
    #[serde(default)]
    precision: PrecisionTier,
}

fn any_lang() -> String {
    ANY_LANG.to_string()
}

#[derive(Deserialize)]
struct CatalogFile {
    #[serde(default)]
    service_type: Vec<RuleSpec<ServiceType>>,
    #[serde(default)]
    category: Vec<RuleSpec<Category>>,
}

/// A compiled rule for one label dimension.
#[derive(Debug, Clone)]
pub struct Rule<L> {
    pub id: String,
    pub label: L,
    pub lang: String,
    pub precision: PrecisionTier,
    pattern: Regex,
}

impl<L> Rule<L> {
    /// In scope for `lang` and the pattern occurs somewhere in `text`
    /// (case-insensitive).
    pub fn matches(&self, text: &str, lang: &str) -> bool {
        (self.lang == ANY_LANG || self.lang == lang) && self.pattern.is_match(text)
    }

    fn compile(spec: RuleSpec<L>) -> Result<Self, RuleError> {
        if spec.pattern.trim().is_empty() {
            return Err(RuleError::EmptyPattern(spec.id));
        }
        let pattern = RegexBuilder::new(&spec.pattern)
            .case_insensitive(true)
            .build()
            .map_err(|source| RuleError::Pattern {
                id: spec.id.clone(),
                source,
            })?;
        Ok(Self {
            id: spec.id,
            label: spec.label,
            lang: spec.lang,
            precision: spec.precision,
            pattern,
        })
    }
}

/// Result of running the catalog over a conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuleOutcome {
    pub service_type: Option<ServiceType>,
    pub category: Option<Category>,
    /// Ids of every rule that fired: service rules first, then category
    /// rules, each in catalog order.
    pub hits: Vec<String>,
    pub precision_hint: PrecisionTier,
}

impl RuleOutcome {
    pub fn has_hits(&self) -> bool {
        !self.hits.is_empty()
    }
}

/// Ordered keyword rules for both label dimensions. Loaded once and shared.
#[derive(Debug, Clone, Default)]
pub struct RuleMatcher {
    service_rules: Vec<Rule<ServiceType>>,
    category_rules: Vec<Rule<Category>>,
}

impl RuleMatcher {
    /// Load and compile a YAML catalog from disk.
    pub fn load(path: &Path) -> Result<Self, RuleError> {
        let yaml = std::fs::read_to_string(path).map_err(|source| RuleError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let matcher = Self::from_yaml(&yaml)?;
        info!(
            path = %path.display(),
            service_rules = matcher.service_rules.len(),
            category_rules = matcher.category_rules.len(),
            "loaded rule catalog"
        );
        Ok(matcher)
    }

    /// Compile a catalog from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, RuleError> {
        let file: CatalogFile = serde_yaml::from_str(yaml)?;

        let mut seen = HashSet::new();
        for id in file
            .service_type
            .iter()
            .map(|r| &r.id)
            .chain(file.category.iter().map(|r| &r.id))
        {
            if !seen.insert(id.as_str()) {
                return Err(RuleError::DuplicateId(id.clone()));
            }
        }

        let service_rules = file
            .service_type
            .into_iter()
            .map(Rule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        let category_rules = file
            .category
            .into_iter()
            .map(Rule::compile)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            service_rules,
            category_rules,
        })
    }

    pub fn service_rules(&self) -> &[Rule<ServiceType>] {
        &self.service_rules
    }

    pub fn category_rules(&self) -> &[Rule<Category>] {
        &self.category_rules
    }

    /// Evaluate every rule against `text` in language `lang`.
    ///
    /// No match at all is a normal outcome: both candidates `None`, empty
    /// hit list, `normal` hint.
    pub fn apply(&self, text: &str, lang: &str) -> RuleOutcome {
        // Pass 1: collect.
        let service_hits = collect_matches(&self.service_rules, text, lang);
        let category_hits = collect_matches(&self.category_rules, text, lang);

        let any_high = service_hits
            .iter()
            .map(|r| r.precision)
            .chain(category_hits.iter().map(|r| r.precision))
            .any(|p| p == PrecisionTier::High);

        // Pass 2: select.
        let service_type = first_label(&service_hits);
        let category = first_label(&category_hits);

        let hits = service_hits
            .iter()
            .map(|r| r.id.clone())
            .chain(category_hits.iter().map(|r| r.id.clone()))
            .collect();

        RuleOutcome {
            service_type,
            category,
            hits,
            precision_hint: if any_high {
                PrecisionTier::High
            } else {
                PrecisionTier::Normal
            },
        }
    }
}

fn collect_matches<'a, L>(rules: &'a [Rule<L>], text: &str, lang: &str) -> Vec<&'a Rule<L>> {
    rules.iter().filter(|r| r.matches(text, lang)).collect()
}

fn first_label<L: Copy>(matched: &[&Rule<L>]) -> Option<L> {
    matched.first().map(|r| r.label)
}
