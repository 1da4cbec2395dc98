//! Provenance, routing actions and the fused decision value.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, LabelError, LabelPair};

/// How a label was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Rule,
    Ml,
    Llm,
    User,
    Agent,
}

impl SourceKind {
    pub const ALL: [SourceKind; 5] = [Self::Rule, Self::Ml, Self::Llm, Self::User, Self::Agent];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rule => "rule",
            Self::Ml => "ml",
            Self::Llm => "llm",
            Self::User => "user",
            Self::Agent => "agent",
        }
    }

    /// Sources produced without a human in the loop.
    pub fn is_automated(&self) -> bool {
        matches!(self, Self::Rule | Self::Ml | Self::Llm)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = LabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| LabelError::UnknownSource(s.to_string()))
    }
}

/// Next step chosen by the fusion policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingAction {
    /// Commit the decision as-is.
    Auto,
    /// Ask the adjudicator for a second opinion.
    Llm,
    /// Ask the user a disambiguating question.
    Clarify,
}

impl RoutingAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Llm => "llm",
            Self::Clarify => "clarify",
        }
    }
}

impl fmt::Display for RoutingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transient output of the fusion policy. Never persisted as-is.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Decision {
    pub labels: LabelPair,
    pub confidence: f64,
    pub source: SourceKind,
    pub action: RoutingAction,
}

/// Process-wide routing thresholds.
///
/// Invariant: `0 <= low < high <= 1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    high: f64,
    low: f64,
}

impl Thresholds {
    pub const DEFAULT_HIGH: f64 = 0.80;
    pub const DEFAULT_LOW: f64 = 0.55;

    pub fn new(high: f64, low: f64) -> Result<Self, ConfigError> {
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !in_unit(high) || !in_unit(low) {
            return Err(ConfigError::ThresholdRange { high, low });
        }
        if low >= high {
            return Err(ConfigError::ThresholdOrder { high, low });
        }
        Ok(Self { high, low })
    }

    pub fn high(&self) -> f64 {
        self.high
    }

    pub fn low(&self) -> f64 {
        self.low
    }

    /// Partition a confidence value into a routing action.
    ///
    /// `[high, ∞)` → auto, `[low, high)` → llm, everything below → clarify.
    pub fn route(&self, confidence: f64) -> RoutingAction {
        if confidence >= self.high {
            RoutingAction::Auto
        } else if confidence >= self.low {
            RoutingAction::Llm
        } else {
            RoutingAction::Clarify
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            high: Self::DEFAULT_HIGH,
            low: Self::DEFAULT_LOW,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_partitions_without_gaps() {
        let t = Thresholds::default();
        for step in 0..=1000 {
            let c = step as f64 / 1000.0;
            let action = t.route(c);
            assert_eq!(action == RoutingAction::Auto, c >= t.high(), "c = {c}");
            assert_eq!(action == RoutingAction::Clarify, c < t.low(), "c = {c}");
            assert_eq!(
                action == RoutingAction::Llm,
                c >= t.low() && c < t.high(),
                "c = {c}"
            );
        }
    }

    #[test]
    fn route_boundaries_are_inclusive_below() {
        let t = Thresholds::new(0.8, 0.55).unwrap();
        assert_eq!(t.route(0.8), RoutingAction::Auto);
        assert_eq!(t.route(0.55), RoutingAction::Llm);
        assert_eq!(t.route(0.5499), RoutingAction::Clarify);
    }

    #[test]
    fn thresholds_reject_inverted_order() {
        assert!(matches!(
            Thresholds::new(0.5, 0.7),
            Err(ConfigError::ThresholdOrder { .. })
        ));
        assert!(matches!(
            Thresholds::new(0.6, 0.6),
            Err(ConfigError::ThresholdOrder { .. })
        ));
    }

    #[test]
    fn thresholds_reject_out_of_range() {
        assert!(matches!(
            Thresholds::new(1.2, 0.5),
            Err(ConfigError::ThresholdRange { .. })
        ));
        assert!(matches!(
            Thresholds::new(0.8, -0.1),
            Err(ConfigError::ThresholdRange { .. })
        ));
    }

    #[test]
    fn source_kind_parses() {
        assert_eq!("agent".parse::<SourceKind>().unwrap(), SourceKind::Agent);
        assert!("bot".parse::<SourceKind>().is_err());
        assert!(SourceKind::Llm.is_automated());
        assert!(!SourceKind::User.is_automated());
    }
}
