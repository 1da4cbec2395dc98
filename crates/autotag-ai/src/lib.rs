//! Tagging signals: keyword rules, statistical classifier, fusion policy,
//! adjudication and clarification.

pub mod adjudicator;
pub mod clarify;
pub mod classifier;
pub mod corpus;
pub mod policy;
pub mod rules;

#[cfg(feature = "http")]
pub use adjudicator::HttpAdjudicator;
pub use adjudicator::{Adjudicator, AdjudicatorError, HeuristicAdjudicator, Verdict};
pub use clarify::ClarifyingQuestion;
pub use classifier::{
    CentroidClassifier, ClassifierError, Distribution, Prediction, TextClassifier,
    TrainingMetrics,
};
pub use corpus::{TrainingCorpus, TrainingRecord};
pub use policy::fuse;
pub use rules::{PrecisionTier, RuleError, RuleMatcher, RuleOutcome};
