//! Clarifying questions for inherently ambiguous categories.

use autotag_core::{Category, LabelPair};
use serde::Serialize;

/// Confidence floor for a user-confirmed category.
pub const USER_CONFIDENCE_FLOOR: f64 = 0.6;

/// A canned question with a closed set of answers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClarifyingQuestion {
    pub id: &'static str,
    pub question: &'static str,
    pub options: &'static [Category],
}

impl ClarifyingQuestion {
    pub fn offers(&self, choice: Category) -> bool {
        self.options.contains(&choice)
    }
}

/// Ambiguity catalog. A question fires when the current category is one of
/// its options.
pub const CATALOG: &[ClarifyingQuestion] = &[ClarifyingQuestion {
    id: "cancellation_modify",
    question: "Is the traveler cancelling or modifying the booking?",
    options: &[Category::Cancellation, Category::Modify],
}];

/// Question for `labels`, if its category is known to be ambiguous.
pub fn maybe_question(labels: &LabelPair) -> Option<&'static ClarifyingQuestion> {
    let category = labels.category?;
    CATALOG.iter().find(|q| q.offers(category))
}

/// Look up a catalog entry by id.
pub fn question_by_id(id: &str) -> Option<&'static ClarifyingQuestion> {
    CATALOG.iter().find(|q| q.id == id)
}

/// Apply an answer: the choice becomes the category, the service type is
/// untouched, and confidence is at least [`USER_CONFIDENCE_FLOOR`].
///
/// The caller is responsible for checking `choice` against the offered
/// options.
pub fn resolve(
    current: &LabelPair,
    current_confidence: Option<f64>,
    choice: Category,
) -> (LabelPair, f64) {
    let labels = LabelPair {
        service_type: current.service_type,
        category: Some(choice),
    };
    let confidence = current_confidence.unwrap_or(0.0).max(USER_CONFIDENCE_FLOOR);
    (labels, confidence)
}
