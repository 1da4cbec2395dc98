//! Text cleaning ahead of tagging: language detection and PII redaction.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Replacement for every redacted span.
pub const REDACTED: &str = "<redacted>";

/// Language reported when nothing better is known.
pub const DEFAULT_LANG: &str = "en";

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\w.\-]+@[\w.\-]+").expect("email pattern compiles"));
static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\+?\d[\d\-\s]{7,}\b").expect("phone pattern compiles"));

/// Output of [`normalize`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Normalized {
    pub text: String,
    pub lang: String,
    /// Redacted spans, verbatim, in detection order.
    pub redactions: Vec<String>,
}

/// Clean raw message text.
pub fn normalize(raw: &str) -> Normalized {
    let lang = detect_lang(raw);
    let (text, redactions) = scrub_pii(raw);
    Normalized {
        text,
        lang,
        redactions,
    }
}

/// Language detection stub: everything is English for now.
pub fn detect_lang(_text: &str) -> String {
    DEFAULT_LANG.to_string()
}

/// Redact email addresses, then phone numbers.
///
/// Spans are detected on the raw text; each distinct span is replaced
/// everywhere it occurs.
pub fn scrub_pii(text: &str) -> (String, Vec<String>) {
    let mut redactions = Vec::new();
    let mut clean = text.to_string();

    for pattern in [&*EMAIL_RE, &*PHONE_RE] {
        for m in pattern.find_iter(text) {
            let span = m.as_str().to_string();
            clean = clean.replace(&span, REDACTED);
            redactions.push(span);
        }
    }

    (clean, redactions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_text_passes_through() {
        let n = normalize("please top up my wallet");
        assert_eq!(n.text, "please top up my wallet");
        assert_eq!(n.lang, "en");
        assert!(n.redactions.is_empty());
    }

    #[test]
    fn email_is_redacted() {
        let (clean, red) = scrub_pii("mail me at jane.doe@example.com thanks");
        assert_eq!(clean, "mail me at <redacted> thanks");
        assert_eq!(red, vec!["jane.doe@example.com"]);
    }

    #[test]
    fn phone_is_redacted() {
        let (clean, red) = scrub_pii("call +44 7700 900123 today");
        assert!(!clean.contains("7700"), "got {clean}");
        assert!(clean.contains(REDACTED));
        assert_eq!(red.len(), 1);
    }

    #[test]
    fn short_numbers_survive() {
        let (clean, red) = scrub_pii("booking 12345 for 2 nights");
        assert_eq!(clean, "booking 12345 for 2 nights");
        assert!(red.is_empty());
    }

    #[test]
    fn email_and_phone_both_recorded_in_order() {
        let n = normalize("a@b.co or 555-123-4567");
        assert_eq!(n.redactions.len(), 2);
        assert_eq!(n.redactions[0], "a@b.co");
        assert!(n.text.matches(REDACTED).count() == 2, "got {}", n.text);
    }
}
