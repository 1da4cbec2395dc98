//! Confidence fusion: rule outcome + classifier prediction → [`Decision`].

use autotag_core::{Decision, LabelPair, SourceKind, Thresholds};

use crate::classifier::Prediction;
use crate::rules::{PrecisionTier, RuleOutcome};

/// Stand-in probability for a chosen label the classifier has never seen.
pub const UNSEEN_LABEL_FLOOR: f64 = 0.4;
/// Minimum confidence once any rule has fired.
pub const RULE_HIT_FLOOR: f64 = 0.75;
/// Minimum confidence when a high-precision rule has fired.
pub const HIGH_PRECISION_FLOOR: f64 = 0.9;
/// Ceiling for pairs outside the allowed table.
pub const INCOHERENT_CAP: f64 = 0.4;

/// Fuse both signals into one decision and route it.
///
/// Rule labels win per dimension; otherwise the classifier's argmax is used.
/// An incoherent pair is capped even when rules fired.
pub fn fuse(rules: &RuleOutcome, prediction: &Prediction, thresholds: &Thresholds) -> Decision {
    let guess = prediction.top_guess();
    let labels = LabelPair {
        service_type: rules.service_type.or(guess.service_type),
        category: rules.category.or(guess.category),
    };

    let svc_p = labels
        .service_type
        .and_then(|s| prediction.service.get(s))
        .unwrap_or(UNSEEN_LABEL_FLOOR);
    let cat_p = labels
        .category
        .and_then(|c| prediction.category.get(c))
        .unwrap_or(UNSEEN_LABEL_FLOOR);
    let mut confidence = svc_p.min(cat_p);

    let source = if rules.has_hits() {
        confidence = confidence.max(RULE_HIT_FLOOR);
        if rules.precision_hint == PrecisionTier::High {
            confidence = confidence.max(HIGH_PRECISION_FLOOR);
        }
        SourceKind::Rule
    } else {
        SourceKind::Ml
    };

    if !labels.is_coherent() {
        confidence = confidence.min(INCOHERENT_CAP);
    }
    let confidence = confidence.clamp(0.0, 1.0);

    Decision {
        labels,
        confidence,
        source,
        action: thresholds.route(confidence),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Distribution;
    use autotag_core::{Category, RoutingAction, ServiceType};

    fn prediction(
        service: Vec<(ServiceType, f64)>,
        category: Vec<(Category, f64)>,
    ) -> Prediction {
        Prediction {
            service: Distribution::new(service),
            category: Distribution::new(category),
        }
    }

    fn wallet_topup_prediction() -> Prediction {
        prediction(
            vec![(ServiceType::Wallet, 0.7), (ServiceType::Flight, 0.3)],
            vec![(Category::TopUp, 0.6), (Category::Withdraw, 0.4)],
        )
    }

    fn no_rules() -> RuleOutcome {
        RuleOutcome::default()
    }

    #[test]
    fn ml_only_takes_min_of_chosen_probabilities() {
        let d = fuse(&no_rules(), &wallet_topup_prediction(), &Thresholds::default());
        assert_eq!(d.labels, LabelPair::new(ServiceType::Wallet, Category::TopUp));
        assert_eq!(d.source, SourceKind::Ml);
        assert!((d.confidence - 0.6).abs() < 1e-9);
        assert_eq!(d.action, RoutingAction::Llm);
    }

    #[test]
    fn high_precision_rule_hit_autocommits() {
        let rules = RuleOutcome {
            service_type: Some(ServiceType::Wallet),
            category: Some(Category::TopUp),
            hits: vec!["svc_wallet".into(), "cat_topup".into()],
            precision_hint: PrecisionTier::High,
        };
        let d = fuse(&rules, &wallet_topup_prediction(), &Thresholds::default());
        assert_eq!(d.source, SourceKind::Rule);
        assert_eq!(d.labels, LabelPair::new(ServiceType::Wallet, Category::TopUp));
        assert!(d.confidence >= 0.9);
        assert_eq!(d.action, RoutingAction::Auto);
    }

    #[test]
    fn normal_rule_hit_raises_to_floor() {
        let rules = RuleOutcome {
            category: Some(Category::Withdraw),
            hits: vec!["cat_withdraw".into()],
            ..Default::default()
        };
        let d = fuse(&rules, &wallet_topup_prediction(), &Thresholds::default());
        assert_eq!(d.labels, LabelPair::new(ServiceType::Wallet, Category::Withdraw));
        assert_eq!(d.source, SourceKind::Rule);
        assert!((d.confidence - RULE_HIT_FLOOR).abs() < 1e-9);
        assert_eq!(d.action, RoutingAction::Llm);
    }

    #[test]
    fn rule_label_overrides_classifier() {
        let rules = RuleOutcome {
            service_type: Some(ServiceType::Flight),
            hits: vec!["svc_flight".into()],
            ..Default::default()
        };
        let d = fuse(&rules, &wallet_topup_prediction(), &Thresholds::default());
        assert_eq!(d.labels.service_type, Some(ServiceType::Flight));
        // classifier category guess fills the other side
        assert_eq!(d.labels.category, Some(Category::TopUp));
    }

    #[test]
    fn incoherent_pair_is_capped_even_with_rules() {
        let rules = RuleOutcome {
            service_type: Some(ServiceType::Visa),
            category: Some(Category::TopUp),
            hits: vec!["svc_visa".into(), "cat_topup".into()],
            precision_hint: PrecisionTier::High,
        };
        let d = fuse(&rules, &wallet_topup_prediction(), &Thresholds::default());
        assert!(d.confidence <= INCOHERENT_CAP);
        assert_eq!(d.action, RoutingAction::Clarify);
        assert_eq!(d.source, SourceKind::Rule);
    }

    #[test]
    fn placeholder_side_is_never_capped() {
        let rules = RuleOutcome {
            service_type: Some(ServiceType::Other),
            category: Some(Category::TopUp),
            hits: vec!["svc_other".into()],
            precision_hint: PrecisionTier::High,
        };
        let d = fuse(&rules, &wallet_topup_prediction(), &Thresholds::default());
        assert!(d.confidence >= HIGH_PRECISION_FLOOR);
    }

    #[test]
    fn unseen_label_uses_floor() {
        let rules = RuleOutcome {
            service_type: Some(ServiceType::Hotel),
            hits: vec!["svc_hotel".into()],
            ..Default::default()
        };
        // Hotel was never fit; floor 0.4 enters the min, then the rule floor lifts it.
        let p = prediction(
            vec![(ServiceType::Flight, 1.0)],
            vec![(Category::Cancellation, 0.9)],
        );
        let d = fuse(&rules, &p, &Thresholds::default());
        assert!((d.confidence - RULE_HIT_FLOOR).abs() < 1e-9);

        let d = fuse(&no_rules(), &prediction(vec![], vec![]), &Thresholds::default());
        assert_eq!(d.labels, LabelPair::default());
        assert!((d.confidence - UNSEEN_LABEL_FLOOR).abs() < 1e-9);
        assert_eq!(d.action, RoutingAction::Clarify);
    }

    #[test]
    fn incoherent_ml_guess_never_autocommits() {
        let p = prediction(
            vec![(ServiceType::Esim, 0.99)],
            vec![(Category::Withdraw, 0.99)],
        );
        let d = fuse(&no_rules(), &p, &Thresholds::default());
        assert_ne!(d.action, RoutingAction::Auto);
        assert!(d.confidence <= INCOHERENT_CAP);
    }

    #[test]
    fn respects_custom_thresholds() {
        let t = Thresholds::new(0.5, 0.2).unwrap();
        let d = fuse(&no_rules(), &wallet_topup_prediction(), &t);
        assert_eq!(d.action, RoutingAction::Auto);
    }
}
