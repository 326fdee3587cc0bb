//! Property-based tests for the understanding pipeline.
//!
//! These verify invariants that must hold for arbitrary input text:
//! totality (every non-empty utterance yields at least one event),
//! determinism, span bounds, and threshold monotonicity.

use parlance::model::{MockIntentModel, MockSpanModel};
use parlance::prelude::*;
use parlance::{
    DuContext, EntityTypeMeta, OwnedExpressions, RawExpression, SlotMeta, Token,
};
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

fn expr(utterance: &str) -> RawExpression {
    RawExpression {
        utterance: utterance.to_string(),
        ..RawExpression::default()
    }
}

fn small_schema() -> StaticSchema {
    let mut schema = StaticSchema::new("en");
    schema.add_entity(
        "AccountType",
        EntityTypeMeta {
            recognizers: vec![parlance::RecognizerKind::MentionIndex],
            ..EntityTypeMeta::default()
        },
        HashMap::from([
            ("saving's".to_string(), vec!["savings".to_string()]),
            ("checking".to_string(), vec!["checking".to_string()]),
        ]),
    );
    schema.add_frame(
        "banking.CheckBalance",
        vec![SlotMeta {
            label: "account_type".to_string(),
            slot_type: Some("AccountType".to_string()),
            ..SlotMeta::default()
        }],
    );
    schema.add_expressions(OwnedExpressions {
        owner_id: "banking.CheckBalance".to_string(),
        expressions: vec![expr("check my balance")],
    });
    schema.add_expressions(OwnedExpressions {
        owner_id: "faq.Fees".to_string(),
        expressions: vec![expr("tell me about fees")],
    });
    schema
}

fn build_tracker(intent: MockIntentModel, config: TrackerConfig) -> StateTracker {
    let schema: Arc<dyn SchemaProvider> = Arc::new(small_schema());
    let tokenizer: Arc<dyn parlance::Tokenizer> = Arc::new(SimpleTokenizer::new());
    let searcher = ExpressionSearcher::build(
        schema.as_ref(),
        tokenizer.clone(),
        SearcherConfig::default(),
    )
    .expect("index build");
    let mention = MentionIndexRecognizer::build(
        schema.as_ref(),
        tokenizer.clone(),
        MentionIndexConfig::default(),
    );
    StateTracker::new(
        schema,
        tokenizer,
        vec![Box::new(mention)],
        Arc::new(IndexHolder::new(searcher)),
        Arc::new(intent),
        Arc::new(MockSpanModel::unavailable()),
    )
    .with_config(config)
}

/// Frame ids a turn resolved to, flattening clarification sub-frames.
fn resolved_owners(events: &[FrameEvent]) -> HashSet<String> {
    let mut owners = HashSet::new();
    for event in events {
        if event.frames.is_empty() {
            owners.insert(event.qualified_type());
        }
        for sub in &event.frames {
            owners.insert(sub.qualified_type());
        }
    }
    owners
}

proptest! {
    /// INVARIANT: conversion is total. Whitespace-only input yields no
    /// events; anything else yields at least one.
    #[test]
    fn convert_is_total(input in "[a-z' ]{0,40}") {
        let tracker = build_tracker(MockIntentModel::default(), TrackerConfig::default());
        let events = tracker.convert("pt", &input, DialogExpectations::none());
        if input.trim().is_empty() {
            prop_assert!(events.is_empty());
        } else {
            prop_assert!(!events.is_empty());
        }
    }

    /// INVARIANT: identical input produces identical events.
    #[test]
    fn convert_is_deterministic(input in "[a-z' ]{1,40}") {
        let tracker = build_tracker(MockIntentModel::default(), TrackerConfig::default());
        let first = tracker.convert("pt", &input, DialogExpectations::none());
        let second = tracker.convert("pt", &input, DialogExpectations::none());
        prop_assert_eq!(first, second);
    }

    /// INVARIANT: recognized spans stay inside the utterance and are
    /// non-empty, half-open ranges.
    #[test]
    fn recognized_spans_are_in_bounds(input in "[a-z ]{1,60}") {
        let schema = small_schema();
        let tokenizer: Arc<dyn parlance::Tokenizer> = Arc::new(SimpleTokenizer::new());
        let recognizer = MentionIndexRecognizer::build(
            &schema,
            tokenizer.clone(),
            MentionIndexConfig::default(),
        );
        let lowered = input.to_lowercase();
        let tokens: Vec<Token> = tokenizer.tokenize(&lowered);
        let ctx = DuContext::new("pt", lowered.clone(), tokens, DialogExpectations::none());
        let len = lowered.chars().count();

        for span in recognizer.recognize(&ctx) {
            prop_assert!(span.start < span.end, "empty span {span:?}");
            prop_assert!(span.end <= len, "span {span:?} out of bounds for len {len}");
        }
    }

    /// INVARIANT: raising the sure threshold only removes resolutions,
    /// never adds or changes them.
    #[test]
    fn raising_threshold_shrinks_resolutions(s1 in 0.0f64..1.0, s2 in 0.0f64..1.0) {
        let intent = || {
            MockIntentModel::default()
                .with_score("check my balance", s1)
                .with_score("tell me about fees", s2)
        };
        let lenient = build_tracker(intent(), TrackerConfig {
            sure_threshold: 0.3,
            ..TrackerConfig::default()
        });
        let strict = build_tracker(intent(), TrackerConfig {
            sure_threshold: 0.7,
            ..TrackerConfig::default()
        });

        let utterance = "balance fees";
        let lenient_owners = resolved_owners(&lenient.convert("pt", utterance, DialogExpectations::none()));
        let strict_owners = resolved_owners(&strict.convert("pt", utterance, DialogExpectations::none()));

        let strict_real: HashSet<_> = strict_owners
            .iter()
            .filter(|o| !o.starts_with("system."))
            .collect();
        let lenient_real: HashSet<_> = lenient_owners
            .iter()
            .filter(|o| !o.starts_with("system."))
            .collect();
        prop_assert!(strict_real.is_subset(&lenient_real));
    }
}
