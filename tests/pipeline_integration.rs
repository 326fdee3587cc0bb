//! End-to-end pipeline tests: schema + recognizers + index + mock models
//! wired into a full tracker, driven through `convert`.

use parlance::model::{
    MockIntentModel, MockSpanModel, ModelToken, SlotClassProbs, SpanModelOutput,
};
use parlance::prelude::*;
use parlance::{sys, EntityTypeMeta, OwnedExpressions, RawExpression, SlotMeta, DONT_CARE};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

// =============================================================================
// Fixture
// =============================================================================

fn expr(utterance: &str) -> RawExpression {
    RawExpression {
        utterance: utterance.to_string(),
        ..RawExpression::default()
    }
}

fn banking_schema() -> StaticSchema {
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
    schema.add_entity("Nickname", EntityTypeMeta::default(), HashMap::new());
    schema.add_frame(
        "banking.CheckBalance",
        vec![SlotMeta {
            label: "account_type".to_string(),
            triggers: vec!["account type".to_string()],
            slot_type: Some("AccountType".to_string()),
            ..SlotMeta::default()
        }],
    );
    schema.add_frame(
        "banking.FreezeAccounts",
        vec![SlotMeta {
            label: "accounts".to_string(),
            slot_type: Some("AccountType".to_string()),
            multi_value: true,
            ..SlotMeta::default()
        }],
    );
    schema.add_frame(
        "profile.SetNickname",
        vec![SlotMeta {
            label: "nickname".to_string(),
            slot_type: Some("Nickname".to_string()),
            ..SlotMeta::default()
        }],
    );
    schema.add_expressions(OwnedExpressions {
        owner_id: "banking.CheckBalance".to_string(),
        expressions: vec![
            expr("check my balance"),
            expr("what's the balance of my $account_type$ account"),
        ],
    });
    schema.add_expressions(OwnedExpressions {
        owner_id: "faq.Fees".to_string(),
        expressions: vec![expr("tell me about fees")],
    });
    schema
}

fn build_tracker(intent: MockIntentModel, span_model: MockSpanModel) -> StateTracker {
    let _ = env_logger::builder().is_test(true).try_init();
    let schema: Arc<dyn SchemaProvider> = Arc::new(banking_schema());
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
        Arc::new(span_model),
    )
}

// =============================================================================
// Expectation-scoped extraction
// =============================================================================

#[test]
fn single_token_mention_fills_expected_slot_with_normalized_value() {
    let tracker = build_tracker(MockIntentModel::default(), MockSpanModel::unavailable());
    let expectations = DialogExpectations::from_frames(vec![ExpectedFrame::with_slot(
        "banking.CheckBalance",
        "account_type",
    )]);

    let events = tracker.convert("it", "Savings", expectations);

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].qualified_type(), "banking.CheckBalance");
    let slot = &events[0].slots[0];
    assert_eq!(slot.attribute, "account_type");
    assert_eq!(slot.value, "saving's");
    assert_eq!(slot.orig_value.as_deref(), Some("savings"));
    assert_eq!(slot.entity_type.as_deref(), Some("AccountType"));
}

#[test]
fn model_span_and_recognizer_span_merge_on_exact_range() {
    // "my savings account": the span model proposes chars 3..10, which is
    // exactly the recognized AccountType mention. The merged span must keep
    // the recognizer's normalized value.
    let output = SpanModelOutput {
        tokens: vec![
            ModelToken {
                text: "my".to_string(),
                start: 0,
                end: 2,
            },
            ModelToken {
                text: "savings".to_string(),
                start: 3,
                end: 10,
            },
            ModelToken {
                text: "account".to_string(),
                start: 11,
                end: 18,
            },
        ],
        class_probs: vec![SlotClassProbs {
            no_mention: 0.05,
            has_value: 0.9,
            dont_care: 0.05,
        }],
        start_logits: vec![vec![0.1, 5.0, 0.2]],
        end_logits: vec![vec![0.0, 4.0, 0.3]],
    };
    let tracker = build_tracker(
        MockIntentModel::default(),
        MockSpanModel::with_output(output),
    );
    let expectations = DialogExpectations::from_frames(vec![ExpectedFrame::with_slot(
        "banking.CheckBalance",
        "account_type",
    )]);

    let events = tracker.convert("it", "my savings account", expectations);

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].qualified_type(), "banking.CheckBalance");
    assert_eq!(events[0].slots.len(), 1);
    let slot = &events[0].slots[0];
    assert_eq!(slot.value, "saving's");
    assert_eq!(slot.orig_value.as_deref(), Some("savings"));
}

#[test]
fn model_only_span_fills_slot_with_raw_text() {
    // No recognizer covers Nickname; the model span alone carries the value.
    let output = SpanModelOutput {
        tokens: vec![
            ModelToken {
                text: "call".to_string(),
                start: 0,
                end: 4,
            },
            ModelToken {
                text: "me".to_string(),
                start: 5,
                end: 7,
            },
            ModelToken {
                text: "butterbean".to_string(),
                start: 8,
                end: 18,
            },
        ],
        class_probs: vec![SlotClassProbs {
            no_mention: 0.1,
            has_value: 0.85,
            dont_care: 0.05,
        }],
        start_logits: vec![vec![0.0, 0.1, 6.0]],
        end_logits: vec![vec![0.0, 0.1, 5.0]],
    };
    let tracker = build_tracker(
        MockIntentModel::default(),
        MockSpanModel::with_output(output),
    );
    let expectations = DialogExpectations::from_frames(vec![ExpectedFrame::with_slot(
        "profile.SetNickname",
        "nickname",
    )]);

    let events = tracker.convert("it", "call me butterbean", expectations);

    assert_eq!(events[0].qualified_type(), "profile.SetNickname");
    assert_eq!(events[0].slots[0].value, "butterbean");
    assert_eq!(events[0].slots[0].attribute, "nickname");
}

#[test]
fn raw_string_slot_swallows_whole_utterance_as_last_resort() {
    let tracker = build_tracker(MockIntentModel::default(), MockSpanModel::unavailable());
    let mut expected = ExpectedFrame::with_slot("notes.AddNote", "body");
    expected.slot_type = Some(sys::STRING.to_string());
    let expectations = DialogExpectations::from_frames(vec![expected]);

    let events = tracker.convert("it", "remind me that parking is on level 4", expectations);

    assert_eq!(events[0].qualified_type(), "notes.AddNote");
    assert_eq!(events[0].slots[0].attribute, "body");
    assert_eq!(events[0].slots[0].value, "remind me that parking is on level 4");
}

#[test]
fn dont_care_sentinel_round_trips_to_dialog_manager() {
    let mut schema = banking_schema();
    schema.add_expressions(OwnedExpressions {
        owner_id: sys::DONT_CARE.to_string(),
        expressions: vec![expr("anything is fine")],
    });
    let schema: Arc<dyn SchemaProvider> = Arc::new(schema);
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
    let tracker = StateTracker::new(
        schema,
        tokenizer,
        vec![Box::new(mention)],
        Arc::new(IndexHolder::new(searcher)),
        Arc::new(MockIntentModel::default()),
        Arc::new(MockSpanModel::unavailable()),
    );

    let mut expected = ExpectedFrame::with_slot("banking.CheckBalance", "account_type");
    expected.allow_dont_care = true;
    let events = tracker.convert(
        "it",
        "anything is fine",
        DialogExpectations::from_frames(vec![expected]),
    );

    assert_eq!(events[0].qualified_type(), "banking.CheckBalance");
    assert_eq!(events[0].slots[0].value, DONT_CARE);
}

#[test]
fn single_value_slot_keeps_only_best_span() {
    // Two non-overlapping AccountType mentions compete for one
    // single-value slot; exactly one survives.
    let tracker = build_tracker(MockIntentModel::default(), MockSpanModel::unavailable());
    let expectations = DialogExpectations::from_frames(vec![ExpectedFrame::with_slot(
        "banking.CheckBalance",
        "account_type",
    )]);

    let events = tracker.convert("it", "savings and checking", expectations);

    assert_eq!(events[0].qualified_type(), "banking.CheckBalance");
    assert_eq!(events[0].slots.len(), 1);
    assert_eq!(events[0].slots[0].value, "saving's");
}

#[test]
fn multi_value_slot_keeps_all_non_overlapping_spans() {
    let tracker = build_tracker(MockIntentModel::default(), MockSpanModel::unavailable());
    let expectations = DialogExpectations::from_frames(vec![ExpectedFrame::with_slot(
        "banking.FreezeAccounts",
        "accounts",
    )]);

    let events = tracker.convert("it", "savings and checking", expectations);

    assert_eq!(events[0].qualified_type(), "banking.FreezeAccounts");
    let values: Vec<&str> = events[0].slots.iter().map(|s| s.value.as_str()).collect();
    assert_eq!(values, vec!["saving's", "checking"]);
    // Kept spans never overlap.
    let mut seen: Vec<(usize, usize)> = Vec::new();
    for slot in &events[0].slots {
        let orig = slot.orig_value.as_deref().unwrap();
        let start = "savings and checking".find(orig).unwrap();
        let range = (start, start + orig.len());
        for prior in &seen {
            assert!(range.1 <= prior.0 || prior.1 <= range.0);
        }
        seen.push(range);
    }
}

// =============================================================================
// Generic path
// =============================================================================

#[test]
fn open_turn_without_understanding_is_terminal_not_silent() {
    let tracker = build_tracker(MockIntentModel::default(), MockSpanModel::unavailable());
    let events = tracker.convert("it", "colorless green ideas", DialogExpectations::none());
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].qualified_type(), sys::DONT_UNDERSTAND);
}

#[test]
fn competing_frames_surface_as_clarification() {
    let intent = MockIntentModel::default()
        .with_score("check my balance", 0.95)
        .with_score("tell me about fees", 0.9);
    let tracker = build_tracker(intent, MockSpanModel::unavailable());

    let events = tracker.convert("it", "balance fees", DialogExpectations::none());

    assert_eq!(events[0].qualified_type(), sys::INTENT_CLARIFICATION);
    assert_eq!(events[0].frames.len(), 2);
}

// =============================================================================
// Concurrency
// =============================================================================

#[test]
fn tracker_is_send_sync() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<StateTracker>();
    assert_send_sync::<IndexHolder>();
}

#[test]
fn concurrent_turns_share_one_tracker() {
    let intent = MockIntentModel::default().with_score("check my balance", 0.9);
    let tracker = Arc::new(build_tracker(intent, MockSpanModel::unavailable()));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || {
                tracker.convert(&format!("session-{i}"), "balance please", DialogExpectations::none())
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for events in &results {
        assert_eq!(events, &results[0]);
        assert_eq!(events[0].qualified_type(), "banking.CheckBalance");
    }
}

#[test]
fn index_swap_is_atomic_for_readers() {
    let schema_a = banking_schema();
    let mut schema_b = banking_schema();
    schema_b.add_expressions(OwnedExpressions {
        owner_id: "cards.ReportLost".to_string(),
        expressions: vec![expr("i lost my card")],
    });
    let tokenizer: Arc<dyn parlance::Tokenizer> = Arc::new(SimpleTokenizer::new());

    let holder = Arc::new(IndexHolder::new(
        ExpressionSearcher::build(&schema_a, tokenizer.clone(), SearcherConfig::default())
            .expect("index build"),
    ));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let holder = Arc::clone(&holder);
            thread::spawn(move || {
                for _ in 0..200 {
                    // A reader sees either the old or the new index whole,
                    // never a partial one.
                    let _ = holder.get().search(
                        "balance please",
                        &DialogExpectations::none(),
                        &[],
                    );
                }
            })
        })
        .collect();

    holder.swap(
        ExpressionSearcher::build(&schema_b, tokenizer, SearcherConfig::default())
            .expect("index build"),
    );
    for r in readers {
        r.join().unwrap();
    }

    let post = holder
        .get()
        .search("i lost my card", &DialogExpectations::none(), &[]);
    assert!(post.iter().any(|d| d.owner_id == "cards.ReportLost"));
}
