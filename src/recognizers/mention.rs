//! Mention index recognizer.
//!
//! Recognizes entity mentions purely from declared instance lists and their
//! surface-form expressions, without a neural model. Built once per agent;
//! parse is a per-utterance n-gram scan over two lookup tables:
//!
//! - **full-mention table**: normalized surface text -> `(type, label)`
//!   pairs. Every exact n-gram hit yields one span per pair.
//! - **partial-mention table**: single token -> labels per type. A token hit
//!   yields a partial-match sentinel span only where no full match of the
//!   same type already covers it.
//!
//! Entity hierarchies are handled at build time: a child type's surfaces are
//! also registered under each parent type with a synthetic internal-node
//! label, so asking about the parent resolves to "did the user mention one
//! of my children".
//!
//! Two extractive phrase sets — "don't care" and anaphoric reference — are
//! collected from declared example utterances tagged with the matching
//! context frame and registered like ordinary mentions under their system
//! type.

use crate::context::DuContext;
use crate::events::sys;
use crate::recognizers::EntityRecognizer;
use crate::schema::SchemaProvider;
use crate::span::{RecognizerKind, SpanInfo, INTERNAL_NODE_PREFIX, PARTIAL_MATCH};
use crate::tokenizer::Tokenizer;
use std::collections::HashMap;
use std::sync::Arc;

/// Tuning constants for the mention index.
#[derive(Debug, Clone)]
pub struct MentionIndexConfig {
    /// Maximum n-gram length looked up in the full-mention table.
    pub max_ngram: usize,
    /// Score assigned to full-mention spans.
    pub full_match_score: f64,
    /// Score assigned to partial-match sentinel spans.
    pub partial_match_score: f64,
}

impl Default for MentionIndexConfig {
    fn default() -> Self {
        Self {
            max_ngram: 5,
            full_match_score: 1.0,
            partial_match_score: 0.5,
        }
    }
}

/// In-process mention recognizer over declared entity instances.
pub struct MentionIndexRecognizer {
    config: MentionIndexConfig,
    tokenizer: Arc<dyn Tokenizer>,
    /// normalized surface text -> (entity type, instance label) pairs
    full: HashMap<String, Vec<(String, String)>>,
    /// token -> entity type -> instance labels containing that token
    partial: HashMap<String, HashMap<String, Vec<String>>>,
}

impl MentionIndexRecognizer {
    /// Build the recognizer from schema metadata.
    ///
    /// Registers, for every entity type that declares this recognizer:
    /// each instance label, each of its surface forms, and (for each parent
    /// type) the same surfaces under a synthetic internal-node label.
    /// Don't-care and anaphora phrases are collected from the expression
    /// corpus by context frame.
    #[must_use]
    pub fn build(
        schema: &dyn SchemaProvider,
        tokenizer: Arc<dyn Tokenizer>,
        config: MentionIndexConfig,
    ) -> Self {
        let mut rec = Self {
            config,
            tokenizer,
            full: HashMap::new(),
            partial: HashMap::new(),
        };

        for entity_type in schema.entity_types() {
            let Some(meta) = schema.entity_meta(&entity_type) else {
                continue;
            };
            if !meta.recognizers.contains(&RecognizerKind::MentionIndex) {
                continue;
            }
            for (label, surfaces) in schema.entity_instances(&entity_type) {
                rec.register(&entity_type, &label, &label);
                for surface in &surfaces {
                    rec.register(&entity_type, &label, surface);
                }
                // Hierarchy: a mention of this type also answers for parents.
                for parent in &meta.parents {
                    let internal = format!("{INTERNAL_NODE_PREFIX}{entity_type}");
                    rec.register(parent, &internal, &label);
                    for surface in &surfaces {
                        rec.register(parent, &internal, surface);
                    }
                }
            }
        }

        // Extractive phrase sets from context-tagged example utterances.
        for owned in schema.expressions() {
            for expr in &owned.expressions {
                let Some(ctx) = &expr.context else { continue };
                let special = match ctx.frame_id.as_str() {
                    sys::DONT_CARE => sys::DONT_CARE,
                    sys::THAT_REFERENCE => sys::THAT_REFERENCE,
                    _ => continue,
                };
                rec.register(special, special, &expr.utterance);
            }
        }

        rec
    }

    fn register(&mut self, entity_type: &str, label: &str, surface: &str) {
        let tokens = self.tokenizer.tokenize(surface);
        if tokens.is_empty() {
            return;
        }
        let key = tokens
            .iter()
            .map(|t| t.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");

        let pairs = self.full.entry(key).or_default();
        let pair = (entity_type.to_string(), label.to_string());
        if !pairs.contains(&pair) {
            pairs.push(pair);
        }

        for token in &tokens {
            let labels = self
                .partial
                .entry(token.text.clone())
                .or_default()
                .entry(entity_type.to_string())
                .or_default();
            if !labels.contains(&label.to_string()) {
                labels.push(label.to_string());
            }
        }
    }

    /// All full-mention labels of `entity_type` sharing `token`, used to
    /// surface disambiguation candidates on a partial match.
    #[must_use]
    pub fn find_related_entities(&self, entity_type: &str, token: &str) -> Vec<String> {
        self.partial
            .get(token)
            .and_then(|by_type| by_type.get(entity_type))
            .cloned()
            .unwrap_or_default()
    }
}

impl EntityRecognizer for MentionIndexRecognizer {
    fn recognize(&self, ctx: &DuContext) -> Vec<SpanInfo> {
        let tokens = &ctx.tokens;
        let mut spans: Vec<SpanInfo> = Vec::new();

        // Full matches: every start position, every n-gram length.
        for i in 0..tokens.len() {
            let max_n = self.config.max_ngram.min(tokens.len() - i);
            for n in 1..=max_n {
                let key = tokens[i..i + n]
                    .iter()
                    .map(|t| t.text.as_str())
                    .collect::<Vec<_>>()
                    .join(" ");
                let Some(pairs) = self.full.get(&key) else {
                    continue;
                };
                let start = tokens[i].start;
                let end = tokens[i + n - 1].end;
                for (entity_type, label) in pairs {
                    spans.push(
                        SpanInfo::new(
                            entity_type.clone(),
                            start,
                            end,
                            label.clone(),
                            RecognizerKind::MentionIndex,
                        )
                        .with_score(self.config.full_match_score),
                    );
                }
            }
        }

        // Partial matches: a token hit counts only if no full match of the
        // same type already covers that token's range.
        for token in tokens {
            let Some(by_type) = self.partial.get(&token.text) else {
                continue;
            };
            let mut types: Vec<&String> = by_type.keys().collect();
            types.sort();
            for entity_type in types {
                let covered = spans.iter().any(|s| {
                    !s.is_partial_match()
                        && s.entity_type == *entity_type
                        && s.covers(token.start, token.end)
                });
                if covered {
                    continue;
                }
                spans.push(
                    SpanInfo::new(
                        entity_type.clone(),
                        token.start,
                        token.end,
                        PARTIAL_MATCH,
                        RecognizerKind::MentionIndex,
                    )
                    .with_score(self.config.partial_match_score),
                );
            }
        }

        spans
    }

    fn name(&self) -> &'static str {
        "mention-index"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DialogExpectations;
    use crate::schema::{EntityTypeMeta, OwnedExpressions, RawContext, RawExpression, StaticSchema};
    use crate::tokenizer::SimpleTokenizer;

    fn city_schema() -> StaticSchema {
        let mut schema = StaticSchema::new("en");
        let mut instances = HashMap::new();
        instances.insert(
            "new york".to_string(),
            vec!["new york".to_string(), "nyc".to_string(), "big apple".to_string()],
        );
        instances.insert("york".to_string(), vec!["york".to_string()]);
        schema.add_entity(
            "City",
            EntityTypeMeta {
                recognizers: vec![RecognizerKind::MentionIndex],
                ..EntityTypeMeta::default()
            },
            instances,
        );
        schema
    }

    fn recognizer(schema: &StaticSchema) -> MentionIndexRecognizer {
        MentionIndexRecognizer::build(
            schema,
            Arc::new(SimpleTokenizer::new()),
            MentionIndexConfig::default(),
        )
    }

    fn ctx(utterance: &str) -> DuContext {
        let tokens = SimpleTokenizer::new().tokenize(utterance);
        DuContext::new("s", utterance, tokens, DialogExpectations::none())
    }

    #[test]
    fn test_full_match_emits_span_per_label() {
        let schema = city_schema();
        let rec = recognizer(&schema);
        let spans = rec.recognize(&ctx("fly to nyc tomorrow"));
        let full: Vec<_> = spans.iter().filter(|s| !s.is_partial_match()).collect();
        assert_eq!(full.len(), 1);
        assert_eq!(full[0].entity_type, "City");
        assert_eq!(full[0].value, "new york");
        assert_eq!((full[0].start, full[0].end), (7, 10));
    }

    #[test]
    fn test_unknown_text_yields_no_spans() {
        let schema = city_schema();
        let rec = recognizer(&schema);
        assert!(rec.recognize(&ctx("completely unrelated words")).is_empty());
    }

    #[test]
    fn test_partial_match_not_emitted_when_covered() {
        let schema = city_schema();
        let rec = recognizer(&schema);
        // "new york" fully matches; the tokens "new" and "york" are covered,
        // so no partial sentinel for City should appear at those offsets.
        // "york" alone is also a full match (nested span), still covered.
        let spans = rec.recognize(&ctx("to new york"));
        assert!(spans.iter().any(|s| s.value == "new york"));
        assert!(!spans.iter().any(|s| s.is_partial_match()));
    }

    #[test]
    fn test_partial_match_emitted_when_uncovered() {
        let schema = city_schema();
        let rec = recognizer(&schema);
        // "apple" appears in "big apple" but alone is not a full mention.
        let spans = rec.recognize(&ctx("an apple please"));
        let partial: Vec<_> = spans.iter().filter(|s| s.is_partial_match()).collect();
        assert_eq!(partial.len(), 1);
        assert_eq!(partial[0].entity_type, "City");
        assert_eq!((partial[0].start, partial[0].end), (3, 8));
    }

    #[test]
    fn test_find_related_entities() {
        let schema = city_schema();
        let rec = recognizer(&schema);
        let mut related = rec.find_related_entities("City", "york");
        related.sort();
        assert_eq!(related, vec!["new york".to_string(), "york".to_string()]);
        assert!(rec.find_related_entities("City", "zzz").is_empty());
        assert!(rec.find_related_entities("Country", "york").is_empty());
    }

    #[test]
    fn test_hierarchy_registers_internal_node_on_parent() {
        let mut schema = StaticSchema::new("en");
        let mut instances = HashMap::new();
        instances.insert("tabby".to_string(), vec!["tabby cat".to_string()]);
        schema.add_entity(
            "Cat",
            EntityTypeMeta {
                recognizers: vec![RecognizerKind::MentionIndex],
                parents: vec!["Pet".to_string()],
                ..EntityTypeMeta::default()
            },
            instances,
        );
        schema.add_entity(
            "Pet",
            EntityTypeMeta {
                recognizers: vec![RecognizerKind::MentionIndex],
                children: vec!["Cat".to_string()],
                ..EntityTypeMeta::default()
            },
            HashMap::new(),
        );
        let rec = recognizer(&schema);
        let spans = rec.recognize(&ctx("i have a tabby cat"));
        let pet: Vec<_> = spans.iter().filter(|s| s.entity_type == "Pet").collect();
        assert!(!pet.is_empty());
        assert!(pet
            .iter()
            .all(|s| s.value == format!("{INTERNAL_NODE_PREFIX}Cat")));
        assert!(spans.iter().any(|s| s.entity_type == "Cat" && s.value == "tabby"));
    }

    #[test]
    fn test_dont_care_phrases_from_corpus() {
        let mut schema = city_schema();
        schema.add_expressions(OwnedExpressions {
            owner_id: sys::DONT_CARE.to_string(),
            expressions: vec![RawExpression {
                utterance: "anything is fine".to_string(),
                context: Some(RawContext {
                    frame_id: sys::DONT_CARE.to_string(),
                    attribute_id: None,
                }),
                ..RawExpression::default()
            }],
        });
        let rec = recognizer(&schema);
        let spans = rec.recognize(&ctx("anything is fine"));
        assert!(spans
            .iter()
            .any(|s| s.entity_type == sys::DONT_CARE && !s.is_partial_match()));
    }

    #[test]
    fn test_ngram_longer_than_max_not_matched() {
        let mut schema = StaticSchema::new("en");
        let mut instances = HashMap::new();
        instances.insert(
            "long".to_string(),
            vec!["one two three four five six".to_string()],
        );
        schema.add_entity(
            "Phrase",
            EntityTypeMeta {
                recognizers: vec![RecognizerKind::MentionIndex],
                ..EntityTypeMeta::default()
            },
            instances,
        );
        let rec = recognizer(&schema);
        let spans = rec.recognize(&ctx("one two three four five six"));
        // Six tokens exceeds max_ngram = 5: only partial sentinels remain.
        assert!(spans.iter().all(|s| s.is_partial_match()));
    }
}
