//! Expression index and context-scoped searcher.
//!
//! Every declared trigger expression becomes one indexed document. Three
//! derived forms are computed at indexing time:
//!
//! - **typed expression**: every `$slotName$` placeholder replaced by the
//!   slot's declared type, used for exact-match comparison;
//! - **probe**: placeholders replaced by slot trigger phrases, handed to
//!   the neural intent model (robust across languages);
//! - **context keys**: a frame-context key for the expression's declared
//!   context (or the literal `"default"`), plus one extra key per declared
//!   subtype of the context frame, so an expression scoped to a supertype
//!   also matches when the active expectation is a subtype.
//!
//! A query is boolean: a free-text match against the typed-expression field
//! AND a context match (`"default"` OR any active expectation's key).
//! Scores are normalized by the top score; a per-owner-frame cap keeps one
//! verbose frame from drowning out the rest.
//!
//! The index is built once per agent version and shared read-only across
//! turns; [`IndexHolder`] swaps the whole index on rebuild so readers never
//! observe a partially built one.

use crate::context::DialogExpectations;
use crate::error::{Error, Result};
use crate::schema::{RawContext, SchemaProvider, SlotMeta, TypeResolver};
use crate::span::SpanInfo;
use crate::tokenizer::Tokenizer;
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$([A-Za-z_][A-Za-z0-9_.]*)\$").unwrap());

/// Context key for expressions with no declared context.
pub const DEFAULT_CONTEXT: &str = "default";

/// Frame-context key for a frame id.
#[must_use]
pub fn context_key(frame: &str) -> String {
    format!(r#"{{"frame_id": "{frame}"}}"#)
}

/// Searcher tuning constants.
#[derive(Debug, Clone)]
pub struct SearcherConfig {
    /// Keep at most this many top documents per distinct owner frame.
    pub owner_cap: usize,
    /// Add a small boost when a referenced slot type has a recognized span.
    pub slot_type_boost: f64,
}

impl Default for SearcherConfig {
    fn default() -> Self {
        Self {
            owner_cap: 4,
            slot_type_boost: 0.1,
        }
    }
}

/// One indexed trigger expression (static, shared across queries).
#[derive(Debug, Clone)]
struct IndexedDoc {
    owner_id: String,
    template: String,
    typed_expression: String,
    probe: String,
    slot_names: Vec<String>,
    slot_types: Vec<String>,
    context: Option<RawContext>,
    context_keys: Vec<String>,
    entailed_slots: Vec<String>,
    label: Option<String>,
    function_slot: Option<String>,
}

/// One retrieval candidate, created fresh per query and discarded after
/// the turn.
#[derive(Debug, Clone)]
pub struct ScoredDocument {
    /// Owner frame id.
    pub owner_id: String,
    /// Raw utterance template as declared.
    pub template: String,
    /// Template with placeholders replaced by slot types.
    pub typed_expression: String,
    /// Probe string handed to the neural intent model.
    pub probe: String,
    /// Qualified slot names the template mentions.
    pub slot_names: Vec<String>,
    /// Slot types the template references.
    pub slot_types: Vec<String>,
    /// Declared context requirement, if any.
    pub context: Option<RawContext>,
    /// "Entailed" (partially-applied) slot names.
    pub entailed_slots: Vec<String>,
    /// Declared label, if any.
    pub label: Option<String>,
    /// Function-slot marker, if any.
    pub function_slot: Option<String>,
    /// Retrieval (later: re-ranked) score.
    pub score: f64,
    /// Set during the exact-match pass.
    pub exact_match: bool,
}

impl ScoredDocument {
    /// Comma-joined qualified slot names, as stored in the index field.
    #[must_use]
    pub fn joined_slot_names(&self) -> String {
        self.slot_names.join(",")
    }
}

/// Walk a (possibly dotted) slot path from `owner`, returning the final
/// segment's metadata.
fn slot_meta_for_path(
    schema: &dyn SchemaProvider,
    resolver: &mut TypeResolver<'_>,
    owner: &str,
    path: &str,
) -> Option<SlotMeta> {
    let mut frame = owner.to_string();
    let segments: Vec<&str> = path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        let meta = schema
            .frame_slots(&frame)
            .into_iter()
            .find(|s| s.label == *segment)?;
        if i + 1 == segments.len() {
            return Some(meta);
        }
        frame = resolver.slot_type(&frame, segment)?;
    }
    None
}

/// In-memory inverted index over declared trigger expressions.
pub struct ExpressionSearcher {
    config: SearcherConfig,
    tokenizer: Arc<dyn Tokenizer>,
    docs: Vec<IndexedDoc>,
    /// token -> (doc id, term frequency)
    postings: HashMap<String, Vec<(usize, usize)>>,
}

impl ExpressionSearcher {
    /// Build the index from the schema's expression corpus.
    pub fn build(
        schema: &dyn SchemaProvider,
        tokenizer: Arc<dyn Tokenizer>,
        config: SearcherConfig,
    ) -> Result<Self> {
        let mut resolver = TypeResolver::new(schema);
        let mut docs = Vec::new();

        for owned in schema.expressions() {
            for expr in &owned.expressions {
                if expr.utterance.trim().is_empty() {
                    return Err(Error::index(format!(
                        "empty expression declared for {}",
                        owned.owner_id
                    )));
                }
                let mut slot_names = Vec::new();
                let mut slot_types = Vec::new();
                let mut typed = String::new();
                let mut probe = String::new();
                let mut last = 0;
                for caps in PLACEHOLDER.captures_iter(&expr.utterance) {
                    let whole = caps.get(0).unwrap();
                    let name = &caps[1];
                    typed.push_str(&expr.utterance[last..whole.start()]);
                    probe.push_str(&expr.utterance[last..whole.start()]);
                    last = whole.end();

                    slot_names.push(name.to_string());
                    let slot_type = resolver.resolve_path(&owned.owner_id, name);
                    let meta =
                        slot_meta_for_path(schema, &mut resolver, &owned.owner_id, name);
                    match &slot_type {
                        Some(ty) => {
                            typed.push_str(ty);
                            slot_types.push(ty.clone());
                        }
                        None => typed.push_str(name),
                    }
                    // Probe prefers a trigger phrase; the slot label reads
                    // naturally enough as a fallback.
                    let trigger = meta
                        .as_ref()
                        .and_then(|m| m.triggers.first().cloned())
                        .or_else(|| meta.as_ref().map(|m| m.label.clone()))
                        .unwrap_or_else(|| name.to_string());
                    probe.push_str(&trigger);
                }
                typed.push_str(&expr.utterance[last..]);
                probe.push_str(&expr.utterance[last..]);

                let mut context_keys = Vec::new();
                match &expr.context {
                    Some(ctx) => {
                        context_keys.push(context_key(&ctx.frame_id));
                        for subtype in schema.subtypes(&ctx.frame_id) {
                            context_keys.push(context_key(&subtype));
                        }
                    }
                    None => context_keys.push(DEFAULT_CONTEXT.to_string()),
                }

                docs.push(IndexedDoc {
                    owner_id: owned.owner_id.clone(),
                    template: expr.utterance.clone(),
                    typed_expression: typed,
                    probe,
                    slot_names,
                    slot_types,
                    context: expr.context.clone(),
                    context_keys,
                    entailed_slots: expr.partial_application.clone(),
                    label: expr.label.clone(),
                    function_slot: expr.function_slot.clone(),
                });
            }
        }

        let mut postings: HashMap<String, Vec<(usize, usize)>> = HashMap::new();
        for (doc_id, doc) in docs.iter().enumerate() {
            let mut counts: HashMap<String, usize> = HashMap::new();
            for token in tokenizer.tokenize(&doc.typed_expression) {
                *counts.entry(token.text).or_insert(0) += 1;
            }
            let mut counts: Vec<(String, usize)> = counts.into_iter().collect();
            counts.sort();
            for (token, tf) in counts {
                postings.entry(token).or_default().push((doc_id, tf));
            }
        }

        debug!("expression index built: {} documents", docs.len());
        Ok(Self {
            config,
            tokenizer,
            docs,
            postings,
        })
    }

    /// Number of indexed expressions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// Whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Retrieve candidate expressions for an utterance under the active
    /// dialog context.
    ///
    /// Results are ordered by descending normalized score; at most
    /// `owner_cap` documents are kept per distinct owner frame, applied
    /// strictly in score order.
    #[must_use]
    pub fn search(
        &self,
        utterance: &str,
        expectations: &DialogExpectations,
        recognized: &[SpanInfo],
    ) -> Vec<ScoredDocument> {
        let mut allowed: HashSet<String> = HashSet::new();
        allowed.insert(DEFAULT_CONTEXT.to_string());
        for frame in expectations.active_frames() {
            allowed.insert(context_key(&frame.frame));
        }

        let recognized_types: HashSet<&str> =
            recognized.iter().map(|s| s.entity_type.as_str()).collect();

        let doc_count = self.docs.len().max(1) as f64;
        let mut scores: HashMap<usize, f64> = HashMap::new();
        for token in self.tokenizer.tokenize(utterance) {
            let Some(postings) = self.postings.get(&token.text) else {
                continue;
            };
            let idf = (1.0 + doc_count / postings.len() as f64).ln();
            for (doc_id, tf) in postings {
                *scores.entry(*doc_id).or_insert(0.0) += *tf as f64 * idf;
            }
        }

        let mut hits: Vec<(usize, f64)> = scores
            .into_iter()
            .filter(|(doc_id, _)| {
                self.docs[*doc_id]
                    .context_keys
                    .iter()
                    .any(|k| allowed.contains(k))
            })
            .map(|(doc_id, mut score)| {
                let doc = &self.docs[doc_id];
                if doc
                    .slot_types
                    .iter()
                    .any(|t| recognized_types.contains(t.as_str()))
                {
                    score += self.config.slot_type_boost;
                }
                (doc_id, score)
            })
            .collect();
        // Doc id as tie-break keeps declaration order stable.
        hits.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(&b.0)));

        let top = match hits.first() {
            Some((_, top)) if *top > 0.0 => *top,
            _ => return Vec::new(),
        };

        let mut per_owner: HashMap<&str, usize> = HashMap::new();
        let mut results = Vec::new();
        for (doc_id, score) in hits {
            let doc = &self.docs[doc_id];
            let kept = per_owner.entry(doc.owner_id.as_str()).or_insert(0);
            if *kept >= self.config.owner_cap {
                continue;
            }
            *kept += 1;
            results.push(ScoredDocument {
                owner_id: doc.owner_id.clone(),
                template: doc.template.clone(),
                typed_expression: doc.typed_expression.clone(),
                probe: doc.probe.clone(),
                slot_names: doc.slot_names.clone(),
                slot_types: doc.slot_types.clone(),
                context: doc.context.clone(),
                entailed_slots: doc.entailed_slots.clone(),
                label: doc.label.clone(),
                function_slot: doc.function_slot.clone(),
                score: score / top,
                exact_match: false,
            });
        }
        results
    }
}

/// Read-mostly holder for the shared searcher.
///
/// Many concurrent turns read the same index; rebuilding replaces the whole
/// `Arc` so readers never observe a partially built index.
pub struct IndexHolder {
    inner: RwLock<Arc<ExpressionSearcher>>,
}

impl IndexHolder {
    /// Wrap an initial searcher.
    #[must_use]
    pub fn new(searcher: ExpressionSearcher) -> Self {
        Self {
            inner: RwLock::new(Arc::new(searcher)),
        }
    }

    /// Current searcher.
    #[must_use]
    pub fn get(&self) -> Arc<ExpressionSearcher> {
        self.inner.read().expect("index lock poisoned").clone()
    }

    /// Swap in a freshly built searcher.
    pub fn swap(&self, searcher: ExpressionSearcher) {
        *self.inner.write().expect("index lock poisoned") = Arc::new(searcher);
    }
}
