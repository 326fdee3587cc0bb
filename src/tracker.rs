//! State tracker: the top-level understanding algorithm.
//!
//! Single entry point [`StateTracker::convert`]: utterance + dialog
//! expectations in, semantic events out. One turn flows strictly one
//! direction:
//!
//! ```text
//! utterance
//!   │ recognize (mention index + delegated service, merged span map)
//!   ▼
//! recognized spans
//!   │ retrieve (context-scoped expression search, owner cap)
//!   ▼
//! candidates
//!   │ exact-match pass, neural re-rank, requirement zero-out
//!   ▼
//! best frame(s)
//!   │ expectation-aware branching / generic path
//!   ▼
//! slot extraction + overlap resolution
//!   │
//!   ▼
//! semantic events
//! ```
//!
//! Every stage takes an immutable input and returns a freshly scored
//! collection; no mutable document or span state survives a stage boundary.
//! Every failure mode ends in a well-defined terminal event — the dialog
//! manager always gets a turn.

use crate::context::{DialogExpectations, DuContext};
use crate::events::{sys, EntityEvent, FrameEvent};
use crate::index::{IndexHolder, ScoredDocument};
use crate::model::{IntentModel, SpanModel, SpanModelOutput};
use crate::recognizers::EntityRecognizer;
use crate::schema::{SchemaProvider, SlotMeta, TypeResolver};
use crate::span::{ScoredSpan, SpanInfo, DONT_CARE};
use log::{debug, info};
use std::collections::HashSet;
use std::sync::Arc;

/// Tracker tuning constants. All thresholds and bonuses are configurable;
/// defaults mirror the production values.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Re-ranked similarity a candidate must exceed to be kept.
    pub sure_threshold: f64,
    /// Bonus added to candidates flagged as exact matches.
    pub exact_match_bonus: f64,
    /// Bonus for a slot whose trigger placeholder appears in the winning
    /// expression.
    pub mention_bonus: f64,
    /// Bonus for a recognizer span flanked by a declared prefix/suffix word.
    pub affix_bonus: f64,
    /// How many top start/end token positions the span model contributes.
    pub span_top_k: usize,
    /// Mention class probability above which a slot is considered present.
    pub slot_mention_threshold: f64,
    /// Don't-care class probability above which a slot is filled directly.
    pub slot_dont_care_threshold: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            sure_threshold: 0.8,
            exact_match_bonus: 1.0,
            mention_bonus: 2.0,
            affix_bonus: 0.5,
            span_top_k: 5,
            slot_mention_threshold: 0.5,
            slot_dont_care_threshold: 0.5,
        }
    }
}

/// Per-query annotation layered onto a static slot: where it sits, whether
/// the winning expression mentions it, and its expected neighboring words.
struct AnnotatedSlot {
    /// Qualified attribute path from the frame being filled.
    attribute: String,
    meta: SlotMeta,
    /// Declared type resolved through the schema.
    slot_type: Option<String>,
    /// The winning expression's template mentions this slot's placeholder.
    mentioned: bool,
    prefix_words: HashSet<String>,
    suffix_words: HashSet<String>,
}

/// The dialog-understanding orchestrator.
pub struct StateTracker {
    schema: Arc<dyn SchemaProvider>,
    tokenizer: Arc<dyn crate::tokenizer::Tokenizer>,
    recognizers: Vec<Box<dyn EntityRecognizer>>,
    index: Arc<IndexHolder>,
    intent_model: Arc<dyn IntentModel>,
    span_model: Arc<dyn SpanModel>,
    config: TrackerConfig,
}

impl StateTracker {
    /// Create a tracker over pre-built components.
    #[must_use]
    pub fn new(
        schema: Arc<dyn SchemaProvider>,
        tokenizer: Arc<dyn crate::tokenizer::Tokenizer>,
        recognizers: Vec<Box<dyn EntityRecognizer>>,
        index: Arc<IndexHolder>,
        intent_model: Arc<dyn IntentModel>,
        span_model: Arc<dyn SpanModel>,
    ) -> Self {
        Self {
            schema,
            tokenizer,
            recognizers,
            index,
            intent_model,
            span_model,
            config: TrackerConfig::default(),
        }
    }

    /// Override the tuning constants.
    #[must_use]
    pub fn with_config(mut self, config: TrackerConfig) -> Self {
        self.config = config;
        self
    }

    /// Convert one utterance into semantic events.
    ///
    /// Deterministic given the same external-model responses. Empty input
    /// yields no events; every other input yields at least one.
    pub fn convert(
        &self,
        session_id: &str,
        utterance: &str,
        expectations: DialogExpectations,
    ) -> Vec<FrameEvent> {
        let normalized = utterance.trim().to_lowercase();
        if normalized.is_empty() {
            return Vec::new();
        }
        let tokens = self.tokenizer.tokenize(&normalized);
        let mut ctx = DuContext::new(session_id, normalized, tokens, expectations);

        // Recognition: each recognizer scans independently, results merge
        // into the single span map.
        for recognizer in &self.recognizers {
            let spans = recognizer.recognize(&ctx);
            debug!(
                "[{}] {} recognized {} spans",
                ctx.session_id,
                recognizer.name(),
                spans.len()
            );
            ctx.spans.extend(spans);
        }

        // Retrieval, scoped to the active expectation contexts.
        let all_spans: Vec<SpanInfo> = ctx.spans.iter().cloned().collect();
        let mut candidates =
            self.index
                .get()
                .search(&ctx.utterance, &ctx.expectations, &all_spans);
        if !ctx.expectations.allows_dont_care() {
            candidates.retain(|c| c.owner_id != sys::DONT_CARE);
        }

        let candidates = self.mark_exact_matches(&ctx, candidates);
        let candidates = self.rerank(&ctx, candidates);
        let survivors = self.decide(candidates);

        // Expectation-aware branch when the generic result is ambiguous.
        if !ctx.expectations.is_empty() {
            let ambiguous = survivors.len() != 1
                || survivors[0].owner_id.starts_with("system.")
                || ctx.expectations.is_frame_active(&survivors[0].owner_id);
            if ambiguous {
                if let Some(events) = self.handle_expected(&ctx, &survivors) {
                    return events;
                }
            }
        }

        self.generic_path(&ctx, survivors)
    }

    // -------------------------------------------------------------------
    // Exact match
    // -------------------------------------------------------------------

    fn normalize_for_match(&self, text: &str) -> String {
        self.tokenizer
            .tokenize(text)
            .into_iter()
            .map(|t| t.text)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// All surface variants of the utterance: as-is, and with every
    /// combination of one or two recognized entity spans substituted by
    /// their type marker.
    fn match_variants(&self, ctx: &DuContext) -> Vec<String> {
        let mut variants = vec![self.normalize_for_match(&ctx.utterance)];
        let spans: Vec<&SpanInfo> = ctx
            .spans
            .iter()
            .filter(|s| !s.is_partial_match())
            .collect();

        let substitute = |subs: &[&SpanInfo]| -> String {
            // Splice right-to-left so earlier offsets stay valid.
            let mut ordered: Vec<&SpanInfo> = subs.to_vec();
            ordered.sort_by(|a, b| b.start.cmp(&a.start));
            let mut chars: Vec<char> = ctx.utterance.chars().collect();
            for span in ordered {
                let marker: Vec<char> = span.entity_type.chars().collect();
                chars.splice(span.start..span.end, marker);
            }
            chars.into_iter().collect()
        };

        for span in &spans {
            variants.push(self.normalize_for_match(&substitute(&[span])));
        }
        for (i, a) in spans.iter().enumerate() {
            for b in spans.iter().skip(i + 1) {
                if a.overlaps(b.start, b.end) {
                    continue;
                }
                variants.push(self.normalize_for_match(&substitute(&[a, b])));
            }
        }
        variants
    }

    fn mark_exact_matches(
        &self,
        ctx: &DuContext,
        candidates: Vec<ScoredDocument>,
    ) -> Vec<ScoredDocument> {
        let variants = self.match_variants(ctx);
        candidates
            .into_iter()
            .map(|mut doc| {
                let surface = self.normalize_for_match(&doc.typed_expression);
                doc.exact_match = variants.iter().any(|v| *v == surface);
                doc
            })
            .collect()
    }

    // -------------------------------------------------------------------
    // Re-rank
    // -------------------------------------------------------------------

    /// True when a non-partial span of `entity_type` (or, recursively, of
    /// one of its child types) was recognized.
    fn entity_mentioned(&self, ctx: &DuContext, entity_type: &str) -> bool {
        if ctx
            .spans
            .of_type(entity_type)
            .iter()
            .any(|s| !s.is_partial_match())
        {
            return true;
        }
        self.schema
            .entity_meta(entity_type)
            .map(|meta| {
                meta.children
                    .iter()
                    .any(|child| self.entity_mentioned(ctx, child))
            })
            .unwrap_or(false)
    }

    /// Batch the candidate probes through the intent model and produce a
    /// freshly scored collection: similarity, plus the exact-match bonus,
    /// zeroed when a required entity type has no supporting mention.
    fn rerank(&self, ctx: &DuContext, candidates: Vec<ScoredDocument>) -> Vec<ScoredDocument> {
        if candidates.is_empty() {
            return candidates;
        }
        let probes: Vec<String> = candidates.iter().map(|c| c.probe.clone()).collect();
        let sims = self
            .intent_model
            .similarities(self.schema.language(), &ctx.utterance, &probes)
            .unwrap_or_else(|| {
                debug!("[{}] intent model unavailable, degrading", ctx.session_id);
                vec![0.0; candidates.len()]
            });

        let mut rescored: Vec<ScoredDocument> = candidates
            .into_iter()
            .zip(sims)
            .map(|(mut doc, sim)| {
                doc.score = sim;
                if doc.exact_match {
                    doc.score += self.config.exact_match_bonus;
                }
                let required: Vec<&String> = doc
                    .slot_types
                    .iter()
                    .filter(|t| self.schema.is_entity(t))
                    .collect();
                if !required.iter().all(|t| self.entity_mentioned(ctx, t)) {
                    doc.score = 0.0;
                }
                doc
            })
            .collect();
        // Stable: retrieval order breaks ties.
        rescored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        rescored
    }

    /// Threshold and owner-group the re-ranked candidates.
    fn decide(&self, candidates: Vec<ScoredDocument>) -> Vec<ScoredDocument> {
        let exact: Vec<&ScoredDocument> = candidates.iter().filter(|c| c.exact_match).collect();
        let any_sure = candidates
            .iter()
            .any(|c| c.score > self.config.sure_threshold);
        if !any_sure && exact.is_empty() {
            return Vec::new();
        }

        // An exact match wins outright. When several frames exact-match the
        // same utterance, only the first is kept; this under-triggers
        // clarification and is preserved for compatibility.
        if let Some(first) = exact.first() {
            let winner = (*first).clone();
            if let Some(best) = candidates.first() {
                if best.template != winner.template {
                    // Positive/negative pair for future offline tuning.
                    debug!(
                        "exact-match override: positive='{}' negative='{}'",
                        winner.template, best.template
                    );
                }
            }
            return vec![winner];
        }

        let mut seen_owners: HashSet<String> = HashSet::new();
        let mut survivors = Vec::new();
        for doc in candidates {
            if doc.score <= self.config.sure_threshold {
                continue;
            }
            if seen_owners.insert(doc.owner_id.clone()) {
                survivors.push(doc);
            }
        }
        survivors
    }

    // -------------------------------------------------------------------
    // Expectation-aware handling
    // -------------------------------------------------------------------

    fn handle_expected(
        &self,
        ctx: &DuContext,
        survivors: &[ScoredDocument],
    ) -> Option<Vec<FrameEvent>> {
        let best = survivors.first();

        for package in [
            sys::PACKAGE_CONFIRMATION,
            sys::PACKAGE_BOOLEAN_GATE,
            sys::PACKAGE_HAS_MORE,
        ] {
            if let Some(event) = self.resolve_yes_no(ctx, best, package) {
                info!("[{}] resolved yes/no under {package}", ctx.session_id);
                return Some(vec![event]);
            }
        }

        if let Some(events) = self.resolve_dont_care(ctx, best) {
            return Some(events);
        }

        // Slot extraction against the primary expected slot, then every
        // other active frame's slot in activation order.
        for expected in ctx.expectations.active_frames() {
            let Some(slot) = &expected.slot else { continue };
            let winner = best.filter(|d| d.owner_id == expected.frame);
            let slots = self.expected_slot_set(&expected.frame, slot, winner);
            let assignments = self.extract_slots(ctx, &slots, winner);
            if !assignments.is_empty() {
                let mut event = FrameEvent::from_qualified(&expected.frame);
                event.slots = assignments;
                return Some(vec![event]);
            }
        }

        // Last resort: a raw-string expected slot swallows the utterance.
        for expected in ctx.expectations.active_frames() {
            let Some(slot) = &expected.slot else { continue };
            let mut resolver = TypeResolver::new(self.schema.as_ref());
            let declared = expected
                .slot_type
                .clone()
                .or_else(|| resolver.resolve_path(&expected.frame, slot));
            if declared.as_deref() == Some(sys::STRING) {
                let event = FrameEvent::from_qualified(&expected.frame)
                    .with_slot(EntityEvent::new(ctx.utterance.clone(), slot.clone()));
                return Some(vec![event]);
            }
        }

        None
    }

    /// Yes/no resolution for one package: the best candidate's owner is
    /// literally the expected yes/no frame, or an extractively recognized
    /// boolean maps onto it.
    fn resolve_yes_no(
        &self,
        ctx: &DuContext,
        best: Option<&ScoredDocument>,
        package: &str,
    ) -> Option<FrameEvent> {
        // Frames under the package only; a shared prefix without the dot
        // boundary (e.g. "system.confirmationAudit.X") is not this gate.
        let gate_active = ctx.expectations.active_frames().iter().any(|f| {
            f.frame
                .strip_prefix(package)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'))
        });
        if !gate_active {
            return None;
        }

        let yes = sys::qualified(package, sys::YES);
        let no = sys::qualified(package, sys::NO);
        if let Some(best) = best {
            if best.owner_id == yes || best.owner_id == no {
                return Some(FrameEvent::from_qualified(&best.owner_id));
            }
        }
        let boolean = ctx
            .spans
            .of_type(sys::BOOLEAN)
            .iter()
            .find(|s| !s.is_partial_match())?;
        match boolean.value.as_str() {
            "true" => Some(FrameEvent::from_qualified(&yes)),
            "false" => Some(FrameEvent::from_qualified(&no)),
            _ => None,
        }
    }

    /// Abstract "don't care": best candidate is the don't-care frame and an
    /// active expectation both allows it and has an entity-typed slot.
    fn resolve_dont_care(
        &self,
        ctx: &DuContext,
        best: Option<&ScoredDocument>,
    ) -> Option<Vec<FrameEvent>> {
        let best = best?;
        if best.owner_id != sys::DONT_CARE {
            return None;
        }
        let mut resolver = TypeResolver::new(self.schema.as_ref());
        for expected in ctx.expectations.active_frames() {
            if !expected.allow_dont_care {
                continue;
            }
            let Some(slot) = &expected.slot else { continue };
            let declared = expected
                .slot_type
                .clone()
                .or_else(|| resolver.resolve_path(&expected.frame, slot));
            let entity_typed = declared
                .as_deref()
                .is_some_and(|t| self.schema.is_entity(t) || t.starts_with("system."));
            if entity_typed {
                let event = FrameEvent::from_qualified(&expected.frame)
                    .with_slot(EntityEvent::new(DONT_CARE, slot.clone()));
                return Some(vec![event]);
            }
        }
        None
    }

    // -------------------------------------------------------------------
    // Generic path
    // -------------------------------------------------------------------

    fn generic_path(&self, ctx: &DuContext, survivors: Vec<ScoredDocument>) -> Vec<FrameEvent> {
        match survivors.len() {
            0 => {
                info!("[{}] no understanding", ctx.session_id);
                vec![FrameEvent::dont_understand()]
            }
            1 => {
                let winner = &survivors[0];
                let slots = self.winner_slot_set(winner);
                let assignments = self.extract_slots(ctx, &slots, Some(winner));
                let mut event = FrameEvent::from_qualified(&winner.owner_id);
                event.slots = assignments;
                // Entailed (partially-applied) slots become synthetic
                // context-fill assignments.
                for entailed in &winner.entailed_slots {
                    event
                        .slots
                        .push(EntityEvent::new(sys::CONTEXT_FILL, entailed.clone()));
                }
                vec![event]
            }
            _ => {
                let mut clarification = FrameEvent::from_qualified(sys::INTENT_CLARIFICATION);
                for doc in &survivors {
                    clarification
                        .frames
                        .push(FrameEvent::from_qualified(&doc.owner_id));
                }
                vec![clarification]
            }
        }
    }

    // -------------------------------------------------------------------
    // Slot extraction
    // -------------------------------------------------------------------

    /// Expected neighboring words for a slot, computed from the owner's
    /// declared templates: the token immediately before/after each
    /// `$slot$` placeholder.
    fn affix_words(&self, frame: &str, slot: &str) -> (HashSet<String>, HashSet<String>) {
        let needle = format!("${slot}$");
        let mut prefix = HashSet::new();
        let mut suffix = HashSet::new();
        for owned in self.schema.expressions() {
            if owned.owner_id != frame {
                continue;
            }
            for expr in &owned.expressions {
                let Some(pos) = expr.utterance.find(&needle) else {
                    continue;
                };
                let before = &expr.utterance[..pos];
                if let Some(word) = self.tokenizer.tokenize(before).pop() {
                    prefix.insert(word.text);
                }
                let after = &expr.utterance[pos + needle.len()..];
                if let Some(word) = self.tokenizer.tokenize(after).into_iter().next() {
                    suffix.insert(word.text);
                }
            }
        }
        (prefix, suffix)
    }

    fn annotate_slot(
        &self,
        frame: &str,
        attribute: &str,
        meta: SlotMeta,
        winner: Option<&ScoredDocument>,
    ) -> AnnotatedSlot {
        let mut resolver = TypeResolver::new(self.schema.as_ref());
        let slot_type = meta
            .slot_type
            .clone()
            .or_else(|| resolver.resolve_path(frame, attribute));
        let mentioned = winner.is_some_and(|d| d.slot_names.iter().any(|s| s == attribute));
        let (prefix_words, suffix_words) = self.affix_words(frame, attribute);
        AnnotatedSlot {
            attribute: attribute.to_string(),
            meta,
            slot_type,
            mentioned,
            prefix_words,
            suffix_words,
        }
    }

    /// Slot set for the winning frame: every declared slot, plus any the
    /// expression's placeholders imply.
    fn winner_slot_set(&self, winner: &ScoredDocument) -> Vec<AnnotatedSlot> {
        let mut slots: Vec<AnnotatedSlot> = self
            .schema
            .frame_slots(&winner.owner_id)
            .into_iter()
            .map(|meta| {
                let label = meta.label.clone();
                self.annotate_slot(&winner.owner_id, &label, meta, Some(winner))
            })
            .collect();
        for name in &winner.slot_names {
            if slots.iter().any(|s| s.attribute == *name) {
                continue;
            }
            let mut resolver = TypeResolver::new(self.schema.as_ref());
            let segments: Vec<&str> = name.split('.').collect();
            let meta = SlotMeta {
                label: segments.last().unwrap_or(&"").to_string(),
                slot_type: resolver.resolve_path(&winner.owner_id, name),
                ..SlotMeta::default()
            };
            slots.push(self.annotate_slot(&winner.owner_id, name, meta, Some(winner)));
        }
        slots
    }

    /// Slot set for an expected `(frame, slot)` pair: exactly that slot.
    fn expected_slot_set(
        &self,
        frame: &str,
        slot: &str,
        winner: Option<&ScoredDocument>,
    ) -> Vec<AnnotatedSlot> {
        let mut resolver = TypeResolver::new(self.schema.as_ref());
        let last = slot.rsplit('.').next().unwrap_or(slot);
        let meta = self
            .schema
            .frame_slots(frame)
            .into_iter()
            .find(|m| m.label == last)
            .unwrap_or_else(|| SlotMeta {
                label: last.to_string(),
                slot_type: resolver.resolve_path(frame, slot),
                ..SlotMeta::default()
            });
        vec![self.annotate_slot(frame, slot, meta, winner)]
    }

    /// Spans of `entity_type` or (recursively) any child type.
    fn spans_with_children<'a>(
        &self,
        ctx: &'a DuContext,
        entity_type: &str,
        out: &mut Vec<&'a SpanInfo>,
    ) {
        out.extend(ctx.spans.of_type(entity_type).iter());
        if let Some(meta) = self.schema.entity_meta(entity_type) {
            for child in &meta.children {
                self.spans_with_children(ctx, child, out);
            }
        }
    }

    /// Extract values for a slot set. Returns one assignment per surviving
    /// span, in descending score order.
    fn extract_slots(
        &self,
        ctx: &DuContext,
        slots: &[AnnotatedSlot],
        winner: Option<&ScoredDocument>,
    ) -> Vec<EntityEvent> {
        if slots.is_empty() {
            return Vec::new();
        }

        // A single token gives the span model too little context; only
        // recognizer evidence is eligible then.
        let model_output: Option<SpanModelOutput> = if ctx.tokens.len() > 1 {
            let probes: Vec<String> = slots
                .iter()
                .map(|s| {
                    s.meta
                        .triggers
                        .first()
                        .cloned()
                        .unwrap_or_else(|| s.meta.label.clone())
                })
                .collect();
            self.span_model
                .slot_spans(self.schema.language(), &ctx.utterance, &probes)
        } else {
            debug!(
                "[{}] single-token utterance, skipping span model",
                ctx.session_id
            );
            None
        };

        let mut direct_fills: Vec<EntityEvent> = Vec::new();
        let mut candidates: Vec<ScoredSpan> = Vec::new();

        for (slot_index, slot) in slots.iter().enumerate() {
            let class = model_output
                .as_ref()
                .and_then(|out| out.class_probs.get(slot_index).copied());

            let recognizer_spans: Vec<&SpanInfo> = slot
                .slot_type
                .as_deref()
                .map(|ty| {
                    let mut spans = Vec::new();
                    self.spans_with_children(ctx, ty, &mut spans);
                    spans
                })
                .unwrap_or_default();
            let has_real_span = recognizer_spans
                .iter()
                .any(|s| !s.is_partial_match() && s.value != DONT_CARE);

            let mentioned_by_model = class
                .map(|c| c.has_value > self.config.slot_mention_threshold)
                .unwrap_or(false);
            let dont_care_by_model = class
                .map(|c| c.dont_care > self.config.slot_dont_care_threshold)
                .unwrap_or(false);

            if mentioned_by_model || has_real_span {
                if let Some(out) = model_output.as_ref() {
                    candidates.extend(self.model_candidates(ctx, out, slot_index, slot));
                }
                candidates.extend(self.recognizer_candidates(ctx, &recognizer_spans, slot));
            } else if dont_care_by_model {
                direct_fills.push(EntityEvent::new(DONT_CARE, slot.attribute.clone()));
            }
        }

        let kept = self.resolve_overlaps(candidates, slots);
        let mut assignments = direct_fills;
        for span in kept {
            // Text already absorbed by the winning template was consumed by
            // the match itself; nothing left to extract from it.
            if let Some(doc) = winner {
                if doc.template.to_lowercase().contains(&span.text) {
                    debug!("dropping span '{}' absorbed by template", span.text);
                    continue;
                }
            }
            let mut event =
                EntityEvent::new(span.value.clone(), span.attribute.clone()).with_orig(span.text);
            if let Some(ty) = span.entity_type {
                event = event.with_type(ty);
            }
            assignments.push(event);
        }
        assignments
    }

    /// Span-model candidates for one slot: top-K start × top-K end token
    /// pairs, scored by summed logits, rejecting boundaries inside a
    /// subword.
    fn model_candidates(
        &self,
        ctx: &DuContext,
        out: &SpanModelOutput,
        slot_index: usize,
        slot: &AnnotatedSlot,
    ) -> Vec<ScoredSpan> {
        let (Some(starts), Some(ends)) = (
            out.start_logits.get(slot_index),
            out.end_logits.get(slot_index),
        ) else {
            return Vec::new();
        };
        if starts.len() != out.tokens.len() || ends.len() != out.tokens.len() {
            return Vec::new();
        }

        let top_indices = |logits: &[f64]| -> Vec<usize> {
            let mut indices: Vec<usize> = (0..logits.len()).collect();
            indices.sort_by(|a, b| {
                logits[*b]
                    .partial_cmp(&logits[*a])
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            indices.truncate(self.config.span_top_k);
            indices
        };

        let mut candidates = Vec::new();
        for &si in &top_indices(starts) {
            for &ei in &top_indices(ends) {
                if ei < si {
                    continue;
                }
                // No candidate may begin or end mid subword.
                if out.tokens[si].is_subword() {
                    continue;
                }
                if out.tokens.get(ei + 1).is_some_and(|t| t.is_subword()) {
                    continue;
                }
                let start = out.tokens[si].start;
                let end = out.tokens[ei].end;
                if start >= end || end > ctx.len() {
                    continue;
                }
                let text = ctx.text_between(start, end);
                candidates.push(ScoredSpan {
                    start,
                    end,
                    score: starts[si] + ends[ei],
                    value: text.clone(),
                    text,
                    entity_type: slot.slot_type.clone(),
                    attribute: slot.attribute.clone(),
                    trace: "span-model".to_string(),
                    from_recognizer: false,
                    from_model: true,
                });
            }
        }
        candidates
    }

    /// Recognizer-derived candidates for one slot. On a character-range
    /// collision with a model candidate the recognizer's value and type
    /// win and its score is absorbed into the model candidate.
    fn recognizer_candidates(
        &self,
        ctx: &DuContext,
        spans: &[&SpanInfo],
        slot: &AnnotatedSlot,
    ) -> Vec<ScoredSpan> {
        let mut out = Vec::new();
        for span in spans {
            if span.value == DONT_CARE {
                continue;
            }
            let mut score = span.score;
            let partial = span.is_partial_match();
            // Affix bonus for expected neighboring words; denied to
            // partial matches.
            if !partial && self.affix_matches(ctx, span, slot) {
                score += self.config.affix_bonus;
            }
            if slot.mentioned {
                score += self.config.mention_bonus;
            }
            out.push(ScoredSpan {
                start: span.start,
                end: span.end,
                score,
                text: ctx.text_between(span.start, span.end),
                value: span.value.clone(),
                entity_type: Some(span.entity_type.clone()),
                attribute: slot.attribute.clone(),
                trace: "recognizer".to_string(),
                from_recognizer: true,
                from_model: false,
            });
        }
        out
    }

    fn affix_matches(&self, ctx: &DuContext, span: &SpanInfo, slot: &AnnotatedSlot) -> bool {
        let before = ctx
            .tokens
            .iter()
            .rev()
            .find(|t| t.end <= span.start)
            .map(|t| t.text.as_str());
        let after = ctx
            .tokens
            .iter()
            .find(|t| t.start >= span.end)
            .map(|t| t.text.as_str());
        before.is_some_and(|w| slot.prefix_words.contains(w))
            || after.is_some_and(|w| slot.suffix_words.contains(w))
    }

    /// Merge model/recognizer collisions, then greedily keep the
    /// highest-scoring non-overlapping spans, enforcing single-value slots.
    fn resolve_overlaps(
        &self,
        candidates: Vec<ScoredSpan>,
        slots: &[AnnotatedSlot],
    ) -> Vec<ScoredSpan> {
        // Collision merge: a recognizer span on the exact range of a model
        // span overwrites value/type and its score accumulates.
        let mut merged: Vec<ScoredSpan> = Vec::new();
        let (model, recognizer): (Vec<ScoredSpan>, Vec<ScoredSpan>) =
            candidates.into_iter().partition(|c| c.from_model);
        let mut absorbed = vec![false; recognizer.len()];
        for mut m in model {
            for (i, r) in recognizer.iter().enumerate() {
                if r.start == m.start && r.end == m.end && r.attribute == m.attribute {
                    if !m.from_recognizer {
                        m.value = r.value.clone();
                        m.entity_type = r.entity_type.clone();
                        m.from_recognizer = true;
                    }
                    m.score += r.score;
                    absorbed[i] = true;
                }
            }
            merged.push(m);
        }
        for (i, r) in recognizer.into_iter().enumerate() {
            if !absorbed[i] {
                merged.push(r);
            }
        }

        merged.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        let multi_value = |attribute: &str| {
            slots
                .iter()
                .find(|s| s.attribute == attribute)
                .map(|s| s.meta.multi_value)
                .unwrap_or(false)
        };

        let mut kept: Vec<ScoredSpan> = Vec::new();
        for candidate in merged {
            if kept.iter().any(|k| k.overlaps(&candidate)) {
                continue;
            }
            let slot_taken = kept.iter().any(|k| k.attribute == candidate.attribute);
            if slot_taken && !multi_value(&candidate.attribute) {
                continue;
            }
            kept.push(candidate);
        }
        kept
    }
}
