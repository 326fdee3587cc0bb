//! Span types produced and consumed by the understanding pipeline.
//!
//! Two kinds of spans flow through a turn:
//!
//! - [`SpanInfo`]: an entity occurrence emitted by a recognizer during the
//!   recognition pass. Immutable after creation, keyed by entity type in the
//!   turn context's span map.
//! - [`ScoredSpan`]: a slot-value candidate competing for a slot during
//!   extraction. Candidates from recognizers and from the neural span model
//!   are scored on the same scale; only non-overlapping, highest-scoring
//!   survivors are kept.
//!
//! All offsets are half-open character ranges `[start, end)` into the
//! normalized utterance.

use serde::{Deserialize, Serialize};

/// Sentinel value carried by partial-match spans.
///
/// A partial match means a single token of a multi-token entity label was
/// seen; downstream logic tests for this value and discounts the span
/// (no prefix/suffix bonus, does not satisfy entity-type requirements).
pub const PARTIAL_MATCH: &str = "_partial_match";

/// Sentinel normalized value for an explicit "don't care" mention.
pub const DONT_CARE: &str = "_DontCare";

/// Prefix marking a synthetic internal-node label registered for entity
/// hierarchies ("did the user mention one of my children").
pub const INTERNAL_NODE_PREFIX: &str = "_internal.";

/// Which recognition strategy produced a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecognizerKind {
    /// In-process mention index (trie/ngram over declared instances).
    MentionIndex,
    /// Out-of-process temporal/numeric/contact extraction service.
    DelegatedService,
}

/// A recognized entity occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanInfo {
    /// Fully qualified entity type id.
    pub entity_type: String,
    /// Start character offset (inclusive).
    pub start: usize,
    /// End character offset (exclusive).
    pub end: usize,
    /// Recognized but not necessarily expressed (e.g. implicit "now").
    pub latent: bool,
    /// Normalized recognizer payload (instance label, ISO value, ...).
    pub value: String,
    /// Which recognizer produced this span.
    pub recognizer: RecognizerKind,
    /// Recognition confidence.
    pub score: f64,
}

impl SpanInfo {
    /// Create a new span. `start < end` must hold; offsets are char-based.
    #[must_use]
    pub fn new(
        entity_type: impl Into<String>,
        start: usize,
        end: usize,
        value: impl Into<String>,
        recognizer: RecognizerKind,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            start,
            end,
            latent: false,
            value: value.into(),
            recognizer,
            score: 1.0,
        }
    }

    /// Mark the span as latent.
    #[must_use]
    pub fn latent(mut self, latent: bool) -> Self {
        self.latent = latent;
        self
    }

    /// Set the recognition score.
    #[must_use]
    pub fn with_score(mut self, score: f64) -> Self {
        self.score = score;
        self
    }

    /// Whether this is a partial-match sentinel span.
    #[must_use]
    pub fn is_partial_match(&self) -> bool {
        self.value == PARTIAL_MATCH
    }

    /// Check if this span character-overlaps another range.
    #[must_use]
    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        ranges_overlap(self.start, self.end, start, end)
    }

    /// Check if `[start, end)` lies entirely within this span.
    #[must_use]
    pub fn covers(&self, start: usize, end: usize) -> bool {
        self.start <= start && end <= self.end
    }
}

/// A slot-value candidate produced during extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredSpan {
    /// Start character offset (inclusive).
    pub start: usize,
    /// End character offset (exclusive).
    pub end: usize,
    /// Candidate score; recognizer evidence and bonuses accumulate here.
    pub score: f64,
    /// Raw matched text.
    pub text: String,
    /// Normalized value (instance label or structured value).
    pub value: String,
    /// Entity type of the value, when known.
    pub entity_type: Option<String>,
    /// Qualified slot attribute this candidate targets.
    pub attribute: String,
    /// Trace of where the evidence came from, for logging.
    pub trace: String,
    /// Confirmed by a recognizer span.
    pub from_recognizer: bool,
    /// Proposed by the neural span model.
    pub from_model: bool,
}

impl ScoredSpan {
    /// Check if this candidate character-overlaps another.
    #[must_use]
    pub fn overlaps(&self, other: &ScoredSpan) -> bool {
        ranges_overlap(self.start, self.end, other.start, other.end)
    }
}

/// Half-open range overlap test.
#[must_use]
pub fn ranges_overlap(a_start: usize, a_end: usize, b_start: usize, b_end: usize) -> bool {
    !(a_end <= b_start || b_end <= a_start)
}
