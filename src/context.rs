//! Per-turn understanding context and dialog expectations.
//!
//! [`DialogExpectations`] arrive from the external dialog manager once per
//! turn and are read-only here. [`DuContext`] is the per-utterance scratch
//! state threading recognized spans and retrieval candidates between
//! pipeline stages; it is created at turn start and dropped at turn end,
//! never shared across turns.

use crate::span::SpanInfo;
use crate::tokenizer::Token;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One frame (and optionally slot) the dialog manager expects the next
/// utterance to address.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpectedFrame {
    /// Expected frame id.
    pub frame: String,
    /// Expected slot within the frame, if slot-scoped.
    #[serde(default)]
    pub slot: Option<String>,
    /// Declared type of that slot, if known to the caller.
    #[serde(default)]
    pub slot_type: Option<String>,
    /// Whether the expectation accepts an explicit "don't care".
    #[serde(default)]
    pub allow_dont_care: bool,
}

impl ExpectedFrame {
    /// Create a frame-only expectation.
    #[must_use]
    pub fn new(frame: impl Into<String>) -> Self {
        Self {
            frame: frame.into(),
            ..Self::default()
        }
    }

    /// Create a slot-scoped expectation.
    #[must_use]
    pub fn with_slot(frame: impl Into<String>, slot: impl Into<String>) -> Self {
        Self {
            frame: frame.into(),
            slot: Some(slot.into()),
            ..Self::default()
        }
    }
}

/// Status of one expectation topic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpectationStatus {
    /// Actively being filled.
    #[default]
    Open,
    /// Still on the stack but not the focus.
    Closed,
    /// Completed.
    Done,
}

/// An ordered, non-empty group of expected frames sharing one topic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DialogExpectation {
    /// Expected frames, most specific first.
    pub frames: Vec<ExpectedFrame>,
    /// Topic status.
    #[serde(default)]
    pub status: ExpectationStatus,
}

/// All expectations for the turn, primary first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DialogExpectations {
    /// Ordered expectation topics.
    pub expectations: Vec<DialogExpectation>,
}

impl DialogExpectations {
    /// No expectations (open-ended turn).
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Build from a flat list of expected frames, one topic each.
    #[must_use]
    pub fn from_frames(frames: Vec<ExpectedFrame>) -> Self {
        Self {
            expectations: frames
                .into_iter()
                .map(|f| DialogExpectation {
                    frames: vec![f],
                    status: ExpectationStatus::Open,
                })
                .collect(),
        }
    }

    /// Flattened, ordered list of expected frames across all topics.
    #[must_use]
    pub fn active_frames(&self) -> Vec<&ExpectedFrame> {
        self.expectations
            .iter()
            .flat_map(|e| e.frames.iter())
            .collect()
    }

    /// The primary expectation, if any.
    #[must_use]
    pub fn primary(&self) -> Option<&ExpectedFrame> {
        self.expectations.first().and_then(|e| e.frames.first())
    }

    /// Whether there is anything to expect.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active_frames().is_empty()
    }

    /// Whether `frame` appears among the active expectations.
    #[must_use]
    pub fn is_frame_active(&self, frame: &str) -> bool {
        self.active_frames().iter().any(|f| f.frame == frame)
    }

    /// Whether any active expectation allows an explicit "don't care".
    #[must_use]
    pub fn allows_dont_care(&self) -> bool {
        self.active_frames().iter().any(|f| f.allow_dont_care)
    }
}

/// Recognized spans keyed by entity type, preserving discovery order of
/// both types and spans within a type. Iteration order is deterministic.
#[derive(Debug, Clone, Default)]
pub struct SpanMap {
    order: Vec<String>,
    by_type: HashMap<String, Vec<SpanInfo>>,
}

impl SpanMap {
    /// Merge one recognizer's output into the map.
    pub fn extend(&mut self, spans: Vec<SpanInfo>) {
        for span in spans {
            let entry = self.by_type.entry(span.entity_type.clone());
            if let std::collections::hash_map::Entry::Vacant(_) = entry {
                self.order.push(span.entity_type.clone());
            }
            entry.or_default().push(span);
        }
    }

    /// Spans of one entity type, in discovery order.
    #[must_use]
    pub fn of_type(&self, entity_type: &str) -> &[SpanInfo] {
        self.by_type
            .get(entity_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// All spans in deterministic (type discovery, then span discovery) order.
    pub fn iter(&self) -> impl Iterator<Item = &SpanInfo> {
        self.order
            .iter()
            .filter_map(move |t| self.by_type.get(t))
            .flatten()
    }

    /// Entity types present, in discovery order.
    #[must_use]
    pub fn types(&self) -> &[String] {
        &self.order
    }

    /// Whether any span (of any type) was recognized.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Per-utterance scratch state shared between pipeline stages.
pub struct DuContext {
    /// Session identifier, for logging only.
    pub session_id: String,
    /// Normalized (lowercased, trimmed) utterance.
    pub utterance: String,
    /// Tokenized utterance with char offsets.
    pub tokens: Vec<Token>,
    /// Dialog expectations for this turn.
    pub expectations: DialogExpectations,
    /// Recognized spans by entity type.
    pub spans: SpanMap,
}

impl DuContext {
    /// Create a fresh context for one turn.
    #[must_use]
    pub fn new(
        session_id: impl Into<String>,
        utterance: impl Into<String>,
        tokens: Vec<Token>,
        expectations: DialogExpectations,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            utterance: utterance.into(),
            tokens,
            expectations,
            spans: SpanMap::default(),
        }
    }

    /// Char length of the normalized utterance.
    #[must_use]
    pub fn len(&self) -> usize {
        self.utterance.chars().count()
    }

    /// Whether the utterance is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.utterance.is_empty()
    }

    /// Slice of the utterance by char offsets.
    #[must_use]
    pub fn text_between(&self, start: usize, end: usize) -> String {
        self.utterance
            .chars()
            .skip(start)
            .take(end.saturating_sub(start))
            .collect()
    }
}
