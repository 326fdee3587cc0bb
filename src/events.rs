//! Semantic events emitted to the downstream dialog manager.
//!
//! Every turn produces at least one event, even on failure: the terminal
//! "don't understand" event and the clarification event are ordinary
//! [`FrameEvent`]s, so the dialog manager can always produce a turn.

use serde::{Deserialize, Serialize};

/// Well-known system frames and types the tracker emits or branches on.
pub mod sys {
    /// Package for core system frames.
    pub const PACKAGE: &str = "system";
    /// Package for confirmation yes/no frames.
    pub const PACKAGE_CONFIRMATION: &str = "system.confirmation";
    /// Package for boolean-gate yes/no frames.
    pub const PACKAGE_BOOLEAN_GATE: &str = "system.booleanGate";
    /// Package for has-more yes/no frames.
    pub const PACKAGE_HAS_MORE: &str = "system.hasMore";

    /// Terminal event when nothing passes threshold.
    pub const DONT_UNDERSTAND: &str = "system.DontUnderstand";
    /// Event carrying one sub-event per surviving candidate frame.
    pub const INTENT_CLARIFICATION: &str = "system.IntentClarification";
    /// Frame for an abstract "don't care" utterance.
    pub const DONT_CARE: &str = "system.DontCare";
    /// Frame whose expressions supply anaphoric-reference phrases.
    pub const THAT_REFERENCE: &str = "system.ThatReference";

    /// Affirmative frame name (combined with a yes/no package).
    pub const YES: &str = "Yes";
    /// Negative frame name (combined with a yes/no package).
    pub const NO: &str = "No";

    /// Extractive boolean entity type; values are `"true"` / `"false"`.
    pub const BOOLEAN: &str = "system.Boolean";
    /// Raw string entity type; a string-typed expected slot swallows the
    /// whole utterance as a last resort.
    pub const STRING: &str = "system.String";
    /// Sentinel value for a slot filled by the expression itself rather
    /// than by a span in the utterance.
    pub const CONTEXT_FILL: &str = "_context";

    /// Fully qualified yes/no frame id for a package.
    #[must_use]
    pub fn qualified(package: &str, frame: &str) -> String {
        format!("{package}.{frame}")
    }
}

/// One slot-value assignment inside a frame event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityEvent {
    /// Normalized value.
    pub value: String,
    /// Raw utterance text the value was extracted from, when different.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orig_value: Option<String>,
    /// Qualified attribute path (`a.b.c` for nested slots).
    pub attribute: String,
    /// Entity type of the value, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
}

impl EntityEvent {
    /// Create an assignment.
    #[must_use]
    pub fn new(value: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            orig_value: None,
            attribute: attribute.into(),
            entity_type: None,
        }
    }

    /// Attach the raw text the value came from.
    #[must_use]
    pub fn with_orig(mut self, orig: impl Into<String>) -> Self {
        self.orig_value = Some(orig.into());
        self
    }

    /// Attach the entity type.
    #[must_use]
    pub fn with_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }
}

/// A semantic frame event: a frame type plus slot assignments and nested
/// events (used for multi-frame results such as intent clarification).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameEvent {
    /// Frame type name.
    pub frame_type: String,
    /// Package/namespace qualifier.
    pub package: String,
    /// Ordered slot assignments.
    #[serde(default)]
    pub slots: Vec<EntityEvent>,
    /// Ordered nested events.
    #[serde(default)]
    pub frames: Vec<FrameEvent>,
}

impl FrameEvent {
    /// Create a bare frame event.
    #[must_use]
    pub fn new(frame_type: impl Into<String>, package: impl Into<String>) -> Self {
        Self {
            frame_type: frame_type.into(),
            package: package.into(),
            slots: Vec::new(),
            frames: Vec::new(),
        }
    }

    /// Create a frame event from a fully qualified frame id
    /// (`pkg.Frame` splits on the last dot; no dot means empty package).
    #[must_use]
    pub fn from_qualified(frame_id: &str) -> Self {
        match frame_id.rsplit_once('.') {
            Some((pkg, name)) => Self::new(name, pkg),
            None => Self::new(frame_id, ""),
        }
    }

    /// Fully qualified frame id.
    #[must_use]
    pub fn qualified_type(&self) -> String {
        if self.package.is_empty() {
            self.frame_type.clone()
        } else {
            format!("{}.{}", self.package, self.frame_type)
        }
    }

    /// Append a slot assignment.
    #[must_use]
    pub fn with_slot(mut self, slot: EntityEvent) -> Self {
        self.slots.push(slot);
        self
    }

    /// Append a nested frame event.
    #[must_use]
    pub fn with_frame(mut self, frame: FrameEvent) -> Self {
        self.frames.push(frame);
        self
    }

    /// The terminal no-understanding event.
    #[must_use]
    pub fn dont_understand() -> Self {
        Self::from_qualified(sys::DONT_UNDERSTAND)
    }
}
