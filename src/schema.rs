//! Schema metadata: the external provider interface and the pieces of it
//! this crate reads.
//!
//! The schema provider is an external collaborator. It describes frames,
//! slots, entity types and their hierarchy, and hands over the declared
//! trigger-expression corpus. Everything here is read-only within a turn;
//! the only computation layered on top is dotted slot-path resolution,
//! which is memoized per resolver so repeated lookups within one turn never
//! hit the provider twice for the same `(frame, slot)` pair.

use crate::error::Result;
use crate::span::RecognizerKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-entity-type metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityTypeMeta {
    /// Which recognizers must handle this type.
    pub recognizers: Vec<RecognizerKind>,
    /// Direct parent types, if any.
    pub parents: Vec<String>,
    /// Direct child types, if any.
    pub children: Vec<String>,
}

/// Declared slot metadata for a frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlotMeta {
    /// Slot label (attribute name).
    pub label: String,
    /// Trigger phrases declared for the slot.
    #[serde(default)]
    pub triggers: Vec<String>,
    /// Declared type (entity type or nested frame type).
    pub slot_type: Option<String>,
    /// Whether the slot accepts multiple values.
    #[serde(default)]
    pub multi_value: bool,
    /// Parent slot for dotted `a.b.c` paths.
    #[serde(default)]
    pub parent: Option<String>,
    /// Head slot flag.
    #[serde(default)]
    pub head: bool,
}

/// One declared trigger expression, as supplied by the provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawExpression {
    /// Surface template, possibly containing `$slotName$` placeholders.
    pub utterance: String,
    /// Required dialog context, if any.
    #[serde(default)]
    pub context: Option<RawContext>,
    /// Optional label (used for don't-care / anaphora phrase collection).
    #[serde(default)]
    pub label: Option<String>,
    /// Optional function-slot marker.
    #[serde(default)]
    pub function_slot: Option<String>,
    /// Slot names this expression partially applies ("entailed" slots).
    #[serde(default)]
    pub partial_application: Vec<String>,
}

/// Declared context requirement of an expression.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawContext {
    /// Frame that must be active for the expression to apply.
    pub frame_id: String,
    /// Slot within that frame, if the context is slot-scoped.
    #[serde(default)]
    pub attribute_id: Option<String>,
}

/// All expressions declared for one owner frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OwnedExpressions {
    /// Owner frame id.
    pub owner_id: String,
    /// Declared expressions.
    pub expressions: Vec<RawExpression>,
}

/// Schema/metadata provider interface (external collaborator).
///
/// Implementations must be safe for concurrent reads; the engine never
/// writes through this interface.
pub trait SchemaProvider: Send + Sync {
    /// Language code for the agent (ISO 639-1).
    fn language(&self) -> &str;

    /// All declared entity type names.
    fn entity_types(&self) -> Vec<String>;

    /// Metadata for one entity type.
    fn entity_meta(&self, entity_type: &str) -> Option<EntityTypeMeta>;

    /// Instance-label to surface-forms mapping for one entity type.
    fn entity_instances(&self, entity_type: &str) -> HashMap<String, Vec<String>>;

    /// Declared slots of a frame.
    fn frame_slots(&self, frame: &str) -> Vec<SlotMeta>;

    /// Declared subtypes of a frame.
    fn subtypes(&self, frame: &str) -> Vec<String>;

    /// The raw declared-expression corpus.
    fn expressions(&self) -> Vec<OwnedExpressions>;

    /// Declared type of one slot on one frame, if both exist.
    fn slot_type(&self, frame: &str, slot: &str) -> Option<String> {
        self.frame_slots(frame)
            .into_iter()
            .find(|s| s.label == slot)
            .and_then(|s| s.slot_type)
    }

    /// Whether a type name denotes an entity type (vs. a frame).
    fn is_entity(&self, type_name: &str) -> bool {
        self.entity_meta(type_name).is_some()
    }
}

/// Dotted slot-path resolution with a per-turn memo cache.
///
/// Resolves `a.b.c` by walking segments iteratively from a root frame:
/// each segment's declared type becomes the frame for the next segment.
/// A missing slot or type short-circuits to `None` (equivalent to
/// no-understanding upstream, never a crash).
pub struct TypeResolver<'a> {
    provider: &'a dyn SchemaProvider,
    cache: HashMap<(String, String), Option<String>>,
}

impl<'a> TypeResolver<'a> {
    /// Create a resolver over a provider.
    #[must_use]
    pub fn new(provider: &'a dyn SchemaProvider) -> Self {
        Self {
            provider,
            cache: HashMap::new(),
        }
    }

    /// Declared type of `slot` on `frame`, memoized.
    pub fn slot_type(&mut self, frame: &str, slot: &str) -> Option<String> {
        let key = (frame.to_string(), slot.to_string());
        if let Some(cached) = self.cache.get(&key) {
            return cached.clone();
        }
        let resolved = self.provider.slot_type(frame, slot);
        self.cache.insert(key, resolved.clone());
        resolved
    }

    /// Resolve a dotted path `a.b.c` starting from `root_frame`.
    pub fn resolve_path(&mut self, root_frame: &str, path: &str) -> Option<String> {
        let mut frame = root_frame.to_string();
        let mut resolved = None;
        for segment in path.split('.') {
            match self.slot_type(&frame, segment) {
                Some(ty) => {
                    frame = ty.clone();
                    resolved = Some(ty);
                }
                None => return None,
            }
        }
        resolved
    }
}

/// In-memory [`SchemaProvider`] for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticSchema {
    /// Language code.
    pub language: String,
    /// Entity type metadata by name.
    pub entities: HashMap<String, EntityTypeMeta>,
    /// Entity instances: type -> label -> surface forms.
    pub instances: HashMap<String, HashMap<String, Vec<String>>>,
    /// Slots by frame.
    pub slots: HashMap<String, Vec<SlotMeta>>,
    /// Subtypes by frame.
    pub frame_subtypes: HashMap<String, Vec<String>>,
    /// Declared expression corpus.
    pub corpus: Vec<OwnedExpressions>,
}

impl StaticSchema {
    /// Create an empty schema for a language.
    #[must_use]
    pub fn new(language: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            ..Self::default()
        }
    }

    /// Register an entity type with instances.
    pub fn add_entity(
        &mut self,
        name: impl Into<String>,
        meta: EntityTypeMeta,
        instances: HashMap<String, Vec<String>>,
    ) {
        let name = name.into();
        self.entities.insert(name.clone(), meta);
        self.instances.insert(name, instances);
    }

    /// Register a frame's slots.
    pub fn add_frame(&mut self, frame: impl Into<String>, slots: Vec<SlotMeta>) {
        self.slots.insert(frame.into(), slots);
    }

    /// Register one owner's declared expressions.
    pub fn add_expressions(&mut self, owned: OwnedExpressions) {
        self.corpus.push(owned);
    }

    /// Append a declared-expression corpus parsed from its JSON wire form.
    pub fn load_corpus(&mut self, json: &str) -> Result<()> {
        let owned: Vec<OwnedExpressions> = serde_json::from_str(json)?;
        self.corpus.extend(owned);
        Ok(())
    }
}

impl SchemaProvider for StaticSchema {
    fn language(&self) -> &str {
        &self.language
    }

    fn entity_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entities.keys().cloned().collect();
        names.sort();
        names
    }

    fn entity_meta(&self, entity_type: &str) -> Option<EntityTypeMeta> {
        self.entities.get(entity_type).cloned()
    }

    fn entity_instances(&self, entity_type: &str) -> HashMap<String, Vec<String>> {
        self.instances.get(entity_type).cloned().unwrap_or_default()
    }

    fn frame_slots(&self, frame: &str) -> Vec<SlotMeta> {
        self.slots.get(frame).cloned().unwrap_or_default()
    }

    fn subtypes(&self, frame: &str) -> Vec<String> {
        self.frame_subtypes.get(frame).cloned().unwrap_or_default()
    }

    fn expressions(&self) -> Vec<OwnedExpressions> {
        self.corpus.clone()
    }
}
