//! # parlance
//!
//! Dialog understanding for Rust.
//!
//! Converts one user utterance, in the light of what the dialog manager
//! currently expects, into a small list of semantic frame events:
//!
//! - **Recognition**: entity spans from an in-memory mention index plus a
//!   delegated extraction service (dates, numbers, ordinals, money, ...)
//! - **Retrieval**: context-scoped inverted index over declared expression
//!   templates
//! - **Re-ranking**: neural intent similarity with exact-match override and
//!   entity-requirement filtering
//! - **Disambiguation**: expectation-aware yes/no, don't-care, slot
//!   extraction and raw-string fallbacks
//! - **Extraction**: slot-value spans merged from the span model and the
//!   recognizers, with greedy overlap resolution
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use parlance::prelude::*;
//!
//! let schema = Arc::new(load_schema()?);
//! let tokenizer = Arc::new(SimpleTokenizer);
//! let index = Arc::new(IndexHolder::new(ExpressionSearcher::build(
//!     schema.as_ref(),
//!     tokenizer.clone(),
//!     SearcherConfig::default(),
//! )?));
//! let nlu = Arc::new(RestNluService::new(RestModelConfig::default()));
//!
//! let tracker = StateTracker::new(
//!     schema.clone(),
//!     tokenizer.clone(),
//!     vec![
//!         Box::new(MentionIndexRecognizer::build(
//!             schema.as_ref(),
//!             tokenizer,
//!             MentionIndexConfig::default(),
//!         )),
//!         Box::new(DelegatedEntityRecognizer::build(
//!             schema.as_ref(),
//!             DelegatedConfig::default(),
//!         )),
//!     ],
//!     index,
//!     nlu.clone(),
//!     nlu,
//! );
//!
//! let events = tracker.convert("session-1", "Transfer $40 to savings", expectations);
//! ```
//!
//! ## Design
//!
//! - **Trait-based seams**: schema access, tokenization, recognizers and
//!   both model services sit behind traits, with mocks exported for tests
//! - **Failure absorption**: external-service failures degrade the pipeline
//!   (recognizer-only evidence, no-understanding events), never panic or
//!   error out of [`StateTracker::convert`]
//! - **Deterministic**: identical inputs and model responses produce
//!   identical events; every tie-break is explicit
//! - **Hot reload**: [`IndexHolder`] swaps a freshly built searcher in one
//!   atomic step while in-flight turns finish on the old one

#![warn(missing_docs)]

mod context;
mod error;
mod events;
mod index;
pub mod model;
pub mod recognizers;
mod schema;
mod span;
mod tokenizer;
mod tracker;

pub use context::{
    DialogExpectation, DialogExpectations, DuContext, ExpectationStatus, ExpectedFrame, SpanMap,
};
pub use error::{Error, Result};
pub use events::{sys, EntityEvent, FrameEvent};
pub use index::{
    context_key, ExpressionSearcher, IndexHolder, ScoredDocument, SearcherConfig, DEFAULT_CONTEXT,
};
pub use schema::{
    EntityTypeMeta, OwnedExpressions, RawContext, RawExpression, SchemaProvider, SlotMeta,
    StaticSchema, TypeResolver,
};
pub use span::{
    ranges_overlap, RecognizerKind, ScoredSpan, SpanInfo, DONT_CARE, INTERNAL_NODE_PREFIX,
    PARTIAL_MATCH,
};
pub use tokenizer::{SimpleTokenizer, Token, Tokenizer};
pub use tracker::{StateTracker, TrackerConfig};

pub mod prelude {
    //! Commonly used items, re-exported for convenience.
    //!
    //! ```rust,ignore
    //! use parlance::prelude::*;
    //!
    //! let events = tracker.convert("session", "yes please", expectations);
    //! ```
    pub use crate::error::{Error, Result};
    pub use crate::events::{EntityEvent, FrameEvent};
    pub use crate::model::{
        IntentModel, MockIntentModel, MockSpanModel, RestModelConfig, RestNluService, SpanModel,
    };
    pub use crate::recognizers::{
        DelegatedConfig, DelegatedEntityRecognizer, EntityRecognizer, MentionIndexConfig,
        MentionIndexRecognizer,
    };
    pub use crate::{
        DialogExpectations, ExpectedFrame, ExpressionSearcher, IndexHolder, SchemaProvider,
        SearcherConfig, SimpleTokenizer, StateTracker, StaticSchema, TrackerConfig,
    };
}
