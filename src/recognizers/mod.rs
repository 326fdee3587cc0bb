//! Entity recognizers.
//!
//! The recognizer set is closed and known at build time:
//!
//! - [`MentionIndexRecognizer`]: in-process, built from declared instance
//!   lists and trigger phrases. Exact and partial mentions, entity
//!   hierarchies, don't-care and anaphora phrase sets.
//! - [`DelegatedEntityRecognizer`]: out-of-process call to a
//!   temporal/numeric/contact extraction service.
//!
//! Each recognizer scans the same utterance independently; the tracker
//! merges their spans into the turn context's span map. Recognizers are
//! immutable after construction and safe for unsynchronized concurrent
//! reads.

pub mod delegated;
pub mod mention;

pub use delegated::{DelegatedConfig, DelegatedEntityRecognizer};
pub use mention::{MentionIndexConfig, MentionIndexRecognizer};

use crate::context::DuContext;
use crate::span::SpanInfo;

/// A recognizer scans an utterance and emits typed character spans.
///
/// `recognize` never fails on unknown text: unseen input yields no spans,
/// and external-service failures are absorbed as empty output.
pub trait EntityRecognizer: Send + Sync {
    /// Scan the utterance in `ctx` and return recognized spans.
    fn recognize(&self, ctx: &DuContext) -> Vec<SpanInfo>;

    /// Recognizer name for logging.
    fn name(&self) -> &'static str;
}
