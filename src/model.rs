//! Neural model service clients.
//!
//! Two external services are consumed: an intent-similarity model (one
//! probability per probe string) and a slot-span model (per-slot mention
//! class probabilities plus start/end token logits over the model's own
//! tokenization). Both are behind traits so the tracker can be exercised
//! with mocks; the REST implementations absorb failures — timeout, non-200,
//! malformed payload — as `None`, and the pipeline degrades to
//! recognizer-only evidence.

use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// A token in the span model's own tokenization, with char offsets into
/// the utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelToken {
    /// Token text (subword pieces carry a `##` prefix).
    pub text: String,
    /// Start character offset (inclusive).
    pub start: usize,
    /// End character offset (exclusive).
    pub end: usize,
}

impl ModelToken {
    /// Whether this token is a mid-word subword piece. Candidate spans may
    /// not begin or end on one.
    #[must_use]
    pub fn is_subword(&self) -> bool {
        self.text.starts_with("##")
    }
}

/// Per-slot mention classification, softmaxed from the service's logits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SlotClassProbs {
    /// Probability the slot is not mentioned.
    pub no_mention: f64,
    /// Probability the slot has a value in the utterance.
    pub has_value: f64,
    /// Probability the user expressed "don't care" for the slot.
    pub dont_care: f64,
}

/// Slot-span model response for one utterance and slot set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpanModelOutput {
    /// Model tokenization with character offsets.
    pub tokens: Vec<ModelToken>,
    /// One classification per requested slot, aligned by index.
    pub class_probs: Vec<SlotClassProbs>,
    /// Per-slot start logits, one value per token.
    pub start_logits: Vec<Vec<f64>>,
    /// Per-slot end logits, one value per token.
    pub end_logits: Vec<Vec<f64>>,
}

/// Intent-similarity model interface.
pub trait IntentModel: Send + Sync {
    /// One similarity probability per probe, aligned by index, or `None`
    /// when the service contributed nothing.
    fn similarities(&self, language: &str, utterance: &str, probes: &[String])
        -> Option<Vec<f64>>;
}

/// Slot-span model interface.
pub trait SpanModel: Send + Sync {
    /// Span scoring for the given slot probes, or `None` on failure.
    fn slot_spans(
        &self,
        language: &str,
        utterance: &str,
        probes: &[String],
    ) -> Option<SpanModelOutput>;
}

/// Configuration for the REST model service.
#[derive(Debug, Clone)]
pub struct RestModelConfig {
    /// Intent-similarity endpoint.
    pub intent_url: String,
    /// Slot-span endpoint.
    pub span_url: String,
    /// Per-call timeout.
    pub timeout: Duration,
}

impl Default for RestModelConfig {
    fn default() -> Self {
        Self {
            intent_url: "http://localhost:8501/intent".to_string(),
            span_url: "http://localhost:8501/slots".to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Serialize)]
struct ModelRequest<'a> {
    language: &'a str,
    utterance: &'a str,
    probes: &'a [String],
}

#[derive(Debug, Deserialize)]
struct IntentResponse {
    probabilities: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct SpanResponse {
    tokens: Vec<ModelToken>,
    /// Flat array of 3 class logits per slot.
    class_logits: Vec<f64>,
    start_logits: Vec<Vec<f64>>,
    end_logits: Vec<Vec<f64>>,
}

/// REST client for both model services.
pub struct RestNluService {
    config: RestModelConfig,
}

impl RestNluService {
    /// Create a client.
    #[must_use]
    pub fn new(config: RestModelConfig) -> Self {
        Self { config }
    }

    fn post<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        request: &ModelRequest<'_>,
    ) -> Option<T> {
        let response = ureq::post(url).timeout(self.config.timeout).send_json(request);
        match response {
            Ok(resp) if resp.status() == 200 => match resp.into_json::<T>() {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    warn!("model service returned malformed payload: {e}");
                    None
                }
            },
            Ok(resp) => {
                warn!("model service returned status {}", resp.status());
                None
            }
            Err(e) => {
                warn!("model service call failed: {e}");
                None
            }
        }
    }
}

impl IntentModel for RestNluService {
    fn similarities(
        &self,
        language: &str,
        utterance: &str,
        probes: &[String],
    ) -> Option<Vec<f64>> {
        if probes.is_empty() {
            return Some(Vec::new());
        }
        let request = ModelRequest {
            language,
            utterance,
            probes,
        };
        let response: IntentResponse = self.post(&self.config.intent_url, &request)?;
        if response.probabilities.len() != probes.len() {
            warn!(
                "intent model returned {} probabilities for {} probes",
                response.probabilities.len(),
                probes.len()
            );
            return None;
        }
        Some(response.probabilities)
    }
}

impl SpanModel for RestNluService {
    fn slot_spans(
        &self,
        language: &str,
        utterance: &str,
        probes: &[String],
    ) -> Option<SpanModelOutput> {
        if probes.is_empty() {
            return Some(SpanModelOutput::default());
        }
        let request = ModelRequest {
            language,
            utterance,
            probes,
        };
        let response: SpanResponse = self.post(&self.config.span_url, &request)?;
        if response.class_logits.len() != probes.len() * 3
            || response.start_logits.len() != probes.len()
            || response.end_logits.len() != probes.len()
        {
            warn!("span model response shape mismatch");
            return None;
        }
        let class_probs = response
            .class_logits
            .chunks_exact(3)
            .map(|chunk| {
                let p = softmax3(chunk[0], chunk[1], chunk[2]);
                SlotClassProbs {
                    no_mention: p[0],
                    has_value: p[1],
                    dont_care: p[2],
                }
            })
            .collect();
        Some(SpanModelOutput {
            tokens: response.tokens,
            class_probs,
            start_logits: response.start_logits,
            end_logits: response.end_logits,
        })
    }
}

fn softmax3(a: f64, b: f64, c: f64) -> [f64; 3] {
    let max = a.max(b).max(c);
    let ea = (a - max).exp();
    let eb = (b - max).exp();
    let ec = (c - max).exp();
    let sum = ea + eb + ec;
    [ea / sum, eb / sum, ec / sum]
}

/// Intent model with canned per-probe scores, for tests.
#[derive(Debug, Clone, Default)]
pub struct MockIntentModel {
    scores: HashMap<String, f64>,
    /// Score for probes not present in `scores`.
    pub default_score: f64,
}

impl MockIntentModel {
    /// Create a mock with fixed probe scores.
    #[must_use]
    pub fn new(scores: HashMap<String, f64>) -> Self {
        Self {
            scores,
            default_score: 0.0,
        }
    }

    /// Add one probe score.
    #[must_use]
    pub fn with_score(mut self, probe: impl Into<String>, score: f64) -> Self {
        self.scores.insert(probe.into(), score);
        self
    }
}

impl IntentModel for MockIntentModel {
    fn similarities(
        &self,
        _language: &str,
        _utterance: &str,
        probes: &[String],
    ) -> Option<Vec<f64>> {
        Some(
            probes
                .iter()
                .map(|p| self.scores.get(p).copied().unwrap_or(self.default_score))
                .collect(),
        )
    }
}

/// Span model returning one canned output, for tests.
#[derive(Debug, Clone, Default)]
pub struct MockSpanModel {
    /// Output returned for every call; `None` simulates service failure.
    pub output: Option<SpanModelOutput>,
}

impl MockSpanModel {
    /// A mock that always fails (service unavailable).
    #[must_use]
    pub fn unavailable() -> Self {
        Self { output: None }
    }

    /// A mock returning `output` for every call.
    #[must_use]
    pub fn with_output(output: SpanModelOutput) -> Self {
        Self {
            output: Some(output),
        }
    }
}

impl SpanModel for MockSpanModel {
    fn slot_spans(
        &self,
        _language: &str,
        _utterance: &str,
        _probes: &[String],
    ) -> Option<SpanModelOutput> {
        self.output.clone()
    }
}
