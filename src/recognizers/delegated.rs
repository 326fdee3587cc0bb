//! Delegated entity service recognizer.
//!
//! Recognizes entities that need world knowledge — dates, times, numbers,
//! ordinals, phone numbers, emails, money — by delegating to an external
//! text-to-structured-value service over HTTP.
//!
//! The service's coarse dimension system is mapped onto the schema's fully
//! qualified entity types. Temporal values fan out to up to five candidate
//! types at different granularities (year, year-month, date, time,
//! datetime); only types the schema actually declares for this recognizer
//! are kept. The default call suppresses ordinal values, so when an ordinal
//! type is required a second query with an explicit dimension filter is
//! issued.
//!
//! Failure semantics: a transport error or non-200 response yields zero
//! spans for that call, never an error. Each call carries a fixed timeout.

use crate::context::DuContext;
use crate::recognizers::EntityRecognizer;
use crate::schema::SchemaProvider;
use crate::span::{RecognizerKind, SpanInfo};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Temporal candidate types, coarsest to finest.
const TEMPORAL_TYPES: [&str; 5] = [
    "system.Year",
    "system.YearMonth",
    "system.Date",
    "system.Time",
    "system.DateTime",
];

/// Leading preposition tokens trimmed from date/time spans so the span
/// boundary matches user-facing conventions ("on monday" -> "monday").
const TRIMMED_PREPOSITIONS: [&str; 2] = ["on ", "at "];

/// Configuration for the delegated entity service.
#[derive(Debug, Clone)]
pub struct DelegatedConfig {
    /// Service endpoint URL.
    pub endpoint: String,
    /// Locale sent with each request (e.g. `en_US`).
    pub locale: String,
    /// IANA timezone sent with each request.
    pub timezone: String,
    /// Per-call timeout.
    pub timeout: Duration,
}

impl Default for DelegatedConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8000/parse".to_string(),
            locale: "en_US".to_string(),
            timezone: "UTC".to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Serialize)]
struct ServiceRequest<'a> {
    text: &'a str,
    locale: &'a str,
    tz: &'a str,
    /// Reference instant (epoch millis) relative values resolve against
    /// ("tomorrow", "in an hour").
    reftime: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    dims: Option<&'a [&'a str]>,
}

/// One span as returned by the external service.
#[derive(Debug, Clone, Deserialize)]
struct ServiceSpan {
    dim: String,
    start: usize,
    end: usize,
    #[serde(default)]
    latent: bool,
    #[serde(default)]
    value: serde_json::Value,
}

/// Recognizer delegating to the external extraction service.
pub struct DelegatedEntityRecognizer {
    config: DelegatedConfig,
    /// Entity types the schema declares for this recognizer; everything
    /// else the service proposes is dropped.
    required_types: HashSet<String>,
}

impl DelegatedEntityRecognizer {
    /// Build the recognizer, collecting the schema's required types.
    #[must_use]
    pub fn build(schema: &dyn SchemaProvider, config: DelegatedConfig) -> Self {
        let required_types = schema
            .entity_types()
            .into_iter()
            .filter(|t| {
                schema
                    .entity_meta(t)
                    .is_some_and(|m| m.recognizers.contains(&RecognizerKind::DelegatedService))
            })
            .collect();
        Self {
            config,
            required_types,
        }
    }

    fn call(&self, text: &str, dims: Option<&[&str]>) -> Vec<ServiceSpan> {
        let request = ServiceRequest {
            text,
            locale: &self.config.locale,
            tz: &self.config.timezone,
            reftime: chrono::Utc::now().timestamp_millis(),
            dims,
        };
        let response = ureq::post(&self.config.endpoint)
            .timeout(self.config.timeout)
            .send_json(&request);
        match response {
            Ok(resp) if resp.status() == 200 => match resp.into_json::<Vec<ServiceSpan>>() {
                Ok(spans) => spans,
                Err(e) => {
                    warn!("entity service returned malformed payload: {e}");
                    Vec::new()
                }
            },
            Ok(resp) => {
                warn!("entity service returned status {}", resp.status());
                Vec::new()
            }
            Err(e) => {
                warn!("entity service call failed: {e}");
                Vec::new()
            }
        }
    }

    /// Map one service span to schema entity types, keeping only required
    /// ones. Temporal grains fan out to granularity candidates.
    fn map_types(&self, span: &ServiceSpan) -> Vec<String> {
        let candidates: Vec<&str> = match span.dim.as_str() {
            "time" => {
                let grain = span.value.get("grain").and_then(|g| g.as_str()).unwrap_or("");
                match grain {
                    "year" => vec!["system.Year"],
                    "month" => vec!["system.Year", "system.YearMonth"],
                    "week" | "day" => vec!["system.Date", "system.DateTime"],
                    "hour" | "minute" | "second" => vec!["system.Time", "system.DateTime"],
                    // Unknown grain: offer every granularity, let the
                    // requirement filter decide.
                    _ => TEMPORAL_TYPES.to_vec(),
                }
            }
            "number" => vec!["system.Number"],
            "ordinal" => vec!["system.Ordinal"],
            "phone-number" => vec!["system.PhoneNumber"],
            "email" => vec!["system.Email"],
            "amount-of-money" => vec!["system.Money"],
            "duration" => vec!["system.Duration"],
            other => {
                debug!("unmapped entity service dimension: {other}");
                vec![]
            }
        };
        candidates
            .into_iter()
            .filter(|t| self.required_types.contains(*t))
            .map(String::from)
            .collect()
    }

    fn normalized_value(span: &ServiceSpan) -> String {
        match span.value.get("value") {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(v) => v.to_string(),
            None => span.value.to_string(),
        }
    }

    /// Trim a leading preposition token from a date/time span.
    fn trim_prepositions(utterance: &str, start: usize, end: usize) -> (usize, usize) {
        let text: String = utterance
            .chars()
            .skip(start)
            .take(end.saturating_sub(start))
            .collect();
        let lower = text.to_lowercase();
        for prep in TRIMMED_PREPOSITIONS {
            if lower.starts_with(prep) {
                return (start + prep.chars().count(), end);
            }
        }
        (start, end)
    }

    fn needs_ordinal(&self) -> bool {
        self.required_types.contains("system.Ordinal")
    }
}

impl EntityRecognizer for DelegatedEntityRecognizer {
    fn recognize(&self, ctx: &DuContext) -> Vec<SpanInfo> {
        if self.required_types.is_empty() || ctx.utterance.is_empty() {
            return Vec::new();
        }

        let mut raw = self.call(&ctx.utterance, None);
        if self.needs_ordinal() {
            // The default call suppresses ordinals; re-issue with an
            // explicit dimension filter.
            raw.extend(self.call(&ctx.utterance, Some(&["ordinal"])));
        }

        let len = ctx.len();
        let mut spans = Vec::new();
        for service_span in &raw {
            if service_span.start >= service_span.end || service_span.end > len {
                continue;
            }
            let types = self.map_types(service_span);
            if types.is_empty() {
                continue;
            }
            let temporal = service_span.dim == "time";
            let (start, end) = if temporal {
                Self::trim_prepositions(&ctx.utterance, service_span.start, service_span.end)
            } else {
                (service_span.start, service_span.end)
            };
            let value = Self::normalized_value(service_span);
            for entity_type in types {
                spans.push(
                    SpanInfo::new(
                        entity_type,
                        start,
                        end,
                        value.clone(),
                        RecognizerKind::DelegatedService,
                    )
                    .latent(service_span.latent),
                );
            }
        }
        spans
    }

    fn name(&self) -> &'static str {
        "delegated-service"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntityTypeMeta, StaticSchema};
    use std::collections::HashMap;

    fn schema_with(types: &[&str]) -> StaticSchema {
        let mut schema = StaticSchema::new("en");
        for t in types {
            schema.add_entity(
                *t,
                EntityTypeMeta {
                    recognizers: vec![RecognizerKind::DelegatedService],
                    ..EntityTypeMeta::default()
                },
                HashMap::new(),
            );
        }
        schema
    }

    fn recognizer(types: &[&str]) -> DelegatedEntityRecognizer {
        DelegatedEntityRecognizer::build(&schema_with(types), DelegatedConfig::default())
    }

    fn time_span(grain: &str) -> ServiceSpan {
        ServiceSpan {
            dim: "time".to_string(),
            start: 0,
            end: 6,
            latent: false,
            value: serde_json::json!({"value": "2024-03-01", "grain": grain}),
        }
    }

    #[test]
    fn test_grain_fans_out_and_filters_by_requirement() {
        let rec = recognizer(&["system.Date", "system.Time"]);
        let types = rec.map_types(&time_span("day"));
        assert_eq!(types, vec!["system.Date".to_string()]);

        let rec = recognizer(&["system.DateTime"]);
        let types = rec.map_types(&time_span("hour"));
        assert_eq!(types, vec!["system.DateTime".to_string()]);

        // Nothing required -> everything dropped, even valid proposals.
        let rec = recognizer(&["system.Number"]);
        assert!(rec.map_types(&time_span("day")).is_empty());
    }

    #[test]
    fn test_unknown_grain_offers_all_granularities() {
        let rec = recognizer(&TEMPORAL_TYPES);
        let types = rec.map_types(&time_span("mystery"));
        assert_eq!(types.len(), 5);
    }

    #[test]
    fn test_non_temporal_dimensions() {
        let rec = recognizer(&["system.Ordinal", "system.PhoneNumber"]);
        let ordinal = ServiceSpan {
            dim: "ordinal".to_string(),
            start: 0,
            end: 3,
            latent: false,
            value: serde_json::json!({"value": 3}),
        };
        assert_eq!(rec.map_types(&ordinal), vec!["system.Ordinal".to_string()]);
        assert!(rec.needs_ordinal());
        assert!(!recognizer(&["system.Date"]).needs_ordinal());
    }

    #[test]
    fn test_preposition_trimming() {
        let utterance = "meet on monday";
        let (start, end) = DelegatedEntityRecognizer::trim_prepositions(utterance, 5, 14);
        assert_eq!((start, end), (8, 14));
        // No preposition: unchanged.
        let (start, end) = DelegatedEntityRecognizer::trim_prepositions(utterance, 8, 14);
        assert_eq!((start, end), (8, 14));
    }

    #[test]
    fn test_normalized_value_variants() {
        let s = time_span("day");
        assert_eq!(DelegatedEntityRecognizer::normalized_value(&s), "2024-03-01");
        let n = ServiceSpan {
            dim: "number".to_string(),
            start: 0,
            end: 1,
            latent: false,
            value: serde_json::json!({"value": 7}),
        };
        assert_eq!(DelegatedEntityRecognizer::normalized_value(&n), "7");
    }
}
