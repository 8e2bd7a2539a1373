//! Failure knowledge base built from recorded task telemetry.
//!
//! Every failed task event updates a bucket for its failure code and one per
//! context it carries (stage, task, error type and their pairs), plus a global
//! bucket. A lookup scores each bucket's most frequent suggestion by support
//! plus a fixed context weight, so a specific match beats a generic one.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use serde::Serialize;
use serde_json::Value;
use stagehand_core::json::{canonical_string, str_field};

use crate::event::{TelemetryEvent, TelemetryEventType};
use crate::suggestion::{FailureSignature, RemediationAdvisor, RemediationSuggestion};

/// Context weights, in evaluation order.
pub const FAILURE_CODE_WEIGHT: f64 = 2.5;
pub const STAGE_TASK_WEIGHT: f64 = 2.1;
pub const TASK_ERROR_WEIGHT: f64 = 1.9;
pub const STAGE_ERROR_WEIGHT: f64 = 1.8;
pub const STAGE_WEIGHT: f64 = 1.6;
pub const TASK_WEIGHT: f64 = 1.5;
pub const ERROR_WEIGHT: f64 = 1.4;
pub const GLOBAL_WEIGHT: f64 = 1.2;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum BucketKey {
    FailureCode(String),
    StageTask(String, String),
    TaskError(String, String),
    StageError(String, String),
    Stage(String),
    Task(String),
    Error(String),
    Global,
}

impl BucketKey {
    const fn weight(&self) -> f64 {
        match self {
            Self::FailureCode(_) => FAILURE_CODE_WEIGHT,
            Self::StageTask(..) => STAGE_TASK_WEIGHT,
            Self::TaskError(..) => TASK_ERROR_WEIGHT,
            Self::StageError(..) => STAGE_ERROR_WEIGHT,
            Self::Stage(_) => STAGE_WEIGHT,
            Self::Task(_) => TASK_WEIGHT,
            Self::Error(_) => ERROR_WEIGHT,
            Self::Global => GLOBAL_WEIGHT,
        }
    }

    /// Keys derivable from the given context, most specific first.
    fn for_context(
        failure_code: Option<&str>,
        stage: Option<&str>,
        task: Option<&str>,
        error: Option<&str>,
    ) -> Vec<Self> {
        let pair = |a: Option<&str>, b: Option<&str>| a.zip(b).map(|(a, b)| (a.to_string(), b.to_string()));
        [
            failure_code.map(|c| Self::FailureCode(c.to_string())),
            pair(stage, task).map(|(s, t)| Self::StageTask(s, t)),
            pair(task, error).map(|(t, e)| Self::TaskError(t, e)),
            pair(stage, error).map(|(s, e)| Self::StageError(s, e)),
            stage.map(|s| Self::Stage(s.to_string())),
            task.map(|t| Self::Task(t.to_string())),
            error.map(|e| Self::Error(e.to_string())),
            Some(Self::Global),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

#[derive(Debug, Clone)]
struct SuggestionStats {
    fingerprint: String,
    suggestion: RemediationSuggestion,
    count: u64,
    confidence: f64,
}

/// Aggregated history for one bucket.
#[derive(Debug, Clone, Default)]
pub struct FailureInsight {
    occurrences: u64,
    fixes: Vec<SuggestionStats>,
}

impl FailureInsight {
    fn record(&mut self, suggestion: Option<&RemediationSuggestion>) {
        self.occurrences = self.occurrences.saturating_add(1);
        let Some(suggestion) = suggestion else {
            return;
        };
        let fingerprint = fingerprint(suggestion);
        if let Some(stats) = self.fixes.iter_mut().find(|s| s.fingerprint == fingerprint) {
            stats.count = stats.count.saturating_add(1);
            stats.confidence = stats.confidence.max(suggestion.confidence);
        } else {
            self.fixes.push(SuggestionStats {
                fingerprint,
                suggestion: suggestion.clone(),
                count: 1,
                confidence: suggestion.confidence,
            });
        }
    }

    #[must_use]
    pub const fn occurrences(&self) -> u64 {
        self.occurrences
    }

    /// The most frequent suggestion, earliest first on ties, with confidence
    /// raised to its support ratio when that is higher.
    #[must_use]
    pub fn top_fix(&self) -> Option<RemediationSuggestion> {
        let best = self
            .fixes
            .iter()
            .fold(None::<&SuggestionStats>, |best, candidate| match best {
                Some(b) if b.count >= candidate.count => Some(b),
                _ => Some(candidate),
            })?;
        #[allow(clippy::cast_precision_loss)]
        let support = if self.occurrences == 0 {
            0.0
        } else {
            best.count as f64 / self.occurrences as f64
        };
        let mut suggestion = best.suggestion.clone();
        suggestion.confidence = best.confidence.max(support);
        Some(suggestion)
    }
}

/// Canonical JSON of a suggestion with its confidence removed.
fn fingerprint(suggestion: &RemediationSuggestion) -> String {
    let mut payload = suggestion.to_payload();
    if let Value::Object(map) = &mut payload {
        map.remove("confidence");
    }
    canonical_string(&payload)
}

/// Summary row returned by [`TelemetryKnowledgeBase::summarize`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InsightSummary {
    pub occurrences: u64,
    pub top_fix: Option<String>,
}

/// Thread-safe aggregator of failure telemetry.
#[derive(Debug, Default)]
pub struct TelemetryKnowledgeBase {
    buckets: RwLock<HashMap<BucketKey, FailureInsight>>,
}

impl TelemetryKnowledgeBase {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event into the buckets. Anything other than a failed task
    /// event with a failure code is ignored.
    pub fn observe(&self, event: &TelemetryEvent) {
        if event.kind != TelemetryEventType::Task {
            return;
        }
        let metadata = &event.metadata;
        if metadata.get("status").and_then(Value::as_str) != Some("failed") {
            return;
        }
        let Some(failure_code) = str_field(metadata, "failure_code") else {
            return;
        };
        let suggestion = metadata
            .get("suggested_remediation")
            .and_then(RemediationSuggestion::from_payload)
            .or_else(|| str_field(metadata, "suggested_fix").map(RemediationSuggestion::new));

        let keys = BucketKey::for_context(
            Some(failure_code),
            str_field(metadata, "stage"),
            str_field(metadata, "task"),
            str_field(metadata, "error_type"),
        );
        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        for key in keys {
            buckets.entry(key).or_default().record(suggestion.as_ref());
        }
    }

    pub fn load<'a, I>(&self, events: I)
    where
        I: IntoIterator<Item = &'a TelemetryEvent>,
    {
        events.into_iter().for_each(|event| self.observe(event));
    }

    /// Best-scoring suggestion across every bucket the signature touches.
    #[must_use]
    pub fn suggest_fix(&self, signature: &FailureSignature) -> Option<RemediationSuggestion> {
        fn non_empty(value: &Option<String>) -> Option<&str> {
            value.as_deref().filter(|s| !s.is_empty())
        }
        let keys = BucketKey::for_context(
            non_empty(&signature.failure_code),
            non_empty(&signature.stage),
            non_empty(&signature.task),
            non_empty(&signature.error_type),
        );
        let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
        keys.iter()
            .filter_map(|key| {
                let suggestion = buckets.get(key)?.top_fix()?;
                Some((suggestion.confidence + key.weight(), suggestion))
            })
            .fold(None::<(f64, RemediationSuggestion)>, |best, candidate| match best {
                Some(b) if b.0 >= candidate.0 => Some(b),
                _ => Some(candidate),
            })
            .map(|(_, suggestion)| suggestion)
    }

    /// History recorded for one failure code.
    #[must_use]
    pub fn insight(&self, failure_code: &str) -> Option<FailureInsight> {
        self.buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&BucketKey::FailureCode(failure_code.to_string()))
            .cloned()
    }

    /// Occurrences and top fix title per failure code.
    #[must_use]
    pub fn summarize(&self) -> BTreeMap<String, InsightSummary> {
        self.buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(|(key, insight)| match key {
                BucketKey::FailureCode(code) => Some((
                    code.clone(),
                    InsightSummary {
                        occurrences: insight.occurrences,
                        top_fix: insight.top_fix().map(|s| s.title),
                    },
                )),
                _ => None,
            })
            .collect()
    }
}

impl RemediationAdvisor for TelemetryKnowledgeBase {
    fn suggest_fix(&self, signature: &FailureSignature) -> Option<RemediationSuggestion> {
        Self::suggest_fix(self, signature)
    }
}
