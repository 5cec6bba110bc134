use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::assertion::AssertionResult;
use super::sequence::SequenceResult;
use crate::http::request::Request;
use crate::http::response::Response;
use crate::schema::ValidationOutcome;
use crate::snapshot::{SnapshotDiff, SnapshotOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
    Error,
}

impl TestStatus {
    pub fn is_failure(self) -> bool {
        matches!(self, TestStatus::Failed | TestStatus::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotResult {
    pub path: String,
    pub outcome: SnapshotOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<SnapshotDiff>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl SnapshotResult {
    pub fn created(&self) -> bool {
        self.outcome == SnapshotOutcome::Created
    }

    pub fn updated(&self) -> bool {
        self.outcome == SnapshotOutcome::Updated
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub name: String,
    pub file: String,
    pub file_index: usize,
    pub request_index: usize,
    pub request: Arc<Request>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Arc<Response>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SnapshotResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<ValidationOutcome>,
    pub duration_ms: u64,
    pub status: TestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub extracted: BTreeMap<String, String>,
    #[serde(default)]
    pub assertions: Vec<AssertionResult>,
}

impl TestResult {
    pub fn new(file: &str, file_index: usize, request_index: usize, request: &Request) -> Self {
        Self {
            name: request.display_name(),
            file: file.to_string(),
            file_index,
            request_index,
            request: Arc::new(request.clone()),
            response: None,
            snapshot: None,
            schema: None,
            duration_ms: 0,
            status: TestStatus::Passed,
            error: None,
            tags: request.tags.clone(),
            extracted: BTreeMap::new(),
            assertions: Vec::new(),
        }
    }

    /// Records a failure. The first recorded failure is kept.
    pub fn fail(&mut self, status: TestStatus, message: impl Into<String>) {
        if self.status.is_failure() {
            return;
        }
        self.status = status;
        self.error = Some(message.into());
    }
}

/// Request latency figures in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingSummary {
    pub min_ms: f64,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub max_ms: f64,
}

fn round_to_3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

impl TimingSummary {
    /// `None` for an empty sample set.
    pub fn from_samples(samples_ms: &[f64]) -> Option<Self> {
        if samples_ms.is_empty() {
            return None;
        }

        let mut histogram = Histogram::<u64>::new_with_bounds(1, 3_600_000_000, 3).ok()?;
        let mut min = f64::MAX;
        let mut max = 0.0f64;
        let mut sum = 0.0;
        for &sample in samples_ms {
            min = min.min(sample);
            max = max.max(sample);
            sum += sample;
            let micros = (sample * 1000.0).round().max(1.0) as u64;
            let _ = histogram.record(micros.min(3_600_000_000));
        }

        Some(Self {
            min_ms: round_to_3(min),
            avg_ms: round_to_3(sum / samples_ms.len() as f64),
            p50_ms: round_to_3(histogram.value_at_quantile(0.50) as f64 / 1000.0),
            p95_ms: round_to_3(histogram.value_at_quantile(0.95) as f64 / 1000.0),
            max_ms: round_to_3(max),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: usize,
    pub created: usize,
    pub updated: usize,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing: Option<TimingSummary>,
}

impl Summary {
    pub fn from_results(results: &[TestResult], duration_ms: u64) -> Self {
        let mut summary = Summary {
            total: results.len(),
            duration_ms,
            ..Summary::default()
        };
        let mut samples = Vec::with_capacity(results.len());

        for result in results {
            match result.status {
                TestStatus::Passed => summary.passed += 1,
                TestStatus::Failed => summary.failed += 1,
                TestStatus::Skipped => summary.skipped += 1,
                TestStatus::Error => summary.errors += 1,
            }
            if let Some(snapshot) = &result.snapshot {
                summary.created += usize::from(snapshot.created());
                summary.updated += usize::from(snapshot.updated());
            }
            if let Some(response) = &result.response {
                samples.push(response.duration.as_secs_f64() * 1000.0);
            }
        }

        summary.timing = TimingSummary::from_samples(&samples);
        summary
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestReport {
    pub summary: Summary,
    pub results: Vec<TestResult>,
    #[serde(default)]
    pub sequences: Vec<SequenceResult>,
}

impl TestReport {
    pub fn new(results: Vec<TestResult>, duration_ms: u64) -> Self {
        Self {
            summary: Summary::from_results(&results, duration_ms),
            results,
            sequences: Vec::new(),
        }
    }

    pub fn with_sequences(mut self, sequences: Vec<SequenceResult>) -> Self {
        self.sequences = sequences;
        self
    }

    pub fn has_failures(&self) -> bool {
        self.results.iter().any(|result| result.status.is_failure())
            || self
                .sequences
                .iter()
                .flat_map(|sequence| &sequence.steps)
                .any(|step| step.status.is_failure())
    }

    /// Process exit code for a CLI wrapper: 1 when anything failed or errored.
    pub fn exit_code(&self) -> i32 {
        i32::from(self.has_failures())
    }

    /// Restores file-then-request order, e.g. after a parallel run.
    pub fn sort_stable(&mut self) {
        self.results
            .sort_by_key(|result| (result.file_index, result.request_index));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(file_index: usize, request_index: usize, status: TestStatus) -> TestResult {
        let mut result = TestResult::new("f.json", file_index, request_index, &Request::new("GET", "http://x/"));
        result.status = status;
        result
    }

    #[test]
    fn summary_counts_each_status_once() {
        let results = vec![
            result(0, 0, TestStatus::Passed),
            result(0, 1, TestStatus::Failed),
            result(0, 2, TestStatus::Error),
            result(1, 0, TestStatus::Skipped),
            result(1, 1, TestStatus::Passed),
        ];
        let report = TestReport::new(results, 12);
        assert_eq!(report.summary.total, 5);
        assert_eq!(report.summary.passed, 2);
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.summary.errors, 1);
        assert_eq!(report.summary.skipped, 1);
        assert_eq!(report.summary.timing, None);
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn all_passing_exits_zero() {
        let report = TestReport::new(vec![result(0, 0, TestStatus::Passed), result(0, 1, TestStatus::Skipped)], 1);
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn sort_restores_original_order() {
        let mut report = TestReport::new(
            vec![
                result(1, 0, TestStatus::Passed),
                result(0, 1, TestStatus::Passed),
                result(0, 0, TestStatus::Passed),
            ],
            0,
        );
        report.sort_stable();
        let order: Vec<_> = report.results.iter().map(|r| (r.file_index, r.request_index)).collect();
        assert_eq!(order, vec![(0, 0), (0, 1), (1, 0)]);
    }

    #[test]
    fn timing_percentiles() {
        let samples: Vec<f64> = (1..=100).map(f64::from).collect();
        let timing = TimingSummary::from_samples(&samples).unwrap();
        assert_eq!(timing.min_ms, 1.0);
        assert_eq!(timing.max_ms, 100.0);
        assert_eq!(timing.avg_ms, 50.5);
        assert!((timing.p50_ms - 50.0).abs() < 0.1);
        assert!((timing.p95_ms - 95.0).abs() < 0.1);
    }
}
