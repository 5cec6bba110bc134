//! Collection runner: executes every selected request once and checks it
//! against its stored snapshot, sequentially or on a bounded worker pool.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::assertion::{evaluate_all, first_failure, Assertion};
use super::extract::extract_all;
use super::report::{SnapshotResult, TestReport, TestResult, TestStatus};
use super::sequence::{SequenceRunner, TestSequence};
use crate::collections::{RequestFile, RequestSource};
use crate::config::{RunOptions, UpdateMode};
use crate::error::{CheckError, CheckResult};
use crate::http::client::HttpExecutor;
use crate::http::response::Response;
use crate::http::session::SessionStore;
use crate::http::transport::{ReqwestSender, RetryingTransport};
use crate::persistence::Persistence;
use crate::schema::{OperationDescriptor, SchemaValidator};
use crate::snapshot::{SnapshotDiff, SnapshotOutcome, SnapshotStore};

/// Position of one selected request inside the input files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WorkItem {
    file_index: usize,
    request_index: usize,
}

#[derive(Clone)]
pub struct TestRunner {
    executor: Arc<HttpExecutor>,
    snapshots: Arc<SnapshotStore>,
    schema: Option<Arc<dyn SchemaValidator>>,
    options: Arc<RunOptions>,
}

impl TestRunner {
    /// Seeds the executor's variable store with `options.environment`.
    pub fn new(executor: Arc<HttpExecutor>, snapshots: Arc<SnapshotStore>, options: RunOptions) -> Self {
        executor.variables().merge(&options.environment);
        Self {
            executor,
            snapshots,
            schema: None,
            options: Arc::new(options),
        }
    }

    /// Wires the default stack: reqwest transport with the configured
    /// timeout and retry policy, an optional cookie jar and a snapshot store
    /// rooted at `snapshotDir`.
    pub fn from_options(
        options: RunOptions,
        persistence: Arc<dyn Persistence>,
        cancel: CancellationToken,
    ) -> CheckResult<Self> {
        options.validate()?;

        let sender = Arc::new(ReqwestSender::new(options.timeout())?);
        let transport = RetryingTransport::new(sender, options.retry.clone());
        let sessions = options.sessions.then(|| Arc::new(SessionStore::new()));
        let executor = HttpExecutor::new(transport, cancel).with_sessions(sessions);

        let snapshots = SnapshotStore::new(persistence, options.snapshot_dir.clone())
            .with_ignore_headers(options.ignore_headers.clone());

        Ok(Self::new(Arc::new(executor), Arc::new(snapshots), options))
    }

    pub fn with_schema_validator(mut self, validator: Arc<dyn SchemaValidator>) -> Self {
        self.schema = Some(validator);
        self
    }

    pub fn executor(&self) -> &Arc<HttpExecutor> {
        &self.executor
    }

    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// A sequence runner sharing this runner's executor, persistence and
    /// schema validator.
    pub fn sequence_runner(&self) -> SequenceRunner {
        let runner = SequenceRunner::new(
            self.executor.clone(),
            self.snapshots.persistence().clone(),
            self.options.as_ref().clone(),
        );
        match &self.schema {
            Some(validator) => runner.with_schema_validator(validator.clone()),
            None => runner,
        }
    }

    pub async fn run_source(&self, source: &dyn RequestSource) -> CheckResult<TestReport> {
        let files = source.files()?;
        self.run(&files).await
    }

    /// Runs the collections, then the sequences, into one report.
    pub async fn run_all(&self, files: &[RequestFile], sequences: &[TestSequence]) -> CheckResult<TestReport> {
        let report = self.run(files).await?;
        let sequences = self.sequence_runner().run_all(sequences).await?;
        Ok(report.with_sequences(sequences))
    }

    /// Runs every request that passes the filter. Only infrastructure
    /// failures come back as `Err`; everything else lands on a result.
    ///
    /// Sequential runs report results in file-then-request order. Parallel
    /// runs make no ordering promise; use [`TestReport::sort_stable`].
    pub async fn run(&self, files: &[RequestFile]) -> CheckResult<TestReport> {
        let started = Instant::now();
        self.snapshots.reset_stats();

        let work = self.plan(files);
        info!(
            files = files.len(),
            tests = work.len(),
            parallel = self.options.parallel,
            "starting test run"
        );

        let results = if self.options.parallel && work.len() > 1 {
            self.run_parallel(files, &work).await?
        } else {
            self.run_sequential(files, &work).await?
        };

        if self.options.cleanup_obsolete {
            self.cleanup(files, &work, &results)?;
        }

        let report = TestReport::new(results, started.elapsed().as_millis() as u64);
        let stats = self.snapshots.stats();
        info!(
            total = report.summary.total,
            passed = report.summary.passed,
            failed = report.summary.failed,
            errors = report.summary.errors,
            snapshots_created = stats.created,
            snapshots_updated = stats.updated,
            elapsed_ms = report.summary.duration_ms,
            "test run finished"
        );
        Ok(report)
    }

    fn plan(&self, files: &[RequestFile]) -> Vec<WorkItem> {
        let filter = &self.options.filter;
        let mut work = Vec::new();
        for (file_index, file) in files.iter().enumerate() {
            let before = work.len();
            work.extend(
                file.requests
                    .iter()
                    .enumerate()
                    .filter(|(_, request)| filter.matches(request))
                    .map(|(request_index, _)| WorkItem {
                        file_index,
                        request_index,
                    }),
            );
            if work.len() == before {
                debug!(file = %file.display_name(), "no matching requests, skipping file");
            }
        }
        work
    }

    async fn run_sequential(&self, files: &[RequestFile], work: &[WorkItem]) -> CheckResult<Vec<TestResult>> {
        let cancel = self.executor.cancel_token();
        let mut results = Vec::with_capacity(work.len());

        for item in work {
            if cancel.is_cancelled() {
                warn!(completed = results.len(), "run cancelled");
                break;
            }

            let result = self.run_one_test(&files[item.file_index], *item).await?;
            let failed = result.status.is_failure();
            results.push(result);
            if failed && self.options.stop_on_failure {
                warn!(completed = results.len(), "stopping run after failed test");
                break;
            }
        }
        Ok(results)
    }

    async fn run_parallel(&self, files: &[RequestFile], work: &[WorkItem]) -> CheckResult<Vec<TestResult>> {
        let worker_count = self.options.concurrency.max(1).min(work.len());
        let files = Arc::new(files.to_vec());
        let stop = Arc::new(AtomicBool::new(false));
        let fatal: Arc<Mutex<Option<CheckError>>> = Arc::new(Mutex::new(None));

        let (work_tx, work_rx) = mpsc::channel(work.len());
        for item in work {
            if work_tx.try_send(*item).is_err() {
                return Err(CheckError::Worker("work queue rejected an item".to_string()));
            }
        }
        drop(work_tx);
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));

        let (result_tx, mut result_rx) = mpsc::unbounded_channel();

        debug!(workers = worker_count, tests = work.len(), "starting worker pool");
        let mut handles = Vec::with_capacity(worker_count);
        for worker in 0..worker_count {
            let runner = self.clone();
            let files = files.clone();
            let stop = stop.clone();
            let fatal = fatal.clone();
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();

            let handle = tokio::spawn(async move {
                let cancel = runner.executor.cancel_token().clone();
                loop {
                    if stop.load(Ordering::Relaxed) || cancel.is_cancelled() {
                        break;
                    }

                    let next = work_rx.lock().await.recv().await;
                    let Some(item) = next else {
                        break;
                    };

                    match runner.run_one_test(&files[item.file_index], item).await {
                        Ok(result) => {
                            if result.status.is_failure() && runner.options.stop_on_failure {
                                debug!(worker, test = %result.name, "failure observed, stopping workers");
                                stop.store(true, Ordering::Relaxed);
                            }
                            let _ = result_tx.send(result);
                        }
                        Err(err) => {
                            warn!(worker, error = %err, "worker aborting run");
                            fatal.lock().get_or_insert(err);
                            stop.store(true, Ordering::Relaxed);
                            break;
                        }
                    }
                }
            });
            handles.push(handle);
        }
        drop(result_tx);

        for handle in handles {
            handle
                .await
                .map_err(|err| CheckError::Worker(format!("test worker crashed: {err}")))?;
        }

        if let Some(err) = fatal.lock().take() {
            return Err(err);
        }

        let mut results = Vec::with_capacity(work.len());
        while let Some(result) = result_rx.recv().await {
            results.push(result);
        }
        Ok(results)
    }

    /// Collection variables only fill keys the run store does not define.
    fn collection_variables(&self, file: &RequestFile) -> HashMap<String, String> {
        let store = self.executor.variables();
        file.variables
            .iter()
            .filter(|(key, _)| store.get(key).is_none())
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    async fn run_one_test(&self, file: &RequestFile, item: WorkItem) -> CheckResult<TestResult> {
        let request = &file.requests[item.request_index];
        let mut result = TestResult::new(&file.path, item.file_index, item.request_index, request);
        let started = Instant::now();

        let response = match self.executor.execute(request, &self.collection_variables(file)).await {
            Ok(response) => Arc::new(response),
            Err(err) if err.is_infrastructure() => return Err(err),
            Err(err) => {
                result.fail(TestStatus::Error, err.to_string());
                result.duration_ms = started.elapsed().as_millis() as u64;
                debug!(test = %result.name, error = ?result.error, "test errored");
                return Ok(result);
            }
        };
        result.request = response.request.clone();
        result.response = Some(response.clone());

        self.check_snapshot(&file.path, &response, &mut result)?;
        self.check_schema(&response, &mut result);
        self.check_assertions(request.assertions.as_slice(), &response, &mut result);

        if self.options.extract_variables && !request.extract.is_empty() {
            match extract_all(&request.extract, &response) {
                Ok(values) => {
                    self.executor.variables().merge(&values);
                    result.extracted.extend(values);
                }
                Err(err) => result.fail(TestStatus::Error, err.to_string()),
            }
        }

        result.duration_ms = started.elapsed().as_millis() as u64;
        debug!(
            test = %result.name,
            status = ?result.status,
            elapsed_ms = result.duration_ms,
            "test finished"
        );
        Ok(result)
    }

    fn record_snapshot(
        &self,
        result: &mut TestResult,
        path: String,
        outcome: SnapshotOutcome,
        diff: Option<SnapshotDiff>,
        note: Option<String>,
    ) {
        self.snapshots.record(outcome);
        result.snapshot = Some(SnapshotResult {
            path,
            outcome,
            diff,
            note,
        });
    }

    fn check_snapshot(&self, collection: &str, response: &Response, result: &mut TestResult) -> CheckResult<()> {
        let path = self.snapshots.snapshot_path(collection, &response.request);
        let mode = self.options.update_mode;

        if mode == UpdateMode::All {
            let outcome = self.snapshots.save_at(response, &path)?;
            self.record_snapshot(result, path, outcome.into(), None, None);
            return Ok(());
        }

        match self.snapshots.compare(response, &path) {
            Ok(diff) if diff.equal => {
                self.record_snapshot(result, path, SnapshotOutcome::Matched, None, None);
            }
            Ok(diff) if mode == UpdateMode::Failed => {
                let outcome = self.snapshots.save_at(response, &path)?;
                info!(path = %path, changes = %diff.summary(), "snapshot healed");
                self.record_snapshot(result, path, outcome.into(), Some(diff), None);
            }
            Ok(diff) => {
                result.fail(TestStatus::Failed, format!("snapshot mismatch: {}", diff.summary()));
                self.record_snapshot(result, path, SnapshotOutcome::Mismatched, Some(diff), None);
            }
            Err(CheckError::SnapshotMissing(_)) if mode == UpdateMode::Missing => {
                let outcome = self.snapshots.save_at(response, &path)?;
                self.record_snapshot(result, path, outcome.into(), None, None);
            }
            Err(CheckError::SnapshotMissing(_)) if self.options.fail_on_missing => {
                result.fail(TestStatus::Failed, format!("snapshot missing: {path}"));
                self.record_snapshot(result, path, SnapshotOutcome::Missing, None, None);
            }
            Err(CheckError::SnapshotMissing(_)) => {
                let note = "no snapshot recorded yet; run with update mode `missing` to create it".to_string();
                self.record_snapshot(result, path, SnapshotOutcome::Missing, None, Some(note));
            }
            Err(CheckError::SnapshotCorrupt { reason, .. }) if mode == UpdateMode::Failed => {
                let outcome = self.snapshots.save_at(response, &path)?;
                warn!(path = %path, reason = %reason, "replaced corrupt snapshot");
                let note = format!("replaced corrupt snapshot: {reason}");
                self.record_snapshot(result, path, outcome.into(), None, Some(note));
            }
            Err(err) if err.is_infrastructure() => return Err(err),
            Err(err) => result.fail(TestStatus::Error, err.to_string()),
        }
        Ok(())
    }

    fn check_schema(&self, response: &Response, result: &mut TestResult) {
        if !self.options.schema_validation {
            return;
        }
        let Some(validator) = &self.schema else {
            result.fail(TestStatus::Error, "schema validation requested but no validator is configured");
            return;
        };

        let operation = OperationDescriptor::for_response(response);
        match validator.validate(response, &operation, &self.options.schema_options) {
            Ok(outcome) => {
                if !outcome.valid {
                    result.fail(
                        TestStatus::Failed,
                        format!("schema validation failed: {}", outcome.errors.join("; ")),
                    );
                }
                result.schema = Some(outcome);
            }
            Err(err) => result.fail(TestStatus::Error, err.to_string()),
        }
    }

    fn check_assertions(
        &self,
        assertions: &[Assertion],
        response: &Response,
        result: &mut TestResult,
    ) {
        if assertions.is_empty() {
            return;
        }
        match evaluate_all(assertions, response) {
            Ok(outcomes) => {
                if let Some(message) = first_failure(&outcomes) {
                    result.fail(TestStatus::Failed, message);
                }
                result.assertions = outcomes;
            }
            Err(err) => result.fail(TestStatus::Error, err.to_string()),
        }
    }

    /// Deletes snapshots no test in this run touched. Skipped unless every
    /// request ran unfiltered and produced a snapshot verdict, so a partial
    /// run never removes live snapshots.
    fn cleanup(&self, files: &[RequestFile], work: &[WorkItem], results: &[TestResult]) -> CheckResult<()> {
        let total: usize = files.iter().map(|file| file.requests.len()).sum();
        let complete = self.options.filter.is_empty()
            && work.len() == total
            && results.len() == total
            && results.iter().all(|result| result.snapshot.is_some());
        if !complete {
            debug!("run incomplete, leaving snapshots in place");
            return Ok(());
        }

        let used: HashSet<String> = results
            .iter()
            .filter_map(|result| result.snapshot.as_ref())
            .map(|snapshot| snapshot.path.clone())
            .collect();
        let dirs: HashSet<String> = files
            .iter()
            .map(|file| self.snapshots.collection_dir(&file.path))
            .collect();

        for dir in dirs {
            let removed = self.snapshots.cleanup(&used, &dir)?;
            if !removed.is_empty() {
                info!(dir = %dir, removed = removed.len(), "cleaned up obsolete snapshots");
            }
        }
        Ok(())
    }
}
