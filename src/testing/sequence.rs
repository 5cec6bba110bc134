//! Ordered, dependent request chains sharing one variable scope.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::assertion::{evaluate_all, first_failure, Assertion, AssertionResult};
use super::extract::{extract_all, Extraction};
use super::report::TestStatus;
use crate::config::RunOptions;
use crate::engine::cancel::wait_or_cancel;
use crate::environment::{interpolate, VariableLayers};
use crate::error::{CheckError, CheckResult};
use crate::http::client::HttpExecutor;
use crate::http::request::Request;
use crate::http::response::Response;
use crate::persistence::Persistence;
use crate::schema::{OperationDescriptor, SchemaValidator, ValidationOutcome};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SequenceStep {
    pub name: String,
    pub request: Request,
    pub expected_status: Option<u16>,
    /// Runs after the request's own extractions; later names win.
    pub extract: Vec<Extraction>,
    pub wait_before_ms: u64,
    pub wait_after_ms: u64,
    pub skip: bool,
    /// `left == right` or `left != right`, compared after substitution.
    pub skip_condition: Option<String>,
    pub stop_on_fail: bool,
    pub validate_schema: bool,
    /// Checked after any assertions declared on `request` itself.
    pub assertions: Vec<Assertion>,
    /// Explicit values for this step only; they win over the sequence scope.
    pub variables: HashMap<String, String>,
}

impl SequenceStep {
    pub fn new(name: impl Into<String>, request: Request) -> Self {
        Self {
            name: name.into(),
            request,
            ..Self::default()
        }
    }

    pub fn expect_status(mut self, status: u16) -> Self {
        self.expected_status = Some(status);
        self
    }

    pub fn extract(mut self, extraction: Extraction) -> Self {
        self.extract.push(extraction);
        self
    }

    pub fn assert(mut self, assertion: Assertion) -> Self {
        self.assertions.push(assertion);
        self
    }

    pub fn skip_when(mut self, condition: impl Into<String>) -> Self {
        self.skip_condition = Some(condition.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TestSequence {
    pub name: String,
    pub description: Option<String>,
    pub variables: HashMap<String, String>,
    pub steps: Vec<SequenceStep>,
}

impl TestSequence {
    pub fn new(name: impl Into<String>, steps: Vec<SequenceStep>) -> Self {
        Self {
            name: name.into(),
            steps,
            ..Self::default()
        }
    }

    pub fn from_json(raw: &str) -> CheckResult<Self> {
        serde_json::from_str(raw).map_err(|err| CheckError::Config(format!("Failed to parse sequence: {err}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub name: String,
    pub index: usize,
    pub status: TestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Arc<Response>>,
    #[serde(default)]
    pub extracted: BTreeMap<String, String>,
    #[serde(default)]
    pub assertions: Vec<AssertionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<ValidationOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_status: Option<u16>,
    /// Skipped because its skip condition held, as opposed to `skip: true`.
    #[serde(default)]
    pub conditionally_skipped: bool,
    pub duration_ms: u64,
}

impl StepResult {
    fn new(index: usize, step: &SequenceStep) -> Self {
        let name = if step.name.trim().is_empty() {
            step.request.display_name()
        } else {
            step.name.clone()
        };
        Self {
            name,
            index,
            status: TestStatus::Passed,
            response: None,
            extracted: BTreeMap::new(),
            assertions: Vec::new(),
            schema: None,
            error: None,
            expected_status: step.expected_status,
            actual_status: None,
            conditionally_skipped: false,
            duration_ms: 0,
        }
    }

    fn fail(&mut self, status: TestStatus, message: impl Into<String>) {
        if self.status.is_failure() {
            return;
        }
        self.status = status;
        self.error = Some(message.into());
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceResult {
    pub name: String,
    pub success: bool,
    pub steps: Vec<StepResult>,
    pub duration_ms: u64,
    pub variables: BTreeMap<String, String>,
}

/// Evaluates `left == right` / `left != right` after substitution. Sides are
/// trimmed and may be quoted.
pub fn evaluate_condition(expression: &str, variables: &HashMap<String, String>) -> CheckResult<bool> {
    let resolved = interpolate(expression, variables);
    let (left, right, negated) = if let Some((left, right)) = resolved.split_once("!=") {
        (left, right, true)
    } else if let Some((left, right)) = resolved.split_once("==") {
        (left, right, false)
    } else {
        return Err(CheckError::AssertionEvaluation(format!(
            "skip condition `{expression}` must use `==` or `!=`"
        )));
    };

    let unquote = |side: &str| {
        let side = side.trim();
        side.strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .or_else(|| side.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
            .unwrap_or(side)
            .to_string()
    };
    let equal = unquote(left) == unquote(right);
    Ok(equal != negated)
}

/// Runs sequences step by step on the shared executor.
pub struct SequenceRunner {
    executor: Arc<HttpExecutor>,
    persistence: Arc<dyn Persistence>,
    schema: Option<Arc<dyn SchemaValidator>>,
    options: RunOptions,
}

impl SequenceRunner {
    pub fn new(executor: Arc<HttpExecutor>, persistence: Arc<dyn Persistence>, options: RunOptions) -> Self {
        Self {
            executor,
            persistence,
            schema: None,
            options,
        }
    }

    pub fn with_schema_validator(mut self, validator: Arc<dyn SchemaValidator>) -> Self {
        self.schema = Some(validator);
        self
    }

    /// Contents of the configured variable file, if any. Non-string JSON
    /// values are kept as their JSON text.
    pub fn load_variables(&self) -> CheckResult<HashMap<String, String>> {
        let Some(path) = self.options.variable_file.as_deref() else {
            return Ok(HashMap::new());
        };
        let Some(bytes) = self.persistence.read(path)? else {
            debug!(path, "variable file not found, starting empty");
            return Ok(HashMap::new());
        };

        let values: HashMap<String, serde_json::Value> = serde_json::from_slice(&bytes)
            .map_err(|err| CheckError::Config(format!("Variable file `{path}` is not a JSON object: {err}")))?;
        Ok(values
            .into_iter()
            .map(|(key, value)| {
                let value = match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (key, value)
            })
            .collect())
    }

    pub fn save_variables(&self, variables: &HashMap<String, String>) -> CheckResult<()> {
        let Some(path) = self.options.variable_file.as_deref() else {
            return Ok(());
        };
        let sorted: BTreeMap<&String, &String> = variables.iter().collect();
        let encoded = serde_json::to_vec_pretty(&sorted)?;
        self.persistence.write(path, &encoded)?;
        info!(path, count = sorted.len(), "saved sequence variables");
        Ok(())
    }

    /// Runs every sequence in order, threading saved variables between them.
    pub async fn run_all(&self, sequences: &[TestSequence]) -> CheckResult<Vec<SequenceResult>> {
        let mut run_variables = self.load_variables()?;
        let mut results = Vec::with_capacity(sequences.len());

        for sequence in sequences {
            if self.executor.cancel_token().is_cancelled() {
                warn!(sequence = %sequence.name, "run cancelled, skipping remaining sequences");
                break;
            }
            let result = self.run_sequence(sequence, &run_variables).await;
            run_variables.extend(result.variables.iter().map(|(k, v)| (k.clone(), v.clone())));
            results.push(result);
        }

        if self.options.save_variables {
            self.save_variables(&run_variables)?;
        }
        Ok(results)
    }

    fn should_stop(&self, step: &SequenceStep, result: &StepResult) -> bool {
        result.status.is_failure() && (self.options.fail_fast || step.stop_on_fail)
    }

    pub async fn run_sequence(&self, sequence: &TestSequence, run_variables: &HashMap<String, String>) -> SequenceResult {
        let started = Instant::now();
        let cancel = self.executor.cancel_token().clone();
        let mut scope = sequence.variables.clone();
        let mut steps = Vec::with_capacity(sequence.steps.len());
        let mut cancelled = false;

        info!(sequence = %sequence.name, steps = sequence.steps.len(), "running sequence");

        for (index, step) in sequence.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let result = self.run_step(index, step, &mut scope, run_variables).await;
            debug!(
                sequence = %sequence.name,
                step = %result.name,
                status = ?result.status,
                elapsed_ms = result.duration_ms,
                "step finished"
            );

            let stop = self.should_stop(step, &result);
            steps.push(result);
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            if stop {
                warn!(sequence = %sequence.name, step = index, "stopping sequence after failed step");
                break;
            }
        }

        let success = !cancelled && steps.iter().all(|step| !step.status.is_failure());
        SequenceResult {
            name: sequence.name.clone(),
            success,
            steps,
            duration_ms: started.elapsed().as_millis() as u64,
            variables: scope.into_iter().collect(),
        }
    }

    async fn run_step(
        &self,
        index: usize,
        step: &SequenceStep,
        scope: &mut HashMap<String, String>,
        run_variables: &HashMap<String, String>,
    ) -> StepResult {
        let started = Instant::now();
        let mut result = StepResult::new(index, step);

        if step.skip {
            result.status = TestStatus::Skipped;
            return result;
        }

        let variables = VariableLayers::new()
            .environment(&self.options.environment)
            .run(run_variables)
            .sequence(scope)
            .step(&step.variables)
            .resolve();

        if let Some(condition) = step.skip_condition.as_deref().filter(|c| !c.trim().is_empty()) {
            match evaluate_condition(condition, &variables) {
                Ok(true) => {
                    result.status = TestStatus::Skipped;
                    result.conditionally_skipped = true;
                    return result;
                }
                Ok(false) => {}
                Err(err) => {
                    result.fail(TestStatus::Error, err.to_string());
                    return result;
                }
            }
        }

        let cancel = self.executor.cancel_token();
        if let Err(err) = wait_or_cancel(Duration::from_millis(step.wait_before_ms), cancel).await {
            result.fail(TestStatus::Error, err.to_string());
            return result;
        }

        match self.executor.execute(&step.request, &variables).await {
            Ok(response) => self.check_response(step, &mut result, scope, response),
            Err(err) => result.fail(TestStatus::Error, err.to_string()),
        }

        if !result.status.is_failure() {
            result.status = TestStatus::Passed;
        }
        result.duration_ms = started.elapsed().as_millis() as u64;

        if let Err(err) = wait_or_cancel(Duration::from_millis(step.wait_after_ms), cancel).await {
            result.fail(TestStatus::Error, err.to_string());
        }
        result
    }

    fn check_response(
        &self,
        step: &SequenceStep,
        result: &mut StepResult,
        scope: &mut HashMap<String, String>,
        response: Response,
    ) {
        let response = Arc::new(response);
        result.actual_status = Some(response.status);
        result.response = Some(response.clone());

        if let Some(expected) = step.expected_status {
            if expected != response.status {
                result.fail(
                    TestStatus::Failed,
                    format!("expected status {expected}, got {}", response.status),
                );
                return;
            }
        }

        if self.options.schema_validation || step.validate_schema {
            match self.validate_schema(&response) {
                Ok(outcome) => {
                    if !outcome.valid {
                        result.fail(
                            TestStatus::Failed,
                            format!("schema validation failed: {}", outcome.errors.join("; ")),
                        );
                    }
                    result.schema = Some(outcome);
                    if result.status.is_failure() {
                        return;
                    }
                }
                Err(err) => {
                    result.fail(TestStatus::Error, err.to_string());
                    return;
                }
            }
        }

        let assertions: Vec<Assertion> = step.request.assertions.iter().chain(&step.assertions).cloned().collect();
        match evaluate_all(&assertions, &response) {
            Ok(assertions) => {
                if let Some(message) = first_failure(&assertions) {
                    result.fail(TestStatus::Failed, message);
                }
                result.assertions = assertions;
                if result.status.is_failure() {
                    return;
                }
            }
            Err(err) => {
                result.fail(TestStatus::Error, err.to_string());
                return;
            }
        }

        let extractions: Vec<Extraction> = step.request.extract.iter().chain(&step.extract).cloned().collect();
        if self.options.extract_variables && !extractions.is_empty() {
            match extract_all(&extractions, &response) {
                Ok(values) => {
                    for (name, value) in values {
                        scope.insert(name.clone(), value.clone());
                        result.extracted.insert(name, value);
                    }
                }
                Err(err) => result.fail(TestStatus::Error, err.to_string()),
            }
        }
    }

    fn validate_schema(&self, response: &Response) -> CheckResult<ValidationOutcome> {
        let validator = self
            .schema
            .as_ref()
            .ok_or_else(|| CheckError::SchemaValidation("no schema validator configured".to_string()))?;
        validator.validate(
            response,
            &OperationDescriptor::for_response(response),
            &self.options.schema_options,
        )
    }
}
