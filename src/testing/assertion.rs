use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

use super::json_path::{lookup, value_to_string};
use crate::error::{CheckError, CheckResult};
use crate::http::response::Response;

/// Target of an assertion within the HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AssertionTarget {
    StatusCode,
    Header(String),
    JsonPath(String),
    Body,
    ResponseTimeMs,
}

impl Display for AssertionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssertionTarget::StatusCode => write!(f, "status code"),
            AssertionTarget::Header(name) => write!(f, "header `{name}`"),
            AssertionTarget::JsonPath(path) => write!(f, "json path `{path}`"),
            AssertionTarget::Body => write!(f, "body"),
            AssertionTarget::ResponseTimeMs => write!(f, "response time (ms)"),
        }
    }
}

/// Comparison operator for an assertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssertionOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    GreaterThan,
    LessThan,
    Exists,
    NotExists,
    Matches,
}

impl Display for AssertionOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AssertionOperator::Equals => "equals",
            AssertionOperator::NotEquals => "does not equal",
            AssertionOperator::Contains => "contains",
            AssertionOperator::NotContains => "does not contain",
            AssertionOperator::GreaterThan => "is greater than",
            AssertionOperator::LessThan => "is less than",
            AssertionOperator::Exists => "exists",
            AssertionOperator::NotExists => "does not exist",
            AssertionOperator::Matches => "matches",
        };
        write!(f, "{label}")
    }
}

/// A single assertion that can be evaluated against a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assertion {
    pub target: AssertionTarget,
    pub operator: AssertionOperator,
    #[serde(default)]
    pub expected: String,
}

impl Assertion {
    pub fn new(target: AssertionTarget, operator: AssertionOperator, expected: impl Into<String>) -> Self {
        Self {
            target,
            operator,
            expected: expected.into(),
        }
    }

    pub fn status_equals(status: u16) -> Self {
        Self::new(AssertionTarget::StatusCode, AssertionOperator::Equals, status.to_string())
    }

    pub fn describe(&self) -> String {
        match self.operator {
            AssertionOperator::Exists | AssertionOperator::NotExists => {
                format!("{} {}", self.target, self.operator)
            }
            _ => format!("{} {} `{}`", self.target, self.operator, self.expected),
        }
    }
}

/// Result of evaluating an assertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertionResult {
    pub assertion: Assertion,
    pub passed: bool,
    pub actual: Option<String>,
    pub message: String,
}

fn actual_value(target: &AssertionTarget, response: &Response) -> CheckResult<Option<String>> {
    Ok(match target {
        AssertionTarget::StatusCode => Some(response.status.to_string()),
        AssertionTarget::Header(name) => response.header(name).map(str::to_string),
        AssertionTarget::Body => Some(response.body_text()),
        AssertionTarget::ResponseTimeMs => Some(response.duration.as_millis().to_string()),
        AssertionTarget::JsonPath(path) => {
            let document = response.body_json().ok_or_else(|| {
                CheckError::AssertionEvaluation(format!(
                    "json path `{path}` requested but the response body is not JSON"
                ))
            })?;
            lookup(&document, path).map(value_to_string)
        }
    })
}

fn parse_number(label: &str, value: &str) -> CheckResult<f64> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|_| CheckError::AssertionEvaluation(format!("{label} `{value}` is not a number")))
}

fn loosely_equal(actual: &str, expected: &str) -> bool {
    if actual == expected {
        return true;
    }
    match (actual.trim().parse::<f64>(), expected.trim().parse::<f64>()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Evaluates one assertion. `Err` means the assertion could not be evaluated
/// at all (bad regex, non-numeric comparison, non-JSON body), which is
/// distinct from an assertion that ran and failed.
pub fn evaluate(assertion: &Assertion, response: &Response) -> CheckResult<AssertionResult> {
    let actual = actual_value(&assertion.target, response)?;
    let expected = assertion.expected.as_str();

    let passed = match (assertion.operator, actual.as_deref()) {
        (AssertionOperator::Exists, found) => found.is_some(),
        (AssertionOperator::NotExists, found) => found.is_none(),
        (_, None) => false,
        (AssertionOperator::Equals, Some(actual)) => loosely_equal(actual, expected),
        (AssertionOperator::NotEquals, Some(actual)) => !loosely_equal(actual, expected),
        (AssertionOperator::Contains, Some(actual)) => actual.contains(expected),
        (AssertionOperator::NotContains, Some(actual)) => !actual.contains(expected),
        (AssertionOperator::GreaterThan, Some(actual)) => {
            parse_number("actual value", actual)? > parse_number("expected value", expected)?
        }
        (AssertionOperator::LessThan, Some(actual)) => {
            parse_number("actual value", actual)? < parse_number("expected value", expected)?
        }
        (AssertionOperator::Matches, Some(actual)) => Regex::new(expected)
            .map_err(|err| CheckError::AssertionEvaluation(format!("invalid pattern `{expected}`: {err}")))?
            .is_match(actual),
    };

    let message = if passed {
        format!("{} passed", assertion.describe())
    } else {
        match actual.as_deref() {
            Some(actual) => format!("expected {}, got `{actual}`", assertion.describe()),
            None => format!("expected {}, but {} was not found", assertion.describe(), assertion.target),
        }
    };

    Ok(AssertionResult {
        assertion: assertion.clone(),
        passed,
        actual,
        message,
    })
}

pub fn evaluate_all(assertions: &[Assertion], response: &Response) -> CheckResult<Vec<AssertionResult>> {
    assertions
        .iter()
        .map(|assertion| evaluate(assertion, response))
        .collect()
}

/// Message of the first failing result, if any.
pub fn first_failure(results: &[AssertionResult]) -> Option<&str> {
    results
        .iter()
        .find(|result| !result.passed)
        .map(|result| result.message.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::response::test_response;

    fn response() -> Response {
        let mut response = test_response(201, "application/json", r#"{"id":7,"name":"Alice","tags":["a"]}"#);
        response.headers.push(("X-Rate".into(), "99".into()));
        response
    }

    #[test]
    fn status_and_header_assertions() {
        let response = response();
        assert!(evaluate(&Assertion::status_equals(201), &response).unwrap().passed);
        assert!(!evaluate(&Assertion::status_equals(200), &response).unwrap().passed);

        let rate = Assertion::new(
            AssertionTarget::Header("x-rate".into()),
            AssertionOperator::LessThan,
            "100",
        );
        assert!(evaluate(&rate, &response).unwrap().passed);
    }

    #[test]
    fn json_path_assertions() {
        let response = response();
        let id = Assertion::new(AssertionTarget::JsonPath("id".into()), AssertionOperator::Equals, "7.0");
        assert!(evaluate(&id, &response).unwrap().passed);

        let name = Assertion::new(AssertionTarget::JsonPath("$.name".into()), AssertionOperator::Matches, "^Al");
        assert!(evaluate(&name, &response).unwrap().passed);

        let missing = Assertion::new(AssertionTarget::JsonPath("email".into()), AssertionOperator::Equals, "x");
        let result = evaluate(&missing, &response).unwrap();
        assert!(!result.passed);
        assert!(result.message.contains("was not found"));

        let absent = Assertion::new(AssertionTarget::JsonPath("email".into()), AssertionOperator::NotExists, "");
        assert!(evaluate(&absent, &response).unwrap().passed);
    }

    #[test]
    fn evaluation_errors_are_distinct_from_failures() {
        let response = response();
        let bad_regex = Assertion::new(AssertionTarget::Body, AssertionOperator::Matches, "(");
        assert!(matches!(evaluate(&bad_regex, &response), Err(CheckError::AssertionEvaluation(_))));

        let non_numeric = Assertion::new(
            AssertionTarget::JsonPath("name".into()),
            AssertionOperator::GreaterThan,
            "3",
        );
        assert!(matches!(evaluate(&non_numeric, &response), Err(CheckError::AssertionEvaluation(_))));

        let text = test_response(200, "text/plain", "hello");
        let json = Assertion::new(AssertionTarget::JsonPath("a".into()), AssertionOperator::Exists, "");
        assert!(matches!(evaluate(&json, &text), Err(CheckError::AssertionEvaluation(_))));
    }

    #[test]
    fn first_failure_message() {
        let response = response();
        let results = evaluate_all(
            &[
                Assertion::status_equals(201),
                Assertion::new(AssertionTarget::Body, AssertionOperator::Contains, "Bob"),
            ],
            &response,
        )
        .unwrap();
        assert_eq!(
            first_failure(&results),
            Some("expected body contains `Bob`, got `{\"id\":7,\"name\":\"Alice\",\"tags\":[\"a\"]}`")
        );
    }

    #[test]
    fn deserializes_from_json() {
        let assertion: Assertion = serde_json::from_str(
            r#"{"target":{"kind":"json_path","value":"id"},"operator":"equals","expected":"7"}"#,
        )
        .unwrap();
        assert_eq!(assertion.target, AssertionTarget::JsonPath("id".into()));
        let status: Assertion =
            serde_json::from_str(r#"{"target":{"kind":"status_code"},"operator":"exists"}"#).unwrap();
        assert_eq!(status.operator, AssertionOperator::Exists);
    }
}
