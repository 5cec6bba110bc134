//! Schema validation seam. The engine only knows how to ask; the validator
//! itself (OpenAPI, JSON Schema, ...) is supplied by the embedding app.

use serde::{Deserialize, Serialize};

use crate::error::CheckResult;
use crate::http::response::Response;

/// Identifies the API operation a response should conform to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationDescriptor {
    pub method: String,
    pub path: String,
    pub status: u16,
}

impl OperationDescriptor {
    pub fn for_response(response: &Response) -> Self {
        Self {
            method: response.request.method.to_ascii_uppercase(),
            path: response.request.url_path(),
            status: response.status,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchemaOptions {
    /// Location of the schema document, interpreted by the validator.
    pub schema_path: Option<String>,
    /// Reject properties the schema does not declare.
    pub strict: bool,
    pub validate_headers: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOutcome {
    pub valid: bool,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ValidationOutcome {
    pub fn valid() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    pub fn invalid(errors: Vec<String>) -> Self {
        Self {
            valid: false,
            errors,
        }
    }
}

/// Returns `Ok` with `valid == false` for a response that violates the
/// schema; `Err` ([`crate::error::CheckError::SchemaValidation`]) only when
/// validation could not run.
pub trait SchemaValidator: Send + Sync {
    fn validate(
        &self,
        response: &Response,
        operation: &OperationDescriptor,
        options: &SchemaOptions,
    ) -> CheckResult<ValidationOutcome>;
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use crate::error::CheckError;

    /// Fails responses whose status is in `reject`, errors on `broken`.
    pub struct StatusSchema {
        pub reject: Vec<u16>,
        pub broken: bool,
    }

    impl SchemaValidator for StatusSchema {
        fn validate(
            &self,
            response: &Response,
            operation: &OperationDescriptor,
            _: &SchemaOptions,
        ) -> CheckResult<ValidationOutcome> {
            if self.broken {
                return Err(CheckError::SchemaValidation("schema document unavailable".into()));
            }
            if self.reject.contains(&response.status) {
                return Ok(ValidationOutcome::invalid(vec![format!(
                    "{} {} has no {} response",
                    operation.method, operation.path, operation.status
                )]));
            }
            Ok(ValidationOutcome::valid())
        }
    }
}
