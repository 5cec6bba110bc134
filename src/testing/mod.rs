//! # Testing & Assertions
//!
//! The collection runner, dependent request sequences, and the assertion
//! and extraction rules both of them apply to responses.

pub mod assertion;
pub mod extract;
pub mod filter;
pub mod json_path;
pub mod report;
pub mod runner;
pub mod sequence;

pub use assertion::{Assertion, AssertionOperator, AssertionResult, AssertionTarget};
pub use extract::{Extraction, ExtractionSource};
pub use filter::RequestFilter;
pub use report::{SnapshotResult, Summary, TestReport, TestResult, TestStatus, TimingSummary};
pub use runner::TestRunner;
pub use sequence::{SequenceResult, SequenceRunner, SequenceStep, StepResult, TestSequence};
