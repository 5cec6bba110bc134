//! # getman-check
//!
//! Request execution, snapshot testing and request sequences for Getman
//! collections. A run executes requests through a retrying HTTP executor,
//! compares each response with a stored snapshot, and walks dependent
//! request chains that pass extracted values from step to step.
//!
//! ```no_run
//! use std::sync::Arc;
//! use getman_check::{FsPersistence, RequestFile, RunOptions, TestRunner};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> getman_check::CheckResult<()> {
//! let options = RunOptions::load("getman-check.json")?;
//! let runner = TestRunner::from_options(options, Arc::new(FsPersistence::new()), CancellationToken::new())?;
//! let report = runner.run(&[RequestFile::load("collections/users.json")?]).await?;
//! std::process::exit(report.exit_code());
//! # }
//! ```

pub mod auth;
pub mod collections;
pub mod config;
pub mod engine;
pub mod environment;
pub mod error;
pub mod http;
pub mod persistence;
pub mod schema;
pub mod snapshot;
pub mod store;
pub mod testing;

pub use auth::{AuthConfig, AuthProvider};
pub use collections::{JsonFileSource, RequestFile, RequestSource};
pub use config::{RunOptions, UpdateMode};
pub use engine::cancel::CancelRegistry;
pub use environment::{interpolate, VariableLayers, VariableStore};
pub use error::{CheckError, CheckResult, TransportErrorKind};
pub use http::{HttpExecutor, Request, Response, RetryPolicy, RetryingTransport, SessionStore};
pub use persistence::{FsPersistence, MemoryPersistence, Persistence};
pub use schema::{OperationDescriptor, SchemaOptions, SchemaValidator, ValidationOutcome};
pub use snapshot::{SnapshotDiff, SnapshotStore};
pub use store::SqlitePersistence;
pub use testing::{
    SequenceResult, SequenceRunner, SequenceStep, TestReport, TestResult, TestRunner, TestSequence,
    TestStatus,
};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs a `fmt` subscriber for embedding binaries. `RUST_LOG` wins
/// unless `debug` is set; the default level is `info`. Returns quietly if a
/// subscriber is already installed.
pub fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init();
}
