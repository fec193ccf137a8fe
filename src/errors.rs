use std::io;

use thiserror::Error;

use crate::types::{GlobalId, StepName, TypeTag};

/// Fatal configuration failures. Any of these aborts startup; none is
/// recoverable once the process is running because step configs are
/// immutable for the process lifetime.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed reading config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed parsing config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("step '{step}' is missing required key '{key}'")]
    MissingKey { step: StepName, key: String },
    #[error("step '{step}' references unknown catalog '{catalog}'")]
    UnknownCatalog { step: StepName, catalog: String },
    #[error("step '{step}' has unparseable {role} URL '{url}'")]
    BadUrl {
        step: StepName,
        role: &'static str,
        url: String,
    },
    #[error("step '{step}' has unsupported {role} scheme '{scheme}'")]
    BadScheme {
        step: StepName,
        role: &'static str,
        scheme: String,
    },
    #[error("step '{step}' may not use 'file' for both source and destination")]
    FileToFile { step: StepName },
    #[error("another instance holds the lock file '{path}'")]
    AlreadyRunning { path: String },
    #[error("configuration error: {0}")]
    Invalid(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failure reported by a warehouse store or search-index backend. Callers
/// wrap it into the [`StepError`] variant that names what was being touched.
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct StoreError {
    /// Backend-specific failure description.
    pub reason: String,
}

impl StoreError {
    /// Build a failure from any printable reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Recoverable failures scoped to one step or one record. The run loop logs
/// these, marks the step failed, and continues with the next step.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("fetch of '{url}' failed: {reason}")]
    Fetch { url: String, reason: String },
    #[error("response from '{url}' is not valid JSON: {reason}")]
    MalformedResponse { url: String, reason: String },
    #[error("JSON is missing the '{0}' element")]
    MissingContentType(TypeTag),
    #[error("persistence failure for '{id}': {reason}")]
    Persistence { id: GlobalId, reason: String },
    #[error("deleting {kind} for '{id}' failed: {reason}")]
    PartialDelete {
        kind: &'static str,
        id: GlobalId,
        reason: String,
    },
    #[error("transfer service call failed: {0}")]
    Transfer(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}
