//! Error taxonomy for the controller, workers and the REST edge.
//!
//! Task-level failures never appear here: a failing task becomes a failure
//! `TaskResult` absorbed by the metrics engine. These variants cover the
//! infrastructural failures that are returned to callers with a precise
//! reason.

use thiserror::Error;

/// Top-level error type for test submission, orchestration and the
/// controller/worker plane.
#[derive(Error, Debug)]
pub enum VajraError {
    /// Schema or cross-field validation failed. Surfaced at the API
    /// boundary; never retried.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Aggregated pre-flight check failure, returned with per-check details.
    #[error("pre-flight validation failed: {0}")]
    PreflightFailed(String),

    /// Too many concurrent tests or a saturated worker pool. Clients should
    /// retry later.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// A worker missed its heartbeat window mid-test.
    #[error("worker lost: {0}")]
    WorkerLost(String),

    /// Init-time failure (task factory construction, socket binding). The
    /// owning test ends in FAILED.
    #[error("fatal test error: {0}")]
    TestFatal(String),

    /// Operator stop or suite-level cancellation; orderly shutdown.
    #[error("cancelled")]
    Cancelled,

    /// Unknown test, worker or suite id.
    #[error("not found: {0}")]
    NotFound(String),

    /// Registration conflicts and other registry-level rejections.
    #[error("registration rejected: {0}")]
    RegistrationRejected(String),

    /// Transport-level failure talking to a worker or the controller.
    #[error("transport error: {0}")]
    Transport(String),
}

impl VajraError {
    /// Process exit code for CLI front-ends.
    pub fn exit_code(&self) -> i32 {
        match self {
            VajraError::ConfigInvalid(_) | VajraError::PreflightFailed(_) => 2,
            VajraError::CapacityExceeded(_) => 3,
            _ => 1,
        }
    }
}

impl From<tonic::Status> for VajraError {
    fn from(status: tonic::Status) -> Self {
        VajraError::Transport(status.to_string())
    }
}

impl From<tonic::transport::Error> for VajraError {
    fn from(err: tonic::transport::Error) -> Self {
        VajraError::Transport(err.to_string())
    }
}

/// Validation error with context about which field failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Field '{field}': {message}")]
    FieldError { field: String, message: String },

    #[error("Field '{field}' is required but not provided")]
    RequiredField { field: String },

    #[error("Field '{field}': value {value} is out of range ({min} to {max})")]
    OutOfRange {
        field: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("Field '{field}': invalid enum value '{value}'. Expected one of: {expected}")]
    InvalidEnum {
        field: String,
        value: String,
        expected: String,
    },
}

/// Collects field-level errors while walking a config document so a caller
/// gets every problem in one response instead of the first.
#[derive(Debug, Default)]
pub struct ValidationContext {
    errors: Vec<ValidationError>,
}

impl ValidationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn field_error(&mut self, field: &str, message: impl Into<String>) {
        self.add(ValidationError::FieldError {
            field: field.to_string(),
            message: message.into(),
        });
    }

    pub fn required(&mut self, field: &str) {
        self.add(ValidationError::RequiredField {
            field: field.to_string(),
        });
    }

    pub fn out_of_range<T: std::fmt::Display>(&mut self, field: &str, value: T, min: T, max: T) {
        self.add(ValidationError::OutOfRange {
            field: field.to_string(),
            value: value.to_string(),
            min: min.to_string(),
            max: max.to_string(),
        });
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    /// Consume the context: `Ok(())` when clean, `ConfigInvalid` carrying all
    /// collected messages otherwise.
    pub fn into_result(self) -> Result<(), VajraError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            let messages: Vec<String> = self.errors.iter().map(|e| e.to_string()).collect();
            Err(VajraError::ConfigInvalid(messages.join("; ")))
        }
    }
}
