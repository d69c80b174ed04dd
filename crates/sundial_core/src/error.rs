//! Error types and Result module.

use std::{
    backtrace::Backtrace,
    fmt::{self, Display},
};

/// Machine-readable error codes attached to [`SundialError`]s where callers
/// need to branch on the failure rather than only report it.
pub mod codes {
    /// The requested platform object does not exist.
    pub const NOT_FOUND: &str = "not-found";
    /// The platform rejected a write because the object already exists or was
    /// modified concurrently.
    pub const CONFLICT: &str = "conflict";
    /// A bounded wait elapsed before the condition was observed.
    pub const TIMEOUT: &str = "timeout";
    /// A retention interval string could not be parsed.
    pub const INVALID_INTERVAL: &str = "invalid-interval";
    /// A restore was requested without a usable restore point.
    pub const INVALID_RESTORE: &str = "invalid-restore";
    /// A claim named by a `SnapshotGroup` does not exist on the platform.
    pub const CLAIM_NOT_FOUND: &str = "claim-not-found";
    /// A claim exists but is not owned by this controller.
    pub const CLAIM_NOT_MANAGED: &str = "claim-not-managed";
    /// A blocking wait was cancelled by the stop signal.
    pub const CANCELLED: &str = "cancelled";
}

/// Result type that is being returned from methods that can fail and thus have [`SundialError`]s.
pub type SundialResult<T, E = Box<SundialError>> = Result<T, E>;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
/// Errors that can result from sundial.
pub struct SundialError {
    /// The kind of the error.
    kind: ErrorKind,

    /// Chain to the cause of the error.
    source: Option<Box<(dyn std::error::Error + Send + Sync)>>,

    /// The error message with guidance.
    guidance: String,

    /// The context of the error.
    context: Box<[(&'static str, String)]>,

    /// Error code.
    error_code: Option<String>,

    /// Severity of the error.
    severity: Option<Severity>,

    /// The status of the error.
    status: Option<Status>,

    /// Backtrace of the error.
    ///
    // Need to use option, otherwise thiserror will not be able to derive the Error trait.
    backtrace: Option<Backtrace>,
}

impl Display for SundialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.guidance)?;

        if !self.context.is_empty() {
            write!(
                f,
                " ({})",
                self.context
                    .iter()
                    .map(|(k, v)| format!("{k}: {v}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            )?;
        }

        if let Some(cause) = &self.source {
            write!(f, "\n\nCaused by: {cause}")?;
        }

        if let Some(severity) = &self.severity {
            write!(f, "\n\nSeverity: {severity:?}")?;
        }

        if let Some(status) = &self.status {
            write!(f, "\n\nStatus: {status:?}")?;
        }

        Ok(())
    }
}

// Accessors for anything we do want to expose publicly.
impl SundialError {
    /// Creates a new error with the given kind and guidance.
    pub fn new(kind: ErrorKind, guidance: impl Into<String>) -> Box<Self> {
        Box::new(Self {
            kind,
            guidance: guidance.into(),
            context: Box::default(),
            source: None,
            error_code: None,
            severity: None,
            status: None,
            // `Backtrace::capture()` will check if backtrace has been enabled
            // internally. It's zero cost if backtrace is disabled.
            backtrace: Some(Backtrace::capture()),
        })
    }

    /// Creates a new error with the given kind, guidance and source.
    pub fn with_source(
        kind: ErrorKind,
        guidance: impl Into<String>,
        source: impl Into<Box<(dyn std::error::Error + Send + Sync)>>,
    ) -> Box<Self> {
        Box::new(Self {
            kind,
            guidance: guidance.into(),
            context: Box::default(),
            source: Some(source.into()),
            error_code: None,
            severity: None,
            status: None,
            backtrace: Some(Backtrace::capture()),
        })
    }

    /// Creates a new error from a given error.
    pub fn from<T: std::error::Error + Display + Send + Sync + 'static>(
        error: T,
        kind: ErrorKind,
    ) -> Box<Self> {
        Box::new(Self {
            kind,
            guidance: error.to_string(),
            context: Box::default(),
            source: Some(Box::new(error)),
            error_code: None,
            severity: None,
            status: None,
            backtrace: Some(Backtrace::capture()),
        })
    }

    /// Expose the inner error kind.
    ///
    /// This is useful for matching on the error kind.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Checks if the error has a specific error code.
    pub fn is_code(&self, code: &str) -> bool {
        self.error_code.as_deref() == Some(code)
    }

    /// Checks if the error reports a missing platform object.
    pub fn is_not_found(&self) -> bool {
        self.is_code(codes::NOT_FOUND)
    }

    /// Checks if the error reports a write conflict.
    pub fn is_conflict(&self) -> bool {
        self.is_code(codes::CONFLICT)
    }

    /// Checks if the error reports an elapsed bounded wait.
    pub fn is_timeout(&self) -> bool {
        self.is_code(codes::TIMEOUT)
    }

    /// Checks if the error may resolve on its own when retried.
    ///
    /// Errors without an explicit status are treated as retryable; the work
    /// queue retries everything and permanence only dampens expectations.
    pub fn is_temporary(&self) -> bool {
        !matches!(self.status, Some(Status::Permanent))
    }
}

// Setters for anything we do want to expose publicly.
impl SundialError {
    /// Attach context to the error.
    ///
    /// Can be called multiple times to add more than one context pair.
    pub fn attach_context(mut self, key: &'static str, value: impl Into<String>) -> Box<Self> {
        let mut context = self.context.to_vec();
        context.push((key, value.into()));
        self.context = context.into_boxed_slice();
        Box::new(self)
    }

    /// Attach an error code.
    pub fn attach_error_code(self, value: impl Into<String>) -> Box<Self> {
        Box::new(Self {
            error_code: Some(value.into()),
            ..self
        })
    }

    /// Attach the severity of the error.
    pub fn attach_severity(self, value: impl Into<Severity>) -> Box<Self> {
        Box::new(Self {
            severity: Some(value.into()),
            ..self
        })
    }

    /// Attach the status of the error.
    pub fn attach_status(self, value: impl Into<Status>) -> Box<Self> {
        Box::new(Self {
            status: Some(value.into()),
            ..self
        })
    }
}

/// Severity of an error, ranging from informational to fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Informational
    Info,

    /// Warning
    Warning,

    /// Error
    Error,

    /// Fatal
    Fatal,
}

/// Status of an error, indicating whether it is permanent, temporary, or persistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Permanent, will not resolve without operator intervention
    Permanent,

    /// Temporary, may be retried
    Temporary,

    /// Persistent, may be retried, but may not succeed
    Persistent,
}

/// [`ErrorKind`] describes the errors that can happen while reconciling snapshot groups.
///
/// This is a non-exhaustive enum, so additional variants may be added in future. It is
/// recommended to match against the wildcard `_` instead of listing all possible variants,
/// to avoid problems when new variants are added.
#[non_exhaustive]
#[derive(thiserror::Error, Debug, displaydoc::Display)]
pub enum ErrorKind {
    /// Claim Error
    Claim,
    /// Controller Error
    Controller,
    /// Internal Error
    Internal,
    /// Invalid Input
    InvalidInput,
    /// Multithreading Error
    Multithreading,
    /// Platform Error
    Platform,
    /// Restore Error
    Restore,
    /// Schedule Error
    Schedule,
    /// Timeout Error
    Timeout,
}
