use std::fmt;

use miette::Diagnostic;
use thiserror::Error;

/// Which bounded wait ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Waiting for a qube to become reachable on connect.
    Connect,
    /// Waiting for a qube to reach `Halted`.
    Shutdown,
    /// Waiting for a qube to reach `Running` after a start request.
    Start,
    /// Waiting for the final state check of a reconciliation.
    Verify,
    /// A single qrexec call.
    Call,
    /// A caller-supplied deadline.
    Deadline,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeoutKind::Connect => "connect",
            TimeoutKind::Shutdown => "shutdown",
            TimeoutKind::Start => "start",
            TimeoutKind::Verify => "verify",
            TimeoutKind::Call => "call",
            TimeoutKind::Deadline => "deadline",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum QopsError {
    #[error("qube '{qube}' does not exist ({operation})")]
    #[diagnostic(help("check the name with `qvm-ls`"))]
    TargetNotFound { qube: String, operation: String },

    #[error("qube '{qube}' is not running ({operation})")]
    #[diagnostic(help("start it with `qvm-start {qube}` or enable connect.auto_start"))]
    TargetNotRunning { qube: String, operation: String },

    #[error("call channel to '{qube}' unavailable during {operation}: {cause}")]
    ChannelUnavailable {
        qube: String,
        operation: String,
        cause: String,
    },

    #[error("policy denied {operation} on '{qube}': {cause}")]
    #[diagnostic(help("review the qrexec policy in /etc/qubes/policy.d"))]
    PolicyDenied {
        qube: String,
        operation: String,
        cause: String,
    },

    #[error("{kind} timeout for '{qube}' after {secs}s ({operation})")]
    Timeout {
        qube: String,
        operation: String,
        kind: TimeoutKind,
        secs: u64,
    },

    #[error("precondition for {operation} on '{qube}' failed: {cause} (already applied: {applied:?})")]
    PreconditionFailed {
        qube: String,
        operation: String,
        cause: String,
        applied: Vec<String>,
    },

    #[error("'{field}' of qube '{qube}' cannot change after creation ({observed} -> {desired})")]
    #[diagnostic(help("remove and recreate the qube to change this field"))]
    ImmutableFieldMismatch {
        qube: String,
        field: String,
        observed: String,
        desired: String,
    },

    #[error("qube '{qube}' is busy ({operation}): {cause}")]
    Busy {
        qube: String,
        operation: String,
        cause: String,
    },

    #[error("unknown property '{name}'")]
    #[diagnostic(help("supported properties: {supported}"))]
    UnknownProperty { name: String, supported: String },

    #[error("invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("refusing remote path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("{operation} of '{path}' in '{qube}' failed with status {status}: {stderr}")]
    TransferFailed {
        qube: String,
        operation: String,
        path: String,
        status: i32,
        stderr: String,
    },

    #[error("session to '{qube}' is closed")]
    SessionClosed { qube: String },

    #[error("admin API {method} on '{qube}' failed: {exception}: {message}")]
    AdminApi {
        qube: String,
        method: String,
        exception: String,
        message: String,
    },

    #[error("qube '{qube}' did not reach the requested state: requested {requested}, observed {observed}")]
    VerifyFailed {
        qube: String,
        requested: String,
        observed: String,
    },

    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl QopsError {
    /// Name of the taxonomy entry, as reported in module results.
    pub fn kind(&self) -> &'static str {
        match self {
            QopsError::TargetNotFound { .. } => "TargetNotFound",
            QopsError::TargetNotRunning { .. } => "TargetNotRunning",
            QopsError::ChannelUnavailable { .. } => "ChannelUnavailable",
            QopsError::PolicyDenied { .. } => "PolicyDenied",
            QopsError::Timeout { .. } => "Timeout",
            QopsError::PreconditionFailed { .. } => "PreconditionFailed",
            QopsError::ImmutableFieldMismatch { .. } => "ImmutableFieldMismatch",
            QopsError::Busy { .. } => "Busy",
            QopsError::UnknownProperty { .. } => "UnknownProperty",
            QopsError::InvalidValue { .. } => "InvalidValue",
            QopsError::InvalidPath { .. } => "InvalidPath",
            QopsError::TransferFailed { .. } => "TransferFailed",
            QopsError::SessionClosed { .. } => "SessionClosed",
            QopsError::AdminApi { .. } => "AdminApi",
            QopsError::VerifyFailed { .. } => "VerifyFailed",
            QopsError::ConfigLoad { .. } => "ConfigLoad",
            QopsError::ConfigParse { .. } => "ConfigParse",
            QopsError::Validation { .. } => "Validation",
            QopsError::Io { .. } => "Io",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, QopsError::Timeout { .. })
    }
}
