use std::fmt;

use serde::Serialize;

use crate::error::{ErrorKind, LinkError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Success => "success",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

/// Human-readable status line for the UI layer. Failures carry their
/// [`ErrorKind`] so callers can still react programmatically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusNotice {
    pub severity: Severity,
    pub kind: Option<ErrorKind>,
    pub message: String,
}

impl StatusNotice {
    pub fn info(message: impl Into<String>) -> Self {
        Self::new(Severity::Info, None, message)
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(Severity::Success, None, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, None, message)
    }

    pub fn warning_for(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, Some(kind), message)
    }

    pub fn error(err: &LinkError) -> Self {
        Self::new(Severity::Error, Some(err.kind()), err.to_string())
    }

    fn new(severity: Severity, kind: Option<ErrorKind>, message: impl Into<String>) -> Self {
        Self {
            severity,
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for StatusNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.severity.as_str(), self.message)
    }
}
