use apkbrand_derive::EnumCode;
use apkbrand_request::RequestError;
use serde::{Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::time::Duration;
use thiserror::Error;

/// Upper bound on any diagnostic handed back to a caller.
pub const DIAGNOSTIC_LIMIT: usize = 8000;

const TRUNCATION_MARKER: &str = "...truncated";

/// Short machine-checkable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumCode)]
pub enum ErrorCode {
    Validation,
    NotFound,
    ExternalTool,
    Conflict,
    Cancelled,
    Io,
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_code())
    }
}

/// How an external tool invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolExit {
    /// Exited on its own. `None` when it was terminated by a signal.
    Status(Option<i32>),
    TimedOut(Duration),
    Killed,
    SpawnFailed(String),
    /// The tool exited cleanly but its output did not pass an in-process check.
    Rejected(String),
}

impl Display for ToolExit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolExit::Status(Some(code)) => write!(f, "exit code {code}"),
            ToolExit::Status(None) => f.write_str("terminated by signal"),
            ToolExit::TimedOut(after) => write!(f, "timed out after {}s", after.as_secs()),
            ToolExit::Killed => f.write_str("killed"),
            ToolExit::SpawnFailed(reason) => write!(f, "could not be started: {reason}"),
            ToolExit::Rejected(reason) => write!(f, "output rejected: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolFailure {
    pub tool: String,
    /// Rendered command line with secrets redacted.
    pub command: String,
    pub exit: ToolExit,
    pub stdout_tail: String,
    pub stderr_tail: String,
}

impl ToolFailure {
    pub fn exit_code(&self) -> Option<i32> {
        match self.exit {
            ToolExit::Status(code) => code,
            _ => None,
        }
    }
}

impl Display for ToolFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed ({}): {}", self.tool, self.exit, self.command)?;

        if !self.stderr_tail.is_empty() {
            write!(f, "\n--- stderr (tail) ---\n{}", self.stderr_tail)?;
        }
        if !self.stdout_tail.is_empty() {
            write!(f, "\n--- stdout (tail) ---\n{}", self.stdout_tail)?;
        }

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    ExternalTool(Box<ToolFailure>),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("build {0} was cancelled")]
    Cancelled(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl BuildError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        BuildError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn tool(failure: ToolFailure) -> Self {
        BuildError::ExternalTool(Box::new(failure))
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            BuildError::Validation(_) => ErrorCode::Validation,
            BuildError::NotFound(_) => ErrorCode::NotFound,
            BuildError::ExternalTool(_) => ErrorCode::ExternalTool,
            BuildError::Conflict(_) => ErrorCode::Conflict,
            BuildError::Cancelled(_) => ErrorCode::Cancelled,
            BuildError::Io { .. } => ErrorCode::Io,
        }
    }

    /// Human-readable message bounded to [`DIAGNOSTIC_LIMIT`] characters.
    pub fn diagnostic(&self) -> String {
        bounded(&self.to_string(), DIAGNOSTIC_LIMIT)
    }

    pub fn to_failure(&self) -> BuildFailure {
        BuildFailure {
            code: self.code(),
            message: self.diagnostic(),
        }
    }
}

impl From<RequestError> for BuildError {
    fn from(err: RequestError) -> Self {
        BuildError::Validation(err.to_string())
    }
}

/// The structured failure returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildFailure {
    pub code: ErrorCode,
    pub message: String,
}

/// `?`-friendly conversion of `io::Error`s into [`BuildError::Io`].
pub trait IoContext<T> {
    fn io_context<C, F>(self, context: F) -> Result<T, BuildError>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T> IoContext<T> for Result<T, std::io::Error> {
    fn io_context<C, F>(self, context: F) -> Result<T, BuildError>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|source| BuildError::io(context(), source))
    }
}

fn bounded(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}{TRUNCATION_MARKER}", &text[..cut]),
        None => text.to_string(),
    }
}
