use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::classify::Classification;

#[derive(Error, Debug)]
pub enum QmdError {
    #[error("invalid workspace: {0}")]
    InvalidWorkspace(String),

    #[error("invalid document target: {0}")]
    InvalidTarget(String),

    #[error("document not found")]
    NotFound,

    #[error("qmd is unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("{command}: timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("timed out waiting for workspace lock {}", .0.display())]
    LockTimeout(std::path::PathBuf),

    #[error("qmd service is closed")]
    Closed,

    /// `detail` carries the remote engine's exit reason and output when
    /// the sidecar reached the engine.
    #[error("sidecar error: {message}")]
    Sidecar {
        message: String,
        detail: Option<String>,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QmdError {
    /// Returns the underlying engine failure when this error came from a
    /// finished subprocess invocation.
    pub fn as_command(&self) -> Option<&CommandError> {
        match self {
            QmdError::Command(err) => Some(err),
            _ => None,
        }
    }

    pub fn sidecar(message: impl Into<String>) -> Self {
        QmdError::Sidecar {
            message: message.into(),
            detail: None,
        }
    }

    /// Text used by the signature recognisers in [`crate::classify`]. Never
    /// includes the command line, which carries caller-supplied queries.
    pub fn diagnostic_text(&self) -> String {
        match self {
            QmdError::Command(err) => err.diagnostic_text(),
            QmdError::Timeout { timeout, .. } => format!("timed out after {timeout:?}"),
            QmdError::Sidecar {
                detail: Some(detail),
                ..
            } => detail.clone(),
            other => other.to_string(),
        }
    }
}

/// A terminal engine failure, carrying enough context to diagnose it
/// without re-running the command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct CommandError {
    pub command: String,
    pub output: String,
    pub reason: String,
    pub classification: Classification,
}

impl CommandError {
    pub fn new(
        command: impl Into<String>,
        output: &str,
        reason: impl Into<String>,
        classification: Classification,
    ) -> Self {
        Self {
            command: command.into(),
            output: output.trim().to_string(),
            reason: reason.into(),
            classification,
        }
    }

    /// Exit reason followed by the engine output.
    pub fn diagnostic_text(&self) -> String {
        if self.output.is_empty() {
            self.reason.clone()
        } else {
            format!("{} {}", self.reason, self.output)
        }
    }

    pub fn is_tolerated(&self) -> bool {
        self.classification == Classification::ToleratedFailure
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.output.is_empty() {
            write!(f, "{}: {}", self.command, self.reason)
        } else {
            write!(f, "{}: {}: {}", self.command, self.reason, self.output)
        }
    }
}

pub type Result<T> = std::result::Result<T, QmdError>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn command_error_display_includes_trimmed_output() {
        let err = CommandError::new(
            "qmd --index agent update",
            "\n  database is locked \n",
            "exit status: 1",
            Classification::Fatal,
        );
        assert_eq!(
            err.to_string(),
            "qmd --index agent update: exit status: 1: database is locked"
        );
    }

    #[test]
    fn command_error_display_without_output() {
        let err = CommandError::new("qmd update", "   ", "exit status: 2", Classification::Fatal);
        assert_eq!(err.to_string(), "qmd update: exit status: 2");
    }

    #[test]
    fn diagnostic_text_leaves_out_the_command_line() {
        let timeout = QmdError::Timeout {
            command: "qmd query 'unsupported document not found' --json".to_string(),
            timeout: Duration::from_secs(30),
        };
        assert_eq!(timeout.diagnostic_text(), "timed out after 30s");

        let remote = QmdError::Sidecar {
            message: "qmd query 'unknown command': exit status: 1: index locked".to_string(),
            detail: Some("exit status: 1 index locked".to_string()),
        };
        assert_eq!(remote.diagnostic_text(), "exit status: 1 index locked");

        let command = CommandError::new("qmd get '#unsupported'", "", "exit status: 4", Classification::Fatal);
        assert_eq!(QmdError::from(command).diagnostic_text(), "exit status: 4");
    }
}
