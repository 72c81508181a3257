use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum InstallerError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("Download stalled: {0}")]
    Stalled(String),
    #[error("Package format error: {0}")]
    Format(String),
    #[error("Hash mismatch for {file}: expected {expected}, got {actual}")]
    HashMismatch {
        file: String,
        expected: String,
        actual: String,
    },
    #[error("Patch error: {0}")]
    Patch(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Locked files: {}", .0.join(", "))]
    LockedFiles(Vec<String>),
    #[error("State error: {0}")]
    State(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, InstallerError>;

impl InstallerError {
    /// Exit code surfaced in silent and non-interactive runs.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Network(_) | Self::Http(_) | Self::Stalled(_) => 2,
            Self::Io(_) | Self::LockedFiles(_) => 3,
            Self::Format(_) | Self::HashMismatch { .. } | Self::Patch(_) => 4,
            Self::State(_) | Self::NotFound(_) => 5,
            Self::Cancelled => 6,
            _ => 1,
        }
    }

    /// Whether a task hitting this error is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Http(msg) => {
                msg.contains("HTTP 5") || msg.contains("HTTP 408") || msg.contains("HTTP 429")
            }
            Self::Stalled(_) => true,
            Self::HashMismatch { .. } => true,
            _ => false,
        }
    }

    /// Short hint prepended to the raw error text shown to end users.
    pub fn user_hint(&self) -> Option<&'static str> {
        match self {
            Self::Network(_) | Self::Http(_) => {
                Some("download server problem, try switching the download source")
            }
            Self::Stalled(_) => Some("the connection is too slow or unstable, try again later"),
            Self::LockedFiles(_) => Some("some files are in use, close the application and retry"),
            Self::State(_) => {
                Some("the local installation looks damaged, a reinstall may be required")
            }
            _ => None,
        }
    }

    /// User-facing message: hint first, original error always appended.
    pub fn user_message(&self) -> String {
        match self.user_hint() {
            Some(hint) => format!("{hint} ({self})"),
            None => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_taxonomy() {
        assert_eq!(InstallerError::Http("HTTP 503".into()).exit_code(), 2);
        assert_eq!(
            InstallerError::LockedFiles(vec!["a.exe".into()]).exit_code(),
            3
        );
        assert_eq!(InstallerError::Format("bad".into()).exit_code(), 4);
        assert_eq!(InstallerError::State("downgrade".into()).exit_code(), 5);
        assert_eq!(InstallerError::Cancelled.exit_code(), 6);
    }

    #[test]
    fn server_errors_are_retryable() {
        assert!(InstallerError::Http("HTTP 503 from mirror".into()).is_retryable());
        assert!(!InstallerError::Http("HTTP 404".into()).is_retryable());
        assert!(!InstallerError::Format("no magic".into()).is_retryable());
    }

    #[test]
    fn user_message_keeps_original_text() {
        let err = InstallerError::Http("HTTP 502".into());
        let msg = err.user_message();
        assert!(msg.contains("download server problem"));
        assert!(msg.contains("HTTP 502"));
    }
}
