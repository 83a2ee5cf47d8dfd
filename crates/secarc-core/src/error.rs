use std::path::PathBuf;

use thiserror::Error;

pub type SecarcResult<T> = Result<T, SecarcError>;

/// Every failure the engine can report.
///
/// Wrong passwords and tampered data share one variant: an AEAD tag
/// failure cannot tell them apart.
#[derive(Debug, Error)]
pub enum SecarcError {
    #[error("source not found: {}", .path.display())]
    SourceNotFound { path: PathBuf },

    #[error("destination already exists: {}", .path.display())]
    DestinationExists { path: PathBuf },

    #[error("invalid container format: {0}")]
    InvalidContainerFormat(String),

    #[error("{}", wrong_password_message(.entry.as_deref()))]
    WrongPasswordOrCorrupted { entry: Option<String> },

    #[error("{context}{}: {source}", entry_suffix(.entry.as_deref()))]
    Io {
        context: String,
        entry: Option<String>,
        #[source]
        source: std::io::Error,
    },

    #[error("unexpected failure: {0}")]
    Unexpected(#[from] anyhow::Error),
}

/// Flat tag for callers that only need to branch on the failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    SourceNotFound,
    DestinationExists,
    InvalidContainerFormat,
    WrongPasswordOrCorrupted,
    Io,
    Unexpected,
}

impl SecarcError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SourceNotFound { .. } => ErrorKind::SourceNotFound,
            Self::DestinationExists { .. } => ErrorKind::DestinationExists,
            Self::InvalidContainerFormat(_) => ErrorKind::InvalidContainerFormat,
            Self::WrongPasswordOrCorrupted { .. } => ErrorKind::WrongPasswordOrCorrupted,
            Self::Io { .. } => ErrorKind::Io,
            Self::Unexpected(_) => ErrorKind::Unexpected,
        }
    }

    /// The manifest entry the failure belongs to, if it happened mid-stream.
    pub fn entry(&self) -> Option<&str> {
        match self {
            Self::WrongPasswordOrCorrupted { entry } | Self::Io { entry, .. } => entry.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn format(msg: impl Into<String>) -> Self {
        Self::InvalidContainerFormat(msg.into())
    }

    pub(crate) fn corrupted() -> Self {
        Self::WrongPasswordOrCorrupted { entry: None }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            entry: None,
            source,
        }
    }

    /// Tag an entry-less error with the entry being processed.
    pub(crate) fn in_entry(self, path: &str) -> Self {
        match self {
            Self::WrongPasswordOrCorrupted { entry: None } => Self::WrongPasswordOrCorrupted {
                entry: Some(path.to_string()),
            },
            Self::Io {
                context,
                entry: None,
                source,
            } => Self::Io {
                context,
                entry: Some(path.to_string()),
                source,
            },
            other => other,
        }
    }
}

fn wrong_password_message(entry: Option<&str>) -> String {
    match entry {
        Some(e) => format!("wrong password or corrupted data (in entry {e}; output may be incomplete)"),
        None => "wrong password or corrupted data".to_string(),
    }
}

fn entry_suffix(entry: Option<&str>) -> String {
    entry.map(|e| format!(" (entry {e})")).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_entry_tags_untagged_errors_only() {
        let err = SecarcError::corrupted().in_entry("a.txt");
        assert_eq!(err.entry(), Some("a.txt"));

        let err = err.in_entry("b.txt");
        assert_eq!(err.entry(), Some("a.txt"), "first entry wins");

        let err = SecarcError::format("bad magic").in_entry("a.txt");
        assert_eq!(err.kind(), ErrorKind::InvalidContainerFormat);
        assert_eq!(err.entry(), None);
    }

    #[test]
    fn test_display_never_claims_which_cause() {
        let msg = SecarcError::corrupted().to_string();
        assert!(msg.contains("wrong password or corrupted data"));

        let msg = SecarcError::corrupted().in_entry("sub/b.txt").to_string();
        assert!(msg.contains("sub/b.txt"));
    }

    #[test]
    fn test_io_display_includes_entry() {
        let err = SecarcError::io(
            "writing file",
            std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        )
        .in_entry("a.txt");
        let msg = err.to_string();
        assert!(msg.contains("writing file"));
        assert!(msg.contains("a.txt"));
        assert!(msg.contains("disk full"));
    }
}
