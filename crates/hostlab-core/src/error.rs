use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = HostlabError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum HostlabError {
    #[error("invalid result locator '{locator}': {reason}")]
    InvalidLocator { locator: String, reason: String },

    #[error("'{path}' is not a result archive: {reason}")]
    NotAResultArchive { path: PathBuf, reason: String },

    #[error("failed to copy '{src}' into '{dest}'")]
    CopyFailed { src: String, dest: PathBuf },

    #[error("cloud storage tool unavailable: {0}")]
    ToolUnavailable(String),

    #[error("no result sets found under '{0}'")]
    NoResultSetsFound(PathBuf),

    #[error("malformed descriptor '{path}': {reason}")]
    MalformedDescriptor { path: PathBuf, reason: String },

    #[error("unknown test suite '{suite}' (registered: {registered})")]
    UnknownSuite { suite: String, registered: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl HostlabError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::MalformedDescriptor {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_locator(locator: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidLocator {
            locator: locator.into(),
            reason: reason.into(),
        }
    }

    /// Stable snake_case tag used in JSON output and the retry journal.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidLocator { .. } => "invalid_locator",
            Self::NotAResultArchive { .. } => "not_a_result_archive",
            Self::CopyFailed { .. } => "copy_failed",
            Self::ToolUnavailable(_) => "tool_unavailable",
            Self::NoResultSetsFound(_) => "no_result_sets_found",
            Self::MalformedDescriptor { .. } => "malformed_descriptor",
            Self::UnknownSuite { .. } => "unknown_suite",
            Self::Io { .. } => "io",
        }
    }
}
