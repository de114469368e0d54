//! Error types for autosignup

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Mailbox connection error: {0}")]
    Connection(String),

    #[error("No verification code for {recipient} within {}s", waited.as_secs())]
    VerificationTimeout { recipient: String, waited: Duration },

    #[error("UI error: {0}")]
    Ui(String),

    #[error("Navigation timeout: {0}")]
    NavigationTimeout(String),

    #[error("Browser executable not found: {0}")]
    BrowserNotFound(String),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Write error for {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IMAP error: {0}")]
    Imap(String),

    #[error("Email parsing error: {0}")]
    Parse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used in attempt reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Configuration,
    Connection,
    VerificationTimeout,
    Ui,
    NavigationTimeout,
    BrowserNotFound,
    Browser,
    Write,
    Cancelled,
    Other,
}

impl FailureKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Connection => "connection",
            Self::VerificationTimeout => "verification-timeout",
            Self::Ui => "ui",
            Self::NavigationTimeout => "navigation-timeout",
            Self::BrowserNotFound => "browser-not-found",
            Self::Browser => "browser",
            Self::Write => "write",
            Self::Cancelled => "cancelled",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::Config(_) => FailureKind::Configuration,
            Self::Connection(_) => FailureKind::Connection,
            Self::VerificationTimeout { .. } => FailureKind::VerificationTimeout,
            Self::Ui(_) => FailureKind::Ui,
            Self::NavigationTimeout(_) => FailureKind::NavigationTimeout,
            Self::BrowserNotFound(_) => FailureKind::BrowserNotFound,
            Self::Browser(_) => FailureKind::Browser,
            Self::Write { .. } => FailureKind::Write,
            Self::Cancelled => FailureKind::Cancelled,
            Self::Imap(_) | Self::Parse(_) | Self::Json(_) | Self::Io(_) => FailureKind::Other,
        }
    }

    /// Errors that make every further attempt pointless.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::BrowserNotFound(_))
    }

    /// Transient errors the retry policy may rerun an attempt for.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::NavigationTimeout(_))
    }
}
