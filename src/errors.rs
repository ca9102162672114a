use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid input: {0}")]
    InputInvalid(String),

    #[error("Resolution failed: {0}")]
    ResolutionFailed(String),

    #[error("Network error: {0}")]
    NetworkTransient(String),

    #[error("No acceptable format available at or below {ceiling}p")]
    NoAcceptableFormat { ceiling: u32 },

    #[error("Transfer interrupted: {0}")]
    TransferInterrupted(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Cache inconsistent: {0}")]
    CacheInconsistent(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<AppError>,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Processing error: {0}")]
    Processing(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Failure kind reported on a task that ended in `Failed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InputInvalid,
    ResolutionFailed,
    NetworkTransient,
    NoAcceptableFormat,
    TransferInterrupted,
    Cancelled,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ErrorKind::InputInvalid => "invalid input",
            ErrorKind::ResolutionFailed => "resolution failed",
            ErrorKind::NetworkTransient => "network error",
            ErrorKind::NoAcceptableFormat => "no acceptable format available",
            ErrorKind::TransferInterrupted => "transfer interrupted",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal error",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retryable,
    Terminal,
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::InputInvalid(_) => ErrorKind::InputInvalid,
            AppError::ResolutionFailed(_) => ErrorKind::ResolutionFailed,
            AppError::NetworkTransient(_) => ErrorKind::NetworkTransient,
            AppError::NoAcceptableFormat { .. } => ErrorKind::NoAcceptableFormat,
            AppError::TransferInterrupted(_) => ErrorKind::TransferInterrupted,
            AppError::Cancelled => ErrorKind::Cancelled,
            AppError::Exhausted { last, .. } => last.kind(),
            AppError::Http(e) => match http_disposition(e) {
                Disposition::Retryable => ErrorKind::NetworkTransient,
                Disposition::Terminal if e.is_builder() => ErrorKind::InputInvalid,
                Disposition::Terminal => ErrorKind::ResolutionFailed,
            },
            AppError::Io(e) if is_transient_io(e) => ErrorKind::NetworkTransient,
            _ => ErrorKind::Internal,
        }
    }

    /// Default retry classifier.
    pub fn disposition(&self) -> Disposition {
        match self {
            AppError::NetworkTransient(_) | AppError::TransferInterrupted(_) => Disposition::Retryable,
            AppError::Http(e) => http_disposition(e),
            AppError::Io(e) if is_transient_io(e) => Disposition::Retryable,
            _ => Disposition::Terminal,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind(), ErrorKind::Cancelled)
    }

    /// Maps an HTTP status outside 2xx onto the taxonomy.
    pub fn from_status(status: reqwest::StatusCode, context: &str) -> Self {
        let code = status.as_u16();
        match code {
            429 => AppError::NetworkTransient(format!("{}: rate limited (429)", context)),
            408 => AppError::NetworkTransient(format!("{}: request timeout (408)", context)),
            500..=599 => AppError::NetworkTransient(format!("{}: server error ({})", context, code)),
            400 => AppError::InputInvalid(format!("{}: bad request (400)", context)),
            401 | 403 => AppError::ResolutionFailed(format!("{}: not authorized ({})", context, code)),
            _ => AppError::ResolutionFailed(format!("{}: HTTP {}", context, code)),
        }
    }

    /// Classifies a failure message from the extraction tool.
    pub fn from_extractor_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        let trimmed = message.trim().to_string();

        const TERMINAL: [&str; 8] = [
            "private video",
            "video unavailable",
            "sign in",
            "copyright",
            "blocked",
            "not available in your country",
            "members-only",
            "has been removed",
        ];
        const TRANSIENT: [&str; 9] = [
            "timed out",
            "timeout",
            "http error 429",
            "http error 5",
            "connection",
            "network is unreachable",
            "temporary failure",
            "unable to download webpage",
            "read operation",
        ];

        if lower.contains("unsupported url") || lower.contains("is not a valid url") {
            AppError::InputInvalid(trimmed)
        } else if TERMINAL.iter().any(|needle| lower.contains(needle)) {
            AppError::ResolutionFailed(trimmed)
        } else if TRANSIENT.iter().any(|needle| lower.contains(needle)) {
            AppError::NetworkTransient(trimmed)
        } else {
            AppError::ResolutionFailed(trimmed)
        }
    }
}

fn http_disposition(e: &reqwest::Error) -> Disposition {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        return Disposition::Retryable;
    }
    match e.status() {
        Some(status) => AppError::from_status(status, "").disposition(),
        None => Disposition::Terminal,
    }
}

fn is_transient_io(e: &std::io::Error) -> bool {
    use std::io::ErrorKind as IoKind;
    matches!(
        e.kind(),
        IoKind::ConnectionReset
            | IoKind::ConnectionAborted
            | IoKind::ConnectionRefused
            | IoKind::TimedOut
            | IoKind::BrokenPipe
            | IoKind::UnexpectedEof
    )
}
