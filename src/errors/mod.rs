//! Error types for the mail client.
//!
//! Every failure carries a coarse [`ErrorKind`] that drives retry
//! classification, a stable machine-readable code (see [`codes`]), the request
//! id of the send it belongs to, and the underlying cause.

use std::fmt;
use thiserror::Error;

/// Result type for mail operations.
pub type MailResult<T> = Result<T, MailError>;

/// Coarse failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input. Never retried.
    Validation,
    /// Token retrieval or SASL handshake failure.
    Authentication,
    /// Dial, pool, or transaction failure.
    Connection,
    /// Deadline, cancellation, or rate-limit blocking.
    Timeout,
    /// Anything else.
    Unknown,
}

/// Retry decision per error kind.
pub const RETRY_POLICY: [(ErrorKind, bool); 5] = [
    (ErrorKind::Validation, false),
    (ErrorKind::Authentication, true),
    (ErrorKind::Connection, true),
    (ErrorKind::Timeout, true),
    (ErrorKind::Unknown, true),
];

impl ErrorKind {
    /// Returns true if the retry policy allows another attempt.
    pub fn is_retryable(self) -> bool {
        RETRY_POLICY
            .iter()
            .find(|(kind, _)| *kind == self)
            .map(|(_, retry)| *retry)
            .unwrap_or(true)
    }

    /// Stable lowercase name, also used as the metrics failure reason.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Connection => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable error codes.
#[allow(missing_docs)]
pub mod codes {
    pub const MISSING_SENDER: &str = "MISSING_SENDER";
    pub const INVALID_SENDER_FORMAT: &str = "INVALID_SENDER_FORMAT";
    pub const MISSING_RECIPIENTS: &str = "MISSING_RECIPIENTS";
    pub const EMPTY_EMAIL: &str = "EMPTY_EMAIL";
    pub const INVALID_EMAIL_FORMAT: &str = "INVALID_EMAIL_FORMAT";
    pub const MISSING_SUBJECT: &str = "MISSING_SUBJECT";
    pub const INVALID_SUBJECT_CHARS: &str = "INVALID_SUBJECT_CHARS";
    pub const INVALID_HEADER_NAME: &str = "INVALID_HEADER_NAME";
    pub const MISSING_CONTENT: &str = "MISSING_CONTENT";
    pub const INVALID_ATTACHMENT_FILENAME: &str = "INVALID_ATTACHMENT_FILENAME";
    pub const INVALID_ATTACHMENT_CONTENT_TYPE: &str = "INVALID_ATTACHMENT_CONTENT_TYPE";
    pub const INVALID_ATTACHMENT_DATA: &str = "INVALID_ATTACHMENT_DATA";
    pub const INVALID_CONFIG: &str = "INVALID_CONFIG";

    pub const TOKEN_RETRIEVAL_FAILED: &str = "TOKEN_RETRIEVAL_FAILED";
    pub const OAUTH2_AUTH_FAILED: &str = "OAUTH2_AUTH_FAILED";
    pub const BASIC_AUTH_FAILED: &str = "BASIC_AUTH_FAILED";
    pub const TOKEN_REFRESH_FAILED: &str = "TOKEN_REFRESH_FAILED";
    pub const CODE_EXCHANGE_FAILED: &str = "CODE_EXCHANGE_FAILED";
    pub const TOKEN_NOT_FOUND: &str = "TOKEN_NOT_FOUND";
    pub const HTTP_REQUEST_FAILED: &str = "HTTP_REQUEST_FAILED";

    pub const MISSING_CLIENT_ID: &str = "MISSING_CLIENT_ID";
    pub const MISSING_CLIENT_SECRET: &str = "MISSING_CLIENT_SECRET";
    pub const MISSING_REDIRECT_URL: &str = "MISSING_REDIRECT_URL";
    pub const INVALID_REDIRECT_URL: &str = "INVALID_REDIRECT_URL";
    pub const MISSING_SCOPES: &str = "MISSING_SCOPES";
    pub const INVALID_SCOPE: &str = "INVALID_SCOPE";
    pub const MISSING_TENANT_ID: &str = "MISSING_TENANT_ID";
    pub const UNSUPPORTED_PROVIDER: &str = "UNSUPPORTED_PROVIDER";

    pub const DIAL_FAILED: &str = "DIAL_FAILED";
    pub const POOL_CLOSED: &str = "POOL_CLOSED";
    pub const POOL_ACQUIRE_TIMEOUT: &str = "POOL_ACQUIRE_TIMEOUT";
    pub const HEALTH_CHECK_FAILED: &str = "HEALTH_CHECK_FAILED";
    pub const MAIL_FROM_FAILED: &str = "MAIL_FROM_FAILED";
    pub const RCPT_TO_FAILED: &str = "RCPT_TO_FAILED";
    pub const DATA_START_FAILED: &str = "DATA_START_FAILED";
    pub const DATA_WRITE_FAILED: &str = "DATA_WRITE_FAILED";

    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const CONTEXT_CANCELLED: &str = "CONTEXT_CANCELLED";
    pub const DEADLINE_EXCEEDED: &str = "DEADLINE_EXCEEDED";

    pub const RETRY_EXHAUSTED: &str = "RETRY_EXHAUSTED";
    pub const INTERNAL: &str = "INTERNAL";
}

/// Mail client error.
#[derive(Error, Debug)]
pub struct MailError {
    kind: ErrorKind,
    code: &'static str,
    message: String,
    request_id: Option<String>,
    attempts: Option<u32>,
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl MailError {
    /// Creates a new error.
    pub fn new(kind: ErrorKind, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            request_id: None,
            attempts: None,
            cause: None,
        }
    }

    /// Attaches the request id of the send this error belongs to.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Sets the underlying cause.
    pub fn with_cause<E: std::error::Error + Send + Sync + 'static>(mut self, cause: E) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Summarizes an exhausted retry loop, keeping the last failure as cause.
    pub fn retries_exhausted(attempts: u32, last: MailError) -> Self {
        let kind = last.kind;
        let request_id = last.request_id.clone();
        Self {
            kind,
            code: codes::RETRY_EXHAUSTED,
            message: format!("operation failed after {} attempts", attempts),
            request_id,
            attempts: Some(attempts),
            cause: Some(Box::new(last)),
        }
    }

    /// Returns the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the stable error code.
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// Returns the human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the request id, if known.
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Number of attempts made, set on exhausted retry summaries.
    pub fn attempts(&self) -> Option<u32> {
        self.attempts
    }

    /// Returns true if the retry policy allows another attempt.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    // Convenience constructors

    /// Creates a validation error.
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, code, message)
    }

    /// Creates an authentication error.
    pub fn authentication(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, code, message)
    }

    /// Creates a connection error.
    pub fn connection(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, code, message)
    }

    /// Creates a timeout error.
    pub fn timeout(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, code, message)
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, codes::INVALID_CONFIG, message)
    }
}

impl fmt::Display for MailError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}] {}", self.kind, self.code, self.message)?;
        if let Some(request_id) = &self.request_id {
            write!(f, " (request_id: {})", request_id)?;
        }
        if let Some(cause) = &self.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

/// Outcome of a bulk send that did not fully succeed.
#[derive(Error, Debug)]
pub enum BulkSendError {
    /// Some messages failed; the rest were delivered.
    #[error("{failed} of {total} messages failed")]
    Partial {
        /// Number of failed messages.
        failed: usize,
        /// Number of submitted messages.
        total: usize,
        /// Failures by submission index.
        failures: Vec<(usize, MailError)>,
    },
    /// The caller's context was cancelled before all outcomes were collected.
    #[error("bulk send cancelled")]
    Cancelled,
}

impl BulkSendError {
    /// Number of failed messages, zero for cancellation.
    pub fn failed(&self) -> usize {
        match self {
            BulkSendError::Partial { failed, .. } => *failed,
            BulkSendError::Cancelled => 0,
        }
    }
}
