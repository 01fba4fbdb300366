//! Closed error taxonomy for the CALL protocol.
//!
//! Every [`CallError`] carries a stable, machine-readable [`ErrorCode`], a
//! human-readable message, and an optional structured `cause`. The taxonomy
//! is closed for transport/protocol-level failures; domain errors surfaced
//! by operation handlers use [`ErrorCode::Domain`] with a caller-supplied
//! `SCREAMING_SNAKE_CASE` tag.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad family an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Envelope parsing / routing failures.
    Envelope,
    /// Argument schema validation failures.
    Validation,
    /// Authentication and scope enforcement failures.
    Auth,
    /// Deprecated-operation refusal.
    Deprecation,
    /// Async operation lookup / polling failures.
    Async,
    /// Operation-specific domain failure surfaced by a handler.
    Domain,
    /// Unrecoverable infrastructure fault.
    Infrastructure,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Envelope => "envelope",
            Self::Validation => "validation",
            Self::Auth => "auth",
            Self::Deprecation => "deprecation",
            Self::Async => "async",
            Self::Domain => "domain",
            Self::Infrastructure => "infrastructure",
        };
        f.write_str(s)
    }
}

/// Machine-readable, stable error code.
///
/// The closed variants serialise to a fixed `SCREAMING_SNAKE_CASE` string
/// that will not change across patch releases. [`ErrorCode::Domain`] is the
/// escape hatch operation handlers use for operation-specific failures
/// (e.g. `ITEM_NOT_FOUND`); the taxonomy around it stays closed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ErrorCode {
    // -- Envelope --
    /// Request body is not a JSON object with a string `op`.
    InvalidEnvelope,
    /// `op` does not match any registered operation.
    UnknownOperation,
    /// HTTP method not allowed on this path.
    MethodNotAllowed,

    // -- Validation --
    /// Argument payload failed schema validation.
    SchemaValidationFailed,

    // -- Auth --
    /// No resolvable principal was supplied for an operation requiring scopes.
    AuthRequired,
    /// Principal resolved but lacks one or more required scopes.
    InsufficientScopes,
    /// Supplied card number does not match the canonical format.
    InvalidCard,
    /// No patron exists for the supplied card number.
    PatronNotFound,

    // -- Deprecation --
    /// Operation is deprecated and its sunset date has passed.
    OpRemoved,

    // -- Async --
    /// No live instance exists for the requested requestId.
    OperationNotFound,
    /// Poll arrived before the minimum interval elapsed.
    RateLimited,

    // -- Infrastructure --
    /// Catch-all for unexpected internal / infrastructure failures.
    InternalError,

    // -- Domain (open) --
    /// Operation-specific failure defined by a handler.
    Domain(String),
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidEnvelope | Self::UnknownOperation | Self::MethodNotAllowed => {
                ErrorCategory::Envelope
            }
            Self::SchemaValidationFailed => ErrorCategory::Validation,
            Self::AuthRequired
            | Self::InsufficientScopes
            | Self::InvalidCard
            | Self::PatronNotFound => ErrorCategory::Auth,
            Self::OpRemoved => ErrorCategory::Deprecation,
            Self::OperationNotFound | Self::RateLimited => ErrorCategory::Async,
            Self::InternalError => ErrorCategory::Infrastructure,
            Self::Domain(_) => ErrorCategory::Domain,
        }
    }

    /// Stable string representation, e.g. `"AUTH_REQUIRED"` or a domain tag
    /// such as `"ITEM_NOT_FOUND"` verbatim.
    pub fn as_str(&self) -> &str {
        match self {
            Self::InvalidEnvelope => "INVALID_ENVELOPE",
            Self::UnknownOperation => "UNKNOWN_OPERATION",
            Self::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            Self::SchemaValidationFailed => "SCHEMA_VALIDATION_FAILED",
            Self::AuthRequired => "AUTH_REQUIRED",
            Self::InsufficientScopes => "INSUFFICIENT_SCOPES",
            Self::InvalidCard => "INVALID_CARD",
            Self::PatronNotFound => "PATRON_NOT_FOUND",
            Self::OpRemoved => "OP_REMOVED",
            Self::OperationNotFound => "OPERATION_NOT_FOUND",
            Self::RateLimited => "RATE_LIMITED",
            Self::InternalError => "INTERNAL_ERROR",
            Self::Domain(tag) => tag,
        }
    }

    /// Construct a handler-defined domain code, validating its shape.
    ///
    /// # Errors
    ///
    /// Returns an error if `tag` is empty or contains characters outside
    /// `[A-Z0-9_]`.
    pub fn domain(tag: impl Into<String>) -> Result<Self, InvalidDomainCode> {
        let tag = tag.into();
        if tag.is_empty() || !tag.chars().all(|c| c.is_ascii_uppercase() || c == '_' || c.is_ascii_digit()) {
            return Err(InvalidDomainCode(tag));
        }
        Ok(Self::Domain(tag))
    }
}

/// Error returned by [`ErrorCode::domain`] when a handler tag is not
/// `SCREAMING_SNAKE_CASE`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("domain error code must be SCREAMING_SNAKE_CASE, got {0:?}")]
pub struct InvalidDomainCode(pub String);

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> Self {
        code.as_str().to_string()
    }
}

impl TryFrom<String> for ErrorCode {
    type Error = InvalidDomainCode;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Ok(match s.as_str() {
            "INVALID_ENVELOPE" => Self::InvalidEnvelope,
            "UNKNOWN_OPERATION" => Self::UnknownOperation,
            "METHOD_NOT_ALLOWED" => Self::MethodNotAllowed,
            "SCHEMA_VALIDATION_FAILED" => Self::SchemaValidationFailed,
            "AUTH_REQUIRED" => Self::AuthRequired,
            "INSUFFICIENT_SCOPES" => Self::InsufficientScopes,
            "INVALID_CARD" => Self::InvalidCard,
            "PATRON_NOT_FOUND" => Self::PatronNotFound,
            "OP_REMOVED" => Self::OpRemoved,
            "OPERATION_NOT_FOUND" => Self::OperationNotFound,
            "RATE_LIMITED" => Self::RateLimited,
            "INTERNAL_ERROR" => Self::InternalError,
            _ => Self::domain(s)?,
        })
    }
}

/// Unified CALL error: a stable code, a human-readable message, and an
/// optional structured cause.
///
/// ```
/// use call_error::{CallError, ErrorCode};
/// use serde_json::json;
///
/// let err = CallError::new(ErrorCode::InsufficientScopes, "missing required scopes")
///     .with_cause(json!({"missing": ["patron:billing"]}));
/// assert_eq!(err.code.as_str(), "INSUFFICIENT_SCOPES");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable message. Never empty.
    pub message: String,
    /// Stable, code-specific structured context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<serde_json::Value>,
}

impl CallError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    /// Attach a structured cause payload.
    #[must_use]
    pub fn with_cause(mut self, cause: serde_json::Value) -> Self {
        self.cause = Some(cause);
        self
    }

    /// Shorthand for `self.code.category()`.
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// `400 INVALID_ENVELOPE` — malformed request body.
    pub fn invalid_envelope(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidEnvelope, message)
    }

    /// `400 UNKNOWN_OPERATION` — no descriptor matches `op`.
    pub fn unknown_operation(op: &str) -> Self {
        Self::new(ErrorCode::UnknownOperation, format!("unknown operation: {op}"))
    }

    /// `401 AUTH_REQUIRED` — missing or unresolvable bearer token.
    pub fn auth_required() -> Self {
        Self::new(ErrorCode::AuthRequired, "a valid bearer token is required")
    }

    /// `403 INSUFFICIENT_SCOPES` — principal is missing one or more scopes.
    pub fn insufficient_scopes(missing: Vec<String>) -> Self {
        Self::new(ErrorCode::InsufficientScopes, "principal is missing required scopes")
            .with_cause(serde_json::json!({ "missing": missing }))
    }

    /// `410 OP_REMOVED` — deprecated operation past its sunset date.
    pub fn op_removed(op: &str, replacement: Option<&str>) -> Self {
        Self::new(ErrorCode::OpRemoved, format!("{op} was removed"))
            .with_cause(serde_json::json!({ "replacement": replacement }))
    }

    /// `404 OPERATION_NOT_FOUND` — unknown or expired requestId.
    pub fn operation_not_found(request_id: uuid::Uuid) -> Self {
        Self::new(
            ErrorCode::OperationNotFound,
            format!("no operation instance for requestId {request_id}"),
        )
    }

    /// `429 RATE_LIMITED` — polled again before the minimum interval elapsed.
    pub fn rate_limited(retry_after_ms: u64) -> Self {
        Self::new(ErrorCode::RateLimited, "poll arrived before the minimum interval elapsed")
            .with_cause(serde_json::json!({ "retryAfterMs": retry_after_ms }))
    }

    /// `500 INTERNAL_ERROR` — unrecoverable infrastructure fault.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for CallError {}
