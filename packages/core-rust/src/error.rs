//! Error taxonomy shared by every layer of the bus.
//!
//! Operations return `Result<T, Errors>`: either a value or a non-empty,
//! ordered list of typed [`Error`]s. Retry policies and outcome reporting
//! inspect errors through their [`ErrorKind`], which is `Copy + Hash` so it
//! can live in allow/deny sets.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Result alias used across the workspace.
pub type BusResult<T> = Result<T, Errors>;

// ---------------------------------------------------------------------------
// FailureKind
// ---------------------------------------------------------------------------

/// Category of a domain error raised by consumer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    Validation,
    NotFound,
    Conflict,
    Unauthorized,
    Forbidden,
    Failure,
    Unexpected,
}

impl FailureKind {
    /// Stable lowercase label, used in headers and metric labels.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::Failure => "failure",
            Self::Unexpected => "unexpected",
        }
    }
}

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Discriminant of an [`Error`], without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    InvalidEndpointAddress,
    InvalidMessageId,
    InvalidCorrelationId,
    InvalidConversationId,
    SerializationFailed,
    DeserializationFailed,
    UnknownMessageType,
    DuplicateMessageType,
    ConsumerFailed(FailureKind),
    RetryExhausted,
    CircuitBreakerOpen,
    Timeout,
    TransportError,
    Cancelled,
    Fault,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::InvalidEndpointAddress => "invalid_endpoint_address",
            Self::InvalidMessageId => "invalid_message_id",
            Self::InvalidCorrelationId => "invalid_correlation_id",
            Self::InvalidConversationId => "invalid_conversation_id",
            Self::SerializationFailed => "serialization_failed",
            Self::DeserializationFailed => "deserialization_failed",
            Self::UnknownMessageType => "unknown_message_type",
            Self::DuplicateMessageType => "duplicate_message_type",
            Self::ConsumerFailed(kind) => return write!(f, "consumer_failed:{}", kind.as_str()),
            Self::RetryExhausted => "retry_exhausted",
            Self::CircuitBreakerOpen => "circuit_breaker_open",
            Self::Timeout => "timeout",
            Self::TransportError => "transport_error",
            Self::Cancelled => "cancelled",
            Self::Fault => "fault",
        };
        f.write_str(label)
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// A single typed error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("invalid endpoint address `{address}`: {reason}")]
    InvalidEndpointAddress { address: String, reason: String },
    #[error("invalid message id `{0}`")]
    InvalidMessageId(String),
    #[error("invalid correlation id `{0}`")]
    InvalidCorrelationId(String),
    #[error("invalid conversation id `{0}`")]
    InvalidConversationId(String),
    #[error("failed to serialize {type_name}: {reason}")]
    SerializationFailed { type_name: String, reason: String },
    #[error("failed to deserialize {type_name}: {reason}")]
    DeserializationFailed { type_name: String, reason: String },
    #[error("unknown message type `{0}`")]
    UnknownMessageType(String),
    #[error("message type `{urn}` is registered for {existing}, cannot register {rejected}")]
    DuplicateMessageType {
        urn: String,
        existing: &'static str,
        rejected: &'static str,
    },
    #[error("consumer failed ({code}): {message}")]
    ConsumerFailed {
        kind: FailureKind,
        code: String,
        message: String,
    },
    #[error("retry limit exhausted after {attempts} attempts")]
    RetryExhausted { attempts: u32 },
    #[error("circuit breaker is open")]
    CircuitBreakerOpen,
    #[error("delivery timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("unhandled fault: {0}")]
    Fault(String),
}

impl Error {
    /// Shorthand for an endpoint address error.
    pub fn invalid_address(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidEndpointAddress {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Domain error raised by a consumer.
    pub fn consumer(kind: FailureKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConsumerFailed {
            kind,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Generic consumer failure (`FailureKind::Failure`).
    pub fn failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::consumer(FailureKind::Failure, code, message)
    }

    /// Consumer validation failure.
    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::consumer(FailureKind::Validation, code, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidEndpointAddress { .. } => ErrorKind::InvalidEndpointAddress,
            Self::InvalidMessageId(_) => ErrorKind::InvalidMessageId,
            Self::InvalidCorrelationId(_) => ErrorKind::InvalidCorrelationId,
            Self::InvalidConversationId(_) => ErrorKind::InvalidConversationId,
            Self::SerializationFailed { .. } => ErrorKind::SerializationFailed,
            Self::DeserializationFailed { .. } => ErrorKind::DeserializationFailed,
            Self::UnknownMessageType(_) => ErrorKind::UnknownMessageType,
            Self::DuplicateMessageType { .. } => ErrorKind::DuplicateMessageType,
            Self::ConsumerFailed { kind, .. } => ErrorKind::ConsumerFailed(*kind),
            Self::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            Self::CircuitBreakerOpen => ErrorKind::CircuitBreakerOpen,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Transport(_) => ErrorKind::TransportError,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Fault(_) => ErrorKind::Fault,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Non-empty, ordered list of errors.
///
/// The first error is the primary one; later entries add context (for
/// example `RetryExhausted` appended after the consumer's own failure).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Errors {
    items: Vec<Error>,
}

impl Errors {
    /// Creates a list holding a single error.
    #[must_use]
    pub fn new(first: Error) -> Self {
        Self { items: vec![first] }
    }

    /// Builds a list from a vector, returning `None` when it is empty.
    #[must_use]
    pub fn from_vec(items: Vec<Error>) -> Option<Self> {
        if items.is_empty() {
            None
        } else {
            Some(Self { items })
        }
    }

    pub fn push(&mut self, error: Error) {
        self.items.push(error);
    }

    /// Appends every error of `other`, preserving order.
    pub fn extend(&mut self, other: Errors) {
        self.items.extend(other.items);
    }

    /// The primary error. Always present.
    #[must_use]
    pub fn first(&self) -> &Error {
        &self.items[0]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Always `false`; provided for API symmetry with collections.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Error> {
        self.items.iter()
    }

    pub fn kinds(&self) -> impl Iterator<Item = ErrorKind> + '_ {
        self.items.iter().map(Error::kind)
    }

    /// Whether any error in the list has the given kind.
    #[must_use]
    pub fn contains(&self, kind: ErrorKind) -> bool {
        self.kinds().any(|k| k == kind)
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<Error> {
        self.items
    }
}

impl From<Error> for Errors {
    fn from(error: Error) -> Self {
        Self::new(error)
    }
}

impl<'a> IntoIterator for &'a Errors {
    type Item = &'a Error;
    type IntoIter = std::slice::Iter<'a, Error>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl IntoIterator for Errors {
    type Item = Error;
    type IntoIter = std::vec::IntoIter<Error>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl fmt::Display for Errors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.items.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Errors {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.first())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
