//! Engine status codes and client error taxonomy.
//!
//! The engine answers every mutation with a status code. Transport-level
//! faults (timeout, disconnect, malformed reply) are a separate family
//! from protocol-level rejections: the former may be retried by callers,
//! the latter are terminal for the request that provoked them.

use std::fmt;
use thiserror::Error;

/// Return codes reported by the remote forwarding engine.
///
/// These mirror the engine's numeric `retval` field in replies.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PfeStatus {
    Success = 0,
    Failure = -1,
    InvalidInterface = -2,
    InvalidAddress = -3,
    AlreadyExists = -4,
    NotFound = -5,
    TableFull = -6,
    InUse = -7,
    Unsupported = -8,
    InternalError = -9,
}

impl PfeStatus {
    /// Creates a status from a raw reply code.
    ///
    /// Unknown codes collapse to `Failure`.
    pub fn from_raw(status: i32) -> Self {
        match status {
            0 => PfeStatus::Success,
            -1 => PfeStatus::Failure,
            -2 => PfeStatus::InvalidInterface,
            -3 => PfeStatus::InvalidAddress,
            -4 => PfeStatus::AlreadyExists,
            -5 => PfeStatus::NotFound,
            -6 => PfeStatus::TableFull,
            -7 => PfeStatus::InUse,
            -8 => PfeStatus::Unsupported,
            -9 => PfeStatus::InternalError,
            _ => PfeStatus::Failure,
        }
    }

    /// Returns true if the status indicates success.
    pub fn is_success(&self) -> bool {
        *self == PfeStatus::Success
    }

    /// Converts to a Result, returning `Ok(())` for success.
    pub fn into_result(self) -> PfeResult<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(PfeError::Rejection { status: self })
        }
    }
}

impl fmt::Display for PfeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PfeStatus::Success => "PFE_SUCCESS",
            PfeStatus::Failure => "PFE_FAILURE",
            PfeStatus::InvalidInterface => "PFE_INVALID_INTERFACE",
            PfeStatus::InvalidAddress => "PFE_INVALID_ADDRESS",
            PfeStatus::AlreadyExists => "PFE_ALREADY_EXISTS",
            PfeStatus::NotFound => "PFE_NOT_FOUND",
            PfeStatus::TableFull => "PFE_TABLE_FULL",
            PfeStatus::InUse => "PFE_IN_USE",
            PfeStatus::Unsupported => "PFE_UNSUPPORTED",
            PfeStatus::InternalError => "PFE_INTERNAL_ERROR",
        };
        write!(f, "{}", s)
    }
}

/// Error type for client operations against the engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PfeError {
    /// The engine refused the operation. Terminal for this request.
    #[error("engine rejected operation: {status}")]
    Rejection { status: PfeStatus },

    /// No correlated reply arrived within the configured deadline.
    #[error("request timed out")]
    Timeout,

    /// The transport lost its connection to the engine.
    #[error("transport disconnected")]
    Disconnected,

    /// A reply arrived but could not be interpreted.
    #[error("malformed reply: {message}")]
    MalformedReply { message: String },

    /// The request was rejected locally before being sent.
    #[error("invalid parameter: {message}")]
    InvalidParameter { message: String },

    /// The subscription's event channel is gone.
    #[error("subscription closed")]
    SubscriptionClosed,

    /// Internal client error.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl PfeError {
    /// Creates a malformed reply error.
    pub fn malformed(message: impl Into<String>) -> Self {
        PfeError::MalformedReply {
            message: message.into(),
        }
    }

    /// Creates an invalid parameter error.
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        PfeError::InvalidParameter {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        PfeError::Internal {
            message: message.into(),
        }
    }

    /// Returns the engine status if this is a protocol-level rejection.
    pub fn status(&self) -> Option<PfeStatus> {
        match self {
            PfeError::Rejection { status } => Some(*status),
            _ => None,
        }
    }

    /// Returns true for transport-level faults that callers may retry.
    ///
    /// Protocol-level rejections are never retryable: the engine saw the
    /// request and refused it.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            PfeError::Timeout | PfeError::Disconnected | PfeError::MalformedReply { .. }
        )
    }
}

/// Result type for client operations.
pub type PfeResult<T> = Result<T, PfeError>;
