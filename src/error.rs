use crate::types::BookingStatus;
use chrono::NaiveDate;
use thiserror::Error;

/// Failures reported by a [`crate::backend::BookingBackend`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// A uniqueness constraint or conditional write rejected the change.
    #[error("conflicting record: {0}")]
    Conflict(String),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("backend failure: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BookingError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("no authenticated identity")]
    Unauthorized,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("slot {start_time}-{end_time} on {date} is not available: {reason}")]
    SlotNotAvailable {
        date: NaiveDate,
        start_time: String,
        end_time: String,
        reason: String,
    },
    #[error("slot {start_time}-{end_time} on {date} is already booked")]
    SlotAlreadyBooked {
        date: NaiveDate,
        start_time: String,
        end_time: String,
    },
    #[error("booking cannot move from {from} to {to}")]
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    #[error("service temporarily unavailable: {0}")]
    Unavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl BookingError {
    /// Stable identifier sent to clients alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            BookingError::NotFound(_) => "not_found",
            BookingError::Unauthorized => "unauthorized",
            BookingError::Forbidden(_) => "forbidden",
            BookingError::InvalidInput(_) => "invalid_input",
            BookingError::SlotNotAvailable { .. } => "slot_not_available",
            BookingError::SlotAlreadyBooked { .. } => "slot_already_booked",
            BookingError::InvalidTransition { .. } => "invalid_transition",
            BookingError::Unavailable(_) => "unavailable",
            BookingError::Internal(_) => "internal",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, BookingError::Unavailable(_))
    }
}

impl From<StoreError> for BookingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => BookingError::NotFound(what),
            StoreError::Backend(msg) => BookingError::Unavailable(msg),
            StoreError::Conflict(msg) => BookingError::Internal(msg),
        }
    }
}

impl From<validator::ValidationErrors> for BookingError {
    fn from(err: validator::ValidationErrors) -> Self {
        BookingError::InvalidInput(err.to_string())
    }
}
