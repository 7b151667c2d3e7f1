//! Error types for booking operations.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::model::{BookingId, BookingStatus, JobId, JobStatus, UserId};
use crate::store::StoreError;

/// How a missing booking was looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingRef {
    Id(BookingId),
    /// The user's current reservation, whatever the job.
    Reserved(UserId),
    Pair(UserId, JobId),
}

impl fmt::Display for BookingRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BookingRef::Id(id) => write!(f, "booking {id}"),
            BookingRef::Reserved(user) => write!(f, "reservation of user {user}"),
            BookingRef::Pair(user, job) => write!(f, "booking of user {user} on job {job}"),
        }
    }
}

/// Error returned by every engine operation.
///
/// Everything but [`EngineError::Store`] is a policy rejection: typed,
/// final, and carrying what the caller needs to explain it to the user.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("job {0} is not accepting bookings (status {1})")]
    JobNotActive(JobId, JobStatus),

    #[error("job {0} is full")]
    JobFull(JobId),

    #[error("job {job} has no free slot, {pending} reservation(s) may still lapse")]
    SlotsTemporarilyReserved { job: JobId, pending: u32 },

    #[error("user {user} already holds booking {booking} on job {job}")]
    DuplicateActiveBooking {
        user: UserId,
        booking: BookingId,
        job: JobId,
    },

    #[error("payment of booking {0} is under review")]
    PaymentUnderReview(BookingId),

    #[error("booking {0} is already confirmed")]
    BookingAlreadyConfirmed(BookingId),

    #[error("{0} not found")]
    BookingNotFound(BookingRef),

    #[error("payment of booking {booking} was already processed ({status})")]
    PaymentAlreadyProcessed {
        booking: BookingId,
        status: BookingStatus,
    },

    #[error("booking {booking} has no payment to review ({status})")]
    PaymentNotSubmitted {
        booking: BookingId,
        status: BookingStatus,
    },

    #[error("booking {booking} belongs to user {owner}, not {user}")]
    BookingOwnerMismatch {
        booking: BookingId,
        owner: UserId,
        user: UserId,
    },

    #[error("user {user} is blocked permanently after {violations} violation(s)")]
    UserBlockedPermanently {
        user: UserId,
        violations: u32,
        reason: Option<String>,
    },

    #[error("user {user} is blocked for another {}s", .remaining.num_seconds())]
    UserBlockedTemporarily {
        user: UserId,
        until: DateTime<Utc>,
        remaining: Duration,
        violations: u32,
    },

    #[error("reservation {0} has expired")]
    BookingExpired(BookingId),

    #[error("a job needs at least one worker, got {0}")]
    InvalidCapacity(u32),

    #[error("job {job} cannot move from {from} to {to}")]
    JobTransition {
        job: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("ledger unavailable: {0}")]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Transient store failures may be retried; policy rejections may not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Store(_))
    }
}
