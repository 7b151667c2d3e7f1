//! Core domain types for the slot reservation engine.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// End-user identifier (as handed over by the messaging surface).
pub type UserId = i64;

/// Administrator identifier.
pub type AdminId = i64;

/// Opaque job identifier.
pub type JobId = Uuid;

/// Opaque booking identifier.
pub type BookingId = Uuid;

/// Human-facing job sequence number.
pub type JobNumber = u64;

/// How long a `SlotReserved` booking holds a slot without payment.
pub const RESERVATION_TTL_SECS: i64 = 180;

/// Length of the block applied on the second violation strike.
pub const TEMPORARY_BLOCK_HOURS: i64 = 24;

pub fn reservation_ttl() -> Duration {
    Duration::seconds(RESERVATION_TTL_SECS)
}

/// Lifecycle of a job posting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Draft,
    Active,
    /// Advisory label only; fullness is always recomputed from the counters.
    Full,
    Completed,
    Cancelled,
}

impl JobStatus {
    /// Active and Full jobs are both open; Full only means "no free slot right now".
    pub fn accepts_bookings(self) -> bool {
        matches!(self, JobStatus::Active | JobStatus::Full)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Draft => "draft",
            JobStatus::Active => "active",
            JobStatus::Full => "full",
            JobStatus::Completed => "completed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A postable unit of work with a fixed number of slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub number: JobNumber,
    pub required_workers: u32,
    pub reserved_slots: u32,
    pub confirmed_slots: u32,
    pub status: JobStatus,
    pub created_by: AdminId,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Create a new job in the `Draft` state with no slot taken.
    pub fn draft(
        number: JobNumber,
        required_workers: u32,
        created_by: AdminId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            number,
            required_workers,
            reserved_slots: 0,
            confirmed_slots: 0,
            status: JobStatus::Draft,
            created_by,
            created_at: now,
        }
    }

    /// Slots held by a reservation or a confirmed booking.
    pub fn occupied(&self) -> u32 {
        self.reserved_slots + self.confirmed_slots
    }

    pub fn available(&self) -> u32 {
        self.required_workers.saturating_sub(self.occupied())
    }

    pub fn is_full(&self) -> bool {
        self.occupied() >= self.required_workers
    }

    /// Realign the advisory `Full` label with the counters.
    pub fn sync_label(&mut self) {
        match self.status {
            JobStatus::Active if self.is_full() => self.status = JobStatus::Full,
            JobStatus::Full if !self.is_full() => self.status = JobStatus::Active,
            _ => {}
        }
    }
}

/// Lifecycle of one user's claim against a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    SlotReserved,
    PaymentSubmitted,
    Confirmed,
    Rejected,
    Expired,
    CancelledByUser,
}

impl BookingStatus {
    pub fn is_terminal(self) -> bool {
        !self.is_pending()
    }

    /// A pending booking still holds a reserved slot.
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            BookingStatus::SlotReserved | BookingStatus::PaymentSubmitted
        )
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BookingStatus::SlotReserved => "slot_reserved",
            BookingStatus::PaymentSubmitted => "payment_submitted",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Rejected => "rejected",
            BookingStatus::Expired => "expired",
            BookingStatus::CancelledByUser => "cancelled_by_user",
        };
        f.write_str(s)
    }
}

/// Deterministic key of a (user, job) pair, used to absorb retried reservations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(user: UserId, job: JobId) -> Self {
        Self(format!("{user}:{job}"))
    }
}

/// Payment proof uploaded by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Reference to the uploaded file on the messaging surface.
    pub reference: String,
}

impl Receipt {
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub receipt: Receipt,
    pub submitted_at: DateTime<Utc>,
}

/// Outcome of an administrator's payment review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub admin: AdminId,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub job_id: JobId,
    pub user_id: UserId,
    pub idempotency_key: IdempotencyKey,
    pub status: BookingStatus,
    pub reserved_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub payment: Option<Payment>,
    pub review: Option<Review>,
}

impl Booking {
    /// A fresh `SlotReserved` booking holding a slot for [`RESERVATION_TTL_SECS`].
    pub fn reserve(user: UserId, job: JobId, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id: job,
            user_id: user,
            idempotency_key: IdempotencyKey::new(user, job),
            status: BookingStatus::SlotReserved,
            reserved_at: now,
            expires_at: now + reservation_ttl(),
            payment: None,
            review: None,
        }
    }

    /// Whether the reservation hold has lapsed. Only meaningful while `SlotReserved`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == BookingStatus::SlotReserved && self.expires_at < now
    }

    /// Time left on the reservation hold, never negative.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).max(Duration::zero())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationKind {
    FraudulentPayment,
}

/// One recorded strike against a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub user: UserId,
    pub booking: BookingId,
    pub kind: ViolationKind,
    pub admin: AdminId,
    pub at: DateTime<Utc>,
}

/// Sanction attached to a violation count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationTier {
    Warning,
    TemporaryBlock,
    PermanentBlock,
}

impl ViolationTier {
    /// Total mapping from the updated violation count to a sanction.
    ///
    /// The count includes the strike being recorded, so it is at least one.
    pub fn for_count(count: u32) -> Self {
        match count {
            0 | 1 => ViolationTier::Warning,
            2 => ViolationTier::TemporaryBlock,
            _ => ViolationTier::PermanentBlock,
        }
    }

    pub fn block_from(self, now: DateTime<Utc>) -> BlockState {
        match self {
            ViolationTier::Warning => BlockState::Clear,
            ViolationTier::TemporaryBlock => {
                BlockState::Until(now + Duration::hours(TEMPORARY_BLOCK_HOURS))
            }
            ViolationTier::PermanentBlock => BlockState::Permanent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BlockState {
    #[default]
    Clear,
    Until(DateTime<Utc>),
    Permanent,
}

/// Per-user trust state: violation count and current block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTrust {
    pub user: UserId,
    pub total_violations: u32,
    pub block: BlockState,
    pub reason: Option<String>,
    pub blocked_by: Option<AdminId>,
}

impl UserTrust {
    pub fn new(user: UserId) -> Self {
        Self {
            user,
            total_violations: 0,
            block: BlockState::Clear,
            reason: None,
            blocked_by: None,
        }
    }
}
