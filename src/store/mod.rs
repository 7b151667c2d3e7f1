//! Ledger store contract.
//!
//! The store owns every persisted record. All writes go through an atomic
//! unit ([`LedgerStore::atomic`]): either every write of the unit becomes
//! visible or none does. Slot counters are only ever changed through the
//! four primitives of [`LedgerTx`] (`reserve`, `release`, `promote`,
//! `create_booking`), each of which refuses a write that would break
//! `reserved + confirmed <= required`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{
    Booking, BookingId, BookingStatus, Job, JobId, JobNumber, UserId, UserTrust, ViolationRecord,
};

pub mod memory;
pub use memory::{LedgerSnapshot, MemoryLedger};

/// Failures of the store itself, as opposed to policy rejections.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} does not exist")]
    JobNotFound(JobId),

    #[error("booking {0} does not exist")]
    BookingNotFound(BookingId),

    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Result of the conditional slot increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotGrant {
    Granted,
    /// No state change: the increment would have overbooked the job.
    Full,
}

/// Result of inserting a booking keyed by its idempotency key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upsert {
    Inserted(Booking),
    /// A non-terminal booking with the same key already exists; nothing was written.
    Existing(Booking),
}

/// Reads and writes available inside one atomic unit.
pub trait LedgerTx {
    fn job(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    fn job_by_number(&self, number: JobNumber) -> Result<Option<Job>, StoreError>;

    /// Every job, ordered by number.
    fn jobs(&self) -> Result<Vec<Job>, StoreError>;

    /// Reserve the next human-facing job number.
    fn next_job_number(&mut self) -> Result<JobNumber, StoreError>;

    fn insert_job(&mut self, job: Job) -> Result<(), StoreError>;

    /// Persist the job's status. Slot counters are ignored; use the primitives.
    fn set_job_status(&mut self, job: &Job) -> Result<(), StoreError>;

    fn booking(&self, id: BookingId) -> Result<Option<Booking>, StoreError>;

    /// The non-terminal booking of a (user, job) pair, if any.
    fn open_booking(&self, user: UserId, job: JobId) -> Result<Option<Booking>, StoreError>;

    /// The most recently reserved booking of a (user, job) pair, whatever its status.
    fn latest_booking(&self, user: UserId, job: JobId) -> Result<Option<Booking>, StoreError>;

    /// Every booking of the user, oldest first.
    fn user_bookings(&self, user: UserId) -> Result<Vec<Booking>, StoreError>;

    /// Overwrite the stored booking only if its current status is `expected`.
    ///
    /// Returns whether the write applied. A `false` is the "zero rows
    /// affected" of a conditional update: someone else moved the booking first.
    fn update_booking_if(
        &mut self,
        booking: &Booking,
        expected: BookingStatus,
    ) -> Result<bool, StoreError>;

    /// Increment `reserved_slots` only if the job stays within capacity.
    fn reserve(&mut self, job: JobId) -> Result<SlotGrant, StoreError>;

    /// Decrement `reserved_slots`, floored at zero.
    fn release(&mut self, job: JobId) -> Result<(), StoreError>;

    /// Move one slot from reserved to confirmed in a single write.
    fn promote(&mut self, job: JobId) -> Result<(), StoreError>;

    /// Insert a booking unless a non-terminal booking with the same key exists.
    fn create_booking(&mut self, booking: Booking) -> Result<Upsert, StoreError>;

    /// Trust state of a user; a clean record when none is stored.
    fn trust(&self, user: UserId) -> Result<UserTrust, StoreError>;

    fn put_trust(&mut self, trust: &UserTrust) -> Result<(), StoreError>;

    fn append_violation(&mut self, violation: ViolationRecord) -> Result<(), StoreError>;

    fn violations(&self, user: UserId) -> Result<Vec<ViolationRecord>, StoreError>;
}

/// A store that can run atomic units.
#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    /// Run `f` as one atomic unit. `Ok` commits all writes, `Err` discards them.
    async fn atomic<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn LedgerTx) -> Result<T, E> + Send,
        T: Send,
        E: From<StoreError> + Send;

    /// Up to `limit` `SlotReserved` bookings whose hold lapsed before `now`.
    ///
    /// Rows held by an in-flight unit are skipped rather than waited for;
    /// callers re-check the status inside their own unit.
    async fn expired_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Booking>, StoreError>;
}
