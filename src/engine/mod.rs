//! Reservation and booking engine.
//!
//! The engine turns user and administrator actions into atomic units on the
//! ledger store. It keeps no state between calls: every check that decides
//! an outcome is re-read inside the unit that writes, so concurrent callers
//! only ever observe committed states.

use std::fmt::Display;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::model::{
    AdminId, BlockState, Booking, BookingId, BookingStatus, Job, JobId, JobNumber, JobStatus, Payment,
    Receipt, UserId, UserTrust,
};
use crate::notify::{Notification, Outbox};
use crate::store::{LedgerStore, LedgerTx, SlotGrant, StoreError, Upsert};

mod error;
pub use error::{BookingRef, EngineError};

mod review;
pub use review::BlockOutcome;

/// Successful outcome of [`Engine::confirm_booking`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// A new hold was taken.
    Created(Booking),
    /// The user already holds this slot; nothing was written.
    Existing { booking: Booking, remaining: Duration },
}

impl Reservation {
    pub fn booking(&self) -> &Booking {
        match self {
            Reservation::Created(booking) => booking,
            Reservation::Existing { booking, .. } => booking,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Reservation::Created(_))
    }
}

/// The booking engine, generic over the ledger backend.
pub struct Engine<S> {
    store: Arc<S>,
    outbox: Outbox,
}

/// Public API
impl<S: LedgerStore> Engine<S> {
    pub fn new(store: Arc<S>, outbox: Outbox) -> Self {
        Self { store, outbox }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Create a job in `Draft` with the next sequence number.
    pub async fn create_job(
        &self,
        admin: AdminId,
        required_workers: u32,
        now: DateTime<Utc>,
    ) -> Result<Job, EngineError> {
        let result = if required_workers == 0 {
            Err(EngineError::InvalidCapacity(required_workers))
        } else {
            self.store
                .atomic(|tx| {
                    let number = tx.next_job_number()?;
                    let job = Job::draft(number, required_workers, admin, now);
                    tx.insert_job(job.clone())?;
                    Ok(job)
                })
                .await
        };
        Self::log_job("create_job", &result);
        result
    }

    /// `Draft` to `Active`: the job starts accepting reservations.
    pub async fn publish_job(&self, job: JobId) -> Result<Job, EngineError> {
        let result = self.transition_job(job, JobStatus::Active).await;
        Self::log_job("publish_job", &result);
        result
    }

    pub async fn complete_job(&self, job: JobId) -> Result<Job, EngineError> {
        let result = self.transition_job(job, JobStatus::Completed).await;
        Self::log_job("complete_job", &result);
        result
    }

    pub async fn cancel_job(&self, job: JobId) -> Result<Job, EngineError> {
        let result = self.transition_job(job, JobStatus::Cancelled).await;
        Self::log_job("cancel_job", &result);
        result
    }

    pub async fn job(&self, id: JobId) -> Result<Option<Job>, EngineError> {
        self.store.atomic(|tx| Ok(tx.job(id)?)).await
    }

    pub async fn job_by_number(&self, number: JobNumber) -> Result<Option<Job>, EngineError> {
        self.store.atomic(|tx| Ok(tx.job_by_number(number)?)).await
    }

    pub async fn jobs(&self) -> Result<Vec<Job>, EngineError> {
        self.store.atomic(|tx| Ok(tx.jobs()?)).await
    }

    pub async fn booking(&self, id: BookingId) -> Result<Option<Booking>, EngineError> {
        self.store.atomic(|tx| Ok(tx.booking(id)?)).await
    }

    pub async fn latest_booking(
        &self,
        user: UserId,
        job: JobId,
    ) -> Result<Option<Booking>, EngineError> {
        self.store.atomic(|tx| Ok(tx.latest_booking(user, job)?)).await
    }

    pub async fn trust(&self, user: UserId) -> Result<UserTrust, EngineError> {
        self.store.atomic(|tx| Ok(tx.trust(user)?)).await
    }

    /// Reserve one slot of `job` for `user`.
    ///
    /// Retrying while the hold is alive returns the existing booking with
    /// the time left on it instead of a second reservation.
    pub async fn confirm_booking(
        &self,
        user: UserId,
        job: JobId,
        now: DateTime<Utc>,
    ) -> Result<Reservation, EngineError> {
        let result = self.try_confirm_booking(user, job, now).await;
        Self::log_result("confirm_booking", user, Some(job), &result);
        result
    }

    /// Attach a payment receipt to the user's live reservation.
    pub async fn submit_payment(
        &self,
        user: UserId,
        receipt: Receipt,
        now: DateTime<Utc>,
    ) -> Result<Booking, EngineError> {
        let result = self.try_submit_payment(user, receipt, now).await;
        Self::log_result("submit_payment", user, None, &result);
        result
    }

    /// Give a reserved slot back before paying for it.
    pub async fn cancel_booking(&self, user: UserId, job: JobId) -> Result<Booking, EngineError> {
        let result = self.try_cancel_booking(user, job).await;
        Self::log_result("cancel_booking", user, Some(job), &result);
        result
    }
}

/// Private API
impl<S: LedgerStore> Engine<S> {
    /// Small helper to log operation results
    fn log_result<T, E: Display>(
        op: &str,
        user: UserId,
        job: Option<JobId>,
        result: &Result<T, E>,
    ) {
        match (result, job) {
            (Ok(_), Some(job)) => info!(user = %user, job = %job, "{op} applied"),
            (Ok(_), None) => info!(user = %user, "{op} applied"),
            (Err(e), Some(job)) => info!(user = %user, job = %job, reason = %e, "{op} skipped"),
            (Err(e), None) => info!(user = %user, reason = %e, "{op} skipped"),
        }
    }

    fn log_job(op: &str, result: &Result<Job, EngineError>) {
        match result {
            Ok(job) => info!(
                job = %job.id,
                number = job.number,
                status = %job.status,
                "{op} applied"
            ),
            Err(e) => info!(reason = %e, "{op} skipped"),
        }
    }

    async fn transition_job(&self, id: JobId, to: JobStatus) -> Result<Job, EngineError> {
        use JobStatus::*;

        self.store
            .atomic(|tx| {
                let mut job = tx.job(id)?.ok_or(EngineError::JobNotFound(id))?;
                // closed jobs never reopen
                let allowed = !job.status.is_terminal()
                    && match to {
                        Active => job.status == Draft,
                        Completed => matches!(job.status, Active | Full),
                        Cancelled => true,
                        Draft | Full => false,
                    };
                if !allowed {
                    return Err(EngineError::JobTransition {
                        job: id,
                        from: job.status,
                        to,
                    });
                }
                job.status = to;
                job.sync_label();
                tx.set_job_status(&job)?;
                Ok(job)
            })
            .await
    }

    /// Reject blocked users, lifting a temporary block that ran out.
    async fn check_block(&self, user: UserId, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.store
            .atomic(|tx| {
                let mut trust = tx.trust(user)?;
                match trust.block {
                    BlockState::Clear => Ok(()),
                    BlockState::Permanent => Err(EngineError::UserBlockedPermanently {
                        user,
                        violations: trust.total_violations,
                        reason: trust.reason.clone(),
                    }),
                    BlockState::Until(until) if until > now => {
                        Err(EngineError::UserBlockedTemporarily {
                            user,
                            until,
                            remaining: until - now,
                            violations: trust.total_violations,
                        })
                    }
                    BlockState::Until(_) => {
                        trust.block = BlockState::Clear;
                        tx.put_trust(&trust)?;
                        info!(user = %user, "temporary block lifted");
                        Ok(())
                    }
                }
            })
            .await
    }

    async fn try_confirm_booking(
        &self,
        user: UserId,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Reservation, EngineError> {
        self.check_block(user, now).await?;

        let mut lapsed = None;
        let result = self
            .store
            .atomic(|tx| {
                // Retried request for the same pair
                if let Some(latest) = tx.latest_booking(user, job_id)? {
                    match latest.status {
                        BookingStatus::SlotReserved if latest.is_expired(now) => {
                            if expire_reservation(tx, &latest)? {
                                lapsed = Some(latest);
                            }
                        }
                        BookingStatus::SlotReserved => {
                            return Ok(Reservation::Existing {
                                remaining: latest.remaining(now),
                                booking: latest,
                            });
                        }
                        BookingStatus::PaymentSubmitted => {
                            return Err(EngineError::PaymentUnderReview(latest.id));
                        }
                        BookingStatus::Confirmed => {
                            return Err(EngineError::BookingAlreadyConfirmed(latest.id));
                        }
                        BookingStatus::Rejected
                        | BookingStatus::Expired
                        | BookingStatus::CancelledByUser => {}
                    }
                }

                // One pending claim per user across all jobs
                let held = tx.user_bookings(user)?.into_iter().find(|b| {
                    b.job_id != job_id
                        && match b.status {
                            BookingStatus::SlotReserved => !b.is_expired(now),
                            BookingStatus::PaymentSubmitted => true,
                            _ => false,
                        }
                });
                if let Some(held) = held {
                    return Err(EngineError::DuplicateActiveBooking {
                        user,
                        booking: held.id,
                        job: held.job_id,
                    });
                }

                let job = tx.job(job_id)?.ok_or(EngineError::JobNotFound(job_id))?;
                if !job.status.accepts_bookings() {
                    return Err(EngineError::JobNotActive(job_id, job.status));
                }
                // advisory only, the conditional reserve below decides
                if job.is_full() {
                    return Err(full_error(&job));
                }

                let booking = match tx.create_booking(Booking::reserve(user, job_id, now))? {
                    Upsert::Inserted(booking) => booking,
                    Upsert::Existing(booking) => {
                        return Ok(Reservation::Existing {
                            remaining: booking.remaining(now),
                            booking,
                        });
                    }
                };

                match tx.reserve(job_id)? {
                    SlotGrant::Granted => Ok(Reservation::Created(booking)),
                    // drops the inserted booking with the rest of the unit
                    SlotGrant::Full => Err(full_error(&job)),
                }
            })
            .await;

        // the in-place expiry only stands if the unit committed
        if let (Ok(_), Some(expired)) = (&result, lapsed) {
            self.outbox.publish(Notification::Expired {
                user: expired.user_id,
                booking: expired.id,
                job: expired.job_id,
            });
        }
        result
    }

    async fn try_submit_payment(
        &self,
        user: UserId,
        receipt: Receipt,
        now: DateTime<Utc>,
    ) -> Result<Booking, EngineError> {
        self.store
            .atomic(move |tx| {
                let bookings = tx.user_bookings(user)?;
                let current = bookings
                    .iter()
                    .rev()
                    .find(|b| b.status == BookingStatus::SlotReserved);

                let Some(current) = current else {
                    return Err(match bookings.last() {
                        Some(last) if last.status == BookingStatus::Expired => {
                            EngineError::BookingExpired(last.id)
                        }
                        Some(last) if last.status == BookingStatus::PaymentSubmitted => {
                            EngineError::PaymentUnderReview(last.id)
                        }
                        _ => EngineError::BookingNotFound(BookingRef::Reserved(user)),
                    });
                };

                if current.is_expired(now) {
                    return Err(EngineError::BookingExpired(current.id));
                }

                let mut submitted = current.clone();
                submitted.status = BookingStatus::PaymentSubmitted;
                submitted.payment = Some(Payment {
                    receipt,
                    submitted_at: now,
                });
                if !tx.update_booking_if(&submitted, BookingStatus::SlotReserved)? {
                    return Err(EngineError::BookingNotFound(BookingRef::Reserved(user)));
                }
                Ok(submitted)
            })
            .await
    }

    async fn try_cancel_booking(&self, user: UserId, job: JobId) -> Result<Booking, EngineError> {
        self.store
            .atomic(|tx| {
                let not_found = EngineError::BookingNotFound(BookingRef::Pair(user, job));
                let booking = tx.latest_booking(user, job)?.ok_or(not_found)?;
                match booking.status {
                    BookingStatus::SlotReserved => {}
                    BookingStatus::PaymentSubmitted => {
                        return Err(EngineError::PaymentUnderReview(booking.id));
                    }
                    BookingStatus::Confirmed => {
                        return Err(EngineError::BookingAlreadyConfirmed(booking.id));
                    }
                    BookingStatus::Expired => return Err(EngineError::BookingExpired(booking.id)),
                    BookingStatus::Rejected | BookingStatus::CancelledByUser => {
                        return Err(EngineError::BookingNotFound(BookingRef::Pair(user, job)));
                    }
                }

                let mut cancelled = booking.clone();
                cancelled.status = BookingStatus::CancelledByUser;
                if !tx.update_booking_if(&cancelled, BookingStatus::SlotReserved)? {
                    return Err(EngineError::BookingNotFound(BookingRef::Pair(user, job)));
                }
                tx.release(job)?;
                Ok(cancelled)
            })
            .await
    }
}

/// Tell a job that may free up soon apart from one that will not.
fn full_error(job: &Job) -> EngineError {
    if job.reserved_slots > 0 {
        EngineError::SlotsTemporarilyReserved {
            job: job.id,
            pending: job.reserved_slots,
        }
    } else {
        EngineError::JobFull(job.id)
    }
}

/// Mark a lapsed reservation `Expired` and give its slot back.
///
/// Returns `false` without touching the job when the booking already left
/// `SlotReserved`, so racing expirations release the slot once.
pub(crate) fn expire_reservation(
    tx: &mut dyn LedgerTx,
    booking: &Booking,
) -> Result<bool, StoreError> {
    let mut expired = booking.clone();
    expired.status = BookingStatus::Expired;
    if !tx.update_booking_if(&expired, BookingStatus::SlotReserved)? {
        return Ok(false);
    }
    tx.release(booking.job_id)?;
    Ok(true)
}
