//! Administrator payment review and violation escalation.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::{BookingRef, Engine, EngineError};
use crate::model::{
    AdminId, BlockState, Booking, BookingId, BookingStatus, Review, UserId, ViolationKind,
    ViolationRecord, ViolationTier,
};
use crate::notify::Notification;
use crate::store::{LedgerStore, LedgerTx};

/// Rejection reason recorded when a payment is rejected as fraudulent.
const FRAUD_REASON: &str = "fraudulent payment receipt";

/// Result of [`Engine::block_user_and_reject_payment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockOutcome {
    /// The booking after the call; `Rejected` if it was still under review.
    pub booking: Booking,
    /// Whether this call rejected the payment (false if it was already settled).
    pub rejected: bool,
    pub tier: ViolationTier,
    pub total_violations: u32,
    pub block: BlockState,
}

impl<S: LedgerStore> Engine<S> {
    /// Accept a submitted payment: the booking is confirmed and its slot promoted.
    pub async fn approve_payment(
        &self,
        booking: BookingId,
        admin: AdminId,
        now: DateTime<Utc>,
    ) -> Result<Booking, EngineError> {
        let result = self
            .store
            .atomic(|tx| {
                let current = tx
                    .booking(booking)?
                    .ok_or(EngineError::BookingNotFound(BookingRef::Id(booking)))?;
                ensure_submitted(&current)?;

                let mut confirmed = current.clone();
                confirmed.status = BookingStatus::Confirmed;
                confirmed.review = Some(Review {
                    admin,
                    at: now,
                    reason: None,
                });
                if !tx.update_booking_if(&confirmed, BookingStatus::PaymentSubmitted)? {
                    return Err(EngineError::PaymentAlreadyProcessed {
                        booking,
                        status: current.status,
                    });
                }
                tx.promote(current.job_id)?;
                Ok(confirmed)
            })
            .await;

        self.log_review("approve_payment", booking, admin, &result);
        if let Ok(confirmed) = &result {
            self.outbox.publish(Notification::Confirmed {
                user: confirmed.user_id,
                booking: confirmed.id,
                job: confirmed.job_id,
            });
        }
        result
    }

    /// Refuse a submitted payment and give its slot back.
    pub async fn reject_payment(
        &self,
        booking: BookingId,
        admin: AdminId,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Booking, EngineError> {
        let reason = reason.into();
        let result = self
            .store
            .atomic(move |tx| {
                let current = tx
                    .booking(booking)?
                    .ok_or(EngineError::BookingNotFound(BookingRef::Id(booking)))?;
                ensure_submitted(&current)?;
                reject_in(tx, &current, admin, reason, now)
            })
            .await;

        self.log_review("reject_payment", booking, admin, &result);
        if let Ok(rejected) = &result {
            self.publish_rejection(rejected);
        }
        result
    }

    /// Reject the payment as fraudulent (if still under review) and record a
    /// violation strike against the user.
    ///
    /// The resulting sanction depends only on the user's new violation
    /// count: a warning, then a 24 hour block, then a permanent block.
    pub async fn block_user_and_reject_payment(
        &self,
        booking: BookingId,
        user: UserId,
        admin: AdminId,
        now: DateTime<Utc>,
    ) -> Result<BlockOutcome, EngineError> {
        let result = self
            .store
            .atomic(|tx| {
                let current = tx
                    .booking(booking)?
                    .ok_or(EngineError::BookingNotFound(BookingRef::Id(booking)))?;
                if current.user_id != user {
                    return Err(EngineError::BookingOwnerMismatch {
                        booking,
                        owner: current.user_id,
                        user,
                    });
                }

                let (booking_after, rejected) =
                    if current.status == BookingStatus::PaymentSubmitted {
                        let rejected = reject_in(tx, &current, admin, FRAUD_REASON.into(), now)?;
                        (rejected, true)
                    } else {
                        (current, false)
                    };

                tx.append_violation(ViolationRecord {
                    user,
                    booking,
                    kind: ViolationKind::FraudulentPayment,
                    admin,
                    at: now,
                })?;

                let mut trust = tx.trust(user)?;
                trust.total_violations += 1;
                let tier = ViolationTier::for_count(trust.total_violations);
                trust.block = tier.block_from(now);
                if tier != ViolationTier::Warning {
                    trust.reason = Some(FRAUD_REASON.into());
                    trust.blocked_by = Some(admin);
                }
                tx.put_trust(&trust)?;

                Ok(BlockOutcome {
                    booking: booking_after,
                    rejected,
                    tier,
                    total_violations: trust.total_violations,
                    block: trust.block,
                })
            })
            .await;

        match &result {
            Ok(outcome) => {
                warn!(
                    user = %user,
                    admin = %admin,
                    booking = %booking,
                    tier = ?outcome.tier,
                    violations = outcome.total_violations,
                    "violation recorded"
                );
                if outcome.rejected {
                    self.publish_rejection(&outcome.booking);
                }
                self.outbox.publish(Notification::Blocked {
                    user,
                    tier: outcome.tier,
                    total_violations: outcome.total_violations,
                    block: outcome.block,
                });
            }
            Err(e) => info!(user = %user, booking = %booking, reason = %e, "block skipped"),
        }
        result
    }

    fn publish_rejection(&self, booking: &Booking) {
        self.outbox.publish(Notification::Rejected {
            user: booking.user_id,
            booking: booking.id,
            job: booking.job_id,
            reason: booking.review.as_ref().and_then(|r| r.reason.clone()),
        });
    }

    fn log_review(
        &self,
        op: &str,
        booking: BookingId,
        admin: AdminId,
        result: &Result<Booking, EngineError>,
    ) {
        match result {
            Ok(b) => info!(booking = %booking, admin = %admin, user = %b.user_id, "{op} applied"),
            Err(e) => info!(booking = %booking, admin = %admin, reason = %e, "{op} skipped"),
        }
    }
}

/// Only a submitted payment can be reviewed; re-reviews report the earlier verdict.
fn ensure_submitted(booking: &Booking) -> Result<(), EngineError> {
    match booking.status {
        BookingStatus::PaymentSubmitted => Ok(()),
        BookingStatus::Confirmed | BookingStatus::Rejected => {
            Err(EngineError::PaymentAlreadyProcessed {
                booking: booking.id,
                status: booking.status,
            })
        }
        status => Err(EngineError::PaymentNotSubmitted {
            booking: booking.id,
            status,
        }),
    }
}

fn reject_in(
    tx: &mut dyn LedgerTx,
    current: &Booking,
    admin: AdminId,
    reason: String,
    now: DateTime<Utc>,
) -> Result<Booking, EngineError> {
    let mut rejected = current.clone();
    rejected.status = BookingStatus::Rejected;
    rejected.review = Some(Review {
        admin,
        at: now,
        reason: Some(reason),
    });
    if !tx.update_booking_if(&rejected, BookingStatus::PaymentSubmitted)? {
        return Err(EngineError::PaymentAlreadyProcessed {
            booking: current.id,
            status: current.status,
        });
    }
    tx.release(current.job_id)?;
    Ok(rejected)
}
