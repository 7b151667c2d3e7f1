//! Command replay.
//!
//! Drives the engine and the reaper from a stream of recorded commands.
//! Jobs are addressed by their sequence number and time is given in
//! seconds from a fixed epoch, so a replay is deterministic.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio_stream::{Stream, StreamExt};
use tracing::{info, warn};

use crate::engine::{Engine, EngineError};
use crate::model::{AdminId, Booking, Job, JobNumber, Receipt, UserId};
use crate::reaper::Reaper;
use crate::store::LedgerStore;

/// 2024-01-01T00:00:00Z, the instant `at = 0` refers to.
pub const REPLAY_EPOCH_SECS: i64 = 1_704_067_200;

/// One recorded action. `at` is in seconds since the replay epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Create {
        at: i64,
        admin: AdminId,
        required: u32,
    },
    Publish {
        at: i64,
        job: JobNumber,
    },
    Reserve {
        at: i64,
        user: UserId,
        job: JobNumber,
    },
    Pay {
        at: i64,
        user: UserId,
        receipt: String,
    },
    Cancel {
        at: i64,
        user: UserId,
        job: JobNumber,
    },
    Approve {
        at: i64,
        admin: AdminId,
        user: UserId,
        job: JobNumber,
    },
    Reject {
        at: i64,
        admin: AdminId,
        user: UserId,
        job: JobNumber,
        reason: Option<String>,
    },
    Block {
        at: i64,
        admin: AdminId,
        user: UserId,
        job: JobNumber,
    },
    Reap {
        at: i64,
    },
    Complete {
        at: i64,
        job: JobNumber,
    },
    Close {
        at: i64,
        job: JobNumber,
    },
}

impl Command {
    pub fn at(&self) -> i64 {
        match self {
            Command::Create { at, .. }
            | Command::Publish { at, .. }
            | Command::Reserve { at, .. }
            | Command::Pay { at, .. }
            | Command::Cancel { at, .. }
            | Command::Approve { at, .. }
            | Command::Reject { at, .. }
            | Command::Block { at, .. }
            | Command::Reap { at }
            | Command::Complete { at, .. }
            | Command::Close { at, .. } => *at,
        }
    }

    pub fn op(&self) -> &'static str {
        match self {
            Command::Create { .. } => "create",
            Command::Publish { .. } => "publish",
            Command::Reserve { .. } => "reserve",
            Command::Pay { .. } => "pay",
            Command::Cancel { .. } => "cancel",
            Command::Approve { .. } => "approve",
            Command::Reject { .. } => "reject",
            Command::Block { .. } => "block",
            Command::Reap { .. } => "reap",
            Command::Complete { .. } => "complete",
            Command::Close { .. } => "close",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.op(), self.at())
    }
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("job #{0} does not exist")]
    UnknownJob(JobNumber),

    #[error("time {0}s is out of range")]
    InvalidTime(i64),

    #[error("user {user} has no booking on job #{job}")]
    NoBooking { user: UserId, job: JobNumber },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Counts of a finished replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub applied: usize,
    pub skipped: usize,
}

pub struct Replay<S> {
    engine: Engine<S>,
    reaper: Reaper<S>,
    epoch: DateTime<Utc>,
}

/// Public API
impl<S: LedgerStore> Replay<S> {
    pub fn new(engine: Engine<S>, reaper: Reaper<S>) -> Self {
        Self {
            engine,
            reaper,
            epoch: DateTime::from_timestamp(REPLAY_EPOCH_SECS, 0).unwrap_or_default(),
        }
    }

    pub fn engine(&self) -> &Engine<S> {
        &self.engine
    }

    /// Apply every command of the stream; a failing command is logged and skipped.
    pub async fn run(&self, mut stream: impl Stream<Item = Command> + Unpin) -> ReplayStats {
        let mut stats = ReplayStats::default();
        while let Some(cmd) = stream.next().await {
            // a rejected command never stops the replay
            match self.apply(&cmd).await {
                Ok(()) => stats.applied += 1,
                Err(_) => stats.skipped += 1,
            }
        }
        info!(applied = stats.applied, skipped = stats.skipped, "replay done");
        stats
    }

    /// Apply a single command on top of the current ledger.
    pub async fn apply(&self, cmd: &Command) -> Result<(), ReplayError> {
        let result = self.dispatch(cmd).await;
        Self::log_result(cmd, &result);
        result
    }

    /// Every job of the ledger, ordered by number.
    pub async fn jobs(&self) -> Result<Vec<Job>, ReplayError> {
        Ok(self.engine.jobs().await?)
    }
}

/// Private API
impl<S: LedgerStore> Replay<S> {
    fn log_result(cmd: &Command, result: &Result<(), ReplayError>) {
        match result {
            Ok(()) => info!(op = cmd.op(), at = cmd.at(), "command applied"),
            Err(ReplayError::Engine(e)) if e.is_retryable() => {
                warn!(op = cmd.op(), at = cmd.at(), reason = %e, "command failed")
            }
            Err(e) => warn!(op = cmd.op(), at = cmd.at(), reason = %e, "command skipped"),
        }
    }

    fn time(&self, at: i64) -> Result<DateTime<Utc>, ReplayError> {
        Duration::try_seconds(at)
            .and_then(|offset| self.epoch.checked_add_signed(offset))
            .ok_or(ReplayError::InvalidTime(at))
    }

    async fn dispatch(&self, cmd: &Command) -> Result<(), ReplayError> {
        let now = self.time(cmd.at())?;
        match cmd {
            Command::Create {
                admin, required, ..
            } => {
                self.engine.create_job(*admin, *required, now).await?;
            }
            Command::Publish { job, .. } => {
                let job = self.resolve_job(*job).await?;
                self.engine.publish_job(job.id).await?;
            }
            Command::Reserve { user, job, .. } => {
                let job = self.resolve_job(*job).await?;
                self.engine.confirm_booking(*user, job.id, now).await?;
            }
            Command::Pay { user, receipt, .. } => {
                self.engine
                    .submit_payment(*user, Receipt::new(receipt.as_str()), now)
                    .await?;
            }
            Command::Cancel { user, job, .. } => {
                let job = self.resolve_job(*job).await?;
                self.engine.cancel_booking(*user, job.id).await?;
            }
            Command::Approve {
                admin, user, job, ..
            } => {
                let booking = self.resolve_booking(*user, *job).await?;
                self.engine.approve_payment(booking.id, *admin, now).await?;
            }
            Command::Reject {
                admin,
                user,
                job,
                reason,
                ..
            } => {
                let booking = self.resolve_booking(*user, *job).await?;
                let reason = reason.as_deref().unwrap_or("payment rejected");
                self.engine
                    .reject_payment(booking.id, *admin, reason, now)
                    .await?;
            }
            Command::Block {
                admin, user, job, ..
            } => {
                let booking = self.resolve_booking(*user, *job).await?;
                self.engine
                    .block_user_and_reject_payment(booking.id, *user, *admin, now)
                    .await?;
            }
            Command::Reap { .. } => {
                self.reaper.run_cycle(now).await?;
            }
            Command::Complete { job, .. } => {
                let job = self.resolve_job(*job).await?;
                self.engine.complete_job(job.id).await?;
            }
            Command::Close { job, .. } => {
                let job = self.resolve_job(*job).await?;
                self.engine.cancel_job(job.id).await?;
            }
        }
        Ok(())
    }

    async fn resolve_job(&self, number: JobNumber) -> Result<Job, ReplayError> {
        self.engine
            .job_by_number(number)
            .await?
            .ok_or(ReplayError::UnknownJob(number))
    }

    async fn resolve_booking(&self, user: UserId, number: JobNumber) -> Result<Booking, ReplayError> {
        let job = self.resolve_job(number).await?;
        self.engine
            .latest_booking(user, job.id)
            .await?
            .ok_or(ReplayError::NoBooking { user, job: number })
    }
}
