//! In-memory ledger.
//!
//! A single Tokio mutex guards the whole ledger, so atomic units are
//! serializable. Writes of a unit are staged in an overlay on top of the
//! committed state and merged only when the unit returns `Ok`.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{LedgerStore, LedgerTx, SlotGrant, StoreError, Upsert};
use crate::model::{
    Booking, BookingId, BookingStatus, Job, JobId, JobNumber, UserId, UserTrust, ViolationRecord,
};

/// Serializable image of the whole ledger, used to survive restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub jobs: Vec<Job>,
    pub bookings: Vec<Booking>,
    pub violations: Vec<ViolationRecord>,
    pub trust: Vec<UserTrust>,
    pub last_job_number: JobNumber,
}

#[derive(Debug, Default)]
struct LedgerState {
    jobs: HashMap<JobId, Job>,
    bookings: HashMap<BookingId, Booking>,
    /// Booking ids per user, in insertion order.
    by_user: HashMap<UserId, Vec<BookingId>>,
    violations: Vec<ViolationRecord>,
    trust: HashMap<UserId, UserTrust>,
    last_job_number: JobNumber,
}

/// Writes staged by a committed unit.
struct Changes {
    jobs: HashMap<JobId, Job>,
    bookings: HashMap<BookingId, Booking>,
    new_bookings: Vec<BookingId>,
    violations: Vec<ViolationRecord>,
    trust: HashMap<UserId, UserTrust>,
    last_job_number: JobNumber,
}

impl LedgerState {
    fn apply(&mut self, changes: Changes) {
        for id in &changes.new_bookings {
            if let Some(booking) = changes.bookings.get(id) {
                self.by_user.entry(booking.user_id).or_default().push(*id);
            }
        }
        self.jobs.extend(changes.jobs);
        self.bookings.extend(changes.bookings);
        self.violations.extend(changes.violations);
        self.trust.extend(changes.trust);
        self.last_job_number = changes.last_job_number;
    }
}

struct MemoryTx<'a> {
    base: &'a LedgerState,
    jobs: HashMap<JobId, Job>,
    bookings: HashMap<BookingId, Booking>,
    new_bookings: Vec<BookingId>,
    violations: Vec<ViolationRecord>,
    trust: HashMap<UserId, UserTrust>,
    last_job_number: JobNumber,
}

impl<'a> MemoryTx<'a> {
    fn new(base: &'a LedgerState) -> Self {
        Self {
            base,
            jobs: HashMap::new(),
            bookings: HashMap::new(),
            new_bookings: Vec::new(),
            violations: Vec::new(),
            trust: HashMap::new(),
            last_job_number: base.last_job_number,
        }
    }

    fn into_changes(self) -> Changes {
        Changes {
            jobs: self.jobs,
            bookings: self.bookings,
            new_bookings: self.new_bookings,
            violations: self.violations,
            trust: self.trust,
            last_job_number: self.last_job_number,
        }
    }

    /// Copy the job into the overlay (first touch) and hand out the staged row.
    fn job_mut(&mut self, id: JobId) -> Result<&mut Job, StoreError> {
        match self.jobs.entry(id) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let job = self
                    .base
                    .jobs
                    .get(&id)
                    .cloned()
                    .ok_or(StoreError::JobNotFound(id))?;
                Ok(entry.insert(job))
            }
        }
    }

    fn read_booking(&self, id: &BookingId) -> Option<&Booking> {
        self.bookings.get(id).or_else(|| self.base.bookings.get(id))
    }

    fn user_booking_refs(&self, user: UserId) -> impl Iterator<Item = &Booking> + '_ {
        let committed = self
            .base
            .by_user
            .get(&user)
            .into_iter()
            .flatten()
            .filter_map(move |id| self.read_booking(id));
        let staged = self
            .new_bookings
            .iter()
            .filter_map(move |id| self.bookings.get(id))
            .filter(move |booking| booking.user_id == user);
        committed.chain(staged)
    }
}

impl LedgerTx for MemoryTx<'_> {
    fn job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.get(&id).or_else(|| self.base.jobs.get(&id)).cloned())
    }

    fn job_by_number(&self, number: JobNumber) -> Result<Option<Job>, StoreError> {
        let staged = self.jobs.values().find(|job| job.number == number);
        let found = staged.or_else(|| self.base.jobs.values().find(|job| job.number == number));
        Ok(found.cloned())
    }

    fn jobs(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self
            .base
            .jobs
            .values()
            .filter(|job| !self.jobs.contains_key(&job.id))
            .chain(self.jobs.values())
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.number);
        Ok(jobs)
    }

    fn next_job_number(&mut self) -> Result<JobNumber, StoreError> {
        self.last_job_number += 1;
        Ok(self.last_job_number)
    }

    fn insert_job(&mut self, job: Job) -> Result<(), StoreError> {
        if self.job(job.id)?.is_some() {
            return Err(StoreError::Conflict(format!("job {} already exists", job.id)));
        }
        self.jobs.insert(job.id, job);
        Ok(())
    }

    fn set_job_status(&mut self, job: &Job) -> Result<(), StoreError> {
        self.job_mut(job.id)?.status = job.status;
        Ok(())
    }

    fn booking(&self, id: BookingId) -> Result<Option<Booking>, StoreError> {
        Ok(self.read_booking(&id).cloned())
    }

    fn open_booking(&self, user: UserId, job: JobId) -> Result<Option<Booking>, StoreError> {
        Ok(self
            .user_booking_refs(user)
            .filter(|booking| booking.job_id == job && !booking.status.is_terminal())
            .last()
            .cloned())
    }

    fn latest_booking(&self, user: UserId, job: JobId) -> Result<Option<Booking>, StoreError> {
        Ok(self
            .user_booking_refs(user)
            .filter(|booking| booking.job_id == job)
            .last()
            .cloned())
    }

    fn user_bookings(&self, user: UserId) -> Result<Vec<Booking>, StoreError> {
        Ok(self.user_booking_refs(user).cloned().collect())
    }

    fn update_booking_if(
        &mut self,
        booking: &Booking,
        expected: BookingStatus,
    ) -> Result<bool, StoreError> {
        let current = self
            .read_booking(&booking.id)
            .ok_or(StoreError::BookingNotFound(booking.id))?;
        if current.status != expected {
            return Ok(false);
        }
        self.bookings.insert(booking.id, booking.clone());
        Ok(true)
    }

    fn reserve(&mut self, job: JobId) -> Result<SlotGrant, StoreError> {
        let job = self.job_mut(job)?;
        if job.occupied() >= job.required_workers {
            return Ok(SlotGrant::Full);
        }
        job.reserved_slots += 1;
        job.sync_label();
        Ok(SlotGrant::Granted)
    }

    fn release(&mut self, job: JobId) -> Result<(), StoreError> {
        let job = self.job_mut(job)?;
        job.reserved_slots = job.reserved_slots.saturating_sub(1);
        job.sync_label();
        Ok(())
    }

    fn promote(&mut self, job: JobId) -> Result<(), StoreError> {
        let job = self.job_mut(job)?;
        if job.reserved_slots == 0 && job.is_full() {
            return Err(StoreError::Conflict(format!(
                "promoting on job {} would exceed {} slots",
                job.id, job.required_workers
            )));
        }
        job.reserved_slots = job.reserved_slots.saturating_sub(1);
        job.confirmed_slots += 1;
        job.sync_label();
        Ok(())
    }

    fn create_booking(&mut self, booking: Booking) -> Result<Upsert, StoreError> {
        let existing = self
            .user_booking_refs(booking.user_id)
            .find(|b| b.idempotency_key == booking.idempotency_key && !b.status.is_terminal())
            .cloned();
        if let Some(existing) = existing {
            return Ok(Upsert::Existing(existing));
        }
        if self.read_booking(&booking.id).is_some() {
            return Err(StoreError::Conflict(format!(
                "booking {} already exists",
                booking.id
            )));
        }
        self.new_bookings.push(booking.id);
        self.bookings.insert(booking.id, booking.clone());
        Ok(Upsert::Inserted(booking))
    }

    fn trust(&self, user: UserId) -> Result<UserTrust, StoreError> {
        Ok(self
            .trust
            .get(&user)
            .or_else(|| self.base.trust.get(&user))
            .cloned()
            .unwrap_or_else(|| UserTrust::new(user)))
    }

    fn put_trust(&mut self, trust: &UserTrust) -> Result<(), StoreError> {
        self.trust.insert(trust.user, trust.clone());
        Ok(())
    }

    fn append_violation(&mut self, violation: ViolationRecord) -> Result<(), StoreError> {
        self.violations.push(violation);
        Ok(())
    }

    fn violations(&self, user: UserId) -> Result<Vec<ViolationRecord>, StoreError> {
        Ok(self
            .base
            .violations
            .iter()
            .chain(self.violations.iter())
            .filter(|v| v.user == user)
            .cloned()
            .collect())
    }
}

/// Ledger kept in process memory, persisted through [`LedgerSnapshot`]s.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a ledger from a snapshot taken by [`MemoryLedger::snapshot`].
    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Self {
        let mut state = LedgerState {
            last_job_number: snapshot.last_job_number,
            violations: snapshot.violations,
            ..LedgerState::default()
        };
        for job in snapshot.jobs {
            state.jobs.insert(job.id, job);
        }
        for booking in snapshot.bookings {
            state
                .by_user
                .entry(booking.user_id)
                .or_default()
                .push(booking.id);
            state.bookings.insert(booking.id, booking);
        }
        for trust in snapshot.trust {
            state.trust.insert(trust.user, trust);
        }
        Self {
            state: Mutex::new(state),
        }
    }

    pub async fn snapshot(&self) -> LedgerSnapshot {
        let state = self.state.lock().await;

        let mut jobs: Vec<Job> = state.jobs.values().cloned().collect();
        jobs.sort_by_key(|job| job.number);

        let mut users: Vec<&UserId> = state.by_user.keys().collect();
        users.sort();
        let bookings = users
            .into_iter()
            .flat_map(|user| &state.by_user[user])
            .filter_map(|id| state.bookings.get(id))
            .cloned()
            .collect();

        let mut trust: Vec<UserTrust> = state.trust.values().cloned().collect();
        trust.sort_by_key(|t| t.user);

        LedgerSnapshot {
            jobs,
            bookings,
            violations: state.violations.clone(),
            trust,
            last_job_number: state.last_job_number,
        }
    }

    /// Write the snapshot as JSON to `path`.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let snapshot = self.snapshot().await;
        let json = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| StoreError::Backend(format!("failed to encode snapshot: {e}")))?;
        tokio::fs::write(path.as_ref(), json)
            .await
            .map_err(|e| StoreError::Backend(format!("failed to write snapshot: {e}")))?;
        info!(
            path = %path.as_ref().display(),
            jobs = snapshot.jobs.len(),
            bookings = snapshot.bookings.len(),
            "ledger snapshot saved"
        );
        Ok(())
    }

    /// Load a ledger saved with [`MemoryLedger::save`].
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let bytes = tokio::fs::read(path.as_ref())
            .await
            .map_err(|e| StoreError::Backend(format!("failed to read snapshot: {e}")))?;
        let snapshot: LedgerSnapshot = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Backend(format!("failed to decode snapshot: {e}")))?;
        info!(
            path = %path.as_ref().display(),
            jobs = snapshot.jobs.len(),
            bookings = snapshot.bookings.len(),
            "ledger snapshot loaded"
        );
        Ok(Self::from_snapshot(snapshot))
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn atomic<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn LedgerTx) -> Result<T, E> + Send,
        T: Send,
        E: From<StoreError> + Send,
    {
        let mut state = self.state.lock().await;
        let mut tx = MemoryTx::new(&state);
        // an error drops the overlay: nothing of the unit becomes visible
        let value = f(&mut tx)?;
        let changes = tx.into_changes();
        state.apply(changes);
        Ok(value)
    }

    async fn expired_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Booking>, StoreError> {
        let state = self.state.lock().await;
        let mut expired: Vec<Booking> = state
            .bookings
            .values()
            .filter(|booking| booking.is_expired(now))
            .cloned()
            .collect();
        expired.sort_by_key(|booking| booking.expires_at);
        expired.truncate(limit);
        debug!(count = expired.len(), "expired reservations scanned");
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobStatus, reservation_ttl};
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    async fn ledger_with_job(required: u32) -> (MemoryLedger, JobId) {
        let ledger = MemoryLedger::new();
        let id = ledger
            .atomic(|tx| {
                let number = tx.next_job_number()?;
                let mut job = Job::draft(number, required, 1, at(0));
                job.status = JobStatus::Active;
                let id = job.id;
                tx.insert_job(job)?;
                Ok::<_, StoreError>(id)
            })
            .await
            .unwrap();
        (ledger, id)
    }

    async fn job(ledger: &MemoryLedger, id: JobId) -> Job {
        ledger
            .atomic(|tx| tx.job(id))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn reserve_stops_at_capacity() {
        let (ledger, id) = ledger_with_job(2).await;

        for expected in [SlotGrant::Granted, SlotGrant::Granted, SlotGrant::Full] {
            let grant = ledger.atomic(|tx| tx.reserve(id)).await.unwrap();
            assert_eq!(grant, expected);
        }

        let job = job(&ledger, id).await;
        assert_eq!(job.reserved_slots, 2);
        assert_eq!(job.status, JobStatus::Full);
    }

    #[tokio::test]
    async fn release_is_floored_at_zero() {
        let (ledger, id) = ledger_with_job(2).await;
        ledger.atomic(|tx| tx.reserve(id)).await.unwrap();

        ledger.atomic(|tx| tx.release(id)).await.unwrap();
        assert_eq!(job(&ledger, id).await.reserved_slots, 0);

        // second release of the same slot is a no-op, not an error
        ledger.atomic(|tx| tx.release(id)).await.unwrap();
        assert_eq!(job(&ledger, id).await.reserved_slots, 0);
    }

    #[tokio::test]
    async fn release_reopens_full_job() {
        let (ledger, id) = ledger_with_job(1).await;
        ledger.atomic(|tx| tx.reserve(id)).await.unwrap();
        assert_eq!(job(&ledger, id).await.status, JobStatus::Full);

        ledger.atomic(|tx| tx.release(id)).await.unwrap();
        assert_eq!(job(&ledger, id).await.status, JobStatus::Active);
    }

    #[tokio::test]
    async fn promote_moves_reserved_to_confirmed() {
        let (ledger, id) = ledger_with_job(2).await;
        ledger.atomic(|tx| tx.reserve(id)).await.unwrap();
        ledger.atomic(|tx| tx.promote(id)).await.unwrap();

        let job = job(&ledger, id).await;
        assert_eq!(job.reserved_slots, 0);
        assert_eq!(job.confirmed_slots, 1);
    }

    #[tokio::test]
    async fn promote_refuses_to_overbook() {
        let (ledger, id) = ledger_with_job(1).await;
        ledger.atomic(|tx| tx.reserve(id)).await.unwrap();
        ledger.atomic(|tx| tx.promote(id)).await.unwrap();

        let result = ledger.atomic(|tx| tx.promote(id)).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
        assert_eq!(job(&ledger, id).await.confirmed_slots, 1);
    }

    #[tokio::test]
    async fn primitives_on_missing_job_fail() {
        let ledger = MemoryLedger::new();
        let missing = uuid::Uuid::new_v4();
        let result = ledger.atomic(|tx| tx.reserve(missing)).await;
        assert!(matches!(result, Err(StoreError::JobNotFound(id)) if id == missing));
    }

    #[tokio::test]
    async fn create_booking_returns_existing_open_booking() {
        let (ledger, id) = ledger_with_job(2).await;
        let first = Booking::reserve(10, id, at(0));
        let second = Booking::reserve(10, id, at(5));

        let inserted = ledger
            .atomic(|tx| tx.create_booking(first.clone()))
            .await
            .unwrap();
        assert_eq!(inserted, Upsert::Inserted(first.clone()));

        let retried = ledger
            .atomic(|tx| tx.create_booking(second))
            .await
            .unwrap();
        assert_eq!(retried, Upsert::Existing(first));
    }

    #[tokio::test]
    async fn terminal_booking_does_not_block_new_one() {
        let (ledger, id) = ledger_with_job(2).await;
        let mut first = Booking::reserve(10, id, at(0));
        ledger
            .atomic(|tx| tx.create_booking(first.clone()))
            .await
            .unwrap();

        first.status = BookingStatus::Expired;
        let applied = ledger
            .atomic(|tx| tx.update_booking_if(&first, BookingStatus::SlotReserved))
            .await
            .unwrap();
        assert!(applied);

        let second = Booking::reserve(10, id, at(400));
        let result = ledger
            .atomic(|tx| tx.create_booking(second.clone()))
            .await
            .unwrap();
        assert_eq!(result, Upsert::Inserted(second.clone()));

        let latest = ledger
            .atomic(|tx| tx.latest_booking(10, id))
            .await
            .unwrap();
        assert_eq!(latest, Some(second));
    }

    #[tokio::test]
    async fn conditional_update_loses_after_status_change() {
        let (ledger, id) = ledger_with_job(1).await;
        let mut booking = Booking::reserve(10, id, at(0));
        ledger
            .atomic(|tx| tx.create_booking(booking.clone()))
            .await
            .unwrap();

        booking.status = BookingStatus::PaymentSubmitted;
        let first = ledger
            .atomic(|tx| tx.update_booking_if(&booking, BookingStatus::SlotReserved))
            .await
            .unwrap();
        booking.status = BookingStatus::Expired;
        let second = ledger
            .atomic(|tx| tx.update_booking_if(&booking, BookingStatus::SlotReserved))
            .await
            .unwrap();

        assert!(first);
        assert!(!second);
        let stored = ledger.atomic(|tx| tx.booking(booking.id)).await.unwrap();
        assert_eq!(stored.unwrap().status, BookingStatus::PaymentSubmitted);
    }

    #[tokio::test]
    async fn failed_unit_leaves_no_partial_state() {
        let (ledger, id) = ledger_with_job(2).await;
        let booking = Booking::reserve(10, id, at(0));

        let result: Result<(), StoreError> = ledger
            .atomic(|tx| {
                tx.create_booking(booking.clone())?;
                tx.reserve(id)?;
                Err(StoreError::Backend("connection reset".into()))
            })
            .await;
        assert!(result.is_err());

        assert_eq!(job(&ledger, id).await.reserved_slots, 0);
        let stored = ledger.atomic(|tx| tx.booking(booking.id)).await.unwrap();
        assert!(stored.is_none());
    }

    #[tokio::test]
    async fn staged_writes_are_visible_inside_the_unit() {
        let (ledger, id) = ledger_with_job(2).await;
        let booking = Booking::reserve(10, id, at(0));

        let (open, reserved) = ledger
            .atomic(|tx| {
                tx.create_booking(booking.clone())?;
                tx.reserve(id)?;
                let open = tx.open_booking(10, id)?;
                let reserved = tx.job(id)?.map(|job| job.reserved_slots);
                Ok::<_, StoreError>((open, reserved))
            })
            .await
            .unwrap();

        assert_eq!(open, Some(booking));
        assert_eq!(reserved, Some(1));
    }

    #[tokio::test]
    async fn expired_reservations_are_bounded_and_ordered() {
        let (ledger, id) = ledger_with_job(5).await;
        for (user, secs) in [(1, 20), (2, 0), (3, 10)] {
            let booking = Booking::reserve(user, id, at(secs));
            ledger
                .atomic(|tx| tx.create_booking(booking))
                .await
                .unwrap();
        }

        let now = at(20) + reservation_ttl() + chrono::Duration::seconds(1);
        let expired = ledger.expired_reservations(now, 2).await.unwrap();
        let users: Vec<_> = expired.iter().map(|b| b.user_id).collect();
        assert_eq!(users, vec![2, 3]);

        let none = ledger.expired_reservations(at(60), 10).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn snapshot_survives_save_and_load() {
        let (ledger, id) = ledger_with_job(3).await;
        let booking = Booking::reserve(10, id, at(0));
        ledger
            .atomic(|tx| {
                tx.create_booking(booking.clone())?;
                tx.reserve(id)?;
                Ok::<_, StoreError>(())
            })
            .await
            .unwrap();

        let file = tempfile::NamedTempFile::new().unwrap();
        ledger.save(file.path()).await.unwrap();
        let restored = MemoryLedger::load(file.path()).await.unwrap();

        assert_eq!(restored.snapshot().await, ledger.snapshot().await);
        let open = restored
            .atomic(|tx| tx.open_booking(10, id))
            .await
            .unwrap();
        assert_eq!(open, Some(booking));

        let number = restored.atomic(|tx| tx.next_job_number()).await.unwrap();
        assert_eq!(number, 2);
    }

    #[tokio::test]
    async fn jobs_are_listed_by_number_with_staged_rows() {
        let (ledger, first) = ledger_with_job(1).await;

        let numbers = ledger
            .atomic(|tx| {
                let number = tx.next_job_number()?;
                tx.insert_job(Job::draft(number, 4, 1, at(0)))?;
                tx.reserve(first)?;
                tx.jobs()
            })
            .await
            .unwrap()
            .into_iter()
            .map(|job| (job.number, job.reserved_slots))
            .collect::<Vec<_>>();

        assert_eq!(numbers, vec![(1, 1), (2, 0)]);
    }
}
