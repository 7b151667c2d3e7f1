use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use slots_eng::engine::EngineError;
use slots_eng::model::{Receipt, ViolationTier};
use slots_eng::{
    BookingStatus, Engine, EngineConfig, Job, JobId, LedgerStore, MemoryLedger, Outbox, Reaper,
    Reservation,
};

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn engine() -> Arc<Engine<MemoryLedger>> {
    Arc::new(Engine::new(Arc::new(MemoryLedger::new()), Outbox::disabled()))
}

async fn open_job(engine: &Engine<MemoryLedger>, required: u32) -> JobId {
    let job = engine.create_job(1, required, at(0)).await.unwrap();
    engine.publish_job(job.id).await.unwrap();
    job.id
}

async fn job(engine: &Engine<MemoryLedger>, id: JobId) -> Job {
    let job = engine.job(id).await.unwrap().unwrap();
    assert!(job.reserved_slots + job.confirmed_slots <= job.required_workers);
    job
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reservations_never_overbook() {
    const REQUIRED: u32 = 3;
    const USERS: i64 = 20;

    let engine = engine();
    let id = open_job(&engine, REQUIRED).await;

    let handles: Vec<_> = (0..USERS)
        .map(|user| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.confirm_booking(user, id, at(1)).await })
        })
        .collect();

    let mut created = 0;
    let mut refused = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(Reservation::Created(_)) => created += 1,
            Ok(other) => panic!("unexpected {other:?}"),
            Err(EngineError::JobFull(_) | EngineError::SlotsTemporarilyReserved { .. }) => {
                refused += 1
            }
            Err(e) => panic!("unexpected error {e}"),
        }
    }

    assert_eq!(created, REQUIRED);
    assert_eq!(refused, USERS as u32 - REQUIRED);
    assert_eq!(job(&engine, id).await.reserved_slots, REQUIRED);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rapid_retries_create_one_booking() {
    let engine = engine();
    let id = open_job(&engine, 5).await;

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.confirm_booking(42, id, at(1)).await })
        })
        .collect();

    let mut new = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().is_new() {
            new += 1;
        }
    }

    assert_eq!(new, 1);
    assert_eq!(job(&engine, id).await.reserved_slots, 1);
    let rows = engine
        .store()
        .atomic(|tx| tx.user_bookings(42))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reaper_and_payment_race_resolves_once() {
    for _ in 0..50 {
        let store = Arc::new(MemoryLedger::new());
        let engine = Arc::new(Engine::new(Arc::clone(&store), Outbox::disabled()));
        let reaper = Reaper::new(
            Arc::clone(&store),
            Outbox::disabled(),
            &EngineConfig::default(),
        );
        let id = open_job(&engine, 1).await;
        let booking = engine.confirm_booking(7, id, at(0)).await.unwrap();
        let deadline = booking.booking().expires_at;

        // the user pays on the last instant of the hold, the reaper runs a second later
        let payer = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .submit_payment(7, Receipt::new("last-second"), deadline)
                    .await
            })
        };
        let reaped = tokio::spawn(async move {
            reaper
                .run_cycle(deadline + Duration::seconds(1))
                .await
                .unwrap()
        });
        let paid = payer.await.unwrap();
        let reaped = reaped.await.unwrap();

        let status = engine
            .booking(booking.booking().id)
            .await
            .unwrap()
            .unwrap()
            .status;
        let reserved = job(&engine, id).await.reserved_slots;
        match status {
            BookingStatus::PaymentSubmitted => {
                assert!(paid.is_ok());
                assert_eq!(reaped.expired, 0);
                assert_eq!(reserved, 1);
            }
            BookingStatus::Expired => {
                assert!(matches!(paid, Err(EngineError::BookingExpired(_))));
                assert_eq!(reaped.expired, 1);
                assert_eq!(reserved, 0);
            }
            other => panic!("unexpected status {other}"),
        }
    }
}

#[tokio::test]
async fn release_after_release_changes_nothing() {
    let engine = engine();
    let id = open_job(&engine, 2).await;
    engine.confirm_booking(1, id, at(0)).await.unwrap();
    engine.confirm_booking(2, id, at(0)).await.unwrap();
    engine.cancel_booking(1, id).await.unwrap();
    assert_eq!(job(&engine, id).await.reserved_slots, 1);

    // the cancelled hold is not a candidate, only the lapsed one is
    let reaper = Reaper::new(
        Arc::clone(engine.store()),
        Outbox::disabled(),
        &EngineConfig::default(),
    );
    let report = reaper.run_cycle(at(1000)).await.unwrap();
    assert_eq!(report.expired, 1);
    assert_eq!(job(&engine, id).await.reserved_slots, 0);

    engine
        .store()
        .atomic(|tx| {
            tx.release(id)?;
            tx.release(id)
        })
        .await
        .unwrap();
    assert_eq!(job(&engine, id).await.reserved_slots, 0);
}

#[tokio::test]
async fn escalation_follows_strike_count_across_jobs() {
    let engine = engine();
    let mut tiers = Vec::new();
    let mut now = 0;

    for _ in 0..3 {
        let id = open_job(&engine, 1).await;
        let reservation = engine.confirm_booking(5, id, at(now)).await.unwrap();
        engine
            .submit_payment(5, Receipt::new("forged"), at(now + 10))
            .await
            .unwrap();
        let outcome = engine
            .block_user_and_reject_payment(reservation.booking().id, 5, 1, at(now + 20))
            .await
            .unwrap();
        tiers.push(outcome.tier);
        assert_eq!(job(&engine, id).await.reserved_slots, 0);

        // wait out a temporary block before the next job
        now += 25 * 3600;
    }

    assert_eq!(
        tiers,
        vec![
            ViolationTier::Warning,
            ViolationTier::TemporaryBlock,
            ViolationTier::PermanentBlock,
        ]
    );
    assert_eq!(engine.trust(5).await.unwrap().total_violations, 3);
}

#[tokio::test]
async fn two_worker_job_scenario() {
    let engine = engine();
    let reaper = Reaper::new(
        Arc::clone(engine.store()),
        Outbox::disabled(),
        &EngineConfig::default(),
    );
    let (a, b, c) = (1, 2, 3);
    let id = open_job(&engine, 2).await;

    let booking_a = engine.confirm_booking(a, id, at(0)).await.unwrap();
    assert_eq!(job(&engine, id).await.reserved_slots, 1);

    engine.confirm_booking(b, id, at(5)).await.unwrap();
    let full = job(&engine, id).await;
    assert_eq!(full.reserved_slots, 2);
    assert!(full.is_full());

    let refused = engine.confirm_booking(c, id, at(10)).await;
    assert!(matches!(
        refused,
        Err(EngineError::JobFull(_) | EngineError::SlotsTemporarilyReserved { .. })
    ));

    let paid = engine
        .submit_payment(a, Receipt::new("a-receipt"), at(30))
        .await
        .unwrap();
    assert_eq!(paid.status, BookingStatus::PaymentSubmitted);

    engine
        .approve_payment(booking_a.booking().id, 99, at(60))
        .await
        .unwrap();
    let approved = job(&engine, id).await;
    assert_eq!(approved.confirmed_slots, 1);
    assert_eq!(approved.reserved_slots, 1);

    let report = reaper.run_cycle(at(5 + 181)).await.unwrap();
    assert_eq!(report.expired, 1);
    let reaped = job(&engine, id).await;
    assert_eq!(reaped.reserved_slots, 0);
    assert!(!reaped.is_full());

    let retry = engine.confirm_booking(c, id, at(200)).await.unwrap();
    assert!(retry.is_new());
    assert_eq!(job(&engine, id).await.reserved_slots, 1);
}
