pub mod config;
pub mod csv;
pub mod engine;
pub mod model;
pub mod notify;
pub mod reaper;
pub mod replay;
pub mod store;

pub use config::EngineConfig;
pub use engine::{Engine, EngineError, Reservation};
pub use model::{Booking, BookingId, BookingStatus, Job, JobId, JobNumber, JobStatus, UserId};
pub use notify::{LogNotifier, Notification, NotifierWorker, Outbox};
pub use reaper::{ReapReport, Reaper};
pub use replay::{Command, Replay};
pub use store::{LedgerStore, MemoryLedger};
