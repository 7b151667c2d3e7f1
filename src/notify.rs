//! Outbound user notifications.
//!
//! State transitions publish into an [`Outbox`] after their atomic unit
//! committed; a [`NotifierWorker`] drains it on its own task. Delivery is
//! best effort: failures are logged and dropped, never retried, and never
//! touch booking state.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::model::{BlockState, BookingId, JobId, UserId, ViolationTier};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Confirmed {
        user: UserId,
        booking: BookingId,
        job: JobId,
    },
    Rejected {
        user: UserId,
        booking: BookingId,
        job: JobId,
        reason: Option<String>,
    },
    Blocked {
        user: UserId,
        tier: ViolationTier,
        total_violations: u32,
        block: BlockState,
    },
    Expired {
        user: UserId,
        booking: BookingId,
        job: JobId,
    },
}

impl Notification {
    pub fn user(&self) -> UserId {
        match self {
            Notification::Confirmed { user, .. }
            | Notification::Rejected { user, .. }
            | Notification::Blocked { user, .. }
            | Notification::Expired { user, .. } => *user,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Confirmed { .. } => "confirmed",
            Notification::Rejected { .. } => "rejected",
            Notification::Blocked { .. } => "blocked",
            Notification::Expired { .. } => "expired",
        }
    }
}

/// Sending half of the notification queue.
#[derive(Debug, Clone, Default)]
pub struct Outbox {
    sender: Option<mpsc::Sender<Notification>>,
}

impl Outbox {
    /// A bounded queue and its receiving half.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    /// An outbox that discards everything.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Queue a notification without waiting. A full or closed queue drops it.
    pub fn publish(&self, notification: Notification) {
        let Some(sender) = &self.sender else {
            return;
        };
        match sender.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(n)) => {
                warn!(user = n.user(), kind = n.kind(), "notification queue full, dropped");
            }
            Err(TrySendError::Closed(n)) => {
                warn!(user = n.user(), kind = n.kind(), "notification queue closed, dropped");
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("delivery to user {user} failed: {reason}")]
    Delivery { user: UserId, reason: String },
}

/// Transport that actually reaches the user (chat, mail, ...).
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Notifier that only writes a log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            user = notification.user(),
            kind = notification.kind(),
            "notification delivered"
        );
        Ok(())
    }
}

/// Drains the outbox into a [`Notifier`].
#[derive(Debug)]
pub struct NotifierWorker<N> {
    notifier: N,
}

impl<N: Notifier> NotifierWorker<N> {
    pub fn new(notifier: N) -> Self {
        Self { notifier }
    }

    /// Deliver every queued notification until the stream ends.
    ///
    /// Returns how many were delivered successfully.
    pub async fn run(&self, mut stream: impl Stream<Item = Notification> + Unpin) -> usize {
        let mut delivered = 0;
        while let Some(notification) = stream.next().await {
            match self.notifier.deliver(&notification).await {
                Ok(()) => {
                    delivered += 1;
                    debug!(user = notification.user(), kind = notification.kind(), "sent");
                }
                Err(e) => {
                    warn!(
                        user = notification.user(),
                        kind = notification.kind(),
                        reason = %e,
                        "notification dropped"
                    );
                }
            }
        }
        delivered
    }
}
