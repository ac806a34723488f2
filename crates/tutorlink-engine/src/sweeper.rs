//! Background expiration of unanswered invitations.
//!
//! The sweeper periodically moves every `Pending` invitation whose deadline has passed
//! to `Expired`. Each move is a conditional update, so an invitation that a tutor
//! answers while the sweep is running is simply skipped and counted as raced.
//!
//! Expiry does not release payment authorizations; an unanswered hold lapses at the
//! gateway on its own.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tutorlink_core::InvitationId;
use tutorlink_store::{InvitationStatus, Store};

use crate::error::Result;
use crate::invitations::expire_invitation;

/// Shortest period the background task will tick at.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Pending invitations looked at.
    pub scanned: usize,
    /// Invitations moved to `Expired`.
    pub expired: Vec<InvitationId>,
    /// Overdue invitations that left `Pending` before the sweep reached them.
    pub raced: usize,
}

/// Expire every pending invitation whose deadline is before `now`.
///
/// Safe to run repeatedly: a second sweep at the same instant finds nothing to do.
///
/// # Errors
///
/// Returns an error if the store cannot be read or written.
pub fn sweep_expired<S: Store>(store: &S, now: DateTime<Utc>) -> Result<SweepReport> {
    let pending = store.list_invitations_by_status(InvitationStatus::Pending)?;
    let mut report = SweepReport {
        scanned: pending.len(),
        ..SweepReport::default()
    };

    for invitation in pending.iter().filter(|i| i.expires_at < now) {
        match expire_invitation(store, &invitation.invitation_id, now)? {
            Some(expired) => report.expired.push(expired.invitation_id),
            None => report.raced += 1,
        }
    }

    Ok(report)
}

/// Runs [`sweep_expired`] on a fixed interval until stopped.
pub struct ExpirationSweeper<S: Store + 'static> {
    store: Arc<S>,
    interval: Duration,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl<S: Store + 'static> ExpirationSweeper<S> {
    /// Create a stopped sweeper. Periods below [`MIN_SWEEP_INTERVAL`] are raised to it.
    #[must_use]
    pub fn new(store: Arc<S>, interval: Duration) -> Self {
        Self {
            store,
            interval: interval.max(MIN_SWEEP_INTERVAL),
            running: Mutex::new(None),
        }
    }

    /// Returns true while the background task is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    /// Spawn the background task. Does nothing if it is already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(Arc::clone(&self.store), self.interval, cancel.clone()));
        *running = Some((cancel, handle));
    }

    /// Stop the background task and wait for it to finish.
    pub async fn stop(&self) {
        let Some((cancel, handle)) = self.running.lock().take() else {
            return;
        };
        cancel.cancel();
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Expiration sweeper task failed");
        }
    }
}

async fn run<S: Store>(store: Arc<S>, period: Duration, cancel: CancellationToken) {
    tracing::info!(interval_secs = period.as_secs(), "Expiration sweeper started");

    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::info!("Expiration sweeper stopping");
                break;
            }
            _ = interval.tick() => {
                match sweep_expired(store.as_ref(), Utc::now()) {
                    Ok(report) if !report.expired.is_empty() => {
                        tracing::info!(
                            expired = report.expired.len(),
                            scanned = report.scanned,
                            raced = report.raced,
                            "Expired overdue invitations"
                        );
                    }
                    Ok(report) => {
                        tracing::debug!(scanned = report.scanned, "No invitations to expire");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Expiration sweep failed");
                    }
                }
            }
        }
    }
}
