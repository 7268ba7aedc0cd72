//! # User Provisioning Worker
//!
//! Drains `user_sync_queue` into the terminal's user table.
//!
//! ## One Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        sync_users_once()                                │
//! │                                                                         │
//! │  1. dequeue_claim(batch)      Pending/Error ──► Processing, attempt+1  │
//! │        │                                                                │
//! │        ├── nothing claimed ──► return, terminal untouched              │
//! │        ▼                                                                │
//! │  2. per item, in id order:                                             │
//! │        with_session (retried) ──► push this one user ──► close         │
//! │        │                                                                │
//! │        ├── refused by terminal ──► this item fails, next item          │
//! │        ├── terminal unreachable ──► this and every later item → Error, │
//! │        │                            error propagates                   │
//! │        ▼                                                                │
//! │  3. record the item in its own transaction (retried)                   │
//! │        ok   ──► Done, processed_at = now, last_error = NULL            │
//! │        fail ──► Error, last_error = message[..4000]                    │
//! │                                                                         │
//! │  A status write that keeps failing is logged; the item stays in        │
//! │  Processing and its siblings are unaffected.                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use tally_core::{UserProvision, UserSyncQueueItem};
use tally_db::Database;

use crate::error::{SyncError, SyncResult};
use crate::retry::BackoffController;
use crate::scheduler::SyncCycle;
use crate::session::TerminalBroker;

/// Summary of one provisioning cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProvisionReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub failed: usize,

    /// Items whose final status could not be written.
    pub unrecorded: usize,
}

/// Pushes queued user enrollments to the terminal.
#[derive(Debug, Clone)]
pub struct ProvisioningWorker {
    db: Database,
    broker: TerminalBroker,
    retry: BackoffController,
    batch_size: u32,
}

impl ProvisioningWorker {
    pub fn new(
        db: Database,
        broker: TerminalBroker,
        retry: BackoffController,
        batch_size: u32,
    ) -> Self {
        ProvisioningWorker {
            db,
            broker,
            retry,
            batch_size,
        }
    }

    /// Claims up to `batch_size` eligible items, retrying storage hiccups.
    pub async fn dequeue_claim(&self, batch_size: u32) -> SyncResult<Vec<UserSyncQueueItem>> {
        let queue = self.db.user_sync_queue();
        let queue = &queue;
        self.retry
            .run("dequeue_claim", || async move {
                queue.claim_batch(batch_size).await.map_err(SyncError::from)
            })
            .await
    }

    /// Runs one claim-push-record cycle.
    pub async fn sync_users_once(&self) -> SyncResult<ProvisionReport> {
        let claimed = self.dequeue_claim(self.batch_size).await?;
        if claimed.is_empty() {
            debug!("No users waiting for provisioning");
            return Ok(ProvisionReport::default());
        }
        debug!(count = claimed.len(), "Claimed users for provisioning");

        let mut report = ProvisionReport {
            claimed: claimed.len(),
            ..Default::default()
        };

        for (index, item) in claimed.iter().enumerate() {
            let request = item.provision();
            let pushed = self
                .retry
                .run("provision_user", || self.push_one(&request))
                .await;

            match pushed {
                Ok(()) => {
                    debug!(id = item.id, user_id = %request.user_id, "User provisioned");
                    report.succeeded += 1;
                    if !self.record(item.id, Ok(())).await {
                        report.unrecorded += 1;
                    }
                }
                Err(err) if err.is_transient() || matches!(err, SyncError::ShuttingDown) => {
                    let stranded = &claimed[index..];
                    error!(
                        remaining = stranded.len(),
                        error = %err,
                        "Terminal unavailable, failing remaining claimed items"
                    );
                    let message = err.to_string();
                    for item in stranded {
                        self.record(item.id, Err(message.as_str())).await;
                    }
                    return Err(err);
                }
                Err(err) => {
                    warn!(id = item.id, user_id = %request.user_id, error = %err, "User provisioning failed");
                    report.failed += 1;
                    let message = err.to_string();
                    if !self.record(item.id, Err(message.as_str())).await {
                        report.unrecorded += 1;
                    }
                }
            }
        }

        info!(
            device = %self.broker.address(),
            claimed = report.claimed,
            succeeded = report.succeeded,
            failed = report.failed,
            unrecorded = report.unrecorded,
            "User sync complete"
        );
        Ok(report)
    }

    /// Pushes one user in a session of its own.
    async fn push_one(&self, request: &UserProvision) -> SyncResult<()> {
        let request = request.clone();
        self.broker
            .with_session(move |session| {
                Box::pin(async move { session.provision_user(&request).await })
            })
            .await
    }

    /// Writes an item's final status. Returns false if the write gave up.
    async fn record(&self, id: i64, outcome: Result<(), &str>) -> bool {
        let queue = self.db.user_sync_queue();
        let queue = &queue;
        let written = match outcome {
            Ok(()) => {
                self.retry
                    .run("mark_done", || async move {
                        queue.mark_done(id).await.map_err(SyncError::from)
                    })
                    .await
            }
            Err(message) => {
                self.retry
                    .run("mark_failed", || async move {
                        queue.mark_failed(id, message).await.map_err(SyncError::from)
                    })
                    .await
            }
        };

        match written {
            Ok(()) => true,
            Err(SyncError::ShuttingDown) => {
                warn!(id, "Shutdown before status was written, item left in processing");
                false
            }
            Err(err) => {
                error!(id, error = %err, "Could not record provisioning outcome");
                false
            }
        }
    }
}

#[async_trait]
impl SyncCycle for ProvisioningWorker {
    type Report = ProvisionReport;

    fn name(&self) -> &'static str {
        "user-sync"
    }

    async fn run_cycle(&self) -> SyncResult<ProvisionReport> {
        self.sync_users_once().await
    }
}
