//! # User Sync Queue Repository
//!
//! Durable queue of user enrollments waiting to be pushed to the terminal.
//!
//! ## Claim Protocol
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Queue Item Lifecycle                                 │
//! │                                                                         │
//! │  enqueue()                                                             │
//! │     └── INSERT ... status = 'pending', attempt_count = 0               │
//! │                                                                         │
//! │  claim_batch(n)          ONE STATEMENT, ONE TRANSACTION                │
//! │     └── UPDATE user_sync_queue                                         │
//! │         SET status = 'processing', attempt_count = attempt_count + 1   │
//! │         WHERE id IN (SELECT id ... status IN ('pending','error')       │
//! │                      ORDER BY id LIMIT n)                              │
//! │         RETURNING ...                                                  │
//! │                                                                         │
//! │  mark_done(id)           own transaction                               │
//! │     └── status = 'done', processed_at = now, last_error = NULL         │
//! │                                                                         │
//! │  mark_failed(id, msg)    own transaction                               │
//! │     └── status = 'error', last_error = msg[..4000]                     │
//! │                                                                         │
//! │  EXCLUSIVITY:                                                          │
//! │  SQLite admits one writer at a time. A claim selects and flips rows    │
//! │  inside a single write statement, so a concurrent claim either runs    │
//! │  before it (and the rows are no longer eligible) or after it. Two      │
//! │  claims never return the same row.                                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use sqlx::SqlitePool;
use tracing::{debug, warn};

use tally_core::validation::validate_new_queue_item;
use tally_core::{truncate_error_text, NewQueueItem, QueueStatus, UserSyncQueueItem};

use crate::error::{DbError, DbResult};

/// Repository for the user provisioning queue.
#[derive(Debug, Clone)]
pub struct UserSyncQueueRepository {
    pool: SqlitePool,
}

impl UserSyncQueueRepository {
    /// Creates a new UserSyncQueueRepository.
    pub fn new(pool: SqlitePool) -> Self {
        UserSyncQueueRepository { pool }
    }

    /// Adds a provisioning request in Pending state.
    ///
    /// This is the requester's side of the queue; the sync engine only
    /// claims and completes items.
    pub async fn enqueue(&self, item: &NewQueueItem) -> DbResult<UserSyncQueueItem> {
        validate_new_queue_item(item)?;

        let stored = sqlx::query_as::<_, UserSyncQueueItem>(
            r#"
            INSERT INTO user_sync_queue (
                company_id, person_id, device_user_id, device_user_name
            ) VALUES (?1, ?2, ?3, ?4)
            RETURNING id, company_id, person_id, device_user_id, device_user_name,
                      status, attempt_count, last_error,
                      created_at, last_changed_at, processed_at
            "#,
        )
        .bind(item.company_id)
        .bind(item.person_id)
        .bind(item.device_user_id.trim())
        .bind(item.device_user_name.trim())
        .fetch_one(&self.pool)
        .await?;

        debug!(id = stored.id, device_user_id = %stored.device_user_id, "Queued user sync");
        Ok(stored)
    }

    /// Claims up to `limit` eligible items (Pending or Error), oldest id first.
    ///
    /// Claimed items come back in Processing with `attempt_count` already
    /// incremented, sorted by id.
    pub async fn claim_batch(&self, limit: u32) -> DbResult<Vec<UserSyncQueueItem>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;

        let mut claimed = sqlx::query_as::<_, UserSyncQueueItem>(
            r#"
            UPDATE user_sync_queue
            SET status = 'processing',
                attempt_count = attempt_count + 1,
                last_changed_at = CURRENT_TIMESTAMP
            WHERE id IN (
                SELECT id FROM user_sync_queue
                WHERE status IN ('pending', 'error')
                ORDER BY id
                LIMIT ?1
            )
            RETURNING id, company_id, person_id, device_user_id, device_user_name,
                      status, attempt_count, last_error,
                      created_at, last_changed_at, processed_at
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        // RETURNING order is unspecified
        claimed.sort_by_key(|item| item.id);

        if !claimed.is_empty() {
            debug!(
                count = claimed.len(),
                first_id = claimed[0].id,
                "Claimed user sync items"
            );
        }
        Ok(claimed)
    }

    /// Completes a Processing item successfully.
    pub async fn mark_done(&self, id: i64) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE user_sync_queue SET
                status = 'done',
                last_error = NULL,
                processed_at = CURRENT_TIMESTAMP,
                last_changed_at = CURRENT_TIMESTAMP
            WHERE id = ?1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            warn!(id, "Queue item was not in processing state");
            return Err(DbError::not_found("Processing queue item", id.to_string()));
        }

        tx.commit().await?;
        Ok(())
    }

    /// Fails a Processing item, storing the (truncated) error text.
    ///
    /// `attempt_count` is left alone: only a claim counts as an attempt.
    pub async fn mark_failed(&self, id: i64, error: &str) -> DbResult<()> {
        let message = truncate_error_text(error);
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE user_sync_queue SET
                status = 'error',
                last_error = ?2,
                last_changed_at = CURRENT_TIMESTAMP
            WHERE id = ?1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(&message)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            warn!(id, "Queue item was not in processing state");
            return Err(DbError::not_found("Processing queue item", id.to_string()));
        }

        tx.commit().await?;
        Ok(())
    }

    /// Gets a queue item by ID.
    pub async fn get_by_id(&self, id: i64) -> DbResult<UserSyncQueueItem> {
        sqlx::query_as::<_, UserSyncQueueItem>(
            r#"
            SELECT id, company_id, person_id, device_user_id, device_user_name,
                   status, attempt_count, last_error,
                   created_at, last_changed_at, processed_at
            FROM user_sync_queue
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::not_found("Queue item", id.to_string()))
    }

    /// Counts items in a given status.
    pub async fn count_by_status(&self, status: QueueStatus) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM user_sync_queue WHERE status = ?1")
            .bind(status)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use tally_core::MAX_ERROR_TEXT_LEN;

    fn request(user: &str) -> NewQueueItem {
        NewQueueItem {
            company_id: 1,
            person_id: user.parse().unwrap_or(0),
            device_user_id: user.to_string(),
            device_user_name: format!("User {user}"),
        }
    }

    async fn queue() -> UserSyncQueueRepository {
        Database::new(DbConfig::in_memory())
            .await
            .unwrap()
            .user_sync_queue()
    }

    #[tokio::test]
    async fn test_enqueue_starts_pending() {
        let queue = queue().await;
        let item = queue.enqueue(&request("101")).await.unwrap();

        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(item.attempt_count, 0);
        assert!(item.last_error.is_none());
        assert!(item.processed_at.is_none());
    }

    #[tokio::test]
    async fn test_enqueue_rejects_invalid_request() {
        let queue = queue().await;
        let result = queue.enqueue(&request("")).await;
        assert!(matches!(result, Err(DbError::Validation(_))));
    }

    #[tokio::test]
    async fn test_two_claims_are_disjoint_and_ordered() {
        let queue = queue().await;
        let mut ids = Vec::new();
        for n in 1..=5 {
            ids.push(queue.enqueue(&request(&n.to_string())).await.unwrap().id);
        }

        let first = queue.claim_batch(2).await.unwrap();
        let second = queue.claim_batch(2).await.unwrap();

        let first_ids: Vec<_> = first.iter().map(|i| i.id).collect();
        let second_ids: Vec<_> = second.iter().map(|i| i.id).collect();
        assert_eq!(first_ids, ids[0..2].to_vec());
        assert_eq!(second_ids, ids[2..4].to_vec());

        for item in first.iter().chain(second.iter()) {
            assert_eq!(item.status, QueueStatus::Processing);
            assert_eq!(item.attempt_count, 1);
        }

        assert_eq!(queue.count_by_status(QueueStatus::Pending).await.unwrap(), 1);
        assert_eq!(queue.count_by_status(QueueStatus::Processing).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_claim_zero_or_empty() {
        let queue = queue().await;
        assert!(queue.claim_batch(0).await.unwrap().is_empty());
        assert!(queue.claim_batch(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_done_clears_error_and_sets_processed_at() {
        let queue = queue().await;
        let id = queue.enqueue(&request("7")).await.unwrap().id;

        queue.claim_batch(1).await.unwrap();
        queue.mark_failed(id, "terminal refused").await.unwrap();

        let failed = queue.get_by_id(id).await.unwrap();
        assert_eq!(failed.status, QueueStatus::Error);
        assert_eq!(failed.last_error.as_deref(), Some("terminal refused"));
        assert_eq!(failed.attempt_count, 1);

        // Error items are claimable again
        let reclaimed = queue.claim_batch(1).await.unwrap();
        assert_eq!(reclaimed[0].id, id);
        assert_eq!(reclaimed[0].attempt_count, 2);

        queue.mark_done(id).await.unwrap();
        let done = queue.get_by_id(id).await.unwrap();
        assert_eq!(done.status, QueueStatus::Done);
        assert_eq!(done.attempt_count, 2);
        assert!(done.last_error.is_none());
        assert!(done.processed_at.is_some());

        // Done items are never claimed again
        assert!(queue.claim_batch(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_text_is_truncated() {
        let queue = queue().await;
        let id = queue.enqueue(&request("8")).await.unwrap().id;
        queue.claim_batch(1).await.unwrap();

        let huge = "x".repeat(MAX_ERROR_TEXT_LEN * 2);
        queue.mark_failed(id, &huge).await.unwrap();

        let stored = queue.get_by_id(id).await.unwrap();
        assert_eq!(stored.last_error.unwrap().len(), MAX_ERROR_TEXT_LEN);
    }

    #[tokio::test]
    async fn test_completion_requires_processing() {
        let queue = queue().await;
        let id = queue.enqueue(&request("9")).await.unwrap().id;

        assert!(matches!(queue.mark_done(id).await, Err(DbError::NotFound { .. })));
        assert!(matches!(
            queue.mark_failed(id, "nope").await,
            Err(DbError::NotFound { .. })
        ));
        assert!(matches!(queue.get_by_id(9999).await, Err(DbError::NotFound { .. })));
    }
}
