//! # Attendance Mark Repository
//!
//! Storage for punches pulled off a terminal.
//!
//! ## Ingest Transaction
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                   One Poll Cycle = One Transaction                      │
//! │                                                                         │
//! │  begin_ingest()                                                        │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  1. cursor(serial)                                             │   │
//! │  │     SELECT MAX(event_timestamp) FROM attendance_marks          │   │
//! │  │     WHERE device_serial = ?                                    │   │
//! │  │                                                                 │   │
//! │  │  2. insert(mark)   for every event newer than the cursor       │   │
//! │  │     UNIQUE (device_serial, user_id, event_timestamp)           │   │
//! │  │       ├── ok        → Inserted(id)                             │   │
//! │  │       └── violation → Duplicate (statement rolled back only)   │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  commit() ← readers see all of the cycle or none of it                 │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Dropping a [`MarkIngest`] without calling `commit` rolls the cycle back.

use sqlx::{QueryBuilder, Sqlite, SqlitePool, Transaction};
use tracing::{debug, trace};

use tally_core::validation::validate_mark_query;
use tally_core::{format_timestamp, parse_timestamp, AttendanceMark, MarkQuery, NewAttendanceMark, SyncCursor};

use crate::error::{DbError, DbResult};

/// Column list shared by every SELECT that builds an [`AttendanceMark`].
const MARK_COLUMNS: &str = "id, device_serial, device_address, user_id, user_name, \
     event_timestamp, punch_type, verification_status, work_code, inserted_at";

/// Outcome of inserting one mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Row written with the given id.
    Inserted(i64),
    /// The dedup key already exists; nothing written.
    Duplicate,
}

/// Repository for attendance marks.
#[derive(Debug, Clone)]
pub struct MarkRepository {
    pool: SqlitePool,
}

impl MarkRepository {
    /// Creates a new MarkRepository.
    pub fn new(pool: SqlitePool) -> Self {
        MarkRepository { pool }
    }

    /// Opens the transaction a poll cycle writes through.
    pub async fn begin_ingest(&self) -> DbResult<MarkIngest> {
        let tx = self.pool.begin().await?;
        Ok(MarkIngest { tx })
    }

    /// Reads the cursor outside any ingest (diagnostics, read API).
    pub async fn cursor(&self, device_serial: &str) -> DbResult<SyncCursor> {
        let newest: Option<String> = sqlx::query_scalar(
            "SELECT MAX(event_timestamp) FROM attendance_marks WHERE device_serial = ?1",
        )
        .bind(device_serial)
        .fetch_one(&self.pool)
        .await?;

        Ok(SyncCursor::from_position(newest.as_deref().and_then(parse_timestamp)))
    }

    /// Gets a mark by ID.
    pub async fn get_by_id(&self, id: i64) -> DbResult<AttendanceMark> {
        let sql = format!("SELECT {MARK_COLUMNS} FROM attendance_marks WHERE id = ?1");

        sqlx::query_as::<_, AttendanceMark>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::not_found("Attendance mark", id.to_string()))
    }

    /// Lists marks matching the query, newest punch first.
    ///
    /// ## Filters
    /// - `user_id`, `device_serial`: exact match
    /// - `from` / `to`: inclusive bounds on `event_timestamp`
    /// - `limit` (1..=2000) and `offset` for paging
    pub async fn query(&self, query: &MarkQuery) -> DbResult<Vec<AttendanceMark>> {
        validate_mark_query(query)?;

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {MARK_COLUMNS} FROM attendance_marks WHERE 1 = 1"
        ));

        if let Some(user_id) = &query.user_id {
            builder.push(" AND user_id = ").push_bind(user_id.clone());
        }
        if let Some(serial) = &query.device_serial {
            builder.push(" AND device_serial = ").push_bind(serial.clone());
        }
        if let Some(from) = query.from {
            builder
                .push(" AND event_timestamp >= ")
                .push_bind(format_timestamp(from));
        }
        if let Some(to) = query.to {
            builder
                .push(" AND event_timestamp <= ")
                .push_bind(format_timestamp(to));
        }

        builder
            .push(" ORDER BY event_timestamp DESC, id DESC LIMIT ")
            .push_bind(i64::from(query.limit))
            .push(" OFFSET ")
            .push_bind(i64::from(query.offset));

        let marks = builder
            .build_query_as::<AttendanceMark>()
            .fetch_all(&self.pool)
            .await?;

        debug!(count = marks.len(), "Listed attendance marks");
        Ok(marks)
    }

    /// Counts marks stored for a device serial.
    pub async fn count_for_device(&self, device_serial: &str) -> DbResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM attendance_marks WHERE device_serial = ?1")
                .bind(device_serial)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }
}

// =============================================================================
// Ingest Transaction
// =============================================================================

/// The open transaction of one poll cycle.
pub struct MarkIngest {
    tx: Transaction<'static, Sqlite>,
}

impl MarkIngest {
    /// Reads `MAX(event_timestamp)` for the serial inside the transaction.
    pub async fn cursor(&mut self, device_serial: &str) -> DbResult<SyncCursor> {
        let newest: Option<String> = sqlx::query_scalar(
            "SELECT MAX(event_timestamp) FROM attendance_marks WHERE device_serial = ?1",
        )
        .bind(device_serial)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(SyncCursor::from_position(newest.as_deref().and_then(parse_timestamp)))
    }

    /// Inserts one mark; a unique-key collision is reported, not raised.
    pub async fn insert(&mut self, mark: &NewAttendanceMark) -> DbResult<InsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO attendance_marks (
                device_serial, device_address, user_id, user_name,
                event_timestamp, punch_type, verification_status, work_code
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&mark.device_serial)
        .bind(&mark.device_address)
        .bind(&mark.user_id)
        .bind(&mark.user_name)
        .bind(format_timestamp(mark.event_timestamp))
        .bind(mark.punch_type)
        .bind(mark.verification_status)
        .bind(mark.work_code)
        .execute(&mut *self.tx)
        .await;

        match result.map_err(DbError::from) {
            Ok(done) => Ok(InsertOutcome::Inserted(done.last_insert_rowid())),
            Err(err) if err.is_unique_violation() => {
                trace!(
                    user_id = %mark.user_id,
                    event_timestamp = %mark.event_timestamp,
                    "Mark already stored"
                );
                Ok(InsertOutcome::Duplicate)
            }
            Err(err) => Err(err),
        }
    }

    /// Commits the cycle.
    pub async fn commit(self) -> DbResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    /// Abandons the cycle explicitly.
    pub async fn rollback(self) -> DbResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
