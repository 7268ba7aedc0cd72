//! # Attendance Puller
//!
//! Copies punches from the terminal's event log into `attendance_marks`.
//!
//! ## One Poll Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                   poll_once()  (under the Backoff Controller)           │
//! │                                                                         │
//! │  with_session                                                          │
//! │    ├── user directory (best effort, only if name resolution is on)     │
//! │    ├── full event log                                                  │
//! │    └── BEGIN                                                           │
//! │          cursor = MAX(event_timestamp) for this serial                 │
//! │          for each event:                                               │
//! │            ts <= cursor     → below_cursor                             │
//! │            INSERT ok        → inserted                                 │
//! │            UNIQUE conflict  → duplicates_skipped                       │
//! │        COMMIT                                                          │
//! │                                                                         │
//! │  Any failure before COMMIT rolls the whole cycle back; a retry starts  │
//! │  again from a fresh session and a fresh cursor.                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::{debug, info};

use tally_core::{directory_names, format_timestamp, NewAttendanceMark};
use tally_db::{Database, InsertOutcome};

use crate::error::SyncResult;
use crate::retry::BackoffController;
use crate::scheduler::SyncCycle;
use crate::session::TerminalBroker;

/// Summary of one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollReport {
    /// Identity the marks were stored under.
    pub device_serial: String,

    /// True when the address stood in for an unreadable serial.
    pub identity_substituted: bool,

    /// True when user names came from the terminal's directory.
    pub names_resolved: bool,

    /// Events in the terminal's buffer.
    pub events_seen: usize,

    pub inserted: usize,
    pub duplicates_skipped: usize,

    /// Events at or before the cursor, not attempted.
    pub below_cursor: usize,

    /// Cursor the cycle filtered against (None = unbounded past).
    pub cursor: Option<NaiveDateTime>,
}

/// Pulls attendance from one terminal.
#[derive(Debug, Clone)]
pub struct AttendancePuller {
    db: Database,
    broker: TerminalBroker,
    retry: BackoffController,
    resolve_user_names: bool,
}

impl AttendancePuller {
    /// Creates a puller with name resolution enabled.
    pub fn new(db: Database, broker: TerminalBroker, retry: BackoffController) -> Self {
        AttendancePuller {
            db,
            broker,
            retry,
            resolve_user_names: true,
        }
    }

    /// Turns user-name lookup against the terminal directory on or off.
    pub fn resolve_user_names(mut self, resolve: bool) -> Self {
        self.resolve_user_names = resolve;
        self
    }

    /// Runs one complete poll cycle, retrying transient failures.
    pub async fn poll_once(&self) -> SyncResult<PollReport> {
        let report = self.retry.run("poll_once", || self.poll_attempt()).await?;

        info!(
            device = %report.device_serial,
            events_seen = report.events_seen,
            inserted = report.inserted,
            duplicates_skipped = report.duplicates_skipped,
            below_cursor = report.below_cursor,
            cursor = %report.cursor.map(format_timestamp).unwrap_or_else(|| "none".to_string()),
            identity_substituted = report.identity_substituted,
            names_resolved = report.names_resolved,
            "Attendance poll complete"
        );
        Ok(report)
    }

    async fn poll_attempt(&self) -> SyncResult<PollReport> {
        let marks = self.db.marks();
        let resolve = self.resolve_user_names;

        self.broker
            .with_session(move |session| {
                Box::pin(async move {
                    let directory = if resolve {
                        Some(session.user_directory().await)
                    } else {
                        None
                    };
                    let events = session.event_log().await?;

                    let (names, names_resolved) = match &directory {
                        Some(users) => (directory_names(users.value()), !users.is_degraded()),
                        None => (HashMap::new(), false),
                    };
                    let serial = session.serial().to_string();
                    let address = session.address().to_string();

                    let mut ingest = marks.begin_ingest().await?;
                    let cursor = ingest.cursor(&serial).await?;
                    debug!(device = %serial, %cursor, events = events.len(), "Ingesting event log");

                    let mut report = PollReport {
                        device_serial: serial.clone(),
                        identity_substituted: session.identity().is_degraded(),
                        names_resolved,
                        events_seen: events.len(),
                        cursor: cursor.position(),
                        ..Default::default()
                    };

                    for event in &events {
                        let mark = NewAttendanceMark::from_event(event, &serial, &address, &names);
                        if !cursor.admits(mark.event_timestamp) {
                            report.below_cursor += 1;
                            continue;
                        }
                        match ingest.insert(&mark).await? {
                            InsertOutcome::Inserted(_) => report.inserted += 1,
                            InsertOutcome::Duplicate => report.duplicates_skipped += 1,
                        }
                    }

                    ingest.commit().await?;
                    Ok(report)
                })
            })
            .await
    }
}

#[async_trait]
impl SyncCycle for AttendancePuller {
    type Report = PollReport;

    fn name(&self) -> &'static str {
        "attendance"
    }

    async fn run_cycle(&self) -> SyncResult<PollReport> {
        self.poll_once().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::retry::RetryPolicy;
    use crate::terminal::memory::{MemoryTerminal, TerminalCall};
    use chrono::NaiveDate;
    use std::sync::Arc;
    use tally_core::{MarkQuery, TerminalEvent};
    use tally_db::DbConfig;
    use tokio_util::sync::CancellationToken;

    fn at(minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(8, minute, 0)
            .unwrap()
    }

    fn punch(user: &str, minute: u32) -> TerminalEvent {
        TerminalEvent {
            user_id: user.to_string(),
            timestamp: at(minute),
            punch: 0,
            status: 1,
            work_code: None,
        }
    }

    async fn setup() -> (Database, MemoryTerminal, AttendancePuller) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let terminal = MemoryTerminal::new("10.0.0.5", "CQZ7231");
        let broker = TerminalBroker::new(Arc::new(terminal.clone()));
        let retry = BackoffController::new(RetryPolicy::default(), CancellationToken::new());
        let puller = AttendancePuller::new(db.clone(), broker, retry);
        (db, terminal, puller)
    }

    #[tokio::test]
    async fn test_first_poll_takes_everything() {
        let (db, terminal, puller) = setup().await;
        terminal.add_user("1", "Ana");
        terminal.push_event(punch("1", 0));
        terminal.push_event(punch("2", 1));

        let report = puller.poll_once().await.unwrap();
        assert_eq!(report.device_serial, "CQZ7231");
        assert_eq!(report.events_seen, 2);
        assert_eq!(report.inserted, 2);
        assert_eq!(report.cursor, None);
        assert!(report.names_resolved);

        let marks = db.marks().query(&MarkQuery::default()).await.unwrap();
        let ana = marks.iter().find(|m| m.user_id == "1").unwrap();
        assert_eq!(ana.user_name.as_deref(), Some("Ana"));
        let unknown = marks.iter().find(|m| m.user_id == "2").unwrap();
        assert_eq!(unknown.user_name, None);
    }

    #[tokio::test]
    async fn test_duplicates_in_one_buffer_are_counted() {
        let (_db, terminal, puller) = setup().await;
        terminal.push_event(punch("1", 0));
        terminal.push_event(punch("1", 0));
        terminal.push_event(punch("2", 0));

        let report = puller.poll_once().await.unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(report.duplicates_skipped, 1);
    }

    #[tokio::test]
    async fn test_name_resolution_can_be_disabled() {
        let (db, terminal, puller) = setup().await;
        let puller = puller.resolve_user_names(false);
        terminal.add_user("1", "Ana");
        terminal.push_event(punch("1", 0));

        let report = puller.poll_once().await.unwrap();
        assert!(!report.names_resolved);
        assert!(!terminal.calls().contains(&TerminalCall::UserDirectory));

        let marks = db.marks().query(&MarkQuery::default()).await.unwrap();
        assert_eq!(marks[0].user_name, None);
    }

    #[tokio::test]
    async fn test_directory_failure_degrades_to_empty_names() {
        let (db, terminal, puller) = setup().await;
        terminal.add_user("1", "Ana");
        terminal.fail_directory(true);
        terminal.push_event(punch("1", 0));

        let report = puller.poll_once().await.unwrap();
        assert_eq!(report.inserted, 1);
        assert!(!report.names_resolved);

        let marks = db.marks().query(&MarkQuery::default()).await.unwrap();
        assert_eq!(marks[0].user_name, None);
    }

    #[tokio::test]
    async fn test_failed_insert_rolls_back_whole_cycle() {
        let (db, terminal, puller) = setup().await;
        terminal.push_event(punch("1", 0));
        terminal.push_event(punch("2", 1));
        terminal.push_event(punch("3", 2));

        sqlx::query(
            "CREATE TRIGGER refuse_user_3 BEFORE INSERT ON attendance_marks \
             WHEN NEW.user_id = '3' BEGIN SELECT RAISE(ABORT, 'refused'); END",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let result = puller.poll_once().await;
        assert!(matches!(result, Err(SyncError::DatabaseError(_))));
        assert_eq!(db.marks().count_for_device("CQZ7231").await.unwrap(), 0);

        sqlx::query("DROP TRIGGER refuse_user_3")
            .execute(db.pool())
            .await
            .unwrap();

        let report = puller.poll_once().await.unwrap();
        assert_eq!(report.cursor, None);
        assert_eq!(report.inserted, 3);
    }

    #[tokio::test]
    async fn test_marks_stored_under_address_when_serial_missing() {
        let (db, terminal, puller) = setup().await;
        terminal.fail_serial(true);
        terminal.push_event(punch("1", 0));

        let report = puller.poll_once().await.unwrap();
        assert!(report.identity_substituted);
        assert_eq!(report.device_serial, "10.0.0.5");
        assert_eq!(db.marks().count_for_device("10.0.0.5").await.unwrap(), 1);
    }
}
