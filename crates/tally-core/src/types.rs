//! # Domain Types
//!
//! Core domain types used throughout Tally.
//!
//! ## Type Map
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │   TERMINAL SIDE                        STORAGE SIDE                     │
//! │  ┌─────────────────┐  from_event()   ┌─────────────────────┐           │
//! │  │ TerminalEvent   │ ──────────────► │ NewAttendanceMark   │           │
//! │  │  user_id        │                 │  device_serial      │           │
//! │  │  timestamp      │                 │  user_id            │           │
//! │  │  punch, status  │                 │  event_timestamp    │──► INSERT │
//! │  └─────────────────┘                 └─────────────────────┘           │
//! │                                                                         │
//! │  ┌─────────────────┐   ◄──────────   ┌─────────────────────┐           │
//! │  │ UserProvision   │  provision()    │ UserSyncQueueItem   │           │
//! │  │  user_id, name  │                 │  status, attempts   │◄── CLAIM  │
//! │  └─────────────────┘                 └─────────────────────┘           │
//! │                                                                         │
//! │  SyncCursor = MAX(event_timestamp) per device serial                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Timestamps
//! Terminal clocks have no zone. Every timestamp here is a
//! [`NaiveDateTime`] in the terminal's local wall clock, truncated to whole
//! seconds, and persisted as `YYYY-MM-DD HH:MM:SS` text so lexical and
//! chronological order agree.

use std::collections::HashMap;

use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Storage format for every timestamp column.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Drops the sub-second part of a timestamp.
pub fn truncate_to_second(ts: NaiveDateTime) -> NaiveDateTime {
    ts.with_nanosecond(0).unwrap_or(ts)
}

/// Formats a timestamp the way it is stored.
pub fn format_timestamp(ts: NaiveDateTime) -> String {
    truncate_to_second(ts).format(TIMESTAMP_FORMAT).to_string()
}

/// Parses a stored timestamp (`YYYY-MM-DD HH:MM:SS`, fractional seconds tolerated).
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(truncate_to_second)
}

// =============================================================================
// Terminal Side
// =============================================================================

/// One punch as it sits in the terminal's event-log buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalEvent {
    /// Enrollment identifier the terminal recorded the punch under.
    pub user_id: String,

    /// Local wall-clock time of the punch.
    pub timestamp: NaiveDateTime,

    /// Punch kind (check-in, check-out, break, ...), device-defined.
    pub punch: u8,

    /// Verification method / status code, device-defined.
    pub status: u8,

    /// Optional work code entered at the keypad.
    pub work_code: Option<u32>,
}

/// One entry of the terminal's user directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalUser {
    /// Internal slot number on the terminal.
    pub uid: u16,

    /// Enrollment identifier (what punches reference).
    pub user_id: String,

    /// Display name, possibly empty.
    pub name: String,
}

/// Builds the `user_id → name` lookup the puller uses to label marks.
///
/// Users with an empty name are left out so marks keep a NULL name rather
/// than an empty string.
pub fn directory_names(users: &[TerminalUser]) -> HashMap<String, String> {
    users
        .iter()
        .filter(|u| !u.name.trim().is_empty())
        .map(|u| (u.user_id.clone(), u.name.trim().to_string()))
        .collect()
}

/// A user record pushed to the terminal.
///
/// The field set is fixed: everything besides identifier and name is pinned
/// to the values the enrollment flow has always used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProvision {
    /// Enrollment identifier.
    pub user_id: String,

    /// Display name.
    pub name: String,

    /// Privilege level. Always 0 (regular user).
    pub privilege: u8,

    /// Keypad password. Always empty.
    pub password: String,

    /// Group identifier. Always empty.
    pub group_id: String,

    /// RFID card number. Always 0.
    pub card: u32,
}

impl UserProvision {
    /// Creates a request with the fixed defaults.
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        UserProvision {
            user_id: user_id.into(),
            name: name.into(),
            privilege: 0,
            password: String::new(),
            group_id: String::new(),
            card: 0,
        }
    }
}

// =============================================================================
// Attendance Marks
// =============================================================================

/// A punch ready to be inserted into `attendance_marks`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAttendanceMark {
    pub device_serial: String,
    pub device_address: String,
    pub user_id: String,
    pub user_name: Option<String>,
    pub event_timestamp: NaiveDateTime,
    pub punch_type: i64,
    pub verification_status: i64,
    pub work_code: Option<i64>,
}

impl NewAttendanceMark {
    /// Converts a terminal event into a mark for the given device identity.
    ///
    /// The timestamp is truncated to whole seconds and the user name is looked
    /// up in `names` (missing entries leave the name empty).
    pub fn from_event(
        event: &TerminalEvent,
        device_serial: &str,
        device_address: &str,
        names: &HashMap<String, String>,
    ) -> Self {
        NewAttendanceMark {
            device_serial: device_serial.to_string(),
            device_address: device_address.to_string(),
            user_id: event.user_id.clone(),
            user_name: names.get(&event.user_id).cloned(),
            event_timestamp: truncate_to_second(event.timestamp),
            punch_type: i64::from(event.punch),
            verification_status: i64::from(event.status),
            work_code: event.work_code.map(i64::from),
        }
    }
}

/// A stored attendance mark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct AttendanceMark {
    /// Surrogate key.
    pub id: i64,

    /// Serial reported by the terminal, or its network address when the
    /// serial could not be read.
    pub device_serial: String,

    /// Network address the mark was pulled from.
    pub device_address: String,

    pub user_id: String,
    pub user_name: Option<String>,

    /// Local wall-clock time of the punch (whole seconds).
    pub event_timestamp: NaiveDateTime,

    pub punch_type: i64,
    pub verification_status: i64,
    pub work_code: Option<i64>,

    /// When the row was written (storage clock).
    pub inserted_at: NaiveDateTime,
}

/// The newest stored punch for one device serial.
///
/// Only events strictly later than the cursor are offered for insertion. An
/// absent cursor (no marks yet) admits everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncCursor(Option<NaiveDateTime>);

impl SyncCursor {
    /// A cursor for a device with no stored marks.
    pub const fn unbounded() -> Self {
        SyncCursor(None)
    }

    /// A cursor positioned at `ts`.
    pub fn at(ts: NaiveDateTime) -> Self {
        SyncCursor(Some(truncate_to_second(ts)))
    }

    /// Wraps an optional position.
    pub fn from_position(position: Option<NaiveDateTime>) -> Self {
        SyncCursor(position.map(truncate_to_second))
    }

    /// The stored position, if any.
    pub fn position(&self) -> Option<NaiveDateTime> {
        self.0
    }

    /// Returns true if a punch at `ts` is newer than the cursor.
    pub fn admits(&self, ts: NaiveDateTime) -> bool {
        match self.0 {
            None => true,
            Some(cursor) => truncate_to_second(ts) > cursor,
        }
    }
}

impl std::fmt::Display for SyncCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(ts) => write!(f, "{}", ts.format(TIMESTAMP_FORMAT)),
            None => write!(f, "unbounded"),
        }
    }
}

/// Filters for listing stored marks, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkQuery {
    pub user_id: Option<String>,
    pub device_serial: Option<String>,

    /// Inclusive lower bound on `event_timestamp`.
    pub from: Option<NaiveDateTime>,

    /// Inclusive upper bound on `event_timestamp`.
    pub to: Option<NaiveDateTime>,

    pub limit: u32,
    pub offset: u32,
}

impl Default for MarkQuery {
    fn default() -> Self {
        MarkQuery {
            user_id: None,
            device_serial: None,
            from: None,
            to: None,
            limit: crate::DEFAULT_MARK_QUERY_LIMIT,
            offset: 0,
        }
    }
}

// =============================================================================
// User Sync Queue
// =============================================================================

/// Lifecycle state of a provisioning request.
///
/// ```text
/// Pending ──claim──► Processing ──push ok──► Done
///                        │
///                        └──push failed──► Error ──claim──► Processing ...
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting for its first claim.
    Pending,
    /// Claimed by a worker; the claim is the lease.
    Processing,
    /// Pushed to the terminal.
    Done,
    /// Last push failed; eligible for another claim.
    Error,
}

impl QueueStatus {
    /// Returns the storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Done => "done",
            QueueStatus::Error => "error",
        }
    }

    /// Returns true if a worker may claim an item in this state.
    pub fn is_claimable(&self) -> bool {
        matches!(self, QueueStatus::Pending | QueueStatus::Error)
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(QueueStatus::Pending),
            "processing" => Ok(QueueStatus::Processing),
            "done" => Ok(QueueStatus::Done),
            "error" => Ok(QueueStatus::Error),
            other => Err(CoreError::UnknownQueueStatus(other.to_string())),
        }
    }
}

/// A request to enroll (or rename) a user on the terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct UserSyncQueueItem {
    pub id: i64,

    /// Opaque business identifiers carried for the requester.
    pub company_id: i64,
    pub person_id: i64,

    pub device_user_id: String,
    pub device_user_name: String,

    pub status: QueueStatus,

    /// Number of claims so far. Only the claim increments it.
    pub attempt_count: i64,

    /// Message of the most recent failed push, cleared on success.
    pub last_error: Option<String>,

    pub created_at: NaiveDateTime,
    pub last_changed_at: NaiveDateTime,

    /// Set when the item reaches Done.
    pub processed_at: Option<NaiveDateTime>,
}

impl UserSyncQueueItem {
    /// The terminal write this item asks for.
    pub fn provision(&self) -> UserProvision {
        UserProvision::new(self.device_user_id.clone(), self.device_user_name.clone())
    }
}

/// Input for enqueueing a provisioning request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewQueueItem {
    pub company_id: i64,
    pub person_id: i64,
    pub device_user_id: String,
    pub device_user_name: String,
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn test_cursor_admits_strictly_later() {
        let cursor = SyncCursor::at(ts(8, 0, 0));
        assert!(!cursor.admits(ts(7, 59, 59)));
        assert!(!cursor.admits(ts(8, 0, 0)));
        assert!(cursor.admits(ts(8, 0, 1)));
    }

    #[test]
    fn test_unbounded_cursor_admits_everything() {
        let cursor = SyncCursor::unbounded();
        assert!(cursor.admits(NaiveDateTime::MIN));
        assert_eq!(cursor.to_string(), "unbounded");
    }

    #[test]
    fn test_cursor_ignores_sub_second_part() {
        let cursor = SyncCursor::at(ts(8, 0, 0));
        let same_second = ts(8, 0, 0).with_nanosecond(750_000_000).unwrap();
        assert!(!cursor.admits(same_second));
    }

    #[test]
    fn test_mark_from_event_truncates_and_resolves_name() {
        let event = TerminalEvent {
            user_id: "42".to_string(),
            timestamp: ts(9, 15, 3).with_nanosecond(120_000_000).unwrap(),
            punch: 1,
            status: 15,
            work_code: Some(7),
        };
        let names = HashMap::from([("42".to_string(), "Ana Ruiz".to_string())]);

        let mark = NewAttendanceMark::from_event(&event, "CKJ1234", "10.0.0.5", &names);
        assert_eq!(mark.event_timestamp, ts(9, 15, 3));
        assert_eq!(mark.user_name.as_deref(), Some("Ana Ruiz"));
        assert_eq!(mark.punch_type, 1);
        assert_eq!(mark.verification_status, 15);
        assert_eq!(mark.work_code, Some(7));

        let anonymous = NewAttendanceMark::from_event(&event, "CKJ1234", "10.0.0.5", &HashMap::new());
        assert_eq!(anonymous.user_name, None);
    }

    #[test]
    fn test_directory_names_skips_blank() {
        let users = vec![
            TerminalUser { uid: 1, user_id: "1".into(), name: "Admin".into() },
            TerminalUser { uid: 2, user_id: "2".into(), name: "  ".into() },
        ];
        let names = directory_names(&users);
        assert_eq!(names.len(), 1);
        assert_eq!(names["1"], "Admin");
    }

    #[test]
    fn test_queue_status_parsing() {
        assert_eq!("pending".parse::<QueueStatus>().unwrap(), QueueStatus::Pending);
        assert_eq!("DONE".parse::<QueueStatus>().unwrap(), QueueStatus::Done);
        assert!("archived".parse::<QueueStatus>().is_err());
        assert!(QueueStatus::Error.is_claimable());
        assert!(!QueueStatus::Processing.is_claimable());
    }

    #[test]
    fn test_queue_status_serializes_lowercase() {
        let json = serde_json::to_string(&QueueStatus::Processing).unwrap();
        assert_eq!(json, "\"processing\"");
    }

    #[test]
    fn test_timestamp_format_round_trip() {
        let raw = format_timestamp(ts(23, 5, 9));
        assert_eq!(raw, "2024-03-01 23:05:09");
        assert_eq!(parse_timestamp(&raw), Some(ts(23, 5, 9)));
        assert_eq!(parse_timestamp("2024-03-01 23:05:09.5"), Some(ts(23, 5, 9)));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_provision_has_fixed_defaults() {
        let request = UserProvision::new("1001", "Luis");
        assert_eq!(request.privilege, 0);
        assert_eq!(request.card, 0);
        assert!(request.password.is_empty());
        assert!(request.group_id.is_empty());
    }
}
