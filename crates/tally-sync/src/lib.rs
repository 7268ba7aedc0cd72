//! # tally-sync: Terminal Synchronization Engine
//!
//! Keeps one attendance terminal and the database in agreement: punches
//! flow from the terminal into `attendance_marks`, user enrollments flow
//! from `user_sync_queue` into the terminal.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Engine Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────┐        ┌──────────────────────────────┐  │
//! │  │  drive(puller, schedule) │        │ drive(worker, schedule)      │  │
//! │  │  Interval 60s / Daily    │        │ Interval 10s                 │  │
//! │  └────────────┬─────────────┘        └──────────────┬───────────────┘  │
//! │               ▼                                     ▼                   │
//! │  ┌──────────────────────────┐        ┌──────────────────────────────┐  │
//! │  │ AttendancePuller         │        │ ProvisioningWorker           │  │
//! │  │ poll_once()              │        │ sync_users_once()            │  │
//! │  │ cursor, insert, commit   │        │ claim, push, record          │  │
//! │  └────────────┬─────────────┘        └──────────────┬───────────────┘  │
//! │               │      both under BackoffController   │                   │
//! │               └──────────────────┬──────────────────┘                   │
//! │                                  ▼                                      │
//! │               ┌──────────────────────────────────────┐                 │
//! │               │ TerminalBroker (one session at once) │                 │
//! │               │ DeviceSession: pause, identify, ...  │                 │
//! │               └──────────────────┬───────────────────┘                 │
//! │                                  ▼                                      │
//! │               ┌──────────────────────────────────────┐                 │
//! │               │ Terminal: zk (TCP 4370) or memory    │                 │
//! │               └──────────────────────────────────────┘                 │
//! │                                                                         │
//! │  The two loops share nothing but the broker lock and the database.     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`config`] - Collector configuration (file, environment, defaults)
//! - [`error`] - Sync error types and transient classification
//! - [`retry`] - Backoff Controller
//! - [`terminal`] - Terminal capability surface, ZK and in-memory drivers
//! - [`session`] - Device sessions and the broker serializing them
//! - [`puller`] - Attendance Puller
//! - [`provisioning`] - User Provisioning worker
//! - [`scheduler`] - Interval, daily and one-shot drivers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tally_sync::{AttendancePuller, BackoffController, TerminalBroker};
//! use tally_sync::terminal::ZkConnector;
//!
//! let broker = TerminalBroker::new(Arc::new(ZkConnector::new(config.zk_options())));
//! let retry = BackoffController::new(config.retry.policy(), cancel.clone());
//!
//! let puller = AttendancePuller::new(db, broker, retry);
//! let report = puller.poll_once().await?;
//! println!("{} new marks", report.inserted);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;
pub mod provisioning;
pub mod puller;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod terminal;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::CollectorConfig;
pub use error::{SyncError, SyncResult};
pub use provisioning::{ProvisionReport, ProvisioningWorker};
pub use puller::{AttendancePuller, PollReport};
pub use retry::{BackoffController, RetryPolicy};
pub use scheduler::{drive, next_daily_run, Schedule, SyncCycle};
pub use session::{BestEffort, DeviceSession, TerminalBroker};
