//! # Scheduler Drivers
//!
//! Decide when a sync cycle runs. The cycles themselves know nothing about
//! time.
//!
//! ## Schedules
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         drive(cycle, schedule)                          │
//! │                                                                         │
//! │  Interval(d)     run ─ sleep d ─ run ─ sleep d ─ ...                   │
//! │                  a failed cycle is logged, the loop keeps going        │
//! │                                                                         │
//! │  Daily{h, m}     sleep until next h:m local ─ run ─ repeat             │
//! │                  (sleeps at least 1s)                                  │
//! │                                                                         │
//! │  Once            run, return the report or the error                   │
//! │                                                                         │
//! │  Every sleep races the CancellationToken; a cancelled driver returns   │
//! │  the last successful report.                                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime, NaiveTime, TimeDelta};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{SyncError, SyncResult};

/// Shortest sleep the daily driver takes.
const MIN_DAILY_SLEEP: Duration = Duration::from_secs(1);

// =============================================================================
// Sync Cycle
// =============================================================================

/// One unit of scheduled work.
#[async_trait]
pub trait SyncCycle: Send + Sync {
    /// What a successful cycle reports.
    type Report: Serialize + Send;

    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Runs the cycle once.
    async fn run_cycle(&self) -> SyncResult<Self::Report>;
}

// =============================================================================
// Schedule
// =============================================================================

/// When a driver runs its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Immediately, then after every period.
    Interval(Duration),

    /// Every day at the given local wall-clock time.
    Daily { hour: u32, minute: u32 },

    /// A single cycle.
    Once,
}

/// The first `hour:minute` strictly after `now`.
///
/// Returns `None` if `hour:minute` is not a valid time of day.
pub fn next_daily_run(now: NaiveDateTime, hour: u32, minute: u32) -> Option<NaiveDateTime> {
    let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
    let today = now.date().and_time(time);
    if today > now {
        Some(today)
    } else {
        today.checked_add_signed(TimeDelta::days(1))
    }
}

// =============================================================================
// Drivers
// =============================================================================

/// Runs `cycle` on `schedule` until cancelled.
///
/// ## Returns
/// - `Once`: the cycle's report, or its error
/// - `Interval` / `Daily`: the last successful report once cancelled
///
/// ## Errors
/// `Interval` and `Daily` fail only on an unusable schedule; cycle errors
/// are logged and the loop continues.
pub async fn drive<C: SyncCycle>(
    cycle: &C,
    schedule: Schedule,
    cancel: &CancellationToken,
) -> SyncResult<Option<C::Report>> {
    let name = cycle.name();

    let mut last = None;
    match schedule {
        Schedule::Once => return cycle.run_cycle().await.map(Some),

        Schedule::Interval(period) => {
            if period.is_zero() {
                return Err(SyncError::InvalidConfig(format!(
                    "{name} interval must be greater than 0"
                )));
            }
            info!(cycle = name, ?period, "Interval driver started");

            while !cancel.is_cancelled() {
                if !run_logged(cycle, &mut last).await {
                    break;
                }
                if !sleep_or_cancel(period, cancel).await {
                    break;
                }
            }
        }

        Schedule::Daily { hour, minute } => {
            if NaiveTime::from_hms_opt(hour, minute, 0).is_none() {
                return Err(SyncError::InvalidConfig(format!(
                    "{name} daily time {hour:02}:{minute:02} is not a time of day"
                )));
            }
            info!(cycle = name, hour, minute, "Daily driver started");

            while !cancel.is_cancelled() {
                let now = Local::now().naive_local();
                let delay = next_daily_run(now, hour, minute)
                    .and_then(|next| (next - now).to_std().ok())
                    .unwrap_or(MIN_DAILY_SLEEP)
                    .max(MIN_DAILY_SLEEP);
                debug!(cycle = name, ?delay, "Sleeping until next daily run");

                if !sleep_or_cancel(delay, cancel).await {
                    break;
                }
                if !run_logged(cycle, &mut last).await {
                    break;
                }
            }
        }
    }

    info!(cycle = name, "Driver stopped");
    Ok(last)
}

/// Runs one cycle for a looping driver. Returns false on shutdown.
async fn run_logged<C: SyncCycle>(cycle: &C, last: &mut Option<C::Report>) -> bool {
    match cycle.run_cycle().await {
        Ok(report) => {
            *last = Some(report);
            true
        }
        Err(SyncError::ShuttingDown) => false,
        Err(err) => {
            error!(cycle = cycle.name(), error = %err, "Sync cycle failed");
            true
        }
    }
}

/// Sleeps for `delay`. Returns false if cancelled first.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
