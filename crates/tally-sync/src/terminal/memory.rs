//! # In-Memory Terminal
//!
//! A scriptable terminal that lives in process memory.
//!
//! The handle is both the connector and the device: clones share state, so a
//! test keeps one clone to script failures and inspect the call journal
//! while the engine connects through another.
//!
//! ```rust
//! use tally_sync::terminal::MemoryTerminal;
//!
//! let terminal = MemoryTerminal::new("10.0.0.5", "CQZ7231");
//! terminal.fail_next_connects(2);
//! terminal.reject_user("42");
//! assert_eq!(terminal.connect_count(), 0);
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use tally_core::{TerminalEvent, TerminalUser, UserProvision};

use super::{Terminal, TerminalConnector};
use crate::error::{SyncError, SyncResult};

/// Reply code used for injected refusals.
const REJECTED_CODE: u16 = 2001;

/// One entry of the call journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalCall {
    Connect,
    PauseCapture,
    ResumeCapture,
    SerialNumber,
    EventLog,
    UserDirectory,
    ProvisionUser(String),
    Disconnect,
}

#[derive(Debug, Default)]
struct MemoryState {
    serial: String,
    events: Vec<TerminalEvent>,
    users: Vec<TerminalUser>,
    capture_paused: bool,

    // Failure injection
    failing_connects: u32,
    failing_event_logs: u32,
    failing_provisions: u32,
    fail_pause: bool,
    fail_resume: bool,
    fail_serial: bool,
    fail_directory: bool,
    fail_disconnect: bool,
    rejected_users: HashSet<String>,
    event_log_delay: Option<Duration>,

    // Observations
    calls: Vec<TerminalCall>,
    connects: u32,
    open_sessions: usize,
    max_open_sessions: usize,
}

/// Shared handle to an in-memory terminal.
#[derive(Debug, Clone)]
pub struct MemoryTerminal {
    address: String,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTerminal {
    /// Creates an empty terminal with the given address and serial.
    pub fn new(address: impl Into<String>, serial: impl Into<String>) -> Self {
        let state = MemoryState {
            serial: serial.into(),
            ..Default::default()
        };
        MemoryTerminal {
            address: address.into(),
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Scripting
    // =========================================================================

    /// Appends a punch to the event-log buffer.
    pub fn push_event(&self, event: TerminalEvent) {
        self.state().events.push(event);
    }

    /// Enrolls a user directly, bypassing the journal.
    pub fn add_user(&self, user_id: impl Into<String>, name: impl Into<String>) {
        let mut state = self.state();
        let uid = next_uid(&state.users);
        state.users.push(TerminalUser {
            uid,
            user_id: user_id.into(),
            name: name.into(),
        });
    }

    /// Replaces the serial number; an empty serial is allowed.
    pub fn set_serial(&self, serial: impl Into<String>) {
        self.state().serial = serial.into();
    }

    /// The next `n` connection attempts fail with a transient error.
    pub fn fail_next_connects(&self, n: u32) {
        self.state().failing_connects = n;
    }

    /// The next `n` event-log reads drop the connection.
    pub fn fail_next_event_logs(&self, n: u32) {
        self.state().failing_event_logs = n;
    }

    /// The next `n` user pushes drop the connection.
    pub fn fail_next_provisions(&self, n: u32) {
        self.state().failing_provisions = n;
    }

    pub fn fail_pause(&self, fail: bool) {
        self.state().fail_pause = fail;
    }

    pub fn fail_resume(&self, fail: bool) {
        self.state().fail_resume = fail;
    }

    pub fn fail_serial(&self, fail: bool) {
        self.state().fail_serial = fail;
    }

    pub fn fail_directory(&self, fail: bool) {
        self.state().fail_directory = fail;
    }

    pub fn fail_disconnect(&self, fail: bool) {
        self.state().fail_disconnect = fail;
    }

    /// Makes `provision_user` refuse this user id.
    pub fn reject_user(&self, user_id: impl Into<String>) {
        self.state().rejected_users.insert(user_id.into());
    }

    /// Makes every event-log read take this long.
    pub fn slow_event_log(&self, delay: Duration) {
        self.state().event_log_delay = Some(delay);
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Enrolled users, in slot order.
    pub fn users(&self) -> Vec<TerminalUser> {
        self.state().users.clone()
    }

    /// Every call made so far.
    pub fn calls(&self) -> Vec<TerminalCall> {
        self.state().calls.clone()
    }

    /// Number of connection attempts, failed ones included.
    pub fn connect_count(&self) -> u32 {
        self.state().connects
    }

    /// Whether capture is currently paused.
    pub fn capture_paused(&self) -> bool {
        self.state().capture_paused
    }

    /// Highest number of simultaneously open connections observed.
    pub fn max_open_sessions(&self) -> usize {
        self.state().max_open_sessions
    }
}

fn next_uid(users: &[TerminalUser]) -> u16 {
    users.iter().map(|u| u.uid).max().unwrap_or(0).saturating_add(1)
}

fn injected(step: &str) -> SyncError {
    SyncError::TerminalRejected {
        command: step.to_string(),
        code: REJECTED_CODE,
    }
}

#[async_trait]
impl TerminalConnector for MemoryTerminal {
    fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> SyncResult<Box<dyn Terminal>> {
        let mut state = self.state();
        state.connects += 1;
        state.calls.push(TerminalCall::Connect);

        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(SyncError::ConnectionFailed(format!(
                "{}: connection refused",
                self.address
            )));
        }

        state.open_sessions += 1;
        state.max_open_sessions = state.max_open_sessions.max(state.open_sessions);
        trace!(address = %self.address, "Memory terminal connected");

        Ok(Box::new(MemoryConnection {
            terminal: self.clone(),
            open: true,
        }))
    }
}

/// An open conversation with a [`MemoryTerminal`].
struct MemoryConnection {
    terminal: MemoryTerminal,
    open: bool,
}

impl MemoryConnection {
    fn record(&self, call: TerminalCall) -> SyncResult<MutexGuard<'_, MemoryState>> {
        let mut state = self.terminal.state();
        state.calls.push(call);
        if !self.open {
            return Err(SyncError::Disconnected);
        }
        Ok(state)
    }
}

#[async_trait]
impl Terminal for MemoryConnection {
    async fn set_capture_paused(&mut self, paused: bool) -> SyncResult<()> {
        let call = if paused {
            TerminalCall::PauseCapture
        } else {
            TerminalCall::ResumeCapture
        };
        let mut state = self.record(call)?;

        let failing = if paused { state.fail_pause } else { state.fail_resume };
        if failing {
            return Err(injected(if paused { "disable_device" } else { "enable_device" }));
        }
        state.capture_paused = paused;
        Ok(())
    }

    async fn serial_number(&mut self) -> SyncResult<String> {
        let state = self.record(TerminalCall::SerialNumber)?;
        if state.fail_serial {
            return Err(injected("serial_number"));
        }
        Ok(state.serial.clone())
    }

    async fn event_log(&mut self) -> SyncResult<Vec<TerminalEvent>> {
        let delay = {
            let mut state = self.record(TerminalCall::EventLog)?;
            if state.failing_event_logs > 0 {
                state.failing_event_logs -= 1;
                state.open_sessions = state.open_sessions.saturating_sub(1);
                drop(state);
                self.open = false;
                return Err(SyncError::Disconnected);
            }
            state.event_log_delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.terminal.state().events.clone())
    }

    async fn user_directory(&mut self) -> SyncResult<Vec<TerminalUser>> {
        let state = self.record(TerminalCall::UserDirectory)?;
        if state.fail_directory {
            return Err(injected("user_directory"));
        }
        Ok(state.users.clone())
    }

    async fn provision_user(&mut self, user: &UserProvision) -> SyncResult<()> {
        let mut state = self.record(TerminalCall::ProvisionUser(user.user_id.clone()))?;
        if state.failing_provisions > 0 {
            state.failing_provisions -= 1;
            state.open_sessions = state.open_sessions.saturating_sub(1);
            drop(state);
            self.open = false;
            return Err(SyncError::Disconnected);
        }
        if state.rejected_users.contains(&user.user_id) {
            return Err(injected("provision_user"));
        }

        match state.users.iter_mut().find(|u| u.user_id == user.user_id) {
            Some(existing) => existing.name = user.name.clone(),
            None => {
                let uid = next_uid(&state.users);
                state.users.push(TerminalUser {
                    uid,
                    user_id: user.user_id.clone(),
                    name: user.name.clone(),
                });
            }
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> SyncResult<()> {
        let mut state = self.terminal.state();
        state.calls.push(TerminalCall::Disconnect);
        if self.open {
            self.open = false;
            state.open_sessions = state.open_sessions.saturating_sub(1);
        }
        if state.fail_disconnect {
            return Err(injected("disconnect"));
        }
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if self.open {
            let mut state = self.terminal.state();
            state.open_sessions = state.open_sessions.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn punch(user: &str, minute: u32) -> TerminalEvent {
        TerminalEvent {
            user_id: user.to_string(),
            timestamp: NaiveDate::from_ymd_opt(2024, 3, 1)
                .unwrap()
                .and_hms_opt(8, minute, 0)
                .unwrap(),
            punch: 0,
            status: 1,
            work_code: None,
        }
    }

    #[tokio::test]
    async fn test_connect_failures_then_success() {
        let terminal = MemoryTerminal::new("10.0.0.5", "CQZ7231");
        terminal.fail_next_connects(1);

        assert!(terminal.connect().await.is_err());
        let mut conn = terminal.connect().await.unwrap();
        assert_eq!(conn.serial_number().await.unwrap(), "CQZ7231");
        assert_eq!(terminal.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_provision_upserts_by_user_id() {
        let terminal = MemoryTerminal::new("10.0.0.5", "CQZ7231");
        terminal.add_user("1", "Ana");
        let mut conn = terminal.connect().await.unwrap();

        conn.provision_user(&UserProvision::new("1", "Ana Lima")).await.unwrap();
        conn.provision_user(&UserProvision::new("2", "Bo")).await.unwrap();

        let users = terminal.users();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].name, "Ana Lima");
        assert_eq!(users[1].uid, 2);
    }

    #[tokio::test]
    async fn test_dropped_connection_refuses_calls() {
        let terminal = MemoryTerminal::new("10.0.0.5", "CQZ7231");
        terminal.push_event(punch("1", 0));
        terminal.fail_next_event_logs(1);

        let mut conn = terminal.connect().await.unwrap();
        assert!(matches!(conn.event_log().await, Err(SyncError::Disconnected)));
        assert!(matches!(conn.serial_number().await, Err(SyncError::Disconnected)));

        let mut fresh = terminal.connect().await.unwrap();
        assert_eq!(fresh.event_log().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_journal_and_capture_state() {
        let terminal = MemoryTerminal::new("10.0.0.5", "CQZ7231");
        let mut conn = terminal.connect().await.unwrap();

        conn.set_capture_paused(true).await.unwrap();
        assert!(terminal.capture_paused());
        conn.set_capture_paused(false).await.unwrap();
        conn.disconnect().await.unwrap();

        assert_eq!(
            terminal.calls(),
            vec![
                TerminalCall::Connect,
                TerminalCall::PauseCapture,
                TerminalCall::ResumeCapture,
                TerminalCall::Disconnect,
            ]
        );
        assert_eq!(terminal.max_open_sessions(), 1);
    }
}
