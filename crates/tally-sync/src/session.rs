//! # Device Session
//!
//! Scoped, exclusive access to the terminal with guaranteed cleanup.
//!
//! ## Session Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    TerminalBroker::with_session(op)                     │
//! │                                                                         │
//! │  lock broker ─── one conversation at a time, across all loops          │
//! │       │                                                                 │
//! │  connect ─────── failure aborts, op never runs                         │
//! │       │                                                                 │
//! │  pause capture ─ best effort  ──► capture()  = Done | Degraded         │
//! │       │                                                                 │
//! │  read serial ─── best effort  ──► identity() = Done | Degraded(address)│
//! │       │                                                                 │
//! │  op(&mut session)                                                      │
//! │       │                                                                 │
//! │  resume capture ─ always, failure logged                               │
//! │  disconnect ───── always, failure logged                               │
//! │       │                                                                 │
//! │  unlock, return op's result                                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use tally_core::{TerminalEvent, TerminalUser, UserProvision};

use crate::error::SyncResult;
use crate::terminal::{Terminal, TerminalConnector};

// =============================================================================
// Best-Effort Results
// =============================================================================

/// Outcome of a step whose failure must not abort the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BestEffort<T> {
    /// The step worked.
    Done(T),

    /// The step failed; `fallback` stands in for its result.
    Degraded { fallback: T, reason: String },
}

impl<T> BestEffort<T> {
    /// Wraps a step result, substituting `fallback` on failure.
    pub fn from_result<E: fmt::Display>(result: Result<T, E>, fallback: T) -> Self {
        match result {
            Ok(value) => BestEffort::Done(value),
            Err(err) => BestEffort::Degraded {
                fallback,
                reason: err.to_string(),
            },
        }
    }

    /// The value in use, real or substituted.
    pub fn value(&self) -> &T {
        match self {
            BestEffort::Done(value) => value,
            BestEffort::Degraded { fallback, .. } => fallback,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            BestEffort::Done(value) => value,
            BestEffort::Degraded { fallback, .. } => fallback,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, BestEffort::Degraded { .. })
    }

    /// Why the step degraded, if it did.
    pub fn reason(&self) -> Option<&str> {
        match self {
            BestEffort::Done(_) => None,
            BestEffort::Degraded { reason, .. } => Some(reason),
        }
    }
}

// =============================================================================
// Device Session
// =============================================================================

/// An open, paused, identified conversation with the terminal.
///
/// Only reachable inside [`TerminalBroker::with_session`].
pub struct DeviceSession {
    terminal: Box<dyn Terminal>,
    address: String,
    identity: BestEffort<String>,
    capture: BestEffort<bool>,
}

impl DeviceSession {
    /// The device serial, or the address when the serial was unavailable.
    pub fn identity(&self) -> &BestEffort<String> {
        &self.identity
    }

    /// The identity marks are stored under.
    pub fn serial(&self) -> &str {
        self.identity.value()
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether capture was paused for the session.
    pub fn capture(&self) -> &BestEffort<bool> {
        &self.capture
    }

    /// Reads the user directory; a failure yields an empty directory.
    pub async fn user_directory(&mut self) -> BestEffort<Vec<TerminalUser>> {
        let directory = BestEffort::from_result(self.terminal.user_directory().await, Vec::new());
        if let Some(reason) = directory.reason() {
            warn!(device = %self.serial(), reason, "User directory unavailable, names left empty");
        }
        directory
    }

    /// Reads the full event-log buffer.
    pub async fn event_log(&mut self) -> SyncResult<Vec<TerminalEvent>> {
        self.terminal.event_log().await
    }

    /// Pushes one user record.
    pub async fn provision_user(&mut self, user: &UserProvision) -> SyncResult<()> {
        self.terminal.provision_user(user).await
    }

    /// Resumes capture and disconnects, each regardless of the other.
    async fn close(mut self) {
        if let Err(err) = self.terminal.set_capture_paused(false).await {
            warn!(device = %self.serial(), error = %err, "Failed to resume capture");
        }
        if let Err(err) = self.terminal.disconnect().await {
            warn!(device = %self.serial(), error = %err, "Failed to disconnect cleanly");
        }
        debug!(device = %self.serial(), "Session closed");
    }
}

// =============================================================================
// Terminal Broker
// =============================================================================

/// Hands out device sessions one at a time.
///
/// Clones share the lock, so every loop holding a clone is serialized
/// against every other.
#[derive(Clone)]
pub struct TerminalBroker {
    connector: Arc<dyn TerminalConnector>,
    access: Arc<Mutex<()>>,
}

impl TerminalBroker {
    pub fn new(connector: Arc<dyn TerminalConnector>) -> Self {
        TerminalBroker {
            connector,
            access: Arc::new(Mutex::new(())),
        }
    }

    /// The configured terminal address.
    pub fn address(&self) -> &str {
        self.connector.address()
    }

    /// Runs `operation` inside a device session.
    ///
    /// ## Errors
    /// - The connect error, if the terminal can't be reached
    /// - Whatever `operation` returns
    ///
    /// Cleanup failures are logged, never returned.
    pub async fn with_session<T, F>(&self, operation: F) -> SyncResult<T>
    where
        T: Send,
        F: for<'s> FnOnce(&'s mut DeviceSession) -> BoxFuture<'s, SyncResult<T>> + Send,
    {
        let _exclusive = self.access.lock().await;
        let address = self.connector.address().to_string();

        let mut terminal = self.connector.connect().await?;

        let capture = BestEffort::from_result(
            terminal.set_capture_paused(true).await.map(|()| true),
            false,
        );
        if let Some(reason) = capture.reason() {
            warn!(address = %address, reason, "Could not pause capture, continuing");
        }

        let identity = match terminal.serial_number().await {
            Ok(serial) if !serial.trim().is_empty() => BestEffort::Done(serial.trim().to_string()),
            Ok(_) => BestEffort::Degraded {
                fallback: address.clone(),
                reason: "terminal reported an empty serial".to_string(),
            },
            Err(err) => BestEffort::Degraded {
                fallback: address.clone(),
                reason: err.to_string(),
            },
        };
        if let Some(reason) = identity.reason() {
            warn!(address = %address, reason, "Serial unavailable, using address as identity");
        }

        let mut session = DeviceSession {
            terminal,
            address,
            identity,
            capture,
        };
        debug!(device = %session.serial(), "Session open");

        let result = operation(&mut session).await;
        session.close().await;
        result
    }
}

impl fmt::Debug for TerminalBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminalBroker")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::terminal::memory::{MemoryTerminal, TerminalCall};

    fn broker(terminal: &MemoryTerminal) -> TerminalBroker {
        TerminalBroker::new(Arc::new(terminal.clone()))
    }

    #[tokio::test]
    async fn test_session_happy_path() {
        let terminal = MemoryTerminal::new("10.0.0.5", "CQZ7231");

        let serial = broker(&terminal)
            .with_session(|session| {
                Box::pin(async move {
                    assert_eq!(session.capture(), &BestEffort::Done(true));
                    Ok(session.serial().to_string())
                })
            })
            .await
            .unwrap();

        assert_eq!(serial, "CQZ7231");
        assert_eq!(
            terminal.calls(),
            vec![
                TerminalCall::Connect,
                TerminalCall::PauseCapture,
                TerminalCall::SerialNumber,
                TerminalCall::ResumeCapture,
                TerminalCall::Disconnect,
            ]
        );
        assert!(!terminal.capture_paused());
    }

    #[tokio::test]
    async fn test_connect_failure_skips_operation() {
        let terminal = MemoryTerminal::new("10.0.0.5", "CQZ7231");
        terminal.fail_next_connects(1);

        let result: SyncResult<()> = broker(&terminal)
            .with_session(|_| Box::pin(async { Err(SyncError::Internal("operation ran".into())) }))
            .await;

        assert!(matches!(result, Err(SyncError::ConnectionFailed(_))));
        assert_eq!(terminal.calls(), vec![TerminalCall::Connect]);
    }

    #[tokio::test]
    async fn test_degraded_identity_and_capture() {
        let terminal = MemoryTerminal::new("10.0.0.5", "CQZ7231");
        terminal.fail_pause(true);
        terminal.fail_serial(true);

        let (identity, capture) = broker(&terminal)
            .with_session(|session| {
                Box::pin(async move { Ok((session.identity().clone(), session.capture().clone())) })
            })
            .await
            .unwrap();

        assert!(identity.is_degraded());
        assert_eq!(identity.value(), "10.0.0.5");
        assert!(capture.is_degraded());
        assert!(!capture.value());
    }

    #[tokio::test]
    async fn test_empty_serial_uses_address() {
        let terminal = MemoryTerminal::new("10.0.0.5", "   ");

        let identity = broker(&terminal)
            .with_session(|session| Box::pin(async move { Ok(session.identity().clone()) }))
            .await
            .unwrap();

        assert_eq!(identity.value(), "10.0.0.5");
        assert_eq!(identity.reason(), Some("terminal reported an empty serial"));
    }

    #[tokio::test]
    async fn test_cleanup_runs_after_operation_error() {
        let terminal = MemoryTerminal::new("10.0.0.5", "CQZ7231");
        terminal.fail_resume(true);

        let result: SyncResult<()> = broker(&terminal)
            .with_session(|_| Box::pin(async { Err(SyncError::Internal("boom".into())) }))
            .await;

        assert!(matches!(result, Err(SyncError::Internal(_))));
        let calls = terminal.calls();
        assert_eq!(calls[calls.len() - 2], TerminalCall::ResumeCapture);
        assert_eq!(calls[calls.len() - 1], TerminalCall::Disconnect);
    }
}
