//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Terminal Protocol   │ │
//! │  │                 │  │   (transient)   │  │                         │ │
//! │  │  InvalidConfig  │  │  Connection     │  │  TerminalRejected       │ │
//! │  │  ConfigLoad     │  │  Disconnected   │  │  ProtocolViolation      │ │
//! │  │                 │  │  Timeout        │  │  UnsupportedRecord      │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐                              │
//! │  │    Storage      │  │    Internal     │                              │
//! │  │                 │  │                 │                              │
//! │  │  Unavailable    │  │  Internal       │                              │
//! │  │   (transient)   │  │  ShuttingDown   │                              │
//! │  │  DatabaseError  │  │                 │                              │
//! │  └─────────────────┘  └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only the transient categories are retried by the
//! [`BackoffController`](crate::retry::BackoffController).

use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    // =========================================================================
    // Transport Errors (transient)
    // =========================================================================
    /// Failed to reach the terminal.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The terminal closed the connection mid-conversation.
    #[error("Disconnected from terminal")]
    Disconnected,

    /// The terminal did not answer in time.
    #[error("Terminal timeout after {0} seconds")]
    Timeout(u64),

    // =========================================================================
    // Terminal Protocol Errors
    // =========================================================================
    /// The terminal answered a command with something other than success.
    #[error("Terminal rejected {command} (reply code {code})")]
    TerminalRejected { command: String, code: u16 },

    /// A frame or payload didn't match the protocol.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// A record width the decoder doesn't know.
    #[error("Unsupported {kind} record size: {size} bytes")]
    UnsupportedRecord { kind: &'static str, size: usize },

    /// A request the terminal's record format cannot represent.
    #[error("Cannot encode user {user_id}: {reason}")]
    UnencodableUser { user_id: String, reason: String },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Storage is temporarily unavailable (locked, I/O, pool).
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Any other storage failure.
    #[error("Database error: {0}")]
    DatabaseError(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Cancellation was requested while the operation was waiting.
    #[error("Sync engine is shutting down")]
    ShuttingDown,
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<tally_db::DbError> for SyncError {
    fn from(err: tally_db::DbError) -> Self {
        if err.is_transient() {
            SyncError::StorageUnavailable(err.to_string())
        } else {
            SyncError::DatabaseError(err.to_string())
        }
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl SyncError {
    /// Maps a socket error from the terminal conversation.
    ///
    /// Every I/O failure on the terminal socket is transient; timeouts keep
    /// the configured timeout for the message.
    pub fn from_terminal_io(err: std::io::Error, timeout_secs: u64) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => SyncError::Timeout(timeout_secs),
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => SyncError::Disconnected,
            _ => SyncError::ConnectionFailed(err.to_string()),
        }
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the operation may succeed when repeated later.
    ///
    /// ## Transient
    /// - Terminal unreachable, disconnected or slow
    /// - Storage locked or temporarily unreachable
    ///
    /// ## Permanent
    /// - Configuration errors
    /// - Protocol violations and refusals by the terminal
    /// - Storage errors such as constraint or SQL failures
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionFailed(_)
                | SyncError::Disconnected
                | SyncError::Timeout(_)
                | SyncError::StorageUnavailable(_)
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_) | SyncError::ConfigLoadFailed(_)
        )
    }

    /// Returns true if the terminal spoke, but not as expected.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            SyncError::TerminalRejected { .. }
                | SyncError::ProtocolViolation(_)
                | SyncError::UnsupportedRecord { .. }
                | SyncError::UnencodableUser { .. }
        )
    }
}
