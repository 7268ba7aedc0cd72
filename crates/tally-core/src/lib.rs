//! # tally-core: Pure Domain Model for Tally
//!
//! This crate holds the types every other Tally crate speaks in: punches read
//! off a terminal, the marks they become in storage, and the queue items that
//! carry user enrollments back to the terminal. It has zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tally Architecture                               │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 tally-collector (daemon binary)                 │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │        tally-sync (terminal protocol, puller, provisioning)     │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tally-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌─────────────────┐  ┌─────────────────┐  ┌──────────────┐   │   │
//! │  │   │     types       │  │   validation    │  │    error     │   │   │
//! │  │   │ TerminalEvent   │  │ queue requests  │  │ CoreError    │   │   │
//! │  │   │ AttendanceMark  │  │ mark queries    │  │ Validation   │   │   │
//! │  │   │ UserSyncQueue.. │  │ error text cap  │  │  Error       │   │   │
//! │  │   └─────────────────┘  └─────────────────┘  └──────────────┘   │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    tally-db (Database Layer)                    │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (marks, events, queue items, cursor)
//! - [`error`] - Domain error types
//! - [`validation`] - Input validation and error text normalization
//!
//! ## Example Usage
//!
//! ```rust
//! use chrono::NaiveDate;
//! use tally_core::SyncCursor;
//!
//! let t1 = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(8, 0, 0).unwrap();
//! let t2 = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(17, 30, 0).unwrap();
//!
//! let cursor = SyncCursor::at(t1);
//! assert!(!cursor.admits(t1));
//! assert!(cursor.admits(t2));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, ValidationError};
pub use types::*;
pub use validation::truncate_error_text;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Maximum length (in characters) of a persisted queue item error message.
///
/// Longer messages are cut before they reach storage; the column carries a
/// matching CHECK constraint.
pub const MAX_ERROR_TEXT_LEN: usize = 4000;

/// Maximum byte length of an enrollment identifier the terminal can store.
pub const MAX_DEVICE_USER_ID_LEN: usize = 24;

/// Maximum byte length of a display name the terminal can store.
pub const MAX_DEVICE_USER_NAME_LEN: usize = 24;

/// Default page size for mark listings.
pub const DEFAULT_MARK_QUERY_LIMIT: u32 = 500;

/// Largest page a mark listing may request.
pub const MAX_MARK_QUERY_LIMIT: u32 = 2000;
