//! # Terminal Capability Surface
//!
//! What the engine needs from an attendance terminal, and nothing more.
//!
//! ## Drivers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Terminal Drivers                                  │
//! │                                                                         │
//! │            TerminalConnector::connect()                                 │
//! │                       │                                                 │
//! │          ┌────────────┴────────────┐                                    │
//! │          ▼                         ▼                                    │
//! │  ┌────────────────┐       ┌─────────────────┐                           │
//! │  │ zk::ZkConnector│       │ MemoryTerminal  │                           │
//! │  │                │       │                 │                           │
//! │  │ TCP :4370      │       │ scripted state, │                           │
//! │  │ binary frames  │       │ failure toggles │                           │
//! │  └────────────────┘       └─────────────────┘                           │
//! │                                                                         │
//! │  A connected Terminal is exclusively owned by one DeviceSession and    │
//! │  is dropped after disconnect().                                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod memory;
pub mod zk;

use async_trait::async_trait;

use tally_core::{TerminalEvent, TerminalUser, UserProvision};

use crate::error::SyncResult;

pub use memory::MemoryTerminal;
pub use zk::{ZkConnector, ZkOptions};

/// Opens connections to one terminal.
#[async_trait]
pub trait TerminalConnector: Send + Sync {
    /// Network address of the terminal, used as a fallback identity.
    fn address(&self) -> &str;

    /// Opens and authenticates a connection.
    async fn connect(&self) -> SyncResult<Box<dyn Terminal>>;
}

/// One open conversation with a terminal.
#[async_trait]
pub trait Terminal: Send {
    /// Pauses (`true`) or resumes (`false`) punch capture on the device.
    async fn set_capture_paused(&mut self, paused: bool) -> SyncResult<()>;

    /// Reads the device serial number.
    async fn serial_number(&mut self) -> SyncResult<String>;

    /// Reads the whole event-log buffer.
    async fn event_log(&mut self) -> SyncResult<Vec<TerminalEvent>>;

    /// Reads the enrolled users.
    async fn user_directory(&mut self) -> SyncResult<Vec<TerminalUser>>;

    /// Creates or overwrites one user.
    async fn provision_user(&mut self, user: &UserProvision) -> SyncResult<()>;

    /// Closes the conversation.
    async fn disconnect(&mut self) -> SyncResult<()>;
}
