//! # Repository Module
//!
//! Database repository implementations for Tally.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Repository Pattern                                   │
//! │                                                                         │
//! │  Sync engine                                                           │
//! │       │                                                                 │
//! │       │  db.marks().begin_ingest()                                     │
//! │       │  db.user_sync_queue().claim_batch(20)                          │
//! │       ▼                                                                 │
//! │  MarkRepository              UserSyncQueueRepository                   │
//! │  ├── begin_ingest()          ├── enqueue(item)                         │
//! │  │   ├── cursor(serial)      ├── claim_batch(n)                        │
//! │  │   ├── insert(mark)        ├── mark_done(id)                         │
//! │  │   └── commit()            ├── mark_failed(id, error)                │
//! │  ├── query(filters)          ├── get_by_id(id)                         │
//! │  └── get_by_id(id)           └── count_by_status(status)               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`MarkRepository`](marks::MarkRepository) - Attendance marks and the sync cursor
//! - [`UserSyncQueueRepository`](user_sync::UserSyncQueueRepository) - Provisioning queue

pub mod marks;
pub mod user_sync;
