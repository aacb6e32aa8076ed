//! # inkposter-db: Persisted State for Inkposter
//!
//! SQLite storage for the versioned records kept per device link.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Inkposter Data Flow                              │
//! │                                                                         │
//! │  SessionManager / SyncAgent (inkposter-sync)                           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   inkposter-db (THIS CRATE)                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────────┐  ┌─────────────┐  │   │
//! │  │   │   Database    │    │  Repositories     │  │ Migrations  │  │   │
//! │  │   │   (pool.rs)   │◄───│  StateRecordRepo  │  │ (embedded)  │  │   │
//! │  │   └───────────────┘    └───────────────────┘  └─────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database                             │   │
//! │  │   <data dir>/inkposter/inkposter.db                             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use inkposter_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("path/to/inkposter.db")).await?;
//! db.records().upsert("snapshot_cache.frame-1", 1, "{}").await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};
pub use repository::records::{StateRecord, StateRecordRepository};
