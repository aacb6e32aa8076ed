//! # Repository Module
//!
//! Database repository implementations.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  StateStore (inkposter-sync)                                           │
//! │       │                                                                 │
//! │       │  db.records().get("session_tokens.frame-1")                    │
//! │       ▼                                                                 │
//! │  StateRecordRepository                                                 │
//! │  ├── get(&self, key)                                                   │
//! │  ├── upsert(&self, key, version, payload)                              │
//! │  └── delete(&self, key)                                                │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod records;
