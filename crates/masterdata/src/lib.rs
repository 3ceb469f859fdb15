//! # Master Data
//!
//! Offline replica of server-owned master data.
//!
//! ## Overview
//!
//! The engine keeps a local SQLite copy of a set of server tables and keeps
//! it current:
//!
//! - **Schema**: the local tables follow the server's schema document,
//!   migrated in place without losing data where that is possible
//! - **Transactions**: one writer at a time, with nesting on the owning
//!   thread and explicit hand-over to a second thread
//! - **Sync**: an incremental change feed, applied batch by batch and
//!   safe to re-apply
//! - **Caches**: rows and tables shared while referenced, updated in place
//!   from change events, never kept alive by the cache itself
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use masterdata::{MasterData, MasterDataConfig, SyncOutcome};
//! use masterdata::core::RowKey;
//! use masterdata::sync::memory::MemoryRemote;
//!
//! let remote = Arc::new(MemoryRemote::new());
//! let config = MasterDataConfig::default().with_database_path("replica.db");
//! let md = MasterData::open(config, remote).unwrap();
//!
//! if let SyncOutcome::Completed(report) = md.run_synchronization(false).unwrap() {
//!     println!("{} rows applied", report.rows_applied);
//! }
//!
//! let _token = md.subscribe("Customer", None, |event| println!("{:?}", event.kind));
//! let customer = md.get_row("Customer", &RowKey::Integer(42)).unwrap();
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `masterdata::core` - schema definitions, values, change events and bus
//! - `masterdata::store` - local store, transactions, schema synchronizer
//! - `masterdata::sync` - change feed and synchronization engine
//! - `masterdata::cache` - weak row and table caches

pub mod config;
pub mod error;
pub mod master_data;

// Re-export component crates
pub use masterdata_cache as cache;
pub use masterdata_core as core;
pub use masterdata_store as store;
pub use masterdata_sync as sync;

// Re-export main types for convenience
pub use config::MasterDataConfig;
pub use error::{MasterDataError, Result};
pub use master_data::MasterData;

pub use masterdata_cache::{CachedRow, CachedTable, TableView};
pub use masterdata_core::{ChangeEvent, ChangeKind, RowKey, Subscription, TagEdit, TagOp, Value};
pub use masterdata_store::{IsolationLevel, Transaction, Wait};
pub use masterdata_sync::{SyncConfig, SyncOutcome, SyncReport};
