//! # Master Data Store
//!
//! SQLite local store for the master-data engine.
//!
//! ## Overview
//!
//! The store owns the single physical connection to the local replica. All
//! access goes through the [`TransactionManager`], which lets exactly one
//! thread write at a time while allowing nested and joined participation.
//! On top of it sit the [`schema_sync`] reconciler that keeps the replicated
//! tables in step with the remote schema, and accessors for the replica's
//! own bookkeeping (header, sync tokens, queued tag edits).
//!
//! ## Key Types
//!
//! - [`LocalStore`] - opens the database and runs internal migrations
//! - [`TransactionManager`] / [`Transaction`] - thread-affine transactions
//! - [`SchemaPlan`] - DDL produced by the schema synchronizer
//! - [`Header`] - persisted schema and sync metadata
//!
//! ## Usage
//!
//! ```rust,no_run
//! use masterdata_store::{LocalStore, Wait};
//!
//! let store = LocalStore::open("replica.db").unwrap();
//! if let Some(tx) = store.begin_write(Wait::NoWait).unwrap() {
//!     tx.set_sync_token("Customer", Some("42")).unwrap();
//!     tx.commit().unwrap();
//! };
//! ```
//!
//! ## Design Notes
//!
//! - **Single writer**: a second thread asking to write waits for the root,
//!   joins it when handed a [`JoinTarget`], or gets `Ok(None)` on timeout
//! - **Deferred commit**: nested handles only record intent; the root
//!   commits once every handle is gone
//! - **Negative local ids**: rows created offline get keys below zero so
//!   they never collide with server keys

pub mod error;
pub mod migration;
pub mod schema_sync;
pub mod sql;
pub mod sqlite;
pub mod state;
pub mod transaction;

pub use error::{Result, SchemaError, StoreError};
pub use schema_sync::SchemaPlan;
pub use sqlite::LocalStore;
pub use state::{schema_hash, Header, PendingTagEdit};
pub use transaction::{
    CancelToken, IsolationLevel, JoinTarget, RollbackAction, Transaction, TransactionKind,
    TransactionManager, TransactionStats, Wait,
};
