//! # Master Data Sync
//!
//! Pulls the remote master data into the local replica.
//!
//! ## Overview
//!
//! The client sends what it already has (a change token per table, the last
//! server stamp and any locally queued tag edits). The server answers with a
//! change feed of per-table batches. Each batch is applied in its own write
//! transaction; its change events go out on the bus once it is committed.
//!
//! ## Key Properties
//!
//! - **Idempotent**: re-applying a feed leaves the replica unchanged
//! - **Resumable**: tokens are stored with their batch, so an aborted run
//!   continues where it stopped
//! - **Cooperative**: a busy store defers the run instead of blocking the
//!   writer that holds it
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use masterdata_core::ChangeBus;
//! use masterdata_store::LocalStore;
//! use masterdata_sync::{memory::MemoryRemote, SyncConfig, SyncEngine, SyncOutcome};
//!
//! let store = Arc::new(LocalStore::open("replica.db").unwrap());
//! let remote = Arc::new(MemoryRemote::new());
//! let engine = SyncEngine::new(store, remote, Arc::new(ChangeBus::new()), SyncConfig::default());
//!
//! match engine.run_synchronization(false).unwrap() {
//!     SyncOutcome::Completed(report) => println!("applied {} rows", report.rows_applied),
//!     SyncOutcome::Deferred => println!("store busy, try later"),
//! }
//! ```
//!
//! ## Feed Flow
//!
//! ```text
//! Client                                Server
//!   |-------- schema probe ------------->|
//!   |<------- last-modified -------------|
//!   |-------- SyncRequest -------------->|
//!   |<------- batch / rows / syncid / end|
//!   |<------- ...                        |
//!   |<------- syncStamp -----------------|
//! ```

pub mod engine;
pub mod error;
pub mod feed;
pub mod processor;
pub mod tags;
pub mod transport;

pub use engine::{SyncConfig, SyncEngine, SyncOutcome, SyncReport};
pub use error::{Result, SyncError};
pub use feed::{
    feed_to_string, write_feed, Cell, FeedElement, FeedReader, RowOp, SyncRequest,
    PROTOCOL_VERSION,
};
pub use processor::{BatchOutput, BatchProcessor, GenericProcessor};
pub use tags::{TagProcessor, TagTableConfig};
pub use transport::{memory, RemoteSchema, RemoteSource};
