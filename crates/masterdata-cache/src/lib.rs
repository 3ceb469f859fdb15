//! # Master Data Cache
//!
//! In-memory views of replicated tables that never pin memory.
//!
//! ## Overview
//!
//! [`TableCache`] hands out one [`CachedTable`] per table; a table hands out
//! one [`CachedRow`] per key. Both are cached only while someone else holds
//! them. Each cached table subscribes to its own change events on the
//! [`ChangeBus`](masterdata_core::ChangeBus) and updates, evicts or marks its
//! live rows as events arrive, so every holder of a row sees the last
//! published state.
//!
//! Rows are read without a transaction: a lookup sees whatever the store
//! holds at that moment, including uncommitted writes of the current root.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use masterdata_cache::TableCache;
//! use masterdata_core::{ChangeBus, RowKey};
//! use masterdata_store::LocalStore;
//!
//! let store = Arc::new(LocalStore::open("replica.db").unwrap());
//! let cache = TableCache::new(store, Arc::new(ChangeBus::new()));
//! // cache.set_schema(...) once a schema is loaded
//! let customers = cache.get_table_by_name("Customer").unwrap();
//! let row = customers.get_row(&RowKey::Integer(42)).unwrap();
//! let active = customers.select().filter("\"Active\" = 1", []).rows().unwrap();
//! ```

pub mod cache;
pub mod error;
pub mod row;
pub mod table;

pub use cache::TableCache;
pub use error::{CacheError, Result};
pub use row::CachedRow;
pub use table::{CachedTable, TableView};
