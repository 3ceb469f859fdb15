//! # Master Data Testkit
//!
//! Testing utilities for the master data engine.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: a replica on a temporary database wired to an in-memory
//!   remote, plus a builder for change feeds
//! - **Generators**: Proptest strategies for values, keys and table definitions
//!
//! ## Test Fixtures
//!
//! ```rust
//! use masterdata_core::Value;
//! use masterdata_testkit::fixtures::{FeedBuilder, TestFixture};
//! use masterdata_testkit::sync::RowOp;
//!
//! let fixture = TestFixture::new();
//! let md = fixture.open().unwrap();
//!
//! fixture.push(
//!     FeedBuilder::new()
//!         .batch("Customer", false)
//!         .row(RowOp::Insert, [Value::Integer(1), Value::from("Ada"), Value::Integer(1)])
//!         .sync_id("c1")
//!         .end(),
//! );
//! md.run_synchronization(false).unwrap();
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use masterdata_testkit::generators::row_key;
//! use masterdata_core::RowKey;
//!
//! proptest! {
//!     #[test]
//!     fn key_survives_value_projection(key in row_key()) {
//!         prop_assert_eq!(RowKey::from_value(&key.to_value()), Some(key));
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use masterdata_sync as sync;

pub use fixtures::{sample_schema, FeedBuilder, TestFixture, SAMPLE_SCHEMA};
pub use generators::{data_type, row_key, row_values, table_definition, tag_edit, value};
