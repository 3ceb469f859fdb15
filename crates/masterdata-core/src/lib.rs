//! # Master-Data Core
//!
//! Pure types for the master-data engine. This crate does no I/O.
//!
//! ## Key Types
//!
//! - [`TableDefinition`] / [`ColumnDefinition`] - remote description of a replicated table
//! - [`Schema`] - a validated set of table definitions, swapped wholesale on schema change
//! - [`Value`] / [`RowKey`] - dynamically typed column values and hashable row keys
//! - [`ChangeEvent`] - row and table change notifications
//! - [`ChangeBus`] - synchronous publisher with weakly held subscribers
//!
//! ## Subscriptions
//!
//! ```rust
//! use masterdata_core::{ChangeBus, ChangeEvent, ColumnDefinition, DataType, TableDefinition};
//! use std::sync::Arc;
//!
//! let bus = ChangeBus::new();
//! let table = Arc::new(
//!     TableDefinition::new("Customer")
//!         .with_column(ColumnDefinition::new("Id", DataType::Integer).primary()),
//! );
//!
//! // The token owns the handler; drop it to unsubscribe.
//! let token = bus.subscribe("Customer", None, |event| println!("{:?}", event.kind));
//! bus.publish(&ChangeEvent::table_changed(table));
//! drop(token);
//! ```

pub mod bus;
pub mod error;
pub mod event;
pub mod schema;
pub mod types;

pub use bus::{ChangeBus, Subscription};
pub use error::CoreError;
pub use event::{ChangeEvent, ChangeKind};
pub use schema::{
    ColumnDefinition, DataType, RelationDefinition, Schema, SchemaDocument, TableDefinition,
    REFRESH_COLUMN, ROW_IDENTITY_COLUMN,
};
pub use types::{RowKey, TagEdit, TagOp, Value};
