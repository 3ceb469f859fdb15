//! SQLite-backed local store.
//!
//! Opens the database, brings the internal tables up to date and hands the
//! connection to a [`TransactionManager`], which owns it from then on.

use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;

use crate::error::Result;
use crate::migration;
use crate::transaction::{
    CancelToken, IsolationLevel, JoinTarget, Transaction, TransactionManager, Wait,
};

/// How long SQLite itself retries when another process holds the file lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// The local replica database.
#[derive(Debug)]
pub struct LocalStore {
    manager: TransactionManager,
}

impl LocalStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!(path = %path.display(), "opening local store");
        Self::from_connection(Connection::open(path)?)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            manager: TransactionManager::new(conn),
        })
    }

    pub fn manager(&self) -> &TransactionManager {
        &self.manager
    }

    pub fn begin(
        &self,
        level: IsolationLevel,
        wait: Wait,
        cancel: Option<&CancelToken>,
        join_to: Option<JoinTarget>,
    ) -> Result<Option<Transaction<'_>>> {
        self.manager.begin(level, wait, cancel, join_to)
    }

    /// Write transaction with no cancellation and no join target.
    pub fn begin_write(&self, wait: Wait) -> Result<Option<Transaction<'_>>> {
        self.manager.begin(IsolationLevel::Write, wait, None, None)
    }

    /// Dirty-read handle; never blocks.
    pub fn read(&self) -> Transaction<'_> {
        self.manager.read()
    }
}
