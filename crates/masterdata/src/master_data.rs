//! The master-data handle: one replica, its sync engine and its caches.

use std::sync::Arc;

use masterdata_cache::{CachedRow, CachedTable, TableCache};
use masterdata_core::{
    ChangeBus, ChangeEvent, RowKey, Schema, Subscription, TableDefinition, TagEdit,
};
use masterdata_store::{CancelToken, IsolationLevel, JoinTarget, LocalStore, Transaction, Wait};
use masterdata_sync::{RemoteSource, SyncEngine, SyncOutcome};

use crate::config::MasterDataConfig;
use crate::error::{MasterDataError, Result};

/// Entry point of the engine.
///
/// Owns the local replica, the change bus, the sync engine and the table
/// cache. Cheap to share behind an `Arc`; every method takes `&self`.
pub struct MasterData {
    engine: Arc<SyncEngine>,
    cache: TableCache,
    config: MasterDataConfig,
}

impl MasterData {
    /// Open the replica described by `config`, synchronizing against `remote`.
    ///
    /// A schema persisted by an earlier run is loaded right away, so tables
    /// are usable before the first synchronization.
    pub fn open(config: MasterDataConfig, remote: Arc<dyn RemoteSource>) -> Result<Self> {
        let store = match &config.database_path {
            Some(path) => LocalStore::open(path)?,
            None => LocalStore::open_memory()?,
        };
        let store = Arc::new(store);
        let bus = Arc::new(ChangeBus::new());
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&store),
            remote,
            Arc::clone(&bus),
            config.sync.clone(),
        ));
        let cache = TableCache::new(store, bus);
        cache.set_schema(engine.load_persisted_schema()?);
        tracing::debug!(path = ?config.database_path, "opened replica");

        Ok(Self {
            engine,
            cache,
            config,
        })
    }

    pub fn config(&self) -> &MasterDataConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        self.engine.store()
    }

    pub fn bus(&self) -> &Arc<ChangeBus> {
        self.engine.bus()
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn cache(&self) -> &TableCache {
        &self.cache
    }

    /// The schema in effect, if one has been loaded.
    pub fn schema(&self) -> Result<Option<Arc<Schema>>> {
        Ok(self.engine.schema()?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transactions
    // ─────────────────────────────────────────────────────────────────────────

    /// Begin a transaction on the calling thread.
    ///
    /// `Ok(None)` means the store stayed busy for the whole wait.
    pub fn begin_transaction(&self, level: IsolationLevel, wait: Wait) -> Result<Option<Transaction<'_>>> {
        Ok(self.store().begin(level, wait, None, None)?)
    }

    /// Begin a transaction that can be cancelled, or that joins a root
    /// handed over from another thread.
    pub fn begin_transaction_with(
        &self,
        level: IsolationLevel,
        wait: Wait,
        cancel: Option<&CancelToken>,
        join_to: Option<JoinTarget>,
    ) -> Result<Option<Transaction<'_>>> {
        Ok(self.store().begin(level, wait, cancel, join_to)?)
    }

    fn write(&self) -> Result<Transaction<'_>> {
        self.store()
            .begin_write(Wait::Timeout(self.config.write_timeout))?
            .ok_or_else(|| {
                tracing::warn!(timeout = ?self.config.write_timeout, "store stayed busy");
                MasterDataError::Busy
            })
    }

    /// Next free local id for `table`: below every key already in use and
    /// below zero, so it never collides with a server key.
    pub fn next_local_id(&self, tx: &Transaction<'_>, table: &str) -> Result<i64> {
        let definition = self.table_definition(table)?;
        let primary = definition
            .primary_key()
            .ok_or_else(|| {
                MasterDataError::InvalidOperation(format!("table {table} has no primary key"))
            })?;
        Ok(tx.next_local_id(&definition.name, &primary.name)?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Synchronization
    // ─────────────────────────────────────────────────────────────────────────

    /// Run one synchronization on the calling thread.
    pub fn run_synchronization(&self, enforce: bool) -> Result<SyncOutcome> {
        let outcome = self.engine.run_synchronization(enforce);
        // A failed run may still have applied a new schema.
        self.cache.set_schema(self.engine.schema()?);
        Ok(outcome?)
    }

    /// Run one synchronization on the blocking thread pool.
    ///
    /// The run holds store transactions, which are bound to the thread that
    /// opened them, so it runs start to finish on one pool thread.
    pub async fn run_synchronization_async(self: &Arc<Self>, enforce: bool) -> Result<SyncOutcome> {
        let this = Arc::clone(self);
        tokio::task::spawn_blocking(move || this.run_synchronization(enforce))
            .await
            .map_err(|e| MasterDataError::Task(e.to_string()))?
    }

    /// Queue a locally authored tag edit for the next synchronization.
    pub fn queue_tag_edit(&self, edit: &TagEdit) -> Result<i64> {
        let tx = self.write()?;
        let id = tx.queue_tag_edit(edit)?;
        tx.commit()?;
        tracing::debug!(id, object = %edit.object_key, tag = %edit.tag, "queued tag edit");
        Ok(id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tables and Rows
    // ─────────────────────────────────────────────────────────────────────────

    fn table_definition(&self, name: &str) -> Result<Arc<TableDefinition>> {
        self.schema()?
            .and_then(|schema| schema.get(name))
            .ok_or_else(|| MasterDataError::TableNotFound(name.to_string()))
    }

    /// The cached table called `name`.
    pub fn get_table(&self, name: &str) -> Result<Arc<CachedTable>> {
        let definition = self.table_definition(name)?;
        Ok(self.cache.get_table(&definition))
    }

    /// One row of a table, through the row cache.
    pub fn get_row(&self, table: &str, key: &RowKey) -> Result<Option<Arc<CachedRow>>> {
        Ok(self.get_table(table)?.get_row(key)?)
    }

    /// Subscribe to changes of `table`, or of one row of it when `key` is
    /// given. Keep the returned token for as long as events are wanted.
    pub fn subscribe<F>(&self, table: &str, key: Option<RowKey>, handler: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.bus().subscribe(table, key, handler)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Replica Properties
    // ─────────────────────────────────────────────────────────────────────────

    pub fn user_property(&self, name: &str) -> Result<Option<String>> {
        Ok(self.store().read().user_property(name)?)
    }

    /// Set (or with `None`, remove) a per-replica property.
    pub fn set_user_property(&self, name: &str, value: Option<&str>) -> Result<()> {
        let tx = self.write()?;
        tx.set_user_property(name, value)?;
        tx.commit()?;
        Ok(())
    }

    /// Server stamp of the last completed synchronization.
    pub fn last_sync_stamp(&self) -> Result<Option<i64>> {
        Ok(self.store().read().header()?.last_sync_stamp)
    }
}
