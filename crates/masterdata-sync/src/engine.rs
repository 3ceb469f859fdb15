//! Synchronization engine.
//!
//! One run:
//!
//! 1. Probe the remote schema; when it is newer than the applied one, fetch
//!    it, reconcile the local tables and persist it in one write transaction.
//! 2. Send the client's state (tokens, last stamp, queued tag edits).
//! 3. Apply each batch of the returned feed in its own write transaction and
//!    publish its change events after the commit.
//! 4. Store the server's sync stamp and drop the tag edits it accepted.
//!
//! A non-enforced run gives up with [`SyncOutcome::Deferred`] as soon as it
//! cannot get the store within the batch timeout. Batches committed before
//! that point stay applied; their tokens make the next run resume from there.

use std::io::BufRead;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, ThreadId};
use std::time::Duration;

use masterdata_core::{ChangeBus, ChangeEvent, Schema, SchemaDocument, TableDefinition};
use masterdata_store::{schema_hash, LocalStore, SchemaPlan, Transaction, Wait};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::feed::{FeedElement, FeedReader, SyncRequest, PROTOCOL_VERSION};
use crate::processor::{BatchOutput, BatchProcessor, GenericProcessor};
use crate::tags::{TagProcessor, TagTableConfig};
use crate::transport::RemoteSource;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How long a non-enforced run waits for the store before deferring.
    pub batch_timeout: Duration,
    /// How long an enforced run waits for the store before failing.
    pub enforce_timeout: Duration,
    /// Table whose feed rows carry joined tag lists.
    pub tag_table: Option<TagTableConfig>,
    /// Send locally queued tag edits with each request.
    pub push_tag_edits: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_timeout: Duration::from_millis(200),
            enforce_timeout: Duration::from_secs(30),
            tag_table: None,
            push_tag_edits: true,
        }
    }
}

impl SyncConfig {
    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }

    pub fn with_enforce_timeout(mut self, timeout: Duration) -> Self {
        self.enforce_timeout = timeout;
        self
    }

    pub fn with_tag_table(mut self, tag_table: TagTableConfig) -> Self {
        self.tag_table = Some(tag_table);
        self
    }

    pub fn with_push_tag_edits(mut self, push: bool) -> Self {
        self.push_tag_edits = push;
        self
    }
}

/// What a completed run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// A new schema was fetched and applied.
    pub schema_updated: bool,
    /// DDL statements run for it.
    pub schema_statements: usize,
    pub batches: usize,
    pub rows_applied: usize,
    /// Row and table events published on the bus.
    pub events_published: usize,
    /// Tables that changed, in feed order, without repeats.
    pub tables_changed: Vec<String>,
    /// Server stamp stored at the end of the run.
    pub sync_stamp: Option<i64>,
    /// Queued tag edits sent and then cleared.
    pub tag_edits_pushed: usize,
}

impl SyncReport {
    fn note_changed(&mut self, table: &str) {
        if !self.tables_changed.iter().any(|t| t.eq_ignore_ascii_case(table)) {
            self.tables_changed.push(table.to_string());
        }
    }
}

/// Result of [`SyncEngine::run_synchronization`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// The store was busy; nothing more was applied. Try again later.
    Deferred,
}

impl SyncOutcome {
    pub fn is_deferred(&self) -> bool {
        matches!(self, SyncOutcome::Deferred)
    }

    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Completed(report) => Some(report),
            SyncOutcome::Deferred => None,
        }
    }
}

/// Clears the running-thread marker when a run ends, however it ends.
struct RunGuard<'a> {
    running_on: &'a Mutex<Option<ThreadId>>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut running_on) = self.running_on.lock() {
            *running_on = None;
        }
    }
}

/// Drives synchronization of the local store against a remote source.
pub struct SyncEngine {
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteSource>,
    bus: Arc<ChangeBus>,
    config: SyncConfig,
    schema: RwLock<Option<Arc<Schema>>>,
    run_lock: Mutex<()>,
    running_on: Mutex<Option<ThreadId>>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteSource>,
        bus: Arc<ChangeBus>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            remote,
            bus,
            config,
            schema: RwLock::new(None),
            run_lock: Mutex::new(()),
            running_on: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<ChangeBus> {
        &self.bus
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The schema currently in effect, if one has been loaded.
    pub fn schema(&self) -> Result<Option<Arc<Schema>>> {
        Ok(self.schema.read()?.clone())
    }

    /// Load the schema persisted by an earlier run, without touching the
    /// remote. Returns `None` on a fresh replica.
    pub fn load_persisted_schema(&self) -> Result<Option<Arc<Schema>>> {
        let header = self.store.read().header()?;
        let Some(content) = header.schema_content else {
            return Ok(None);
        };
        let schema = Arc::new(SchemaDocument::parse(&content)?.into_schema()?);
        *self.schema.write()? = Some(Arc::clone(&schema));
        tracing::debug!(tables = schema.tables().len(), "loaded persisted schema");
        Ok(Some(schema))
    }

    /// Run one synchronization.
    ///
    /// With `enforce` the run waits up to the enforce timeout for other
    /// writers and fails with [`SyncError::Contention`] if they do not
    /// finish; otherwise it returns [`SyncOutcome::Deferred`] when the store
    /// is busy. Calling this again from the same thread while a run is in
    /// progress (for example from a change handler) fails with
    /// [`SyncError::Recursion`].
    pub fn run_synchronization(&self, enforce: bool) -> Result<SyncOutcome> {
        let me = thread::current().id();
        if *self.running_on.lock()? == Some(me) {
            return Err(SyncError::Recursion);
        }

        let _run = self.run_lock.lock()?;
        *self.running_on.lock()? = Some(me);
        let _guard = RunGuard {
            running_on: &self.running_on,
        };

        if enforce
            && !self
                .store
                .manager()
                .wait_idle(Wait::Timeout(self.config.enforce_timeout), None)?
        {
            tracing::warn!("enforced synchronization timed out waiting for the store");
            return Err(SyncError::Contention);
        }

        tracing::info!(enforce, "synchronization started");
        let outcome = self.run(enforce)?;
        match &outcome {
            SyncOutcome::Completed(report) => tracing::info!(
                batches = report.batches,
                rows = report.rows_applied,
                schema_updated = report.schema_updated,
                "synchronization completed"
            ),
            SyncOutcome::Deferred => tracing::info!("synchronization deferred: store busy"),
        }
        Ok(outcome)
    }

    fn run(&self, enforce: bool) -> Result<SyncOutcome> {
        let mut report = SyncReport::default();

        let Some(schema) = self.refresh_schema(enforce, &mut report)? else {
            return Ok(SyncOutcome::Deferred);
        };

        let (request, sent_up_to) = self.build_request(&schema)?;
        let mut reader = FeedReader::new(self.remote.exchange(&request)?);
        let mut sync_stamp = None;

        while let Some(element) = reader.next() {
            match element? {
                FeedElement::Batch { table, full } => {
                    if !self.apply_batch(&schema, &table, full, &mut reader, enforce, &mut report)? {
                        return Ok(SyncOutcome::Deferred);
                    }
                }
                FeedElement::SyncStamp { stamp } => sync_stamp = Some(stamp),
                FeedElement::Error { message } => {
                    tracing::warn!(%message, "server reported an error");
                    return Err(SyncError::Remote(message));
                }
                other => {
                    return Err(SyncError::Protocol(format!(
                        "line {}: unexpected {} outside a batch",
                        reader.line(),
                        other.name()
                    )))
                }
            }
        }

        if sync_stamp.is_some() || sent_up_to.is_some() {
            let Some(tx) = self.begin_write(enforce)? else {
                return Ok(SyncOutcome::Deferred);
            };
            if let Some(stamp) = sync_stamp {
                tx.set_last_sync_stamp(Some(stamp))?;
            }
            if let Some(up_to) = sent_up_to {
                report.tag_edits_pushed = tx.clear_tag_edits(up_to)?;
            }
            tx.commit()?;
        }
        report.sync_stamp = sync_stamp;
        Ok(SyncOutcome::Completed(report))
    }

    /// Write transaction for one unit of work. `None` means a non-enforced
    /// run should defer.
    fn begin_write(&self, enforce: bool) -> Result<Option<Transaction<'_>>> {
        let wait = if enforce {
            Wait::Timeout(self.config.enforce_timeout)
        } else {
            Wait::Timeout(self.config.batch_timeout)
        };
        match self.store.begin_write(wait)? {
            Some(tx) => Ok(Some(tx)),
            None if enforce => Err(SyncError::Contention),
            None => Ok(None),
        }
    }

    /// Make sure the schema in effect matches the remote one. `None` means
    /// the run should defer.
    fn refresh_schema(&self, enforce: bool, report: &mut SyncReport) -> Result<Option<Arc<Schema>>> {
        let header = self.store.read().header()?;
        let remote_modified = self.remote.schema_modified()?;
        let newer = match (remote_modified, header.schema_timestamp) {
            (Some(remote), Some(local)) => remote > local,
            (Some(_), None) => true,
            (None, _) => false,
        };

        if !newer && header.schema_content.is_some() {
            if let Some(schema) = self.schema()? {
                return Ok(Some(schema));
            }
            return self.load_persisted_schema();
        }

        let remote = self.remote.fetch_schema()?;
        let schema = Arc::new(SchemaDocument::parse(&remote.content)?.into_schema()?);
        // Same content under a newer timestamp: the local tables already match.
        let unchanged = header.schema_content.is_some()
            && header.schema_hash.as_deref() == Some(schema_hash(&remote.content).as_str());
        let previous = self.schema()?;

        let Some(tx) = self.begin_write(enforce)? else {
            return Ok(None);
        };
        let plan = if unchanged {
            SchemaPlan::default()
        } else {
            tx.reconcile_schema(schema.tables())?
        };
        tx.save_schema(remote.modified, &remote.content)?;
        tx.commit()?;

        *self.schema.write()? = Some(Arc::clone(&schema));
        if unchanged {
            tracing::debug!(modified = ?remote.modified, "remote schema content unchanged");
            return Ok(Some(schema));
        }
        tracing::info!(
            modified = ?remote.modified,
            statements = plan.statements.len(),
            "applied remote schema"
        );

        report.schema_updated = true;
        report.schema_statements = plan.statements.len();
        // Metadata such as the virtual key can change without any DDL.
        for table in schema.tables() {
            let redefined = previous
                .as_ref()
                .map_or(true, |old| old.get(&table.name).as_deref() != Some(&**table));
            let rebuilt = plan
                .changed_tables
                .iter()
                .any(|name| name.eq_ignore_ascii_case(&table.name));
            if redefined || rebuilt {
                self.bus.publish(&ChangeEvent::table_changed(Arc::clone(table)));
                report.events_published += 1;
                report.note_changed(&table.name);
            }
        }
        Ok(Some(schema))
    }

    /// The request plus the id of the last tag edit it carries.
    fn build_request(&self, schema: &Schema) -> Result<(SyncRequest, Option<i64>)> {
        let read = self.store.read();
        let header = read.header()?;
        let tokens = read.sync_tokens()?;
        let pending = if self.config.push_tag_edits {
            read.pending_tag_edits()?
        } else {
            Vec::new()
        };

        let request = SyncRequest {
            protocol_version: PROTOCOL_VERSION,
            last_sync_stamp: header.last_sync_stamp,
            tables: schema.table_names(),
            tokens,
            tag_edits: pending.iter().map(|p| p.edit.clone()).collect(),
        };
        tracing::debug!(
            tables = request.tables.len(),
            tokens = request.tokens.len(),
            tag_edits = request.tag_edits.len(),
            "sending sync request"
        );
        Ok((request, pending.last().map(|p| p.id)))
    }

    fn processor_for(&self, table: &Arc<TableDefinition>, full: bool) -> Box<dyn BatchProcessor> {
        match &self.config.tag_table {
            Some(tags) if tags.matches(table) => {
                Box::new(TagProcessor::new(Arc::clone(table), tags.clone(), full))
            }
            _ => Box::new(GenericProcessor::new(Arc::clone(table), full)),
        }
    }

    /// Apply one batch, reading rows up to its `end`. Returns `false` when
    /// the run should defer.
    fn apply_batch<R: BufRead>(
        &self,
        schema: &Schema,
        name: &str,
        full: bool,
        reader: &mut FeedReader<R>,
        enforce: bool,
        report: &mut SyncReport,
    ) -> Result<bool> {
        let table = schema
            .get(name)
            .ok_or_else(|| SyncError::Protocol(format!("batch for unknown table {name}")))?;
        let Some(tx) = self.begin_write(enforce)? else {
            return Ok(false);
        };

        let mut processor = self.processor_for(&table, full);
        let mut out = BatchOutput::default();
        processor.prepare(&tx, &mut out)?;

        let mut token = None;
        let mut closed = false;
        for element in reader.by_ref() {
            let element = element?;
            if let Some((op, cells)) = element.as_row() {
                processor.apply(&tx, op, cells, &mut out)?;
                continue;
            }
            match element {
                FeedElement::SyncId { token: next } => token = Some(next),
                FeedElement::End => {
                    closed = true;
                    break;
                }
                FeedElement::Error { message } => {
                    tracing::warn!(table = %table.name, %message, "server reported an error");
                    return Err(SyncError::Remote(message));
                }
                other => {
                    return Err(SyncError::Protocol(format!(
                        "unexpected {} inside batch for {}",
                        other.name(),
                        table.name
                    )))
                }
            }
        }
        if !closed {
            return Err(SyncError::Protocol(format!(
                "feed ended inside batch for {}",
                table.name
            )));
        }

        processor.clean(&tx, &mut out)?;
        if let Some(token) = &token {
            tx.set_sync_token(&table.name, token.as_deref())?;
        }
        tx.commit()?;

        tracing::debug!(
            table = %table.name,
            full,
            rows = out.rows,
            events = out.events.len(),
            "applied batch"
        );

        report.batches += 1;
        report.rows_applied += out.rows;
        for event in &out.events {
            self.bus.publish(event);
        }
        report.events_published += out.events.len();
        if out.changed {
            self.bus.publish(&ChangeEvent::table_changed(Arc::clone(&table)));
            report.events_published += 1;
            report.note_changed(&table.name);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::RowOp;
    use crate::transport::memory::MemoryRemote;
    use masterdata_core::{ChangeKind, RowKey, Subscription, TagEdit, TagOp, Value};
    use std::sync::mpsc;
    use tempfile::TempDir;

    const SCHEMA: &str = r#"{
        "version": "1",
        "tables": [
            {
                "name": "Bar",
                "use_as_key": "Code",
                "track_refresh": true,
                "columns": [
                    { "name": "Id", "type": "integer", "primary": true },
                    { "name": "Code", "type": "text", "unique": true },
                    { "name": "Name", "type": "text" }
                ]
            },
            {
                "name": "ObjectTags",
                "columns": [
                    { "name": "ObjectId", "type": "integer", "primary": true },
                    { "name": "Tag", "type": "text", "primary": true }
                ]
            }
        ]
    }"#;

    fn remote() -> Arc<MemoryRemote> {
        let remote = Arc::new(MemoryRemote::new());
        remote.set_schema(SCHEMA, Some(100));
        remote
    }

    fn engine_on(store: Arc<LocalStore>, remote: &Arc<MemoryRemote>, config: SyncConfig) -> SyncEngine {
        SyncEngine::new(
            store,
            Arc::clone(remote) as Arc<dyn RemoteSource>,
            Arc::new(ChangeBus::new()),
            config.with_tag_table(TagTableConfig::default()),
        )
    }

    fn engine(remote: &Arc<MemoryRemote>) -> SyncEngine {
        engine_on(
            Arc::new(LocalStore::open_memory().unwrap()),
            remote,
            SyncConfig::default(),
        )
    }

    fn batch(table: &str, full: bool) -> FeedElement {
        FeedElement::Batch {
            table: table.into(),
            full,
        }
    }

    fn bar(op: RowOp, id: i64, code: &str, name: &str) -> FeedElement {
        FeedElement::row(
            op,
            vec![
                Value::Integer(id),
                Value::Text(code.into()),
                Value::Text(name.into()),
            ],
        )
    }

    fn syncid(token: &str) -> FeedElement {
        FeedElement::SyncId {
            token: Some(token.into()),
        }
    }

    fn completed(outcome: SyncOutcome) -> SyncReport {
        match outcome {
            SyncOutcome::Completed(report) => report,
            SyncOutcome::Deferred => panic!("run was deferred"),
        }
    }

    fn bar_rows(engine: &SyncEngine) -> Vec<(i64, String, String)> {
        engine
            .store()
            .read()
            .query_map(
                r#"SELECT "Id", "Code", "Name" FROM "Bar" ORDER BY "Id""#,
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap()
    }

    type Seen = Arc<Mutex<Vec<ChangeEvent>>>;

    fn collect(engine: &SyncEngine, table: &str, key: Option<RowKey>) -> (Subscription, Seen) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let token = engine.bus().subscribe(table, key, move |event| {
            sink.lock().unwrap().push(event.clone());
        });
        (token, seen)
    }

    fn initial_feed() -> Vec<FeedElement> {
        vec![
            batch("Bar", true),
            bar(RowOp::Refresh, 1, "A", "alpha"),
            bar(RowOp::Refresh, 2, "B", "beta"),
            syncid("t1"),
            FeedElement::End,
            FeedElement::SyncStamp { stamp: 500 },
        ]
    }

    #[test]
    fn test_first_run_applies_schema_and_feed() {
        let remote = remote();
        let engine = engine(&remote);
        remote.push_elements(&initial_feed()).unwrap();

        let report = completed(engine.run_synchronization(false).unwrap());

        assert!(report.schema_updated);
        assert!(report.schema_statements > 0);
        assert_eq!(report.batches, 1);
        assert_eq!(report.rows_applied, 2);
        assert_eq!(report.sync_stamp, Some(500));
        assert_eq!(
            bar_rows(&engine),
            vec![
                (1, "A".to_string(), "alpha".to_string()),
                (2, "B".to_string(), "beta".to_string()),
            ]
        );

        let read = engine.store().read();
        assert_eq!(read.sync_token("Bar").unwrap().as_deref(), Some("t1"));
        let header = read.header().unwrap();
        assert_eq!(header.last_sync_stamp, Some(500));
        assert_eq!(header.schema_timestamp, Some(100));

        let request = &remote.requests()[0];
        assert_eq!(request.protocol_version, PROTOCOL_VERSION);
        assert!(request.tokens.is_empty());
        assert_eq!(request.tables, vec!["Bar".to_string(), "ObjectTags".to_string()]);
    }

    #[test]
    fn test_reapplying_the_same_feed_is_idempotent() {
        let remote = remote();
        let engine = engine(&remote);
        remote.push_elements(&initial_feed()).unwrap();
        completed(engine.run_synchronization(false).unwrap());
        let before = bar_rows(&engine);

        remote.push_elements(&initial_feed()).unwrap();
        let (_token, seen) = collect(&engine, "Bar", None);
        let report = completed(engine.run_synchronization(false).unwrap());

        assert!(!report.schema_updated);
        assert_eq!(remote.schema_fetches(), 1);
        assert_eq!(bar_rows(&engine), before);
        assert!(seen
            .lock()
            .unwrap()
            .iter()
            .all(|e| e.kind != ChangeKind::RowDelete && e.kind != ChangeKind::RowInsert));

        let request = &remote.requests()[1];
        assert_eq!(request.tokens.get("Bar").map(String::as_str), Some("t1"));
        assert_eq!(request.last_sync_stamp, Some(500));
    }

    #[test]
    fn test_full_refresh_deletes_only_unsent_rows() {
        let remote = remote();
        let engine = engine(&remote);
        remote
            .push_elements(&[
                batch("Bar", true),
                bar(RowOp::Refresh, 1, "A", "a"),
                bar(RowOp::Refresh, 2, "B", "b"),
                bar(RowOp::Refresh, 3, "C", "c"),
                bar(RowOp::Refresh, 4, "D", "d"),
                FeedElement::End,
            ])
            .unwrap();
        completed(engine.run_synchronization(false).unwrap());

        remote
            .push_elements(&[
                batch("Bar", true),
                bar(RowOp::Refresh, 1, "A", "a"),
                bar(RowOp::Refresh, 2, "B", "b"),
                bar(RowOp::Refresh, 3, "C", "c"),
                FeedElement::End,
            ])
            .unwrap();
        let (_token, seen) = collect(&engine, "Bar", None);
        completed(engine.run_synchronization(false).unwrap());

        let seen = seen.lock().unwrap();
        let deletes: Vec<_> = seen
            .iter()
            .filter(|e| e.kind == ChangeKind::RowDelete)
            .collect();
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].key, Some(RowKey::Text("D".into())));
        assert_eq!(seen.last().map(|e| e.kind), Some(ChangeKind::TableChanged));
        assert_eq!(bar_rows(&engine).len(), 3);
    }

    #[test]
    fn test_virtual_key_rename_reaches_old_key_subscriber() {
        let remote = remote();
        let engine = engine(&remote);
        remote.push_elements(&initial_feed()).unwrap();
        completed(engine.run_synchronization(false).unwrap());

        remote
            .push_elements(&[
                batch("Bar", false),
                bar(RowOp::Update, 1, "Z", "alpha"),
                FeedElement::End,
            ])
            .unwrap();
        let (_token, seen) = collect(&engine, "Bar", Some(RowKey::Text("A".into())));
        completed(engine.run_synchronization(false).unwrap());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, ChangeKind::RowUpdate);
        assert_eq!(seen[0].key, Some(RowKey::Text("Z".into())));
        assert_eq!(seen[0].old_key, Some(RowKey::Text("A".into())));
        assert_eq!(bar_rows(&engine)[0].1, "Z");
    }

    #[test]
    fn test_error_element_keeps_committed_batches() {
        let remote = remote();
        let engine = engine(&remote);
        remote
            .push_elements(&[
                batch("Bar", false),
                bar(RowOp::Insert, 1, "A", "a"),
                FeedElement::End,
                batch("Bar", false),
                bar(RowOp::Insert, 2, "B", "b"),
                FeedElement::Error {
                    message: "boom".into(),
                },
            ])
            .unwrap();

        match engine.run_synchronization(false) {
            Err(SyncError::Remote(message)) => assert_eq!(message, "boom"),
            other => panic!("expected remote error, got {other:?}"),
        }
        assert_eq!(bar_rows(&engine).len(), 1);
    }

    #[test]
    fn test_malformed_feed_is_a_protocol_error() {
        let remote = remote();
        let engine = engine(&remote);
        remote.push_response("{\"el\":\"batch\",\"table\":\"Bar\"}\nnot json\n");

        assert!(matches!(
            engine.run_synchronization(false),
            Err(SyncError::Protocol(_))
        ));
        assert!(bar_rows(&engine).is_empty());

        remote.push_elements(&[batch("Nope", false), FeedElement::End]).unwrap();
        assert!(matches!(
            engine.run_synchronization(false),
            Err(SyncError::Protocol(_))
        ));
    }

    #[test]
    fn test_busy_store_defers_or_fails_when_enforced() {
        let remote = remote();
        let engine = engine_on(
            Arc::new(LocalStore::open_memory().unwrap()),
            &remote,
            SyncConfig::default()
                .with_batch_timeout(Duration::from_millis(20))
                .with_enforce_timeout(Duration::from_millis(50)),
        );
        let (held_tx, held_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        thread::scope(|scope| {
            let store = Arc::clone(engine.store());
            scope.spawn(move || {
                let tx = store.begin_write(Wait::NoWait).unwrap().unwrap();
                held_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                tx.commit().unwrap();
            });
            held_rx.recv().unwrap();

            assert_eq!(engine.run_synchronization(false).unwrap(), SyncOutcome::Deferred);
            assert!(matches!(
                engine.run_synchronization(true),
                Err(SyncError::Contention)
            ));
            release_tx.send(()).unwrap();
        });

        assert!(!engine.run_synchronization(false).unwrap().is_deferred());
    }

    #[test]
    fn test_recursive_run_from_handler_is_rejected() {
        let remote = remote();
        let engine = Arc::new(engine(&remote));
        remote.push_elements(&initial_feed()).unwrap();

        let nested = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&nested);
        let weak = Arc::downgrade(&engine);
        let _token = engine.bus().subscribe("Bar", None, move |_| {
            if let Some(engine) = weak.upgrade() {
                let recursion = matches!(
                    engine.run_synchronization(false),
                    Err(SyncError::Recursion)
                );
                sink.lock().unwrap().push(recursion);
            }
        });

        completed(engine.run_synchronization(false).unwrap());
        let nested = nested.lock().unwrap();
        assert!(!nested.is_empty());
        assert!(nested.iter().all(|recursion| *recursion));
    }

    #[test]
    fn test_restart_uses_persisted_schema() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("replica.db");
        let remote = remote();

        {
            let engine = engine_on(
                Arc::new(LocalStore::open(&path).unwrap()),
                &remote,
                SyncConfig::default(),
            );
            remote.push_elements(&initial_feed()).unwrap();
            completed(engine.run_synchronization(false).unwrap());
        }

        let engine = engine_on(
            Arc::new(LocalStore::open(&path).unwrap()),
            &remote,
            SyncConfig::default(),
        );
        let schema = engine.load_persisted_schema().unwrap().unwrap();
        assert!(schema.get("bar").is_some());

        let report = completed(engine.run_synchronization(false).unwrap());
        assert!(!report.schema_updated);
        assert_eq!(remote.schema_fetches(), 1);
        assert_eq!(bar_rows(&engine).len(), 2);
    }

    #[test]
    fn test_newer_remote_schema_is_reapplied() {
        let remote = remote();
        let engine = engine(&remote);
        completed(engine.run_synchronization(false).unwrap());

        remote.set_schema(SCHEMA.replace("\"Name\"", "\"Title\""), Some(200));
        let (_token, seen) = collect(&engine, "Bar", None);
        let report = completed(engine.run_synchronization(false).unwrap());

        assert!(report.schema_updated);
        assert_eq!(report.tables_changed, vec!["Bar".to_string()]);
        assert_eq!(seen.lock().unwrap()[0].kind, ChangeKind::TableChanged);
        assert_eq!(remote.schema_fetches(), 2);
        assert!(engine
            .schema()
            .unwrap()
            .unwrap()
            .get("Bar")
            .unwrap()
            .column("Title")
            .is_some());
    }

    #[test]
    fn test_restamped_identical_schema_skips_reconcile() {
        let remote = remote();
        let engine = engine(&remote);
        completed(engine.run_synchronization(false).unwrap());

        remote.set_schema(SCHEMA, Some(300));
        let (_token, seen) = collect(&engine, "Bar", None);
        let report = completed(engine.run_synchronization(false).unwrap());

        assert_eq!(remote.schema_fetches(), 2);
        assert!(!report.schema_updated);
        assert_eq!(report.schema_statements, 0);
        assert!(seen.lock().unwrap().is_empty());
        let header = engine.store().read().header().unwrap();
        assert_eq!(header.schema_timestamp, Some(300));
        assert_eq!(header.schema_hash, Some(schema_hash(SCHEMA)));
    }

    #[test]
    fn test_tag_edits_are_pushed_then_cleared() {
        let remote = remote();
        let engine = engine(&remote);
        {
            let tx = engine.store().begin_write(Wait::NoWait).unwrap().unwrap();
            tx.queue_tag_edit(&TagEdit {
                object_key: "7".into(),
                tag: "red".into(),
                op: TagOp::Add,
            })
            .unwrap();
            tx.commit().unwrap();
        }

        let report = completed(engine.run_synchronization(false).unwrap());

        assert_eq!(report.tag_edits_pushed, 1);
        assert_eq!(remote.requests()[0].tag_edits.len(), 1);
        assert!(engine.store().read().pending_tag_edits().unwrap().is_empty());
    }

    #[test]
    fn test_tag_batch_uses_tag_processor() {
        let remote = remote();
        let engine = engine(&remote);
        remote
            .push_elements(&[
                batch("ObjectTags", false),
                FeedElement::row(
                    RowOp::Insert,
                    vec![Value::Integer(7), Value::Text("red;blue".into())],
                ),
                FeedElement::End,
            ])
            .unwrap();

        completed(engine.run_synchronization(false).unwrap());

        let count: i64 = engine
            .store()
            .read()
            .query_row(r#"SELECT COUNT(*) FROM "ObjectTags""#, [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }
}
