//! Thread-affine transaction manager.
//!
//! The store has one physical connection and at most one physical
//! transaction. The manager hands out [`Transaction`] handles that all
//! funnel into that single physical transaction:
//!
//! - **Root**: created by the first writer. Begins the physical transaction
//!   and is bound to the creating thread.
//! - **Nested**: any further write request from the owning thread. Shares the
//!   root's physical transaction; only adjusts the reference count.
//! - **Joined**: lets one other thread participate in the root, when handed a
//!   [`JoinTarget`] by the owner. Further requests from that thread nest onto
//!   the joined slot.
//! - **ReadOnly**: `ReadUncommitted` requests. Reads the live connection with
//!   no isolation and never blocks.
//!
//! Any other thread asking for a write transaction waits on a gate that is
//! signalled when the root disposes. Waiters are served in arrival order.
//! A wait that times out or is cancelled yields `Ok(None)`: the store is
//! busy, the unit of work should be retried later.
//!
//! The root commits or rolls back physically only once every handle sharing
//! it has been released. Handles are `!Send`, so a handle can never leave the
//! thread it was created on.

use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use rusqlite::{Connection, OptionalExtension, Params, Row};

use crate::error::{Result, StoreError};
use crate::sql::quote_ident;

/// Upper bound on a single wait slice, so cancellation is noticed promptly.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Requested isolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Dirty reads on the live connection; never blocks, never writes.
    ReadUncommitted,
    /// The local store has no true read-committed mode; treated as `Write`.
    ReadCommitted,
    Write,
}

/// How long a write request may wait for another thread's root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    NoWait,
    Timeout(Duration),
    Forever,
}

/// Cooperative cancellation flag for blocking waits.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Token the owner of a root hands to another thread so that thread can
/// join the root instead of waiting for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinTarget {
    root_id: u64,
}

/// Compensating action run when the root rolls back.
pub type RollbackAction = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// Role of a [`Transaction`] handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    ReadOnly,
    Root,
    Nested,
    Joined,
}

/// Counters exposed for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionStats {
    /// Physical commits performed.
    pub commits: u64,
    /// Physical rollbacks performed.
    pub rollbacks: u64,
    /// Id of the live root, if any.
    pub active_root: Option<u64>,
}

struct JoinedSlot {
    thread: ThreadId,
    refs: usize,
}

struct RootState {
    id: u64,
    owner: ThreadId,
    /// Live handles sharing this root, the root handle included.
    refs: usize,
    joined: Option<JoinedSlot>,
    commit_requested: bool,
    rollback_only: bool,
    actions: Vec<RollbackAction>,
}

impl RootState {
    fn new(id: u64, owner: ThreadId) -> Self {
        Self {
            id,
            owner,
            refs: 1,
            joined: None,
            commit_requested: false,
            rollback_only: false,
            actions: Vec::new(),
        }
    }

    fn admits(&self, thread: ThreadId) -> bool {
        self.owner == thread || self.joined.as_ref().map_or(false, |j| j.thread == thread)
    }
}

#[derive(Default)]
struct ManagerState {
    root: Option<RootState>,
    next_id: u64,
    /// Tickets of threads waiting for the root, in arrival order.
    waiters: VecDeque<u64>,
    next_ticket: u64,
    commits: u64,
    rollbacks: u64,
}

impl ManagerState {
    /// True when a caller holding `ticket` may create the next root.
    fn is_next(&self, ticket: Option<u64>) -> bool {
        self.waiters.front().copied() == ticket || self.waiters.is_empty()
    }

    fn enqueue(&mut self) -> u64 {
        self.next_ticket += 1;
        self.waiters.push_back(self.next_ticket);
        self.next_ticket
    }

    fn dequeue(&mut self, ticket: u64) {
        self.waiters.retain(|&t| t != ticket);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intent {
    Commit,
    Rollback,
    Dispose,
}

/// Owner of the physical connection and arbiter of the physical transaction.
pub struct TransactionManager {
    conn: Mutex<Connection>,
    state: Mutex<ManagerState>,
    gate: Condvar,
}

impl TransactionManager {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            state: Mutex::new(ManagerState::default()),
            gate: Condvar::new(),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, ManagerState>> {
        Ok(self.state.lock()?)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock()?;
        f(&conn)
    }

    /// Begin a transaction.
    ///
    /// Returns `Ok(None)` when the wait for another thread's root timed out
    /// or was cancelled. That is not an error: the caller should skip the
    /// unit of work and retry later.
    pub fn begin(
        &self,
        level: IsolationLevel,
        wait: Wait,
        cancel: Option<&CancelToken>,
        join_to: Option<JoinTarget>,
    ) -> Result<Option<Transaction<'_>>> {
        if level == IsolationLevel::ReadUncommitted {
            return Ok(Some(self.read()));
        }

        let me = thread::current().id();
        let deadline = deadline_of(wait);
        let mut state = self.state()?;
        let mut ticket = None;

        loop {
            if state.root.is_none() && state.is_next(ticket) {
                if let Some(ticket) = ticket {
                    state.dequeue(ticket);
                }
                self.with_conn(|conn| Ok(conn.execute_batch("BEGIN IMMEDIATE")?))?;
                state.next_id += 1;
                let id = state.next_id;
                state.root = Some(RootState::new(id, me));
                tracing::debug!(id, "began root transaction");
                return Ok(Some(Transaction::new(self, TransactionKind::Root, id, false)));
            }

            if let Some(root) = state.root.as_mut() {
                if root.owner == me {
                    root.refs += 1;
                    return Ok(Some(Transaction::new(
                        self,
                        TransactionKind::Nested,
                        root.id,
                        false,
                    )));
                }

                match root.joined.as_mut() {
                    Some(slot) if slot.thread == me => {
                        slot.refs += 1;
                        root.refs += 1;
                        return Ok(Some(Transaction::new(
                            self,
                            TransactionKind::Nested,
                            root.id,
                            true,
                        )));
                    }
                    None if join_to.map_or(false, |t| t.root_id == root.id) => {
                        root.joined = Some(JoinedSlot { thread: me, refs: 1 });
                        root.refs += 1;
                        tracing::debug!(id = root.id, "joined root transaction");
                        return Ok(Some(Transaction::new(
                            self,
                            TransactionKind::Joined,
                            root.id,
                            true,
                        )));
                    }
                    _ => {}
                }
            }

            let queued = match ticket {
                Some(queued) => queued,
                None => *ticket.insert(state.enqueue()),
            };
            let Some(slice) = wait_slice(wait, deadline, cancel) else {
                state.dequeue(queued);
                drop(state);
                // The next waiter in line may now be at the front.
                self.gate.notify_all();
                tracing::debug!("write transaction not created: store busy");
                return Ok(None);
            };
            state = self.gate.wait_timeout(state, slice)?.0;
        }
    }

    /// Read-uncommitted handle on the live connection. Never blocks.
    pub fn read(&self) -> Transaction<'_> {
        Transaction::new(self, TransactionKind::ReadOnly, 0, false)
    }

    /// Wait until no other thread owns a root. Returns `false` on timeout or
    /// cancellation.
    pub fn wait_idle(&self, wait: Wait, cancel: Option<&CancelToken>) -> Result<bool> {
        let me = thread::current().id();
        let deadline = deadline_of(wait);
        let mut state = self.state()?;
        loop {
            match &state.root {
                None => return Ok(true),
                Some(root) if root.admits(me) => return Ok(true),
                Some(_) => {}
            }
            let Some(slice) = wait_slice(wait, deadline, cancel) else {
                return Ok(false);
            };
            state = self.gate.wait_timeout(state, slice)?.0;
        }
    }

    /// True when a thread other than the caller owns the live root.
    pub fn is_busy(&self) -> Result<bool> {
        let me = thread::current().id();
        Ok(self
            .state()?
            .root
            .as_ref()
            .map_or(false, |root| !root.admits(me)))
    }

    pub fn stats(&self) -> Result<TransactionStats> {
        let state = self.state()?;
        Ok(TransactionStats {
            commits: state.commits,
            rollbacks: state.rollbacks,
            active_root: state.root.as_ref().map(|r| r.id),
        })
    }

    fn add_rollback_action(&self, root_id: u64, action: RollbackAction) -> Result<()> {
        let mut state = self.state()?;
        match state.root.as_mut() {
            Some(root) if root.id == root_id => {
                root.actions.push(action);
                Ok(())
            }
            _ => Err(StoreError::TransactionInactive(root_id)),
        }
    }

    fn release(&self, kind: TransactionKind, root_id: u64, joined: bool, intent: Intent) -> Result<()> {
        let mut state = self.state()?;
        let root = match state.root.as_mut() {
            Some(root) if root.id == root_id => root,
            _ => return Err(StoreError::TransactionInactive(root_id)),
        };

        match (intent, kind) {
            (Intent::Commit, TransactionKind::Root) => root.commit_requested = true,
            (Intent::Commit, _) => {}
            (Intent::Rollback, _) => root.rollback_only = true,
            (Intent::Dispose, TransactionKind::Root) => root.rollback_only = true,
            (Intent::Dispose, _) => {}
        }

        if joined {
            if let Some(slot) = root.joined.as_mut() {
                slot.refs -= 1;
                if slot.refs == 0 {
                    root.joined = None;
                }
            }
        }

        root.refs -= 1;
        if root.refs > 0 {
            return Ok(());
        }

        let Some(root) = state.root.take() else {
            return Err(StoreError::TransactionInactive(root_id));
        };
        let commit = root.commit_requested && !root.rollback_only;
        let outcome = self.with_conn(|conn| finish_physical(conn, commit));
        match outcome {
            Ok(true) => state.commits += 1,
            _ => state.rollbacks += 1,
        }
        drop(state);
        self.gate.notify_all();

        match outcome {
            Ok(true) => {
                tracing::debug!(id = root.id, "committed root transaction");
                Ok(())
            }
            Ok(false) => {
                tracing::debug!(id = root.id, actions = root.actions.len(), "rolled back root transaction");
                run_rollback_actions(root.id, root.actions);
                if root.commit_requested && intent == Intent::Commit {
                    Err(StoreError::RollbackOnly(root.id))
                } else {
                    Ok(())
                }
            }
            Err(e) => {
                tracing::warn!(id = root.id, error = %e, "commit failed, rolled back");
                run_rollback_actions(root.id, root.actions);
                Err(e)
            }
        }
    }
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager").finish_non_exhaustive()
    }
}

fn deadline_of(wait: Wait) -> Option<Instant> {
    match wait {
        Wait::Timeout(d) => Some(Instant::now() + d),
        _ => None,
    }
}

/// Length of the next wait slice, or `None` when the caller should give up.
fn wait_slice(wait: Wait, deadline: Option<Instant>, cancel: Option<&CancelToken>) -> Option<Duration> {
    if cancel.map_or(false, CancelToken::is_cancelled) {
        return None;
    }
    match (wait, deadline) {
        (Wait::NoWait, _) => None,
        (Wait::Timeout(_), Some(deadline)) => {
            let now = Instant::now();
            (now < deadline).then(|| (deadline - now).min(POLL_INTERVAL))
        }
        _ => Some(POLL_INTERVAL),
    }
}

/// Commit or roll back the physical transaction. Returns whether it committed.
fn finish_physical(conn: &Connection, commit: bool) -> Result<bool> {
    if commit {
        if let Err(e) = conn.execute_batch("COMMIT") {
            if !conn.is_autocommit() {
                conn.execute_batch("ROLLBACK")?;
            }
            return Err(e.into());
        }
        return Ok(true);
    }
    if !conn.is_autocommit() {
        conn.execute_batch("ROLLBACK")?;
    }
    Ok(false)
}

/// Run compensating actions in registration order. Each failure is logged
/// and swallowed so the remaining actions still run.
fn run_rollback_actions(root_id: u64, actions: Vec<RollbackAction>) {
    for (index, action) in actions.into_iter().enumerate() {
        match catch_unwind(AssertUnwindSafe(action)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(root_id, index, error = %e, "rollback action failed"),
            Err(_) => tracing::warn!(root_id, index, "rollback action panicked"),
        }
    }
}

/// Handle onto the manager's physical transaction.
///
/// Dropping an uncommitted root rolls it back; dropping a nested or joined
/// handle only releases its reference.
pub struct Transaction<'m> {
    manager: &'m TransactionManager,
    kind: TransactionKind,
    root_id: u64,
    joined: bool,
    done: bool,
    _not_send: PhantomData<*const ()>,
}

impl<'m> Transaction<'m> {
    fn new(manager: &'m TransactionManager, kind: TransactionKind, root_id: u64, joined: bool) -> Self {
        Self {
            manager,
            kind,
            root_id,
            joined,
            done: false,
            _not_send: PhantomData,
        }
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    /// Id of the root this handle belongs to (`0` for read-only handles).
    pub fn root_id(&self) -> u64 {
        self.root_id
    }

    pub fn is_write(&self) -> bool {
        self.kind != TransactionKind::ReadOnly
    }

    /// Token another thread can pass to [`TransactionManager::begin`] to join
    /// this transaction's root.
    pub fn join_target(&self) -> Option<JoinTarget> {
        self.is_write().then_some(JoinTarget {
            root_id: self.root_id,
        })
    }

    /// Raw access to the connection. Callers check [`is_write`](Self::is_write)
    /// before anything that writes.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        self.manager.with_conn(f)
    }

    /// Rowid of the most recent successful insert on the connection.
    pub fn last_insert_rowid(&self) -> Result<i64> {
        self.with_conn(|conn| Ok(conn.last_insert_rowid()))
    }

    fn ensure_write(&self) -> Result<()> {
        if self.is_write() {
            Ok(())
        } else {
            Err(StoreError::ReadOnly)
        }
    }

    pub fn execute<P: Params>(&self, sql: &str, params: P) -> Result<usize> {
        self.ensure_write()?;
        self.with_conn(|conn| Ok(conn.execute(sql, params)?))
    }

    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.ensure_write()?;
        self.with_conn(|conn| Ok(conn.execute_batch(sql)?))
    }

    pub fn query_row<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<T>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.with_conn(|conn| Ok(conn.query_row(sql, params, f)?))
    }

    pub fn query_row_optional<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<Option<T>>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.with_conn(|conn| Ok(conn.query_row(sql, params, f).optional()?))
    }

    pub fn query_map<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<Vec<T>>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params, f)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Register a compensating action on the root. Always forwarded to the
    /// root, whichever handle it is called on; ignored on read-only handles.
    pub fn add_rollback_operation<F>(&self, action: F) -> Result<()>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        if !self.is_write() {
            tracing::debug!("rollback operation ignored on read-only transaction");
            return Ok(());
        }
        self.manager.add_rollback_action(self.root_id, Box::new(action))
    }

    /// Next key for a locally created row: `min(pk) - 1` when the minimum is
    /// negative, else `-1`. Local keys never collide with server keys, which
    /// are non-negative.
    pub fn next_local_id(&self, table: &str, primary_key: &str) -> Result<i64> {
        let sql = format!(
            "SELECT MIN({}) FROM {}",
            quote_ident(primary_key),
            quote_ident(table)
        );
        let min: Option<i64> = self.query_row(&sql, [], |row| row.get(0))?;
        Ok(match min {
            Some(min) if min < 0 => min - 1,
            _ => -1,
        })
    }

    /// Commit. On a nested or joined handle this only releases the reference;
    /// the root commits once all references are gone.
    pub fn commit(mut self) -> Result<()> {
        self.finish(Intent::Commit)
    }

    /// Roll back. On a nested or joined handle this marks the root
    /// rollback-only.
    pub fn rollback(mut self) -> Result<()> {
        self.finish(Intent::Rollback)
    }

    fn finish(&mut self, intent: Intent) -> Result<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        if !self.is_write() {
            return Ok(());
        }
        self.manager
            .release(self.kind, self.root_id, self.joined, intent)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.finish(Intent::Dispose) {
            tracing::warn!(root_id = self.root_id, error = %e, "transaction dispose failed");
        }
    }
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("kind", &self.kind)
            .field("root_id", &self.root_id)
            .finish()
    }
}
