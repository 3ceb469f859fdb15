//! Change bus: synchronous fan-out of [`ChangeEvent`]s to weakly held
//! subscribers.
//!
//! The bus never keeps a subscriber alive. [`ChangeBus::subscribe`] hands
//! back a [`Subscription`] token that owns the handler; the bus only holds a
//! `Weak` to it. Callers own unsubscription: keep the token for as long as
//! events are wanted, then drop it or pass it to [`ChangeBus::unsubscribe`].
//! Dead entries are compacted in place while publishing.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::event::ChangeEvent;
use crate::types::RowKey;

type Handler = dyn Fn(&ChangeEvent) + Send + Sync;

struct Record {
    id: u64,
    table: String,
    key: Option<RowKey>,
    handler: Box<Handler>,
}

impl Record {
    fn matches(&self, event: &ChangeEvent) -> bool {
        if !event.table.is_named(&self.table) {
            return false;
        }
        match &self.key {
            None => true,
            Some(key) => event.prior_key() == Some(key),
        }
    }
}

/// Token returned by [`ChangeBus::subscribe`]. Dropping it ends the
/// subscription.
pub struct Subscription {
    record: Arc<Record>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.record.id
    }

    pub fn table(&self) -> &str {
        &self.record.table
    }

    pub fn key(&self) -> Option<&RowKey> {
        self.record.key.as_ref()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.record.id)
            .field("table", &self.record.table)
            .field("key", &self.record.key)
            .finish()
    }
}

/// Publisher owning the subscriber list.
#[derive(Default)]
pub struct ChangeBus {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Weak<Record>>>,
}

impl ChangeBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<Weak<Record>>> {
        // A panicking handler never runs under this lock, so the list
        // itself cannot be left half-updated.
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to events on `table`, optionally only those concerning the
    /// row whose prior key equals `key`.
    pub fn subscribe<F>(&self, table: &str, key: Option<RowKey>, handler: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let record = Arc::new(Record {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            table: table.to_string(),
            key,
            handler: Box::new(handler),
        });
        self.subscribers().push(Arc::downgrade(&record));
        Subscription { record }
    }

    /// End a subscription immediately and remove its entry.
    pub fn unsubscribe(&self, subscription: Subscription) {
        let id = subscription.id();
        drop(subscription);
        self.subscribers()
            .retain(|weak| weak.upgrade().map_or(false, |record| record.id != id));
    }

    /// Deliver `event` synchronously to every matching live subscriber, in
    /// subscription order. Returns the number of handlers invoked.
    ///
    /// Handlers run after the list lock is released, so they may subscribe,
    /// unsubscribe or publish themselves.
    pub fn publish(&self, event: &ChangeEvent) -> usize {
        let mut matched = Vec::new();
        self.subscribers().retain(|weak| match weak.upgrade() {
            Some(record) => {
                if record.matches(event) {
                    matched.push(record);
                }
                true
            }
            None => false,
        });

        tracing::trace!(
            table = %event.table.name,
            kind = ?event.kind,
            handlers = matched.len(),
            "publishing change event"
        );

        for record in &matched {
            (record.handler)(event);
        }
        matched.len()
    }

    /// Number of entries currently held, live or not yet compacted.
    pub fn len(&self) -> usize {
        self.subscribers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ChangeBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeBus")
            .field("subscribers", &self.len())
            .finish()
    }
}
