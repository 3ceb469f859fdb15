//! Remote source abstraction.
//!
//! The engine talks to the server through [`RemoteSource`]. The production
//! implementation (HTTP with conditional requests and credentials) lives in
//! the host application; [`memory::MemoryRemote`] serves tests and offline
//! embedding.

use std::io::BufRead;

use crate::error::Result;
use crate::feed::SyncRequest;

/// The remote schema document with its last-modified stamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSchema {
    pub content: String,
    pub modified: Option<i64>,
}

/// Server side of the synchronization protocol.
///
/// Implementations must be thread-safe (Send + Sync). Calls block; the
/// engine runs on the caller's thread because its transactions are bound to
/// that thread.
pub trait RemoteSource: Send + Sync {
    /// Cheap probe: last-modified stamp of the remote schema, if known.
    fn schema_modified(&self) -> Result<Option<i64>>;

    /// Download the full schema document.
    fn fetch_schema(&self) -> Result<RemoteSchema>;

    /// Send the client's state and open the change feed.
    fn exchange(&self, request: &SyncRequest) -> Result<Box<dyn BufRead + Send>>;
}

/// In-memory remote for tests.
pub mod memory {
    use super::*;
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::sync::Mutex;

    use crate::error::SyncError;
    use crate::feed::{feed_to_string, FeedElement};

    #[derive(Default)]
    struct State {
        schema: Option<RemoteSchema>,
        responses: VecDeque<String>,
        requests: Vec<SyncRequest>,
        schema_fetches: usize,
    }

    /// Remote that serves a fixed schema and queued feed responses.
    ///
    /// Each `exchange` pops the next queued response; with none queued it
    /// answers with an empty feed.
    #[derive(Default)]
    pub struct MemoryRemote {
        state: Mutex<State>,
    }

    impl MemoryRemote {
        pub fn new() -> Self {
            Self::default()
        }

        /// Publish a schema document.
        pub fn set_schema(&self, content: impl Into<String>, modified: Option<i64>) {
            if let Ok(mut state) = self.state.lock() {
                state.schema = Some(RemoteSchema {
                    content: content.into(),
                    modified,
                });
            }
        }

        /// Queue a raw feed response.
        pub fn push_response(&self, feed: impl Into<String>) {
            if let Ok(mut state) = self.state.lock() {
                state.responses.push_back(feed.into());
            }
        }

        /// Queue a response built from elements.
        pub fn push_elements(&self, elements: &[FeedElement]) -> Result<()> {
            self.push_response(feed_to_string(elements)?);
            Ok(())
        }

        /// Requests received so far.
        pub fn requests(&self) -> Vec<SyncRequest> {
            self.state
                .lock()
                .map(|state| state.requests.clone())
                .unwrap_or_default()
        }

        /// Number of full schema downloads served.
        pub fn schema_fetches(&self) -> usize {
            self.state.lock().map(|s| s.schema_fetches).unwrap_or_default()
        }
    }

    impl RemoteSource for MemoryRemote {
        fn schema_modified(&self) -> Result<Option<i64>> {
            let state = self.state.lock()?;
            Ok(state.schema.as_ref().and_then(|s| s.modified))
        }

        fn fetch_schema(&self) -> Result<RemoteSchema> {
            let mut state = self.state.lock()?;
            let schema = state
                .schema
                .clone()
                .ok_or_else(|| SyncError::Transport("no schema published".into()))?;
            state.schema_fetches += 1;
            Ok(schema)
        }

        fn exchange(&self, request: &SyncRequest) -> Result<Box<dyn BufRead + Send>> {
            let mut state = self.state.lock()?;
            state.requests.push(request.clone());
            let body = state.responses.pop_front().unwrap_or_default();
            Ok(Box::new(Cursor::new(body.into_bytes())))
        }
    }

}
