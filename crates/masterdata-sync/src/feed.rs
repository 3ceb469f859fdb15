//! Change-feed wire format.
//!
//! The server answers a [`SyncRequest`] with a stream of newline-delimited
//! JSON elements, each tagged by its `"el"` field:
//!
//! ```text
//! {"el":"batch","table":"Bar","full":true}
//! {"el":"r","cells":[[0,1],[1,"A"]]}
//! {"el":"syncid","token":"118"}
//! {"el":"end"}
//! {"el":"syncStamp","stamp":1700000000}
//! ```
//!
//! A row carries positional cells: `[slot, value]`, where the slot indexes
//! the table's data columns in definition order.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};

use masterdata_core::{TagEdit, Value};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// One positional column value of a feed row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell(pub usize, pub Value);

/// What a feed row asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOp {
    /// Row re-sent during a full refresh.
    Refresh,
    Insert,
    Update,
    Delete,
}

/// A single element of the change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "el")]
pub enum FeedElement {
    /// Opens a batch of rows for one table.
    #[serde(rename = "batch")]
    Batch {
        table: String,
        #[serde(default)]
        full: bool,
    },

    #[serde(rename = "r")]
    Refresh { cells: Vec<Cell> },

    #[serde(rename = "i")]
    Insert { cells: Vec<Cell> },

    #[serde(rename = "u")]
    Update { cells: Vec<Cell> },

    #[serde(rename = "d")]
    Delete { cells: Vec<Cell> },

    /// New change token for the batch's table; `null` clears it.
    #[serde(rename = "syncid")]
    SyncId {
        #[serde(default)]
        token: Option<String>,
    },

    /// Closes the current batch.
    #[serde(rename = "end")]
    End,

    /// Server time of this synchronization, stored after all batches.
    #[serde(rename = "syncStamp")]
    SyncStamp { stamp: i64 },

    /// Server-side failure; aborts the run.
    #[serde(rename = "error")]
    Error { message: String },
}

impl FeedElement {
    /// The row operation and cells, for row elements.
    pub fn as_row(&self) -> Option<(RowOp, &[Cell])> {
        match self {
            FeedElement::Refresh { cells } => Some((RowOp::Refresh, cells)),
            FeedElement::Insert { cells } => Some((RowOp::Insert, cells)),
            FeedElement::Update { cells } => Some((RowOp::Update, cells)),
            FeedElement::Delete { cells } => Some((RowOp::Delete, cells)),
            _ => None,
        }
    }

    /// Build a row element from values laid out in slot order.
    pub fn row(op: RowOp, values: impl IntoIterator<Item = Value>) -> Self {
        let cells = values
            .into_iter()
            .enumerate()
            .map(|(slot, value)| Cell(slot, value))
            .collect();
        match op {
            RowOp::Refresh => FeedElement::Refresh { cells },
            RowOp::Insert => FeedElement::Insert { cells },
            RowOp::Update => FeedElement::Update { cells },
            RowOp::Delete => FeedElement::Delete { cells },
        }
    }

    /// Element name as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            FeedElement::Batch { .. } => "batch",
            FeedElement::Refresh { .. } => "r",
            FeedElement::Insert { .. } => "i",
            FeedElement::Update { .. } => "u",
            FeedElement::Delete { .. } => "d",
            FeedElement::SyncId { .. } => "syncid",
            FeedElement::End => "end",
            FeedElement::SyncStamp { .. } => "syncStamp",
            FeedElement::Error { .. } => "error",
        }
    }
}

/// The client's known state, sent to the server to request a feed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub protocol_version: u32,
    pub last_sync_stamp: Option<i64>,
    /// Tables the client replicates.
    pub tables: Vec<String>,
    /// Last applied change token per table. Tables without a token get a
    /// full refresh.
    pub tokens: BTreeMap<String, String>,
    /// Locally authored tag edits not yet accepted by the server.
    #[serde(default)]
    pub tag_edits: Vec<TagEdit>,
}

/// Streaming parser over a newline-delimited feed.
///
/// Blank lines are skipped. A line that does not parse is reported as a
/// [`SyncError::Protocol`] carrying its line number.
pub struct FeedReader<R> {
    reader: R,
    line: usize,
    buf: String,
}

impl<R: BufRead> FeedReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: 0,
            buf: String::new(),
        }
    }

    /// Number of lines consumed so far.
    pub fn line(&self) -> usize {
        self.line
    }
}

impl<R: BufRead> Iterator for FeedReader<R> {
    type Item = Result<FeedElement>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.reader.read_line(&mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {
                    self.line += 1;
                    let text = self.buf.trim();
                    if text.is_empty() {
                        continue;
                    }
                    return Some(serde_json::from_str(text).map_err(|e| {
                        SyncError::Protocol(format!("line {}: {}", self.line, e))
                    }));
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

/// Write elements in feed format.
pub fn write_feed<W: Write>(mut writer: W, elements: &[FeedElement]) -> Result<()> {
    for element in elements {
        serde_json::to_writer(&mut writer, element)?;
        writer.write_all(b"\n")?;
    }
    Ok(())
}

/// Render elements as a feed string.
pub fn feed_to_string(elements: &[FeedElement]) -> Result<String> {
    let mut out = Vec::new();
    write_feed(&mut out, elements)?;
    String::from_utf8(out).map_err(|e| SyncError::Protocol(e.to_string()))
}
