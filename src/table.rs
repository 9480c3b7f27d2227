//! Sorted key-value table abstraction
//!
//! The engine stores every posting-list chunk as one entry in a table sorted
//! lexicographically by key. [`SortedTable`] is the seam to a real backend;
//! [`RamTable`] is the in-memory implementation used by tests and small
//! indexes. [`TableCursor`] layers the positioning protocol the engine needs
//! (find-or-floor, step, delete-and-step) over the trait's primitives.
//!
//! Tables are single-writer: mutation methods take `&self` and
//! implementations provide interior mutability, so readers and the writer
//! can share one handle behind an `Arc`, but callers must serialize writes.

use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::RwLock;

use crate::error::{Error, Result};

/// A byte-keyed table sorted lexicographically by key.
pub trait SortedTable {
    /// The value stored under `key`, if any.
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Insert or replace the entry under `key`.
    fn add(&self, key: &[u8], value: &[u8]);

    /// Remove the entry under `key`; true if it existed.
    fn del(&self, key: &[u8]) -> bool;

    /// The greatest key less than or equal to `key`.
    fn floor_key(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// The smallest key strictly greater than `key`.
    fn next_key(&self, key: &[u8]) -> Option<Vec<u8>>;

    fn key_exists(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    BeforeBegin,
    At,
    AfterEnd,
}

/// Cursor over a [`SortedTable`].
///
/// The cursor holds no reference to the table; every method threads the
/// table handle explicitly. The current value is only populated by
/// [`TableCursor::read_tag`], mirroring tables that fetch values lazily.
#[derive(Debug, Clone)]
pub struct TableCursor {
    position: Position,
    current_key: Vec<u8>,
    current_value: Vec<u8>,
}

impl Default for TableCursor {
    fn default() -> Self {
        Self::new()
    }
}

impl TableCursor {
    pub fn new() -> Self {
        Self {
            position: Position::BeforeBegin,
            current_key: Vec::new(),
            current_value: Vec::new(),
        }
    }

    /// Position at `key` if present, else at the greatest key before it.
    /// Returns true on an exact match. When no key at or before `key`
    /// exists the cursor parks before the first entry.
    pub fn find_entry<T: SortedTable + ?Sized>(&mut self, table: &T, key: &[u8]) -> bool {
        self.current_value.clear();
        match table.floor_key(key) {
            Some(found) => {
                let exact = found == key;
                self.current_key = found;
                self.position = Position::At;
                exact
            }
            None => {
                self.current_key.clear();
                self.position = Position::BeforeBegin;
                false
            }
        }
    }

    /// Step to the next entry in key order.
    pub fn next<T: SortedTable + ?Sized>(&mut self, table: &T) {
        self.current_value.clear();
        let from: &[u8] = match self.position {
            Position::BeforeBegin => &[],
            Position::At => &self.current_key,
            Position::AfterEnd => return,
        };
        match table.next_key(from) {
            Some(key) => {
                self.current_key = key;
                self.position = Position::At;
            }
            None => {
                self.current_key.clear();
                self.position = Position::AfterEnd;
            }
        }
    }

    pub fn after_end(&self) -> bool {
        self.position == Position::AfterEnd
    }

    /// True when the cursor rests on an entry.
    pub fn is_positioned(&self) -> bool {
        self.position == Position::At
    }

    pub fn current_key(&self) -> &[u8] {
        debug_assert!(self.is_positioned());
        &self.current_key
    }

    pub fn current_value(&self) -> &[u8] {
        &self.current_value
    }

    /// Fetch the value for the current entry.
    pub fn read_tag<T: SortedTable + ?Sized>(&mut self, table: &T) -> Result<()> {
        debug_assert!(self.is_positioned());
        self.current_value = table
            .get(&self.current_key)
            .ok_or_else(|| Error::Corruption("cursor entry vanished from the table".to_string()))?;
        Ok(())
    }

    /// Delete the current entry and step to the next one; true while the
    /// cursor still rests on an entry afterwards.
    pub fn del<T: SortedTable + ?Sized>(&mut self, table: &T) -> bool {
        if self.is_positioned() {
            table.del(&self.current_key);
        }
        self.next(table);
        self.is_positioned()
    }
}

/// In-memory [`SortedTable`] backed by a `BTreeMap`.
#[derive(Debug, Default)]
pub struct RamTable {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl RamTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// All keys in sorted order.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.entries.read().keys().cloned().collect()
    }
}

impl SortedTable for RamTable {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.entries.read().get(key).cloned()
    }

    fn add(&self, key: &[u8], value: &[u8]) {
        self.entries.write().insert(key.to_vec(), value.to_vec());
    }

    fn del(&self, key: &[u8]) -> bool {
        self.entries.write().remove(key).is_some()
    }

    fn floor_key(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.entries
            .read()
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .map(|(k, _)| k.clone())
    }

    fn next_key(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.entries
            .read()
            .range::<[u8], _>((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.clone())
    }
}
