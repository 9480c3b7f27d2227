//! Postern - chunked posting-list storage for a full-text search index
//!
//! For every indexed term the engine stores the sorted list of documents
//! containing it, with per-document term frequencies, as variable-sized
//! chunks under ordered keys in a sorted key-value table. A distinguished
//! list keyed by the empty term maps every document to its length using a
//! dense encoding with interleaved fixed-width runs.
//!
//! This library provides:
//! - Varint and sort-preserving byte codecs shared by keys and chunk bodies
//! - Chunk framing with list aggregates carried by the first chunk
//! - Sequential and skip/seek cursors spanning chunk chains
//! - Incremental batch updates that split, splice, and re-key chunks while
//!   keeping the chain invariants intact
//! - A pluggable sorted-table backend with an in-memory implementation

pub mod chunk;
pub mod codec;
pub mod doclen;
pub mod error;
pub mod postchunk;
pub mod postlist;
pub mod store;
pub mod table;

pub use error::{Error, Result};
pub use postlist::PostList;
pub use store::{PostListTable, PostingChanges};
pub use table::{RamTable, SortedTable, TableCursor};

/// Document identifier; strictly positive for real documents.
pub type DocId = u32;

/// Within-document frequency of a term, or a document length.
pub type TermCount = u32;

/// Number of documents, as in a term's termfreq.
pub type DocCount = u32;

/// Sentinel wdf/doclen in a change set meaning the entry is deleted.
pub const TOMBSTONE: TermCount = u32::MAX;
