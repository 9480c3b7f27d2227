//! Posting-list table facade and batch-update drivers
//!
//! [`PostListTable`] is the engine's public surface: frequency lookups,
//! document-length lookups through a cached doclen cursor, cursor opening,
//! and the two merge drivers that apply batched changes, per-term
//! `(docid, wdf)` edits from the inverter and per-transaction document
//! length updates.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, trace};

use parking_lot::Mutex;

use crate::chunk;
use crate::codec::ByteReader;
use crate::doclen::DoclenChunkWriter;
use crate::error::{Error, Result};
use crate::postchunk::{self, PostlistChunkReader, PostlistChunkWriter};
use crate::postlist::PostList;
use crate::table::{SortedTable, TableCursor};
use crate::{DocCount, DocId, TermCount, TOMBSTONE};

/// Batched changes to one term's posting list.
///
/// `pl_changes` maps docid to the new wdf, with [`TOMBSTONE`] marking a
/// deletion. The frequency deltas are tracked alongside so the first-chunk
/// aggregates can be updated without replaying the edits.
#[derive(Debug, Default)]
pub struct PostingChanges {
    pub tfdelta: i64,
    pub cfdelta: i64,
    pub pl_changes: BTreeMap<DocId, TermCount>,
}

impl PostingChanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a posting for a document that did not have this term.
    pub fn add(&mut self, did: DocId, wdf: TermCount) {
        self.tfdelta += 1;
        self.cfdelta += i64::from(wdf);
        self.pl_changes.insert(did, wdf);
    }

    /// Record removal of an existing posting with the given old wdf.
    pub fn remove(&mut self, did: DocId, old_wdf: TermCount) {
        self.tfdelta -= 1;
        self.cfdelta -= i64::from(old_wdf);
        self.pl_changes.insert(did, TOMBSTONE);
    }

    /// Record a wdf change for an existing posting.
    pub fn update(&mut self, did: DocId, old_wdf: TermCount, new_wdf: TermCount) {
        self.cfdelta += i64::from(new_wdf) - i64::from(old_wdf);
        self.pl_changes.insert(did, new_wdf);
    }

    pub fn is_empty(&self) -> bool {
        self.pl_changes.is_empty() && self.tfdelta == 0 && self.cfdelta == 0
    }
}

/// The posting-list table of a search index.
pub struct PostListTable<T: SortedTable> {
    table: Arc<T>,
    /// Held-open doclen cursor for `get_doclength`/`document_exists`,
    /// invalidated before any doclen mutation.
    doclen_cursor: Mutex<Option<PostList<T>>>,
}

impl<T: SortedTable> PostListTable<T> {
    pub fn new(table: Arc<T>) -> Self {
        Self {
            table,
            doclen_cursor: Mutex::new(None),
        }
    }

    /// The underlying table handle.
    pub fn table(&self) -> &Arc<T> {
        &self.table
    }

    /// Termfreq and collfreq for `term`; `(0, 0)` when absent. Reads only
    /// the first-chunk prefix.
    pub fn get_freqs(&self, term: &[u8]) -> Result<(DocCount, TermCount)> {
        match self.table.get(&chunk::postlist_key(term)) {
            None => Ok((0, 0)),
            Some(value) => {
                let mut r = ByteReader::new(&value);
                let termfreq = r.unpack_uint()?;
                let collfreq = r.unpack_uint()?;
                Ok((termfreq, collfreq))
            }
        }
    }

    /// Length of document `did`, or [`Error::DocNotFound`].
    pub fn get_doclength(&self, did: DocId) -> Result<TermCount> {
        self.with_doclen_cursor(|cursor| {
            if cursor.seek_to(did)? {
                Ok(cursor.wdf())
            } else {
                Err(Error::DocNotFound(did))
            }
        })
    }

    /// Whether document `did` has an entry in the doclen list.
    pub fn document_exists(&self, did: DocId) -> Result<bool> {
        self.with_doclen_cursor(|cursor| cursor.seek_to(did))
    }

    pub fn open_postlist(&self, term: &[u8]) -> Result<PostList<T>> {
        PostList::open(Arc::clone(&self.table), term)
    }

    pub fn open_doclen_list(&self) -> Result<PostList<T>> {
        PostList::open(Arc::clone(&self.table), b"")
    }

    fn with_doclen_cursor<R>(
        &self,
        f: impl FnOnce(&mut PostList<T>) -> Result<R>,
    ) -> Result<R> {
        let mut guard = self.doclen_cursor.lock();
        let mut cursor = match guard.take() {
            Some(cursor) => cursor,
            None => PostList::open(Arc::clone(&self.table), b"")?,
        };
        let result = f(&mut cursor);
        *guard = Some(cursor);
        result
    }

    /// Apply one term's batched posting changes.
    ///
    /// Updates the aggregates in the first-chunk header, then walks the
    /// affected chunks copying unchanged entries through a reader into a
    /// writer while splicing the edits in.
    pub fn merge_changes(&self, term: &[u8], changes: &PostingChanges) -> Result<()> {
        if term.is_empty() {
            return Err(Error::InvalidArgument(
                "the doclen list is updated via merge_doclen_changes".to_string(),
            ));
        }
        if changes.is_empty() {
            return Ok(());
        }
        debug!(
            "merge_changes: term='{}' tfdelta={} cfdelta={} edits={}",
            String::from_utf8_lossy(term),
            changes.tfdelta,
            changes.cfdelta,
            changes.pl_changes.len()
        );
        let table = &*self.table;

        // Update the aggregates in the first chunk, creating or deleting the
        // whole list when the entry count starts from or reaches zero.
        let first_key = chunk::postlist_key(term);
        let value = self.table.get(&first_key);
        let (termfreq, collfreq, first_did, last_did, is_last, header_len) = match &value {
            None => (0, 0, 0, 0, true, 0),
            Some(value) => {
                let mut r = ByteReader::new(value);
                let header = chunk::read_first_chunk_header(&mut r)?;
                let (is_last, last_did) = chunk::read_chunk_header(&mut r, header.first_did)?;
                (
                    header.termfreq,
                    header.collfreq,
                    header.first_did,
                    last_did,
                    is_last,
                    r.pos(),
                )
            }
        };

        let new_termfreq = i64::from(termfreq) + changes.tfdelta;
        if new_termfreq < 0 {
            return Err(Error::Corruption(format!(
                "termfreq for '{}' would go negative",
                String::from_utf8_lossy(term)
            )));
        }
        if new_termfreq == 0 {
            // Every posting is gone: drop all chunks of this term.
            debug!("merge_changes: deleting whole postlist");
            if is_last {
                table.del(&first_key);
                return Ok(());
            }
            let mut cursor = TableCursor::new();
            let found = cursor.find_entry(table, &first_key);
            debug_assert!(found);
            if !found {
                return Ok(());
            }
            while cursor.del(table) {
                if chunk::parse_chunk_key(cursor.current_key(), term)?.is_none() {
                    break;
                }
            }
            return Ok(());
        }
        let new_collfreq = i64::from(collfreq) + changes.cfdelta;
        if new_collfreq < 0 {
            return Err(Error::Corruption(format!(
                "collfreq for '{}' would go negative",
                String::from_utf8_lossy(term)
            )));
        }

        let mut header =
            chunk::make_first_chunk_header(new_termfreq as DocCount, new_collfreq as TermCount, first_did);
        header.extend_from_slice(&chunk::make_chunk_header(is_last, first_did, last_did));
        match value {
            None => table.add(&first_key, &header),
            Some(mut value) => {
                value.splice(0..header_len, header);
                table.add(&first_key, &value);
            }
        }

        // Walk the edits, chunk by chunk.
        let Some((&first_edit, _)) = changes.pl_changes.iter().next() else {
            return Ok(());
        };
        let (mut from, mut to, mut max_did) = self.get_chunk(term, first_edit, false)?;
        for (&did, &wdf) in &changes.pl_changes {
            trace!("merge_changes: edit did={} wdf={}", did, wdf);
            loop {
                if let Some(reader) = from.as_mut() {
                    while !reader.at_end() {
                        let copy_did = reader.docid();
                        if copy_did >= did {
                            if copy_did == did {
                                // Replaced or deleted: skip the old entry.
                                reader.advance()?;
                            }
                            break;
                        }
                        to.append(table, copy_did, reader.wdf())?;
                        reader.advance()?;
                    }
                }
                let reader_done = from.as_ref().map_or(true, |reader| reader.at_end());
                if reader_done && did > max_did {
                    // This edit belongs to a later chunk.
                    to.flush(table)?;
                    let (next_from, next_to, next_max) = self.get_chunk(term, did, false)?;
                    from = next_from;
                    to = next_to;
                    max_did = next_max;
                    continue;
                }
                break;
            }
            if wdf != TOMBSTONE {
                to.append(table, did, wdf)?;
            }
        }
        if let Some(reader) = from.as_mut() {
            while !reader.at_end() {
                to.append(table, reader.docid(), reader.wdf())?;
                reader.advance()?;
            }
        }
        to.flush(table)
    }

    /// Locate the chunk covering `did` and set up the copy-through pair: a
    /// reader over the entries at or past `did` (the untouched prefix goes
    /// straight into the writer) and a writer that will replace the chunk.
    /// Also returns the last docid this chunk may hold.
    fn get_chunk(
        &self,
        term: &[u8],
        did: DocId,
        adding: bool,
    ) -> Result<(Option<PostlistChunkReader>, PostlistChunkWriter, DocId)> {
        let table = &*self.table;
        let mut cursor = TableCursor::new();
        cursor.find_entry(table, &chunk::chunk_key(term, did));
        let key = if cursor.is_positioned() {
            chunk::parse_chunk_key(cursor.current_key(), term)?
        } else {
            None
        };
        let Some(key) = key else {
            if !adding {
                return Err(Error::Corruption(format!(
                    "attempted to modify a non-existent posting list for '{}'",
                    String::from_utf8_lossy(term)
                )));
            }
            let writer = PostlistChunkWriter::new(Vec::new(), true, term, true);
            return Ok((None, writer, DocId::MAX));
        };
        let is_first_chunk = key == chunk::ChunkKey::First;

        cursor.read_tag(table)?;
        let value = cursor.current_value().to_vec();
        let mut r = ByteReader::new(&value);
        let first_did_in_chunk = match key {
            chunk::ChunkKey::First => chunk::read_first_chunk_header(&mut r)?.first_did,
            chunk::ChunkKey::Later(did) => did,
        };
        let (is_last, last_did_in_chunk) = chunk::read_chunk_header(&mut r, first_did_in_chunk)?;

        let mut writer = PostlistChunkWriter::new(
            cursor.current_key().to_vec(),
            is_first_chunk,
            term,
            is_last,
        );
        let from = if did > last_did_in_chunk {
            // Appending past the stored entries: keep the encoded body as-is.
            writer.raw_append(first_did_in_chunk, last_did_in_chunk, r.rest());
            None
        } else {
            Some(PostlistChunkReader::new(first_did_in_chunk, r.rest().to_vec())?)
        };
        if is_last {
            return Ok((from, writer, DocId::MAX));
        }

        cursor.next(table);
        if cursor.after_end() {
            return Err(Error::Corruption(
                "expected another chunk but found none".to_string(),
            ));
        }
        let next_first = match chunk::parse_chunk_key(cursor.current_key(), term)? {
            Some(chunk::ChunkKey::Later(did)) => did,
            _ => {
                return Err(Error::Corruption(
                    "chunk chain ends in a different term".to_string(),
                ))
            }
        };
        let max_did = next_first.checked_sub(1).ok_or_else(|| {
            Error::Corruption("next chunk claims docid zero".to_string())
        })?;
        Ok((from, writer, max_did))
    }

    /// Apply a transaction's document-length changes to the doclen list.
    pub fn merge_doclen_changes(&self, doclens: &BTreeMap<DocId, TermCount>) -> Result<()> {
        if doclens.is_empty() {
            return Ok(());
        }
        debug!("merge_doclen_changes: {} changes", doclens.len());
        // The held-open doclen cursor is about to go stale.
        *self.doclen_cursor.lock() = None;
        let table = &*self.table;

        let first_key = chunk::postlist_key(b"");
        if !table.key_exists(&first_key) {
            debug!("merge_doclen_changes: creating the synthetic first chunk");
            let mut value = chunk::make_first_chunk_header(0, 0, 0);
            value.extend_from_slice(&chunk::make_chunk_header(true, 0, 0));
            table.add(&first_key, &value);
        }

        let changes: Vec<(DocId, TermCount)> =
            doclens.iter().map(|(&did, &length)| (did, length)).collect();
        let mut start = 0;
        while start < changes.len() {
            let did = changes[start].0;
            let mut cursor = TableCursor::new();
            cursor.find_entry(table, &chunk::chunk_key(b"", did));
            if !cursor.is_positioned() {
                return Err(Error::Corruption(
                    "doclen list has no first chunk".to_string(),
                ));
            }
            let key = chunk::parse_chunk_key(cursor.current_key(), b"")?.ok_or_else(|| {
                Error::Corruption("doclen chunk key does not parse".to_string())
            })?;
            let is_first_chunk = key == chunk::ChunkKey::First;

            cursor.read_tag(table)?;
            let orig_key = cursor.current_key().to_vec();
            let orig_value = cursor.current_value().to_vec();
            let mut r = ByteReader::new(&orig_value);
            let first_did_in_chunk = match key {
                chunk::ChunkKey::First => chunk::read_first_chunk_header(&mut r)?.first_did,
                chunk::ChunkKey::Later(did) => did,
            };
            let (is_last, _) = chunk::read_chunk_header(&mut r, first_did_in_chunk)?;

            // Everything up to the next chunk's first docid lands here.
            let end = if is_last {
                changes.len()
            } else {
                cursor.next(table);
                if cursor.after_end() {
                    return Err(Error::Corruption(
                        "expected another doclen chunk but found none".to_string(),
                    ));
                }
                let next_first = match chunk::parse_chunk_key(cursor.current_key(), b"")? {
                    Some(chunk::ChunkKey::Later(did)) => did,
                    _ => {
                        return Err(Error::Corruption(
                            "doclen chunk chain ends in a different term".to_string(),
                        ))
                    }
                };
                start + changes[start..].partition_point(|&(d, _)| d < next_first)
            };

            table.del(&orig_key);
            let writer = DoclenChunkWriter::new(&orig_value, is_first_chunk, first_did_in_chunk);
            let emitted = writer.merge(table, &changes[start..end])?;
            if !emitted {
                // The chunk dissolved; repair the chain around the hole.
                if is_first_chunk && !is_last {
                    self.promote_doclen_first_chunk(&first_key)?;
                } else if !is_first_chunk && is_last {
                    postchunk::flip_last_flag_on_predecessor(table, &orig_key, b"")?;
                }
                // First and last at once: the doclen list is empty now; the
                // synthetic chunk comes back on the next merge.
            }
            start = end;
        }
        Ok(())
    }

    /// The first doclen chunk dissolved with successors remaining: rewrite
    /// the next chunk as the first chunk (aggregates stay zero).
    fn promote_doclen_first_chunk(&self, first_key: &[u8]) -> Result<()> {
        debug!("merge_doclen_changes: promoting second doclen chunk to first");
        let table = &*self.table;
        let mut cursor = TableCursor::new();
        cursor.find_entry(table, first_key);
        cursor.next(table);
        if cursor.after_end() {
            return Err(Error::Corruption(
                "doclen successor chunk missing".to_string(),
            ));
        }
        let new_first_did = match chunk::parse_chunk_key(cursor.current_key(), b"")? {
            Some(chunk::ChunkKey::Later(did)) => did,
            _ => {
                return Err(Error::Corruption(
                    "doclen successor chunk missing".to_string(),
                ))
            }
        };

        cursor.read_tag(table)?;
        let value = cursor.current_value().to_vec();
        let mut r = ByteReader::new(&value);
        let (is_last, new_last_did) = chunk::read_chunk_header(&mut r, new_first_did)?;
        let body_start = r.pos();

        let old_key = cursor.current_key().to_vec();
        table.del(&old_key);

        let mut out = chunk::make_first_chunk_header(0, 0, new_first_did);
        out.extend_from_slice(&chunk::make_chunk_header(is_last, new_first_did, new_last_did));
        out.extend_from_slice(&value[body_start..]);
        table.add(first_key, &out);
        Ok(())
    }
}
