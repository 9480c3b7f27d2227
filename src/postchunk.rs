//! Single-chunk reader and writer for term posting lists
//!
//! The body of a postlist chunk holds, after the headers:
//!
//! 1. wdf of the first entry
//! 2. `docid_delta - 1` then wdf for the second entry
//! 3. (2) repeatedly
//!
//! The first entry's docid is implicit: it comes from the first-chunk header
//! or from the chunk key. [`PostlistChunkReader`] iterates one such body.
//! [`PostlistChunkWriter`] rebuilds a chunk entry by entry and, on flush,
//! performs the splice protocol that keeps the chunk chain consistent when
//! chunks empty out, change their first docid, or stop being the last chunk.

use log::debug;

use crate::chunk;
use crate::codec::{self, ByteReader};
use crate::error::{Error, Result};
use crate::table::{SortedTable, TableCursor};
use crate::{DocId, TermCount};

/// Split a chunk body once it grows past this many bytes. Chunks end up
/// slightly bigger than this, never more than a few bytes.
pub const CHUNK_SPLIT_THRESHOLD: usize = 2000;

/// Forward iterator over the entries of one postlist chunk.
pub struct PostlistChunkReader {
    data: Vec<u8>,
    pos: usize,
    did: DocId,
    wdf: TermCount,
    at_end: bool,
}

impl PostlistChunkReader {
    /// `data` is the chunk value with both headers stripped, so it starts
    /// with the first entry's wdf.
    pub fn new(first_did: DocId, data: Vec<u8>) -> Result<Self> {
        let mut reader = Self {
            data,
            pos: 0,
            did: first_did,
            wdf: 0,
            at_end: false,
        };
        if reader.data.is_empty() {
            reader.at_end = true;
        } else {
            let mut r = ByteReader::new(&reader.data);
            reader.wdf = r.unpack_uint()?;
            reader.pos = r.pos();
        }
        Ok(reader)
    }

    pub fn docid(&self) -> DocId {
        debug_assert!(!self.at_end);
        self.did
    }

    pub fn wdf(&self) -> TermCount {
        debug_assert!(!self.at_end);
        self.wdf
    }

    pub fn at_end(&self) -> bool {
        self.at_end
    }

    /// Step to the next entry, setting `at_end` when the chunk is exhausted.
    pub fn advance(&mut self) -> Result<()> {
        if self.pos == self.data.len() {
            self.at_end = true;
            return Ok(());
        }
        let mut r = ByteReader::at(&self.data, self.pos);
        let delta = r.unpack_uint()?;
        self.did = self
            .did
            .checked_add(delta)
            .and_then(|did| did.checked_add(1))
            .ok_or_else(|| Error::Corruption("docid overflow in postlist chunk".to_string()))?;
        self.wdf = r.unpack_uint()?;
        self.pos = r.pos();
        Ok(())
    }
}

/// Output buffer for one postlist chunk.
///
/// Entries are appended in docid order; when the body outgrows
/// [`CHUNK_SPLIT_THRESHOLD`] the chunk is flushed and the writer restarts
/// under a fresh key. [`PostlistChunkWriter::flush`] writes the final state
/// back, splicing the chunk out of the chain if it ended up empty.
pub struct PostlistChunkWriter {
    orig_key: Vec<u8>,
    term: Vec<u8>,
    is_first_chunk: bool,
    is_last_chunk: bool,
    started: bool,
    first_did: DocId,
    current_did: DocId,
    body: Vec<u8>,
}

impl PostlistChunkWriter {
    pub fn new(orig_key: Vec<u8>, is_first_chunk: bool, term: &[u8], is_last_chunk: bool) -> Self {
        Self {
            orig_key,
            term: term.to_vec(),
            is_first_chunk,
            is_last_chunk,
            started: false,
            first_did: 0,
            current_did: 0,
            body: Vec::new(),
        }
    }

    /// Append one entry. Splits the chunk first if the body is full.
    pub fn append<T: SortedTable + ?Sized>(
        &mut self,
        table: &T,
        did: DocId,
        wdf: TermCount,
    ) -> Result<()> {
        if !self.started {
            self.started = true;
            self.first_did = did;
        } else {
            debug_assert!(did > self.current_did);
            if self.body.len() >= CHUNK_SPLIT_THRESHOLD {
                let save_is_last = self.is_last_chunk;
                self.is_last_chunk = false;
                self.flush(table)?;
                self.is_last_chunk = save_is_last;
                self.is_first_chunk = false;
                self.first_did = did;
                self.body.clear();
                self.orig_key = chunk::chunk_key(&self.term, self.first_did);
            } else {
                codec::pack_uint(&mut self.body, did - self.current_did - 1);
            }
        }
        self.current_did = did;
        codec::pack_uint(&mut self.body, wdf);
        Ok(())
    }

    /// Seed the writer with an untouched run of already-encoded entries.
    pub fn raw_append(&mut self, first_did: DocId, current_did: DocId, data: &[u8]) {
        debug_assert!(!self.started);
        self.first_did = first_did;
        self.current_did = current_did;
        if !data.is_empty() {
            self.body.extend_from_slice(data);
            self.started = true;
        }
    }

    /// Write the chunk back to the table.
    ///
    /// An emptied chunk disappears, which may require rewriting a neighbor:
    /// an emptied first chunk hands its aggregates to the next chunk, an
    /// emptied last chunk hands the last-chunk flag to the previous one. A
    /// surviving chunk whose first docid changed moves to a new key.
    pub fn flush<T: SortedTable + ?Sized>(&self, table: &T) -> Result<()> {
        if !self.started {
            debug_assert!(!self.orig_key.is_empty());
            if self.is_first_chunk {
                if self.is_last_chunk {
                    debug!("flush: deleting only chunk");
                    table.del(&self.orig_key);
                    return Ok(());
                }
                return self.promote_next_chunk(table);
            }
            debug!("flush: deleting non-first chunk");
            table.del(&self.orig_key);
            if self.is_last_chunk {
                return flip_last_flag_on_predecessor(table, &self.orig_key, &self.term);
            }
            return Ok(());
        }

        if self.is_first_chunk {
            // Re-read the aggregates from the stored first chunk and rewrite
            // the whole value under the unchanged key.
            let key = chunk::postlist_key(&self.term);
            let tag = table.get(&key).ok_or_else(|| {
                Error::Corruption("first chunk missing while rewriting it".to_string())
            })?;
            let mut r = ByteReader::new(&tag);
            let header = chunk::read_first_chunk_header(&mut r)?;
            let mut out =
                chunk::make_first_chunk_header(header.termfreq, header.collfreq, self.first_did);
            out.extend_from_slice(&chunk::make_chunk_header(
                self.is_last_chunk,
                self.first_did,
                self.current_did,
            ));
            out.extend_from_slice(&self.body);
            table.add(&key, &out);
            return Ok(());
        }

        // Non-first chunk: if the first entry changed, the key changes too.
        let initial_did = match chunk::parse_chunk_key(&self.orig_key, &self.term)? {
            Some(chunk::ChunkKey::Later(did)) => did,
            _ => {
                return Err(Error::Corruption(
                    "postlist chunk key does not match its term".to_string(),
                ))
            }
        };
        let new_key = if initial_did != self.first_did {
            table.del(&self.orig_key);
            chunk::chunk_key(&self.term, self.first_did)
        } else {
            self.orig_key.clone()
        };
        let mut out = chunk::make_chunk_header(self.is_last_chunk, self.first_did, self.current_did);
        out.extend_from_slice(&self.body);
        table.add(&new_key, &out);
        Ok(())
    }

    /// The emptied first chunk has successors: rewrite the second chunk as
    /// the new first chunk, carrying the aggregates over.
    fn promote_next_chunk<T: SortedTable + ?Sized>(&self, table: &T) -> Result<()> {
        debug!("flush: promoting second chunk to first");
        let mut cursor = TableCursor::new();
        if !cursor.find_entry(table, &self.orig_key) {
            return Err(Error::Corruption(
                "first chunk key disappeared mid-update".to_string(),
            ));
        }
        cursor.read_tag(table)?;
        let (termfreq, collfreq) = {
            let mut r = ByteReader::new(cursor.current_value());
            let header = chunk::read_first_chunk_header(&mut r)?;
            (header.termfreq, header.collfreq)
        };

        cursor.next(table);
        if cursor.after_end() {
            return Err(Error::Corruption(
                "expected another chunk after the first but found none".to_string(),
            ));
        }
        let new_first_did = match chunk::parse_chunk_key(cursor.current_key(), &self.term)? {
            Some(chunk::ChunkKey::Later(did)) => did,
            _ => {
                return Err(Error::Corruption(
                    "chunk after the first belongs to a different term".to_string(),
                ))
            }
        };

        cursor.read_tag(table)?;
        let value = cursor.current_value().to_vec();
        let mut r = ByteReader::new(&value);
        let (is_last, new_last_did) = chunk::read_chunk_header(&mut r, new_first_did)?;
        let body_start = r.pos();

        let next_key = cursor.current_key().to_vec();
        table.del(&next_key);

        let mut out = chunk::make_first_chunk_header(termfreq, collfreq, new_first_did);
        out.extend_from_slice(&chunk::make_chunk_header(is_last, new_first_did, new_last_did));
        out.extend_from_slice(&value[body_start..]);
        table.add(&self.orig_key, &out);
        Ok(())
    }
}

/// After deleting the last chunk under `deleted_key`, set `is_last_chunk` on
/// the predecessor chunk of the same list.
pub(crate) fn flip_last_flag_on_predecessor<T: SortedTable + ?Sized>(
    table: &T,
    deleted_key: &[u8],
    term: &[u8],
) -> Result<()> {
    debug!("flush: moving last-chunk flag to the predecessor");
    let mut cursor = TableCursor::new();
    if cursor.find_entry(table, deleted_key) {
        return Err(Error::Corruption(
            "chunk key still present after deletion".to_string(),
        ));
    }
    if !cursor.is_positioned() {
        return Err(Error::Corruption(
            "no chunk found before the deleted last chunk".to_string(),
        ));
    }
    let prev_key = chunk::parse_chunk_key(cursor.current_key(), term)?.ok_or_else(|| {
        Error::Corruption(
            "chunk before the deleted last chunk belongs to a different term".to_string(),
        )
    })?;

    cursor.read_tag(table)?;
    let mut tag = cursor.current_value().to_vec();
    let mut r = ByteReader::new(&tag);
    let first_did = match prev_key {
        chunk::ChunkKey::First => chunk::read_first_chunk_header(&mut r)?.first_did,
        chunk::ChunkKey::Later(did) => did,
    };
    let header_start = r.pos();
    let (_, last_did) = chunk::read_chunk_header(&mut r, first_did)?;
    let header_end = r.pos();

    chunk::rewrite_chunk_header(&mut tag, header_start, header_end, true, first_did, last_did);
    let key = cursor.current_key().to_vec();
    table.add(&key, &tag);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::RamTable;

    fn read_all(first_did: DocId, body: Vec<u8>) -> Vec<(DocId, TermCount)> {
        let mut reader = PostlistChunkReader::new(first_did, body).unwrap();
        let mut out = Vec::new();
        while !reader.at_end() {
            out.push((reader.docid(), reader.wdf()));
            reader.advance().unwrap();
        }
        out
    }

    /// Build a chunk body by hand: first wdf, then (delta-1, wdf) pairs.
    fn make_body(entries: &[(DocId, TermCount)]) -> Vec<u8> {
        let mut body = Vec::new();
        codec::pack_uint(&mut body, entries[0].1);
        for pair in entries.windows(2) {
            codec::pack_uint(&mut body, pair[1].0 - pair[0].0 - 1);
            codec::pack_uint(&mut body, pair[1].1);
        }
        body
    }

    #[test]
    fn test_reader_iterates_entries() {
        let entries = [(5u32, 2u32), (6, 1), (100, 7)];
        assert_eq!(read_all(5, make_body(&entries)), entries);
    }

    #[test]
    fn test_reader_empty_body() {
        let reader = PostlistChunkReader::new(1, Vec::new()).unwrap();
        assert!(reader.at_end());
    }

    #[test]
    fn test_reader_truncated_body_fails() {
        let mut body = make_body(&[(5, 2), (6, 1)]);
        body.pop();
        body.push(0x80); // continuation bit with nothing after it
        let mut reader = PostlistChunkReader::new(5, body).unwrap();
        assert!(reader.advance().is_err());
    }

    /// Seed a single-chunk postlist the way the merge driver does: header
    /// only first, then a writer fills the body in.
    fn seed_list(table: &RamTable, term: &[u8], entries: &[(DocId, TermCount)]) {
        let termfreq = entries.len() as u32;
        let collfreq = entries.iter().map(|&(_, wdf)| wdf).sum();
        let mut value = chunk::make_first_chunk_header(termfreq, collfreq, 0);
        value.extend_from_slice(&chunk::make_chunk_header(true, 0, 0));
        table.add(&chunk::postlist_key(term), &value);

        let mut writer = PostlistChunkWriter::new(chunk::postlist_key(term), true, term, true);
        for &(did, wdf) in entries {
            writer.append(table, did, wdf).unwrap();
        }
        writer.flush(table).unwrap();
    }

    fn parse_chunk(
        table: &RamTable,
        key: &[u8],
        term: &[u8],
    ) -> (bool, DocId, DocId, Vec<(DocId, TermCount)>) {
        let value = table.get(key).unwrap();
        let mut r = ByteReader::new(&value);
        let first_did = match chunk::parse_chunk_key(key, term).unwrap().unwrap() {
            chunk::ChunkKey::First => chunk::read_first_chunk_header(&mut r).unwrap().first_did,
            chunk::ChunkKey::Later(did) => did,
        };
        let (is_last, last_did) = chunk::read_chunk_header(&mut r, first_did).unwrap();
        (is_last, first_did, last_did, read_all(first_did, r.rest().to_vec()))
    }

    #[test]
    fn test_writer_single_chunk_roundtrip() {
        let table = RamTable::new();
        seed_list(&table, b"cat", &[(1, 2), (4, 1), (9, 3)]);

        assert_eq!(table.len(), 1);
        let (is_last, first, last, entries) = parse_chunk(&table, &chunk::postlist_key(b"cat"), b"cat");
        assert!(is_last);
        assert_eq!((first, last), (1, 9));
        assert_eq!(entries, vec![(1, 2), (4, 1), (9, 3)]);
    }

    #[test]
    fn test_writer_splits_on_threshold() {
        let table = RamTable::new();
        let entries: Vec<(DocId, TermCount)> = (1..=2500).map(|i| (i, 1)).collect();
        seed_list(&table, b"x", &entries);

        let keys = table.keys();
        assert!(keys.len() >= 2, "expected a split, got {} chunks", keys.len());
        assert_eq!(keys[0], chunk::postlist_key(b"x"));

        // The chunk chain covers every entry in order, with exactly one last
        // chunk at the end and strictly increasing docids across boundaries.
        let mut collected = Vec::new();
        let mut prev_last = 0;
        for (i, key) in keys.iter().enumerate() {
            let (is_last, first, last, chunk_entries) = parse_chunk(&table, key, b"x");
            assert_eq!(is_last, i == keys.len() - 1);
            if i > 0 {
                assert!(first > prev_last);
            }
            assert_eq!(chunk_entries.first().unwrap().0, first);
            assert_eq!(chunk_entries.last().unwrap().0, last);
            prev_last = last;
            collected.extend(chunk_entries);
        }
        assert_eq!(collected, entries);
    }

    #[test]
    fn test_flush_deletes_only_chunk() {
        let table = RamTable::new();
        seed_list(&table, b"cat", &[(1, 2)]);

        let writer = PostlistChunkWriter::new(chunk::postlist_key(b"cat"), true, b"cat", true);
        writer.flush(&table).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn test_flush_promotes_second_chunk() {
        let table = RamTable::new();
        let entries: Vec<(DocId, TermCount)> = (1..=2500).map(|i| (i, 1)).collect();
        seed_list(&table, b"x", &entries);
        let keys = table.keys();
        assert!(keys.len() >= 2);
        let (_, second_first, _, _) = parse_chunk(&table, &keys[1], b"x");

        // Empty writer standing in for a fully-deleted first chunk.
        let writer = PostlistChunkWriter::new(chunk::postlist_key(b"x"), true, b"x", false);
        writer.flush(&table).unwrap();

        assert_eq!(table.keys().len(), keys.len() - 1);
        let value = table.get(&chunk::postlist_key(b"x")).unwrap();
        let mut r = ByteReader::new(&value);
        let header = chunk::read_first_chunk_header(&mut r).unwrap();
        // Aggregates survive the promotion; the first docid moves up.
        assert_eq!(header.termfreq, 2500);
        assert_eq!(header.first_did, second_first);
    }

    #[test]
    fn test_flush_flips_last_flag_on_predecessor() {
        let table = RamTable::new();
        let entries: Vec<(DocId, TermCount)> = (1..=2500).map(|i| (i, 1)).collect();
        seed_list(&table, b"x", &entries);
        let keys = table.keys();
        let last_key = keys.last().unwrap().clone();
        let (is_last, ..) = parse_chunk(&table, &last_key, b"x");
        assert!(is_last);

        let writer = PostlistChunkWriter::new(last_key.clone(), false, b"x", true);
        writer.flush(&table).unwrap();

        assert!(table.get(&last_key).is_none());
        let new_last_key = table.keys().last().unwrap().clone();
        let (is_last, ..) = parse_chunk(&table, &new_last_key, b"x");
        assert!(is_last);
    }

    #[test]
    fn test_flush_rekeys_when_first_did_changes() {
        let table = RamTable::new();
        let term = b"t";
        // A standalone non-first chunk keyed by docid 50.
        let orig_key = chunk::chunk_key(term, 50);
        let mut value = chunk::make_chunk_header(true, 50, 60);
        value.extend_from_slice(&make_body(&[(50, 1), (60, 2)]));
        table.add(&orig_key, &value);

        let mut writer = PostlistChunkWriter::new(orig_key.clone(), false, term, true);
        writer.append(&table, 55, 4).unwrap();
        writer.append(&table, 60, 2).unwrap();
        writer.flush(&table).unwrap();

        assert!(table.get(&orig_key).is_none());
        let (is_last, first, last, entries) = parse_chunk(&table, &chunk::chunk_key(term, 55), term);
        assert!(is_last);
        assert_eq!((first, last), (55, 60));
        assert_eq!(entries, vec![(55, 4), (60, 2)]);
    }
}
