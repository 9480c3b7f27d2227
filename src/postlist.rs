//! Multi-chunk posting-list cursor
//!
//! [`PostList`] walks one term's chunk chain through a table cursor,
//! delegating per-chunk decoding to [`PostlistChunkReader`] for term lists
//! and [`FixedWidthChunkReader`] for the doclen list (the empty term).
//!
//! Term lists are forward-only: `advance` and `skip_to`. The doclen list
//! additionally supports `seek_to`, which may move backwards by reloading a
//! chunk and answers whether the exact docid is stored.

use std::sync::Arc;

use log::debug;

use crate::chunk;
use crate::codec::ByteReader;
use crate::doclen::FixedWidthChunkReader;
use crate::error::{Error, Result};
use crate::postchunk::PostlistChunkReader;
use crate::table::{SortedTable, TableCursor};
use crate::{DocCount, DocId, TermCount};

enum ChunkReader {
    None,
    Ordinary(PostlistChunkReader),
    Doclen(FixedWidthChunkReader),
}

/// Cursor over one posting list, spanning all its chunks.
pub struct PostList<T: SortedTable> {
    table: Arc<T>,
    term: Vec<u8>,
    is_doclen_list: bool,
    cursor: TableCursor,
    reader: ChunkReader,
    number_of_entries: DocCount,
    found: bool,
    have_started: bool,
    at_end: bool,
    is_last_chunk: bool,
    first_did_in_chunk: DocId,
    last_did_in_chunk: DocId,
    did: DocId,
    wdf: TermCount,
}

impl<T: SortedTable> PostList<T> {
    /// Open a cursor for `term`; the empty term opens the doclen list.
    pub fn open(table: Arc<T>, term: &[u8]) -> Result<Self> {
        let is_doclen_list = term.is_empty();
        let mut cursor = TableCursor::new();
        let found = cursor.find_entry(&*table, &chunk::postlist_key(term));
        let mut list = Self {
            table,
            term: term.to_vec(),
            is_doclen_list,
            cursor,
            reader: ChunkReader::None,
            number_of_entries: 0,
            found,
            have_started: false,
            at_end: !found,
            is_last_chunk: true,
            first_did_in_chunk: 0,
            last_did_in_chunk: 0,
            did: 0,
            wdf: 0,
        };
        if !found {
            return Ok(list);
        }
        list.cursor.read_tag(&*list.table)?;
        let value = list.cursor.current_value().to_vec();
        let mut r = ByteReader::new(&value);
        let header = chunk::read_first_chunk_header(&mut r)?;
        list.number_of_entries = header.termfreq;
        let (is_last, last_did) = chunk::read_chunk_header(&mut r, header.first_did)?;
        list.is_last_chunk = is_last;
        list.first_did_in_chunk = header.first_did;
        list.last_did_in_chunk = last_did;
        list.did = header.first_did;
        list.load_reader(r.rest().to_vec())?;
        Ok(list)
    }

    /// Number of entries, from the first-chunk header (zero for the doclen
    /// list, which does not maintain it).
    pub fn doc_count(&self) -> DocCount {
        self.number_of_entries
    }

    pub fn at_end(&self) -> bool {
        self.at_end
    }

    pub fn docid(&self) -> DocId {
        debug_assert!(!self.at_end);
        self.did
    }

    /// The wdf of the current entry; the document length on a doclen list.
    pub fn wdf(&self) -> TermCount {
        debug_assert!(!self.at_end);
        self.wdf
    }

    /// Step to the next entry. The cursor starts positioned just before the
    /// first entry, so the first call lands on it. Returns false at the end.
    pub fn advance(&mut self) -> Result<bool> {
        if !self.have_started {
            self.have_started = true;
            return Ok(!self.at_end);
        }
        if self.at_end {
            return Ok(false);
        }
        if !self.next_in_chunk()? {
            self.next_chunk()?;
        }
        Ok(!self.at_end)
    }

    /// Move forward to the first entry with docid at least `desired_did`.
    /// Never moves backwards. Returns false once the list is exhausted.
    pub fn skip_to(&mut self, desired_did: DocId) -> Result<bool> {
        if self.is_doclen_list {
            // Doclen lists answer exact-membership seeks instead.
            debug!("skip_to on the doclen list redirected to seek_to");
            return self.seek_to(desired_did);
        }
        self.have_started = true;
        if self.at_end || desired_did <= self.did {
            return Ok(!self.at_end);
        }
        if !self.current_chunk_contains(desired_did) {
            self.move_to_chunk_containing(desired_did)?;
            if self.at_end {
                return Ok(false);
            }
        }
        self.move_forward_in_chunk_to_at_least(desired_did)?;
        Ok(!self.at_end)
    }

    /// Doclen lists only: position exactly on `desired_did`, reloading or
    /// rewinding chunks as needed. On a miss returns false with the cursor
    /// on the next stored docid, when one exists.
    pub fn seek_to(&mut self, desired_did: DocId) -> Result<bool> {
        if !self.is_doclen_list {
            return Err(Error::InvalidArgument(
                "seek_to is only supported on the doclen list".to_string(),
            ));
        }
        self.have_started = true;
        if !self.found {
            return Ok(false);
        }
        if self.at_end || desired_did < self.did || !self.current_chunk_contains(desired_did) {
            self.at_end = false;
            self.move_to_chunk_containing(desired_did)?;
            if self.at_end {
                return Ok(false);
            }
        }
        let reader = match &mut self.reader {
            ChunkReader::Doclen(reader) => reader,
            _ => {
                return Err(Error::Corruption(
                    "doclen list chunk has no doclen reader".to_string(),
                ))
            }
        };
        let hit = reader.seek_to(desired_did)?;
        self.at_end = reader.at_end();
        if !self.at_end {
            self.did = reader.docid();
            self.wdf = reader.doclen();
        }
        Ok(hit)
    }

    fn load_reader(&mut self, body: Vec<u8>) -> Result<()> {
        if self.is_doclen_list {
            let reader = FixedWidthChunkReader::new(body, self.first_did_in_chunk)?;
            self.at_end = reader.at_end();
            if !self.at_end {
                self.did = reader.docid();
                self.wdf = reader.doclen();
            }
            self.reader = ChunkReader::Doclen(reader);
        } else {
            let reader = PostlistChunkReader::new(self.first_did_in_chunk, body)?;
            self.at_end = reader.at_end();
            if !self.at_end {
                self.did = reader.docid();
                self.wdf = reader.wdf();
            }
            self.reader = ChunkReader::Ordinary(reader);
        }
        Ok(())
    }

    fn next_in_chunk(&mut self) -> Result<bool> {
        match &mut self.reader {
            ChunkReader::Ordinary(reader) => {
                reader.advance()?;
                if reader.at_end() {
                    return Ok(false);
                }
                self.did = reader.docid();
                self.wdf = reader.wdf();
                debug_assert!(self.did <= self.last_did_in_chunk);
                Ok(true)
            }
            ChunkReader::Doclen(reader) => {
                if !reader.advance()? {
                    return Ok(false);
                }
                self.did = reader.docid();
                self.wdf = reader.doclen();
                Ok(true)
            }
            ChunkReader::None => Ok(false),
        }
    }

    fn next_chunk(&mut self) -> Result<()> {
        if self.is_last_chunk {
            self.at_end = true;
            return Ok(());
        }
        self.cursor.next(&*self.table);
        if self.cursor.after_end() {
            self.at_end = true;
            return Err(Error::Corruption(format!(
                "posting list for '{}' ends without a last chunk",
                String::from_utf8_lossy(&self.term)
            )));
        }
        let key = chunk::parse_chunk_key(self.cursor.current_key(), &self.term)?;
        let Some(chunk::ChunkKey::Later(new_did)) = key else {
            self.at_end = true;
            return Err(Error::Corruption(format!(
                "posting list for '{}' ends without a last chunk",
                String::from_utf8_lossy(&self.term)
            )));
        };
        if new_did <= self.did {
            return Err(Error::Corruption(format!(
                "docid {} in next chunk not greater than {} in previous",
                new_did, self.did
            )));
        }
        self.cursor.read_tag(&*self.table)?;
        let value = self.cursor.current_value().to_vec();
        let mut r = ByteReader::new(&value);
        let (is_last, last_did) = chunk::read_chunk_header(&mut r, new_did)?;
        self.is_last_chunk = is_last;
        self.first_did_in_chunk = new_did;
        self.last_did_in_chunk = last_did;
        self.did = new_did;
        self.load_reader(r.rest().to_vec())
    }

    fn current_chunk_contains(&self, desired_did: DocId) -> bool {
        desired_did >= self.first_did_in_chunk && desired_did <= self.last_did_in_chunk
    }

    /// Reposition the table cursor on the chunk whose range covers
    /// `desired_did` and rebuild the chunk reader there. Steps one chunk
    /// further when the target falls in a gap between chunks.
    fn move_to_chunk_containing(&mut self, desired_did: DocId) -> Result<()> {
        self.cursor
            .find_entry(&*self.table, &chunk::chunk_key(&self.term, desired_did));
        if !self.cursor.is_positioned() {
            self.at_end = true;
            self.is_last_chunk = true;
            return Ok(());
        }
        let Some(key) = chunk::parse_chunk_key(self.cursor.current_key(), &self.term)? else {
            // The whole list is gone.
            self.at_end = true;
            self.is_last_chunk = true;
            return Ok(());
        };
        self.at_end = false;

        self.cursor.read_tag(&*self.table)?;
        let value = self.cursor.current_value().to_vec();
        let mut r = ByteReader::new(&value);
        let first_did = match key {
            chunk::ChunkKey::First => chunk::read_first_chunk_header(&mut r)?.first_did,
            chunk::ChunkKey::Later(did) => did,
        };
        let (is_last, last_did) = chunk::read_chunk_header(&mut r, first_did)?;
        self.is_last_chunk = is_last;
        self.first_did_in_chunk = first_did;
        self.last_did_in_chunk = last_did;
        self.did = first_did;
        self.load_reader(r.rest().to_vec())?;

        if desired_did > self.last_did_in_chunk {
            self.next_chunk()?;
        }
        Ok(())
    }

    fn move_forward_in_chunk_to_at_least(&mut self, desired_did: DocId) -> Result<bool> {
        if self.did >= desired_did {
            return Ok(true);
        }
        if desired_did > self.last_did_in_chunk {
            return Ok(false);
        }
        if let ChunkReader::Ordinary(reader) = &mut self.reader {
            while !reader.at_end() {
                reader.advance()?;
                if reader.at_end() {
                    break;
                }
                self.did = reader.docid();
                self.wdf = reader.wdf();
                if self.did >= desired_did {
                    return Ok(true);
                }
            }
        }
        // The chunk header promised desired_did <= last_did_in_chunk.
        Err(Error::Corruption(
            "chunk ended before its recorded last docid".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postchunk::PostlistChunkWriter;
    use crate::table::RamTable;

    /// Seed a postlist directly through the chunk writer.
    fn seed_list(table: &Arc<RamTable>, term: &[u8], entries: &[(DocId, TermCount)]) {
        let termfreq = entries.len() as u32;
        let collfreq = entries.iter().map(|&(_, wdf)| wdf).sum();
        let mut value = chunk::make_first_chunk_header(termfreq, collfreq, 0);
        value.extend_from_slice(&chunk::make_chunk_header(true, 0, 0));
        table.add(&chunk::postlist_key(term), &value);

        let mut writer = PostlistChunkWriter::new(chunk::postlist_key(term), true, term, true);
        for &(did, wdf) in entries {
            writer.append(&**table, did, wdf).unwrap();
        }
        writer.flush(&**table).unwrap();
    }

    #[test]
    fn test_absent_term() {
        let table = Arc::new(RamTable::new());
        let mut list = PostList::open(table, b"nope").unwrap();
        assert_eq!(list.doc_count(), 0);
        assert!(!list.advance().unwrap());
    }

    #[test]
    fn test_iterates_single_chunk() {
        let table = Arc::new(RamTable::new());
        let entries = [(1u32, 2u32), (4, 1), (9, 3)];
        seed_list(&table, b"cat", &entries);

        let mut list = PostList::open(table, b"cat").unwrap();
        assert_eq!(list.doc_count(), 3);
        let mut seen = Vec::new();
        while list.advance().unwrap() {
            seen.push((list.docid(), list.wdf()));
        }
        assert_eq!(seen, entries);
    }

    #[test]
    fn test_iterates_across_chunks() {
        let table = Arc::new(RamTable::new());
        let entries: Vec<(DocId, TermCount)> = (1..=3000).map(|i| (i * 2, 1)).collect();
        seed_list(&table, b"x", &entries);
        assert!(table.len() >= 2);

        let mut list = PostList::open(table, b"x").unwrap();
        let mut seen = Vec::new();
        while list.advance().unwrap() {
            seen.push((list.docid(), list.wdf()));
        }
        assert_eq!(seen, entries);
    }

    #[test]
    fn test_skip_to() {
        let table = Arc::new(RamTable::new());
        let entries: Vec<(DocId, TermCount)> = (1..=3000).map(|i| (i * 3, i)).collect();
        seed_list(&table, b"x", &entries);

        let mut list = PostList::open(table, b"x").unwrap();
        // Exact hit far into the chain.
        assert!(list.skip_to(6000).unwrap());
        assert_eq!(list.docid(), 6000);
        assert_eq!(list.wdf(), 2000);
        // Between entries: lands on the next one.
        assert!(list.skip_to(6001).unwrap());
        assert_eq!(list.docid(), 6003);
        // Never moves backwards.
        assert!(list.skip_to(5).unwrap());
        assert_eq!(list.docid(), 6003);
        // Past the end.
        assert!(!list.skip_to(90000).unwrap());
        assert!(list.at_end());
    }

    #[test]
    fn test_skip_to_then_advance() {
        let table = Arc::new(RamTable::new());
        let entries: Vec<(DocId, TermCount)> = (1..=2000).map(|i| (i * 2, 1)).collect();
        seed_list(&table, b"x", &entries);

        let mut list = PostList::open(table, b"x").unwrap();
        assert!(list.skip_to(1000).unwrap());
        let here = list.docid();
        assert!(list.advance().unwrap());
        assert_eq!(list.docid(), here + 2);
    }

    #[test]
    fn test_seek_to_rejected_on_term_list() {
        let table = Arc::new(RamTable::new());
        seed_list(&table, b"cat", &[(1, 1)]);
        let mut list = PostList::open(table, b"cat").unwrap();
        assert!(matches!(list.seek_to(1), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_corrupt_chunk_body_fails_iteration() {
        let table = Arc::new(RamTable::new());
        seed_list(&table, b"cat", &[(1, 2), (4, 1), (9, 3)]);

        // Set a continuation bit on the final body byte so the varint for
        // the last wdf runs off the end of the chunk.
        let key = chunk::postlist_key(b"cat");
        let mut value = table.get(&key).unwrap();
        let end = value.len() - 1;
        value[end] |= 0x80;
        table.add(&key, &value);

        let mut list = PostList::open(table, b"cat").unwrap();
        assert!(list.advance().unwrap());
        assert!(list.advance().unwrap());
        let result = list.advance();
        assert!(matches!(result, Err(Error::Corruption(_))));
    }
}
