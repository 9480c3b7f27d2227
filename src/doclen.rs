//! Dense document-length storage with interleaved fixed-width runs
//!
//! The doclen list shares the chunk framing of term posting lists but uses
//! its own body format, tuned for docids that are mostly consecutive and
//! lengths that fit a locally-constant number of bytes. A body is a sequence
//! of segments:
//!
//! - Sparse: `docid_delta` then `doclen`, both varint. Deltas are relative to
//!   the previous stored docid, starting from `first_did_in_chunk - 1`, so a
//!   sparse delta is always at least 1.
//! - Fixed-width run: the [`SEPARATOR`] sentinel, the delta to the run's
//!   first docid, a 2-byte run length, a 1-byte width, then `run_length`
//!   lengths of `width` bytes each. Docids inside a run are consecutive.
//!
//! [`FixedWidthChunk`] encodes one chunk's entries, [`FixedWidthChunkReader`]
//! reads one chunk with random access, and [`DoclenChunkWriter`] merges a
//! batch of changes into one chunk, splitting the output when it grows too
//! large.

use std::collections::BTreeMap;

use log::debug;

use crate::chunk;
use crate::codec::{self, ByteReader};
use crate::error::{Error, Result};
use crate::table::SortedTable;
use crate::{DocId, TermCount, TOMBSTONE};

/// Sentinel marking the start of a fixed-width run. Sparse deltas are always
/// at least 1 and never reach this value, so the two cannot be confused.
pub const SEPARATOR: u32 = u32::MAX;

/// Split the output after this many entries when rewriting a doclen chunk.
pub const MAX_ENTRIES_PER_CHUNK: usize = 2000;

/// Consecutive groups longer than this are stored as a fixed-width run;
/// shorter ones are cheaper sparse.
pub const MIN_RUN_LENGTH: usize = 4;

/// Minimum fraction of run payload bytes that must be useful. Extending a
/// run charges every entry the run's full width; entries needing fewer bytes
/// waste the difference.
pub const MIN_GOOD_RATIO: f64 = 0.5;

/// Encoder for one doclen chunk body.
pub struct FixedWidthChunk<'a> {
    entries: &'a [(DocId, TermCount)],
}

impl<'a> FixedWidthChunk<'a> {
    /// `entries` must be sorted by docid with no duplicates.
    pub fn new(entries: &'a [(DocId, TermCount)]) -> Self {
        Self { entries }
    }

    /// Append the encoded body to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        if self.entries.is_empty() {
            return;
        }
        let entries = self.entries;
        let mut prev_did = entries[0].0.wrapping_sub(1);
        let mut i = 0;
        while i < entries.len() {
            let width = codec::max_bytes(entries[i].1);
            let mut run_len = 1usize;
            let mut used_bytes = 0usize;
            let mut good_bytes = 0usize;
            while i + run_len < entries.len() && run_len < u16::MAX as usize {
                let (did, length) = entries[i + run_len];
                if did != entries[i + run_len - 1].0 + 1 {
                    break;
                }
                let needed = codec::max_bytes(length);
                if needed > width {
                    break;
                }
                used_bytes += width;
                good_bytes += needed;
                if (good_bytes as f64) / (used_bytes as f64) < MIN_GOOD_RATIO {
                    break;
                }
                run_len += 1;
            }

            if run_len > MIN_RUN_LENGTH {
                codec::pack_uint(out, SEPARATOR);
                codec::pack_uint(out, entries[i].0 - prev_did);
                codec::pack_uint_in_bytes(out, run_len as u32, 2);
                codec::pack_uint_in_bytes(out, width as u32, 1);
                for &(_, length) in &entries[i..i + run_len] {
                    codec::pack_uint_in_bytes(out, length, width);
                }
                prev_did = entries[i + run_len - 1].0;
            } else {
                for &(did, length) in &entries[i..i + run_len] {
                    debug_assert_ne!(did - prev_did, SEPARATOR);
                    codec::pack_uint(out, did - prev_did);
                    codec::pack_uint(out, length);
                    prev_did = did;
                }
            }
            i += run_len;
        }
    }
}

/// Decode every entry of a doclen chunk body into an ordered map.
pub fn decode_doclens(body: &[u8], first_did: DocId) -> Result<BTreeMap<DocId, TermCount>> {
    let mut out = BTreeMap::new();
    let mut r = ByteReader::new(body);
    let mut cur_did = first_did.wrapping_sub(1);
    while !r.is_empty() {
        let delta = r.unpack_uint()?;
        if delta != SEPARATOR {
            cur_did = add_did(cur_did, delta)?;
            out.insert(cur_did, r.unpack_uint()?);
            continue;
        }
        let first_delta = r.unpack_uint()?;
        let run_len = r.unpack_uint_in_bytes(2)?;
        let width = read_run_width(&mut r)?;
        cur_did = add_did(cur_did, first_delta)?;
        for offset in 0..run_len {
            out.insert(add_did(cur_did, offset)?, r.unpack_uint_in_bytes(width)?);
        }
        cur_did = add_did(cur_did, run_len.saturating_sub(1))?;
    }
    Ok(out)
}

fn add_did(did: DocId, delta: u32) -> Result<DocId> {
    did.checked_add(delta)
        .ok_or_else(|| Error::Corruption("docid overflow in doclen chunk".to_string()))
}

fn read_run_width(r: &mut ByteReader<'_>) -> Result<usize> {
    let width = r.unpack_uint_in_bytes(1)? as usize;
    if !(1..=4).contains(&width) {
        return Err(Error::Corruption(format!(
            "doclen run width {} out of range",
            width
        )));
    }
    Ok(width)
}

/// Random-access reader over one doclen chunk body.
pub struct FixedWidthChunkReader {
    data: Vec<u8>,
    pos: usize,
    first_did_in_chunk: DocId,
    cur_did: DocId,
    cur_length: TermCount,
    in_run: bool,
    run_remaining: u32,
    bytes_per_len: usize,
    did_before_run: DocId,
    run_start_pos: usize,
    at_end: bool,
}

impl FixedWidthChunkReader {
    /// `data` is the chunk value with the headers stripped. The reader
    /// starts positioned on the first entry (or at the end for an empty
    /// body, as in the synthetic first chunk).
    pub fn new(data: Vec<u8>, first_did_in_chunk: DocId) -> Result<Self> {
        let mut reader = Self {
            data,
            pos: 0,
            first_did_in_chunk,
            cur_did: first_did_in_chunk.wrapping_sub(1),
            cur_length: 0,
            in_run: false,
            run_remaining: 0,
            bytes_per_len: 0,
            did_before_run: 0,
            run_start_pos: 0,
            at_end: false,
        };
        reader.advance()?;
        Ok(reader)
    }

    pub fn docid(&self) -> DocId {
        debug_assert!(!self.at_end);
        self.cur_did
    }

    pub fn doclen(&self) -> TermCount {
        debug_assert!(!self.at_end);
        self.cur_length
    }

    pub fn at_end(&self) -> bool {
        self.at_end
    }

    /// Step to the next entry; false once the chunk is exhausted.
    pub fn advance(&mut self) -> Result<bool> {
        if self.at_end {
            return Ok(false);
        }
        if self.in_run && self.run_remaining > 0 {
            let mut r = ByteReader::at(&self.data, self.pos);
            self.cur_length = r.unpack_uint_in_bytes(self.bytes_per_len)?;
            self.pos = r.pos();
            self.cur_did = add_did(self.cur_did, 1)?;
            self.run_remaining -= 1;
            if self.run_remaining == 0 {
                self.in_run = false;
            }
            return Ok(true);
        }
        if self.pos == self.data.len() {
            self.at_end = true;
            return Ok(false);
        }

        self.run_start_pos = self.pos;
        let mut r = ByteReader::at(&self.data, self.pos);
        let delta = r.unpack_uint()?;
        if delta != SEPARATOR {
            self.in_run = false;
            self.cur_did = add_did(self.cur_did, delta)?;
            self.cur_length = r.unpack_uint()?;
            self.pos = r.pos();
            return Ok(true);
        }

        let first_delta = r.unpack_uint()?;
        let run_len = r.unpack_uint_in_bytes(2)?;
        let width = read_run_width(&mut r)?;
        if run_len == 0 {
            return Err(Error::Corruption("empty doclen run".to_string()));
        }
        self.did_before_run = self.cur_did;
        self.cur_did = add_did(self.cur_did, first_delta)?;
        self.cur_length = r.unpack_uint_in_bytes(width)?;
        self.pos = r.pos();
        self.bytes_per_len = width;
        self.run_remaining = run_len - 1;
        self.in_run = self.run_remaining > 0;
        Ok(true)
    }

    /// Position on `desired_did`, moving backwards if needed. On a miss the
    /// reader rests on the smallest stored docid greater than the target
    /// when this chunk has one, else at the end.
    pub fn seek_to(&mut self, desired_did: DocId) -> Result<bool> {
        if self.at_end {
            self.rewind();
        } else if self.cur_did == desired_did {
            return Ok(true);
        } else if self.in_run {
            if self.did_before_run >= desired_did {
                self.rewind();
            } else {
                // Rescan the current run from its separator.
                self.pos = self.run_start_pos;
                self.cur_did = self.did_before_run;
                self.in_run = false;
                self.run_remaining = 0;
            }
        } else if self.cur_did > desired_did {
            self.rewind();
        }

        loop {
            if self.pos == self.data.len() {
                self.at_end = true;
                return Ok(false);
            }
            self.run_start_pos = self.pos;
            let mut r = ByteReader::at(&self.data, self.pos);
            let delta = r.unpack_uint()?;
            if delta != SEPARATOR {
                self.in_run = false;
                self.cur_did = add_did(self.cur_did, delta)?;
                self.cur_length = r.unpack_uint()?;
                self.pos = r.pos();
                if self.cur_did == desired_did {
                    return Ok(true);
                }
                if self.cur_did > desired_did {
                    return Ok(false);
                }
                continue;
            }

            let first_delta = r.unpack_uint()?;
            let run_len = r.unpack_uint_in_bytes(2)?;
            let width = read_run_width(&mut r)?;
            if run_len == 0 {
                return Err(Error::Corruption("empty doclen run".to_string()));
            }
            self.did_before_run = self.cur_did;
            let run_first = add_did(self.cur_did, first_delta)?;
            let run_last = add_did(run_first, run_len - 1)?;

            if desired_did < run_first {
                // Miss; leave the reader on the run's first entry.
                self.cur_length = r.unpack_uint_in_bytes(width)?;
                self.pos = r.pos();
                self.cur_did = run_first;
                self.bytes_per_len = width;
                self.run_remaining = run_len - 1;
                self.in_run = self.run_remaining > 0;
                return Ok(false);
            }
            if desired_did <= run_last {
                r.skip((desired_did - run_first) as usize * width)?;
                self.cur_length = r.unpack_uint_in_bytes(width)?;
                self.pos = r.pos();
                self.cur_did = desired_did;
                self.bytes_per_len = width;
                self.run_remaining = run_len - 1 - (desired_did - run_first);
                self.in_run = self.run_remaining > 0;
                return Ok(true);
            }
            // Skip the whole run.
            r.skip(run_len as usize * width)?;
            self.pos = r.pos();
            self.cur_did = run_last;
            self.in_run = false;
        }
    }

    /// The stored length of `desired_did`, if present in this chunk.
    pub fn doclen_of(&mut self, desired_did: DocId) -> Result<Option<TermCount>> {
        if self.seek_to(desired_did)? {
            Ok(Some(self.cur_length))
        } else {
            Ok(None)
        }
    }

    fn rewind(&mut self) {
        self.pos = 0;
        self.cur_did = self.first_did_in_chunk.wrapping_sub(1);
        self.in_run = false;
        self.run_remaining = 0;
        self.at_end = false;
    }
}

/// Merges a batch of doclen changes into one chunk and writes the
/// replacement chunk(s) to the table.
pub struct DoclenChunkWriter<'a> {
    original: &'a [u8],
    is_first_chunk: bool,
    first_did_in_chunk: DocId,
}

impl<'a> DoclenChunkWriter<'a> {
    /// `original` is the full previous chunk value, headers included.
    pub fn new(original: &'a [u8], is_first_chunk: bool, first_did_in_chunk: DocId) -> Self {
        Self {
            original,
            is_first_chunk,
            first_did_in_chunk,
        }
    }

    /// Apply `changes` (docid-ordered, [`TOMBSTONE`] meaning delete) and
    /// write the result. Returns false when the merged chunk came out empty,
    /// in which case nothing is written and the caller must repair the chunk
    /// chain around the deleted key.
    pub fn merge<T: SortedTable + ?Sized>(
        &self,
        table: &T,
        changes: &[(DocId, TermCount)],
    ) -> Result<bool> {
        let mut r = ByteReader::new(self.original);
        if self.is_first_chunk {
            chunk::read_first_chunk_header(&mut r)?;
        }
        let (is_last, _) = chunk::read_chunk_header(&mut r, self.first_did_in_chunk)?;
        let body = r.rest();

        let merged = if body.is_empty() {
            changes
                .iter()
                .filter(|&&(_, length)| length != TOMBSTONE)
                .copied()
                .collect()
        } else {
            let original = decode_doclens(body, self.first_did_in_chunk)?;
            merge_ordered(original, changes)
        };

        if merged.is_empty() {
            debug!("doclen chunk emptied out");
            return Ok(false);
        }

        let pieces: Vec<&[(DocId, TermCount)]> = merged.chunks(MAX_ENTRIES_PER_CHUNK).collect();
        for (index, piece) in pieces.iter().enumerate() {
            let first = piece[0].0;
            let last = piece[piece.len() - 1].0;
            let piece_is_first = self.is_first_chunk && index == 0;
            let piece_is_last = is_last && index == pieces.len() - 1;

            let mut value = if piece_is_first {
                chunk::make_first_chunk_header(0, 0, first)
            } else {
                Vec::new()
            };
            value.extend_from_slice(&chunk::make_chunk_header(piece_is_last, first, last));
            FixedWidthChunk::new(piece).encode(&mut value);

            let key = if piece_is_first {
                chunk::postlist_key(b"")
            } else {
                chunk::chunk_key(b"", first)
            };
            table.add(&key, &value);
        }
        Ok(true)
    }
}

/// One-pass ordered merge of the stored entries with a change batch.
fn merge_ordered(
    original: BTreeMap<DocId, TermCount>,
    changes: &[(DocId, TermCount)],
) -> Vec<(DocId, TermCount)> {
    let mut merged = Vec::with_capacity(original.len() + changes.len());
    let mut pending = changes.iter().copied().peekable();
    for (did, length) in original {
        loop {
            match pending.peek() {
                Some(&(change_did, change_length)) if change_did < did => {
                    pending.next();
                    if change_length != TOMBSTONE {
                        merged.push((change_did, change_length));
                    }
                }
                Some(&(change_did, change_length)) if change_did == did => {
                    pending.next();
                    if change_length != TOMBSTONE {
                        merged.push((did, change_length));
                    }
                    break;
                }
                _ => {
                    merged.push((did, length));
                    break;
                }
            }
        }
    }
    for (change_did, change_length) in pending {
        if change_length != TOMBSTONE {
            merged.push((change_did, change_length));
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(entries: &[(DocId, TermCount)]) -> Vec<u8> {
        let mut out = Vec::new();
        FixedWidthChunk::new(entries).encode(&mut out);
        out
    }

    fn count_separators(entries: &[(DocId, TermCount)]) -> usize {
        let body = encode(entries);
        let mut r = ByteReader::new(&body);
        let mut count = 0;
        while !r.is_empty() {
            let delta = r.unpack_uint().unwrap();
            if delta == SEPARATOR {
                count += 1;
                r.unpack_uint().unwrap();
                let run_len = r.unpack_uint_in_bytes(2).unwrap();
                let width = r.unpack_uint_in_bytes(1).unwrap() as usize;
                r.skip(run_len as usize * width).unwrap();
            } else {
                r.unpack_uint().unwrap();
            }
        }
        count
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let entries: Vec<(DocId, TermCount)> = vec![
            (1, 5),
            (2, 5),
            (3, 5),
            (4, 5),
            (5, 5),
            (100, 9),
            (101, 9),
            (102, 9),
            (500, 70000),
        ];
        let body = encode(&entries);
        let decoded = decode_doclens(&body, 1).unwrap();
        assert_eq!(decoded.into_iter().collect::<Vec<_>>(), entries);
    }

    #[test]
    fn test_run_threshold() {
        // Five consecutive entries earn a run; three stay sparse.
        let five: Vec<(DocId, TermCount)> = (1..=5).map(|i| (i, 7)).collect();
        assert_eq!(count_separators(&five), 1);

        let three: Vec<(DocId, TermCount)> = (1..=3).map(|i| (i, 7)).collect();
        assert_eq!(count_separators(&three), 0);
    }

    #[test]
    fn test_run_breaks_on_wider_length() {
        // A length needing more bytes than the run's width ends the run.
        let mut entries: Vec<(DocId, TermCount)> = (1..=6).map(|i| (i, 200)).collect();
        entries.push((7, 70000));
        let body = encode(&entries);
        let decoded = decode_doclens(&body, 1).unwrap();
        assert_eq!(decoded.len(), 7);
        assert_eq!(decoded[&7], 70000);
        assert_eq!(count_separators(&entries), 1);
    }

    #[test]
    fn test_run_good_ratio() {
        // Walk any encoded body and check every run wastes at most half its
        // payload bytes.
        let mut entries: Vec<(DocId, TermCount)> = (1..=50).map(|i| (i, 65000)).collect();
        for i in 0..entries.len() {
            if i % 3 != 0 {
                entries[i].1 = 3; // 1-byte lengths interleaved with 2-byte ones
            }
        }
        let body = encode(&entries);
        let mut r = ByteReader::new(&body);
        while !r.is_empty() {
            let delta = r.unpack_uint().unwrap();
            if delta != SEPARATOR {
                r.unpack_uint().unwrap();
                continue;
            }
            r.unpack_uint().unwrap();
            let run_len = r.unpack_uint_in_bytes(2).unwrap();
            let width = r.unpack_uint_in_bytes(1).unwrap() as usize;
            let mut good = 0usize;
            for _ in 0..run_len {
                good += codec::max_bytes(r.unpack_uint_in_bytes(width).unwrap());
            }
            let used = run_len as usize * width;
            assert!(
                good as f64 / used as f64 >= MIN_GOOD_RATIO,
                "run wastes too much: {}/{}",
                good,
                used
            );
        }
    }

    #[test]
    fn test_reader_sequential() {
        let entries: Vec<(DocId, TermCount)> =
            vec![(1, 5), (2, 5), (3, 5), (4, 5), (5, 5), (100, 9), (101, 9)];
        let mut reader = FixedWidthChunkReader::new(encode(&entries), 1).unwrap();
        let mut seen = Vec::new();
        while !reader.at_end() {
            seen.push((reader.docid(), reader.doclen()));
            reader.advance().unwrap();
        }
        assert_eq!(seen, entries);
    }

    #[test]
    fn test_reader_empty_body() {
        let reader = FixedWidthChunkReader::new(Vec::new(), 0).unwrap();
        assert!(reader.at_end());
    }

    #[test]
    fn test_seek_matrix() {
        let entries: Vec<(DocId, TermCount)> = vec![
            (1, 5),
            (2, 5),
            (3, 5),
            (4, 5),
            (5, 5),
            (100, 9),
            (101, 9),
            (102, 9),
            (500, 1),
        ];
        let mut reader = FixedWidthChunkReader::new(encode(&entries), 1).unwrap();

        // Hit inside the run.
        assert!(reader.seek_to(3).unwrap());
        assert_eq!(reader.doclen(), 5);
        // Forward hit on a sparse entry.
        assert!(reader.seek_to(101).unwrap());
        assert_eq!(reader.doclen(), 9);
        // Backwards into the run again.
        assert!(reader.seek_to(4).unwrap());
        assert_eq!(reader.doclen(), 5);
        // Miss in a gap: lands on the next stored docid.
        assert!(!reader.seek_to(50).unwrap());
        assert_eq!(reader.docid(), 100);
        // Miss before a sparse entry.
        assert!(!reader.seek_to(200).unwrap());
        assert_eq!(reader.docid(), 500);
        // Miss past the end of the chunk.
        assert!(!reader.seek_to(1000).unwrap());
        assert!(reader.at_end());
        // Seeking after the end rewinds.
        assert!(reader.seek_to(2).unwrap());
        assert_eq!(reader.doclen(), 5);
    }

    #[test]
    fn test_doclen_of() {
        let entries: Vec<(DocId, TermCount)> = (10..=20).map(|i| (i, i * 2)).collect();
        let mut reader = FixedWidthChunkReader::new(encode(&entries), 10).unwrap();
        assert_eq!(reader.doclen_of(15).unwrap(), Some(30));
        assert_eq!(reader.doclen_of(11).unwrap(), Some(22));
        assert_eq!(reader.doclen_of(9).unwrap(), None);
        assert_eq!(reader.doclen_of(21).unwrap(), None);
    }

    #[test]
    fn test_merge_ordered() {
        let original: BTreeMap<DocId, TermCount> = [(1, 10), (3, 30), (5, 50)].into();
        let changes = [(2u32, 20u32), (3, TOMBSTONE), (5, 55), (9, 90)];
        assert_eq!(
            merge_ordered(original, &changes),
            vec![(1, 10), (2, 20), (5, 55), (9, 90)]
        );
    }

    #[test]
    fn test_merge_all_tombstones_is_empty() {
        let original: BTreeMap<DocId, TermCount> = [(1, 10), (2, 20)].into();
        let changes = [(1u32, TOMBSTONE), (2, TOMBSTONE)];
        assert!(merge_ordered(original, &changes).is_empty());
    }
}
