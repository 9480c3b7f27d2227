//! Chunk keys and chunk header framing
//!
//! A posting list is split into chunks, each stored under one table key:
//!
//! - First chunk key: the term packed sort-preserving.
//! - Later chunk keys: the same, followed by the chunk's first docid packed
//!   sort-preserving, so all chunks of a term are contiguous and ordered by
//!   first docid with the first chunk in front.
//!
//! Every chunk value starts with an ordinary header: a bool flagging the last
//! chunk of the list, then the difference between the chunk's final and first
//! docid. The first chunk is prefixed with an extra header carrying the
//! list aggregates: entry count, collection frequency, and `first_did - 1`.

use crate::codec::{self, ByteReader};
use crate::error::Result;
use crate::{DocCount, DocId, TermCount};

/// Key of the first chunk of `term`'s posting list.
pub fn postlist_key(term: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(term.len() + 1);
    codec::pack_string_preserving_sort(&mut key, term);
    key
}

/// Key of a non-first chunk whose first entry is `first_did`.
pub fn chunk_key(term: &[u8], first_did: DocId) -> Vec<u8> {
    let mut key = postlist_key(term);
    codec::pack_uint_preserving_sort(&mut key, first_did);
    key
}

/// Which chunk of a posting list a table key addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKey {
    /// The key of the list's first chunk (no docid suffix).
    First,
    /// A later chunk, keyed by its first docid.
    Later(DocId),
}

/// Parse `key` as one of `term`'s chunk keys. `None` when the key belongs
/// to a different term; a docid suffix that fails to decode is corruption.
pub fn parse_chunk_key(key: &[u8], term: &[u8]) -> Result<Option<ChunkKey>> {
    let mut reader = ByteReader::new(key);
    let Ok(name) = reader.unpack_string_preserving_sort() else {
        return Ok(None);
    };
    if name != term {
        return Ok(None);
    }
    if reader.is_empty() {
        Ok(Some(ChunkKey::First))
    } else {
        Ok(Some(ChunkKey::Later(reader.unpack_uint_preserving_sort()?)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirstChunkHeader {
    pub termfreq: DocCount,
    pub collfreq: TermCount,
    pub first_did: DocId,
}

/// Build the extra header carried only by a first chunk.
///
/// `first_did` is stored off by one; the wrapping arithmetic lets the
/// synthetic header-only chunks store a docid of zero.
pub fn make_first_chunk_header(
    termfreq: DocCount,
    collfreq: TermCount,
    first_did: DocId,
) -> Vec<u8> {
    let mut header = Vec::new();
    codec::pack_uint(&mut header, termfreq);
    codec::pack_uint(&mut header, collfreq);
    codec::pack_uint(&mut header, first_did.wrapping_sub(1));
    header
}

/// Build the ordinary header present in every chunk.
pub fn make_chunk_header(is_last: bool, first_did: DocId, last_did: DocId) -> Vec<u8> {
    debug_assert!(last_did >= first_did);
    let mut header = Vec::new();
    codec::pack_bool(&mut header, is_last);
    codec::pack_uint(&mut header, last_did - first_did);
    header
}

pub fn read_first_chunk_header(reader: &mut ByteReader<'_>) -> Result<FirstChunkHeader> {
    let termfreq = reader.unpack_uint()?;
    let collfreq = reader.unpack_uint()?;
    let first_did = reader.unpack_uint()?.wrapping_add(1);
    Ok(FirstChunkHeader {
        termfreq,
        collfreq,
        first_did,
    })
}

/// Read the ordinary header; returns `(is_last, last_did)`.
pub fn read_chunk_header(reader: &mut ByteReader<'_>, first_did: DocId) -> Result<(bool, DocId)> {
    let is_last = reader.unpack_bool()?;
    let increase_to_last = reader.unpack_uint()?;
    let last_did = first_did.wrapping_add(increase_to_last);
    Ok((is_last, last_did))
}

/// Replace the ordinary header at `start..end` of `chunk` in place. Used to
/// move the last-chunk flag without touching the body.
pub fn rewrite_chunk_header(
    chunk: &mut Vec<u8>,
    start: usize,
    end: usize,
    is_last: bool,
    first_did: DocId,
    last_did: DocId,
) {
    debug_assert!(start <= end && end <= chunk.len());
    let header = make_chunk_header(is_last, first_did, last_did);
    chunk.splice(start..end, header);
}
