//! Chunk codec: byte ranges for each part and the base64 transport encoding.
//!
//! Part numbers are 1-based. Every range is `chunk_size` bytes long except the
//! last, which carries the remainder, so the ranges always tile the file.

use base64::{Engine as _, engine::general_purpose};
use bytes::{Bytes, BytesMut};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("chunk payload is not valid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("chunk payload is empty")]
    EmptyChunk,
}

/// One contiguous slice of the source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub part_number: u32,
    pub offset: u64,
    pub len: u64,
}

impl ChunkRange {
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// `ceil(total / chunk_size)`, saturating at `u32::MAX`.
pub fn total_chunks(total: u64, chunk_size: u64) -> u32 {
    if chunk_size == 0 {
        return 0;
    }
    u32::try_from(total.div_ceil(chunk_size)).unwrap_or(u32::MAX)
}

/// Iterator over the ranges of a `total`-byte file.
#[derive(Debug, Clone)]
pub struct ChunkRanges {
    total: u64,
    chunk_size: u64,
    next_offset: u64,
    next_part: u32,
}

pub fn chunk_ranges(total: u64, chunk_size: u64) -> ChunkRanges {
    ChunkRanges {
        total,
        chunk_size,
        next_offset: 0,
        next_part: 1,
    }
}

impl Iterator for ChunkRanges {
    type Item = ChunkRange;

    fn next(&mut self) -> Option<Self::Item> {
        if self.chunk_size == 0 || self.next_offset >= self.total {
            return None;
        }
        let len = self.chunk_size.min(self.total - self.next_offset);
        let range = ChunkRange {
            part_number: self.next_part,
            offset: self.next_offset,
            len,
        };
        self.next_offset += len;
        self.next_part += 1;
        Some(range)
    }
}

/// Split an in-memory buffer along [`chunk_ranges`].
pub fn split(data: &Bytes, chunk_size: u64) -> Vec<(u32, Bytes)> {
    chunk_ranges(data.len() as u64, chunk_size)
        .map(|range| {
            let start = range.offset as usize;
            let end = range.end() as usize;
            (range.part_number, data.slice(start..end))
        })
        .collect()
}

pub fn encode_chunk(chunk: &[u8]) -> String {
    general_purpose::STANDARD.encode(chunk)
}

/// Decode a transported chunk. A `data:<mime>;base64,` prefix is tolerated.
pub fn decode_chunk(payload: &str) -> Result<Bytes, CodecError> {
    let trimmed = payload.trim();
    let body = match trimmed.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => trimmed,
    };
    let decoded = general_purpose::STANDARD.decode(body)?;
    if decoded.is_empty() {
        return Err(CodecError::EmptyChunk);
    }
    Ok(Bytes::from(decoded))
}

/// Concatenate parts in ascending part-number order, whatever order they
/// arrive in.
pub fn reassemble<I>(parts: I) -> Bytes
where
    I: IntoIterator<Item = (u32, Bytes)>,
{
    let mut parts: Vec<(u32, Bytes)> = parts.into_iter().collect();
    parts.sort_by_key(|(part_number, _)| *part_number);
    let total = parts.iter().map(|(_, chunk)| chunk.len()).sum();
    let mut out = BytesMut::with_capacity(total);
    for (_, chunk) in parts {
        out.extend_from_slice(&chunk);
    }
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i * 31 % 251) as u8).collect::<Vec<u8>>())
    }

    #[test]
    fn ranges_tile_the_file() {
        let ranges: Vec<_> = chunk_ranges(25, 10).collect();
        let tiles: Vec<(u32, u64, u64)> = ranges
            .iter()
            .map(|range| (range.part_number, range.offset, range.len))
            .collect();
        assert_eq!(tiles, vec![(1, 0, 10), (2, 10, 10), (3, 20, 5)]);
        assert_eq!(ranges[2].end(), 25);
        assert_eq!(chunk_ranges(20, 10).count(), 2);
        assert_eq!(chunk_ranges(0, 10).count(), 0);
        assert_eq!(total_chunks(25, 10), 3);
        assert_eq!(total_chunks(20, 10), 2);
        assert_eq!(total_chunks(1, 10), 1);
    }

    #[test]
    fn round_trip_through_base64_restores_bytes() {
        for (len, chunk) in [(1, 4), (4096, 1000), (4000, 1000), (9_999, 7)] {
            let data = sample(len);
            let wire: Vec<(u32, String)> = split(&data, chunk)
                .into_iter()
                .map(|(n, c)| (n, encode_chunk(&c)))
                .collect();
            let decoded = wire
                .into_iter()
                .map(|(n, s)| (n, decode_chunk(&s).unwrap()));
            assert_eq!(reassemble(decoded), data);
        }
    }

    #[test]
    fn reassemble_orders_by_part_number() {
        let parts = vec![
            (3, Bytes::from_static(b"ef")),
            (1, Bytes::from_static(b"ab")),
            (2, Bytes::from_static(b"cd")),
        ];
        assert_eq!(reassemble(parts), Bytes::from_static(b"abcdef"));
    }

    #[test]
    fn decode_accepts_data_url_and_rejects_garbage() {
        let encoded = format!("data:video/mp4;base64,{}", encode_chunk(b"hello"));
        assert_eq!(decode_chunk(&encoded).unwrap(), Bytes::from_static(b"hello"));
        assert!(matches!(decode_chunk("!!!"), Err(CodecError::InvalidBase64(_))));
        assert!(matches!(decode_chunk(""), Err(CodecError::EmptyChunk)));
    }
}
