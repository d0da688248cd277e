//! Block codec for physical log segments
//!
//! ## Segment layout (all fields little-endian)
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Prologue: magic(8) version(4) endian(4)      │
//! ├──────────────────────────────────────────────┤
//! │ Block │ Block │ Block │ ...                  │
//! └──────────────────────────────────────────────┘
//!
//! Block header (8 bytes):
//! ┌──────┬──────────┬───────────┬──────────────┐
//! │ kind │ reserved │ stream_id │ payload_size │
//! │ 1B   │ 1B       │ 2B        │ 4B           │
//! └──────┴──────────┴───────────┴──────────────┘
//!
//! Stream payload:
//!   stream_type(1) name(4+N) type_name(4+N) [type_description(4+N)] [metadata(4+N)]
//!
//! Data payload:
//!   realtime(4+4) logical(4+4) data_size(4) compressed(1) bytes...
//! ```
//!
//! `data_size` is the uncompressed sample size; the stored bytes fill the rest of
//! the block payload.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::config::CompressionConfig;
use crate::error::{FormatError, ReplayError, ReplayResult};
use crate::segments::ByteSource;
use crate::time::Time;

/// Magic token at offset 0 of every segment
pub const SEGMENT_MAGIC: &[u8; 8] = b"RPLYLOG\0";
/// Segment format revision written and accepted by this implementation
pub const FORMAT_VERSION: u32 = 3;
/// Prologue size (magic + version + endian flag)
pub const PROLOGUE_SIZE: usize = 16;
/// Block header size
pub const BLOCK_HEADER_SIZE: usize = 8;
/// Fixed part of a data block payload
pub const DATA_HEADER_SIZE: usize = 21;
/// Smallest valid stream declaration payload (type byte + two empty strings)
pub const STREAM_BLOCK_MIN_SIZE: usize = 9;

/// Stream declaration discriminator for regular sample streams
pub const STREAM_TYPE_DATA: u8 = 1;

const ENDIAN_LITTLE: u32 = 0;
const ENDIAN_BIG: u32 = 1;

/// Kind byte of a block header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    Stream = 1,
    Data = 2,
    Control = 3,
}

impl BlockKind {
    pub fn from_u8(value: u8) -> Result<Self, FormatError> {
        match value {
            1 => Ok(BlockKind::Stream),
            2 => Ok(BlockKind::Data),
            3 => Ok(BlockKind::Control),
            other => Err(FormatError::UnknownBlockKind(other)),
        }
    }
}

/// Fixed 8-byte block header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub kind: BlockKind,
    pub stream_id: u16,
    pub payload_size: u32,
}

impl BlockHeader {
    pub fn encode(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut buf = [0u8; BLOCK_HEADER_SIZE];
        buf[0] = self.kind as u8;
        buf[2..4].copy_from_slice(&self.stream_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.payload_size.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; BLOCK_HEADER_SIZE]) -> Result<Self, FormatError> {
        Ok(Self {
            kind: BlockKind::from_u8(buf[0])?,
            stream_id: u16::from_le_bytes([buf[2], buf[3]]),
            payload_size: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }
}

/// File-level header, once per segment at offset 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prologue {
    pub version: u32,
    pub big_endian: bool,
}

impl Prologue {
    pub fn new(big_endian: bool) -> Self {
        Self {
            version: FORMAT_VERSION,
            big_endian,
        }
    }

    pub fn encode(&self) -> [u8; PROLOGUE_SIZE] {
        let mut buf = [0u8; PROLOGUE_SIZE];
        buf[0..8].copy_from_slice(SEGMENT_MAGIC);
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        let flag = if self.big_endian { ENDIAN_BIG } else { ENDIAN_LITTLE };
        buf[12..16].copy_from_slice(&flag.to_le_bytes());
        buf
    }

    /// Parse and check a prologue. Versions other than [`FORMAT_VERSION`] are
    /// rejected, never reinterpreted.
    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < PROLOGUE_SIZE || &buf[0..8] != SEGMENT_MAGIC {
            return Err(FormatError::MissingPrologue);
        }
        let version = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let flag = u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);

        if version < FORMAT_VERSION {
            return Err(FormatError::ObsoleteFormat {
                found: version,
                supported: FORMAT_VERSION,
            });
        }
        if version > FORMAT_VERSION {
            return Err(FormatError::UnsupportedFormat {
                found: version,
                supported: FORMAT_VERSION,
            });
        }

        Ok(Self {
            version,
            big_endian: flag == ENDIAN_BIG,
        })
    }
}

/// Write the segment prologue
pub fn write_prologue<W: Write>(writer: &mut W, big_endian: bool) -> ReplayResult<()> {
    writer.write_all(&Prologue::new(big_endian).encode())?;
    Ok(())
}

/// Bounds-checked reader over a block payload
pub struct PayloadCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn read_bytes(&mut self, len: usize) -> ReplayResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(ReplayError::truncated(format!(
                "need {} bytes at payload offset {}, only {} left",
                len,
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> ReplayResult<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u32(&mut self) -> ReplayResult<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_time(&mut self) -> ReplayResult<Time> {
        let secs = self.read_u32()?;
        let usecs = self.read_u32()?;
        Ok(Time::from_parts(secs, usecs))
    }

    /// Length-prefixed byte string
    pub fn read_prefixed(&mut self) -> ReplayResult<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.read_bytes(len)
    }

    pub fn read_string(&mut self) -> ReplayResult<String> {
        let bytes = self.read_prefixed()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| ReplayError::inconsistent(format!("invalid UTF-8 in string: {}", e)))
    }
}

fn put_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn put_time(buf: &mut Vec<u8>, time: Time) -> ReplayResult<()> {
    let (secs, usecs) = time.to_parts()?;
    buf.extend_from_slice(&secs.to_le_bytes());
    buf.extend_from_slice(&usecs.to_le_bytes());
    Ok(())
}

/// Payload of a Stream block
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamDeclaration {
    pub name: String,
    pub type_name: String,
    /// Opaque type description, interpreted by the marshalling layer
    pub type_description: Vec<u8>,
    /// Serialized key/value metadata
    pub metadata: Vec<u8>,
}

impl StreamDeclaration {
    pub fn new<N: Into<String>, T: Into<String>>(name: N, type_name: T) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            ..Default::default()
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            STREAM_BLOCK_MIN_SIZE
                + 8
                + self.name.len()
                + self.type_name.len()
                + self.type_description.len()
                + self.metadata.len(),
        );
        buf.push(STREAM_TYPE_DATA);
        put_prefixed(&mut buf, self.name.as_bytes());
        put_prefixed(&mut buf, self.type_name.as_bytes());
        put_prefixed(&mut buf, &self.type_description);
        put_prefixed(&mut buf, &self.metadata);
        buf
    }

    pub fn decode(payload: &[u8]) -> ReplayResult<Self> {
        if payload.len() < STREAM_BLOCK_MIN_SIZE {
            return Err(ReplayError::truncated(format!(
                "stream block of {} bytes is shorter than the minimum {}",
                payload.len(),
                STREAM_BLOCK_MIN_SIZE
            )));
        }

        let mut cursor = PayloadCursor::new(payload);
        let stream_type = cursor.read_u8()?;
        if stream_type != STREAM_TYPE_DATA {
            return Err(ReplayError::inconsistent(format!(
                "unknown stream type {}",
                stream_type
            )));
        }
        let name = cursor.read_string()?;
        let type_name = cursor.read_string()?;

        // Older writers stop after the type name
        let type_description = if cursor.remaining() > 0 {
            cursor.read_prefixed()?.to_vec()
        } else {
            Vec::new()
        };
        let metadata = if cursor.remaining() > 0 {
            cursor.read_prefixed()?.to_vec()
        } else {
            Vec::new()
        };

        Ok(Self {
            name,
            type_name,
            type_description,
            metadata,
        })
    }

    /// Same stream as far as a re-declaration is concerned
    pub fn matches(&self, other: &StreamDeclaration) -> bool {
        self.name == other.name && self.type_name == other.type_name
    }
}

/// Fixed prefix of a Data block payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub realtime: Time,
    pub logical: Time,
    /// Uncompressed sample size
    pub data_size: u32,
    pub compressed: bool,
}

impl DataHeader {
    /// Fails with `InvalidInput` if a time has no on-disk form
    pub fn encode(&self) -> ReplayResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(DATA_HEADER_SIZE);
        put_time(&mut buf, self.realtime)?;
        put_time(&mut buf, self.logical)?;
        buf.extend_from_slice(&self.data_size.to_le_bytes());
        buf.push(self.compressed as u8);
        Ok(buf)
    }

    pub fn decode(payload: &[u8]) -> ReplayResult<Self> {
        let mut cursor = PayloadCursor::new(payload);
        Ok(Self {
            realtime: cursor.read_time()?,
            logical: cursor.read_time()?,
            data_size: cursor.read_u32()?,
            compressed: cursor.read_u8()? != 0,
        })
    }
}

/// Compress data using gzip.
pub fn compress_data(data: &[u8], level: u32) -> ReplayResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level.min(9)));
    encoder
        .write_all(data)
        .map_err(|e| ReplayError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| ReplayError::Compression(e.to_string()))
}

/// Decompress gzip-compressed data.
pub fn decompress_data(data: &[u8], expected_size: usize) -> ReplayResult<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::with_capacity(expected_size);
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| ReplayError::Compression(e.to_string()))?;
    if decompressed.len() != expected_size {
        return Err(ReplayError::Compression(format!(
            "decompressed {} bytes, header announced {}",
            decompressed.len(),
            expected_size
        )));
    }
    Ok(decompressed)
}

/// Pick the stored form of a payload: compressed only when it is large enough
/// and the compressed form is smaller by more than `min_ratio`.
pub fn encode_payload(data: &[u8], config: &CompressionConfig) -> ReplayResult<(Vec<u8>, bool)> {
    if data.is_empty() || data.len() < config.min_size {
        return Ok((data.to_vec(), false));
    }

    let compressed = compress_data(data, config.level)?;
    let reduction = 1.0 - compressed.len() as f64 / data.len() as f64;
    if reduction > config.min_ratio {
        log::debug!(
            "storing {} byte payload compressed to {} bytes",
            data.len(),
            compressed.len()
        );
        Ok((compressed, true))
    } else {
        Ok((data.to_vec(), false))
    }
}

/// Encode a complete Stream block (header + payload)
pub fn encode_stream_block(stream_id: u16, declaration: &StreamDeclaration) -> Vec<u8> {
    let payload = declaration.encode();
    let header = BlockHeader {
        kind: BlockKind::Stream,
        stream_id,
        payload_size: payload.len() as u32,
    };
    let mut block = Vec::with_capacity(BLOCK_HEADER_SIZE + payload.len());
    block.extend_from_slice(&header.encode());
    block.extend_from_slice(&payload);
    block
}

/// Encode a complete Data block (header + payload)
pub fn encode_data_block(
    stream_id: u16,
    realtime: Time,
    logical: Time,
    data: &[u8],
    config: &CompressionConfig,
) -> ReplayResult<Vec<u8>> {
    let data_size = u32::try_from(data.len())
        .map_err(|_| ReplayError::invalid_input(format!("sample of {} bytes is too large", data.len())))?;
    let (stored, compressed) = encode_payload(data, config)?;
    let header = DataHeader {
        realtime,
        logical,
        data_size,
        compressed,
    }
    .encode()?;

    let payload_size = u32::try_from(DATA_HEADER_SIZE + stored.len())
        .map_err(|_| ReplayError::invalid_input("data block payload exceeds 4 GiB"))?;
    let block_header = BlockHeader {
        kind: BlockKind::Data,
        stream_id,
        payload_size,
    };

    let mut block = Vec::with_capacity(BLOCK_HEADER_SIZE + payload_size as usize);
    block.extend_from_slice(&block_header.encode());
    block.extend_from_slice(&header);
    block.extend_from_slice(&stored);
    Ok(block)
}

/// Sequential/random block reader over a [`ByteSource`]
///
/// Keeps a read-ahead buffer; [`BlockStream::tell`] accounts for it so positions
/// handed out are exact byte offsets in the source.
pub struct BlockStream<S> {
    source: S,
    buffer: Vec<u8>,
    buffer_pos: usize,
    chunk_size: usize,
    current: Option<BlockHeader>,
    block_position: u64,
    payload_remaining: u64,
}

impl<S: ByteSource> BlockStream<S> {
    pub fn new(source: S) -> Self {
        Self::with_buffer_size(source, 64 * 1024)
    }

    pub fn with_buffer_size(source: S, chunk_size: usize) -> Self {
        Self {
            source,
            buffer: Vec::new(),
            buffer_pos: 0,
            chunk_size: chunk_size.max(1),
            current: None,
            block_position: 0,
            payload_remaining: 0,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn into_source(self) -> S {
        self.source
    }

    /// Exact position of the next unread byte
    pub fn tell(&self) -> u64 {
        self.source.tell() - (self.buffer.len() - self.buffer_pos) as u64
    }

    pub fn size(&self) -> u64 {
        self.source.size()
    }

    /// Header of the block being read, if any
    pub fn current_block(&self) -> Option<&BlockHeader> {
        self.current.as_ref()
    }

    /// Offset of the header of the block being read
    pub fn block_position(&self) -> u64 {
        self.block_position
    }

    /// Move to an absolute offset, normally the start of a block
    pub fn seek(&mut self, offset: u64) -> ReplayResult<()> {
        self.current = None;
        self.payload_remaining = 0;

        let buffer_start = self.source.tell() - self.buffer.len() as u64;
        if offset >= buffer_start && offset < self.source.tell() {
            self.buffer_pos = (offset - buffer_start) as usize;
            return Ok(());
        }

        self.source.seek(offset)?;
        self.buffer.clear();
        self.buffer_pos = 0;
        Ok(())
    }

    fn fill(&mut self) -> ReplayResult<usize> {
        if self.buffer_pos > 0 {
            self.buffer.drain(..self.buffer_pos);
            self.buffer_pos = 0;
        }
        let old_len = self.buffer.len();
        self.buffer.resize(old_len + self.chunk_size, 0);
        let n = match self.source.read(&mut self.buffer[old_len..]) {
            Ok(n) => n,
            Err(e) => {
                self.buffer.truncate(old_len);
                return Err(e);
            }
        };
        self.buffer.truncate(old_len + n);
        Ok(n)
    }

    /// Read up to `out.len()` bytes; fewer only at the end of the source
    fn read_into(&mut self, out: &mut [u8]) -> ReplayResult<usize> {
        let mut done = 0;
        while done < out.len() {
            if self.buffer_pos == self.buffer.len() && self.fill()? == 0 {
                break;
            }
            let available = self.buffer.len() - self.buffer_pos;
            let n = available.min(out.len() - done);
            out[done..done + n].copy_from_slice(&self.buffer[self.buffer_pos..self.buffer_pos + n]);
            self.buffer_pos += n;
            done += n;
        }
        Ok(done)
    }

    fn read_exact_or_truncated(&mut self, len: usize, what: &str) -> ReplayResult<Vec<u8>> {
        let position = self.tell();
        let mut out = vec![0u8; len];
        let n = self.read_into(&mut out)?;
        if n < len {
            return Err(ReplayError::truncated(format!(
                "{} at offset {}: expected {} bytes, got {}",
                what, position, len, n
            )));
        }
        Ok(out)
    }

    /// Skip `len` bytes, returning how many could actually be skipped
    fn skip_bytes(&mut self, len: u64) -> ReplayResult<u64> {
        let buffered = (self.buffer.len() - self.buffer_pos) as u64;
        if len <= buffered {
            self.buffer_pos += len as usize;
            return Ok(len);
        }

        let start = self.tell();
        let target = start + len;
        let size = self.source.size();
        self.buffer.clear();
        self.buffer_pos = 0;

        if target < size {
            self.source.seek(target)?;
            Ok(len)
        } else if size > start {
            // Land exactly on the end: seek to the last byte and consume it
            self.source.seek(size - 1)?;
            let mut last = [0u8; 1];
            self.source.read(&mut last)?;
            Ok(size - start)
        } else {
            Ok(0)
        }
    }

    /// Read and check the prologue at offset 0
    pub fn read_prologue(&mut self) -> ReplayResult<Prologue> {
        if self.source.size() == 0 {
            return Err(FormatError::MissingPrologue.into());
        }
        self.seek(0)?;
        let mut buf = [0u8; PROLOGUE_SIZE];
        let n = self.read_into(&mut buf)?;
        if n < PROLOGUE_SIZE {
            return Err(FormatError::MissingPrologue.into());
        }
        Ok(Prologue::decode(&buf)?)
    }

    /// Read the next block header, skipping whatever is left of the previous
    /// block's payload. Returns `None` at the end of the data.
    pub fn read_next_block_header(&mut self) -> ReplayResult<Option<BlockHeader>> {
        if self.payload_remaining > 0 {
            let wanted = self.payload_remaining;
            let skipped = self.skip_bytes(wanted)?;
            if skipped < wanted {
                return Err(ReplayError::truncated(format!(
                    "block at offset {} announces {} more payload bytes, only {} available",
                    self.block_position, wanted, skipped
                )));
            }
            self.payload_remaining = 0;
        }
        self.current = None;

        let position = self.tell();
        let mut buf = [0u8; BLOCK_HEADER_SIZE];
        let n = self.read_into(&mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        if n < BLOCK_HEADER_SIZE {
            return Err(ReplayError::truncated(format!(
                "partial block header at offset {} ({} of {} bytes)",
                position, n, BLOCK_HEADER_SIZE
            )));
        }

        let header = BlockHeader::decode(&buf)?;
        let available = self.source.size() - self.tell();
        if header.payload_size as u64 > available {
            return Err(ReplayError::truncated(format!(
                "block at offset {} announces {} payload bytes, only {} available",
                position, header.payload_size, available
            )));
        }

        self.block_position = position;
        self.current = Some(header);
        self.payload_remaining = header.payload_size as u64;
        Ok(Some(header))
    }

    fn expect_kind(&self, kind: BlockKind) -> ReplayResult<BlockHeader> {
        match self.current {
            Some(header) if header.kind == kind => Ok(header),
            Some(header) => Err(ReplayError::inconsistent(format!(
                "expected a {:?} block at offset {}, found {:?}",
                kind, self.block_position, header.kind
            ))),
            None => Err(ReplayError::invalid_input(format!(
                "no current block, expected {:?}",
                kind
            ))),
        }
    }

    /// Parse the current block as a stream declaration
    pub fn read_stream_block(&mut self) -> ReplayResult<StreamDeclaration> {
        let header = self.expect_kind(BlockKind::Stream)?;
        if (header.payload_size as usize) < STREAM_BLOCK_MIN_SIZE {
            return Err(ReplayError::truncated(format!(
                "stream block at offset {} has {} bytes, minimum is {}",
                self.block_position, header.payload_size, STREAM_BLOCK_MIN_SIZE
            )));
        }
        let payload = self.read_payload(self.payload_remaining as usize)?;
        StreamDeclaration::decode(&payload)
    }

    /// Parse the fixed prefix of the current data block
    pub fn read_data_block_header(&mut self) -> ReplayResult<DataHeader> {
        let header = self.expect_kind(BlockKind::Data)?;
        if (header.payload_size as usize) < DATA_HEADER_SIZE
            || self.payload_remaining < DATA_HEADER_SIZE as u64
        {
            return Err(ReplayError::truncated(format!(
                "data block at offset {} too short for its header",
                self.block_position
            )));
        }
        let raw = self.read_payload(DATA_HEADER_SIZE)?;
        DataHeader::decode(&raw)
    }

    /// Raw bytes of the current block's payload
    pub fn read_payload(&mut self, len: usize) -> ReplayResult<Vec<u8>> {
        if len as u64 > self.payload_remaining {
            return Err(ReplayError::truncated(format!(
                "requested {} payload bytes, block at offset {} has {} left",
                len, self.block_position, self.payload_remaining
            )));
        }
        let out = self.read_exact_or_truncated(len, "block payload")?;
        self.payload_remaining -= len as u64;
        Ok(out)
    }

    /// Skip the rest of the current block's payload
    pub fn skip_payload(&mut self) -> ReplayResult<()> {
        let wanted = self.payload_remaining;
        let skipped = self.skip_bytes(wanted)?;
        self.payload_remaining -= skipped;
        if skipped < wanted {
            return Err(ReplayError::truncated(format!(
                "block at offset {} ends {} bytes early",
                self.block_position,
                wanted - skipped
            )));
        }
        Ok(())
    }

    /// Sample bytes of the current data block, decompressed if needed. Must be
    /// called right after [`BlockStream::read_data_block_header`].
    pub fn read_sample_data(&mut self, header: &DataHeader) -> ReplayResult<Vec<u8>> {
        let stored = self.read_payload(self.payload_remaining as usize)?;
        if header.compressed {
            decompress_data(&stored, header.data_size as usize)
        } else if stored.len() != header.data_size as usize {
            Err(ReplayError::inconsistent(format!(
                "data block at offset {} stores {} bytes, header announced {}",
                self.block_position,
                stored.len(),
                header.data_size
            )))
        } else {
            Ok(stored)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn segment(blocks: &[Vec<u8>]) -> Vec<u8> {
        let mut data = Prologue::new(false).encode().to_vec();
        for block in blocks {
            data.extend_from_slice(block);
        }
        data
    }

    fn reader(data: Vec<u8>) -> BlockStream<Cursor<Vec<u8>>> {
        // Tiny buffer so the read-ahead path is exercised
        BlockStream::with_buffer_size(Cursor::new(data), 7)
    }

    #[test]
    fn test_prologue_roundtrip() {
        let mut out = Vec::new();
        write_prologue(&mut out, true).unwrap();
        let mut stream = reader(out);
        let prologue = stream.read_prologue().unwrap();
        assert_eq!(prologue.version, FORMAT_VERSION);
        assert!(prologue.big_endian);
    }

    #[test]
    fn test_prologue_errors() {
        let err = reader(Vec::new()).read_prologue().unwrap_err();
        assert!(matches!(err, ReplayError::Format(FormatError::MissingPrologue)));

        let err = reader(b"NOTALOG\0\x03\0\0\0\0\0\0\0".to_vec())
            .read_prologue()
            .unwrap_err();
        assert!(matches!(err, ReplayError::Format(FormatError::MissingPrologue)));

        let mut old = Prologue::new(false).encode();
        old[8..12].copy_from_slice(&(FORMAT_VERSION - 1).to_le_bytes());
        let err = reader(old.to_vec()).read_prologue().unwrap_err();
        assert!(matches!(
            err,
            ReplayError::Format(FormatError::ObsoleteFormat { .. })
        ));

        let mut new = Prologue::new(false).encode();
        new[8..12].copy_from_slice(&(FORMAT_VERSION + 1).to_le_bytes());
        let err = reader(new.to_vec()).read_prologue().unwrap_err();
        assert!(matches!(
            err,
            ReplayError::Format(FormatError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn test_block_sequence_and_tell() {
        let mut decl = StreamDeclaration::new("/imu", "/base/Imu");
        decl.type_description = b"<typelib/>".to_vec();
        decl.metadata = b"rock_task_name: imu\n".to_vec();
        let compression = CompressionConfig::disabled();

        let stream_block = encode_stream_block(4, &decl);
        let data_block = encode_data_block(
            4,
            Time::from_parts(10, 5),
            Time::from_parts(10, 6),
            b"payload",
            &compression,
        )
        .unwrap();
        let data_offset = (PROLOGUE_SIZE + stream_block.len()) as u64;
        let mut stream = reader(segment(&[stream_block, data_block]));

        stream.read_prologue().unwrap();
        assert_eq!(stream.tell(), PROLOGUE_SIZE as u64);

        let header = stream.read_next_block_header().unwrap().unwrap();
        assert_eq!(header.kind, BlockKind::Stream);
        assert_eq!(header.stream_id, 4);
        assert_eq!(stream.read_stream_block().unwrap(), decl);
        assert_eq!(stream.tell(), data_offset);

        let header = stream.read_next_block_header().unwrap().unwrap();
        assert_eq!(header.kind, BlockKind::Data);
        assert_eq!(stream.block_position(), data_offset);
        let data_header = stream.read_data_block_header().unwrap();
        assert_eq!(data_header.realtime, Time::from_parts(10, 5));
        assert_eq!(data_header.logical, Time::from_parts(10, 6));
        assert!(!data_header.compressed);
        assert_eq!(stream.read_sample_data(&data_header).unwrap(), b"payload");

        assert!(stream.read_next_block_header().unwrap().is_none());
    }

    #[test]
    fn test_unconsumed_payload_is_skipped() {
        let compression = CompressionConfig::disabled();
        let blocks: Vec<Vec<u8>> = (0..3)
            .map(|i| {
                encode_data_block(0, Time::from_secs(i), Time::from_secs(i), &[i as u8; 20], &compression)
                    .unwrap()
            })
            .collect();
        let block_len = blocks[0].len() as u64;
        let mut stream = reader(segment(&blocks));
        stream.read_prologue().unwrap();

        let mut positions = Vec::new();
        while stream.read_next_block_header().unwrap().is_some() {
            positions.push(stream.block_position());
        }
        let base = PROLOGUE_SIZE as u64;
        assert_eq!(positions, vec![base, base + block_len, base + 2 * block_len]);
    }

    #[test]
    fn test_truncated_block() {
        let compression = CompressionConfig::disabled();
        let block =
            encode_data_block(0, Time::ZERO, Time::ZERO, &[7u8; 32], &compression).unwrap();
        let mut data = segment(&[block]);
        data.truncate(data.len() - 5);

        let mut stream = reader(data);
        stream.read_prologue().unwrap();
        let err = stream.read_next_block_header().unwrap_err();
        assert!(err.is_truncated());
    }

    #[test]
    fn test_partial_header_is_truncated() {
        let mut data = segment(&[]);
        data.extend_from_slice(&[2, 0, 0]);
        let mut stream = reader(data);
        stream.read_prologue().unwrap();
        assert!(stream.read_next_block_header().unwrap_err().is_truncated());
    }

    #[test]
    fn test_short_stream_block() {
        let header = BlockHeader {
            kind: BlockKind::Stream,
            stream_id: 0,
            payload_size: 4,
        };
        let mut block = header.encode().to_vec();
        block.extend_from_slice(&[1, 0, 0, 0]);
        let mut stream = reader(segment(&[block]));
        stream.read_prologue().unwrap();
        stream.read_next_block_header().unwrap();
        assert!(stream.read_stream_block().unwrap_err().is_truncated());
    }

    #[test]
    fn test_declaration_without_optional_fields() {
        let mut payload = vec![STREAM_TYPE_DATA];
        put_prefixed(&mut payload, b"/laser");
        put_prefixed(&mut payload, b"/base/LaserScan");
        let decl = StreamDeclaration::decode(&payload).unwrap();
        assert_eq!(decl.name, "/laser");
        assert!(decl.type_description.is_empty());
        assert!(decl.metadata.is_empty());
    }

    #[test]
    fn test_seek_within_buffer_keeps_tell_exact() {
        let compression = CompressionConfig::disabled();
        let blocks: Vec<Vec<u8>> = (0..4)
            .map(|i| encode_data_block(1, Time::from_secs(i), Time::from_secs(i), b"ab", &compression).unwrap())
            .collect();
        let second = (PROLOGUE_SIZE + blocks[0].len()) as u64;
        let mut stream = BlockStream::with_buffer_size(Cursor::new(segment(&blocks)), 4096);
        stream.read_prologue().unwrap();

        stream.seek(second).unwrap();
        assert_eq!(stream.tell(), second);
        stream.read_next_block_header().unwrap();
        let header = stream.read_data_block_header().unwrap();
        assert_eq!(header.logical, Time::from_secs(1));
    }

    #[test]
    fn test_compression_thresholds() {
        let config = CompressionConfig {
            min_size: 1024,
            min_ratio: 0.3,
            level: 6,
        };

        let compressible = vec![42u8; 4096];
        let (stored, compressed) = encode_payload(&compressible, &config).unwrap();
        assert!(compressed);
        assert!(stored.len() < compressible.len());
        assert_eq!(decompress_data(&stored, compressible.len()).unwrap(), compressible);

        let small = vec![42u8; 100];
        let (stored, compressed) = encode_payload(&small, &config).unwrap();
        assert!(!compressed);
        assert_eq!(stored, small);
    }
}
