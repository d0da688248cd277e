//! Persisted per-segment index cache
//!
//! ## File layout (all fields big-endian)
//!
//! ```text
//! magic(8) version(4) source_size(8) source_mtime(8) stream_count(8)
//! stream_count x descriptor {
//!     declaration_offset, index_data_offset, base_time, sample_count,
//!     rt_min, rt_max, lg_min, lg_max                      (8 x u64)
//! }
//! per stream: sample_count x { position, time, ordinal } (3 x u64)
//! ```
//!
//! Positions are offsets inside the segment, times are logical and relative to
//! the stream's base time. Stream declarations are not duplicated here; they are
//! re-read from the segment at `declaration_offset`.

use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;
use std::time::UNIX_EPOCH;

use tempfile::NamedTempFile;

use crate::codec::{BlockKind, BlockStream, StreamDeclaration};
use crate::config::LogConfig;
use crate::error::{InvalidIndexKind, ReplayError, ReplayResult};
use crate::progress::Progress;
use crate::segments::SegmentSequence;
use crate::stream_index::StreamIndex;
use crate::time::Time;

/// Magic token of index files
pub const INDEX_MAGIC: &[u8; 8] = b"RPLYIDX\0";
/// Index layout revision; any other value invalidates the cache
pub const INDEX_VERSION: u32 = 3;

const PROLOGUE_SIZE: usize = 8 + 4 + 8 + 8;
const DESCRIPTOR_SIZE: usize = 8 * 8;
const ENTRY_SIZE: usize = 3 * 8;

/// Report rebuild progress every this many blocks
const PROGRESS_INTERVAL: usize = 1000;

/// One stream as seen inside a single segment
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentStream {
    pub stream_id: u16,
    /// Offset of the first Stream block declaring this stream
    pub declaration_offset: u64,
    pub declaration: StreamDeclaration,
    /// Sample positions are segment-local
    pub index: StreamIndex,
}

/// Every stream of one segment plus the source stamp it was built from
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentIndex {
    pub source_size: u64,
    pub source_mtime: u64,
    /// In order of first declaration
    pub streams: Vec<SegmentStream>,
}

/// Size and modification time (microseconds since the epoch) of a file
pub fn source_stamp(path: &Path) -> ReplayResult<(u64, u64)> {
    let metadata = fs::metadata(path)?;
    let mtime = metadata
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    Ok((metadata.len(), mtime))
}

fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn put_time(buf: &mut Vec<u8>, time: Time) {
    put_u64(buf, time.as_micros() as u64);
}

/// Serialize to the on-disk layout
pub fn encode_index(index: &SegmentIndex) -> Vec<u8> {
    let sample_total: usize = index.streams.iter().map(|s| s.index.len()).sum();
    let tables_start = PROLOGUE_SIZE + 8 + index.streams.len() * DESCRIPTOR_SIZE;
    let mut buf = Vec::with_capacity(tables_start + sample_total * ENTRY_SIZE);

    buf.extend_from_slice(INDEX_MAGIC);
    buf.extend_from_slice(&INDEX_VERSION.to_be_bytes());
    put_u64(&mut buf, index.source_size);
    put_u64(&mut buf, index.source_mtime);
    put_u64(&mut buf, index.streams.len() as u64);

    let mut table_offset = tables_start as u64;
    for stream in &index.streams {
        let idx = &stream.index;
        let (rt_min, rt_max) = idx.interval_rt().unwrap_or_default();
        let (lg_min, lg_max) = idx.interval_lg().unwrap_or_default();

        put_u64(&mut buf, stream.declaration_offset);
        put_u64(&mut buf, table_offset);
        put_time(&mut buf, idx.base_time().unwrap_or_default());
        put_u64(&mut buf, idx.len() as u64);
        put_time(&mut buf, rt_min);
        put_time(&mut buf, rt_max);
        put_time(&mut buf, lg_min);
        put_time(&mut buf, lg_max);

        table_offset += (idx.len() * ENTRY_SIZE) as u64;
    }

    for stream in &index.streams {
        let idx = &stream.index;
        for (ordinal, (&position, &time)) in
            idx.positions().iter().zip(idx.relative_times()).enumerate()
        {
            put_u64(&mut buf, position);
            put_u64(&mut buf, time as u64);
            put_u64(&mut buf, ordinal as u64);
        }
    }
    buf
}

/// Write an index cache atomically: a temporary file in the destination
/// directory is renamed over `index_path`.
pub fn write_index(index_path: &Path, index: &SegmentIndex) -> ReplayResult<()> {
    let dir = match index_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&encode_index(index))?;
    tmp.flush()?;
    tmp.persist(index_path).map_err(|e| ReplayError::Io(e.error))?;

    log::debug!("wrote index cache {}", index_path.display());
    Ok(())
}

struct BeReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BeReader<'a> {
    fn at(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    fn read_u64(&mut self) -> ReplayResult<u64> {
        let end = self.pos + 8;
        let bytes = self.data.get(self.pos..end).ok_or_else(|| {
            ReplayError::corrupt_index(format!("unexpected end of index at byte {}", self.pos))
        })?;
        self.pos = end;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(raw))
    }

    fn read_time(&mut self) -> ReplayResult<Time> {
        Ok(Time::from_micros(self.read_u64()? as i64))
    }
}

struct Descriptor {
    declaration_offset: u64,
    index_data_offset: u64,
    base_time: Time,
    sample_count: u64,
    rt: (Time, Time),
    lg: (Time, Time),
}

fn decode_descriptor(reader: &mut BeReader<'_>) -> ReplayResult<Descriptor> {
    Ok(Descriptor {
        declaration_offset: reader.read_u64()?,
        index_data_offset: reader.read_u64()?,
        base_time: reader.read_time()?,
        sample_count: reader.read_u64()?,
        rt: (reader.read_time()?, reader.read_time()?),
        lg: (reader.read_time()?, reader.read_time()?),
    })
}

fn decode_table(data: &[u8], descriptor: &Descriptor) -> ReplayResult<StreamIndex> {
    let count = usize::try_from(descriptor.sample_count)
        .map_err(|_| ReplayError::corrupt_index("sample count does not fit in memory"))?;
    let start = usize::try_from(descriptor.index_data_offset)
        .map_err(|_| ReplayError::corrupt_index("index data offset out of range"))?;
    let table_len = count
        .checked_mul(ENTRY_SIZE)
        .and_then(|len| len.checked_add(start))
        .ok_or_else(|| ReplayError::corrupt_index("index table size overflows"))?;
    if table_len > data.len() {
        return Err(ReplayError::corrupt_index(format!(
            "index table of {} samples at {} exceeds file size {}",
            count,
            start,
            data.len()
        )));
    }

    let mut reader = BeReader::at(data, start);
    let mut positions = Vec::with_capacity(count);
    let mut times = Vec::with_capacity(count);
    for expected in 0..count {
        positions.push(reader.read_u64()?);
        times.push(reader.read_u64()? as i64);
        let ordinal = reader.read_u64()?;
        if ordinal != expected as u64 {
            return Err(ReplayError::corrupt_index(format!(
                "entry {} carries ordinal {}",
                expected, ordinal
            )));
        }
    }

    if let (Some(&first), Some(&last)) = (times.first(), times.last()) {
        let base = descriptor.base_time.as_micros();
        let absolute = |relative: i64| base.checked_add(relative).map(Time::from_micros);
        if absolute(first) != Some(descriptor.lg.0) || absolute(last) != Some(descriptor.lg.1) {
            return Err(ReplayError::corrupt_index(format!(
                "sample times do not match logical interval {} .. {}",
                descriptor.lg.0, descriptor.lg.1
            )));
        }
    }

    let (rt, lg) = if count == 0 {
        (None, None)
    } else {
        (Some(descriptor.rt), Some(descriptor.lg))
    };
    StreamIndex::from_parts(positions, times, descriptor.base_time, rt, lg)
}

/// Read the declaration a cached index points at
fn read_declaration(
    reader: &mut BlockStream<SegmentSequence>,
    offset: u64,
) -> ReplayResult<(u16, StreamDeclaration)> {
    reader.seek(offset)?;
    match reader.read_next_block_header()? {
        Some(header) if header.kind == BlockKind::Stream => {
            Ok((header.stream_id, reader.read_stream_block()?))
        }
        _ => Err(ReplayError::corrupt_index(format!(
            "no stream declaration at offset {}",
            offset
        ))),
    }
}

/// Load the cached index of `segment_path` from `index_path`.
///
/// Every way the cache can be unusable is reported as
/// [`ReplayError::InvalidIndex`]; callers treat it as a cache miss.
pub fn read_index(
    index_path: &Path,
    segment_path: &Path,
    config: &LogConfig,
) -> ReplayResult<SegmentIndex> {
    let data = match fs::read(index_path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Err(InvalidIndexKind::Missing.into()),
        Err(e) => {
            return Err(ReplayError::corrupt_index(format!(
                "cannot read {}: {}",
                index_path.display(),
                e
            )))
        }
    };

    if data.len() < PROLOGUE_SIZE || &data[0..8] != INDEX_MAGIC {
        return Err(InvalidIndexKind::MissingPrologue.into());
    }
    let version = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
    if version != INDEX_VERSION {
        return Err(InvalidIndexKind::ObsoleteVersion {
            found: version,
            expected: INDEX_VERSION,
        }
        .into());
    }

    let mut reader = BeReader::at(&data, 12);
    let source_size = reader.read_u64()?;
    let source_mtime = reader.read_u64()?;
    let (actual_size, actual_mtime) = source_stamp(segment_path)?;
    if source_size != actual_size || source_mtime != actual_mtime {
        return Err(InvalidIndexKind::SourceMismatch {
            expected_size: source_size,
            expected_mtime: source_mtime,
            actual_size,
            actual_mtime,
        }
        .into());
    }

    let stream_count = reader.read_u64()?;
    let descriptors_len = stream_count.saturating_mul(DESCRIPTOR_SIZE as u64);
    if descriptors_len > (data.len() - reader.pos) as u64 {
        return Err(ReplayError::corrupt_index(format!(
            "{} stream descriptors do not fit in the file",
            stream_count
        )));
    }
    let descriptors = (0..stream_count)
        .map(|_| decode_descriptor(&mut reader))
        .collect::<ReplayResult<Vec<_>>>()?;

    let mut segment = BlockStream::with_buffer_size(
        SegmentSequence::open(&[segment_path])?,
        config.read_buffer_size,
    );
    let mut streams = Vec::with_capacity(descriptors.len());
    for descriptor in &descriptors {
        let index = decode_table(&data, descriptor)?;
        let (stream_id, declaration) = read_declaration(&mut segment, descriptor.declaration_offset)
            .map_err(|e| match e {
                ReplayError::InvalidIndex(_) => e,
                other => ReplayError::corrupt_index(format!(
                    "declaration at offset {}: {}",
                    descriptor.declaration_offset, other
                )),
            })?;
        streams.push(SegmentStream {
            stream_id,
            declaration_offset: descriptor.declaration_offset,
            declaration,
            index,
        });
    }

    Ok(SegmentIndex {
        source_size,
        source_mtime,
        streams,
    })
}

/// Build the index of a segment with one forward scan over its blocks
pub fn rebuild_index(
    segment_path: &Path,
    config: &LogConfig,
    progress: &dyn Progress,
) -> ReplayResult<SegmentIndex> {
    let (source_size, source_mtime) = source_stamp(segment_path)?;
    let mut reader = BlockStream::with_buffer_size(
        SegmentSequence::open(&[segment_path])?,
        config.read_buffer_size,
    );
    reader.read_prologue()?;

    progress.info(&format!("rebuilding index of {}", segment_path.display()));

    let mut streams: Vec<SegmentStream> = Vec::new();
    let mut by_id: HashMap<u16, usize> = HashMap::new();
    let mut blocks = 0usize;

    while let Some(header) = reader.read_next_block_header()? {
        let position = reader.block_position();
        match header.kind {
            BlockKind::Stream => {
                let declaration = reader.read_stream_block()?;
                match by_id.get(&header.stream_id) {
                    Some(&i) => {
                        let known = &streams[i].declaration;
                        if !known.matches(&declaration) {
                            return Err(ReplayError::inconsistent(format!(
                                "stream {} declared as {} ({}) at offset {}, redeclared as {} ({}) at offset {}",
                                header.stream_id,
                                known.name,
                                known.type_name,
                                streams[i].declaration_offset,
                                declaration.name,
                                declaration.type_name,
                                position
                            )));
                        }
                    }
                    None => {
                        by_id.insert(header.stream_id, streams.len());
                        streams.push(SegmentStream {
                            stream_id: header.stream_id,
                            declaration_offset: position,
                            declaration,
                            index: StreamIndex::new(),
                        });
                    }
                }
            }
            BlockKind::Data => {
                let &i = by_id.get(&header.stream_id).ok_or_else(|| {
                    ReplayError::inconsistent(format!(
                        "data block at offset {} for undeclared stream {}",
                        position, header.stream_id
                    ))
                })?;
                let data_header = reader.read_data_block_header()?;
                streams[i]
                    .index
                    .add_sample(position, data_header.realtime, data_header.logical)?;
            }
            BlockKind::Control => {}
        }

        blocks += 1;
        if blocks % PROGRESS_INTERVAL == 0 {
            progress.progress(reader.tell(), source_size);
        }
    }
    progress.progress(source_size, source_size);

    let samples: usize = streams.iter().map(|s| s.index.len()).sum();
    progress.info(&format!(
        "indexed {} streams, {} samples in {}",
        streams.len(),
        samples,
        segment_path.display()
    ));

    Ok(SegmentIndex {
        source_size,
        source_mtime,
        streams,
    })
}

/// Use the cached index when it is valid, otherwise rebuild it and try to
/// refresh the cache.
pub fn load_or_rebuild(
    segment_path: &Path,
    config: &LogConfig,
    progress: &dyn Progress,
) -> ReplayResult<SegmentIndex> {
    let index_path = config.index_path(segment_path);
    match read_index(&index_path, segment_path, config) {
        Ok(index) => {
            log::debug!("using index cache {}", index_path.display());
            return Ok(index);
        }
        Err(ReplayError::InvalidIndex(InvalidIndexKind::Missing)) => {}
        Err(ReplayError::InvalidIndex(kind)) => {
            progress.warn(&format!(
                "discarding index {}: {}",
                index_path.display(),
                kind
            ));
        }
        Err(e) => return Err(e),
    }

    let index = rebuild_index(segment_path, config, progress)?;
    if config.write_index_cache {
        if let Err(e) = write_index(&index_path, &index) {
            progress.warn(&format!(
                "cannot write index {}: {}",
                index_path.display(),
                e
            ));
        }
    }
    Ok(index)
}
