//! Append-only log writer
//!
//! Writes `<base>.0.log`, `<base>.1.log`, ... Each segment starts with its own
//! prologue and re-declares every stream known so far under the same id, so a
//! segment can be indexed on its own and no block ever spans two files.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::codec::{encode_data_block, encode_stream_block, write_prologue, StreamDeclaration, PROLOGUE_SIZE};
use crate::config::{LogConfig, SEGMENT_EXT};
use crate::error::{ReplayError, ReplayResult};
use crate::stream_index::StreamIndex;
use crate::time::Time;

/// Path of segment `number` for a log named `base`
pub fn segment_path(base: &Path, number: usize) -> PathBuf {
    let stem = base
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    base.with_file_name(format!("{}.{}.{}", stem, number, SEGMENT_EXT))
}

/// Existing segments of the log named `base`, in order
pub fn find_segments(base: &Path) -> Vec<PathBuf> {
    (0..)
        .map(|n| segment_path(base, n))
        .take_while(|path| path.is_file())
        .collect()
}

/// Delete segments `1..` of an earlier recording under `base`, and every
/// segment's index cache, so they cannot be mixed into a new one
fn remove_stale_segments(base: &Path, config: &LogConfig) -> ReplayResult<()> {
    let stale = (1..)
        .map(|n| segment_path(base, n))
        .take_while(|path| path.is_file());
    for path in stale {
        log::debug!("removing stale segment {}", path.display());
        fs::remove_file(&path)?;
        remove_if_exists(&config.index_path(&path))?;
    }
    remove_if_exists(&config.index_path(&segment_path(base, 0)))
}

fn remove_if_exists(path: &Path) -> ReplayResult<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// Encode a key/value map as a stream metadata blob
pub fn encode_metadata(metadata: &BTreeMap<String, String>) -> ReplayResult<Vec<u8>> {
    if metadata.is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_yaml::to_string(metadata)?.into_bytes())
}

/// Identifies a stream of one [`LogWriter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle {
    id: u16,
}

impl StreamHandle {
    pub fn id(&self) -> u16 {
        self.id
    }
}

struct WrittenStream {
    declaration: StreamDeclaration,
    index: StreamIndex,
    /// Latest real time of earlier segments; the current one may not start before it
    realtime_floor: Option<Time>,
}

/// Writes streams of timestamped samples into one or more segments
pub struct LogWriter {
    base: PathBuf,
    config: LogConfig,
    file: BufWriter<File>,
    segments: Vec<PathBuf>,
    /// Global offset of the current segment's first byte
    segment_start: u64,
    segment_size: u64,
    has_data: bool,
    streams: Vec<WrittenStream>,
}

impl LogWriter {
    pub fn create<P: AsRef<Path>>(base: P) -> ReplayResult<Self> {
        Self::create_with_config(base, LogConfig::default())
    }

    pub fn create_with_config<P: AsRef<Path>>(base: P, config: LogConfig) -> ReplayResult<Self> {
        config.validate()?;
        let base = base.as_ref().to_path_buf();
        if let Some(dir) = base.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }

        remove_stale_segments(&base, &config)?;
        let path = segment_path(&base, 0);
        let file = Self::open_segment(&path)?;
        log::info!("Recording to {}", path.display());

        Ok(Self {
            base,
            config,
            file,
            segments: vec![path],
            segment_start: 0,
            segment_size: PROLOGUE_SIZE as u64,
            has_data: false,
            streams: Vec::new(),
        })
    }

    fn open_segment(path: &Path) -> ReplayResult<BufWriter<File>> {
        let mut file = BufWriter::new(File::create(path)?);
        write_prologue(&mut file, cfg!(target_endian = "big"))?;
        Ok(file)
    }

    /// Declare a stream with no type description or metadata
    pub fn create_stream(&mut self, name: &str, type_name: &str) -> ReplayResult<StreamHandle> {
        self.declare_stream(StreamDeclaration::new(name, type_name))
    }

    /// Declare a stream with a type description and a metadata map
    pub fn create_stream_with_metadata(
        &mut self,
        name: &str,
        type_name: &str,
        type_description: &[u8],
        metadata: &BTreeMap<String, String>,
    ) -> ReplayResult<StreamHandle> {
        let mut declaration = StreamDeclaration::new(name, type_name);
        declaration.type_description = type_description.to_vec();
        declaration.metadata = encode_metadata(metadata)?;
        self.declare_stream(declaration)
    }

    /// Declare a stream from a complete declaration, blobs copied as-is
    pub fn declare_stream(&mut self, declaration: StreamDeclaration) -> ReplayResult<StreamHandle> {
        if self.streams.iter().any(|s| s.declaration.name == declaration.name) {
            return Err(ReplayError::invalid_input(format!(
                "stream {} already declared",
                declaration.name
            )));
        }
        let id = u16::try_from(self.streams.len())
            .map_err(|_| ReplayError::invalid_input("too many streams in one log"))?;

        let block = encode_stream_block(id, &declaration);
        self.write_block(&block)?;
        log::debug!("declared stream {} ({}) as {}", declaration.name, declaration.type_name, id);

        self.streams.push(WrittenStream {
            declaration,
            index: StreamIndex::new(),
            realtime_floor: None,
        });
        Ok(StreamHandle { id })
    }

    fn stream(&self, handle: StreamHandle) -> ReplayResult<&WrittenStream> {
        self.streams
            .get(handle.id as usize)
            .ok_or_else(|| ReplayError::UnknownStream(format!("stream id {}", handle.id)))
    }

    /// Append one sample. Logical times of a stream must not go backward, and
    /// real times may not go back past the end of an earlier segment.
    ///
    /// Nothing is written when the sample is rejected.
    pub fn write_sample(
        &mut self,
        handle: StreamHandle,
        realtime: Time,
        logical: Time,
        data: &[u8],
    ) -> ReplayResult<()> {
        let block = encode_data_block(handle.id, realtime, logical, data, &self.config.compression)?;
        let rollover = self.needs_rollover(block.len() as u64);

        let stream = self.stream(handle)?;
        if let Some((_, last)) = stream.index.interval_lg() {
            if logical < last {
                return Err(ReplayError::monotonicity(format!(
                    "{}: logical time {} is before previous sample at {}",
                    stream.declaration.name, logical, last
                )));
            }
        }
        let floor = if rollover {
            stream.index.interval_rt().map(|(_, max)| max)
        } else {
            stream.realtime_floor
        };
        if let Some(floor) = floor.filter(|&floor| realtime < floor) {
            return Err(ReplayError::monotonicity(format!(
                "{}: real time {} is before {} recorded in an earlier segment",
                stream.declaration.name, realtime, floor
            )));
        }

        if rollover {
            self.rollover()?;
        }

        let position = self.segment_start + self.segment_size;
        self.write_block(&block)?;
        self.has_data = true;
        self.streams[handle.id as usize]
            .index
            .add_sample(position, realtime, logical)
    }

    fn needs_rollover(&self, block_len: u64) -> bool {
        match self.config.max_segment_size {
            Some(max) => self.has_data && self.segment_size + block_len > max,
            None => false,
        }
    }

    fn write_block(&mut self, block: &[u8]) -> ReplayResult<()> {
        self.file.write_all(block)?;
        self.segment_size += block.len() as u64;
        Ok(())
    }

    /// Close the current segment and continue in the next one
    pub fn rollover(&mut self) -> ReplayResult<()> {
        self.file.flush()?;

        let path = segment_path(&self.base, self.segments.len());
        self.file = Self::open_segment(&path)?;
        self.segment_start += self.segment_size;
        self.segment_size = PROLOGUE_SIZE as u64;
        self.has_data = false;
        self.segments.push(path);
        for stream in &mut self.streams {
            stream.realtime_floor = stream.index.interval_rt().map(|(_, max)| max);
        }

        let blocks: Vec<Vec<u8>> = self
            .streams
            .iter()
            .enumerate()
            .map(|(id, s)| encode_stream_block(id as u16, &s.declaration))
            .collect();
        for block in &blocks {
            self.write_block(block)?;
        }

        log::info!(
            "Continuing recording in {} (segment {})",
            self.segments[self.segments.len() - 1].display(),
            self.segments.len() - 1
        );
        Ok(())
    }

    pub fn flush(&mut self) -> ReplayResult<()> {
        self.file.flush()?;
        Ok(())
    }

    /// Flush and close, returning the segment paths
    pub fn finish(mut self) -> ReplayResult<Vec<PathBuf>> {
        self.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(self.segments)
    }

    pub fn segment_paths(&self) -> &[PathBuf] {
        &self.segments
    }

    /// Bytes written so far, all segments included
    pub fn size(&self) -> u64 {
        self.segment_start + self.segment_size
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// What was written to a stream, with global positions
    pub fn stream_index(&self, handle: StreamHandle) -> Option<&StreamIndex> {
        self.streams.get(handle.id as usize).map(|s| &s.index)
    }

    pub fn declaration(&self, handle: StreamHandle) -> Option<&StreamDeclaration> {
        self.streams.get(handle.id as usize).map(|s| &s.declaration)
    }
}
