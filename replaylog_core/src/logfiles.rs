//! Opened recordings and per-stream random access
//!
//! [`Logfiles`] owns the logical byte sequence and one merged [`StreamIndex`]
//! per stream name. [`DataStream`] handles share both; each handle keeps its
//! own replay cursor.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::codec::{BlockKind, BlockStream, PROLOGUE_SIZE};
use crate::config::LogConfig;
use crate::error::{ReplayError, ReplayResult};
use crate::index_file::load_or_rebuild;
use crate::progress::{LogProgress, Progress};
use crate::segments::{ByteSource, SegmentSequence};
use crate::stream_index::StreamIndex;
use crate::time::Time;
use crate::writer::find_segments;

type SharedReader = Arc<Mutex<BlockStream<SegmentSequence>>>;

/// One decoded sample
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub realtime: Time,
    pub logical: Time,
    /// Opaque payload, decompressed
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct StreamInfo {
    name: String,
    type_name: String,
    type_description: Vec<u8>,
    metadata: Vec<u8>,
    index: StreamIndex,
}

/// Handle on one stream of a [`Logfiles`]
///
/// Clones share the stream's index and the file reader but not the cursor.
#[derive(Clone)]
pub struct DataStream {
    info: Arc<StreamInfo>,
    reader: SharedReader,
    cursor: Option<usize>,
}

impl fmt::Debug for DataStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataStream")
            .field("name", &self.info.name)
            .field("type_name", &self.info.type_name)
            .field("size", &self.info.index.len())
            .field("cursor", &self.cursor)
            .finish()
    }
}

impl DataStream {
    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn type_name(&self) -> &str {
        &self.info.type_name
    }

    pub fn type_description(&self) -> &[u8] {
        &self.info.type_description
    }

    pub fn metadata_blob(&self) -> &[u8] {
        &self.info.metadata
    }

    /// Decoded metadata map; empty when the stream has none
    pub fn metadata(&self) -> ReplayResult<BTreeMap<String, String>> {
        if self.info.metadata.is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_yaml::from_slice(&self.info.metadata)?)
    }

    /// Number of samples
    pub fn size(&self) -> usize {
        self.info.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.info.index.is_empty()
    }

    pub fn index(&self) -> &StreamIndex {
        &self.info.index
    }

    pub fn interval_rt(&self) -> Option<(Time, Time)> {
        self.info.index.interval_rt()
    }

    pub fn interval_lg(&self) -> Option<(Time, Time)> {
        self.info.index.interval_lg()
    }

    /// First sample at or after `time`; `size()` if there is none
    pub fn sample_number_by_time(&self, time: Time) -> usize {
        self.info.index.sample_number_by_time(time)
    }

    /// Both handles refer to the same stream of the same [`Logfiles`]
    pub fn is_same_stream(&self, other: &DataStream) -> bool {
        Arc::ptr_eq(&self.info, &other.info)
    }

    /// Read sample `ordinal` without moving this handle's cursor
    pub fn read_sample(&self, ordinal: usize) -> ReplayResult<Sample> {
        let position = self.info.index.file_position(ordinal)?;
        let mut reader = self.reader.lock();
        reader.seek(position)?;

        match reader.read_next_block_header()? {
            Some(header) if header.kind == BlockKind::Data => {}
            _ => {
                return Err(ReplayError::inconsistent(format!(
                    "{}: no data block at offset {} for sample {}",
                    self.info.name, position, ordinal
                )))
            }
        }
        let header = reader.read_data_block_header()?;
        let data = reader.read_sample_data(&header)?;
        Ok(Sample {
            realtime: header.realtime,
            logical: header.logical,
            data,
        })
    }

    /// Current cursor position, `None` before the first read
    pub fn position(&self) -> Option<usize> {
        self.cursor
    }

    pub fn rewind(&mut self) {
        self.cursor = None;
    }

    pub fn seek(&mut self, ordinal: usize) -> ReplayResult<Sample> {
        let sample = self.read_sample(ordinal)?;
        self.cursor = Some(ordinal);
        Ok(sample)
    }

    /// Seek to the first sample at or after `time`
    pub fn seek_time(&mut self, time: Time) -> ReplayResult<Sample> {
        let ordinal = self.sample_number_by_time(time);
        if ordinal >= self.size() {
            return Err(ReplayError::out_of_range(format!(
                "{}: no sample at or after {}",
                self.info.name, time
            )));
        }
        self.seek(ordinal)
    }

    /// Sample after the cursor, `None` at the end
    pub fn next(&mut self) -> ReplayResult<Option<Sample>> {
        let target = self.cursor.map_or(0, |c| c + 1);
        if target >= self.size() {
            return Ok(None);
        }
        self.seek(target).map(Some)
    }

    /// Sample before the cursor, `None` at the beginning
    pub fn previous(&mut self) -> ReplayResult<Option<Sample>> {
        match self.cursor {
            Some(c) if c > 0 => self.seek(c - 1).map(Some),
            _ => Ok(None),
        }
    }

    /// Every sample in order, independent of the cursor
    pub fn samples(&self) -> impl Iterator<Item = ReplayResult<Sample>> + '_ {
        (0..self.size()).map(move |i| self.read_sample(i))
    }
}

/// A recording opened for replay
pub struct Logfiles {
    paths: Vec<PathBuf>,
    streams: Vec<DataStream>,
    size: u64,
}

impl fmt::Debug for Logfiles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logfiles")
            .field("paths", &self.paths)
            .field("streams", &self.streams)
            .finish()
    }
}

impl Logfiles {
    /// Open segments in the given order with default settings
    pub fn open<P: AsRef<Path>>(paths: &[P]) -> ReplayResult<Self> {
        Self::open_with(paths, &LogConfig::default(), &LogProgress)
    }

    /// Open every `<base>.N.log` segment of a recording
    pub fn open_base<P: AsRef<Path>>(base: P) -> ReplayResult<Self> {
        let paths = find_segments(base.as_ref());
        if paths.is_empty() {
            return Err(ReplayError::invalid_input(format!(
                "no segments found for {}",
                base.as_ref().display()
            )));
        }
        Self::open(&paths)
    }

    pub fn open_with<P: AsRef<Path>>(
        paths: &[P],
        config: &LogConfig,
        progress: &dyn Progress,
    ) -> ReplayResult<Self> {
        config.validate()?;
        if paths.is_empty() {
            return Err(ReplayError::invalid_input("no log segments given"));
        }
        let paths: Vec<PathBuf> = paths.iter().map(|p| p.as_ref().to_path_buf()).collect();
        let sequence = SegmentSequence::open(&paths)?;

        let mut infos: Vec<StreamInfo> = Vec::new();
        let mut by_name: HashMap<String, usize> = HashMap::new();

        for (i, path) in paths.iter().enumerate() {
            BlockStream::with_buffer_size(SegmentSequence::open(&[path])?, PROLOGUE_SIZE)
                .read_prologue()?;
            let segment = load_or_rebuild(path, config, progress)?;
            let offset = sequence.segment_start(i).unwrap_or_default();

            for stream in segment.streams {
                let declaration = stream.declaration;
                match by_name.get(&declaration.name) {
                    Some(&existing) => {
                        let info = &mut infos[existing];
                        if info.type_name != declaration.type_name {
                            return Err(ReplayError::inconsistent(format!(
                                "stream {} has type {} in {} but {} before",
                                declaration.name,
                                declaration.type_name,
                                path.display(),
                                info.type_name
                            )));
                        }
                        info.index.concat(&stream.index, offset)?;
                    }
                    None => {
                        let mut index = StreamIndex::new();
                        index.concat(&stream.index, offset)?;
                        by_name.insert(declaration.name.clone(), infos.len());
                        infos.push(StreamInfo {
                            name: declaration.name,
                            type_name: declaration.type_name,
                            type_description: declaration.type_description,
                            metadata: declaration.metadata,
                            index,
                        });
                    }
                }
            }
        }

        let size = sequence.size();
        let reader: SharedReader = Arc::new(Mutex::new(BlockStream::with_buffer_size(
            sequence,
            config.read_buffer_size,
        )));
        let streams = infos
            .into_iter()
            .map(|info| DataStream {
                info: Arc::new(info),
                reader: Arc::clone(&reader),
                cursor: None,
            })
            .collect::<Vec<_>>();

        log::info!(
            "Opened {} segment(s) with {} stream(s)",
            paths.len(),
            streams.len()
        );
        Ok(Self {
            paths,
            streams,
            size,
        })
    }

    pub fn streams(&self) -> &[DataStream] {
        &self.streams
    }

    pub fn stream_names(&self) -> Vec<&str> {
        self.streams.iter().map(|s| s.name()).collect()
    }

    /// Handle on the stream called `name`
    pub fn stream(&self, name: &str) -> ReplayResult<DataStream> {
        self.streams
            .iter()
            .find(|s| s.name() == name)
            .cloned()
            .ok_or_else(|| ReplayError::UnknownStream(name.to_string()))
    }

    pub fn has_stream(&self, name: &str) -> bool {
        self.streams.iter().any(|s| s.name() == name)
    }

    pub fn segment_paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Total size of all segments in bytes
    pub fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompressionConfig;
    use crate::progress::NullProgress;
    use crate::writer::LogWriter;
    use tempfile::tempdir;

    fn record(base: &Path, config: LogConfig) -> Vec<PathBuf> {
        let mut writer = LogWriter::create_with_config(base, config).unwrap();
        let mut metadata = BTreeMap::new();
        metadata.insert("unit".to_string(), "m".to_string());
        let a = writer
            .create_stream_with_metadata("/a", "/double", b"desc", &metadata)
            .unwrap();
        let b = writer.create_stream("/b", "/int").unwrap();
        for i in 0..20i64 {
            let t = Time::from_millis(i * 100);
            writer.write_sample(a, t, t, &i.to_le_bytes()).unwrap();
            if i % 2 == 0 {
                writer.write_sample(b, t, t, &[i as u8; 30]).unwrap();
            }
        }
        writer.finish().unwrap()
    }

    #[test]
    fn test_open_and_read() {
        let dir = tempdir().unwrap();
        let paths = record(&dir.path().join("run"), LogConfig::default());
        let logs = Logfiles::open_with(&paths, &LogConfig::default(), &NullProgress).unwrap();

        assert_eq!(logs.stream_names(), vec!["/a", "/b"]);
        let a = logs.stream("/a").unwrap();
        assert_eq!(a.size(), 20);
        assert_eq!(a.type_description(), b"desc");
        assert_eq!(a.metadata().unwrap().get("unit").map(String::as_str), Some("m"));
        assert_eq!(
            a.interval_lg(),
            Some((Time::ZERO, Time::from_millis(1900)))
        );

        let sample = a.read_sample(7).unwrap();
        assert_eq!(sample.logical, Time::from_millis(700));
        assert_eq!(sample.data, 7i64.to_le_bytes());

        assert!(logs.stream("/missing").is_err());
        assert!(a.read_sample(20).unwrap_err().is_out_of_range());
    }

    #[test]
    fn test_cursor_navigation() {
        let dir = tempdir().unwrap();
        let paths = record(&dir.path().join("run"), LogConfig::default());
        let logs = Logfiles::open(&paths).unwrap();
        let mut b = logs.stream("/b").unwrap();

        assert!(b.previous().unwrap().is_none());
        assert_eq!(b.next().unwrap().unwrap().logical, Time::ZERO);
        assert_eq!(b.next().unwrap().unwrap().logical, Time::from_millis(200));
        assert_eq!(b.previous().unwrap().unwrap().logical, Time::ZERO);

        let s = b.seek_time(Time::from_millis(250)).unwrap();
        assert_eq!(s.logical, Time::from_millis(400));
        assert_eq!(b.position(), Some(2));
        assert!(b.seek_time(Time::from_secs(10)).unwrap_err().is_out_of_range());

        b.seek(9).unwrap();
        assert!(b.next().unwrap().is_none());

        // Other handles keep their own cursor
        let other = logs.stream("/b").unwrap();
        assert_eq!(other.position(), None);
        assert!(other.is_same_stream(&b));
    }

    #[test]
    fn test_multi_segment_merge() {
        let dir = tempdir().unwrap();
        let config = LogConfig::default()
            .with_max_segment_size(300)
            .with_compression(CompressionConfig::disabled());
        let paths = record(&dir.path().join("run"), config.clone());
        assert!(paths.len() > 1);

        let logs = Logfiles::open_with(&paths, &config, &NullProgress).unwrap();
        let a = logs.stream("/a").unwrap();
        assert_eq!(a.size(), 20);
        let all: Vec<Sample> = a.samples().collect::<ReplayResult<_>>().unwrap();
        for (i, sample) in all.iter().enumerate() {
            assert_eq!(sample.logical, Time::from_millis(i as i64 * 100));
            assert_eq!(sample.data, (i as i64).to_le_bytes());
        }

        let reopened = Logfiles::open_base(dir.path().join("run")).unwrap();
        assert_eq!(reopened.stream("/b").unwrap().size(), 10);
        assert_eq!(reopened.size(), logs.size());
    }
}
