//! # replaylog
//!
//! Binary log files and multi-stream replay.
//!
//! Independent data sources record timestamped samples into named streams. A
//! recording may span several physical segments. This crate provides:
//!
//! - **Codec**: the block format of a segment (prologue, stream declarations, data)
//! - **Segments**: a list of segment files seen as one address space
//! - **Stream indices**: ordinal, position and time of every sample, cached on disk
//! - **Replay**: per-stream random access and a globally time-ordered aligner
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use replaylog_core::{LogWriter, Logfiles, StreamAligner, Time};
//!
//! # fn main() -> replaylog_core::ReplayResult<()> {
//! let mut writer = LogWriter::create("/tmp/run")?;
//! let imu = writer.create_stream("/imu", "/base/Imu")?;
//! let t = Time::now();
//! writer.write_sample(imu, t, t, b"sample bytes")?;
//! let paths = writer.finish()?;
//!
//! let logs = Logfiles::open(&paths)?;
//! let mut aligner = StreamAligner::new(logs.streams().to_vec())?;
//! while let Some(step) = aligner.advance()? {
//!     let sample = aligner.read_single_data(step.stream)?;
//!     println!("{} {:?}", step.time, sample.map(|s| s.data.len()));
//! }
//! # Ok(())
//! # }
//! ```

pub mod aligner;
pub mod codec;
pub mod config;
pub mod error;
pub mod index_file;
pub mod logfiles;
pub mod progress;
pub mod segments;
pub mod stream_index;
pub mod time;
pub mod writer;

// Re-export commonly used types for easy access
pub use aligner::{AlignerEntry, Position, SampleRef, Step, StreamAligner};
pub use codec::{BlockKind, BlockStream, StreamDeclaration};
pub use config::{CompressionConfig, LogConfig};
pub use error::{FormatError, InvalidIndexKind, ReplayError, ReplayResult};
pub use logfiles::{DataStream, Logfiles, Sample};
pub use progress::{LogProgress, NullProgress, Progress};
pub use segments::{ByteSource, SegmentSequence};
pub use stream_index::StreamIndex;
pub use time::Time;
pub use writer::{LogWriter, StreamHandle};
