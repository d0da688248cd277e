//! Logical byte sequence over physical segments
//!
//! A recording may be split into several files while it is written. This module
//! makes the ordered list of files look like one contiguous address space, so
//! indices and readers only ever deal with global offsets.
//!
//! ```text
//! global:  0              s0            s0+s1              total
//!          ├── run.0.log ──┼─── run.1.log ──┼─── run.2.log ───┤
//! ```
//!
//! A single `read` never crosses a segment boundary. The file format guarantees
//! that no block straddles two segments, so callers never need it to.

use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{ReplayError, ReplayResult};

/// Random-access byte source the block codec reads from
pub trait ByteSource {
    /// Read up to `buf.len()` bytes at the current position. Returns 0 at the end.
    fn read(&mut self, buf: &mut [u8]) -> ReplayResult<usize>;

    /// Move to an absolute offset. Offsets `>= size()` are `OutOfRange`.
    fn seek(&mut self, offset: u64) -> ReplayResult<()>;

    /// Current absolute offset
    fn tell(&self) -> u64;

    /// Total addressable size
    fn size(&self) -> u64;
}

#[derive(Debug)]
struct Segment {
    path: PathBuf,
    file: File,
    start: u64,
    size: u64,
}

impl Segment {
    fn end(&self) -> u64 {
        self.start + self.size
    }
}

/// Ordered physical segments presented as one address space
#[derive(Debug)]
pub struct SegmentSequence {
    segments: Vec<Segment>,
    current: usize,
    position: u64,
    total: u64,
}

impl SegmentSequence {
    /// Open the given files, in order, read-only
    pub fn open<P: AsRef<Path>>(paths: &[P]) -> ReplayResult<Self> {
        let mut segments = Vec::with_capacity(paths.len());
        let mut start = 0;
        for path in paths {
            let path = path.as_ref();
            let file = File::open(path)?;
            let size = file.metadata()?.len();
            segments.push(Segment {
                path: path.to_path_buf(),
                file,
                start,
                size,
            });
            start += size;
        }

        Ok(Self {
            segments,
            current: 0,
            position: 0,
            total: start,
        })
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Global offset of the first byte of segment `index`
    pub fn segment_start(&self, index: usize) -> Option<u64> {
        self.segments.get(index).map(|s| s.start)
    }

    pub fn segment_size(&self, index: usize) -> Option<u64> {
        self.segments.get(index).map(|s| s.size)
    }

    pub fn segment_path(&self, index: usize) -> Option<&Path> {
        self.segments.get(index).map(|s| s.path.as_path())
    }

    /// Index of the segment holding the byte at `offset`
    pub fn segment_of(&self, offset: u64) -> Option<usize> {
        if offset >= self.total {
            return None;
        }
        let idx = self.segments.partition_point(|s| s.end() <= offset);
        (idx < self.segments.len()).then_some(idx)
    }

    /// Index of the segment the next read comes from
    pub fn current_segment(&self) -> usize {
        self.current
    }
}

impl ByteSource for SegmentSequence {
    fn read(&mut self, buf: &mut [u8]) -> ReplayResult<usize> {
        if buf.is_empty() || self.segments.is_empty() {
            return Ok(0);
        }

        // At the end of a segment, continue with the next non-empty one
        while self.position == self.segments[self.current].end()
            && self.current + 1 < self.segments.len()
        {
            self.current += 1;
            self.segments[self.current].file.seek(SeekFrom::Start(0))?;
        }

        let segment = &mut self.segments[self.current];
        let remaining = segment.end() - self.position;
        let wanted = (buf.len() as u64).min(remaining) as usize;
        if wanted == 0 {
            return Ok(0);
        }

        let n = segment.file.read(&mut buf[..wanted])?;
        self.position += n as u64;
        Ok(n)
    }

    fn seek(&mut self, offset: u64) -> ReplayResult<()> {
        let idx = self.segment_of(offset).ok_or_else(|| {
            ReplayError::out_of_range(format!(
                "offset {} beyond end of data ({} bytes)",
                offset, self.total
            ))
        })?;

        let segment = &mut self.segments[idx];
        segment.file.seek(SeekFrom::Start(offset - segment.start))?;
        self.current = idx;
        self.position = offset;
        Ok(())
    }

    fn tell(&self) -> u64 {
        self.position
    }

    fn size(&self) -> u64 {
        self.total
    }
}

/// In-memory source, mostly for tests and for decoding buffers
impl<T: AsRef<[u8]>> ByteSource for Cursor<T> {
    fn read(&mut self, buf: &mut [u8]) -> ReplayResult<usize> {
        Ok(Read::read(self, buf)?)
    }

    fn seek(&mut self, offset: u64) -> ReplayResult<()> {
        let size = self.get_ref().as_ref().len() as u64;
        if offset >= size {
            return Err(ReplayError::out_of_range(format!(
                "offset {} beyond end of data ({} bytes)",
                offset, size
            )));
        }
        self.set_position(offset);
        Ok(())
    }

    fn tell(&self) -> u64 {
        self.position()
    }

    fn size(&self) -> u64 {
        self.get_ref().as_ref().len() as u64
    }
}
