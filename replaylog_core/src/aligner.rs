//! Time-ordered replay across several streams
//!
//! The aligner merges the indices of its streams into one sorted table of
//! [`AlignerEntry`] values and addresses it by global ordinal. Equal times keep
//! the order in which the streams were supplied.
//!
//! ```text
//!   A: ●───────●             global:  0    1    2    3
//!   B:     ●───●                      A@1  B@2  A@3  B@3
//! ```
//!
//! The cursor is one of [`Position::BeforeStart`], [`Position::At`] or
//! [`Position::End`]. Per stream, the aligner remembers the last sample it
//! visited so that [`StreamAligner::single_data`] does not need a seek.

use std::mem;

use crate::codec::StreamDeclaration;
use crate::error::{ReplayError, ReplayResult};
use crate::logfiles::{DataStream, Sample};
use crate::time::Time;
use crate::writer::{LogWriter, StreamHandle};

/// One sample in the global order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignerEntry {
    /// Microseconds since the aligner's base time
    pub time: i64,
    /// Ordinal within the stream
    pub local: usize,
    /// Stream number within the aligner
    pub stream: usize,
    pub global: usize,
}

/// Where the cursor is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    BeforeStart,
    At(usize),
    End,
}

/// Location of a sample visited through the aligner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleRef {
    pub stream: usize,
    pub ordinal: usize,
    pub time: Time,
}

/// Result of a cursor move
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub global: usize,
    pub stream: usize,
    pub ordinal: usize,
    pub time: Time,
    /// Present when the move was asked to read data
    pub sample: Option<Sample>,
}

/// Globally time-ordered view over a set of streams
#[derive(Debug)]
pub struct StreamAligner {
    streams: Vec<DataStream>,
    base_time: Option<Time>,
    entries: Vec<AlignerEntry>,
    /// First and last global ordinal per stream
    bounds: Vec<Option<(usize, usize)>>,
    last_visited: Vec<Option<SampleRef>>,
    position: Position,
}

impl Default for StreamAligner {
    fn default() -> Self {
        Self {
            streams: Vec::new(),
            base_time: None,
            entries: Vec::new(),
            bounds: Vec::new(),
            last_visited: Vec::new(),
            position: Position::BeforeStart,
        }
    }
}

fn entries_of(stream: &DataStream, number: usize, base: Time) -> impl Iterator<Item = AlignerEntry> + '_ {
    stream
        .index()
        .iter()
        .enumerate()
        .map(move |(local, (_, time))| AlignerEntry {
            time: time - base,
            local,
            stream: number,
            global: 0,
        })
}

impl StreamAligner {
    /// Align `streams`; on equal times, earlier streams come first
    pub fn new(streams: Vec<DataStream>) -> ReplayResult<Self> {
        let mut aligner = Self::default();
        aligner.add_streams(streams)?;
        Ok(aligner)
    }

    /// Number of aligned samples
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn streams(&self) -> &[DataStream] {
        &self.streams
    }

    pub fn stream(&self, number: usize) -> Option<&DataStream> {
        self.streams.get(number)
    }

    /// Number of `stream` within this aligner
    pub fn stream_number(&self, stream: &DataStream) -> Option<usize> {
        self.streams.iter().position(|s| s.is_same_stream(stream))
    }

    /// Reference time all entry times are relative to. Set by the first
    /// streams that carry samples and kept until every stream is removed.
    pub fn base_time(&self) -> Option<Time> {
        self.base_time
    }

    fn absolute(&self, relative: i64) -> Time {
        let base = self.base_time.unwrap_or_default();
        Time::from_micros(base.as_micros() + relative)
    }

    /// Times of the first and last aligned samples
    pub fn interval(&self) -> Option<(Time, Time)> {
        let first = self.entries.first()?;
        let last = self.entries.last()?;
        Some((self.absolute(first.time), self.absolute(last.time)))
    }

    pub fn entry(&self, global: usize) -> Option<&AlignerEntry> {
        self.entries.get(global)
    }

    pub fn entries(&self) -> &[AlignerEntry] {
        &self.entries
    }

    /// Smallest global ordinal occupied by a stream
    pub fn first_sample_pos(&self, stream: usize) -> Option<usize> {
        self.bounds.get(stream).copied().flatten().map(|(first, _)| first)
    }

    /// Largest global ordinal occupied by a stream
    pub fn last_sample_pos(&self, stream: usize) -> Option<usize> {
        self.bounds.get(stream).copied().flatten().map(|(_, last)| last)
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn is_eof(&self) -> bool {
        self.position == Position::End
    }

    pub fn is_before_start(&self) -> bool {
        self.position == Position::BeforeStart
    }

    /// Back to the before-the-beginning position
    pub fn rewind(&mut self) {
        self.position = Position::BeforeStart;
    }

    fn renumber(&mut self) {
        self.bounds = vec![None; self.streams.len()];
        for (global, entry) in self.entries.iter_mut().enumerate() {
            entry.global = global;
            let bounds = &mut self.bounds[entry.stream];
            *bounds = Some(match *bounds {
                None => (global, global),
                Some((first, _)) => (first, global),
            });
        }
    }

    fn goto(&mut self, global: usize, read_data: bool) -> ReplayResult<Step> {
        let entry = self.entries.get(global).copied().ok_or_else(|| {
            ReplayError::out_of_range(format!("position {} beyond {}", global, self.entries.len()))
        })?;
        let time = self.absolute(entry.time);
        let sample = if read_data {
            Some(self.streams[entry.stream].read_sample(entry.local)?)
        } else {
            None
        };

        self.position = Position::At(global);
        self.last_visited[entry.stream] = Some(SampleRef {
            stream: entry.stream,
            ordinal: entry.local,
            time,
        });
        Ok(Step {
            global,
            stream: entry.stream,
            ordinal: entry.local,
            time,
            sample,
        })
    }

    /// Move to global ordinal `global`. `size()` is the end position and
    /// yields `None`; anything past it is `OutOfRange`.
    pub fn seek_to_pos(&mut self, global: usize, read_data: bool) -> ReplayResult<Option<Step>> {
        let size = self.entries.len();
        if global > size {
            return Err(ReplayError::out_of_range(format!(
                "position {} beyond end {}",
                global, size
            )));
        }
        if global == size {
            self.position = Position::End;
            return Ok(None);
        }
        self.goto(global, read_data).map(Some)
    }

    /// Move to the first sample at or after `time`
    pub fn seek_to_time(&mut self, time: Time, read_data: bool) -> ReplayResult<Step> {
        let (min, max) = self
            .interval()
            .ok_or_else(|| ReplayError::out_of_range("aligner has no samples"))?;
        if time < min || time > max {
            return Err(ReplayError::out_of_range(format!(
                "time {} outside [{}, {}]",
                time, min, max
            )));
        }

        let relative = time - self.base_time.unwrap_or_default();
        let global = self.entries.partition_point(|e| e.time < relative);
        self.goto(global, read_data)
    }

    /// Next sample in global order; `None` once the end is reached
    pub fn advance(&mut self) -> ReplayResult<Option<Step>> {
        let target = match self.position {
            Position::BeforeStart => 0,
            Position::At(i) => i + 1,
            Position::End => return Ok(None),
        };
        self.seek_to_pos(target, false)
    }

    /// Previous sample in global order; `None` once before the beginning
    pub fn step_back(&mut self) -> ReplayResult<Option<Step>> {
        let target = match self.position {
            Position::BeforeStart | Position::At(0) => {
                self.position = Position::BeforeStart;
                return Ok(None);
            }
            Position::At(i) => i - 1,
            Position::End => match self.entries.len() {
                0 => {
                    self.position = Position::BeforeStart;
                    return Ok(None);
                }
                size => size - 1,
            },
        };
        self.goto(target, false).map(Some)
    }

    /// Sample of `stream` most recently visited by a cursor move
    pub fn single_data(&self, stream: usize) -> Option<SampleRef> {
        self.last_visited.get(stream).copied().flatten()
    }

    /// Read the sample behind [`StreamAligner::single_data`]
    pub fn read_single_data(&self, stream: usize) -> ReplayResult<Option<Sample>> {
        let handle = self
            .streams
            .get(stream)
            .ok_or_else(|| ReplayError::UnknownStream(format!("stream number {}", stream)))?;
        match self.single_data(stream) {
            Some(location) => handle.read_sample(location.ordinal).map(Some),
            None => Ok(None),
        }
    }

    /// Merge more streams into the global order.
    ///
    /// A cursor on a sample stays on that sample. A cursor at the end moves to
    /// the first new sample after the previous last one, if there is any, and
    /// returns it.
    pub fn add_streams(&mut self, streams: Vec<DataStream>) -> ReplayResult<Option<Step>> {
        for (i, stream) in streams.iter().enumerate() {
            if self.stream_number(stream).is_some()
                || streams[..i].iter().any(|s| s.is_same_stream(stream))
            {
                return Err(ReplayError::invalid_input(format!(
                    "stream {} is already aligned",
                    stream.name()
                )));
            }
        }
        if streams.is_empty() {
            return Ok(None);
        }

        if self.base_time.is_none() {
            self.base_time = streams.iter().filter_map(|s| s.index().base_time()).min();
        }
        let base = self.base_time.unwrap_or_default();
        let first_number = self.streams.len();

        let mut added: Vec<AlignerEntry> = streams
            .iter()
            .enumerate()
            .flat_map(|(k, s)| entries_of(s, first_number + k, base))
            .collect();
        added.sort_by_key(|e| e.time);

        // Stable merge, existing entries first on equal times
        let old = mem::take(&mut self.entries);
        let mut old_to_new = Vec::with_capacity(old.len());
        let mut merged = Vec::with_capacity(old.len() + added.len());
        let mut incoming = added.into_iter().peekable();
        for entry in old {
            while let Some(new) = incoming.next_if(|n| n.time < entry.time) {
                merged.push(new);
            }
            old_to_new.push(merged.len());
            merged.push(entry);
        }
        merged.extend(incoming);

        log::debug!(
            "aligner: added {} stream(s), {} -> {} samples",
            streams.len(),
            old_to_new.len(),
            merged.len()
        );

        self.entries = merged;
        self.last_visited.extend(streams.iter().map(|_| None));
        self.streams.extend(streams);
        self.renumber();

        match self.position {
            Position::At(i) => {
                self.position = Position::At(old_to_new[i]);
                Ok(None)
            }
            Position::End => {
                let next = old_to_new.last().map_or(0, |&last| last + 1);
                if next < self.entries.len() {
                    self.goto(next, true).map(Some)
                } else {
                    Ok(None)
                }
            }
            Position::BeforeStart => Ok(None),
        }
    }

    /// Drop streams from the global order and renumber the rest densely.
    ///
    /// If the current sample belonged to a removed stream, the cursor moves to
    /// the first remaining sample at or after its time and returns it.
    pub fn remove_streams(&mut self, streams: &[DataStream]) -> ReplayResult<Option<Step>> {
        let mut removed = vec![false; self.streams.len()];
        for stream in streams {
            let number = self
                .stream_number(stream)
                .ok_or_else(|| ReplayError::UnknownStream(stream.name().to_string()))?;
            removed[number] = true;
        }
        if !removed.iter().any(|&r| r) {
            return Ok(None);
        }

        let mut renumbered = Vec::with_capacity(removed.len());
        let mut next = 0;
        for &r in &removed {
            if r {
                renumbered.push(None);
            } else {
                renumbered.push(Some(next));
                next += 1;
            }
        }

        enum Current {
            Removed(i64),
            Kept(usize),
        }
        let current = match self.position {
            Position::At(i) if removed[self.entries[i].stream] => {
                Some(Current::Removed(self.entries[i].time))
            }
            Position::At(i) => Some(Current::Kept(
                self.entries[..i].iter().filter(|e| !removed[e.stream]).count(),
            )),
            _ => None,
        };

        let entries = mem::take(&mut self.entries);
        self.entries = entries
            .into_iter()
            .filter_map(|mut e| {
                renumbered[e.stream].map(|n| {
                    e.stream = n;
                    e
                })
            })
            .collect();

        let old_streams = mem::take(&mut self.streams);
        let old_visited = mem::take(&mut self.last_visited);
        for ((stream, visited), number) in old_streams.into_iter().zip(old_visited).zip(&renumbered) {
            if let Some(number) = *number {
                self.streams.push(stream);
                self.last_visited
                    .push(visited.map(|v| SampleRef { stream: number, ..v }));
            }
        }
        self.renumber();

        if self.streams.is_empty() {
            self.base_time = None;
            self.position = Position::BeforeStart;
            return Ok(None);
        }

        match current {
            Some(Current::Removed(time)) => {
                let next = self.entries.partition_point(|e| e.time < time);
                self.seek_to_pos(next, true)
            }
            Some(Current::Kept(same)) => {
                self.position = Position::At(same);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn declare_all(&self, writer: &mut LogWriter) -> ReplayResult<Vec<StreamHandle>> {
        self.streams
            .iter()
            .map(|s| {
                writer.declare_stream(StreamDeclaration {
                    name: s.name().to_string(),
                    type_name: s.type_name().to_string(),
                    type_description: s.type_description().to_vec(),
                    metadata: s.metadata_blob().to_vec(),
                })
            })
            .collect()
    }

    /// Copy the samples at global ordinals `start..=end` into `writer`, one new
    /// stream per aligned stream, timestamps unchanged. Returns the number of
    /// samples written.
    pub fn export(&self, writer: &mut LogWriter, start: usize, end: usize) -> ReplayResult<usize> {
        if start > end || end >= self.entries.len() {
            return Err(ReplayError::out_of_range(format!(
                "export range {}..={} outside 0..{}",
                start,
                end,
                self.entries.len()
            )));
        }

        let handles = self.declare_all(writer)?;
        for entry in &self.entries[start..=end] {
            let sample = self.streams[entry.stream].read_sample(entry.local)?;
            writer.write_sample(
                handles[entry.stream],
                sample.realtime,
                sample.logical,
                &sample.data,
            )?;
        }
        Ok(end - start + 1)
    }

    /// Copy every aligned sample into `writer`
    pub fn export_all(&self, writer: &mut LogWriter) -> ReplayResult<usize> {
        if self.entries.is_empty() {
            self.declare_all(writer)?;
            return Ok(0);
        }
        self.export(writer, 0, self.entries.len() - 1)
    }
}
