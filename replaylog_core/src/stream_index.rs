//! Per-stream sample index
//!
//! Maps sample ordinals to block positions and logical times. Times are kept
//! relative to the time of the first sample so the in-memory and on-disk forms
//! stay compact; lookups take and return absolute [`Time`]s.

use crate::error::{ReplayError, ReplayResult};
use crate::time::Time;

/// Position and logical time of every sample of one stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamIndex {
    positions: Vec<u64>,
    times: Vec<i64>,
    base_time: Option<Time>,
    interval_rt: Option<(Time, Time)>,
    interval_lg: Option<(Time, Time)>,
}

fn widen(interval: &mut Option<(Time, Time)>, time: Time) {
    *interval = Some(match *interval {
        None => (time, time),
        Some((min, max)) => (min.min(time), max.max(time)),
    });
}

impl StreamIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild an index from persisted columns. `times` are relative to
    /// `base_time`.
    pub fn from_parts(
        positions: Vec<u64>,
        times: Vec<i64>,
        base_time: Time,
        interval_rt: Option<(Time, Time)>,
        interval_lg: Option<(Time, Time)>,
    ) -> ReplayResult<Self> {
        if positions.len() != times.len() {
            return Err(ReplayError::corrupt_index(format!(
                "{} positions but {} times",
                positions.len(),
                times.len()
            )));
        }
        if positions.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ReplayError::corrupt_index(
                "sample positions are not strictly increasing",
            ));
        }
        if times.windows(2).any(|w| w[0] > w[1]) {
            return Err(ReplayError::corrupt_index("sample times go backward"));
        }

        let base_time = (!positions.is_empty()).then_some(base_time);
        Ok(Self {
            positions,
            times,
            base_time,
            interval_rt,
            interval_lg,
        })
    }

    /// Append one sample. Positions must strictly increase and logical times
    /// must not decrease.
    pub fn add_sample(&mut self, position: u64, realtime: Time, logical: Time) -> ReplayResult<()> {
        if let Some(&last) = self.positions.last() {
            if position <= last {
                return Err(ReplayError::monotonicity(format!(
                    "sample position {} is not after {}",
                    position, last
                )));
            }
        }
        if let Some((_, last_lg)) = self.interval_lg {
            if logical < last_lg {
                return Err(ReplayError::monotonicity(format!(
                    "logical time {} is before {}",
                    logical, last_lg
                )));
            }
        }

        let base = *self.base_time.get_or_insert(logical);
        self.positions.push(position);
        self.times.push(logical - base);
        widen(&mut self.interval_rt, realtime);
        widen(&mut self.interval_lg, logical);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Logical time of the first sample
    pub fn base_time(&self) -> Option<Time> {
        self.base_time
    }

    pub fn interval_rt(&self) -> Option<(Time, Time)> {
        self.interval_rt
    }

    pub fn interval_lg(&self) -> Option<(Time, Time)> {
        self.interval_lg
    }

    fn check(&self, ordinal: usize) -> ReplayResult<()> {
        if ordinal >= self.len() {
            return Err(ReplayError::IndexOutOfBounds {
                index: ordinal,
                size: self.len(),
            });
        }
        Ok(())
    }

    /// Block position of sample `ordinal`
    pub fn file_position(&self, ordinal: usize) -> ReplayResult<u64> {
        self.check(ordinal)?;
        Ok(self.positions[ordinal])
    }

    /// Logical time of sample `ordinal`
    pub fn time(&self, ordinal: usize) -> ReplayResult<Time> {
        self.check(ordinal)?;
        Ok(self.absolute(self.times[ordinal]))
    }

    /// Time of sample `ordinal` relative to [`StreamIndex::base_time`]
    pub fn relative_time(&self, ordinal: usize) -> ReplayResult<i64> {
        self.check(ordinal)?;
        Ok(self.times[ordinal])
    }

    fn absolute(&self, relative: i64) -> Time {
        let base = self.base_time.unwrap_or_default();
        Time::from_micros(base.as_micros() + relative)
    }

    /// Ordinal of the first sample whose time is `>= time`; `len()` when every
    /// sample is earlier.
    pub fn sample_number_by_time(&self, time: Time) -> usize {
        match self.base_time {
            None => 0,
            Some(base) => {
                let relative = time - base;
                self.times.partition_point(|&t| t < relative)
            }
        }
    }

    /// Ordinal of the sample at `position`, if one starts there
    pub fn sample_number_by_position(&self, position: u64) -> Option<usize> {
        self.positions.binary_search(&position).ok()
    }

    /// Append all samples of `other`, shifting its positions by
    /// `position_offset`. `other` must start after this index ends.
    pub fn concat(&mut self, other: &StreamIndex, position_offset: u64) -> ReplayResult<()> {
        if other.is_empty() {
            return Ok(());
        }

        if let (Some(&last), Some(&first)) = (self.positions.last(), other.positions.first()) {
            if first + position_offset <= last {
                return Err(ReplayError::monotonicity(format!(
                    "appended samples start at {} which is not after {}",
                    first + position_offset,
                    last
                )));
            }
        }
        for (mine, theirs, what) in [
            (self.interval_rt, other.interval_rt, "real time"),
            (self.interval_lg, other.interval_lg, "logical time"),
        ] {
            if let (Some((_, max)), Some((min, _))) = (mine, theirs) {
                if min < max {
                    return Err(ReplayError::monotonicity(format!(
                        "appended {} starts at {} before existing end {}",
                        what, min, max
                    )));
                }
            }
        }

        let base = *self
            .base_time
            .get_or_insert(other.base_time.unwrap_or_default());
        let shift = other.base_time.unwrap_or_default() - base;

        self.positions.reserve(other.len());
        self.times.reserve(other.len());
        for (&position, &time) in other.positions.iter().zip(&other.times) {
            self.positions.push(position + position_offset);
            self.times.push(time + shift);
        }
        if let Some((min, max)) = other.interval_rt {
            widen(&mut self.interval_rt, min);
            widen(&mut self.interval_rt, max);
        }
        if let Some((min, max)) = other.interval_lg {
            widen(&mut self.interval_lg, min);
            widen(&mut self.interval_lg, max);
        }
        Ok(())
    }

    /// `(position, logical time)` of every sample, in order
    pub fn iter(&self) -> impl Iterator<Item = (u64, Time)> + '_ {
        self.positions
            .iter()
            .zip(&self.times)
            .map(move |(&p, &t)| (p, self.absolute(t)))
    }

    pub fn positions(&self) -> &[u64] {
        &self.positions
    }

    /// Times relative to [`StreamIndex::base_time`]
    pub fn relative_times(&self) -> &[i64] {
        &self.times
    }
}
