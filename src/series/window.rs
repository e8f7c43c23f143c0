//! Bounded rolling windows.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;

use crate::db::Timestamp;

/// Read-only copy of a window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WindowSnapshot {
    pub timestamps: Vec<Timestamp>,
    pub counts: Vec<Option<u32>>,
}

/// Capacity and age bounds shared by a host window and its axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowBounds {
    pub capacity: usize,
    /// Entries older than this, measured from the newest entry, are evicted.
    pub retention_ms: Option<i64>,
}

impl WindowBounds {
    pub fn new(capacity: usize, retention: Option<Duration>) -> Self {
        Self {
            capacity: capacity.max(1),
            retention_ms: retention.map(|r| r.as_millis() as i64),
        }
    }

    fn exceeded(&self, len: usize, oldest: Timestamp, newest: Timestamp) -> bool {
        len > self.capacity || self.retention_ms.is_some_and(|age| newest - oldest > age)
    }
}

/// Timestamps and counts kept in lockstep, oldest first.
#[derive(Debug, Clone)]
pub struct GraphWindow {
    bounds: WindowBounds,
    timestamps: VecDeque<Timestamp>,
    counts: VecDeque<Option<u32>>,
}

impl GraphWindow {
    pub fn new(bounds: WindowBounds) -> Self {
        Self {
            bounds,
            timestamps: VecDeque::new(),
            counts: VecDeque::new(),
        }
    }

    /// Append a point and evict from the front. Returns the number evicted.
    pub fn push(&mut self, timestamp: Timestamp, count: Option<u32>) -> usize {
        self.timestamps.push_back(timestamp);
        self.counts.push_back(count);

        let mut evicted = 0;
        while let Some(&oldest) = self.timestamps.front() {
            if !self.bounds.exceeded(self.timestamps.len(), oldest, timestamp) {
                break;
            }
            self.timestamps.pop_front();
            self.counts.pop_front();
            evicted += 1;
        }
        evicted
    }

    /// Replace the contents, keeping only what the bounds allow.
    pub fn reload<I>(&mut self, points: I)
    where
        I: IntoIterator<Item = (Timestamp, Option<u32>)>,
    {
        self.timestamps.clear();
        self.counts.clear();
        for (timestamp, count) in points {
            self.push(timestamp, count);
        }
    }

    pub fn get(&self, index: usize) -> Option<(Timestamp, Option<u32>)> {
        Some((*self.timestamps.get(index)?, *self.counts.get(index)?))
    }

    /// Index of the highest count; the earliest wins on ties.
    pub fn peak_index(&self) -> Option<usize> {
        let mut best: Option<(usize, u32)> = None;
        for (i, count) in self.counts.iter().enumerate() {
            if let Some(count) = *count {
                if best.map_or(true, |(_, b)| count > b) {
                    best = Some((i, count));
                }
            }
        }
        best.map(|(i, _)| i)
    }

    pub fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            timestamps: self.timestamps.iter().copied().collect(),
            counts: self.counts.iter().copied().collect(),
        }
    }
}

/// Tick timestamps shared by every host's windows.
#[derive(Debug, Clone)]
pub struct TimeAxis {
    bounds: WindowBounds,
    points: VecDeque<Timestamp>,
}

impl TimeAxis {
    pub fn new(bounds: WindowBounds) -> Self {
        Self {
            bounds,
            points: VecDeque::new(),
        }
    }

    pub fn push(&mut self, timestamp: Timestamp) {
        self.points.push_back(timestamp);
        while let Some(&oldest) = self.points.front() {
            if !self.bounds.exceeded(self.points.len(), oldest, timestamp) {
                break;
            }
            self.points.pop_front();
        }
    }

    pub fn reload(&mut self, points: impl IntoIterator<Item = Timestamp>) {
        self.points.clear();
        for timestamp in points {
            self.push(timestamp);
        }
    }

    pub fn last(&self) -> Option<Timestamp> {
        self.points.back().copied()
    }

    pub fn to_vec(&self) -> Vec<Timestamp> {
        self.points.iter().copied().collect()
    }
}

/// Indices of the points kept when thinning a series to one point per
/// `min_gap_ms`: the first point, then each point at least `min_gap_ms`
/// after the previously kept one. Live ticks are gated the same way.
pub fn thin(timestamps: &[Timestamp], min_gap_ms: i64) -> Vec<usize> {
    let mut kept = Vec::new();
    let mut last: Option<Timestamp> = None;
    for (i, &timestamp) in timestamps.iter().enumerate() {
        if last.map_or(true, |l| timestamp - l >= min_gap_ms) {
            kept.push(i);
            last = Some(timestamp);
        }
    }
    kept
}
