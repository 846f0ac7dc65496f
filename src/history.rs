use crate::classifier::classify;
use crate::types::{Classification, Snapshot};
use std::collections::VecDeque;

/// Default rolling-history cap per timeframe.
const HISTORY_CAP: usize = 1500;

/// Bounded rolling snapshot history for one timeframe, with the
/// classification derived at ingestion time. Snapshots are processed
/// in arrival order; the history owns them once consumed.
pub struct TimeframeHistory {
    pub timeframe: String,
    snapshots: VecDeque<Snapshot>,
    classifications: VecDeque<Classification>,
    cap: usize,
}

impl TimeframeHistory {
    pub fn new(timeframe: String) -> Self {
        Self::with_cap(timeframe, HISTORY_CAP)
    }

    pub fn with_cap(timeframe: String, cap: usize) -> Self {
        Self {
            timeframe,
            snapshots: VecDeque::new(),
            classifications: VecDeque::new(),
            cap,
        }
    }

    /// Append a snapshot, deriving its classification. Oldest entries
    /// fall off once the cap is reached.
    pub fn push(&mut self, snapshot: Snapshot) -> Classification {
        let classification = classify(&snapshot);
        self.snapshots.push_back(snapshot);
        self.classifications.push_back(classification);
        while self.snapshots.len() > self.cap {
            self.snapshots.pop_front();
            self.classifications.pop_front();
        }
        classification
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn latest(&self) -> Option<&Snapshot> {
        self.snapshots.back()
    }

    /// Snapshot `n` ticks back from the latest (0 = latest).
    pub fn nth_back(&self, n: usize) -> Option<&Snapshot> {
        let len = self.snapshots.len();
        if n >= len {
            return None;
        }
        self.snapshots.get(len - 1 - n)
    }

    pub fn latest_classification(&self) -> Option<Classification> {
        self.classifications.back().copied()
    }

    pub fn classification_nth_back(&self, n: usize) -> Option<Classification> {
        let len = self.classifications.len();
        if n >= len {
            return None;
        }
        self.classifications.get(len - 1 - n).copied()
    }

    /// Number of ribbon-state flips within the last `lookback`
    /// snapshots. Thrashing markets flip often; the gate rejects when
    /// this exceeds the configured maximum.
    pub fn choppiness_flips(&self, lookback: usize) -> u32 {
        let len = self.classifications.len();
        let start = len.saturating_sub(lookback);
        let mut flips = 0u32;
        let mut prev = None;
        for c in self.classifications.iter().skip(start) {
            if let Some(p) = prev {
                if p != c.state {
                    flips += 1;
                }
            }
            prev = Some(c.state);
        }
        flips
    }
}
