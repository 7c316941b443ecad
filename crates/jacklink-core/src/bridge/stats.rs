//! Counters reported to the host

use std::sync::Arc;

use crate::ring::RingStats;

/// Xrun counters for one direction, summed over its ports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectionStats {
    pub overruns: u64,
    pub underruns: u64,
    pub dropped_frames: u64,
    pub missing_frames: u64,
}

impl DirectionStats {
    /// Sum the live counters of a set of rings
    pub fn collect(rings: &[Arc<RingStats>]) -> Self {
        rings.iter().fold(Self::default(), |acc, stats| Self {
            overruns: acc.overruns + stats.overruns(),
            underruns: acc.underruns + stats.underruns(),
            dropped_frames: acc.dropped_frames + stats.dropped_frames(),
            missing_frames: acc.missing_frames + stats.missing_frames(),
        })
    }

    pub fn add(&mut self, other: &Self) {
        self.overruns += other.overruns;
        self.underruns += other.underruns;
        self.dropped_frames += other.dropped_frames;
        self.missing_frames += other.missing_frames;
    }

    pub fn xruns(&self) -> u64 {
        self.overruns + self.underruns
    }
}

/// Snapshot of bridge activity, cumulative over all sessions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Current session generation (0 = never started)
    pub generation: u64,
    /// Process cycles served
    pub cycles: u64,
    /// Xruns reported by the server itself
    pub server_xruns: u64,
    /// Server → engine rings
    pub capture: DirectionStats,
    /// Engine → server rings
    pub playback: DirectionStats,
}

impl BridgeStats {
    /// Fold a finished session's counters into the running totals
    pub fn absorb(&mut self, session: &BridgeStats) {
        self.cycles += session.cycles;
        self.server_xruns += session.server_xruns;
        self.capture.add(&session.capture);
        self.playback.add(&session.playback);
    }
}
