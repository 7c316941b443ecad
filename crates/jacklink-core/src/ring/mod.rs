//! Lock-free SPSC sample ring used to cross the real-time boundary
//!
//! One ring carries one port's worth of mono `f32` samples in one direction:
//!
//! ```text
//! capture:   RT callback ──write()──► ring ──read()──► engine adapter
//! playback:  engine adapter ──write()──► ring ──read()──► RT callback
//! ```
//!
//! Both halves are wait-free: no locks, no allocation and no syscalls after
//! construction. The only state shared between the two threads is the pair
//! of atomic cursors inside `rtrb` plus the relaxed counters in [`RingStats`].
//!
//! Overrun (writer faster than reader) drops the newest samples that do not
//! fit. Underrun (reader faster than writer) zero-fills the missing part.
//! Both are counted and never reported as errors.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rtrb::{Consumer, Producer, RingBuffer};

use crate::types::Sample;

/// Which side of a ring ran out of room or data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XrunKind {
    /// Writer had more samples than free slots; newest samples were dropped
    Overrun,
    /// Reader wanted more samples than were available; output was zero-filled
    Underrun,
}

/// Counters shared by both halves of a ring (lock-free, relaxed)
#[derive(Debug, Default)]
pub struct RingStats {
    overruns: AtomicU64,
    underruns: AtomicU64,
    dropped_frames: AtomicU64,
    missing_frames: AtomicU64,
}

impl RingStats {
    #[inline]
    fn record(&self, kind: XrunKind, frames: usize) {
        let (events, total) = match kind {
            XrunKind::Overrun => (&self.overruns, &self.dropped_frames),
            XrunKind::Underrun => (&self.underruns, &self.missing_frames),
        };
        events.fetch_add(1, Ordering::Relaxed);
        total.fetch_add(frames as u64, Ordering::Relaxed);
    }

    /// Number of writes that had to drop samples
    #[inline]
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Number of reads that had to zero-fill
    #[inline]
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Total samples dropped by overruns
    #[inline]
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Total samples replaced by silence on underrun
    #[inline]
    pub fn missing_frames(&self) -> u64 {
        self.missing_frames.load(Ordering::Relaxed)
    }
}

/// Constructor for a ring's two halves
pub struct LockFreeRingBuffer;

impl LockFreeRingBuffer {
    /// Create a ring holding at least `frames` samples
    ///
    /// The capacity is rounded up to the next power of two. Capacity is fixed
    /// for the life of the ring: resizing means building a new pair during
    /// renegotiation.
    pub fn with_capacity(frames: usize) -> (RingWriter, RingReader) {
        let capacity = frames.max(1).next_power_of_two();
        let (producer, consumer) = RingBuffer::new(capacity);
        let stats = Arc::new(RingStats::default());
        (
            RingWriter {
                producer,
                stats: stats.clone(),
                capacity,
            },
            RingReader {
                consumer,
                stats,
                capacity,
            },
        )
    }
}

/// Producer half of a ring (exactly one per ring)
pub struct RingWriter {
    producer: Producer<Sample>,
    stats: Arc<RingStats>,
    capacity: usize,
}

impl RingWriter {
    /// Append samples, returning how many were accepted
    ///
    /// RT-safe. Samples that don't fit are dropped and counted as an overrun.
    #[inline]
    pub fn write(&mut self, samples: &[Sample]) -> usize {
        let accepted = samples.len().min(self.producer.slots());
        if accepted > 0 {
            if let Ok(chunk) = self.producer.write_chunk_uninit(accepted) {
                chunk.fill_from_iter(samples[..accepted].iter().copied());
            }
        }
        if accepted < samples.len() {
            self.stats.record(XrunKind::Overrun, samples.len() - accepted);
        }
        accepted
    }

    /// Append `frames` zero samples (latency pre-roll)
    ///
    /// Silence that doesn't fit is silently discarded; this is not an overrun.
    pub fn write_silence(&mut self, frames: usize) -> usize {
        let accepted = frames.min(self.producer.slots());
        if accepted > 0 {
            if let Ok(chunk) = self.producer.write_chunk_uninit(accepted) {
                chunk.fill_from_iter(std::iter::repeat(0.0).take(accepted));
            }
        }
        accepted
    }

    /// Free slots available for writing
    #[inline]
    pub fn free(&self) -> usize {
        self.producer.slots()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the reader half has been dropped
    #[inline]
    pub fn is_abandoned(&self) -> bool {
        self.producer.is_abandoned()
    }

    pub fn stats(&self) -> &Arc<RingStats> {
        &self.stats
    }
}

/// Consumer half of a ring (exactly one per ring)
pub struct RingReader {
    consumer: Consumer<Sample>,
    stats: Arc<RingStats>,
    capacity: usize,
}

impl RingReader {
    /// Fill `out` from the ring, returning how many samples were real data
    ///
    /// RT-safe. `out` is always completely written: whatever the ring could
    /// not provide is zero-filled and counted as an underrun.
    #[inline]
    pub fn read(&mut self, out: &mut [Sample]) -> usize {
        let produced = out.len().min(self.consumer.slots());
        if produced > 0 {
            if let Ok(chunk) = self.consumer.read_chunk(produced) {
                let (first, second) = chunk.as_slices();
                out[..first.len()].copy_from_slice(first);
                out[first.len()..produced].copy_from_slice(second);
                chunk.commit_all();
            }
        }
        if produced < out.len() {
            out[produced..].fill(0.0);
            self.stats.record(XrunKind::Underrun, out.len() - produced);
        }
        produced
    }

    /// Discard everything currently readable, returning the number discarded
    pub fn clear(&mut self) -> usize {
        let available = self.consumer.slots();
        if let Ok(chunk) = self.consumer.read_chunk(available) {
            chunk.commit_all();
        }
        available
    }

    /// Samples available for reading
    #[inline]
    pub fn available(&self) -> usize {
        self.consumer.slots()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the writer half has been dropped
    #[inline]
    pub fn is_abandoned(&self) -> bool {
        self.consumer.is_abandoned()
    }

    pub fn stats(&self) -> &Arc<RingStats> {
        &self.stats
    }
}
