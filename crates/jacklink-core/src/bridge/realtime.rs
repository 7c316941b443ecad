//! The server-side half of the bridge
//!
//! [`RealtimeBridgeCallback::process`] runs on the server's real-time thread.
//! It only copies between the cycle's port buffers and the rings: no
//! allocation, no locks, no logging, no syscalls. Anything it needs to say
//! goes through [`ServerSignals`] atomics.

use std::sync::Arc;

use crate::ring::{RingReader, RingWriter};
use crate::server::ServerSignals;
use crate::types::Sample;

/// Access to one cycle's server port buffers
///
/// Implemented by each backend over its native buffer type. Input and output
/// indices follow port registration order.
pub trait CycleBuffers {
    /// Frames in this cycle
    fn frames(&self) -> usize;

    fn input_count(&self) -> usize;

    fn output_count(&self) -> usize;

    /// Samples arriving on input port `port`
    fn input(&self, port: usize) -> &[Sample];

    /// Buffer to fill for output port `port`
    fn output(&mut self, port: usize) -> &mut [Sample];
}

/// Result of one cycle, as seen by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CallbackStatus {
    Continue = 0,
    /// The cycle could not be served; outputs were silenced
    Failed = 1,
}

/// Per-session real-time state: the server ends of every ring
pub struct RealtimeBridgeCallback {
    /// Input port n → capture ring n
    capture: Vec<RingWriter>,
    /// Playback ring n → output port n
    playback: Vec<RingReader>,
    /// Largest cycle the rings can hold
    max_frames: usize,
    signals: Arc<ServerSignals>,
    failed: bool,
}

impl RealtimeBridgeCallback {
    pub fn new(capture: Vec<RingWriter>, playback: Vec<RingReader>, signals: Arc<ServerSignals>) -> Self {
        let max_frames = capture
            .iter()
            .map(RingWriter::capacity)
            .chain(playback.iter().map(RingReader::capacity))
            .min()
            .unwrap_or(usize::MAX);
        Self {
            capture,
            playback,
            max_frames,
            signals,
            failed: false,
        }
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    /// Whether a cycle has been refused (latched until the session is rebuilt)
    pub fn has_failed(&self) -> bool {
        self.failed
    }

    /// Serve one cycle
    #[inline]
    pub fn process(&mut self, cycle: &mut dyn CycleBuffers) -> CallbackStatus {
        if !self.failed
            && (cycle.frames() > self.max_frames
                || cycle.input_count() != self.capture.len()
                || cycle.output_count() != self.playback.len())
        {
            self.failed = true;
            self.signals.notify_callback_failed();
        }
        if self.failed {
            for port in 0..cycle.output_count() {
                cycle.output(port).fill(0.0);
            }
            return CallbackStatus::Failed;
        }

        let frames = cycle.frames();
        for (port, ring) in self.capture.iter_mut().enumerate() {
            let input = cycle.input(port);
            ring.write(&input[..frames.min(input.len())]);
        }
        for (port, ring) in self.playback.iter_mut().enumerate() {
            let output = cycle.output(port);
            let len = frames.min(output.len());
            ring.read(&mut output[..len]);
        }

        self.signals.record_cycle(frames);
        CallbackStatus::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::StatusHandle;
    use crate::ring::LockFreeRingBuffer;
    use crate::server::{ServerEvent, ServerInfo};
    use crate::types::BridgeState;

    struct TestCycle {
        inputs: Vec<Vec<Sample>>,
        outputs: Vec<Vec<Sample>>,
    }

    impl TestCycle {
        fn new(frames: usize, inputs: usize, outputs: usize) -> Self {
            Self {
                inputs: (0..inputs)
                    .map(|p| (0..frames).map(|i| (p * 1000 + i) as Sample).collect())
                    .collect(),
                outputs: vec![vec![9.0; frames]; outputs],
            }
        }
    }

    impl CycleBuffers for TestCycle {
        fn frames(&self) -> usize {
            self.inputs.first().or(self.outputs.first()).map_or(0, Vec::len)
        }

        fn input_count(&self) -> usize {
            self.inputs.len()
        }

        fn output_count(&self) -> usize {
            self.outputs.len()
        }

        fn input(&self, port: usize) -> &[Sample] {
            &self.inputs[port]
        }

        fn output(&mut self, port: usize) -> &mut [Sample] {
            &mut self.outputs[port]
        }
    }

    fn signals(status: &StatusHandle) -> Arc<ServerSignals> {
        Arc::new(ServerSignals::new(
            status.clone(),
            ServerInfo {
                sample_rate: 48000,
                buffer_size: 64,
            },
        ))
    }

    #[test]
    fn test_cycle_moves_audio_both_ways() {
        let status = StatusHandle::new();
        let signals = signals(&status);
        let (capture_writer, mut capture_reader) = LockFreeRingBuffer::with_capacity(256);
        let (mut playback_writer, playback_reader) = LockFreeRingBuffer::with_capacity(256);
        let mut callback = RealtimeBridgeCallback::new(vec![capture_writer], vec![playback_reader], signals.clone());

        playback_writer.write(&[0.5; 64]);
        let mut cycle = TestCycle::new(64, 1, 1);
        assert_eq!(callback.process(&mut cycle), CallbackStatus::Continue);

        assert_eq!(cycle.outputs[0], vec![0.5; 64]);
        let mut captured = vec![0.0; 64];
        assert_eq!(capture_reader.read(&mut captured), 64);
        assert_eq!(captured, cycle.inputs[0]);
        assert_eq!(signals.cycles(), 1);
    }

    #[test]
    fn test_playback_underrun_is_silence() {
        let status = StatusHandle::new();
        let signals = signals(&status);
        let (capture_writer, _capture_reader) = LockFreeRingBuffer::with_capacity(256);
        let (mut playback_writer, playback_reader) = LockFreeRingBuffer::with_capacity(256);
        let mut callback = RealtimeBridgeCallback::new(vec![capture_writer], vec![playback_reader], signals);

        playback_writer.write(&[0.25; 16]);
        let mut cycle = TestCycle::new(64, 1, 1);
        assert_eq!(callback.process(&mut cycle), CallbackStatus::Continue);
        assert_eq!(cycle.outputs[0][..16], [0.25; 16]);
        assert!(cycle.outputs[0][16..].iter().all(|&s| s == 0.0));
        assert_eq!(playback_writer.stats().underruns(), 1);
    }

    #[test]
    fn test_oversized_cycle_fails_and_latches() {
        let status = StatusHandle::new();
        status.store(BridgeState::Active);
        let signals = signals(&status);
        let (capture_writer, _capture_reader) = LockFreeRingBuffer::with_capacity(64);
        let (_playback_writer, playback_reader) = LockFreeRingBuffer::with_capacity(64);
        let mut callback = RealtimeBridgeCallback::new(vec![capture_writer], vec![playback_reader], signals.clone());

        let mut big = TestCycle::new(128, 1, 1);
        assert_eq!(callback.process(&mut big), CallbackStatus::Failed);
        assert!(big.outputs[0].iter().all(|&s| s == 0.0));
        assert_eq!(status.state(), BridgeState::Degraded);
        assert!(signals.take_events().contains(&ServerEvent::CallbackFailed));

        // Still failed for a well-sized cycle
        let mut small = TestCycle::new(32, 1, 1);
        assert_eq!(callback.process(&mut small), CallbackStatus::Failed);
        assert!(callback.has_failed());
        assert_eq!(signals.cycles(), 0);
    }

    #[test]
    fn test_port_count_mismatch_fails() {
        let status = StatusHandle::new();
        let signals = signals(&status);
        let (capture_writer, _capture_reader) = LockFreeRingBuffer::with_capacity(64);
        let mut callback = RealtimeBridgeCallback::new(vec![capture_writer], Vec::new(), signals);

        let mut cycle = TestCycle::new(32, 2, 0);
        assert_eq!(callback.process(&mut cycle), CallbackStatus::Failed);
    }
}
