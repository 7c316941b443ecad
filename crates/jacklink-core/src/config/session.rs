//! Engine-side format of one bridge session

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};
use crate::types::{SampleLayout, DEFAULT_BUFFER_SIZE, DEFAULT_SAMPLE_RATE, MAX_BUFFER_SIZE};

/// What the engine renders and expects to capture
///
/// Immutable for the life of a session. Changing it while Active goes
/// through `BridgeLifecycleManager::reconfigure`, which renegotiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Engine sample rate (Hz)
    pub sample_rate: u32,
    /// Engine block size (frames per render call)
    pub buffer_size: usize,
    /// Engine channel count
    pub channels: usize,
    /// Layout of the buffers the engine exchanges
    pub layout: SampleLayout,
    /// Latency tolerance (frames at the engine rate)
    pub latency_frames: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_RATE, DEFAULT_BUFFER_SIZE as usize, 2)
    }
}

impl BridgeConfig {
    /// Interleaved config with a latency tolerance of one engine block
    pub fn new(sample_rate: u32, buffer_size: usize, channels: usize) -> Self {
        Self {
            sample_rate,
            buffer_size,
            channels,
            layout: SampleLayout::Interleaved,
            latency_frames: buffer_size,
        }
    }

    /// Set the latency tolerance in frames
    pub fn with_latency(mut self, frames: usize) -> Self {
        self.latency_frames = frames;
        self
    }

    /// Set the engine buffer layout
    pub fn with_layout(mut self, layout: SampleLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Reject configs no session could run with
    pub fn validate(&self) -> BridgeResult<()> {
        if self.channels == 0 {
            return Err(BridgeError::FormatMismatch("engine has no channels".to_string()));
        }
        if self.sample_rate == 0 {
            return Err(BridgeError::FormatMismatch("engine sample rate is 0Hz".to_string()));
        }
        if self.buffer_size == 0 || self.buffer_size > MAX_BUFFER_SIZE {
            return Err(BridgeError::InvalidSettings(format!(
                "engine buffer size {} outside 1..={}",
                self.buffer_size, MAX_BUFFER_SIZE
            )));
        }
        if self.latency_frames > MAX_BUFFER_SIZE {
            return Err(BridgeError::InvalidSettings(format!(
                "latency {} frames exceeds {}",
                self.latency_frames, MAX_BUFFER_SIZE
            )));
        }
        Ok(())
    }

    /// Engine-rate frame count expressed at `server_rate`
    ///
    /// Rounds up and adds one frame of slack for the resampler's phase
    /// whenever the rates differ.
    pub fn server_frames(&self, frames: usize, server_rate: u32) -> usize {
        if server_rate == self.sample_rate || self.sample_rate == 0 {
            return frames;
        }
        let scaled = (frames as u64 * server_rate as u64).div_ceil(self.sample_rate as u64);
        scaled as usize + 1
    }

    /// Silence pre-filled into playback rings: the latency tolerance at the
    /// server rate, never less than one server cycle
    pub fn preroll_frames(&self, server_cycle: usize, server_rate: u32) -> usize {
        self.server_frames(self.latency_frames, server_rate).max(server_cycle)
    }

    /// Ring capacity (samples per port) for a session with the given server format
    ///
    /// Room for the pre-roll plus two blocks of whichever side moves the
    /// larger chunks, all counted in server frames and rounded up to a power
    /// of two.
    pub fn ring_capacity(&self, server_cycle: usize, server_rate: u32) -> usize {
        let headroom = self.preroll_frames(server_cycle, server_rate);
        let block = server_cycle.max(self.server_frames(self.buffer_size, server_rate));
        (headroom + 2 * block).next_power_of_two()
    }

    /// Latency tolerance in milliseconds at the engine rate
    pub fn latency_ms(&self) -> f32 {
        self.latency_frames as f32 / self.sample_rate as f32 * 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = BridgeConfig::new(44100, 256, 1)
            .with_latency(1024)
            .with_layout(SampleLayout::Planar);
        assert_eq!(config.latency_frames, 1024);
        assert_eq!(config.layout, SampleLayout::Planar);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_channels() {
        let config = BridgeConfig::new(48000, 256, 0);
        assert!(matches!(config.validate(), Err(BridgeError::FormatMismatch(_))));
        assert!(BridgeConfig::new(48000, 0, 2).validate().is_err());
    }

    #[test]
    fn test_ring_capacity_policy() {
        let config = BridgeConfig::new(48000, 256, 2);
        // 256 pre-roll + 2 * 256
        assert_eq!(config.ring_capacity(256, 48000), 1024);
        // Server cycle smaller than the engine block
        assert_eq!(config.ring_capacity(128, 48000), 1024);
        // Large latency tolerance dominates
        assert_eq!(config.with_latency(4000).ring_capacity(256, 48000), 8192);
    }

    #[test]
    fn test_server_frames_scale_with_rate_ratio() {
        let config = BridgeConfig::new(22050, 256, 2);
        assert_eq!(config.server_frames(256, 22050), 256);
        // ceil(256 * 96000 / 22050) = 1115, plus one frame of slack
        assert_eq!(config.server_frames(256, 96000), 1116);
        // Downsampling shrinks the block
        assert_eq!(BridgeConfig::new(96000, 256, 2).server_frames(256, 48000), 129);
    }

    #[test]
    fn test_ring_capacity_covers_upsampled_block() {
        let config = BridgeConfig::new(22050, 256, 2);
        // 1116 pre-roll + 2 * 1116 server frames per engine block
        assert_eq!(config.preroll_frames(256, 96000), 1116);
        assert_eq!(config.ring_capacity(256, 96000), 4096);
        // Short latency still pre-rolls a full server cycle
        assert_eq!(config.with_latency(0).preroll_frames(256, 96000), 256);
    }
}
