//! Common types for JackLink
//!
//! Sample and buffer types shared by the engine side and the server side of
//! the bridge, plus the bridge state enum reported to the host.

use serde::{Deserialize, Serialize};

/// Audio sample type (32-bit float, the native JACK port format)
pub type Sample = f32;

/// Default engine/server sample rate (48kHz)
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

/// Default engine block / server period in frames
pub const DEFAULT_BUFFER_SIZE: u32 = 512;

/// Largest server period the bridge pre-allocates for
/// Covers all common JACK configurations (16 .. 4096 frames)
pub const MAX_BUFFER_SIZE: usize = 8192;

/// Memory layout of an engine-side buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SampleLayout {
    /// Frames stored one after another: [L0, R0, L1, R1, ...]
    #[default]
    Interleaved,
    /// Channels stored one after another: [L0, L1, ..., R0, R1, ...]
    Planar,
}

/// A block of audio tagged with its format
///
/// This is the unit the engine exchanges with the bridge each cycle.
/// Samples are owned, but a buffer is never retained by the real-time side:
/// the adapter converts it into per-port rings before returning.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    samples: Vec<Sample>,
    channels: usize,
    frames: usize,
    sample_rate: u32,
    layout: SampleLayout,
}

impl AudioBuffer {
    /// Create a zero-filled buffer
    pub fn silence(channels: usize, frames: usize, sample_rate: u32) -> Self {
        Self::silence_with_layout(channels, frames, sample_rate, SampleLayout::Interleaved)
    }

    /// Create a zero-filled buffer with an explicit layout
    pub fn silence_with_layout(
        channels: usize,
        frames: usize,
        sample_rate: u32,
        layout: SampleLayout,
    ) -> Self {
        Self {
            samples: vec![0.0; channels * frames],
            channels,
            frames,
            sample_rate,
            layout,
        }
    }

    /// Create a buffer from interleaved samples [c0, c1, ..., c0, c1, ...]
    ///
    /// Trailing samples that do not form a whole frame are discarded.
    pub fn from_interleaved(samples: Vec<Sample>, channels: usize, sample_rate: u32) -> Self {
        let frames = if channels == 0 { 0 } else { samples.len() / channels };
        let mut samples = samples;
        samples.truncate(frames * channels);
        Self {
            samples,
            channels,
            frames,
            sample_rate,
            layout: SampleLayout::Interleaved,
        }
    }

    /// Create a buffer from one slice per channel
    ///
    /// All channels are cut to the length of the shortest one.
    pub fn from_planar<C: AsRef<[Sample]>>(channels: &[C], sample_rate: u32) -> Self {
        let frames = channels.iter().map(|c| c.as_ref().len()).min().unwrap_or(0);
        let mut samples = Vec::with_capacity(frames * channels.len());
        for channel in channels {
            samples.extend_from_slice(&channel.as_ref()[..frames]);
        }
        Self {
            samples,
            channels: channels.len(),
            frames,
            sample_rate,
            layout: SampleLayout::Planar,
        }
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    #[inline]
    pub fn frames(&self) -> usize {
        self.frames
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[inline]
    pub fn layout(&self) -> SampleLayout {
        self.layout
    }

    /// Raw sample storage in this buffer's layout
    #[inline]
    pub fn as_slice(&self) -> &[Sample] {
        &self.samples
    }

    /// Mutable raw sample storage in this buffer's layout
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [Sample] {
        &mut self.samples
    }

    #[inline]
    fn index_of(&self, frame: usize, channel: usize) -> usize {
        match self.layout {
            SampleLayout::Interleaved => frame * self.channels + channel,
            SampleLayout::Planar => channel * self.frames + frame,
        }
    }

    /// Read one sample (panics when out of range)
    #[inline]
    pub fn sample(&self, frame: usize, channel: usize) -> Sample {
        self.samples[self.index_of(frame, channel)]
    }

    /// Write one sample (panics when out of range)
    #[inline]
    pub fn set_sample(&mut self, frame: usize, channel: usize, value: Sample) {
        let idx = self.index_of(frame, channel);
        self.samples[idx] = value;
    }

    /// Iterate over one channel regardless of layout
    pub fn channel(&self, channel: usize) -> impl Iterator<Item = Sample> + '_ {
        (0..self.frames).map(move |frame| self.sample(frame, channel))
    }

    /// Copy out the samples in interleaved order
    pub fn to_interleaved(&self) -> Vec<Sample> {
        match self.layout {
            SampleLayout::Interleaved => self.samples.clone(),
            SampleLayout::Planar => {
                let mut out = Vec::with_capacity(self.samples.len());
                for frame in 0..self.frames {
                    for channel in 0..self.channels {
                        out.push(self.sample(frame, channel));
                    }
                }
                out
            }
        }
    }

    /// Copy out the samples as one Vec per channel
    pub fn to_planar(&self) -> Vec<Vec<Sample>> {
        (0..self.channels).map(|c| self.channel(c).collect()).collect()
    }

    /// Convert to the given layout (no-op when it already matches)
    pub fn into_layout(self, layout: SampleLayout) -> Self {
        if self.layout == layout {
            return self;
        }
        let samples = match layout {
            SampleLayout::Interleaved => self.to_interleaved(),
            SampleLayout::Planar => self.to_planar().concat(),
        };
        Self { samples, layout, ..self }
    }

    /// Check whether every sample is exactly zero
    pub fn is_silent(&self) -> bool {
        self.samples.iter().all(|&s| s == 0.0)
    }

    /// Peak absolute amplitude across all channels
    pub fn peak(&self) -> Sample {
        self.samples.iter().map(|s| s.abs()).fold(0.0, Sample::max)
    }
}

/// Lifecycle state of the bridge, as reported to the host application
///
/// ```text
/// Uninitialized ──► Connecting ──► Active ◄──► Degraded
///        │               │            │            │
///        └───────────────┴────────────┴────────────┴──► Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum BridgeState {
    #[default]
    Uninitialized = 0,
    Connecting = 1,
    Active = 2,
    /// Server unavailable, disabled or disconnected: the bridge passes silence
    Degraded = 3,
    /// Terminal
    Stopped = 4,
}

impl BridgeState {
    /// Decode from the atomic representation (unknown values map to Stopped)
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => BridgeState::Uninitialized,
            1 => BridgeState::Connecting,
            2 => BridgeState::Active,
            3 => BridgeState::Degraded,
            _ => BridgeState::Stopped,
        }
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(self, next: BridgeState) -> bool {
        use BridgeState::*;
        matches!(
            (self, next),
            (Uninitialized, Connecting)
                | (Connecting, Active)
                | (Connecting, Degraded)
                | (Active, Degraded)
                | (Degraded, Active)
                | (Uninitialized | Connecting | Active | Degraded, Stopped)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            BridgeState::Uninitialized => "Uninitialized",
            BridgeState::Connecting => "Connecting",
            BridgeState::Active => "Active",
            BridgeState::Degraded => "Degraded",
            BridgeState::Stopped => "Stopped",
        }
    }
}

impl std::fmt::Display for BridgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interleaved_accessors() {
        let buffer = AudioBuffer::from_interleaved(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 48000);

        assert_eq!(buffer.frames(), 3);
        assert_eq!(buffer.sample(0, 1), 2.0);
        assert_eq!(buffer.sample(2, 0), 5.0);
        assert_eq!(buffer.channel(1).collect::<Vec<_>>(), vec![2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_planar_to_interleaved() {
        let buffer = AudioBuffer::from_planar(&[vec![1.0, 3.0], vec![2.0, 4.0]], 44100);

        assert_eq!(buffer.layout(), SampleLayout::Planar);
        assert_eq!(buffer.to_interleaved(), vec![1.0, 2.0, 3.0, 4.0]);

        let interleaved = buffer.into_layout(SampleLayout::Interleaved);
        assert_eq!(interleaved.as_slice(), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(interleaved.sample(1, 1), 4.0);
    }

    #[test]
    fn test_partial_frame_discarded() {
        let buffer = AudioBuffer::from_interleaved(vec![1.0, 2.0, 3.0], 2, 48000);
        assert_eq!(buffer.frames(), 1);
        assert_eq!(buffer.as_slice().len(), 2);
    }

    #[test]
    fn test_state_transitions() {
        use BridgeState::*;
        assert!(Uninitialized.can_transition_to(Connecting));
        assert!(Active.can_transition_to(Degraded));
        assert!(Degraded.can_transition_to(Active));
        assert!(Connecting.can_transition_to(Stopped));
        assert!(!Stopped.can_transition_to(Active));
        assert!(!Uninitialized.can_transition_to(Active));
        assert_eq!(BridgeState::from_u8(Active as u8), Active);
    }
}
