//! Engine buffer ↔ server port format conversion
//!
//! The engine exchanges [`AudioBuffer`]s (interleaved or planar, engine
//! channel count, engine sample rate). The server side of the bridge deals in
//! one mono `f32` stream per port at the server sample rate. The
//! [`SampleFormatConverter`] owns both directions:
//!
//! ```text
//! playback: AudioBuffer ─► channel map (engine → output ports) ─► resample ─► port streams
//! capture:  port streams ─► resample ─► channel map (input ports → engine) ─► AudioBuffer
//! ```
//!
//! Channel maps are resolved once at configure time so that unsupported
//! combinations fail fast with `FormatMismatch`.

mod resample;

pub use resample::{make_resampler, LinearResampler, ResamplePolicy, Resampler, SincResampler};

use serde::{Deserialize, Serialize};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::types::{AudioBuffer, Sample, SampleLayout};

/// How to route between differing channel counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChannelMapPolicy {
    /// Mono is duplicated to every target, anything folded down to mono is
    /// averaged, extra sources are dropped and missing targets silenced
    #[default]
    Adaptive,
    /// Common channels routed 1:1; extras dropped, missing targets silenced
    Direct,
    /// Channel counts must match exactly
    Strict,
}

/// Resolved routing from `sources` channels to `routes.len()` target channels
///
/// Each target is the average of its source list; an empty list is silence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMap {
    sources: usize,
    routes: Vec<Vec<usize>>,
}

impl ChannelMap {
    /// 1:1 routing
    pub fn identity(channels: usize) -> Self {
        Self {
            sources: channels,
            routes: (0..channels).map(|c| vec![c]).collect(),
        }
    }

    /// Resolve a routing for the given counts under `policy`
    pub fn resolve(sources: usize, targets: usize, policy: ChannelMapPolicy) -> BridgeResult<Self> {
        if sources == 0 || targets == 0 {
            return Err(BridgeError::FormatMismatch(format!(
                "cannot map {} channels to {} channels",
                sources, targets
            )));
        }
        if sources == targets {
            return Ok(Self::identity(sources));
        }

        let routes = match policy {
            ChannelMapPolicy::Strict => {
                return Err(BridgeError::FormatMismatch(format!(
                    "{} channels do not match {} ports and the mapping policy is strict",
                    sources, targets
                )));
            }
            ChannelMapPolicy::Adaptive if sources == 1 => vec![vec![0]; targets],
            ChannelMapPolicy::Adaptive if targets == 1 => vec![(0..sources).collect()],
            ChannelMapPolicy::Adaptive | ChannelMapPolicy::Direct => (0..targets)
                .map(|t| if t < sources { vec![t] } else { Vec::new() })
                .collect(),
        };
        Ok(Self { sources, routes })
    }

    pub fn sources(&self) -> usize {
        self.sources
    }

    pub fn targets(&self) -> usize {
        self.routes.len()
    }

    pub fn is_identity(&self) -> bool {
        self.sources == self.routes.len()
            && self.routes.iter().enumerate().all(|(t, r)| r.as_slice() == [t])
    }

    /// Source channels feeding `target`
    pub fn route(&self, target: usize) -> &[usize] {
        &self.routes[target]
    }

    /// Compute one target sample from a source sample accessor
    #[inline]
    fn mix(&self, target: usize, source: impl Fn(usize) -> Sample) -> Sample {
        match self.routes[target].as_slice() {
            [] => 0.0,
            [single] => source(*single),
            many => many.iter().map(|&s| source(s)).sum::<Sample>() / many.len() as Sample,
        }
    }
}

/// Converts engine buffers to per-port streams and back
pub struct SampleFormatConverter {
    engine_channels: usize,
    engine_rate: u32,
    engine_layout: SampleLayout,
    server_rate: u32,
    /// engine channels → output ports
    playback_map: ChannelMap,
    /// input ports → engine channels
    capture_map: ChannelMap,
    /// engine rate → server rate (None when rates match)
    playback_resampler: Option<Box<dyn Resampler>>,
    /// server rate → engine rate (None when rates match)
    capture_resampler: Option<Box<dyn Resampler>>,
    /// Scratch for the mapped, not yet resampled playback block
    mapped: Vec<Vec<Sample>>,
    /// Scratch for the resampled capture block
    resampled: Vec<Vec<Sample>>,
}

impl SampleFormatConverter {
    /// Build a converter for one bridge session
    ///
    /// Fails with `FormatMismatch` when the channel counts can't be mapped
    /// under `policy` or the rates differ and `resample` is `Reject`.
    pub fn new(
        config: &BridgeConfig,
        server_rate: u32,
        input_ports: usize,
        output_ports: usize,
        policy: ChannelMapPolicy,
        resample: ResamplePolicy,
    ) -> BridgeResult<Self> {
        let playback_map = ChannelMap::resolve(config.channels, output_ports, policy)?;
        let capture_map = ChannelMap::resolve(input_ports, config.channels, policy)?;
        let playback_resampler =
            make_resampler(resample, config.sample_rate, server_rate, output_ports)?;
        let capture_resampler =
            make_resampler(resample, server_rate, config.sample_rate, input_ports)?;

        Ok(Self {
            engine_channels: config.channels,
            engine_rate: config.sample_rate,
            engine_layout: config.layout,
            server_rate,
            playback_map,
            capture_map,
            playback_resampler,
            capture_resampler,
            mapped: vec![Vec::new(); output_ports],
            resampled: vec![Vec::new(); input_ports],
        })
    }

    pub fn engine_rate(&self) -> u32 {
        self.engine_rate
    }

    pub fn server_rate(&self) -> u32 {
        self.server_rate
    }

    pub fn engine_channels(&self) -> usize {
        self.engine_channels
    }

    pub fn playback_map(&self) -> &ChannelMap {
        &self.playback_map
    }

    pub fn capture_map(&self) -> &ChannelMap {
        &self.capture_map
    }

    /// Whether engine and server run at different rates
    pub fn resamples(&self) -> bool {
        self.engine_rate != self.server_rate
    }

    /// Server-rate frames to read so that roughly `engine_frames` come out
    pub fn server_frames_for(&self, engine_frames: usize) -> usize {
        match &self.capture_resampler {
            Some(r) => r.input_frames_for(engine_frames),
            None => engine_frames,
        }
    }

    /// Convert an engine buffer into one stream per output port
    ///
    /// `out` must hold one Vec per output port; each is cleared and refilled
    /// with server-rate samples. The number of frames written can differ from
    /// `engine.frames()` when resampling.
    pub fn to_external(&mut self, engine: &AudioBuffer, out: &mut [Vec<Sample>]) -> BridgeResult<()> {
        if engine.channels() != self.engine_channels || engine.sample_rate() != self.engine_rate {
            return Err(BridgeError::FormatMismatch(format!(
                "expected {} ch @ {}Hz, got {} ch @ {}Hz",
                self.engine_channels,
                self.engine_rate,
                engine.channels(),
                engine.sample_rate()
            )));
        }
        if out.len() != self.playback_map.targets() {
            return Err(BridgeError::FormatMismatch(format!(
                "expected {} port buffers, got {}",
                self.playback_map.targets(),
                out.len()
            )));
        }

        let frames = engine.frames();
        let target = match self.playback_resampler {
            Some(_) => &mut self.mapped,
            None => &mut *out,
        };
        for (port, stream) in target.iter_mut().enumerate() {
            stream.clear();
            stream.extend((0..frames).map(|frame| {
                self.playback_map
                    .mix(port, |channel| engine.sample(frame, channel))
            }));
        }

        if let Some(resampler) = self.playback_resampler.as_mut() {
            for stream in out.iter_mut() {
                stream.clear();
            }
            resampler.process(&self.mapped, out);
        }
        Ok(())
    }

    /// Convert one stream per input port into an engine buffer
    ///
    /// The returned buffer is at the engine rate and in the engine layout.
    /// When resampling, its frame count is whatever the resampler produced
    /// for this block.
    pub fn from_external<C: AsRef<[Sample]>>(&mut self, ports: &[C]) -> AudioBuffer {
        let resampled;
        let (streams, frames): (Vec<&[Sample]>, usize) = match self.capture_resampler.as_mut() {
            Some(resampler) => {
                let input: Vec<Vec<Sample>> = ports.iter().map(|p| p.as_ref().to_vec()).collect();
                for stream in &mut self.resampled {
                    stream.clear();
                }
                resampler.process(&input, &mut self.resampled);
                resampled = &self.resampled;
                let frames = resampled.iter().map(Vec::len).min().unwrap_or(0);
                (resampled.iter().map(Vec::as_slice).collect(), frames)
            }
            None => {
                let frames = ports.iter().map(|p| p.as_ref().len()).min().unwrap_or(0);
                (ports.iter().map(AsRef::as_ref).collect(), frames)
            }
        };

        let mut buffer = AudioBuffer::silence_with_layout(
            self.engine_channels,
            frames,
            self.engine_rate,
            self.engine_layout,
        );
        if streams.len() < self.capture_map.sources() {
            return buffer;
        }
        for frame in 0..frames {
            for channel in 0..self.engine_channels {
                let value = self.capture_map.mix(channel, |port| streams[port][frame]);
                buffer.set_sample(frame, channel, value);
            }
        }
        buffer
    }

    /// Drop resampler history (after a ring drain or renegotiation)
    pub fn reset(&mut self) {
        if let Some(r) = self.playback_resampler.as_mut() {
            r.reset();
        }
        if let Some(r) = self.capture_resampler.as_mut() {
            r.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(rate: u32, channels: usize) -> BridgeConfig {
        BridgeConfig::new(rate, 256, channels)
    }

    #[test]
    fn test_adaptive_mono_to_stereo_duplicates() {
        let map = ChannelMap::resolve(1, 2, ChannelMapPolicy::Adaptive).unwrap();
        assert_eq!(map.route(0), &[0]);
        assert_eq!(map.route(1), &[0]);
    }

    #[test]
    fn test_adaptive_stereo_to_mono_averages() {
        let map = ChannelMap::resolve(2, 1, ChannelMapPolicy::Adaptive).unwrap();
        assert_eq!(map.route(0), &[0, 1]);
        assert_eq!(map.mix(0, |c| [1.0, 0.0][c]), 0.5);
    }

    #[test]
    fn test_extra_channels_dropped_and_missing_silenced() {
        let down = ChannelMap::resolve(4, 2, ChannelMapPolicy::Adaptive).unwrap();
        assert_eq!(down.route(0), &[0]);
        assert_eq!(down.route(1), &[1]);

        let up = ChannelMap::resolve(2, 4, ChannelMapPolicy::Direct).unwrap();
        assert!(up.route(2).is_empty());
        assert_eq!(up.mix(3, |_| 1.0), 0.0);

        // Direct never duplicates mono
        let mono = ChannelMap::resolve(1, 2, ChannelMapPolicy::Direct).unwrap();
        assert!(mono.route(1).is_empty());
    }

    #[test]
    fn test_strict_rejects_mismatch() {
        assert!(matches!(
            ChannelMap::resolve(2, 1, ChannelMapPolicy::Strict),
            Err(BridgeError::FormatMismatch(_))
        ));
        assert!(ChannelMap::resolve(2, 2, ChannelMapPolicy::Strict).unwrap().is_identity());
        assert!(ChannelMap::resolve(0, 2, ChannelMapPolicy::Adaptive).is_err());
    }

    #[test]
    fn test_round_trip_identity_is_exact() {
        let cfg = config(48000, 2);
        let mut converter =
            SampleFormatConverter::new(&cfg, 48000, 2, 2, ChannelMapPolicy::Adaptive, ResamplePolicy::Linear)
                .unwrap();

        let samples: Vec<Sample> = (0..512).map(|i| (i as Sample * 0.37).sin()).collect();
        let original = AudioBuffer::from_interleaved(samples, 2, 48000);

        let mut ports = vec![Vec::new(), Vec::new()];
        converter.to_external(&original, &mut ports).unwrap();
        assert_eq!(ports[0].len(), 256);
        assert_eq!(ports[1][0], original.sample(0, 1));

        let back = converter.from_external(&ports);
        assert_eq!(back, original);
    }

    #[test]
    fn test_round_trip_planar_layout() {
        let cfg = config(48000, 2).with_layout(SampleLayout::Planar);
        let mut converter =
            SampleFormatConverter::new(&cfg, 48000, 2, 2, ChannelMapPolicy::Strict, ResamplePolicy::Reject)
                .unwrap();

        let original = AudioBuffer::from_planar(&[vec![0.1, 0.2, 0.3], vec![-0.1, -0.2, -0.3]], 48000);
        let mut ports = vec![Vec::new(), Vec::new()];
        converter.to_external(&original, &mut ports).unwrap();
        assert_eq!(ports[1], vec![-0.1, -0.2, -0.3]);
        assert_eq!(converter.from_external(&ports), original);
    }

    #[test]
    fn test_mono_engine_to_stereo_ports_and_back() {
        let cfg = config(48000, 1);
        let mut converter =
            SampleFormatConverter::new(&cfg, 48000, 2, 2, ChannelMapPolicy::Adaptive, ResamplePolicy::Linear)
                .unwrap();

        let mono = AudioBuffer::from_interleaved(vec![0.5, -0.5, 1.0], 1, 48000);
        let mut ports = vec![Vec::new(), Vec::new()];
        converter.to_external(&mono, &mut ports).unwrap();
        assert_eq!(ports[0], ports[1]);

        // Capture: two different inputs fold down by averaging
        let captured = converter.from_external(&[vec![1.0, 0.0], vec![0.0, 0.0]]);
        assert_eq!(captured.channels(), 1);
        assert_eq!(captured.channel(0).collect::<Vec<_>>(), vec![0.5, 0.0]);
    }

    #[test]
    fn test_rejects_wrong_engine_format() {
        let cfg = config(48000, 2);
        let mut converter =
            SampleFormatConverter::new(&cfg, 48000, 2, 2, ChannelMapPolicy::Adaptive, ResamplePolicy::Linear)
                .unwrap();
        let mut ports = vec![Vec::new(), Vec::new()];

        let wrong_rate = AudioBuffer::silence(2, 64, 44100);
        assert!(converter.to_external(&wrong_rate, &mut ports).is_err());

        let wrong_channels = AudioBuffer::silence(3, 64, 48000);
        assert!(converter.to_external(&wrong_channels, &mut ports).is_err());
    }

    #[test]
    fn test_rate_mismatch_with_reject_policy_fails_fast() {
        let cfg = config(44100, 2);
        let result =
            SampleFormatConverter::new(&cfg, 48000, 2, 2, ChannelMapPolicy::Adaptive, ResamplePolicy::Reject);
        assert!(matches!(result, Err(BridgeError::FormatMismatch(_))));
    }

    #[test]
    fn test_resampling_changes_frame_count() {
        let cfg = config(24000, 2);
        let mut converter =
            SampleFormatConverter::new(&cfg, 48000, 2, 2, ChannelMapPolicy::Adaptive, ResamplePolicy::Linear)
                .unwrap();
        assert!(converter.resamples());

        let block = AudioBuffer::silence(2, 128, 24000);
        let mut ports = vec![Vec::new(), Vec::new()];
        converter.to_external(&block, &mut ports).unwrap();
        assert!((254..=256).contains(&ports[0].len()));

        let back = converter.from_external(&ports);
        assert_eq!(back.sample_rate(), 24000);
        assert!((126..=129).contains(&back.frames()));
    }
}
