//! Streaming sample rate conversion for the adapter side of the bridge
//!
//! Resamplers never run inside the real-time callback. The adapter feeds
//! them whatever it read from (or is about to write to) the port rings, so
//! they must be streaming: state carries over between calls and the number
//! of output frames per call is only approximately `input * ratio`.

use rubato::{
    Resampler as _, SincFixedIn, SincInterpolationParameters, SincInterpolationType,
    WindowFunction,
};
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};
use crate::types::Sample;

/// How to handle an engine/server sample rate mismatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResamplePolicy {
    /// Refuse mismatched rates (FormatMismatch)
    Reject,
    /// Linear interpolation: cheap, fine for monitoring
    #[default]
    Linear,
    /// Band-limited sinc interpolation via rubato
    Sinc,
}

/// A streaming multi-channel resampler
///
/// Swapping in a different implementation only touches the adapter side;
/// the real-time callback always sees server-rate samples.
pub trait Resampler: Send {
    fn input_rate(&self) -> u32;

    fn output_rate(&self) -> u32;

    fn channels(&self) -> usize;

    /// Consume every frame of `input` (one Vec per channel, equal lengths)
    /// and append the produced frames to `output` (one Vec per channel)
    fn process(&mut self, input: &[Vec<Sample>], output: &mut [Vec<Sample>]);

    /// Drop all internal history
    fn reset(&mut self);

    /// Input frames to feed so that at least `output_frames` more frames
    /// come out (may overshoot; extra output is kept by the caller)
    fn input_frames_for(&self, output_frames: usize) -> usize {
        let ratio = self.input_rate() as f64 / self.output_rate() as f64;
        (output_frames as f64 * ratio).ceil() as usize + 1
    }
}

/// Build the resampler for a rate pair, or `None` when no conversion is needed
pub fn make_resampler(
    policy: ResamplePolicy,
    input_rate: u32,
    output_rate: u32,
    channels: usize,
) -> BridgeResult<Option<Box<dyn Resampler>>> {
    if input_rate == 0 || output_rate == 0 {
        return Err(BridgeError::FormatMismatch(format!(
            "invalid sample rate pair {}Hz -> {}Hz",
            input_rate, output_rate
        )));
    }
    if input_rate == output_rate || channels == 0 {
        return Ok(None);
    }
    match policy {
        ResamplePolicy::Reject => Err(BridgeError::FormatMismatch(format!(
            "sample rate mismatch {}Hz -> {}Hz and resampling is disabled",
            input_rate, output_rate
        ))),
        ResamplePolicy::Linear => Ok(Some(Box::new(LinearResampler::new(
            input_rate,
            output_rate,
            channels,
        )))),
        ResamplePolicy::Sinc => Ok(Some(Box::new(SincResampler::new(
            input_rate,
            output_rate,
            channels,
        )?))),
    }
}

/// Linear interpolation resampler
///
/// Keeps the last input frame of each block so interpolation is continuous
/// across calls. With equal rates it reproduces its input exactly.
pub struct LinearResampler {
    input_rate: u32,
    output_rate: u32,
    /// Input frames advanced per output frame
    step: f64,
    /// Read position in the virtual stream [previous frame, block...]
    position: f64,
    previous: Vec<Sample>,
}

impl LinearResampler {
    pub fn new(input_rate: u32, output_rate: u32, channels: usize) -> Self {
        Self {
            input_rate,
            output_rate,
            step: input_rate as f64 / output_rate as f64,
            position: 1.0,
            previous: vec![0.0; channels],
        }
    }
}

impl Resampler for LinearResampler {
    fn input_rate(&self) -> u32 {
        self.input_rate
    }

    fn output_rate(&self) -> u32 {
        self.output_rate
    }

    fn channels(&self) -> usize {
        self.previous.len()
    }

    fn process(&mut self, input: &[Vec<Sample>], output: &mut [Vec<Sample>]) {
        let frames = input.iter().map(Vec::len).min().unwrap_or(0);
        if frames == 0 {
            return;
        }
        let channels = self.previous.len().min(input.len()).min(output.len());
        let end = frames as f64;

        // Stream index 0 is the previous block's last frame, 1..=frames is `input`
        let at = |channel: usize, index: usize, previous: &[Sample]| -> Sample {
            if index == 0 {
                previous[channel]
            } else {
                input[channel][index - 1]
            }
        };

        let mut position = self.position;
        while position <= end {
            let index = position.floor() as usize;
            let frac = (position - index as f64) as Sample;
            for (channel, out) in output.iter_mut().enumerate().take(channels) {
                let a = at(channel, index, &self.previous);
                let value = if index < frames && frac > 0.0 {
                    let b = at(channel, index + 1, &self.previous);
                    a + (b - a) * frac
                } else {
                    a
                };
                out.push(value);
            }
            position += self.step;
        }

        self.position = position - end;
        for (channel, prev) in self.previous.iter_mut().enumerate().take(channels) {
            *prev = input[channel][frames - 1];
        }
    }

    fn reset(&mut self) {
        self.position = 1.0;
        self.previous.fill(0.0);
    }
}

/// Fixed chunk size fed to rubato
const SINC_CHUNK_FRAMES: usize = 256;

/// Band-limited resampler built on rubato's `SincFixedIn`
///
/// rubato consumes fixed-size chunks, so input is staged until a full chunk
/// is available. This adds up to one chunk of latency on top of the filter
/// delay.
pub struct SincResampler {
    input_rate: u32,
    output_rate: u32,
    inner: SincFixedIn<Sample>,
    pending: Vec<Vec<Sample>>,
}

impl SincResampler {
    pub fn new(input_rate: u32, output_rate: u32, channels: usize) -> BridgeResult<Self> {
        let params = SincInterpolationParameters {
            sinc_len: 128,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        };
        let ratio = output_rate as f64 / input_rate as f64;
        let inner = SincFixedIn::<Sample>::new(ratio, 1.0, params, SINC_CHUNK_FRAMES, channels)
            .map_err(|e| BridgeError::FormatMismatch(format!("Failed to build resampler: {}", e)))?;
        Ok(Self {
            input_rate,
            output_rate,
            inner,
            pending: vec![Vec::with_capacity(SINC_CHUNK_FRAMES * 2); channels],
        })
    }
}

impl Resampler for SincResampler {
    fn input_rate(&self) -> u32 {
        self.input_rate
    }

    fn output_rate(&self) -> u32 {
        self.output_rate
    }

    fn channels(&self) -> usize {
        self.pending.len()
    }

    fn process(&mut self, input: &[Vec<Sample>], output: &mut [Vec<Sample>]) {
        for (pending, channel) in self.pending.iter_mut().zip(input) {
            pending.extend_from_slice(channel);
        }

        loop {
            let needed = self.inner.input_frames_next();
            let staged = self.pending.iter().map(Vec::len).min().unwrap_or(0);
            if staged < needed {
                break;
            }
            let chunk: Vec<&[Sample]> = self.pending.iter().map(|p| &p[..needed]).collect();
            match self.inner.process(&chunk, None) {
                Ok(produced) => {
                    for (out, block) in output.iter_mut().zip(produced) {
                        out.extend_from_slice(&block);
                    }
                }
                Err(e) => {
                    log::warn!("Resampler chunk failed, dropping {} frames: {}", needed, e);
                }
            }
            for pending in &mut self.pending {
                pending.drain(..needed);
            }
        }
    }

    fn reset(&mut self) {
        self.inner.reset();
        for pending in &mut self.pending {
            pending.clear();
        }
    }

    fn input_frames_for(&self, output_frames: usize) -> usize {
        let ratio = self.input_rate as f64 / self.output_rate as f64;
        let wanted = (output_frames as f64 * ratio).ceil() as usize;
        // Round up to whole chunks, minus what is already staged
        let staged = self.pending.iter().map(Vec::len).min().unwrap_or(0);
        let missing = wanted.saturating_sub(staged);
        missing.div_ceil(SINC_CHUNK_FRAMES).max(1) * SINC_CHUNK_FRAMES
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(len: usize, offset: usize) -> Vec<Sample> {
        (offset..offset + len).map(|i| i as Sample).collect()
    }

    #[test]
    fn test_equal_rates_need_no_resampler() {
        let r = make_resampler(ResamplePolicy::Linear, 48000, 48000, 2).unwrap();
        assert!(r.is_none());
    }

    #[test]
    fn test_reject_policy_is_format_mismatch() {
        let r = make_resampler(ResamplePolicy::Reject, 44100, 48000, 2);
        assert!(matches!(r, Err(BridgeError::FormatMismatch(_))));
    }

    #[test]
    fn test_linear_identity_ratio_is_exact() {
        let mut r = LinearResampler::new(48000, 48000, 1);
        let mut out = vec![Vec::new()];
        r.process(&[ramp(100, 0)], &mut out);
        r.process(&[ramp(50, 100)], &mut out);
        assert_eq!(out[0], ramp(150, 0));
    }

    #[test]
    fn test_linear_upsample_doubles_length_and_interpolates() {
        let mut r = LinearResampler::new(24000, 48000, 1);
        let mut out = vec![Vec::new()];
        for block in 0..10 {
            r.process(&[ramp(64, block * 64)], &mut out);
        }
        // 640 input frames at 2x, give or take the interpolation edge
        let len = out[0].len();
        assert!((1278..=1281).contains(&len), "got {}", len);
        // Output is a continuous ramp with half-sample steps after the first frame
        for pair in out[0][1..].windows(2) {
            assert!((pair[1] - pair[0] - 0.5).abs() < 1e-4);
        }
    }

    #[test]
    fn test_linear_downsample_length() {
        let mut r = LinearResampler::new(48000, 32000, 2);
        let mut out = vec![Vec::new(), Vec::new()];
        let input = vec![vec![0.25; 300], vec![-0.25; 300]];
        for _ in 0..10 {
            r.process(&input, &mut out);
        }
        let expected = 3000.0 * 32000.0 / 48000.0;
        assert!((out[0].len() as f64 - expected).abs() <= 2.0);
        assert_eq!(out[0].len(), out[1].len());
        // Constant input stays constant after the first interpolated frame
        assert!(out[1][2..].iter().all(|&s| (s + 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_input_frames_for_covers_request() {
        let mut r = LinearResampler::new(44100, 48000, 1);
        let want = 256;
        let feed = r.input_frames_for(want);
        let mut out = vec![Vec::new()];
        r.process(&[vec![0.0; feed]], &mut out);
        assert!(out[0].len() >= want);
    }

    #[test]
    fn test_sinc_resampler_produces_expected_rate() {
        let mut r = SincResampler::new(44100, 48000, 2).unwrap();
        let mut out = vec![Vec::new(), Vec::new()];
        let input = vec![vec![0.1; 1024], vec![0.2; 1024]];
        for _ in 0..8 {
            r.process(&input, &mut out);
        }
        let expected = 8192.0 * 48000.0 / 44100.0;
        assert!(out[0].len() as f64 > expected * 0.9);
        assert!((out[0].len() as f64) < expected * 1.1);
        assert_eq!(out[0].len(), out[1].len());
    }
}
