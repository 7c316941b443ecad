//! The engine-side half of the bridge
//!
//! [`EngineAudioAdapter`] is called from the engine's audio thread on the
//! engine's own cadence. It is the only part of the data path allowed to
//! allocate, resample or log, but it never blocks: the session is reached
//! through `try_lock`, and whenever the control context holds it (or there is
//! no active session) the adapter answers with silence immediately.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use crate::config::BridgeConfig;
use crate::convert::SampleFormatConverter;
use crate::error::{BridgeError, BridgeResult};
use crate::ring::{RingReader, RingWriter};
use crate::types::{AudioBuffer, BridgeState, Sample, SampleLayout};

use super::StatusHandle;

/// Ring reads per pull before padding with silence (resampler warm-up)
const MAX_PULL_ATTEMPTS: usize = 4;

/// Engine ends of one session's rings plus the converter
pub(crate) struct AdapterSession {
    generation: u64,
    converter: SampleFormatConverter,
    /// Capture ring n ← input port n
    capture: Vec<RingReader>,
    /// Playback ring n → output port n
    playback: Vec<RingWriter>,
    read_scratch: Vec<Vec<Sample>>,
    write_scratch: Vec<Vec<Sample>>,
    /// Converted capture frames not yet handed to the engine, per channel
    fifo: Vec<VecDeque<Sample>>,
}

impl AdapterSession {
    pub(crate) fn new(
        generation: u64,
        converter: SampleFormatConverter,
        capture: Vec<RingReader>,
        playback: Vec<RingWriter>,
    ) -> Self {
        let channels = converter.engine_channels();
        Self {
            generation,
            read_scratch: vec![Vec::new(); capture.len()],
            write_scratch: vec![Vec::new(); playback.len()],
            fifo: vec![VecDeque::new(); channels],
            converter,
            capture,
            playback,
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    fn buffered(&self) -> usize {
        self.fifo.iter().map(VecDeque::len).min().unwrap_or(0)
    }

    fn pull(&mut self, frames: usize, layout: SampleLayout) -> AudioBuffer {
        let mut attempts = 0;
        while self.buffered() < frames && attempts < MAX_PULL_ATTEMPTS {
            attempts += 1;
            let server_frames = self.converter.server_frames_for(frames - self.buffered());
            for (ring, scratch) in self.capture.iter_mut().zip(&mut self.read_scratch) {
                scratch.clear();
                scratch.resize(server_frames, 0.0);
                ring.read(scratch);
            }
            let block = self.converter.from_external(&self.read_scratch);
            for (channel, fifo) in self.fifo.iter_mut().enumerate() {
                fifo.extend(block.channel(channel));
            }
        }

        let mut out = AudioBuffer::silence_with_layout(
            self.fifo.len(),
            frames,
            self.converter.engine_rate(),
            layout,
        );
        for (channel, fifo) in self.fifo.iter_mut().enumerate() {
            for frame in 0..frames {
                out.set_sample(frame, channel, fifo.pop_front().unwrap_or(0.0));
            }
        }
        out
    }

    fn push(&mut self, buffer: &AudioBuffer) -> BridgeResult<usize> {
        self.converter.to_external(buffer, &mut self.write_scratch)?;

        let produced = self.write_scratch.iter().map(Vec::len).max().unwrap_or(0);
        if produced == 0 {
            // Everything staged inside the resampler
            return Ok(buffer.frames());
        }
        let written = self
            .playback
            .iter_mut()
            .zip(&self.write_scratch)
            .map(|(ring, stream)| ring.write(stream))
            .min()
            .unwrap_or(0);

        Ok(if written >= produced {
            buffer.frames()
        } else {
            written * buffer.frames() / produced
        })
    }
}

/// Shared home of the current session
///
/// The engine thread only ever `try_lock`s the session; the control context
/// acquires it with a bounded wait to quiesce the engine side.
pub(crate) struct SessionSlot {
    session: Mutex<Option<AdapterSession>>,
    /// Set when the control context gave up waiting; the engine side drops
    /// the session on its next call
    retired: AtomicBool,
    status: StatusHandle,
    channels: AtomicUsize,
    sample_rate: AtomicU32,
    planar: AtomicBool,
}

type SessionGuard<'a> = MutexGuard<'a, Option<AdapterSession>>;

impl SessionSlot {
    pub(crate) fn new(status: StatusHandle, config: &BridgeConfig) -> Self {
        let slot = Self {
            session: Mutex::new(None),
            retired: AtomicBool::new(false),
            status,
            channels: AtomicUsize::new(0),
            sample_rate: AtomicU32::new(0),
            planar: AtomicBool::new(false),
        };
        slot.set_format(config);
        slot
    }

    /// Format of the silence handed out while no session is usable
    pub(crate) fn set_format(&self, config: &BridgeConfig) {
        self.channels.store(config.channels, Ordering::Relaxed);
        self.sample_rate.store(config.sample_rate, Ordering::Relaxed);
        self.planar
            .store(config.layout == SampleLayout::Planar, Ordering::Relaxed);
    }

    fn format(&self) -> (usize, u32, SampleLayout) {
        let layout = if self.planar.load(Ordering::Relaxed) {
            SampleLayout::Planar
        } else {
            SampleLayout::Interleaved
        };
        (
            self.channels.load(Ordering::Relaxed),
            self.sample_rate.load(Ordering::Relaxed),
            layout,
        )
    }

    /// Control side: wait up to `timeout` for the engine thread to let go
    fn acquire(&self, timeout: Duration) -> Option<SessionGuard<'_>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.session.try_lock() {
                Ok(guard) => return Some(guard),
                Err(TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return None;
                    }
                    std::thread::sleep(Duration::from_micros(50));
                }
            }
        }
    }

    /// Control side: make `session` the live one
    pub(crate) fn install(&self, session: AdapterSession, timeout: Duration) -> BridgeResult<()> {
        let mut guard = self.acquire(timeout).ok_or_else(|| {
            BridgeError::RenegotiationFailed(format!(
                "engine thread did not release the session within {:?}",
                timeout
            ))
        })?;
        *guard = Some(session);
        self.retired.store(false, Ordering::Release);
        Ok(())
    }

    /// Control side: drop the live session, retiring it if the engine
    /// thread can't be quiesced in time
    pub(crate) fn clear(&self, timeout: Duration) -> BridgeResult<()> {
        match self.acquire(timeout) {
            Some(mut guard) => {
                if let Some(session) = guard.take() {
                    log::debug!("Engine side of session {} released", session.generation());
                }
                self.retired.store(false, Ordering::Release);
                Ok(())
            }
            None => {
                self.retired.store(true, Ordering::Release);
                Err(BridgeError::RenegotiationFailed(format!(
                    "engine thread did not release the session within {:?}",
                    timeout
                )))
            }
        }
    }

    /// Engine side: the session, if it is usable right now
    fn try_session(&self) -> Option<SessionGuard<'_>> {
        if !self.status.is_active() {
            return None;
        }
        let mut guard = match self.session.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        if self.retired.swap(false, Ordering::AcqRel) {
            guard.take();
            return None;
        }
        guard.is_some().then_some(guard)
    }
}

/// Engine thread entry point
///
/// Cheap to clone; every clone talks to the same bridge. The rings are
/// single-producer/single-consumer, so pushes (and pulls) should come from
/// one thread at a time.
#[derive(Clone)]
pub struct EngineAudioAdapter {
    slot: Arc<SessionSlot>,
}

impl EngineAudioAdapter {
    pub(crate) fn new(slot: Arc<SessionSlot>) -> Self {
        Self { slot }
    }

    pub fn state(&self) -> BridgeState {
        self.slot.status.state()
    }

    pub fn is_active(&self) -> bool {
        self.slot.status.is_active()
    }

    /// Captured audio in engine format
    ///
    /// Always returns exactly `frames` frames at the engine rate and layout;
    /// silence whenever the bridge is not Active or is being reconfigured.
    pub fn pull_captured(&mut self, frames: usize) -> AudioBuffer {
        let (channels, rate, layout) = self.slot.format();
        match self.slot.try_session() {
            Some(mut guard) => match guard.as_mut() {
                Some(session) => session.pull(frames, layout),
                None => AudioBuffer::silence_with_layout(channels, frames, rate, layout),
            },
            None => AudioBuffer::silence_with_layout(channels, frames, rate, layout),
        }
    }

    /// Queue one rendered engine block for playback
    ///
    /// Returns the number of engine frames that made it into the rings:
    /// fewer than `buffer.frames()` on overrun, 0 when the bridge isn't
    /// Active and the block was discarded. A buffer with the wrong channel
    /// count or rate is rejected with `FormatMismatch`.
    pub fn push_render(&mut self, buffer: &AudioBuffer) -> BridgeResult<usize> {
        let (channels, rate, _) = self.slot.format();
        if buffer.channels() != channels || buffer.sample_rate() != rate {
            return Err(BridgeError::FormatMismatch(format!(
                "engine buffer is {} ch @ {}Hz, bridge is configured for {} ch @ {}Hz",
                buffer.channels(),
                buffer.sample_rate(),
                channels,
                rate
            )));
        }
        match self.slot.try_session() {
            Some(mut guard) => match guard.as_mut() {
                Some(session) => session.push(buffer),
                None => Ok(0),
            },
            None => Ok(0),
        }
    }
}
