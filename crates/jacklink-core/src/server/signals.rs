//! Lock-free notifications from the server threads to the control context
//!
//! The real-time thread and the server's notification thread only ever
//! store into atomics here. The control context drains them with
//! [`ServerSignals::take_events`] from `BridgeLifecycleManager::tick`.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::bridge::StatusHandle;

use super::ServerInfo;

/// Something the control context has to react to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    /// The server is now running at a different rate
    SampleRateChanged(u32),
    /// The server now runs cycles of a different size
    BufferSizeChanged(u32),
    /// The server went away (or kicked the client out)
    Shutdown,
    /// The real-time callback refused a cycle
    CallbackFailed,
}

/// Per-session signal block shared by the server threads and the control context
#[derive(Debug)]
pub struct ServerSignals {
    cycles: AtomicU64,
    last_cycle_frames: AtomicUsize,
    xruns: AtomicU64,
    /// Format the session was built for
    session_rate: u32,
    session_buffer_size: u32,
    /// 0 = no change pending
    pending_sample_rate: AtomicU32,
    pending_buffer_size: AtomicU32,
    shutdown: AtomicBool,
    callback_failed: AtomicBool,
    status: StatusHandle,
}

impl ServerSignals {
    pub fn new(status: StatusHandle, info: ServerInfo) -> Self {
        Self {
            cycles: AtomicU64::new(0),
            last_cycle_frames: AtomicUsize::new(0),
            xruns: AtomicU64::new(0),
            session_rate: info.sample_rate,
            session_buffer_size: info.buffer_size,
            pending_sample_rate: AtomicU32::new(0),
            pending_buffer_size: AtomicU32::new(0),
            shutdown: AtomicBool::new(false),
            callback_failed: AtomicBool::new(false),
            status,
        }
    }

    /// Format the session was built for
    pub fn session_info(&self) -> ServerInfo {
        ServerInfo {
            sample_rate: self.session_rate,
            buffer_size: self.session_buffer_size,
        }
    }

    /// RT: one cycle completed
    #[inline]
    pub fn record_cycle(&self, frames: usize) {
        self.last_cycle_frames.store(frames, Ordering::Relaxed);
        self.cycles.fetch_add(1, Ordering::Release);
    }

    /// Cycles completed in this session
    #[inline]
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Acquire)
    }

    #[inline]
    pub fn last_cycle_frames(&self) -> usize {
        self.last_cycle_frames.load(Ordering::Relaxed)
    }

    /// Server-reported xruns in this session
    #[inline]
    pub fn xruns(&self) -> u64 {
        self.xruns.load(Ordering::Relaxed)
    }

    pub fn notify_xrun(&self) {
        self.xruns.fetch_add(1, Ordering::Relaxed);
    }

    /// Servers report the current rate on activation too; only a real
    /// change is recorded
    pub fn notify_sample_rate(&self, rate: u32) {
        let pending = if rate == self.session_rate { 0 } else { rate };
        self.pending_sample_rate.store(pending, Ordering::Release);
    }

    pub fn notify_buffer_size(&self, frames: u32) {
        let pending = if frames == self.session_buffer_size { 0 } else { frames };
        self.pending_buffer_size.store(pending, Ordering::Release);
    }

    /// Server gone; the host sees Degraded immediately
    pub fn notify_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.status.degrade_if_active();
    }

    /// RT: the callback latched a failure; the host sees Degraded immediately
    #[inline]
    pub fn notify_callback_failed(&self) {
        self.callback_failed.store(true, Ordering::Release);
        self.status.degrade_if_active();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Drain pending events, most severe first
    ///
    /// Shutdown and callback failure are sticky: a dead session keeps
    /// reporting them until it is torn down.
    pub fn take_events(&self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        if self.shutdown.load(Ordering::Acquire) {
            events.push(ServerEvent::Shutdown);
        }
        if self.callback_failed.load(Ordering::Acquire) {
            events.push(ServerEvent::CallbackFailed);
        }
        let rate = self.pending_sample_rate.swap(0, Ordering::AcqRel);
        if rate != 0 {
            events.push(ServerEvent::SampleRateChanged(rate));
        }
        let frames = self.pending_buffer_size.swap(0, Ordering::AcqRel);
        if frames != 0 {
            events.push(ServerEvent::BufferSizeChanged(frames));
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BridgeState;

    fn signals(status: &StatusHandle) -> ServerSignals {
        ServerSignals::new(
            status.clone(),
            ServerInfo {
                sample_rate: 48000,
                buffer_size: 256,
            },
        )
    }

    #[test]
    fn test_unchanged_format_is_not_an_event() {
        let status = StatusHandle::new();
        let signals = signals(&status);
        signals.notify_sample_rate(48000);
        signals.notify_buffer_size(256);
        assert!(signals.take_events().is_empty());

        signals.notify_buffer_size(128);
        assert_eq!(signals.take_events(), vec![ServerEvent::BufferSizeChanged(128)]);
        // Drained
        assert!(signals.take_events().is_empty());
    }

    #[test]
    fn test_change_then_revert_cancels() {
        let status = StatusHandle::new();
        let signals = signals(&status);
        signals.notify_sample_rate(44100);
        signals.notify_sample_rate(48000);
        assert!(signals.take_events().is_empty());
    }

    #[test]
    fn test_shutdown_degrades_status_immediately() {
        let status = StatusHandle::new();
        status.store(BridgeState::Active);
        let signals = signals(&status);

        signals.notify_shutdown();
        assert_eq!(status.state(), BridgeState::Degraded);
        assert_eq!(signals.take_events(), vec![ServerEvent::Shutdown]);
        assert_eq!(signals.take_events(), vec![ServerEvent::Shutdown]);
    }

    #[test]
    fn test_callback_failure_does_not_touch_inactive_status() {
        let status = StatusHandle::new();
        status.store(BridgeState::Connecting);
        let signals = signals(&status);

        signals.notify_callback_failed();
        assert_eq!(status.state(), BridgeState::Connecting);
        assert!(signals.take_events().contains(&ServerEvent::CallbackFailed));
    }

    #[test]
    fn test_cycle_counters() {
        let status = StatusHandle::new();
        let signals = signals(&status);
        signals.record_cycle(256);
        signals.record_cycle(128);
        signals.notify_xrun();
        assert_eq!(signals.cycles(), 2);
        assert_eq!(signals.last_cycle_frames(), 128);
        assert_eq!(signals.xruns(), 1);
    }
}
