//! Bridge lifecycle: connect, renegotiate, reconnect, stop
//!
//! ```text
//! Uninitialized ──start()──► Connecting ──first cycle──► Active
//!                                 │                      │  ▲
//!                                 │ failure     shutdown │  │ renegotiated /
//!                                 ▼             xrun cfg │  │ reconnect()
//!                              Degraded ◄────────────────┘  │
//!                                 └─────────────────────────┘
//!              any ──stop()──► Stopped
//! ```
//!
//! All transitions run on the control context (the host, or a
//! [`super::BridgeMonitor`] thread). Rings are only ever freed after the
//! quiescence protocol:
//!
//! 1. `AudioServer::deactivate` hands back the real-time callback, so the
//!    server thread no longer touches its ring ends
//! 2. the adapter session slot is acquired (bounded by `quiesce_timeout`),
//!    so the engine thread no longer touches its ring ends

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{BridgeConfig, LinkSettings};
use crate::convert::{make_resampler, ChannelMap, SampleFormatConverter};
use crate::error::{BridgeError, BridgeResult};
use crate::ring::{LockFreeRingBuffer, RingStats};
use crate::server::{AudioServer, ServerEvent, ServerInfo, ServerSignals};
use crate::types::BridgeState;

use super::adapter::{AdapterSession, SessionSlot};
use super::stats::{BridgeStats, DirectionStats};
use super::{graph, EngineAudioAdapter, PortDirection, PortSet, RealtimeBridgeCallback, StatusHandle};

/// A published state transition
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub from: BridgeState,
    pub to: BridgeState,
    /// What caused a move to Degraded
    pub error: Option<BridgeError>,
}

type Observer = Box<dyn Fn(&StateChange) + Send>;

/// Control-side view of the running session
struct LiveSession {
    generation: u64,
    info: ServerInfo,
    signals: Arc<ServerSignals>,
    capture_stats: Vec<Arc<RingStats>>,
    playback_stats: Vec<Arc<RingStats>>,
}

impl LiveSession {
    fn stats(&self) -> BridgeStats {
        BridgeStats {
            generation: self.generation,
            cycles: self.signals.cycles(),
            server_xruns: self.signals.xruns(),
            capture: DirectionStats::collect(&self.capture_stats),
            playback: DirectionStats::collect(&self.playback_stats),
        }
    }
}

/// Owns the server client, the ports and the session rings
///
/// One instance per bridge, driven from a single control context. Dropping
/// it stops the bridge.
pub struct BridgeLifecycleManager {
    server: Box<dyn AudioServer>,
    settings: LinkSettings,
    config: Option<BridgeConfig>,
    /// Authoritative state (the status cell may run ahead to Degraded)
    state: BridgeState,
    status: StatusHandle,
    slot: Arc<SessionSlot>,
    ports: PortSet,
    session: Option<LiveSession>,
    generation: u64,
    /// Counters of finished sessions
    totals: BridgeStats,
    client_open: bool,
    last_error: Option<BridgeError>,
    observer: Option<Observer>,
    last_attempt: Option<Instant>,
    known_clients: BTreeSet<String>,
}

impl BridgeLifecycleManager {
    pub fn new(server: Box<dyn AudioServer>, settings: LinkSettings) -> Self {
        let settings = settings.sanitized();
        let status = StatusHandle::new();
        let slot = Arc::new(SessionSlot::new(status.clone(), &BridgeConfig::default()));
        let ports = PortSet::new(&settings.port_prefix, settings.input_ports, settings.output_ports);

        log::info!(
            "Bridge created ({} backend, {} in / {} out)",
            server.backend_name(),
            settings.input_ports,
            settings.output_ports
        );

        Self {
            server,
            settings,
            config: None,
            state: BridgeState::Uninitialized,
            status,
            slot,
            ports,
            session: None,
            generation: 0,
            totals: BridgeStats::default(),
            client_open: false,
            last_error: None,
            observer: None,
            last_attempt: None,
            known_clients: BTreeSet::new(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Host API
    // ─────────────────────────────────────────────────────────────────────

    /// Set the engine format
    ///
    /// Unsupported channel/rate combinations fail here with
    /// `FormatMismatch`, before any connection attempt. While Active this
    /// renegotiates (see [`Self::reconfigure`]).
    pub fn configure(&mut self, config: BridgeConfig) -> BridgeResult<()> {
        if self.state == BridgeState::Active {
            return self.reconfigure(config);
        }
        self.check_config(&config)?;
        self.store_config(config);
        Ok(())
    }

    /// Change the engine format, renegotiating a running session
    pub fn reconfigure(&mut self, config: BridgeConfig) -> BridgeResult<()> {
        self.check_config(&config)?;
        if self.state != BridgeState::Active {
            self.store_config(config);
            return Ok(());
        }
        if self.config == Some(config) {
            return Ok(());
        }
        self.renegotiate("engine format changed", Some(config))
    }

    /// Connect to the server and start moving audio
    ///
    /// Failures leave the bridge Degraded (silence) and are also kept as
    /// [`Self::last_error`].
    pub fn start(&mut self) -> BridgeResult<()> {
        match self.state {
            BridgeState::Stopped => Err(BridgeError::Stopped),
            BridgeState::Active => Ok(()),
            BridgeState::Degraded => self.reconnect(),
            BridgeState::Connecting => Err(BridgeError::InvalidTransition {
                from: BridgeState::Connecting,
                to: BridgeState::Connecting,
            }),
            BridgeState::Uninitialized => {
                if self.config.is_none() {
                    return Err(BridgeError::NotConfigured);
                }
                self.transition(BridgeState::Connecting, None)?;
                match self.connect() {
                    Ok(()) => self.transition(BridgeState::Active, None),
                    Err(e) => Err(self.fail(e)),
                }
            }
        }
    }

    /// Leave Degraded by opening a fresh client and session
    pub fn reconnect(&mut self) -> BridgeResult<()> {
        match self.state {
            BridgeState::Stopped => Err(BridgeError::Stopped),
            BridgeState::Uninitialized => self.start(),
            BridgeState::Active => Ok(()),
            BridgeState::Connecting => Err(BridgeError::InvalidTransition {
                from: BridgeState::Connecting,
                to: BridgeState::Active,
            }),
            BridgeState::Degraded => {
                if self.config.is_none() {
                    return Err(BridgeError::NotConfigured);
                }
                self.last_attempt = Some(Instant::now());
                if let Err(e) = self.teardown_session() {
                    log::warn!("Previous session not fully released: {}", e);
                }
                self.close_client();

                match self.connect() {
                    Ok(()) => {
                        self.last_error = None;
                        log::info!("Bridge reconnected");
                        self.transition(BridgeState::Active, None)
                    }
                    Err(e) => Err(self.fail(e)),
                }
            }
        }
    }

    /// Tear everything down; terminal and idempotent
    pub fn stop(&mut self) {
        if self.state == BridgeState::Stopped {
            return;
        }
        if let Err(e) = self.teardown_session() {
            log::warn!("Session not fully released on stop: {}", e);
        }
        self.close_client();
        if let Err(e) = self.transition(BridgeState::Stopped, None) {
            log::error!("Failed to stop bridge: {}", e);
        }
        let stats = self.stats();
        log::info!(
            "Bridge stopped after {} sessions ({} cycles, {} capture / {} playback xruns)",
            stats.generation,
            stats.cycles,
            stats.capture.xruns(),
            stats.playback.xruns()
        );
    }

    /// Enable or disable the bridge at runtime
    ///
    /// Disabling an active bridge degrades it (silence); enabling a
    /// degraded one reconnects.
    pub fn set_enabled(&mut self, enabled: bool) -> BridgeResult<()> {
        if self.settings.enabled == enabled {
            return Ok(());
        }
        self.settings.enabled = enabled;
        log::info!("Bridge {}", if enabled { "enabled" } else { "disabled" });

        match (enabled, self.state) {
            (false, BridgeState::Active) => {
                self.fail(BridgeError::CapabilityUnavailable(
                    "bridge disabled in settings".to_string(),
                ));
                Ok(())
            }
            (true, BridgeState::Degraded) => self.reconnect(),
            _ => Ok(()),
        }
    }

    /// Periodic control work
    ///
    /// Handles server notifications (shutdown, callback failure, format
    /// changes), auto-reconnect from Degraded and auto-connect of new
    /// clients. Call it regularly from the control context, or let a
    /// [`super::BridgeMonitor`] do it.
    pub fn tick(&mut self) -> BridgeState {
        match self.state {
            BridgeState::Active => self.process_events(),
            BridgeState::Degraded => self.maybe_reconnect(),
            _ => {}
        }
        if self.state == BridgeState::Active && self.settings.auto_connect {
            self.auto_connect_new_clients();
        }
        self.state
    }

    // ─────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────

    /// Whether a server is reachable and the bridge is enabled
    pub fn is_available(&self) -> bool {
        self.settings.enabled && self.server.is_available()
    }

    /// Published state (may show Degraded before the next `tick`)
    pub fn current_state(&self) -> BridgeState {
        self.status.state()
    }

    pub fn status_handle(&self) -> StatusHandle {
        self.status.clone()
    }

    /// Handle for the engine audio thread
    pub fn adapter(&self) -> EngineAudioAdapter {
        EngineAudioAdapter::new(self.slot.clone())
    }

    pub fn stats(&self) -> BridgeStats {
        let mut stats = self.totals;
        if let Some(session) = &self.session {
            stats.absorb(&session.stats());
        }
        stats.generation = self.generation;
        stats
    }

    pub fn last_error(&self) -> Option<&BridgeError> {
        self.last_error.as_ref()
    }

    /// Called on every state transition, on the control context
    pub fn set_observer<F>(&mut self, observer: F)
    where
        F: Fn(&StateChange) + Send + 'static,
    {
        self.observer = Some(Box::new(observer));
    }

    pub fn config(&self) -> Option<BridgeConfig> {
        self.config
    }

    pub fn settings(&self) -> &LinkSettings {
        &self.settings
    }

    /// Server format of the running session
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.session.as_ref().map(|s| s.info)
    }

    pub fn ports(&self) -> &PortSet {
        &self.ports
    }

    pub fn backend_name(&self) -> &'static str {
        self.server.backend_name()
    }

    /// Actual client name on the server
    pub fn client_name(&self) -> Option<String> {
        self.server.client_name()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Graph
    // ─────────────────────────────────────────────────────────────────────

    pub fn list_ports(&self, direction: Option<PortDirection>) -> BridgeResult<Vec<String>> {
        self.server.list_ports(direction)
    }

    pub fn list_clients(&self) -> BridgeResult<Vec<String>> {
        graph::list_clients(self.server.as_ref())
    }

    pub fn connect_ports(&self, source: &str, destination: &str) -> BridgeResult<()> {
        self.server.connect_ports(source, destination)?;
        log::info!("Connected {} -> {}", source, destination);
        Ok(())
    }

    pub fn disconnect_ports(&self, source: &str, destination: &str) -> BridgeResult<()> {
        self.server.disconnect_ports(source, destination)?;
        log::info!("Disconnected {} -> {}", source, destination);
        Ok(())
    }

    /// Connect every other client's outputs to the bridge inputs
    ///
    /// Returns the number of new connections.
    pub fn auto_connect_clients(&mut self) -> BridgeResult<usize> {
        let own = self
            .server
            .client_name()
            .filter(|_| self.ports.is_registered())
            .ok_or_else(|| BridgeError::Server("bridge has no registered ports".to_string()))?;
        let inputs = self.ports.input_names();

        let mut made = 0;
        for client in graph::external_clients(self.server.as_ref(), &own)? {
            made += graph::auto_connect_client(self.server.as_ref(), &client, &inputs)?;
            self.known_clients.insert(client);
        }
        Ok(made)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────

    fn check_config(&self, config: &BridgeConfig) -> BridgeResult<()> {
        if self.state == BridgeState::Stopped {
            return Err(BridgeError::Stopped);
        }
        config.validate()?;
        let policy = self.settings.channel_mapping;
        ChannelMap::resolve(config.channels, self.settings.output_ports, policy)?;
        ChannelMap::resolve(self.settings.input_ports, config.channels, policy)?;
        if let Some(info) = self.server.info() {
            make_resampler(self.settings.resampler, config.sample_rate, info.sample_rate, 1)?;
        }
        Ok(())
    }

    fn store_config(&mut self, config: BridgeConfig) {
        log::info!(
            "Engine format: {} ch @ {}Hz, {} frame blocks, {:?}, latency {} frames",
            config.channels,
            config.sample_rate,
            config.buffer_size,
            config.layout,
            config.latency_frames
        );
        self.slot.set_format(&config);
        self.config = Some(config);
    }

    fn transition(&mut self, to: BridgeState, error: Option<BridgeError>) -> BridgeResult<()> {
        let from = self.state;
        if from == to {
            self.status.store(to);
            return Ok(());
        }
        if !from.can_transition_to(to) {
            return Err(BridgeError::InvalidTransition { from, to });
        }

        match &error {
            Some(e) => log::warn!("Bridge {} -> {}: {}", from, to, e),
            None => log::info!("Bridge {} -> {}", from, to),
        }
        self.state = to;
        self.status.store(to);
        if let Some(observer) = &self.observer {
            observer(&StateChange { from, to, error });
        }
        Ok(())
    }

    /// Record `error`, release everything and go Degraded
    fn fail(&mut self, error: BridgeError) -> BridgeError {
        if let Err(e) = self.teardown_session() {
            log::warn!("Session not fully released after failure: {}", e);
        }
        self.close_client();
        self.last_error = Some(error.clone());
        self.last_attempt = Some(Instant::now());
        if let Err(e) = self.transition(BridgeState::Degraded, Some(error.clone())) {
            log::error!("Failed to degrade bridge: {}", e);
        }
        error
    }

    /// Open the client and build a session
    ///
    /// An unreachable server surfaces from `open` as `CapabilityUnavailable`.
    fn connect(&mut self) -> BridgeResult<()> {
        if !self.settings.enabled {
            return Err(BridgeError::CapabilityUnavailable(
                "bridge disabled in settings".to_string(),
            ));
        }
        let info = self.server.open(&self.settings.client_name)?;
        self.client_open = true;
        self.build_session(info)
    }

    /// Converter, ports, rings, activation and the first cycle
    fn build_session(&mut self, info: ServerInfo) -> BridgeResult<()> {
        let config = self.config.ok_or(BridgeError::NotConfigured)?;
        let converter = SampleFormatConverter::new(
            &config,
            info.sample_rate,
            self.ports.input_count(),
            self.ports.output_count(),
            self.settings.channel_mapping,
            self.settings.resampler,
        )?;
        self.ports.register_all(self.server.as_mut(), info)?;

        // Settings carry the embedder's latency floor
        let latency = config.latency_frames.max(self.settings.latency_frames as usize);
        let config = config.with_latency(latency);
        let cycle = info.buffer_size as usize;
        let capacity = config.ring_capacity(cycle, info.sample_rate);
        let preroll = config.preroll_frames(cycle, info.sample_rate);

        let (mut capture_writers, mut capture_readers) = (Vec::new(), Vec::new());
        for _ in 0..self.ports.input_count() {
            let (writer, reader) = LockFreeRingBuffer::with_capacity(capacity);
            capture_writers.push(writer);
            capture_readers.push(reader);
        }
        let (mut playback_writers, mut playback_readers) = (Vec::new(), Vec::new());
        for _ in 0..self.ports.output_count() {
            let (mut writer, reader) = LockFreeRingBuffer::with_capacity(capacity);
            writer.write_silence(preroll);
            playback_writers.push(writer);
            playback_readers.push(reader);
        }

        self.generation += 1;
        let generation = self.generation;
        let signals = Arc::new(ServerSignals::new(self.status.clone(), info));
        let capture_stats = capture_writers.iter().map(|w| w.stats().clone()).collect();
        let playback_stats = playback_readers.iter().map(|r| r.stats().clone()).collect();

        self.slot.install(
            AdapterSession::new(generation, converter, capture_readers, playback_writers),
            self.settings.quiesce_timeout(),
        )?;
        self.session = Some(LiveSession {
            generation,
            info,
            signals: signals.clone(),
            capture_stats,
            playback_stats,
        });

        let callback = RealtimeBridgeCallback::new(capture_writers, playback_readers, signals.clone());
        self.server.activate(callback, signals.clone())?;
        self.wait_first_cycle(&signals)?;
        self.ports.mark_active();
        // Fresh ports have no connections yet
        self.known_clients.clear();

        log::info!(
            "Session {} running: server {}Hz / {} frames, ring {} frames, pre-roll {} frames",
            generation,
            info.sample_rate,
            info.buffer_size,
            capacity,
            preroll
        );
        Ok(())
    }

    fn wait_first_cycle(&self, signals: &ServerSignals) -> BridgeResult<()> {
        let timeout = self.settings.startup_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            if signals.cycles() > 0 {
                return Ok(());
            }
            if signals.is_shutdown() {
                return Err(BridgeError::ConnectionFailed(
                    "server shut down during startup".to_string(),
                ));
            }
            if Instant::now() >= deadline {
                return Err(BridgeError::CallbackTimeout(timeout));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Quiesce both data paths and release the session's rings and ports
    fn teardown_session(&mut self) -> BridgeResult<()> {
        if let Some(callback) = self.server.deactivate() {
            drop(callback);
        }
        let released = self.slot.clear(self.settings.quiesce_timeout());

        if let Some(session) = self.session.take() {
            let stats = session.stats();
            log::debug!(
                "Session {} ended after {} cycles",
                session.generation,
                stats.cycles
            );
            self.totals.absorb(&stats);
        }
        if self.ports.is_registered() {
            self.ports.unregister_all(self.server.as_mut());
        }
        released
    }

    fn close_client(&mut self) {
        if self.client_open {
            self.server.close();
            self.client_open = false;
        }
    }

    fn renegotiate(&mut self, reason: &str, config: Option<BridgeConfig>) -> BridgeResult<()> {
        log::info!("Renegotiating session: {}", reason);
        self.transition(BridgeState::Degraded, None)?;
        if let Some(config) = config {
            self.store_config(config);
        }

        let result = self.teardown_session().and_then(|()| {
            let info = self
                .server
                .info()
                .ok_or_else(|| BridgeError::ConnectionFailed("server client closed".to_string()))?;
            self.build_session(info)
        });

        match result {
            Ok(()) => self.transition(BridgeState::Active, None),
            Err(BridgeError::RenegotiationFailed(reason)) => {
                Err(self.fail(BridgeError::RenegotiationFailed(reason)))
            }
            Err(e) => Err(self.fail(BridgeError::RenegotiationFailed(e.to_string()))),
        }
    }

    fn process_events(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        let mut reason = None;
        for event in session.signals.take_events() {
            match event {
                ServerEvent::Shutdown => {
                    self.fail(BridgeError::ConnectionFailed("audio server shut down".to_string()));
                    return;
                }
                ServerEvent::CallbackFailed => {
                    reason.get_or_insert_with(|| "real-time callback failed".to_string());
                }
                ServerEvent::SampleRateChanged(rate) => {
                    reason.get_or_insert_with(|| format!("server sample rate changed to {}Hz", rate));
                }
                ServerEvent::BufferSizeChanged(frames) => {
                    reason.get_or_insert_with(|| format!("server buffer size changed to {}", frames));
                }
            }
        }
        if let Some(reason) = reason {
            if let Err(e) = self.renegotiate(&reason, None) {
                log::warn!("Renegotiation failed: {}", e);
            }
        }
    }

    fn maybe_reconnect(&mut self) {
        if !self.settings.auto_reconnect || !self.settings.enabled || self.config.is_none() {
            return;
        }
        if self
            .last_attempt
            .is_some_and(|at| at.elapsed() < self.settings.reconnect_interval())
        {
            return;
        }
        if let Err(e) = self.reconnect() {
            log::debug!("Reconnect attempt failed: {}", e);
        }
    }

    fn auto_connect_new_clients(&mut self) {
        let Some(own) = self.server.client_name() else {
            return;
        };
        let clients = match graph::external_clients(self.server.as_ref(), &own) {
            Ok(clients) => clients,
            Err(e) => {
                log::debug!("Client scan failed: {}", e);
                return;
            }
        };

        let inputs = self.ports.input_names();
        for client in &clients {
            if self.known_clients.contains(client) {
                continue;
            }
            log::info!("Client appeared: {}", client);
            if let Err(e) = graph::auto_connect_client(self.server.as_ref(), client, &inputs) {
                log::warn!("Auto-connect to {} failed: {}", client, e);
            }
        }
        self.known_clients = clients.into_iter().collect();
    }
}

impl Drop for BridgeLifecycleManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::ChannelMapPolicy;
    use crate::server::{SimulatedServer, SimulatedServerHandle, UnavailableServer};
    use crate::types::{AudioBuffer, Sample};
    use std::sync::Mutex;

    fn settings() -> LinkSettings {
        LinkSettings {
            startup_timeout_ms: 200,
            quiesce_timeout_ms: 100,
            reconnect_interval_ms: 10,
            // Engine configs set the latency in these tests
            latency_frames: 0,
            ..Default::default()
        }
    }

    fn bridge_with(settings: LinkSettings, rate: u32, period: u32) -> (BridgeLifecycleManager, SimulatedServerHandle) {
        let server = SimulatedServer::new(rate, period);
        let handle = server.handle();
        (BridgeLifecycleManager::new(Box::new(server), settings), handle)
    }

    fn started(rate: u32, period: u32, config: BridgeConfig) -> (BridgeLifecycleManager, SimulatedServerHandle) {
        let (mut bridge, handle) = bridge_with(settings(), rate, period);
        bridge.configure(config).unwrap();
        bridge.start().unwrap();
        (bridge, handle)
    }

    fn record_states(bridge: &mut BridgeLifecycleManager) -> Arc<Mutex<Vec<BridgeState>>> {
        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = states.clone();
        bridge.set_observer(move |change| sink.lock().unwrap().push(change.to));
        states
    }

    #[test]
    fn test_thousand_matched_cycles_without_xruns() {
        let (mut bridge, handle) = started(48000, 256, BridgeConfig::new(48000, 256, 2));
        assert_eq!(bridge.current_state(), BridgeState::Active);
        let mut adapter = bridge.adapter();

        let block = AudioBuffer::silence(2, 256, 48000);
        for _ in 0..1000 {
            assert_eq!(adapter.push_render(&block).unwrap(), 256);
            assert_eq!(handle.step(1), 1);
            let captured = adapter.pull_captured(256);
            assert_eq!(captured.frames(), 256);
            assert_eq!(bridge.tick(), BridgeState::Active);
        }

        let stats = bridge.stats();
        assert_eq!(stats.cycles, 1001);
        assert_eq!(stats.capture.overruns, 0);
        assert_eq!(stats.capture.underruns, 0);
        assert_eq!(stats.playback.overruns, 0);
        assert_eq!(stats.playback.underruns, 0);
    }

    #[test]
    fn test_audio_passes_through_both_directions() {
        let (bridge, handle) = started(48000, 64, BridgeConfig::new(48000, 64, 2));
        let mut adapter = bridge.adapter();
        // Priming cycle output is the silent pre-roll
        assert!(handle.take_output(0).iter().all(|&s| s == 0.0));

        let left: Vec<Sample> = (0..64).map(|i| i as Sample / 64.0).collect();
        let right: Vec<Sample> = left.iter().map(|s| -s).collect();
        let block = AudioBuffer::from_planar(&[left.clone(), right.clone()], 48000);
        let block = block.into_layout(crate::types::SampleLayout::Interleaved);
        adapter.push_render(&block).unwrap();

        handle.feed_input(1, &[0.75; 64]);
        handle.step(1);
        assert_eq!(handle.take_output(0), left);
        assert_eq!(handle.take_output(1), right);

        // Priming capture first, then the fed block
        assert!(adapter.pull_captured(64).is_silent());
        let captured = adapter.pull_captured(64);
        assert!(captured.channel(0).all(|s| s == 0.0));
        assert!(captured.channel(1).all(|s| s == 0.75));
    }

    #[test]
    fn test_server_shutdown_degrades_within_one_cycle() {
        let (mut bridge, handle) = started(48000, 256, BridgeConfig::new(48000, 256, 2));
        let mut adapter = bridge.adapter();
        let status = bridge.status_handle();

        handle.shutdown_server();
        // Visible before the control context runs
        assert_eq!(status.state(), BridgeState::Degraded);
        assert!(adapter.pull_captured(256).is_silent());
        assert_eq!(adapter.push_render(&AudioBuffer::silence(2, 256, 48000)).unwrap(), 0);

        bridge.tick();
        assert_eq!(bridge.current_state(), BridgeState::Degraded);
        assert!(matches!(bridge.last_error(), Some(BridgeError::ConnectionFailed(_))));
        assert_eq!(adapter.pull_captured(128).frames(), 128);

        // Server still down: reconnect keeps failing, bridge stays degraded
        assert!(bridge.reconnect().is_err());
        assert_eq!(bridge.current_state(), BridgeState::Degraded);

        handle.restart();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(bridge.tick(), BridgeState::Active);
        assert_eq!(bridge.stats().generation, 2);
        assert!(bridge.last_error().is_none());
    }

    #[test]
    fn test_buffer_size_change_renegotiates() {
        let (mut bridge, handle) = started(48000, 256, BridgeConfig::new(48000, 256, 2));
        let states = record_states(&mut bridge);
        let mut adapter = bridge.adapter();
        assert_eq!(bridge.stats().generation, 1);

        handle.set_buffer_size(128);
        assert_eq!(bridge.tick(), BridgeState::Active);
        assert_eq!(*states.lock().unwrap(), vec![BridgeState::Degraded, BridgeState::Active]);
        assert_eq!(bridge.stats().generation, 2);
        assert_eq!(bridge.server_info().map(|i| i.buffer_size), Some(128));
        assert_eq!(bridge.ports().contract().map(|i| i.buffer_size), Some(128));

        let block = AudioBuffer::silence(2, 256, 48000);
        for _ in 0..50 {
            assert_eq!(adapter.push_render(&block).unwrap(), 256);
            assert_eq!(handle.step(2), 2);
            assert_eq!(adapter.pull_captured(256).frames(), 256);
        }
        let stats = bridge.stats();
        assert_eq!(stats.capture.xruns() + stats.playback.xruns(), 0);
    }

    #[test]
    fn test_sample_rate_change_renegotiates_with_resampler() {
        let (mut bridge, handle) = started(48000, 256, BridgeConfig::new(48000, 256, 2));
        handle.set_sample_rate(44100);
        assert_eq!(bridge.tick(), BridgeState::Active);
        assert_eq!(bridge.server_info().map(|i| i.sample_rate), Some(44100));

        let mut adapter = bridge.adapter();
        handle.step(4);
        let captured = adapter.pull_captured(256);
        assert_eq!(captured.sample_rate(), 48000);
        assert_eq!(captured.frames(), 256);
    }

    #[test]
    fn test_oversized_cycle_fails_callback_and_recovers() {
        let (mut bridge, handle) = started(48000, 64, BridgeConfig::new(48000, 64, 2));
        // Ring holds 256 frames; a silent jump to 4096 overflows it
        handle.step_frames(4096);
        assert_eq!(bridge.current_state(), BridgeState::Degraded);
        assert_eq!(bridge.tick(), BridgeState::Active);
        assert_eq!(bridge.stats().generation, 2);
    }

    #[test]
    fn test_large_rate_ratio_keeps_pace_without_overruns() {
        let (mut bridge, handle) = started(96000, 256, BridgeConfig::new(22050, 256, 2));
        let mut adapter = bridge.adapter();

        let block = AudioBuffer::silence(2, 256, 22050);
        // Server frames owed to the engine, kept in units of 1/22050 s
        let mut owed: u64 = 0;
        for _ in 0..200 {
            assert_eq!(adapter.push_render(&block).unwrap(), 256);
            owed += 256 * 96000;
            while owed >= 256 * 22050 {
                assert_eq!(handle.step(1), 1);
                owed -= 256 * 22050;
            }
            assert_eq!(adapter.pull_captured(256).frames(), 256);
            assert_eq!(bridge.tick(), BridgeState::Active);
        }

        let stats = bridge.stats();
        assert_eq!(stats.playback.overruns, 0);
        assert_eq!(stats.playback.underruns, 0);
        assert_eq!(stats.capture.overruns, 0);
        assert_eq!(stats.generation, 1);
    }

    #[test]
    fn test_settings_latency_extends_preroll() {
        let (mut bridge, handle) = bridge_with(LinkSettings { latency_frames: 512, ..settings() }, 48000, 64);
        bridge.configure(BridgeConfig::new(48000, 64, 2)).unwrap();
        bridge.start().unwrap();
        let mut adapter = bridge.adapter();
        assert!(handle.take_output(0).iter().all(|&s| s == 0.0));

        let block = AudioBuffer::from_planar(&[vec![0.5; 64], vec![0.5; 64]], 48000)
            .into_layout(crate::types::SampleLayout::Interleaved);
        // 512 frames of silence: the priming cycle plus seven more
        for _ in 0..7 {
            adapter.push_render(&block).unwrap();
            handle.step(1);
            assert!(handle.take_output(0).iter().all(|&s| s == 0.0));
        }
        adapter.push_render(&block).unwrap();
        handle.step(1);
        assert!(handle.take_output(0).iter().all(|&s| s == 0.5));

        let stats = bridge.stats();
        assert_eq!(stats.playback.underruns, 0);
        assert_eq!(stats.playback.overruns, 0);
    }

    #[test]
    fn test_connect_opens_without_availability_check() {
        let (mut bridge, handle) = bridge_with(settings(), 48000, 256);
        bridge.configure(BridgeConfig::new(48000, 256, 2)).unwrap();
        bridge.start().unwrap();

        handle.shutdown_server();
        bridge.tick();
        // Unreachable server reported by the open itself
        assert!(matches!(bridge.reconnect(), Err(BridgeError::CapabilityUnavailable(_))));

        handle.restart();
        bridge.reconnect().unwrap();
        assert_eq!(bridge.current_state(), BridgeState::Active);
        assert_eq!(handle.availability_checks(), 0);
    }

    #[test]
    fn test_start_requires_configure() {
        let (mut bridge, _handle) = bridge_with(settings(), 48000, 256);
        assert_eq!(bridge.start(), Err(BridgeError::NotConfigured));
        assert_eq!(bridge.current_state(), BridgeState::Uninitialized);
    }

    #[test]
    fn test_unavailable_server_degrades() {
        let mut bridge = BridgeLifecycleManager::new(Box::new(UnavailableServer::new("not built")), settings());
        bridge.configure(BridgeConfig::new(48000, 256, 2)).unwrap();
        let states = record_states(&mut bridge);

        assert!(!bridge.is_available());
        assert!(matches!(bridge.start(), Err(BridgeError::CapabilityUnavailable(_))));
        assert_eq!(bridge.current_state(), BridgeState::Degraded);
        assert_eq!(*states.lock().unwrap(), vec![BridgeState::Connecting, BridgeState::Degraded]);

        let mut adapter = bridge.adapter();
        let silence = adapter.pull_captured(256);
        assert!(silence.is_silent());
        assert_eq!(silence.channels(), 2);
    }

    #[test]
    fn test_disabled_bridge_degrades_then_enables() {
        let (mut bridge, _handle) = bridge_with(LinkSettings { enabled: false, ..settings() }, 48000, 256);
        bridge.configure(BridgeConfig::new(48000, 256, 2)).unwrap();
        assert!(matches!(bridge.start(), Err(BridgeError::CapabilityUnavailable(_))));
        // Auto-reconnect never fires while disabled
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(bridge.tick(), BridgeState::Degraded);

        bridge.set_enabled(true).unwrap();
        assert_eq!(bridge.current_state(), BridgeState::Active);
        bridge.set_enabled(false).unwrap();
        assert_eq!(bridge.current_state(), BridgeState::Degraded);
    }

    #[test]
    fn test_connection_and_registration_failures() {
        let (mut bridge, handle) = bridge_with(settings(), 48000, 256);
        bridge.configure(BridgeConfig::new(48000, 256, 2)).unwrap();

        handle.fail_open(true);
        assert!(matches!(bridge.start(), Err(BridgeError::ConnectionFailed(_))));
        assert_eq!(bridge.current_state(), BridgeState::Degraded);

        handle.fail_open(false);
        handle.fail_port_registration(true);
        assert!(matches!(bridge.reconnect(), Err(BridgeError::PortRegistrationFailed { .. })));
        assert!(handle.client_name().is_none());

        handle.fail_port_registration(false);
        bridge.reconnect().unwrap();
        assert_eq!(bridge.current_state(), BridgeState::Active);
    }

    #[test]
    fn test_first_cycle_timeout() {
        let (mut bridge, handle) = bridge_with(LinkSettings { startup_timeout_ms: 30, ..settings() }, 48000, 256);
        bridge.configure(BridgeConfig::new(48000, 256, 2)).unwrap();
        handle.stall(true);

        assert!(matches!(bridge.start(), Err(BridgeError::CallbackTimeout(_))));
        assert_eq!(bridge.current_state(), BridgeState::Degraded);
        // Released everything
        assert!(handle.client_name().is_none());
    }

    #[test]
    fn test_strict_mapping_rejected_at_configure() {
        let strict = LinkSettings {
            channel_mapping: ChannelMapPolicy::Strict,
            ..settings()
        };
        let (mut bridge, _handle) = bridge_with(strict, 48000, 256);
        assert!(matches!(
            bridge.configure(BridgeConfig::new(48000, 256, 1)),
            Err(BridgeError::FormatMismatch(_))
        ));
        assert_eq!(bridge.current_state(), BridgeState::Uninitialized);
        assert!(bridge.config().is_none());
    }

    #[test]
    fn test_reconfigure_while_active() {
        let (mut bridge, _handle) = started(48000, 256, BridgeConfig::new(48000, 256, 2));
        bridge.reconfigure(BridgeConfig::new(44100, 512, 1)).unwrap();
        assert_eq!(bridge.current_state(), BridgeState::Active);
        assert_eq!(bridge.stats().generation, 2);

        let mut adapter = bridge.adapter();
        let captured = adapter.pull_captured(512);
        assert_eq!(captured.channels(), 1);
        assert_eq!(captured.sample_rate(), 44100);
        assert!(adapter.push_render(&AudioBuffer::silence(2, 512, 48000)).is_err());
    }

    #[test]
    fn test_stop_is_idempotent_and_terminal() {
        let (mut bridge, handle) = started(48000, 256, BridgeConfig::new(48000, 256, 2));
        let mut adapter = bridge.adapter();

        bridge.stop();
        bridge.stop();
        assert_eq!(bridge.current_state(), BridgeState::Stopped);
        assert!(handle.client_name().is_none());
        assert_eq!(handle.step(1), 0);
        assert!(adapter.pull_captured(64).is_silent());
        assert_eq!(bridge.start(), Err(BridgeError::Stopped));
        assert_eq!(bridge.reconnect(), Err(BridgeError::Stopped));
    }

    #[test]
    fn test_stop_from_uninitialized() {
        let (mut bridge, _handle) = bridge_with(settings(), 48000, 256);
        bridge.stop();
        assert_eq!(bridge.current_state(), BridgeState::Stopped);
    }

    #[test]
    fn test_auto_connect_on_tick() {
        let (mut bridge, handle) = bridge_with(LinkSettings { auto_connect: true, ..settings() }, 48000, 256);
        handle.add_external_client("system", 2, 2);
        bridge.configure(BridgeConfig::new(48000, 256, 2)).unwrap();
        bridge.start().unwrap();

        handle.add_external_client("synth", 0, 2);
        bridge.tick();
        assert!(handle.is_connected("synth:out_1", "jacklink:bridge_in_1"));
        assert!(handle.is_connected("synth:out_2", "jacklink:bridge_in_2"));
        assert!(!handle.is_connected("system:out_1", "jacklink:bridge_in_1"));

        // A manual disconnect sticks for a known client
        bridge.disconnect_ports("synth:out_1", "jacklink:bridge_in_1").unwrap();
        bridge.tick();
        assert!(!handle.is_connected("synth:out_1", "jacklink:bridge_in_1"));

        // Explicit request reconnects everything
        assert_eq!(bridge.auto_connect_clients().unwrap(), 1);
        assert_eq!(bridge.list_clients().unwrap(), vec!["jacklink", "synth", "system"]);
    }
}
