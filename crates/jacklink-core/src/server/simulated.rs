//! In-process audio server
//!
//! Behaves like a JACK server from the bridge's point of view: clients,
//! ports, a connection graph, a real-time cycle and notifications. The
//! clock is either stepped by the caller (deterministic tests) or driven by
//! a background thread at the configured period (host `--simulate` mode).
//!
//! Internal state sits behind a mutex that the simulated real-time thread
//! takes for each cycle. That lock belongs to the "server" and is never
//! shared with the engine thread.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::bridge::{CycleBuffers, PortDirection, RealtimeBridgeCallback};
use crate::error::{BridgeError, BridgeResult};
use crate::types::{Sample, DEFAULT_BUFFER_SIZE, DEFAULT_SAMPLE_RATE, MAX_BUFFER_SIZE};

use super::{AudioServer, ServerInfo, ServerSignals};

/// Recorded output kept per port (oldest samples dropped beyond this)
const MAX_OUTPUT_LOG: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Clock {
    Stepped,
    FreeRunning,
}

struct SimPort {
    name: String,
    direction: PortDirection,
}

struct ActiveSession {
    callback: RealtimeBridgeCallback,
    signals: Arc<ServerSignals>,
    inputs: Vec<Vec<Sample>>,
    outputs: Vec<Vec<Sample>>,
}

#[derive(Default)]
struct Faults {
    fail_open: bool,
    fail_register: bool,
    stalled: bool,
}

struct SimState {
    running: bool,
    sample_rate: u32,
    buffer_size: u32,
    client: Option<String>,
    own_inputs: Vec<String>,
    own_outputs: Vec<String>,
    external: Vec<SimPort>,
    connections: BTreeSet<(String, String)>,
    active: Option<ActiveSession>,
    input_feed: Vec<VecDeque<Sample>>,
    output_log: Vec<Vec<Sample>>,
    faults: Faults,
    total_cycles: u64,
    availability_checks: u64,
}

impl SimState {
    fn info(&self) -> ServerInfo {
        ServerInfo {
            sample_rate: self.sample_rate,
            buffer_size: self.buffer_size,
        }
    }

    fn port_direction(&self, name: &str) -> Option<PortDirection> {
        if self.own_inputs.iter().any(|p| p == name) {
            return Some(PortDirection::Input);
        }
        if self.own_outputs.iter().any(|p| p == name) {
            return Some(PortDirection::Output);
        }
        self.external
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.direction)
    }

    fn drop_connections_of(&mut self, client: &str) {
        let prefix = format!("{}:", client);
        self.connections
            .retain(|(src, dst)| !src.starts_with(&prefix) && !dst.starts_with(&prefix));
    }

    /// Run up to `count` cycles of `frames` each
    fn run_cycles(&mut self, count: u64, frames: Option<usize>) -> u64 {
        let mut ran = 0;
        for _ in 0..count {
            if !self.running || self.faults.stalled {
                break;
            }
            let frames = frames.unwrap_or(self.buffer_size as usize);
            let Some(active) = self.active.as_mut() else {
                break;
            };

            for (port, buffer) in active.inputs.iter_mut().enumerate() {
                buffer.clear();
                match self.input_feed.get_mut(port) {
                    Some(feed) => buffer.extend((0..frames).map(|_| feed.pop_front().unwrap_or(0.0))),
                    None => buffer.resize(frames, 0.0),
                }
            }
            for buffer in &mut active.outputs {
                buffer.clear();
                buffer.resize(frames, 0.0);
            }

            let mut cycle = SimCycle {
                frames,
                inputs: &active.inputs,
                outputs: &mut active.outputs,
            };
            active.callback.process(&mut cycle);

            for (log, buffer) in self.output_log.iter_mut().zip(&active.outputs) {
                log.extend_from_slice(buffer);
                if log.len() > MAX_OUTPUT_LOG {
                    let excess = log.len() - MAX_OUTPUT_LOG;
                    log.drain(..excess);
                }
            }

            self.total_cycles += 1;
            ran += 1;
        }
        ran
    }
}

/// One simulated cycle's port buffers
struct SimCycle<'a> {
    frames: usize,
    inputs: &'a [Vec<Sample>],
    outputs: &'a mut [Vec<Sample>],
}

impl CycleBuffers for SimCycle<'_> {
    fn frames(&self) -> usize {
        self.frames
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

fn lock(shared: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Simulated audio server backend
pub struct SimulatedServer {
    shared: Arc<Mutex<SimState>>,
    clock: Clock,
    clock_running: Arc<AtomicBool>,
    clock_thread: Option<JoinHandle<()>>,
}

impl Default for SimulatedServer {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_RATE, DEFAULT_BUFFER_SIZE)
    }
}

impl SimulatedServer {
    /// Server whose cycles only run when the handle calls `step`
    ///
    /// Activation runs one priming cycle so startup can be observed.
    pub fn new(sample_rate: u32, buffer_size: u32) -> Self {
        Self::with_clock(sample_rate, buffer_size, Clock::Stepped)
    }

    /// Server that runs cycles in real time on its own thread once activated
    pub fn free_running(sample_rate: u32, buffer_size: u32) -> Self {
        Self::with_clock(sample_rate, buffer_size, Clock::FreeRunning)
    }

    fn with_clock(sample_rate: u32, buffer_size: u32, clock: Clock) -> Self {
        let state = SimState {
            running: true,
            sample_rate,
            buffer_size,
            client: None,
            own_inputs: Vec::new(),
            own_outputs: Vec::new(),
            external: Vec::new(),
            connections: BTreeSet::new(),
            active: None,
            input_feed: Vec::new(),
            output_log: Vec::new(),
            faults: Faults::default(),
            total_cycles: 0,
            availability_checks: 0,
        };
        Self {
            shared: Arc::new(Mutex::new(state)),
            clock,
            clock_running: Arc::new(AtomicBool::new(false)),
            clock_thread: None,
        }
    }

    /// Control handle (clock, faults, graph) usable after the server is
    /// boxed into a lifecycle manager
    pub fn handle(&self) -> SimulatedServerHandle {
        SimulatedServerHandle {
            shared: self.shared.clone(),
        }
    }

    fn start_clock(&mut self) -> BridgeResult<()> {
        if self.clock_thread.is_some() {
            return Ok(());
        }
        self.clock_running.store(true, Ordering::Release);
        let shared = self.shared.clone();
        let running = self.clock_running.clone();

        let handle = thread::Builder::new()
            .name("jacklink-sim-rt".into())
            .spawn(move || {
                log::debug!("Simulated server clock started");
                while running.load(Ordering::Acquire) {
                    let period = {
                        let info = lock(&shared).info();
                        Duration::from_secs_f64(info.buffer_size as f64 / info.sample_rate as f64)
                    };
                    thread::sleep(period);
                    lock(&shared).run_cycles(1, None);
                }
                log::debug!("Simulated server clock stopped");
            })
            .map_err(|e| BridgeError::ConnectionFailed(format!("Failed to spawn clock thread: {}", e)))?;

        self.clock_thread = Some(handle);
        Ok(())
    }

    fn stop_clock(&mut self) {
        self.clock_running.store(false, Ordering::Release);
        if let Some(handle) = self.clock_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SimulatedServer {
    fn drop(&mut self) {
        self.stop_clock();
    }
}

impl AudioServer for SimulatedServer {
    fn backend_name(&self) -> &'static str {
        "simulated"
    }

    fn is_available(&self) -> bool {
        let mut state = lock(&self.shared);
        state.availability_checks += 1;
        state.running
    }

    fn open(&mut self, client_name: &str) -> BridgeResult<ServerInfo> {
        let mut state = lock(&self.shared);
        if !state.running {
            return Err(BridgeError::CapabilityUnavailable("server is not running".to_string()));
        }
        if state.faults.fail_open {
            return Err(BridgeError::ConnectionFailed(format!(
                "server refused client '{}'",
                client_name
            )));
        }
        if state.client.is_some() {
            return Err(BridgeError::ConnectionFailed("client already open".to_string()));
        }

        // Servers make names unique the way JACK does
        let taken = format!("{}:", client_name);
        let name = if state.external.iter().any(|p| p.name.starts_with(&taken)) {
            format!("{}-01", client_name)
        } else {
            client_name.to_string()
        };
        log::debug!("Simulated client '{}' opened", name);
        state.client = Some(name);
        Ok(state.info())
    }

    fn info(&self) -> Option<ServerInfo> {
        let state = lock(&self.shared);
        (state.running && state.client.is_some()).then(|| state.info())
    }

    fn client_name(&self) -> Option<String> {
        lock(&self.shared).client.clone()
    }

    fn register_port(&mut self, name: &str, direction: PortDirection) -> BridgeResult<String> {
        let mut state = lock(&self.shared);
        let failure = |reason: &str| BridgeError::PortRegistrationFailed {
            port: name.to_string(),
            reason: reason.to_string(),
        };

        let Some(client) = state.client.clone() else {
            return Err(failure("no client open"));
        };
        if state.active.is_some() {
            return Err(failure("client is active"));
        }
        if state.faults.fail_register {
            return Err(failure("server rejected the port"));
        }

        let full = format!("{}:{}", client, name);
        if state.port_direction(&full).is_some() {
            return Err(failure("name already in use"));
        }
        match direction {
            PortDirection::Input => {
                state.own_inputs.push(full.clone());
                state.input_feed.push(VecDeque::new());
            }
            PortDirection::Output => {
                state.own_outputs.push(full.clone());
                state.output_log.push(Vec::new());
            }
        }
        Ok(full)
    }

    fn unregister_ports(&mut self) {
        let mut state = lock(&self.shared);
        if let Some(client) = state.client.clone() {
            state.drop_connections_of(&client);
        }
        state.own_inputs.clear();
        state.own_outputs.clear();
        state.input_feed.clear();
        state.output_log.clear();
    }

    fn activate(
        &mut self,
        callback: RealtimeBridgeCallback,
        signals: Arc<ServerSignals>,
    ) -> BridgeResult<()> {
        {
            let mut state = lock(&self.shared);
            if !state.running || state.client.is_none() {
                return Err(BridgeError::ConnectionFailed("no open client to activate".to_string()));
            }
            if state.active.is_some() {
                return Err(BridgeError::ConnectionFailed("client already active".to_string()));
            }

            // Like JACK, report the current format on activation
            signals.notify_sample_rate(state.sample_rate);
            signals.notify_buffer_size(state.buffer_size);

            let inputs = vec![Vec::with_capacity(MAX_BUFFER_SIZE); state.own_inputs.len()];
            let outputs = vec![Vec::with_capacity(MAX_BUFFER_SIZE); state.own_outputs.len()];
            state.active = Some(ActiveSession {
                callback,
                signals,
                inputs,
                outputs,
            });

            if self.clock == Clock::Stepped {
                state.run_cycles(1, None);
            }
        }

        if self.clock == Clock::FreeRunning {
            self.start_clock()?;
        }
        Ok(())
    }

    fn deactivate(&mut self) -> Option<RealtimeBridgeCallback> {
        self.stop_clock();
        lock(&self.shared).active.take().map(|active| active.callback)
    }

    fn close(&mut self) {
        if self.deactivate().is_some() {
            log::debug!("Simulated client closed while active");
        }
        self.unregister_ports();
        lock(&self.shared).client = None;
    }

    fn list_ports(&self, direction: Option<PortDirection>) -> BridgeResult<Vec<String>> {
        let state = lock(&self.shared);
        if !state.running {
            return Err(BridgeError::Server("server is not running".to_string()));
        }
        let external = state
            .external
            .iter()
            .filter(|p| direction.map_or(true, |d| d == p.direction))
            .map(|p| p.name.clone());
        let inputs = state
            .own_inputs
            .iter()
            .filter(|_| direction != Some(PortDirection::Output))
            .cloned();
        let outputs = state
            .own_outputs
            .iter()
            .filter(|_| direction != Some(PortDirection::Input))
            .cloned();
        Ok(external.chain(inputs).chain(outputs).collect())
    }

    fn connections(&self, port: &str) -> BridgeResult<Vec<String>> {
        let state = lock(&self.shared);
        if state.port_direction(port).is_none() {
            return Err(BridgeError::Server(format!("no such port '{}'", port)));
        }
        Ok(state
            .connections
            .iter()
            .filter_map(|(src, dst)| {
                if src == port {
                    Some(dst.clone())
                } else if dst == port {
                    Some(src.clone())
                } else {
                    None
                }
            })
            .collect())
    }

    fn connect_ports(&self, source: &str, destination: &str) -> BridgeResult<()> {
        let mut state = lock(&self.shared);
        match (state.port_direction(source), state.port_direction(destination)) {
            (Some(PortDirection::Output), Some(PortDirection::Input)) => {}
            _ => {
                return Err(BridgeError::Server(format!(
                    "cannot connect '{}' to '{}'",
                    source, destination
                )));
            }
        }
        if !state
            .connections
            .insert((source.to_string(), destination.to_string()))
        {
            return Err(BridgeError::Server(format!(
                "'{}' is already connected to '{}'",
                source, destination
            )));
        }
        Ok(())
    }

    fn disconnect_ports(&self, source: &str, destination: &str) -> BridgeResult<()> {
        let mut state = lock(&self.shared);
        if state
            .connections
            .remove(&(source.to_string(), destination.to_string()))
        {
            Ok(())
        } else {
            Err(BridgeError::Server(format!(
                "'{}' is not connected to '{}'",
                source, destination
            )))
        }
    }
}

/// Test and host controls for a [`SimulatedServer`]
#[derive(Clone)]
pub struct SimulatedServerHandle {
    shared: Arc<Mutex<SimState>>,
}

impl SimulatedServerHandle {
    /// Run `cycles` process cycles at the current buffer size
    ///
    /// Returns the number actually run (0 while stopped, stalled or inactive).
    pub fn step(&self, cycles: u64) -> u64 {
        lock(&self.shared).run_cycles(cycles, None)
    }

    /// Run one cycle of `frames` without changing the server's buffer size
    pub fn step_frames(&self, frames: usize) -> u64 {
        lock(&self.shared).run_cycles(1, Some(frames))
    }

    /// Total cycles run since creation
    pub fn cycles(&self) -> u64 {
        lock(&self.shared).total_cycles
    }

    /// Change the period and notify the active client
    pub fn set_buffer_size(&self, frames: u32) {
        let mut state = lock(&self.shared);
        state.buffer_size = frames;
        if let Some(active) = &state.active {
            active.signals.notify_buffer_size(frames);
        }
        log::debug!("Simulated server buffer size -> {}", frames);
    }

    /// Change the sample rate and notify the active client
    pub fn set_sample_rate(&self, rate: u32) {
        let mut state = lock(&self.shared);
        state.sample_rate = rate;
        if let Some(active) = &state.active {
            active.signals.notify_sample_rate(rate);
        }
        log::debug!("Simulated server sample rate -> {}", rate);
    }

    /// Report an xrun to the active client
    pub fn inject_xrun(&self) {
        if let Some(active) = &lock(&self.shared).active {
            active.signals.notify_xrun();
        }
    }

    /// Stop the server: cycles stop and the active client gets a shutdown
    /// notification
    pub fn shutdown_server(&self) {
        let mut state = lock(&self.shared);
        state.running = false;
        if let Some(active) = &state.active {
            active.signals.notify_shutdown();
        }
        log::debug!("Simulated server shut down");
    }

    /// Bring the server back with an empty graph; old clients are gone
    pub fn restart(&self) {
        let mut state = lock(&self.shared);
        state.running = true;
        state.client = None;
        state.active = None;
        state.own_inputs.clear();
        state.own_outputs.clear();
        state.input_feed.clear();
        state.output_log.clear();
        state.connections.clear();
        log::debug!("Simulated server restarted");
    }

    pub fn is_running(&self) -> bool {
        lock(&self.shared).running
    }

    /// How often `is_available` has been asked
    pub fn availability_checks(&self) -> u64 {
        lock(&self.shared).availability_checks
    }

    /// Name of the bridge's client, if one is open
    pub fn client_name(&self) -> Option<String> {
        lock(&self.shared).client.clone()
    }

    /// Add another client with `in_N` input and `out_N` output ports
    pub fn add_external_client(&self, name: &str, inputs: usize, outputs: usize) {
        let mut state = lock(&self.shared);
        for i in 1..=inputs {
            state.external.push(SimPort {
                name: format!("{}:in_{}", name, i),
                direction: PortDirection::Input,
            });
        }
        for i in 1..=outputs {
            state.external.push(SimPort {
                name: format!("{}:out_{}", name, i),
                direction: PortDirection::Output,
            });
        }
    }

    pub fn remove_external_client(&self, name: &str) {
        let mut state = lock(&self.shared);
        let prefix = format!("{}:", name);
        state.external.retain(|p| !p.name.starts_with(&prefix));
        state.drop_connections_of(name);
    }

    pub fn is_connected(&self, source: &str, destination: &str) -> bool {
        lock(&self.shared)
            .connections
            .contains(&(source.to_string(), destination.to_string()))
    }

    /// Queue samples arriving on the bridge's input port `port` (0-based);
    /// cycles read silence once the queue is empty
    pub fn feed_input(&self, port: usize, samples: &[Sample]) {
        if let Some(feed) = lock(&self.shared).input_feed.get_mut(port) {
            feed.extend(samples.iter().copied());
        }
    }

    /// Everything the bridge wrote to output port `port` since the last call
    pub fn take_output(&self, port: usize) -> Vec<Sample> {
        lock(&self.shared)
            .output_log
            .get_mut(port)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// Make the next `open` calls fail with `ConnectionFailed`
    pub fn fail_open(&self, fail: bool) {
        lock(&self.shared).faults.fail_open = fail;
    }

    /// Make port registration fail
    pub fn fail_port_registration(&self, fail: bool) {
        lock(&self.shared).faults.fail_register = fail;
    }

    /// Stop running cycles while the server stays up
    pub fn stall(&self, stalled: bool) {
        lock(&self.shared).faults.stalled = stalled;
    }
}
