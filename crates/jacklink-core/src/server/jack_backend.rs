//! Native JACK backend for Linux
//!
//! Wraps a `jack::Client` through its three phases:
//!
//! ```text
//! Closed ──open()──► Inactive { client, ports } ──activate()──► Active(AsyncClient)
//!    ▲                      ▲                                        │
//!    └──────close()─────────┴──────────────deactivate()──────────────┘
//! ```
//!
//! Ports are registered while inactive and move into the process handler on
//! activation; `deactivate` gets them (and the bridge callback) back from
//! `AsyncClient::deactivate`, which only returns once JACK has stopped
//! calling the handler.

use std::sync::Arc;

use jack::{AudioIn, AudioOut, Client, ClientOptions, ClientStatus, Control, Port, PortFlags, ProcessScope};

use crate::bridge::{CycleBuffers, PortDirection, RealtimeBridgeCallback};
use crate::error::{BridgeError, BridgeResult};
use crate::types::Sample;

use super::{AudioServer, ServerInfo, ServerSignals};

/// JACK's port type string for audio ports
const AUDIO_PORT_TYPE: &str = "32 bit float mono audio";

enum ClientState {
    Closed,
    Inactive {
        client: Client,
        inputs: Vec<Port<AudioIn>>,
        outputs: Vec<Port<AudioOut>>,
    },
    Active(jack::AsyncClient<JackNotifications, JackProcessor>),
}

/// JACK server connection
pub struct JackServer {
    state: ClientState,
    /// Outcome of the last client open, `None` before the first one
    reachable: Option<bool>,
}

impl JackServer {
    /// `server_name` selects a non-default server
    ///
    /// The name goes into `JACK_DEFAULT_SERVER` here and nowhere else, so
    /// build the server before spawning the engine and monitor threads.
    pub fn new(server_name: Option<String>) -> Self {
        if let Some(name) = &server_name {
            log::debug!("Selecting JACK server '{}'", name);
            std::env::set_var("JACK_DEFAULT_SERVER", name);
        }
        Self {
            state: ClientState::Closed,
            reachable: None,
        }
    }

    fn client(&self) -> Option<&Client> {
        match &self.state {
            ClientState::Closed => None,
            ClientState::Inactive { client, .. } => Some(client),
            ClientState::Active(async_client) => Some(async_client.as_client()),
        }
    }

    fn graph_client(&self) -> BridgeResult<&Client> {
        self.client()
            .ok_or_else(|| BridgeError::Server("no JACK client open".to_string()))
    }
}

impl AudioServer for JackServer {
    fn backend_name(&self) -> &'static str {
        "jack"
    }

    /// Answers from the last open instead of creating a client of its own
    fn is_available(&self) -> bool {
        self.client().is_some() || self.reachable.unwrap_or(true)
    }

    fn open(&mut self, client_name: &str) -> BridgeResult<ServerInfo> {
        if !matches!(self.state, ClientState::Closed) {
            return Err(BridgeError::ConnectionFailed("JACK client already open".to_string()));
        }

        // JACK may rename if another client has the same name
        let (client, status) = match Client::new(client_name, ClientOptions::NO_START_SERVER) {
            Ok(opened) => {
                self.reachable = Some(true);
                opened
            }
            Err(e) => {
                let error = open_failure(e);
                self.reachable = Some(!matches!(error, BridgeError::CapabilityUnavailable(_)));
                return Err(error);
            }
        };
        if status.contains(ClientStatus::NAME_NOT_UNIQUE) {
            log::info!("JACK renamed client '{}' to '{}'", client_name, client.name());
        }

        let info = ServerInfo {
            sample_rate: client.sample_rate() as u32,
            buffer_size: client.buffer_size(),
        };
        log::info!(
            "JACK client '{}' created (sample rate: {}Hz, buffer: {} frames, latency: {:.1}ms)",
            client.name(),
            info.sample_rate,
            info.buffer_size,
            info.latency_ms()
        );

        self.state = ClientState::Inactive {
            client,
            inputs: Vec::new(),
            outputs: Vec::new(),
        };
        Ok(info)
    }

    fn info(&self) -> Option<ServerInfo> {
        self.client().map(|client| ServerInfo {
            sample_rate: client.sample_rate() as u32,
            buffer_size: client.buffer_size(),
        })
    }

    fn client_name(&self) -> Option<String> {
        self.client().map(|c| c.name().to_string())
    }

    fn register_port(&mut self, name: &str, direction: PortDirection) -> BridgeResult<String> {
        let failure = |reason: String| BridgeError::PortRegistrationFailed {
            port: name.to_string(),
            reason,
        };
        let ClientState::Inactive {
            client,
            inputs,
            outputs,
        } = &mut self.state
        else {
            return Err(failure("JACK client is not open or already active".to_string()));
        };

        let full_name = match direction {
            PortDirection::Input => {
                let port = client
                    .register_port(name, AudioIn::default())
                    .map_err(|e| failure(e.to_string()))?;
                let full = port.name().map_err(|e| failure(e.to_string()))?;
                inputs.push(port);
                full
            }
            PortDirection::Output => {
                let port = client
                    .register_port(name, AudioOut::default())
                    .map_err(|e| failure(e.to_string()))?;
                let full = port.name().map_err(|e| failure(e.to_string()))?;
                outputs.push(port);
                full
            }
        };
        log::debug!("Registered JACK port {}", full_name);
        Ok(full_name)
    }

    fn unregister_ports(&mut self) {
        if let ClientState::Inactive {
            client,
            inputs,
            outputs,
        } = &mut self.state
        {
            for port in inputs.drain(..) {
                if let Err(e) = client.unregister_port(port) {
                    log::warn!("Failed to unregister JACK input port: {}", e);
                }
            }
            for port in outputs.drain(..) {
                if let Err(e) = client.unregister_port(port) {
                    log::warn!("Failed to unregister JACK output port: {}", e);
                }
            }
        }
    }

    fn activate(
        &mut self,
        callback: RealtimeBridgeCallback,
        signals: Arc<ServerSignals>,
    ) -> BridgeResult<()> {
        let ClientState::Inactive {
            client,
            inputs,
            outputs,
        } = std::mem::replace(&mut self.state, ClientState::Closed)
        else {
            return Err(BridgeError::ConnectionFailed("JACK client is not open".to_string()));
        };

        let processor = JackProcessor {
            inputs,
            outputs,
            callback,
            signals: signals.clone(),
        };
        let notifications = JackNotifications { signals };

        let async_client = client.activate_async(notifications, processor).map_err(|e| {
            BridgeError::ConnectionFailed(format!("Failed to activate JACK client: {}", e))
        })?;
        log::info!("JACK client activated");

        self.state = ClientState::Active(async_client);
        Ok(())
    }

    fn deactivate(&mut self) -> Option<RealtimeBridgeCallback> {
        let ClientState::Active(async_client) = std::mem::replace(&mut self.state, ClientState::Closed)
        else {
            return None;
        };

        match async_client.deactivate() {
            Ok((client, _notifications, processor)) => {
                log::info!("JACK client deactivated");
                self.state = ClientState::Inactive {
                    client,
                    inputs: processor.inputs,
                    outputs: processor.outputs,
                };
                Some(processor.callback)
            }
            Err(e) => {
                // The client is gone together with its handler
                log::warn!("Failed to deactivate JACK client: {}", e);
                None
            }
        }
    }

    fn close(&mut self) {
        if self.deactivate().is_some() {
            log::debug!("JACK client closed while active");
        }
        self.unregister_ports();
        if let ClientState::Inactive { client, .. } = std::mem::replace(&mut self.state, ClientState::Closed) {
            log::info!("JACK client '{}' closed", client.name());
        }
    }

    fn list_ports(&self, direction: Option<PortDirection>) -> BridgeResult<Vec<String>> {
        let flags = match direction {
            Some(PortDirection::Input) => PortFlags::IS_INPUT,
            Some(PortDirection::Output) => PortFlags::IS_OUTPUT,
            None => PortFlags::empty(),
        };
        Ok(self
            .graph_client()?
            .ports(None, Some(AUDIO_PORT_TYPE), flags))
    }

    fn connections(&self, port: &str) -> BridgeResult<Vec<String>> {
        let client = self.graph_client()?;
        let port = client
            .port_by_name(port)
            .ok_or_else(|| BridgeError::Server(format!("no such port '{}'", port)))?;
        Ok(port.get_connections())
    }

    fn connect_ports(&self, source: &str, destination: &str) -> BridgeResult<()> {
        self.graph_client()?
            .connect_ports_by_name(source, destination)
            .map_err(|e| {
                BridgeError::Server(format!("Could not connect {} -> {}: {}", source, destination, e))
            })
    }

    fn disconnect_ports(&self, source: &str, destination: &str) -> BridgeResult<()> {
        self.graph_client()?
            .disconnect_ports_by_name(source, destination)
            .map_err(|e| {
                BridgeError::Server(format!(
                    "Could not disconnect {} -> {}: {}",
                    source, destination, e
                ))
            })
    }
}

impl Drop for JackServer {
    fn drop(&mut self) {
        self.close();
    }
}

/// JACK process handler
///
/// Owns the port handles and the bridge callback while active.
/// A refused open with no server behind it is a missing capability, anything
/// else a failed connection
fn open_failure(error: jack::Error) -> BridgeError {
    match error {
        jack::Error::ClientError(status) if status.contains(ClientStatus::SERVER_FAILED) => {
            BridgeError::CapabilityUnavailable(format!("no JACK server running ({:?})", status))
        }
        e => BridgeError::ConnectionFailed(format!("Failed to create JACK client: {}", e)),
    }
}

struct JackProcessor {
    inputs: Vec<Port<AudioIn>>,
    outputs: Vec<Port<AudioOut>>,
    callback: RealtimeBridgeCallback,
    signals: Arc<ServerSignals>,
}

impl jack::ProcessHandler for JackProcessor {
    fn process(&mut self, _client: &Client, ps: &ProcessScope) -> Control {
        let mut cycle = JackCycle {
            ps,
            inputs: &self.inputs,
            outputs: &mut self.outputs,
        };
        // A failed cycle is reported through the signals; keep the client
        // alive so the control thread can tear it down cleanly
        self.callback.process(&mut cycle);
        Control::Continue
    }

    fn buffer_size(&mut self, _client: &Client, size: jack::Frames) -> Control {
        self.signals.notify_buffer_size(size);
        Control::Continue
    }
}

/// One JACK cycle's port buffers
struct JackCycle<'a> {
    ps: &'a ProcessScope,
    inputs: &'a [Port<AudioIn>],
    outputs: &'a mut [Port<AudioOut>],
}

impl CycleBuffers for JackCycle<'_> {
    fn frames(&self) -> usize {
        self.ps.n_frames() as usize
    }

    fn input_count(&self) -> usize {
        self.inputs.len()
    }

    fn output_count(&self) -> usize {
        self.outputs.len()
    }

    fn input(&self, port: usize) -> &[Sample] {
        self.inputs[port].as_slice(self.ps)
    }

    fn output(&mut self, port: usize) -> &mut [Sample] {
        self.outputs[port].as_mut_slice(self.ps)
    }
}

/// JACK notification handler
struct JackNotifications {
    signals: Arc<ServerSignals>,
}

impl jack::NotificationHandler for JackNotifications {
    unsafe fn shutdown(&mut self, _status: ClientStatus, _reason: &str) {
        // Called from JACK's thread; only touch atomics here
        self.signals.notify_shutdown();
    }

    fn sample_rate(&mut self, _client: &Client, srate: jack::Frames) -> Control {
        log::info!("JACK sample rate changed to: {}", srate);
        self.signals.notify_sample_rate(srate);
        Control::Continue
    }

    fn xrun(&mut self, _client: &Client) -> Control {
        log::warn!("JACK xrun detected");
        self.signals.notify_xrun();
        Control::Continue
    }
}
