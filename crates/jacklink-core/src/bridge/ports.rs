//! Logical ports registered with the server
//!
//! Registration state only changes on the control context. The real-time
//! callback sees ports purely as buffer indices in registration order.

use crate::error::BridgeResult;
use crate::server::{AudioServer, ServerInfo};

/// Which way audio flows through a port, from the server's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortDirection {
    /// Receives audio from the graph (bridge capture)
    Input,
    /// Sends audio into the graph (bridge playback)
    Output,
}

/// Registration state of one port
///
/// `Unregistered → Registered → Active → Closing → Unregistered`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortState {
    #[default]
    Unregistered,
    Registered,
    Active,
    Closing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDescriptor {
    /// Short name (`bridge_in_1`)
    pub name: String,
    /// Full `client:port` name once registered
    pub full_name: Option<String>,
    pub direction: PortDirection,
    pub state: PortState,
}

impl PortDescriptor {
    fn new(name: String, direction: PortDirection) -> Self {
        Self {
            name,
            full_name: None,
            direction,
            state: PortState::Unregistered,
        }
    }
}

/// The bridge's input and output ports plus the format they were registered for
#[derive(Debug, Clone)]
pub struct PortSet {
    inputs: Vec<PortDescriptor>,
    outputs: Vec<PortDescriptor>,
    contract: Option<ServerInfo>,
}

impl PortSet {
    pub fn new(prefix: &str, input_count: usize, output_count: usize) -> Self {
        Self {
            inputs: (0..input_count)
                .map(|i| PortDescriptor::new(port_name(prefix, PortDirection::Input, i), PortDirection::Input))
                .collect(),
            outputs: (0..output_count)
                .map(|i| PortDescriptor::new(port_name(prefix, PortDirection::Output, i), PortDirection::Output))
                .collect(),
            contract: None,
        }
    }

    pub fn inputs(&self) -> &[PortDescriptor] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[PortDescriptor] {
        &self.outputs
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// Server format the ports were registered under
    pub fn contract(&self) -> Option<ServerInfo> {
        self.contract
    }

    /// Full names of the registered input ports, in order
    pub fn input_names(&self) -> Vec<String> {
        self.inputs.iter().filter_map(|p| p.full_name.clone()).collect()
    }

    /// Full names of the registered output ports, in order
    pub fn output_names(&self) -> Vec<String> {
        self.outputs.iter().filter_map(|p| p.full_name.clone()).collect()
    }

    fn all_mut(&mut self) -> impl Iterator<Item = &mut PortDescriptor> {
        self.inputs.iter_mut().chain(self.outputs.iter_mut())
    }

    /// Register every port (inputs first); on failure nothing stays registered
    pub fn register_all(&mut self, server: &mut dyn AudioServer, info: ServerInfo) -> BridgeResult<()> {
        for i in 0..self.inputs.len() + self.outputs.len() {
            let port = if i < self.inputs.len() {
                &mut self.inputs[i]
            } else {
                &mut self.outputs[i - self.inputs.len()]
            };
            match server.register_port(&port.name, port.direction) {
                Ok(full_name) => {
                    port.full_name = Some(full_name);
                    port.state = PortState::Registered;
                }
                Err(e) => {
                    log::warn!("Port registration failed: {}", e);
                    self.unregister_all(server);
                    return Err(e);
                }
            }
        }
        self.contract = Some(info);
        log::debug!(
            "Registered {} input and {} output ports",
            self.inputs.len(),
            self.outputs.len()
        );
        Ok(())
    }

    /// Registered ports are now being processed
    pub fn mark_active(&mut self) {
        for port in self.all_mut().filter(|p| p.state == PortState::Registered) {
            port.state = PortState::Active;
        }
    }

    /// Unregister everything (client must be inactive)
    pub fn unregister_all(&mut self, server: &mut dyn AudioServer) {
        for port in self.all_mut().filter(|p| p.state != PortState::Unregistered) {
            port.state = PortState::Closing;
        }
        server.unregister_ports();
        for port in self.all_mut() {
            port.state = PortState::Unregistered;
            port.full_name = None;
        }
        self.contract = None;
    }

    pub fn is_registered(&self) -> bool {
        self.contract.is_some()
    }
}

/// `{prefix}_in_{n}` / `{prefix}_out_{n}` with 1-based `n`
pub fn port_name(prefix: &str, direction: PortDirection, index: usize) -> String {
    let kind = match direction {
        PortDirection::Input => "in",
        PortDirection::Output => "out",
    };
    format!("{}_{}_{}", prefix, kind, index + 1)
}
