//! External audio server seam
//!
//! [`AudioServer`] abstracts the server client the bridge talks to. The
//! lifecycle manager only ever drives it from the control context:
//!
//! - `open` / `close` the client
//! - `register_port` / `unregister_ports` before activation
//! - `activate` hands over the [`RealtimeBridgeCallback`]; the backend calls
//!   it on its real-time thread once per cycle
//! - `deactivate` is the quiescence fence: it returns the callback by value
//!   once the backend can no longer invoke it
//!
//! Backends:
//! - `JackServer` (Linux, `jack-backend` feature): native JACK client
//! - [`SimulatedServer`]: in-process server with a stepped or free-running clock
//! - [`UnavailableServer`]: capability absent

mod controller;
mod signals;
mod simulated;

#[cfg(all(target_os = "linux", feature = "jack-backend"))]
mod jack_backend;

pub use controller::JackdController;
pub use signals::{ServerEvent, ServerSignals};
pub use simulated::{SimulatedServer, SimulatedServerHandle};

#[cfg(all(target_os = "linux", feature = "jack-backend"))]
pub use jack_backend::JackServer;

use std::sync::Arc;

use crate::bridge::{PortDirection, RealtimeBridgeCallback};
use crate::config::LinkSettings;
use crate::error::{BridgeError, BridgeResult};

/// Server-side format of the current session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerInfo {
    pub sample_rate: u32,
    /// Frames per process cycle
    pub buffer_size: u32,
}

impl ServerInfo {
    /// One-cycle latency in milliseconds
    pub fn latency_ms(&self) -> f32 {
        (self.buffer_size as f32 / self.sample_rate as f32) * 1000.0
    }
}

/// A client connection to an external audio server
pub trait AudioServer: Send {
    /// Short backend name for logs ("jack", "simulated", ...)
    fn backend_name(&self) -> &'static str;

    /// Runtime capability check: can a client be opened?
    ///
    /// Must not add anything to the server graph. Backends that cannot tell
    /// without connecting answer from their last `open`, which reports an
    /// unreachable server as `CapabilityUnavailable`.
    fn is_available(&self) -> bool;

    /// Open a client; the server may rename it (see [`AudioServer::client_name`])
    fn open(&mut self, client_name: &str) -> BridgeResult<ServerInfo>;

    /// Current server format, `None` when no client is open
    fn info(&self) -> Option<ServerInfo>;

    /// Actual name of the open client
    fn client_name(&self) -> Option<String>;

    /// Register one port, returning its full `client:port` name
    ///
    /// Only valid while the client is open and inactive.
    fn register_port(&mut self, name: &str, direction: PortDirection) -> BridgeResult<String>;

    /// Unregister every port this client registered (inactive client only)
    fn unregister_ports(&mut self);

    /// Start invoking `callback` on the server's real-time thread
    ///
    /// Capture/playback buffers are passed in port registration order.
    /// Notifications (rate/size change, shutdown, xruns) are reported
    /// through `signals`.
    fn activate(
        &mut self,
        callback: RealtimeBridgeCallback,
        signals: Arc<ServerSignals>,
    ) -> BridgeResult<()>;

    /// Stop invoking the callback and hand it back
    ///
    /// After this returns the real-time thread no longer touches the
    /// callback or its rings. `None` when nothing was active or the server
    /// already dropped the client.
    fn deactivate(&mut self) -> Option<RealtimeBridgeCallback>;

    /// Close the client (deactivating first if needed)
    fn close(&mut self);

    /// All audio ports in the graph, optionally filtered by direction
    ///
    /// `Input` ports receive audio, `Output` ports produce it.
    fn list_ports(&self, direction: Option<PortDirection>) -> BridgeResult<Vec<String>>;

    /// Ports currently connected to `port`
    fn connections(&self, port: &str) -> BridgeResult<Vec<String>>;

    /// Connect an output port to an input port
    fn connect_ports(&self, source: &str, destination: &str) -> BridgeResult<()>;

    /// Disconnect an output port from an input port
    fn disconnect_ports(&self, source: &str, destination: &str) -> BridgeResult<()>;
}

/// Backend used when no server client can exist in this build or platform
///
/// Every connection attempt fails with `CapabilityUnavailable`, which puts
/// the bridge in Degraded (silence) instead of failing the host.
pub struct UnavailableServer {
    reason: String,
}

impl UnavailableServer {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    fn error(&self) -> BridgeError {
        BridgeError::CapabilityUnavailable(self.reason.clone())
    }
}

impl AudioServer for UnavailableServer {
    fn backend_name(&self) -> &'static str {
        "unavailable"
    }

    fn is_available(&self) -> bool {
        false
    }

    fn open(&mut self, _client_name: &str) -> BridgeResult<ServerInfo> {
        Err(self.error())
    }

    fn info(&self) -> Option<ServerInfo> {
        None
    }

    fn client_name(&self) -> Option<String> {
        None
    }

    fn register_port(&mut self, _name: &str, _direction: PortDirection) -> BridgeResult<String> {
        Err(self.error())
    }

    fn unregister_ports(&mut self) {}

    fn activate(
        &mut self,
        _callback: RealtimeBridgeCallback,
        _signals: Arc<ServerSignals>,
    ) -> BridgeResult<()> {
        Err(self.error())
    }

    fn deactivate(&mut self) -> Option<RealtimeBridgeCallback> {
        None
    }

    fn close(&mut self) {}

    fn list_ports(&self, _direction: Option<PortDirection>) -> BridgeResult<Vec<String>> {
        Err(self.error())
    }

    fn connections(&self, _port: &str) -> BridgeResult<Vec<String>> {
        Err(self.error())
    }

    fn connect_ports(&self, _source: &str, _destination: &str) -> BridgeResult<()> {
        Err(self.error())
    }

    fn disconnect_ports(&self, _source: &str, _destination: &str) -> BridgeResult<()> {
        Err(self.error())
    }
}

/// The native backend for this build, or [`UnavailableServer`]
#[cfg(all(target_os = "linux", feature = "jack-backend"))]
pub fn default_server(settings: &LinkSettings) -> Box<dyn AudioServer> {
    log::info!("Using native JACK backend");
    Box::new(JackServer::new(settings.server_name.clone()))
}

/// The native backend for this build, or [`UnavailableServer`]
#[cfg(not(all(target_os = "linux", feature = "jack-backend")))]
pub fn default_server(_settings: &LinkSettings) -> Box<dyn AudioServer> {
    log::info!("JACK backend not compiled in, bridge will stay degraded");
    Box::new(UnavailableServer::new(
        "JACK support is not compiled into this build",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_server_reports_capability() {
        let mut server = UnavailableServer::new("no server here");
        assert!(!server.is_available());
        assert_eq!(
            server.open("client"),
            Err(BridgeError::CapabilityUnavailable("no server here".to_string()))
        );
        assert!(server.deactivate().is_none());
        assert!(server.list_ports(None).is_err());
    }

    #[test]
    fn test_latency_ms() {
        let info = ServerInfo {
            sample_rate: 48000,
            buffer_size: 480,
        };
        assert!((info.latency_ms() - 10.0).abs() < 1e-4);
    }
}
