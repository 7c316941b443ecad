//! The bridge itself: real-time callback, engine adapter and the control
//! side that connects them

mod adapter;
pub mod graph;
mod lifecycle;
mod monitor;
mod ports;
mod realtime;
mod stats;
mod status;

pub use adapter::EngineAudioAdapter;
pub use lifecycle::{BridgeLifecycleManager, StateChange};
pub use monitor::{BridgeMonitor, MonitorCommand};
pub use ports::{port_name, PortDescriptor, PortDirection, PortSet, PortState};
pub use realtime::{CallbackStatus, CycleBuffers, RealtimeBridgeCallback};
pub use stats::{BridgeStats, DirectionStats};
pub use status::StatusHandle;
