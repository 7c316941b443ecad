//! JackLink Core - real-time audio bridge between a host engine and a JACK server
//!
//! The bridge moves audio between two independent execution contexts:
//!
//! - the **server real-time thread**, which calls [`RealtimeBridgeCallback`]
//!   once per cycle and must never block, allocate or lock
//! - the **engine audio thread**, which calls [`EngineAudioAdapter`] on its own
//!   cadence, buffer size and sample rate
//!
//! The two sides only ever meet at the atomic cursors of a
//! [`LockFreeRingBuffer`] (one ring per port and direction). Everything else
//! (connecting, port registration, renegotiation after a server-side sample
//! rate or buffer size change, shutdown) happens on a third control context
//! owned by [`BridgeLifecycleManager`].
//!
//! # Example
//!
//! ```ignore
//! use jacklink_core::{BridgeConfig, BridgeLifecycleManager, LinkSettings, server};
//!
//! let settings = LinkSettings::default();
//! let mut bridge = BridgeLifecycleManager::new(server::default_server(&settings), settings);
//! bridge.configure(BridgeConfig::new(48000, 256, 2))?;
//! bridge.start()?;
//!
//! // Engine audio thread
//! let mut adapter = bridge.adapter();
//! adapter.push_render(&rendered)?;
//! let captured = adapter.pull_captured(256);
//! ```

pub mod bridge;
pub mod config;
pub mod convert;
pub mod error;
pub mod ring;
pub mod server;
pub mod types;

pub use bridge::{
    BridgeLifecycleManager, BridgeMonitor, BridgeStats, CallbackStatus, CycleBuffers,
    DirectionStats, EngineAudioAdapter, MonitorCommand, PortDescriptor, PortDirection, PortSet,
    PortState, RealtimeBridgeCallback, StateChange, StatusHandle,
};
pub use config::{load_config, save_config, BridgeConfig, LinkSettings, ServerSettings};
pub use convert::{ChannelMap, ChannelMapPolicy, ResamplePolicy, Resampler, SampleFormatConverter};
pub use error::{BridgeError, BridgeResult};
pub use ring::{LockFreeRingBuffer, RingReader, RingStats, RingWriter, XrunKind};
pub use types::*;
