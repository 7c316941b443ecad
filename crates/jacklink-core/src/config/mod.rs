//! Configuration for the bridge
//!
//! - [`LinkSettings`]: persisted YAML settings (enable flag, client/port
//!   naming, latency, policies, timeouts, server launch options)
//! - [`BridgeConfig`]: the engine-side format of one session, immutable
//!   while the session is running
//! - Generic YAML load/save and the default settings path
//!
//! # Usage
//!
//! ```ignore
//! use jacklink_core::config::{default_config_path, load_config, save_config, LinkSettings};
//!
//! let path = default_config_path();
//! let mut settings: LinkSettings = load_config(&path);
//! settings.validate();
//! save_config(&settings, &path)?;
//! ```

mod io;
mod paths;
mod session;
mod settings;

pub use io::{load_config, save_config};
pub use paths::{default_config_dir, default_config_path};
pub use session::BridgeConfig;
pub use settings::{
    LinkSettings, ServerSettings, SUPPORTED_BUFFER_SIZES, SUPPORTED_SAMPLE_RATES,
};
