//! Persisted bridge settings
//!
//! Every field has a default so that partial YAML files load cleanly. Values
//! the server can't run with are mapped back to defaults by
//! [`LinkSettings::validate`] with a warning, rather than rejected.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::convert::{ChannelMapPolicy, ResamplePolicy};
use crate::types::{DEFAULT_BUFFER_SIZE, DEFAULT_SAMPLE_RATE, MAX_BUFFER_SIZE};

/// Sample rates offered for the server
pub const SUPPORTED_SAMPLE_RATES: [u32; 7] = [22050, 32000, 44100, 48000, 88200, 96000, 192000];

/// Server periods offered (frames)
pub const SUPPORTED_BUFFER_SIZES: [u32; 9] = [16, 32, 64, 128, 256, 512, 1024, 2048, 4096];

/// Upper bound on ports per direction
const MAX_PORTS: usize = 64;

/// Lower bound for any of the control timeouts
const MIN_TIMEOUT_MS: u64 = 10;

/// Bridge settings as stored in `settings.yaml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    /// Master switch; a disabled bridge stays Degraded and passes silence
    pub enabled: bool,
    /// Client name registered with the server
    pub client_name: String,
    /// Server to connect to (None = the default server)
    pub server_name: Option<String>,
    /// Port names are `{prefix}_in_{n}` / `{prefix}_out_{n}`
    pub port_prefix: String,
    /// Capture ports (server → engine)
    pub input_ports: usize,
    /// Playback ports (engine → server)
    pub output_ports: usize,
    /// Latency tolerance in engine-rate frames, a floor for every session
    pub latency_frames: u32,
    pub channel_mapping: ChannelMapPolicy,
    pub resampler: ResamplePolicy,
    /// Time allowed for the first process cycle after activation
    pub startup_timeout_ms: u64,
    /// Time allowed for the engine side to release the session
    pub quiesce_timeout_ms: u64,
    /// Reconnect automatically from Degraded
    pub auto_reconnect: bool,
    pub reconnect_interval_ms: u64,
    /// Connect other clients' outputs to our inputs as they appear
    pub auto_connect: bool,
    /// Server process launch options
    pub server: ServerSettings,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            client_name: "jacklink".to_string(),
            server_name: None,
            port_prefix: "bridge".to_string(),
            input_ports: 2,
            output_ports: 2,
            latency_frames: DEFAULT_BUFFER_SIZE,
            channel_mapping: ChannelMapPolicy::default(),
            resampler: ResamplePolicy::default(),
            startup_timeout_ms: 2000,
            quiesce_timeout_ms: 500,
            auto_reconnect: true,
            reconnect_interval_ms: 1000,
            auto_connect: false,
            server: ServerSettings::default(),
        }
    }
}

impl LinkSettings {
    /// Map unusable values back to defaults (logging each change)
    pub fn validate(&mut self) {
        let defaults = Self::default();

        if self.client_name.trim().is_empty() {
            log::warn!("Empty client name, using '{}'", defaults.client_name);
            self.client_name = defaults.client_name;
        }
        if self.port_prefix.trim().is_empty() {
            log::warn!("Empty port prefix, using '{}'", defaults.port_prefix);
            self.port_prefix = defaults.port_prefix;
        }
        if self.server_name.as_deref().is_some_and(|s| s.trim().is_empty()) {
            self.server_name = None;
        }

        self.input_ports = clamp_ports("input", self.input_ports);
        self.output_ports = clamp_ports("output", self.output_ports);

        if self.latency_frames as usize > MAX_BUFFER_SIZE {
            log::warn!(
                "Latency {} frames exceeds {}, clamping",
                self.latency_frames,
                MAX_BUFFER_SIZE
            );
            self.latency_frames = MAX_BUFFER_SIZE as u32;
        }

        self.startup_timeout_ms = self.startup_timeout_ms.max(MIN_TIMEOUT_MS);
        self.quiesce_timeout_ms = self.quiesce_timeout_ms.max(MIN_TIMEOUT_MS);
        self.reconnect_interval_ms = self.reconnect_interval_ms.max(MIN_TIMEOUT_MS);

        self.server.validate();
    }

    /// Builder-style validated copy
    pub fn sanitized(mut self) -> Self {
        self.validate();
        self
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn quiesce_timeout(&self) -> Duration {
        Duration::from_millis(self.quiesce_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

fn clamp_ports(direction: &str, count: usize) -> usize {
    let clamped = count.clamp(1, MAX_PORTS);
    if clamped != count {
        log::warn!("{} {} ports not supported, using {}", count, direction, clamped);
    }
    clamped
}

/// How to launch a local `jackd` when none is running
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Launch `jackd` on start if the server isn't available
    pub auto_start: bool,
    /// `jackd -d <driver>` (alsa, dummy, coreaudio, portaudio, ...)
    pub backend_driver: String,
    /// Driver device (`-d <device>` after the driver), None = driver default
    pub device: Option<String>,
    /// Executable to launch
    pub jackd_path: String,
    pub sample_rate: u32,
    /// Server period in frames
    pub buffer_size: u32,
    /// Stop a server we launched when the bridge stops
    pub stop_on_shutdown: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            auto_start: false,
            backend_driver: default_driver().to_string(),
            device: None,
            jackd_path: "jackd".to_string(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            stop_on_shutdown: true,
        }
    }
}

impl ServerSettings {
    pub fn validate(&mut self) {
        if !SUPPORTED_SAMPLE_RATES.contains(&self.sample_rate) {
            log::warn!(
                "Unsupported server sample rate {}Hz, using {}Hz",
                self.sample_rate,
                DEFAULT_SAMPLE_RATE
            );
            self.sample_rate = DEFAULT_SAMPLE_RATE;
        }
        if !SUPPORTED_BUFFER_SIZES.contains(&self.buffer_size) {
            log::warn!(
                "Unsupported server buffer size {}, using {}",
                self.buffer_size,
                DEFAULT_BUFFER_SIZE
            );
            self.buffer_size = DEFAULT_BUFFER_SIZE;
        }
        if self.backend_driver.trim().is_empty() {
            self.backend_driver = default_driver().to_string();
        }
        if self.jackd_path.trim().is_empty() {
            self.jackd_path = "jackd".to_string();
        }
    }
}

fn default_driver() -> &'static str {
    if cfg!(target_os = "macos") {
        "coreaudio"
    } else if cfg!(target_os = "windows") {
        "portaudio"
    } else {
        "alsa"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = LinkSettings::default();
        assert_eq!(settings.clone().sanitized(), settings);
    }

    #[test]
    fn test_unsupported_rate_and_period_fall_back() {
        let mut settings = LinkSettings::default();
        settings.server.sample_rate = 12345;
        settings.server.buffer_size = 300;
        settings.validate();
        assert_eq!(settings.server.sample_rate, DEFAULT_SAMPLE_RATE);
        assert_eq!(settings.server.buffer_size, DEFAULT_BUFFER_SIZE);

        settings.server.sample_rate = 96000;
        settings.server.buffer_size = 64;
        settings.validate();
        assert_eq!(settings.server.sample_rate, 96000);
        assert_eq!(settings.server.buffer_size, 64);
    }

    #[test]
    fn test_names_and_counts_sanitized() {
        let settings = LinkSettings {
            client_name: "  ".to_string(),
            port_prefix: String::new(),
            server_name: Some(String::new()),
            input_ports: 0,
            output_ports: 500,
            latency_frames: 100_000,
            quiesce_timeout_ms: 0,
            ..Default::default()
        }
        .sanitized();

        assert_eq!(settings.client_name, "jacklink");
        assert_eq!(settings.port_prefix, "bridge");
        assert_eq!(settings.server_name, None);
        assert_eq!(settings.input_ports, 1);
        assert_eq!(settings.output_ports, MAX_PORTS);
        assert_eq!(settings.latency_frames as usize, MAX_BUFFER_SIZE);
        assert_eq!(settings.quiesce_timeout(), Duration::from_millis(MIN_TIMEOUT_MS));
    }
}
