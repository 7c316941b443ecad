//! Bridge error types

use std::time::Duration;

use thiserror::Error;

use crate::types::BridgeState;

/// Errors that can occur while configuring or driving the bridge
///
/// None of these ever cross the real-time boundary: the process callback
/// only reports a [`crate::CallbackStatus`]. Ring overruns and underruns are
/// not errors at all, they are counted in [`crate::RingStats`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// The server (or the SDK backend) is not present
    #[error("Audio server capability unavailable: {0}")]
    CapabilityUnavailable(String),

    /// Opening a client on the server failed
    #[error("Failed to connect to audio server: {0}")]
    ConnectionFailed(String),

    /// A port could not be registered with the server
    #[error("Failed to register port '{port}': {reason}")]
    PortRegistrationFailed { port: String, reason: String },

    /// Channel layout or sample rate combination with no configured mapping
    #[error("Unsupported format: {0}")]
    FormatMismatch(String),

    /// The server did not run the first process cycle in time
    #[error("No process callback from the audio server within {0:?}")]
    CallbackTimeout(Duration),

    /// Adapting to a server-side sample rate or buffer size change failed
    #[error("Renegotiation failed: {0}")]
    RenegotiationFailed(String),

    /// `start()` called before `configure()`
    #[error("Bridge has not been configured")]
    NotConfigured,

    /// The bridge has been stopped (terminal state)
    #[error("Bridge is stopped")]
    Stopped,

    /// Operation not valid in the current lifecycle state
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: BridgeState, to: BridgeState },

    /// Graph operation (connect/disconnect/query) rejected by the server
    #[error("Audio server error: {0}")]
    Server(String),

    /// Settings that can't be used as-is
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),
}

impl BridgeError {
    /// Whether this error leaves the bridge in Degraded (as opposed to being
    /// rejected before any state change)
    pub fn degrades(&self) -> bool {
        matches!(
            self,
            BridgeError::CapabilityUnavailable(_)
                | BridgeError::ConnectionFailed(_)
                | BridgeError::PortRegistrationFailed { .. }
                | BridgeError::CallbackTimeout(_)
                | BridgeError::RenegotiationFailed(_)
        )
    }
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
