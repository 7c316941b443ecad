//! Lock-free published bridge state

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::types::BridgeState;

/// Cloneable read handle on the bridge state, usable from any thread
///
/// The lifecycle manager publishes every transition here. Server threads
/// may additionally flip Active to Degraded the moment they detect a
/// shutdown or callback failure, ahead of the control context.
#[derive(Debug, Clone, Default)]
pub struct StatusHandle {
    state: Arc<AtomicU8>,
}

impl StatusHandle {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn state(&self) -> BridgeState {
        BridgeState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.state() == BridgeState::Active
    }

    pub(crate) fn store(&self, state: BridgeState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Active → Degraded; any other state is left alone. RT-safe.
    #[inline]
    pub(crate) fn degrade_if_active(&self) -> bool {
        self.state
            .compare_exchange(
                BridgeState::Active as u8,
                BridgeState::Degraded as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}
