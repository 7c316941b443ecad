//! BridgeMonitor - background control thread for a bridge
//!
//! Calls [`BridgeLifecycleManager::tick`] at a fixed interval so server
//! notifications, auto-reconnect and auto-connect are handled without the
//! host polling. Commands arrive over a crossbeam channel.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, SendError, Sender};

use crate::error::{BridgeError, BridgeResult};
use crate::types::BridgeState;

use super::BridgeLifecycleManager;

/// Commands understood by the monitor thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorCommand {
    /// Run a tick now instead of waiting for the interval
    TickNow,
    /// Try to reconnect regardless of the auto-reconnect interval
    Reconnect,
    Shutdown,
}

/// Handle to the monitor thread; dropping it stops the thread
pub struct BridgeMonitor {
    command_tx: Sender<MonitorCommand>,
    thread_handle: Option<JoinHandle<()>>,
}

struct MonitorLoop {
    bridge: Arc<Mutex<BridgeLifecycleManager>>,
    command_rx: Receiver<MonitorCommand>,
    interval: Duration,
}

fn lock(bridge: &Mutex<BridgeLifecycleManager>) -> MutexGuard<'_, BridgeLifecycleManager> {
    bridge.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BridgeMonitor {
    /// Spawn the monitor thread for `bridge`
    pub fn spawn(bridge: Arc<Mutex<BridgeLifecycleManager>>, interval: Duration) -> BridgeResult<Self> {
        let (command_tx, command_rx) = crossbeam::channel::unbounded();
        let monitor = MonitorLoop {
            bridge,
            command_rx,
            interval,
        };

        let handle = thread::Builder::new()
            .name("jacklink-monitor".into())
            .spawn(move || monitor.run())
            .map_err(|e| BridgeError::Server(format!("Failed to spawn monitor thread: {}", e)))?;

        Ok(Self {
            command_tx,
            thread_handle: Some(handle),
        })
    }

    pub fn send(&self, cmd: MonitorCommand) -> Result<(), SendError<MonitorCommand>> {
        self.command_tx.send(cmd)
    }

    pub fn request_tick(&self) {
        let _ = self.send(MonitorCommand::TickNow);
    }

    pub fn request_reconnect(&self) {
        let _ = self.send(MonitorCommand::Reconnect);
    }

    /// Check if the monitor thread is still running
    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Stop the thread and wait for it
    pub fn shutdown(mut self) {
        self.stop_thread();
    }

    fn stop_thread(&mut self) {
        let _ = self.command_tx.send(MonitorCommand::Shutdown);
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                log::error!("Bridge monitor thread panicked");
            }
        }
    }
}

impl Drop for BridgeMonitor {
    fn drop(&mut self) {
        self.stop_thread();
    }
}

impl MonitorLoop {
    fn run(self) {
        log::info!("Bridge monitor started ({:?} interval)", self.interval);
        let mut last_state = lock(&self.bridge).current_state();

        loop {
            crossbeam::select! {
                recv(self.command_rx) -> cmd => {
                    match cmd {
                        Ok(MonitorCommand::TickNow) => {}
                        Ok(MonitorCommand::Reconnect) => {
                            if let Err(e) = lock(&self.bridge).reconnect() {
                                log::warn!("Requested reconnect failed: {}", e);
                            }
                        }
                        Ok(MonitorCommand::Shutdown) => {
                            log::info!("Bridge monitor shutting down");
                            break;
                        }
                        Err(_) => {
                            log::info!("Command channel closed, shutting down");
                            break;
                        }
                    }
                }
                default(self.interval) => {}
            }

            let state = lock(&self.bridge).tick();
            if state != last_state {
                log::debug!("Monitor observed {} -> {}", last_state, state);
                last_state = state;
            }
            if state == BridgeState::Stopped {
                log::info!("Bridge stopped, monitor exiting");
                break;
            }
        }

        log::info!("Bridge monitor stopped");
    }
}
