//! Launching and stopping a local `jackd`
//!
//! Only processes launched by this controller are managed; an already
//! running server is left alone.

use std::process::{Child, Command, Stdio};

use crate::config::ServerSettings;
use crate::error::{BridgeError, BridgeResult};

/// Owns a `jackd` child process
pub struct JackdController {
    settings: ServerSettings,
    child: Option<Child>,
}

impl JackdController {
    pub fn new(settings: ServerSettings) -> Self {
        Self {
            settings,
            child: None,
        }
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Arguments passed to `jackd`
    ///
    /// `-d <driver>` ends the server options; everything after it is a
    /// driver option (device, rate, period).
    pub fn command_args(&self) -> Vec<String> {
        let mut args = vec!["-d".to_string(), self.settings.backend_driver.clone()];
        if let Some(device) = &self.settings.device {
            args.push("-d".to_string());
            args.push(device.clone());
        }
        args.push("-r".to_string());
        args.push(self.settings.sample_rate.to_string());
        args.push("-p".to_string());
        args.push(self.settings.buffer_size.to_string());
        args
    }

    /// Launch `jackd` unless our child is already running
    pub fn start(&mut self) -> BridgeResult<()> {
        if self.is_running() {
            return Ok(());
        }
        let args = self.command_args();
        log::info!("Starting {} {}", self.settings.jackd_path, args.join(" "));

        let child = Command::new(&self.settings.jackd_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                BridgeError::Server(format!("Failed to launch {}: {}", self.settings.jackd_path, e))
            })?;

        log::info!("jackd started (pid {})", child.id());
        self.child = Some(child);
        Ok(())
    }

    /// Kill our child, if any
    pub fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let pid = child.id();
        if let Err(e) = child.kill() {
            log::debug!("jackd (pid {}) already exited: {}", pid, e);
        }
        match child.wait() {
            Ok(status) => log::info!("jackd (pid {}) stopped: {}", pid, status),
            Err(e) => log::warn!("Failed to reap jackd (pid {}): {}", pid, e),
        }
    }

    pub fn restart(&mut self) -> BridgeResult<()> {
        self.stop();
        self.start()
    }

    /// Whether our child process is still alive
    pub fn is_running(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                log::warn!("jackd exited: {}", status);
                self.child = None;
                false
            }
            Err(e) => {
                log::warn!("Failed to query jackd status: {}", e);
                false
            }
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// First line of `jackd --version`
    pub fn version(&self) -> BridgeResult<String> {
        let output = Command::new(&self.settings.jackd_path)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                BridgeError::Server(format!("Failed to run {}: {}", self.settings.jackd_path, e))
            })?;

        // jackd1 prints the version to stderr
        let text = if output.stdout.is_empty() {
            String::from_utf8_lossy(&output.stderr).into_owned()
        } else {
            String::from_utf8_lossy(&output.stdout).into_owned()
        };
        parse_version(&text)
            .ok_or_else(|| BridgeError::Server("jackd printed no version".to_string()))
    }
}

impl Drop for JackdController {
    fn drop(&mut self) {
        if self.settings.stop_on_shutdown {
            self.stop();
        }
    }
}

fn parse_version(text: &str) -> Option<String> {
    let line = text
        .lines()
        .map(str::trim)
        .find(|l| l.contains("version"))
        .or_else(|| text.lines().map(str::trim).find(|l| !l.is_empty()))?;
    Some(line.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_args() {
        let settings = ServerSettings {
            backend_driver: "alsa".to_string(),
            device: Some("hw:1".to_string()),
            sample_rate: 44100,
            buffer_size: 128,
            ..Default::default()
        };
        let controller = JackdController::new(settings);
        assert_eq!(
            controller.command_args(),
            vec!["-d", "alsa", "-d", "hw:1", "-r", "44100", "-p", "128"]
        );
    }

    #[test]
    fn test_command_args_without_device() {
        let settings = ServerSettings {
            backend_driver: "dummy".to_string(),
            ..Default::default()
        };
        let args = JackdController::new(settings).command_args();
        assert_eq!(args[..2], ["-d", "dummy"]);
        assert_eq!(args.len(), 6);
    }

    #[test]
    fn test_missing_executable() {
        let settings = ServerSettings {
            jackd_path: "/nonexistent/jackd".to_string(),
            ..Default::default()
        };
        let mut controller = JackdController::new(settings);
        assert!(matches!(controller.start(), Err(BridgeError::Server(_))));
        assert!(controller.version().is_err());
        assert!(!controller.is_running());
        assert!(controller.pid().is_none());
        controller.stop();
    }

    #[test]
    fn test_parse_version() {
        let text = "jackdmp 1.9.21\nCopyright 2001-2005 Paul Davis and others.\njackdmp version 1.9.21 tmpdir /dev/shm protocol 8\n";
        assert_eq!(
            parse_version(text).as_deref(),
            Some("jackdmp version 1.9.21 tmpdir /dev/shm protocol 8")
        );
        assert_eq!(parse_version("1.9.22\n").as_deref(), Some("1.9.22"));
        assert_eq!(parse_version("\n  \n"), None);
    }
}
