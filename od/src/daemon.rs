//! Daemon process management
//!
//! Pid-file bookkeeping so `od stop` can signal a running orchestrator.

use std::path::PathBuf;

use eyre::{Context, Result};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{info, warn};

/// Manages the orchestrator pid file
pub struct DaemonManager {
    pid_path: PathBuf,
}

impl DaemonManager {
    /// Pid file under the default data dir
    pub fn new() -> Self {
        let pid_path = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("orchd")
            .join("orchd.pid");
        Self { pid_path }
    }

    /// Pid file at an explicit path (tests)
    pub fn with_path(pid_path: PathBuf) -> Self {
        Self { pid_path }
    }

    /// Record this process as the running orchestrator
    pub fn write_pid(&self) -> Result<()> {
        if let Some(parent) = self.pid_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create pid dir")?;
        }
        std::fs::write(&self.pid_path, std::process::id().to_string()).context("Failed to write pid file")?;
        Ok(())
    }

    /// Pid of the running orchestrator, if one is alive
    pub fn running_pid(&self) -> Option<i32> {
        let pid: i32 = std::fs::read_to_string(&self.pid_path).ok()?.trim().parse().ok()?;
        // Signal 0 probes existence without touching the process
        match kill(Pid::from_raw(pid), None) {
            Ok(()) => Some(pid),
            Err(_) => None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running_pid().is_some()
    }

    /// Signal the running orchestrator to shut down
    ///
    /// Returns false if nothing is running (a stale pid file is cleared).
    pub fn stop(&self) -> Result<bool> {
        let Some(pid) = self.running_pid() else {
            if self.pid_path.exists() {
                warn!("Clearing stale pid file");
                let _ = std::fs::remove_file(&self.pid_path);
            }
            return Ok(false);
        };

        kill(Pid::from_raw(pid), Signal::SIGTERM).context("Failed to signal orchestrator")?;
        info!(pid, "Sent SIGTERM");
        Ok(true)
    }

    /// Remove the pid file on clean exit
    pub fn clear(&self) {
        let _ = std::fs::remove_file(&self.pid_path);
    }
}

impl Default for DaemonManager {
    fn default() -> Self {
        Self::new()
    }
}
