//! Wallet service process supervision
//!
//! Spawns and terminates the external wallet daemon. The process id is
//! cached separately from the child handle: a handle can be lost (or
//! already reaped) while the OS process lives on, so termination is
//! always attempted along both paths.

use crate::{Error, Result};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// How long a gracefully signaled process gets to exit before the
/// forceful escalation.
const GRACEFUL_EXIT_WINDOW: Duration = Duration::from_secs(5);

/// Service process state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Not started
    Stopped,
    /// Spawn in progress
    Starting,
    /// Process handle tracked
    Running,
    /// Termination in progress
    Stopping,
    /// Network-loss recovery cycle in progress
    Respawning,
}

/// Supervisor for the external wallet service process.
pub struct ServiceSupervisor {
    binary: PathBuf,
    state: RwLock<ServiceState>,
    process: tokio::sync::Mutex<Option<Child>>,
    pid: RwLock<Option<u32>>,
    last_pid: RwLock<Option<u32>>,
    active_args: RwLock<Vec<String>>,
}

impl ServiceSupervisor {
    /// Create a supervisor for the service binary at `binary`.
    pub fn new(binary: PathBuf) -> Self {
        Self {
            binary,
            state: RwLock::new(ServiceState::Stopped),
            process: tokio::sync::Mutex::new(None),
            pid: RwLock::new(None),
            last_pid: RwLock::new(None),
            active_args: RwLock::new(Vec::new()),
        }
    }

    /// Path of the service binary.
    pub fn binary_path(&self) -> &Path {
        &self.binary
    }

    /// Current state.
    pub fn state(&self) -> ServiceState {
        *self.state.read()
    }

    /// Mark the start of a network-loss recovery cycle.
    pub fn mark_respawning(&self) {
        *self.state.write() = ServiceState::Respawning;
    }

    /// Pid recorded at the last successful spawn, if the process has
    /// not been terminated since.
    pub fn pid(&self) -> Option<u32> {
        *self.pid.read()
    }

    /// Pid of the most recently terminated (or current) process.
    pub fn last_pid(&self) -> Option<u32> {
        *self.last_pid.read()
    }

    /// Arguments the current (or last) process was spawned with.
    pub fn active_args(&self) -> Vec<String> {
        self.active_args.read().clone()
    }

    /// True iff a process handle is currently tracked.
    ///
    /// Advisory only: the OS process may have exited without the
    /// supervisor noticing. Use [`is_process_listed`] for a
    /// best-effort OS-level check.
    ///
    /// [`is_process_listed`]: Self::is_process_listed
    pub async fn is_running(&self) -> bool {
        self.process.lock().await.is_some()
    }

    /// Spawn the service with `args`.
    pub async fn start(&self, args: &[String]) -> Result<u32> {
        verify_executable(&self.binary)?;

        *self.state.write() = ServiceState::Starting;
        info!("Starting wallet service: {}", self.binary.display());

        let child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                *self.state.write() = ServiceState::Stopped;
                Error::ExecutableNotFound(format!("{}: {}", self.binary.display(), e))
            })?;

        let pid = child.id().ok_or_else(|| {
            *self.state.write() = ServiceState::Stopped;
            Error::Worker("service exited before a pid could be read".to_string())
        })?;

        info!("Wallet service spawned (pid {})", pid);
        *self.process.lock().await = Some(child);
        *self.pid.write() = Some(pid);
        *self.last_pid.write() = Some(pid);
        *self.active_args.write() = args.to_vec();
        *self.state.write() = ServiceState::Running;

        Ok(pid)
    }

    /// Terminate the tracked process.
    ///
    /// Unless `force`, a graceful termination signal goes to the
    /// cached pid first and the process gets a short window to exit on
    /// its own. A failed graceful signal, an expired window, or
    /// `force` escalates to a forceful kill along two independent
    /// best-effort paths: the child handle and the cached pid. Either
    /// may be the only one that works depending on handle validity.
    /// Failures are swallowed; termination is reported as attempted,
    /// not confirmed. Both the handle and the cached pid are cleared
    /// afterwards; a respawn cycle stays observable as `Respawning`
    /// throughout.
    pub async fn terminate(&self, force: bool) {
        let mut guard = self.process.lock().await;
        let pid = *self.pid.read();
        if guard.is_none() && pid.is_none() {
            return;
        }

        let respawning = self.state() == ServiceState::Respawning;
        if !respawning {
            *self.state.write() = ServiceState::Stopping;
        }
        if let Some(p) = pid {
            *self.last_pid.write() = Some(p);
        }

        let gracefully_signaled = match (force, pid) {
            (false, Some(p)) => send_signal(p, false).await,
            _ => false,
        };

        let mut child = guard.take();
        let mut exited = false;
        if gracefully_signaled {
            debug!("Graceful termination signal delivered to pid {:?}", pid);
            match child.as_mut() {
                Some(child) => {
                    // The wait inside the window also reaps on success.
                    exited = tokio::time::timeout(GRACEFUL_EXIT_WINDOW, child.wait())
                        .await
                        .is_ok();
                    if !exited {
                        debug!("Process ignored the graceful signal, escalating");
                    }
                }
                // Pid-only target: the signal was delivered, nothing
                // left to observe.
                None => exited = true,
            }
        }

        if let Some(mut child) = child {
            if !exited {
                match child.start_kill() {
                    Ok(()) => debug!("Kill signal delivered via handle"),
                    Err(e) => debug!("Handle kill failed (process gone?): {}", e),
                }
                // Reap so no zombie survives the handle.
                let _ = child.wait().await;
            }
        }
        if !exited {
            if let Some(p) = pid {
                signal_pid(p, true).await;
            }
        }

        *self.pid.write() = None;
        if !respawning {
            *self.state.write() = ServiceState::Stopped;
        }
        info!("Wallet service termination attempted (last pid {:?})", self.last_pid());
    }

    /// Best-effort OS process-table check for the service binary.
    ///
    /// Diagnostic only, never authoritative.
    pub async fn is_process_listed(&self) -> bool {
        let Some(name) = self.binary.file_name().and_then(|n| n.to_str()) else {
            return false;
        };

        #[cfg(windows)]
        let output = Command::new("tasklist").output().await;
        #[cfg(not(windows))]
        let output = Command::new("ps").arg("-A").output().await;

        match output {
            Ok(out) => String::from_utf8_lossy(&out.stdout)
                .to_lowercase()
                .contains(&name.to_lowercase()),
            Err(e) => {
                debug!("Process listing failed: {}", e);
                false
            }
        }
    }
}

/// Kill `pid` by number, graceful first unless `force`, escalating to
/// a forceful kill when the graceful signal fails. All failures are
/// swallowed.
pub async fn signal_pid(pid: u32, force: bool) {
    if !force && !send_signal(pid, false).await {
        debug!("Graceful signal to pid {} failed, escalating", pid);
        send_signal(pid, true).await;
        return;
    }
    if force {
        send_signal(pid, true).await;
    }
}

#[cfg(windows)]
async fn send_signal(pid: u32, force: bool) -> bool {
    let mut cmd = Command::new("taskkill");
    cmd.arg("/PID").arg(pid.to_string());
    if force {
        cmd.arg("/F");
    }
    matches!(cmd.output().await, Ok(out) if out.status.success())
}

#[cfg(not(windows))]
async fn send_signal(pid: u32, force: bool) -> bool {
    let signal = if force { "KILL" } else { "TERM" };
    matches!(
        Command::new("kill")
            .arg("-s")
            .arg(signal)
            .arg(pid.to_string())
            .output()
            .await,
        Ok(out) if out.status.success()
    )
}

fn verify_executable(path: &Path) -> Result<()> {
    let meta = std::fs::metadata(path)
        .map_err(|_| Error::ExecutableNotFound(path.display().to_string()))?;
    if !meta.is_file() {
        return Err(Error::ExecutableNotFound(path.display().to_string()));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            warn!("Service binary is not executable: {}", path.display());
            return Err(Error::ExecutableNotFound(path.display().to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_with_missing_binary() {
        let supervisor = ServiceSupervisor::new(PathBuf::from("/nonexistent/walletd"));
        let result = supervisor.start(&[]).await;
        assert!(matches!(result, Err(Error::ExecutableNotFound(_))));
        assert_eq!(supervisor.state(), ServiceState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_with_non_executable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("walletd");
        std::fs::write(&path, b"not a binary").unwrap();

        let supervisor = ServiceSupervisor::new(path);
        let result = supervisor.start(&[]).await;
        assert!(matches!(result, Err(Error::ExecutableNotFound(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_lifecycle_records_and_clears_pid() {
        let supervisor = ServiceSupervisor::new(PathBuf::from("/bin/sleep"));
        let pid = supervisor.start(&["30".to_string()]).await.unwrap();
        assert!(supervisor.is_running().await);
        assert_eq!(supervisor.pid(), Some(pid));
        assert_eq!(supervisor.state(), ServiceState::Running);

        supervisor.terminate(true).await;
        assert!(!supervisor.is_running().await);
        assert_eq!(supervisor.pid(), None);
        assert_eq!(supervisor.last_pid(), Some(pid));
        assert_eq!(supervisor.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_terminate_when_stopped_is_noop() {
        let supervisor = ServiceSupervisor::new(PathBuf::from("/bin/sleep"));
        supervisor.terminate(true).await;
        assert_eq!(supervisor.state(), ServiceState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_graceful_terminate_delivers_termination_signal() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("received-term");
        let script = dir.path().join("walletd.sh");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\ntrap 'touch {}; exit 0' TERM\nwhile true; do sleep 0.05; done\n",
                marker.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let supervisor = ServiceSupervisor::new(script);
        supervisor.start(&[]).await.unwrap();
        // Give the shell time to install its trap before signaling.
        tokio::time::sleep(Duration::from_millis(200)).await;

        supervisor.terminate(false).await;

        assert!(marker.exists(), "process never saw the graceful signal");
        assert!(!supervisor.is_running().await);
        assert_eq!(supervisor.state(), ServiceState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_respawn_cycle_state_survives_termination() {
        let supervisor = ServiceSupervisor::new(PathBuf::from("/bin/sleep"));
        supervisor.start(&["30".to_string()]).await.unwrap();

        supervisor.mark_respawning();
        supervisor.terminate(true).await;

        assert!(!supervisor.is_running().await);
        assert_eq!(supervisor.pid(), None);
        // The recovery cycle stays visible until the fresh spawn.
        assert_eq!(supervisor.state(), ServiceState::Respawning);

        supervisor.start(&["30".to_string()]).await.unwrap();
        assert_eq!(supervisor.state(), ServiceState::Running);
        supervisor.terminate(true).await;
        assert_eq!(supervisor.state(), ServiceState::Stopped);
    }
}
