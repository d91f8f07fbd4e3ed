//! Service connection configuration and the on-disk config artifact

use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[cfg(windows)]
const EOL: &str = "\r\n";
#[cfg(not(windows))]
const EOL: &str = "\n";

/// Connection parameters for the spawned wallet service.
///
/// Created once port allocation succeeds; immutable until the service
/// is restarted with a fresh config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// RPC listen host
    pub host: String,
    /// RPC listen port
    pub port: u16,
    /// RPC password
    pub password: String,
    /// Minimum network fee, in atomic units
    pub minimum_fee: u64,
    /// Default anonymity set size (mixin)
    pub anonymity: u64,
}

impl ServiceConfig {
    /// RPC endpoint URL for this configuration.
    pub fn rpc_url(&self) -> String {
        format!("http://{}:{}/json_rpc", self.host, self.port)
    }

    /// Default service argument list derived from this configuration.
    pub fn default_args(&self) -> Vec<String> {
        vec!["--rpc-password".to_string(), self.password.clone()]
    }
}

/// Fixed delays used by the coordinator.
///
/// `Default` carries the production values; tests substitute shorter
/// ones.
#[derive(Debug, Clone)]
pub struct Timings {
    /// Pause between consecutive fusion transactions
    pub fusion_tx_delay: Duration,
    /// Settle time before killing the stalled service by pid on respawn
    pub respawn_teardown_delay: Duration,
    /// Wait before spawning the fresh service process on respawn
    pub respawn_spawn_delay: Duration,
    /// Grace period when the shutdown save call fails
    pub shutdown_grace: Duration,
    /// Per-request RPC timeout
    pub rpc_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            fusion_tx_delay: Duration::from_millis(2400),
            respawn_teardown_delay: Duration::from_millis(2500),
            respawn_spawn_delay: Duration::from_secs(15),
            shutdown_grace: Duration::from_secs(8),
            rpc_timeout: Duration::from_secs(30),
        }
    }
}

/// Writer for the key=value config artifact consumed by the service.
#[derive(Debug, Clone)]
pub struct ConfigWriter {
    path: PathBuf,
}

impl ConfigWriter {
    /// Create a writer targeting `path`.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Path of the config artifact.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `entries` as key=value lines, platform line endings.
    pub fn write(&self, entries: &[(&str, String)]) -> Result<&Path> {
        let mut data = String::new();
        for (key, value) in entries {
            data.push_str(key);
            data.push('=');
            data.push_str(value);
            data.push_str(EOL);
        }
        std::fs::write(&self.path, data)?;
        Ok(&self.path)
    }

    /// Render a CLI argument list to ini form: `--a x --b y` becomes
    /// `a=x` and `b=y` on separate lines.
    pub fn args_to_ini(args: &[String]) -> String {
        let mut data = String::new();
        for (i, arg) in args.iter().enumerate() {
            let sep = if i % 2 == 0 { EOL } else { "=" };
            data.push_str(sep);
            data.push_str(arg.trim_start_matches("--"));
        }
        data.trim().to_string()
    }

    /// Remove the config artifact. A missing file is "no active
    /// config", not an error.
    pub fn wipe(&self) {
        if let Ok(()) = std::fs::remove_file(&self.path) {
            debug!("Wiped service config at {}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_wipe() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ConfigWriter::new(dir.path().join("service.conf"));

        writer
            .write(&[
                ("rpc-password", "hunter2".to_string()),
                ("bind-port", "10101".to_string()),
            ])
            .unwrap();

        let data = std::fs::read_to_string(writer.path()).unwrap();
        assert!(data.contains("rpc-password=hunter2"));
        assert!(data.contains("bind-port=10101"));

        writer.wipe();
        assert!(!writer.path().exists());
        // Second wipe is a no-op, not an error.
        writer.wipe();
    }

    #[test]
    fn test_args_to_ini() {
        let args = vec![
            "--rpc-password".to_string(),
            "hunter2".to_string(),
            "--log-level".to_string(),
            "0".to_string(),
        ];
        assert_eq!(
            ConfigWriter::args_to_ini(&args),
            format!("rpc-password=hunter2{}log-level=0", EOL)
        );
    }

    #[test]
    fn test_default_timings() {
        let timings = Timings::default();
        assert_eq!(timings.fusion_tx_delay, Duration::from_millis(2400));
        assert_eq!(timings.shutdown_grace, Duration::from_secs(8));
        assert_eq!(timings.respawn_spawn_delay, Duration::from_secs(15));
    }
}
