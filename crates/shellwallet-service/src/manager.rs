//! Top-level wallet service coordinator
//!
//! Wires the port allocator, config writer, process supervisor, sync
//! worker bridge, session, fusion coordinator, and RPC client into the
//! operations the consumer layer calls.

use crate::config::{ConfigWriter, ServiceConfig, Timings};
use crate::events::{BlockProgress, SyncEvent, UpdateNotifier};
use crate::fusion::FusionCoordinator;
use crate::port::get_unused_port;
use crate::rpc::{BackupKeys, JsonRpcClient, TransferRequest, WalletRpc};
use crate::session::Session;
use crate::supervisor::{signal_pid, ServiceSupervisor};
use crate::worker::{SyncWorkerBridge, WorkerConfig};
use crate::{events::sync_status, Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, error, info};

/// Startup options for the coordinator.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Path of the wallet service binary
    pub service_bin: PathBuf,
    /// Path of the sync worker binary
    pub worker_bin: PathBuf,
    /// Host the service binds its RPC listener to
    pub host: String,
    /// RPC password for the spawned service
    pub password: String,
    /// Path of the config artifact handed to the service
    pub config_path: PathBuf,
    /// Minimum network fee, atomic units
    pub minimum_fee: u64,
    /// Default anonymity set size
    pub anonymity: u64,
    /// First port probed for the service listener
    pub start_port: u16,
    /// Verbose worker logging
    pub debug: bool,
}

/// Coordinator for the wallet service process and its sync worker.
pub struct WalletServiceManager {
    config: ServiceConfig,
    timings: Timings,
    supervisor: ServiceSupervisor,
    bridge: SyncWorkerBridge,
    session: Arc<Session>,
    notifier: Arc<UpdateNotifier>,
    rpc: Arc<dyn WalletRpc>,
    fusion: FusionCoordinator,
    config_writer: ConfigWriter,
    debug: bool,
}

impl WalletServiceManager {
    /// Allocate a listen port and assemble the coordinator with the
    /// production RPC client.
    pub fn init(opts: ManagerOptions, timings: Timings) -> Result<Self> {
        let port = get_unused_port(opts.start_port)?;
        let config = ServiceConfig {
            host: opts.host.clone(),
            port,
            password: opts.password.clone(),
            minimum_fee: opts.minimum_fee,
            anonymity: opts.anonymity,
        };
        let rpc: Arc<dyn WalletRpc> = Arc::new(JsonRpcClient::new(&config, &timings)?);
        Ok(Self::assemble(opts, config, timings, rpc))
    }

    /// Assemble the coordinator around an explicit RPC implementation.
    ///
    /// Seam for tests and for callers owning their own transport.
    pub fn with_rpc(
        opts: ManagerOptions,
        config: ServiceConfig,
        timings: Timings,
        rpc: Arc<dyn WalletRpc>,
    ) -> Self {
        Self::assemble(opts, config, timings, rpc)
    }

    fn assemble(
        opts: ManagerOptions,
        config: ServiceConfig,
        timings: Timings,
        rpc: Arc<dyn WalletRpc>,
    ) -> Self {
        let session = Arc::new(Session::new());
        session.update(|s| s.wallet_config_path = Some(opts.config_path.clone()));
        let notifier = Arc::new(UpdateNotifier::new());
        let fusion = FusionCoordinator::new(
            Arc::clone(&rpc),
            Arc::clone(&session),
            Arc::clone(&notifier),
            timings.fusion_tx_delay,
        );
        Self {
            supervisor: ServiceSupervisor::new(opts.service_bin),
            bridge: SyncWorkerBridge::new(
                opts.worker_bin,
                Arc::clone(&session),
                Arc::clone(&notifier),
            ),
            config_writer: ConfigWriter::new(opts.config_path),
            session,
            notifier,
            rpc,
            fusion,
            config,
            timings,
            debug: opts.debug,
        }
    }

    /// Active service configuration.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Shared session store.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Update notifier the consumer layer subscribes to.
    pub fn notifier(&self) -> &Arc<UpdateNotifier> {
        &self.notifier
    }

    /// Process supervisor.
    pub fn supervisor(&self) -> &ServiceSupervisor {
        &self.supervisor
    }

    /// Sync worker bridge.
    pub fn worker(&self) -> &SyncWorkerBridge {
        &self.bridge
    }

    /// Fusion coordinator.
    pub fn fusion(&self) -> &FusionCoordinator {
        &self.fusion
    }

    /// Spawn the wallet service and the sync worker.
    pub async fn start_service(&self) -> Result<u32> {
        self.config_writer.write(&[
            ("rpc-bind-ip", self.config.host.clone()),
            ("rpc-bind-port", self.config.port.to_string()),
            ("rpc-password", self.config.password.clone()),
        ])?;

        let pid = self.supervisor.start(&self.config.default_args()).await?;
        self.start_sync_worker().await?;
        Ok(pid)
    }

    /// Spawn a fresh sync worker wired to the current service config.
    pub async fn start_sync_worker(&self) -> Result<()> {
        self.bridge
            .start(WorkerConfig {
                service_host: self.config.host.clone(),
                service_port: self.config.port,
                service_password: self.config.password.clone(),
                debug: self.debug,
            })
            .await
    }

    /// Graceful shutdown sequence.
    ///
    /// Not running: reinitialize the session and resolve true without
    /// touching save or terminate. Running: stop the worker, ask the
    /// service to save; on save failure wait the grace period and
    /// force-terminate anyway. Save is best-effort, shutdown never
    /// hangs.
    pub async fn stop_service(&self) -> Result<bool> {
        debug!("Stopping wallet service");
        if !self.supervisor.is_running().await {
            debug!("Service is not running");
            self.reinit_session();
            return Ok(true);
        }

        self.bridge.stop().await;
        if let Err(e) = self.rpc.save().await {
            debug!("Failed to save wallet before shutdown: {}", e);
            sleep(self.timings.shutdown_grace).await;
        } else {
            debug!("Wallet saved");
        }
        self.supervisor.terminate(true).await;
        self.reinit_session();
        Ok(true)
    }

    /// React to a network-state change.
    ///
    /// Disconnect pauses the worker and leaves the service running.
    /// Reconnect kills and respawns the service: it is known to stall
    /// irrecoverably after a disconnect. Two delay stages keep the
    /// respawn clear of a half-torn-down process table entry.
    pub async fn network_state_update(&self, connected: bool) -> Result<()> {
        debug!("Network state update, connected={}", connected);
        if !connected {
            self.bridge.pause().await;
            return Ok(());
        }

        let args = self.supervisor.active_args();
        self.supervisor.mark_respawning();
        self.supervisor.terminate(false).await;
        self.config_writer.wipe();

        sleep(self.timings.respawn_teardown_delay).await;
        if let Some(pid) = self.supervisor.last_pid() {
            // The handle is gone by now; the cached pid is the only
            // remaining kill target.
            signal_pid(pid, true).await;
            self.config_writer.wipe();
        }

        sleep(self.timings.respawn_spawn_delay).await;
        info!("Respawning wallet service");
        match self.supervisor.start(&args).await {
            Ok(pid) => {
                debug!("Service respawned (pid {})", pid);
                self.bridge.resume().await;
                Ok(())
            }
            Err(e) => {
                error!("Respawn failed: {}", e);
                Err(e)
            }
        }
    }

    /// Run the fusion optimization protocol.
    pub async fn optimize_wallet(&self) -> Result<String> {
        self.fusion.optimize_wallet().await
    }

    /// Wipe scan state and rescan from `scan_height`.
    ///
    /// The sync-related session fields are cleared and a reset
    /// sentinel published whether or not the RPC succeeds; the
    /// resolved bool reports the RPC outcome.
    pub async fn rescan_wallet(&self, scan_height: u64) -> Result<bool> {
        let outcome = self.rpc.reset(Some(scan_height)).await;

        self.session.update(|s| {
            s.wallet_unlocked_balance = 0;
            s.wallet_locked_balance = 0;
            s.synchronized = false;
            s.tx_list.clear();
            s.tx_last_hash = None;
            s.tx_last_timestamp = None;
        });
        self.notifier.publish(SyncEvent::BlockUpdated {
            data: BlockProgress::sentinel(sync_status::RESET),
        });

        match outcome {
            Ok(()) => Ok(true),
            Err(e) => {
                debug!("Rescan reset failed: {}", e);
                Ok(false)
            }
        }
    }

    /// Import a wallet from a view/spend key pair by running the
    /// service binary in generate mode.
    pub async fn import_from_keys(
        &self,
        wallet_file: &Path,
        password: &str,
        view_key: &str,
        spend_key: &str,
        scan_height: Option<u64>,
    ) -> Result<PathBuf> {
        let extra = vec![
            "--view-key".to_string(),
            view_key.to_string(),
            "--spend-key".to_string(),
            spend_key.to_string(),
        ];
        self.run_import(wallet_file, password, extra, scan_height)
            .await
    }

    /// Import a wallet from a mnemonic seed by running the service
    /// binary in generate mode.
    pub async fn import_from_seed(
        &self,
        wallet_file: &Path,
        password: &str,
        mnemonic_seed: &str,
        scan_height: Option<u64>,
    ) -> Result<PathBuf> {
        let extra = vec!["--mnemonic-seed".to_string(), mnemonic_seed.to_string()];
        self.run_import(wallet_file, password, extra, scan_height)
            .await
    }

    async fn run_import(
        &self,
        wallet_file: &Path,
        password: &str,
        extra: Vec<String>,
        scan_height: Option<u64>,
    ) -> Result<PathBuf> {
        let log_file = std::env::temp_dir().join("shellwallet-import.log");
        let mut args = self.config.default_args();
        args.extend([
            "-g".to_string(),
            "-w".to_string(),
            wallet_file.display().to_string(),
            "-p".to_string(),
            password.to_string(),
        ]);
        args.extend(extra);
        args.extend([
            "--log-level".to_string(),
            "0".to_string(),
            "--log-file".to_string(),
            log_file.display().to_string(),
        ]);
        if let Some(height) = scan_height {
            args.extend(["--scan-height".to_string(), height.to_string()]);
        }

        let output = tokio::process::Command::new(self.supervisor.binary_path())
            .args(&args)
            .output()
            .await
            .map_err(|e| Error::ImportFailed(format!("import subprocess failed: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!("Import subprocess stderr: {}", stderr);
            return Err(Error::ImportFailed(
                "import subprocess exited with an error".to_string(),
            ));
        }
        if !is_regular_writable_file(wallet_file) {
            return Err(Error::ImportFailed(format!(
                "no writable wallet produced at {}",
                wallet_file.display()
            )));
        }
        Ok(wallet_file.to_path_buf())
    }

    /// Create an integrated address. Defaults to the loaded wallet
    /// address when `address` is unset.
    pub async fn gen_integrated_address(
        &self,
        payment_id: &str,
        address: Option<String>,
    ) -> Result<String> {
        let address = match address {
            Some(a) => a,
            None => self.session.get(|s| s.loaded_wallet_address.clone()),
        };
        self.rpc.create_integrated_address(&address, payment_id).await
    }

    /// Fetch the secret keys backing `address`.
    pub async fn get_secret_keys(&self, address: &str) -> Result<BackupKeys> {
        self.rpc.get_backup_keys(address).await.map_err(|e| {
            debug!("Failed to get backup keys: {}", e);
            e
        })
    }

    /// Send a normal transfer through the service.
    pub async fn send_transaction(&self, request: &TransferRequest) -> Result<String> {
        self.rpc.send_transaction(request).await
    }

    /// Wipe the config artifact, reset the session, and announce the
    /// reset to the consumer layer.
    pub fn reinit_session(&self) {
        self.config_writer.wipe();
        self.session.reset();
        self.notifier.publish(SyncEvent::SectionChanged {
            data: "reset".to_string(),
        });
    }
}

fn is_regular_writable_file(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && !meta.permissions().readonly(),
        Err(_) => false,
    }
}
