//! Shutdown and respawn sequencing against a stub RPC and stand-in
//! binaries.

#![cfg(unix)]

use async_trait::async_trait;
use shellwallet_service::{
    Balance, BackupKeys, Error, FusionEstimate, ManagerOptions, NodeStatus, Result,
    ServiceConfig, Timings, TransactionEntry, TransferRequest, WalletRpc, WalletServiceManager,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct StubRpc {
    save_calls: AtomicUsize,
    save_fails: bool,
    reset_fails: bool,
}

impl StubRpc {
    fn new() -> Self {
        Self {
            save_calls: AtomicUsize::new(0),
            save_fails: false,
            reset_fails: false,
        }
    }

    fn failing_save() -> Self {
        Self {
            save_fails: true,
            ..Self::new()
        }
    }

    fn save_count(&self) -> usize {
        self.save_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WalletRpc for StubRpc {
    async fn save(&self) -> Result<()> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        if self.save_fails {
            Err(Error::RpcTimeout("save: service unreachable".to_string()))
        } else {
            Ok(())
        }
    }
    async fn reset(&self, _scan_height: Option<u64>) -> Result<()> {
        if self.reset_fails {
            Err(Error::RpcTimeout("reset: service unreachable".to_string()))
        } else {
            Ok(())
        }
    }
    async fn estimate_fusion(&self, _threshold: u64) -> Result<FusionEstimate> {
        Ok(FusionEstimate {
            fusion_ready_count: 0,
            total_outputs_count: 0,
        })
    }
    async fn send_fusion_transaction(&self, _threshold: u64) -> Result<String> {
        Err(Error::Rpc("index is out of range".to_string()))
    }
    async fn create_integrated_address(&self, address: &str, payment_id: &str) -> Result<String> {
        Ok(format!("{}+{}", address, payment_id))
    }
    async fn get_backup_keys(&self, _address: &str) -> Result<BackupKeys> {
        Ok(BackupKeys {
            view_secret_key: "view".to_string(),
            spend_secret_key: Some("spend".to_string()),
            mnemonic_seed: None,
        })
    }
    async fn send_transaction(&self, _request: &TransferRequest) -> Result<String> {
        Ok("txhash".to_string())
    }
    async fn get_status(&self) -> Result<NodeStatus> {
        Ok(NodeStatus {
            block_count: 100,
            known_block_count: 100,
            peer_count: 8,
        })
    }
    async fn get_balance(&self) -> Result<Balance> {
        Ok(Balance {
            available_balance: 0,
            locked_amount: 0,
        })
    }
    async fn get_transactions(&self, _f: u64, _c: u64) -> Result<Vec<TransactionEntry>> {
        Ok(Vec::new())
    }
}

fn short_timings() -> Timings {
    Timings {
        fusion_tx_delay: Duration::from_millis(1),
        respawn_teardown_delay: Duration::from_millis(20),
        respawn_spawn_delay: Duration::from_millis(30),
        shutdown_grace: Duration::from_millis(100),
        rpc_timeout: Duration::from_secs(1),
    }
}

fn manager_with(rpc: StubRpc, config_dir: &std::path::Path) -> (WalletServiceManager, Arc<StubRpc>) {
    let rpc = Arc::new(rpc);
    let opts = ManagerOptions {
        service_bin: PathBuf::from("/bin/sleep"),
        worker_bin: PathBuf::from("/bin/cat"),
        host: "127.0.0.1".to_string(),
        password: "testpass".to_string(),
        config_path: config_dir.join("service.conf"),
        minimum_fee: 10,
        anonymity: 3,
        start_port: 10101,
        debug: false,
    };
    let config = ServiceConfig {
        host: opts.host.clone(),
        port: 10101,
        password: opts.password.clone(),
        minimum_fee: opts.minimum_fee,
        anonymity: opts.anonymity,
    };
    let manager = WalletServiceManager::with_rpc(
        opts,
        config,
        short_timings(),
        Arc::clone(&rpc) as Arc<dyn WalletRpc>,
    );
    (manager, rpc)
}

#[tokio::test]
async fn stop_service_when_not_running_skips_save_and_terminate() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, rpc) = manager_with(StubRpc::new(), dir.path());

    manager.session().update(|s| {
        s.synchronized = true;
        s.sync_started = true;
    });

    let started = Instant::now();
    let stopped = manager.stop_service().await.unwrap();

    assert!(stopped);
    assert_eq!(rpc.save_count(), 0);
    assert!(started.elapsed() < Duration::from_millis(90));
    // Session was reinitialized on the way out.
    let state = manager.session().snapshot();
    assert!(!state.synchronized);
    assert!(!state.sync_started);
}

#[tokio::test]
async fn stop_service_saves_then_terminates() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, rpc) = manager_with(StubRpc::new(), dir.path());

    manager.supervisor().start(&["30".to_string()]).await.unwrap();

    let started = Instant::now();
    let stopped = manager.stop_service().await.unwrap();

    assert!(stopped);
    assert_eq!(rpc.save_count(), 1);
    // Save succeeded: no grace delay on this path.
    assert!(started.elapsed() < Duration::from_millis(90));
    assert!(!manager.supervisor().is_running().await);
}

#[tokio::test]
async fn stop_service_with_failing_save_waits_grace_then_force_kills() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, rpc) = manager_with(StubRpc::failing_save(), dir.path());

    manager.supervisor().start(&["30".to_string()]).await.unwrap();
    manager.session().update(|s| s.synchronized = true);

    let started = Instant::now();
    let stopped = manager.stop_service().await.unwrap();

    assert!(stopped);
    assert_eq!(rpc.save_count(), 1);
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(!manager.supervisor().is_running().await);
    assert!(!manager.session().get(|s| s.synchronized));
}

#[tokio::test]
async fn disconnect_pauses_without_terminating_the_service() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _) = manager_with(StubRpc::new(), dir.path());

    let pid = manager.supervisor().start(&["30".to_string()]).await.unwrap();
    manager.network_state_update(false).await.unwrap();

    assert!(manager.supervisor().is_running().await);
    assert_eq!(manager.supervisor().pid(), Some(pid));

    manager.supervisor().terminate(true).await;
}

#[tokio::test]
async fn reconnect_respawns_with_a_fresh_pid() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _) = manager_with(StubRpc::new(), dir.path());

    let old_pid = manager.supervisor().start(&["30".to_string()]).await.unwrap();

    let started = Instant::now();
    manager.network_state_update(true).await.unwrap();

    // Both delay stages were respected.
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(manager.supervisor().is_running().await);
    let new_pid = manager.supervisor().pid().expect("respawned pid");
    assert_ne!(new_pid, old_pid);

    manager.supervisor().terminate(true).await;
}

#[tokio::test]
async fn rescan_resets_sync_state_and_reports_rpc_outcome() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _) = manager_with(StubRpc::new(), dir.path());
    let mut rx = manager.notifier().subscribe();

    manager.session().update(|s| {
        s.synchronized = true;
        s.wallet_unlocked_balance = 500;
    });

    assert!(manager.rescan_wallet(10_000).await.unwrap());

    let state = manager.session().snapshot();
    assert!(!state.synchronized);
    assert_eq!(state.wallet_unlocked_balance, 0);
    assert!(state.tx_list.is_empty());

    match rx.recv().await {
        Some(shellwallet_service::SyncEvent::BlockUpdated { data }) => {
            assert_eq!(data.known_block_count, -300);
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn rescan_resets_session_even_when_rpc_fails() {
    let dir = tempfile::tempdir().unwrap();
    let rpc = StubRpc {
        reset_fails: true,
        ..StubRpc::new()
    };
    let (manager, _) = manager_with(rpc, dir.path());

    manager.session().update(|s| s.synchronized = true);
    assert!(!manager.rescan_wallet(0).await.unwrap());
    assert!(!manager.session().get(|s| s.synchronized));
}

#[tokio::test]
async fn import_with_failing_binary_surfaces_import_error() {
    let dir = tempfile::tempdir().unwrap();
    let rpc = Arc::new(StubRpc::new());
    let opts = ManagerOptions {
        // `false` exits non-zero: the import must fail cleanly.
        service_bin: PathBuf::from("/bin/false"),
        worker_bin: PathBuf::from("/bin/cat"),
        host: "127.0.0.1".to_string(),
        password: "testpass".to_string(),
        config_path: dir.path().join("service.conf"),
        minimum_fee: 10,
        anonymity: 3,
        start_port: 10101,
        debug: false,
    };
    let config = ServiceConfig {
        host: opts.host.clone(),
        port: 10101,
        password: opts.password.clone(),
        minimum_fee: 10,
        anonymity: 3,
    };
    let manager = WalletServiceManager::with_rpc(
        opts,
        config,
        short_timings(),
        rpc as Arc<dyn WalletRpc>,
    );

    let result = manager
        .import_from_seed(&dir.path().join("imported.wallet"), "pw", "seed words", Some(0))
        .await;
    assert!(matches!(result, Err(Error::ImportFailed(_))));
}

#[tokio::test]
async fn import_succeeds_when_wallet_file_is_produced() {
    let dir = tempfile::tempdir().unwrap();
    let rpc = Arc::new(StubRpc::new());
    let wallet_file = dir.path().join("imported.wallet");
    // `touch` exits zero but ignores the argument list's shape; create
    // the wallet file up front so the writability check passes.
    std::fs::write(&wallet_file, b"wallet").unwrap();
    let opts = ManagerOptions {
        service_bin: PathBuf::from("/bin/true"),
        worker_bin: PathBuf::from("/bin/cat"),
        host: "127.0.0.1".to_string(),
        password: "testpass".to_string(),
        config_path: dir.path().join("service.conf"),
        minimum_fee: 10,
        anonymity: 3,
        start_port: 10101,
        debug: false,
    };
    let config = ServiceConfig {
        host: opts.host.clone(),
        port: 10101,
        password: opts.password.clone(),
        minimum_fee: 10,
        anonymity: 3,
    };
    let manager = WalletServiceManager::with_rpc(
        opts,
        config,
        short_timings(),
        rpc as Arc<dyn WalletRpc>,
    );

    let imported = manager
        .import_from_keys(&wallet_file, "pw", "viewkey", "spendkey", None)
        .await
        .unwrap();
    assert_eq!(imported, wallet_file);
}
