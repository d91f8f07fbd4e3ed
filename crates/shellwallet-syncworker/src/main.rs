//! Background sync worker process
//!
//! Spawned by the coordinator's worker bridge. Commands arrive as JSON
//! lines on stdin; `serviceStatus` and sync events leave as JSON lines
//! on stdout. Polls the wallet service RPC for block, balance, and
//! transaction updates.

use anyhow::{Context, Result};
use shellwallet_service::events::{sync_status, Balance, BlockProgress, SyncEvent};
use shellwallet_service::rpc::{JsonRpcClient, WalletRpc};
use shellwallet_service::worker::WorkerCommand;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Stdout carries the protocol; logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    Worker::default().run().await
}

#[derive(Default)]
struct Worker {
    rpc: Option<Arc<JsonRpcClient>>,
    announced: bool,
    started: bool,
    paused: bool,
    scanned_to: u64,
    last_balance: Option<(u64, u64)>,
}

impl Worker {
    async fn run(mut self) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut ticker = tokio::time::interval(POLL_INTERVAL);

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line.context("stdin read failed")? {
                        Some(line) => {
                            if !self.handle_command(&line) {
                                debug!("Stop command received, exiting");
                                return Ok(());
                            }
                        }
                        // Coordinator closed our stdin: nothing left to
                        // report to, exit.
                        None => return Ok(()),
                    }
                }
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    /// Returns false when the worker should exit.
    fn handle_command(&mut self, line: &str) -> bool {
        let command: WorkerCommand = match serde_json::from_str(line) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!("Undecodable command dropped: {}", e);
                return true;
            }
        };

        match command {
            WorkerCommand::Cfg { data } => {
                debug!("Configured for {}:{}", data.service_host, data.service_port);
                let endpoint =
                    format!("http://{}:{}/json_rpc", data.service_host, data.service_port);
                match JsonRpcClient::with_endpoint(endpoint, data.service_password, RPC_TIMEOUT) {
                    Ok(client) => self.rpc = Some(Arc::new(client)),
                    Err(e) => warn!("RPC client setup failed: {}", e),
                }
            }
            WorkerCommand::Start => self.started = true,
            WorkerCommand::Stop => return false,
            WorkerCommand::Pause => {
                self.paused = true;
                emit(&SyncEvent::BlockUpdated {
                    data: BlockProgress::sentinel(sync_status::NET_OFFLINE),
                });
            }
            WorkerCommand::Resume => {
                self.paused = false;
                emit(&SyncEvent::BlockUpdated {
                    data: BlockProgress::sentinel(sync_status::NET_ONLINE),
                });
            }
        }
        true
    }

    async fn tick(&mut self) {
        let Some(rpc) = self.rpc.clone() else { return };

        if !self.announced {
            // Probe until the freshly spawned service answers, then
            // tell the coordinator we are ready.
            match rpc.get_status().await {
                Ok(status) => {
                    self.announced = true;
                    emit_raw(&serde_json::json!({
                        "type": "serviceStatus",
                        "data": {
                            "blockCount": status.block_count,
                            "knownBlockCount": status.known_block_count,
                        },
                    }));
                }
                Err(e) => debug!("Service not ready yet: {}", e),
            }
            return;
        }
        if !self.started || self.paused {
            return;
        }

        self.poll_status(&rpc).await;
        self.poll_balance(&rpc).await;
    }

    async fn poll_status(&mut self, rpc: &JsonRpcClient) {
        let status = match rpc.get_status().await {
            Ok(status) => status,
            Err(e) => {
                debug!("Status poll failed: {}", e);
                emit(&SyncEvent::BlockUpdated {
                    data: BlockProgress::sentinel(sync_status::NODE_ERROR),
                });
                return;
            }
        };

        let percent = if status.known_block_count > 0 {
            (status.block_count as f64 / status.known_block_count as f64) * 100.0
        } else {
            0.0
        };
        emit(&SyncEvent::BlockUpdated {
            data: BlockProgress {
                block_count: status.block_count as i64,
                known_block_count: status.known_block_count as i64,
                display_block_count: status.block_count as i64,
                display_known_block_count: status.known_block_count as i64,
                sync_percent: percent,
            },
        });

        // Fetch history for the blocks scanned since the last poll.
        if status.block_count > self.scanned_to {
            let first = self.scanned_to;
            let count = status.block_count - first;
            match rpc.get_transactions(first, count).await {
                Ok(mut transactions) if !transactions.is_empty() => {
                    transactions.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
                    emit(&SyncEvent::TransactionUpdated { data: transactions });
                }
                Ok(_) => {}
                Err(e) => debug!("Transaction poll failed: {}", e),
            }
            self.scanned_to = status.block_count;
        }
    }

    async fn poll_balance(&mut self, rpc: &JsonRpcClient) {
        match rpc.get_balance().await {
            Ok(balance) => {
                let snapshot = (balance.available_balance, balance.locked_amount);
                if self.last_balance != Some(snapshot) {
                    self.last_balance = Some(snapshot);
                    emit(&SyncEvent::BalanceUpdated {
                        data: Balance {
                            available_balance: balance.available_balance,
                            locked_amount: balance.locked_amount,
                        },
                    });
                }
            }
            Err(e) => debug!("Balance poll failed: {}", e),
        }
    }
}

fn emit(event: &SyncEvent) {
    match serde_json::to_string(event) {
        Ok(line) => write_line(&line),
        Err(e) => warn!("Event encode failed: {}", e),
    }
}

fn emit_raw(value: &serde_json::Value) {
    write_line(&value.to_string());
}

fn write_line(line: &str) {
    let stdout = std::io::stdout();
    let mut lock = stdout.lock();
    let _ = writeln!(lock, "{}", line);
    let _ = lock.flush();
}
