//! Wallet service process coordinator
//!
//! Supervises an external wallet daemon, negotiates its listen port,
//! bridges a background sync worker process, and drives the fusion
//! (UTXO consolidation) protocol, publishing typed state-change
//! events to the consumer layer.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod events;
pub mod fusion;
pub mod manager;
pub mod port;
pub mod rpc;
pub mod session;
pub mod supervisor;
pub mod worker;

pub use config::{ConfigWriter, ServiceConfig, Timings};
pub use error::{Error, Result};
pub use events::{Balance, BlockProgress, SyncEvent, TransactionEntry, UpdateNotifier};
pub use fusion::{
    FusionCoordinator, ERROR_FUSION_FAILED, INFO_FUSION_DONE, INFO_FUSION_SKIPPED,
    MAX_FUSION_ROUNDS, MAX_THRESHOLD_SEARCH_ITERATIONS, MIN_FUSION_THRESHOLD,
};
pub use manager::{ManagerOptions, WalletServiceManager};
pub use port::{get_unused_port, SERVICE_MIN_LISTEN_PORT};
pub use rpc::{
    BackupKeys, FusionEstimate, JsonRpcClient, NodeStatus, Transfer, TransferRequest, WalletRpc,
};
pub use session::{Session, SessionState};
pub use supervisor::{ServiceState, ServiceSupervisor};
pub use worker::{SyncWorkerBridge, WorkerCommand, WorkerConfig};
