//! Error types for the wallet service coordinator

/// Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No free listen port could be allocated
    #[error("Port allocation failed: {0}")]
    PortAllocation(String),

    /// Service binary path is missing or not executable
    #[error("Service executable not found: {0}")]
    ExecutableNotFound(String),

    /// Wallet file could not be loaded (bad password or corrupt file).
    ///
    /// Part of the public error surface for callers that open the
    /// wallet around this coordinator; no coordinator path constructs
    /// it itself.
    #[error("Wallet load failed: {0}")]
    WalletLoad(String),

    /// Key/seed import subprocess failed or produced no writable wallet
    #[error("Import failed: {0}")]
    ImportFailed(String),

    /// Service RPC did not respond in time
    #[error("RPC timeout: {0}")]
    RpcTimeout(String),

    /// Service RPC returned an error
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Non-exhaustion failure while draining fusion transactions
    #[error("Fusion transaction failed: {0}")]
    FusionTransaction(String),

    /// An exclusive operation was invoked while already in progress
    #[error("Already running: {0}")]
    AlreadyRunning(&'static str),

    /// Sync worker process error
    #[error("Sync worker error: {0}")]
    Worker(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
