//! Process-wide wallet/sync session state

use crate::events::TransactionEntry;
use parking_lot::RwLock;
use std::path::PathBuf;

/// Session state mutated by the supervisor, worker bridge, and fusion
/// coordinator.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    /// Address of the node the service is connected to
    pub connected_node: String,
    /// Fee charged by the connected node, atomic units
    pub node_fee: u64,
    /// Spendable balance, atomic units
    pub wallet_unlocked_balance: u64,
    /// Locked (pending) balance, atomic units
    pub wallet_locked_balance: u64,
    /// Wallet is fully synchronized with the chain
    pub synchronized: bool,
    /// Sync worker has been told to start
    pub sync_started: bool,
    /// Service answered its first status poll
    pub service_ready: bool,
    /// Cached transaction history, newest first
    pub tx_list: Vec<TransactionEntry>,
    /// Hash of the most recent cached transaction
    pub tx_last_hash: Option<String>,
    /// Timestamp of the most recent cached transaction
    pub tx_last_timestamp: Option<i64>,
    /// A fusion run is currently in flight
    pub fusion_progress: bool,
    /// A fusion run was requested this session
    pub fusion_started: bool,
    /// Primary address of the loaded wallet
    pub loaded_wallet_address: String,
    /// Path of the config artifact for the spawned service
    pub wallet_config_path: Option<PathBuf>,
}

/// Shared session store.
///
/// Reads and writes are last-write-wins behind a single lock; `reset`
/// swaps the whole state in one critical section so observers never
/// see a half-cleared session.
pub struct Session {
    inner: RwLock<SessionState>,
}

impl Session {
    /// Create a session with default (empty) state.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(SessionState::default()),
        }
    }

    /// Snapshot the current state.
    pub fn snapshot(&self) -> SessionState {
        self.inner.read().clone()
    }

    /// Mutate the state under the write lock.
    pub fn update<F: FnOnce(&mut SessionState)>(&self, f: F) {
        f(&mut self.inner.write());
    }

    /// Read a single value out of the state.
    pub fn get<T, F: FnOnce(&SessionState) -> T>(&self, f: F) -> T {
        f(&self.inner.read())
    }

    /// Clear every key back to its default.
    ///
    /// The only way `synchronized`, `sync_started` and
    /// `fusion_progress` return to false once set. The config path is
    /// preserved, it identifies the artifact location rather than
    /// session progress.
    pub fn reset(&self) {
        let mut state = self.inner.write();
        let config_path = state.wallet_config_path.take();
        *state = SessionState {
            wallet_config_path: config_path,
            ..SessionState::default()
        };
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_clears_flags_and_history() {
        let session = Session::new();
        session.update(|s| {
            s.synchronized = true;
            s.sync_started = true;
            s.fusion_progress = true;
            s.wallet_unlocked_balance = 1_000_000;
            s.tx_list.push(TransactionEntry {
                transaction_hash: "abc".to_string(),
                amount: 10,
                fee: 1,
                timestamp: 1_700_000_000,
                block_index: 42,
            });
            s.tx_last_hash = Some("abc".to_string());
        });

        session.reset();

        let state = session.snapshot();
        assert!(!state.synchronized);
        assert!(!state.sync_started);
        assert!(!state.fusion_progress);
        assert_eq!(state.wallet_unlocked_balance, 0);
        assert!(state.tx_list.is_empty());
        assert!(state.tx_last_hash.is_none());
    }

    #[test]
    fn test_reset_preserves_config_path() {
        let session = Session::new();
        session.update(|s| s.wallet_config_path = Some(PathBuf::from("/tmp/ws.conf")));
        session.reset();
        assert_eq!(
            session.get(|s| s.wallet_config_path.clone()),
            Some(PathBuf::from("/tmp/ws.conf"))
        );
    }
}
