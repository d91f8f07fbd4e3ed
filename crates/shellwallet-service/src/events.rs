//! Upward event contract and the update notifier

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// Sentinel block counts used to signal sync-state transitions to the
/// consumer instead of real chain heights.
pub mod sync_status {
    /// Connection restored, sync resuming
    pub const NET_ONLINE: i64 = -10;
    /// Network lost, sync paused
    pub const NET_OFFLINE: i64 = -50;
    /// No wallet loaded
    pub const IDLE: i64 = -100;
    /// Node unreachable
    pub const NODE_ERROR: i64 = -200;
    /// History wiped, rescan pending
    pub const RESET: i64 = -300;
}

/// Chain/sync progress payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockProgress {
    /// Height the wallet has scanned to
    pub block_count: i64,
    /// Height the node reports
    pub known_block_count: i64,
    /// Scanned height as shown to the user (may be a sentinel)
    pub display_block_count: i64,
    /// Node height as shown to the user (may be a sentinel)
    pub display_known_block_count: i64,
    /// Percentage complete, 0-100
    pub sync_percent: f64,
}

impl BlockProgress {
    /// Progress payload carrying the same sentinel in every field.
    pub fn sentinel(value: i64) -> Self {
        Self {
            block_count: value,
            known_block_count: value,
            display_block_count: value,
            display_known_block_count: value,
            sync_percent: value as f64,
        }
    }
}

/// Wallet balance payload, atomic units.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    /// Spendable balance
    pub available_balance: u64,
    /// Locked (pending) balance
    pub locked_amount: u64,
}

/// One entry of the wallet transaction history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionEntry {
    /// Transaction hash
    pub transaction_hash: String,
    /// Signed amount: negative for outgoing
    pub amount: i64,
    /// Network fee paid
    pub fee: u64,
    /// Unix timestamp
    pub timestamp: i64,
    /// Height of the containing block
    pub block_index: u64,
}

/// Typed state-change event published to the registered observer.
///
/// Wire shape is `{type, data, code?}` with a camelCase type tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// Chain sync progressed or hit a sentinel state
    BlockUpdated {
        /// Progress payload
        data: BlockProgress,
    },
    /// Wallet balance changed
    BalanceUpdated {
        /// Balance payload
        data: Balance,
    },
    /// New transactions appeared in the history
    TransactionUpdated {
        /// New entries, newest first
        data: Vec<TransactionEntry>,
    },
    /// Connected node announced its fee
    NodeFeeUpdated {
        /// Fee in atomic units
        data: u64,
    },
    /// Loaded wallet address became known
    AddressUpdated {
        /// Primary wallet address
        data: String,
    },
    /// Coordinator requests a UI section change
    SectionChanged {
        /// Section identifier
        data: String,
    },
    /// Fusion run reached a terminal state
    FusionTxCompleted {
        /// Human-readable outcome message
        data: String,
        /// 0 = skipped, 1 = completed
        code: u8,
    },
}

/// Narrow publish-only interface between the coordinator components
/// and the consumer layer.
///
/// No buffering: with no observer registered, events are dropped
/// silently. Publishers must never assume delivery.
pub struct UpdateNotifier {
    observer: RwLock<Option<mpsc::UnboundedSender<SyncEvent>>>,
}

impl UpdateNotifier {
    /// Create a notifier with no observer registered.
    pub fn new() -> Self {
        Self {
            observer: RwLock::new(None),
        }
    }

    /// Register an observer, replacing any previous one, and return
    /// the receiving half.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SyncEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.observer.write() = Some(tx);
        rx
    }

    /// Publish an event to the observer, if any.
    pub fn publish(&self, event: SyncEvent) {
        let guard = self.observer.read();
        match guard.as_ref() {
            Some(tx) => {
                if tx.send(event).is_err() {
                    debug!("Observer receiver dropped, event discarded");
                }
            }
            None => debug!("No observer registered, event discarded"),
        }
    }
}

impl Default for UpdateNotifier {
    fn default() -> Self {
        Self::new()
    }
}
