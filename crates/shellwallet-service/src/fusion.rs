//! Wallet optimization (fusion) coordinator
//!
//! Two phases: a binary-decay search for the highest threshold that
//! still maximizes the count of fusable outputs, then a drain loop
//! issuing consolidation transactions until the service signals
//! exhaustion or the round cap is hit. Both phases run as bounded
//! loops rather than recursive self-scheduling.

use crate::events::{SyncEvent, UpdateNotifier};
use crate::rpc::WalletRpc;
use crate::session::Session;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Iteration cap for the threshold search.
pub const MAX_THRESHOLD_SEARCH_ITERATIONS: u32 = 20;
/// Threshold floor below which the search stops.
pub const MIN_FUSION_THRESHOLD: u64 = 10;
/// Round cap for the transaction drain.
pub const MAX_FUSION_ROUNDS: u32 = 256;

/// Substring of the service error that signals no more fusable
/// outputs. Benign exhaustion, not a failure.
const EXHAUSTION_SIGNAL: &str = "index is out of range";

/// Outcome message: at least one fusion transaction went out.
pub const INFO_FUSION_DONE: &str =
    "Wallet optimization completed, your balance may appear incorrect for a while.";
/// Outcome message: nothing to optimize.
pub const INFO_FUSION_SKIPPED: &str =
    "Wallet already optimized. No further optimization is needed.";
/// Outcome message: a non-exhaustion failure ended the run.
pub const ERROR_FUSION_FAILED: &str =
    "Unable to optimize your wallet, please try again in a few seconds";

/// Coordinator for fusion runs. At most one run at a time; a second
/// `optimize_wallet` call while one is in flight fails with
/// [`Error::AlreadyRunning`].
pub struct FusionCoordinator {
    rpc: Arc<dyn WalletRpc>,
    session: Arc<Session>,
    notifier: Arc<UpdateNotifier>,
    tx_delay: Duration,
    running: AtomicBool,
    collected: Mutex<Vec<String>>,
}

impl FusionCoordinator {
    /// Create a coordinator draining with `tx_delay` between rounds.
    pub fn new(
        rpc: Arc<dyn WalletRpc>,
        session: Arc<Session>,
        notifier: Arc<UpdateNotifier>,
        tx_delay: Duration,
    ) -> Self {
        Self {
            rpc,
            session,
            notifier,
            tx_delay,
            running: AtomicBool::new(false),
            collected: Mutex::new(Vec::new()),
        }
    }

    /// Hashes collected by the most recent run.
    pub fn collected_hashes(&self) -> Vec<String> {
        self.collected.lock().clone()
    }

    /// Phase 1: find the highest threshold that still maximizes the
    /// fusion-ready output count.
    ///
    /// Defaults to unlocked balance × 100 + 1 when `initial` is unset.
    /// Returns 0 when the wallet has nothing to optimize. Bounded by
    /// [`MAX_THRESHOLD_SEARCH_ITERATIONS`] and
    /// [`MIN_FUSION_THRESHOLD`].
    pub async fn find_min_threshold(&self, initial: Option<u64>) -> Result<u64> {
        let mut threshold = initial.unwrap_or_else(|| {
            self.session
                .get(|s| s.wallet_unlocked_balance)
                .saturating_mul(100)
                .saturating_add(1)
        });
        let mut min_threshold = threshold;
        let mut max_ready_count = 0u64;
        let mut iteration = 0u32;

        loop {
            let estimate = self.rpc.estimate_fusion(threshold).await?;
            debug!(
                "Fusion estimate: threshold={} ready={} iteration={}",
                threshold, estimate.fusion_ready_count, iteration
            );

            // Nothing to optimize at all.
            if iteration == 0 && estimate.fusion_ready_count == 0 {
                return Ok(0);
            }
            // Search exhausted.
            if iteration > MAX_THRESHOLD_SEARCH_ITERATIONS || threshold < MIN_FUSION_THRESHOLD {
                return Ok(min_threshold);
            }
            // Readiness dropped: the previous threshold was the optimum.
            if estimate.fusion_ready_count < max_ready_count {
                return Ok(min_threshold);
            }

            max_ready_count = estimate.fusion_ready_count;
            min_threshold = threshold;
            threshold /= 2;
            iteration += 1;
        }
    }

    /// Phase 2: issue fusion transactions at `threshold` until the
    /// service signals exhaustion or [`MAX_FUSION_ROUNDS`] is reached.
    ///
    /// Collected hashes accumulate in the coordinator and are also
    /// returned. A non-exhaustion failure aborts with
    /// [`Error::FusionTransaction`].
    pub async fn drain_fusion(&self, threshold: u64) -> Result<Vec<String>> {
        for round in 0..MAX_FUSION_ROUNDS {
            tokio::time::sleep(self.tx_delay).await;
            debug!("Sending fusion tx, round {}", round);

            match self.rpc.send_fusion_transaction(threshold).await {
                Ok(hash) => {
                    debug!("Fusion tx accepted: {}", hash);
                    self.collected.lock().push(hash);
                }
                Err(e) => {
                    let msg = e.to_string();
                    if msg.to_lowercase().contains(EXHAUSTION_SIGNAL) {
                        debug!("Fusion outputs exhausted after {} rounds", round);
                        return Ok(self.collected_hashes());
                    }
                    return Err(Error::FusionTransaction(msg));
                }
            }
        }
        info!("Fusion drain hit the {} round cap", MAX_FUSION_ROUNDS);
        Ok(self.collected_hashes())
    }

    /// Run the full optimization protocol.
    ///
    /// Always resolves with a terminal [`SyncEvent::FusionTxCompleted`]
    /// once Phase 2 has started; Phase 1 errors propagate to the
    /// caller. The resolved value is the outcome message.
    pub async fn optimize_wallet(&self) -> Result<String> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning("optimize_wallet"));
        }
        let outcome = self.run_optimization().await;
        self.session.update(|s| s.fusion_progress = false);
        self.running.store(false, Ordering::SeqCst);
        outcome
    }

    async fn run_optimization(&self) -> Result<String> {
        info!("Running wallet optimization");
        self.collected.lock().clear();
        self.session.update(|s| {
            s.fusion_started = true;
            s.fusion_progress = true;
        });

        let threshold = self.find_min_threshold(None).await?;
        if threshold == 0 {
            debug!("Fusion skipped, nothing to optimize");
            self.publish_outcome(INFO_FUSION_SKIPPED);
            return Ok(INFO_FUSION_SKIPPED.to_string());
        }

        info!("Performing fusion, threshold {}", threshold);
        match self.drain_fusion(threshold).await {
            Ok(hashes) => {
                debug!("Fusion done, {} transactions", hashes.len());
                self.publish_outcome(INFO_FUSION_DONE);
                Ok(INFO_FUSION_DONE.to_string())
            }
            Err(e) => {
                // The drain treats exhaustion as success, but an
                // exhaustion message wrapped in another failure is
                // still benign: classify by whether anything went out.
                let out_msg = if e.to_string().to_lowercase().contains(EXHAUSTION_SIGNAL) {
                    if self.collected.lock().is_empty() {
                        INFO_FUSION_SKIPPED
                    } else {
                        INFO_FUSION_DONE
                    }
                } else {
                    ERROR_FUSION_FAILED
                };
                debug!("Fusion outcome after failure: {}", out_msg);
                self.publish_outcome(out_msg);
                Ok(out_msg.to_string())
            }
        }
    }

    fn publish_outcome(&self, message: &str) {
        let code = if message == INFO_FUSION_SKIPPED { 0 } else { 1 };
        self.notifier.publish(SyncEvent::FusionTxCompleted {
            data: message.to_string(),
            code,
        });
    }
}
