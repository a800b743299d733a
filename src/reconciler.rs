//! Matching detected transfers against outstanding payment prompts
//!
//! The prompt registry guarantees at most one outstanding prompt per
//! (address, payment id) pair per network, so a detected transfer matches
//! unambiguously. Reconciliation itself is a pure function of the transfer,
//! the prompt and the required confirmation depth; the engine around it adds
//! the cross-cycle bookkeeping: a transfer is observed once per poll cycle
//! and `Confirmed` must be reported exactly once per transaction id.

use crate::wallet::DetectedTransfer;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// A request for payment issued to the host invoice system.
/// Immutable once issued; removed when the owning invoice is finalized or
/// expires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentPrompt {
    pub network: String,
    pub address: String,
    pub payment_id: String,
    pub account_index: u64,
    /// Expected amount in atomic units
    pub expected_amount: u64,
}

impl PaymentPrompt {
    fn key(&self) -> PromptKey {
        (
            self.network.clone(),
            self.address.clone(),
            self.payment_id.clone(),
        )
    }
}

type PromptKey = (String, String, String);

/// Outstanding payment prompts, keyed by (network, address, payment id)
#[derive(Default)]
pub struct PromptRegistry {
    prompts: RwLock<HashMap<PromptKey, PaymentPrompt>>,
}

impl PromptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a prompt. Fails when the (address, payment id) pair is
    /// already outstanding on the network, since the pair must match an
    /// incoming transfer unambiguously.
    pub async fn register(&self, prompt: PaymentPrompt) -> anyhow::Result<()> {
        let mut prompts = self.prompts.write().await;
        let key = prompt.key();
        if prompts.contains_key(&key) {
            anyhow::bail!(
                "payment prompt already outstanding for {} address {} payment id {}",
                prompt.network,
                prompt.address,
                prompt.payment_id
            );
        }
        debug!(
            network = %prompt.network,
            address = %prompt.address,
            payment_id = %prompt.payment_id,
            amount = prompt.expected_amount,
            "payment prompt registered"
        );
        prompts.insert(key, prompt);
        Ok(())
    }

    /// Remove a prompt once its invoice is finalized or expired
    pub async fn remove(&self, network: &str, address: &str, payment_id: &str) -> Option<PaymentPrompt> {
        self.prompts
            .write()
            .await
            .remove(&(network.to_string(), address.to_string(), payment_id.to_string()))
    }

    pub async fn lookup(
        &self,
        network: &str,
        address: &str,
        payment_id: Option<&str>,
    ) -> Option<PaymentPrompt> {
        let key = (
            network.to_string(),
            address.to_string(),
            payment_id.unwrap_or_default().to_string(),
        );
        self.prompts.read().await.get(&key).cloned()
    }

    pub async fn outstanding(&self, network: &str) -> Vec<PaymentPrompt> {
        self.prompts
            .read()
            .await
            .values()
            .filter(|p| p.network == network)
            .cloned()
            .collect()
    }
}

/// Outcome of matching one observed transfer against the prompts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationResult {
    /// No prompt outstanding for the (address, payment id) pair
    Unmatched,
    /// Matched, but below the required confirmation depth
    PendingConfirmation(u64),
    /// Matched and final
    Confirmed,
    /// Matched, but the amount differs from the prompt's expectation
    AmountMismatch,
    /// Previously mined transfer dropped back out of the chain
    Orphaned,
}

/// Settlement report forwarded to the host application
#[derive(Debug, Clone, Serialize)]
pub struct PaymentEvent {
    pub network: String,
    pub txid: String,
    pub address: String,
    pub payment_id: Option<String>,
    pub amount: u64,
    pub confirmations: u64,
    pub result: ReconciliationResult,
    pub detected_at: DateTime<Utc>,
}

/// Match one transfer against one prompt under a confirmation-depth policy.
///
/// Partial payments are not aggregated; anything but the exact expected
/// amount is a mismatch.
pub fn reconcile(
    transfer: &DetectedTransfer,
    prompt: &PaymentPrompt,
    required_confirmations: u64,
) -> ReconciliationResult {
    if transfer.amount != prompt.expected_amount {
        return ReconciliationResult::AmountMismatch;
    }
    if transfer.confirmations < required_confirmations {
        return ReconciliationResult::PendingConfirmation(transfer.confirmations);
    }
    ReconciliationResult::Confirmed
}

/// Cross-cycle reconciliation state for one network.
///
/// A transfer is re-observed on every poll while it stays inside the query
/// window, so the engine deduplicates `Confirmed` per transaction id and
/// detects transfers that fell out of the chain after being mined.
pub struct ReconcileEngine {
    network: String,
    required_confirmations: u64,
    /// Txids already reported Confirmed, with the height they confirmed at
    confirmed: HashMap<String, u64>,
    mined_heights: HashMap<String, u64>,
}

impl ReconcileEngine {
    pub fn new(network: impl Into<String>, required_confirmations: u64) -> Self {
        Self {
            network: network.into(),
            required_confirmations,
            confirmed: HashMap::new(),
            mined_heights: HashMap::new(),
        }
    }

    /// Drop bookkeeping for transfers below the poll query window; they can
    /// no longer be re-observed.
    pub fn prune_below(&mut self, height_floor: u64) {
        self.confirmed.retain(|_, height| *height >= height_floor);
        self.mined_heights.retain(|_, height| *height >= height_floor);
    }

    /// Process one observation of a transfer. Returns the reconciliation
    /// outcome to report, or `None` when the observation adds nothing new
    /// (repeat of an already-reported `Confirmed`).
    pub fn observe(
        &mut self,
        transfer: &DetectedTransfer,
        prompt: Option<&PaymentPrompt>,
    ) -> Option<ReconciliationResult> {
        // Reorg check first: a transfer that had a height and lost it was
        // orphaned regardless of prompt state.
        match transfer.height {
            Some(height) => {
                self.mined_heights.insert(transfer.txid.clone(), height);
            }
            None => {
                if self.mined_heights.remove(&transfer.txid).is_some() {
                    warn!(
                        network = %self.network,
                        txid = %transfer.txid,
                        "previously mined transfer dropped out of the chain"
                    );
                    self.confirmed.remove(&transfer.txid);
                    return Some(ReconciliationResult::Orphaned);
                }
            }
        }

        let Some(prompt) = prompt else {
            return Some(ReconciliationResult::Unmatched);
        };

        let result = reconcile(transfer, prompt, self.required_confirmations);

        if result == ReconciliationResult::Confirmed {
            if self.confirmed.contains_key(&transfer.txid) {
                return None;
            }
            self.confirmed
                .insert(transfer.txid.clone(), transfer.height.unwrap_or(0));
            info!(
                network = %self.network,
                txid = %transfer.txid,
                address = %transfer.address,
                amount = transfer.amount,
                confirmations = transfer.confirmations,
                "payment confirmed"
            );
        }

        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt(expected_amount: u64) -> PaymentPrompt {
        PaymentPrompt {
            network: "ZANO".to_string(),
            address: "iZxdeposit".to_string(),
            payment_id: "deadbeef01020304".to_string(),
            account_index: 0,
            expected_amount,
        }
    }

    fn transfer(amount: u64, confirmations: u64, height: Option<u64>) -> DetectedTransfer {
        DetectedTransfer {
            txid: "aa11".to_string(),
            address: "iZxdeposit".to_string(),
            account_index: 0,
            amount,
            confirmations,
            height,
            payment_id: Some("deadbeef01020304".to_string()),
        }
    }

    #[tokio::test]
    async fn registry_rejects_duplicate_address_payment_id_pair() {
        let registry = PromptRegistry::new();
        registry.register(prompt(100)).await.unwrap();

        let err = registry.register(prompt(200)).await.unwrap_err();
        assert!(err.to_string().contains("already outstanding"));

        // Same pair on another network is a different prompt
        let mut other = prompt(100);
        other.network = "TESTNET".to_string();
        registry.register(other).await.unwrap();
    }

    #[tokio::test]
    async fn registry_lookup_and_removal() {
        let registry = PromptRegistry::new();
        registry.register(prompt(100)).await.unwrap();

        let found = registry
            .lookup("ZANO", "iZxdeposit", Some("deadbeef01020304"))
            .await;
        assert_eq!(found.unwrap().expected_amount, 100);

        assert!(registry
            .lookup("ZANO", "iZxdeposit", Some("feedface05060708"))
            .await
            .is_none());

        registry
            .remove("ZANO", "iZxdeposit", "deadbeef01020304")
            .await
            .unwrap();
        assert!(registry.outstanding("ZANO").await.is_empty());
    }

    #[test]
    fn wrong_amount_is_a_mismatch() {
        let result = reconcile(&transfer(499_999_999_999, 12, Some(100)), &prompt(500_000_000_000), 10);
        assert_eq!(result, ReconciliationResult::AmountMismatch);
    }

    #[test]
    fn confirmation_depth_gates_settlement() {
        let expected = 500_000_000_000;
        assert_eq!(
            reconcile(&transfer(expected, 3, Some(100)), &prompt(expected), 10),
            ReconciliationResult::PendingConfirmation(3)
        );
        assert_eq!(
            reconcile(&transfer(expected, 10, Some(100)), &prompt(expected), 10),
            ReconciliationResult::Confirmed
        );
    }

    #[test]
    fn engine_reports_confirmed_once_per_txid() {
        let mut engine = ReconcileEngine::new("ZANO", 10);
        let p = prompt(100);

        assert_eq!(
            engine.observe(&transfer(100, 3, Some(100)), Some(&p)),
            Some(ReconciliationResult::PendingConfirmation(3))
        );
        assert_eq!(
            engine.observe(&transfer(100, 10, Some(100)), Some(&p)),
            Some(ReconciliationResult::Confirmed)
        );
        assert_eq!(engine.observe(&transfer(100, 11, Some(100)), Some(&p)), None);
        assert_eq!(engine.observe(&transfer(100, 25, Some(100)), Some(&p)), None);
    }

    #[test]
    fn engine_reports_unmatched_without_prompt() {
        let mut engine = ReconcileEngine::new("ZANO", 10);
        assert_eq!(
            engine.observe(&transfer(100, 3, Some(100)), None),
            Some(ReconciliationResult::Unmatched)
        );
    }

    #[test]
    fn mined_transfer_losing_its_height_is_orphaned() {
        let mut engine = ReconcileEngine::new("ZANO", 10);
        let p = prompt(100);

        engine.observe(&transfer(100, 10, Some(100)), Some(&p));
        assert_eq!(
            engine.observe(&transfer(100, 0, None), Some(&p)),
            Some(ReconciliationResult::Orphaned)
        );

        // If it is mined again it may confirm again
        assert_eq!(
            engine.observe(&transfer(100, 10, Some(105)), Some(&p)),
            Some(ReconciliationResult::Confirmed)
        );
    }

    #[test]
    fn pruning_drops_bookkeeping_behind_the_window() {
        let mut engine = ReconcileEngine::new("ZANO", 10);
        let p = prompt(100);

        engine.observe(&transfer(100, 10, Some(100)), Some(&p));
        assert!(!engine.confirmed.is_empty());

        engine.prune_below(101);
        assert!(engine.confirmed.is_empty());
        assert!(engine.mined_heights.is_empty());
    }

    #[test]
    fn never_mined_transfer_is_not_orphaned() {
        let mut engine = ReconcileEngine::new("ZANO", 10);
        let p = prompt(100);

        assert_eq!(
            engine.observe(&transfer(100, 0, None), Some(&p)),
            Some(ReconciliationResult::PendingConfirmation(0))
        );
    }
}
