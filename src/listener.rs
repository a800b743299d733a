//! Per-network payment listener
//!
//! A recurring task that polls the wallet daemon for incoming transfers,
//! matches them against outstanding payment prompts, and forwards
//! reconciliation outcomes to the host event channel. Cycles are skipped
//! silently while the daemon is unreachable; the height cursor only advances
//! after a cycle that completes without a transport failure, so no transfer
//! is skipped on partial failure.

use crate::pool::NetworkHandle;
use crate::reconciler::{PaymentEvent, PromptRegistry, ReconcileEngine, ReconciliationResult};
use crate::rpc::RpcTransport;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::{debug, info, warn};

pub struct PaymentListener<T: RpcTransport> {
    handle: Arc<NetworkHandle<T>>,
    prompts: Arc<PromptRegistry>,
    engine: ReconcileEngine,
    events: mpsc::Sender<PaymentEvent>,
    poll_interval: Duration,
    /// Height floor passed to the daemon; None until the first clean cycle
    cursor: Option<u64>,
}

impl<T: RpcTransport> PaymentListener<T> {
    pub fn new(
        handle: Arc<NetworkHandle<T>>,
        prompts: Arc<PromptRegistry>,
        events: mpsc::Sender<PaymentEvent>,
        poll_interval: Duration,
    ) -> Self {
        let engine = ReconcileEngine::new(
            handle.network().to_string(),
            handle.config().required_confirmations,
        );
        Self {
            handle,
            prompts,
            engine,
            events,
            poll_interval,
            cursor: None,
        }
    }

    /// Poll once and reconcile everything the daemon reports.
    pub async fn run_cycle(&mut self) {
        let network = self.handle.network().to_string();

        let transfers = match self
            .handle
            .wallet()
            .list_incoming_transfers(None, self.cursor)
            .await
        {
            Ok(transfers) => transfers,
            Err(err) if err.is_retryable() => {
                debug!(network = %network, error = %err, "daemon unreachable, skipping poll cycle");
                return;
            }
            Err(err) => {
                warn!(network = %network, error = %err, "transfer poll failed");
                return;
            }
        };

        let mut highest_height: Option<u64> = None;

        // Daemon-reported order is preserved within the cycle
        for transfer in &transfers {
            let prompt = self
                .prompts
                .lookup(&network, &transfer.address, transfer.payment_id.as_deref())
                .await;

            match self.engine.observe(transfer, prompt.as_ref()) {
                Some(ReconciliationResult::Unmatched) => {
                    // Wallets receive change and test transfers; not an error
                    debug!(
                        network = %network,
                        txid = %transfer.txid,
                        amount = transfer.amount,
                        "incoming transfer matches no payment prompt"
                    );
                }
                Some(result) => {
                    let event = PaymentEvent {
                        network: network.clone(),
                        txid: transfer.txid.clone(),
                        address: transfer.address.clone(),
                        payment_id: transfer.payment_id.clone(),
                        amount: transfer.amount,
                        confirmations: transfer.confirmations,
                        result,
                        detected_at: Utc::now(),
                    };
                    if self.events.send(event).await.is_err() {
                        warn!(network = %network, "event channel closed, dropping reconciliation report");
                        return;
                    }
                }
                None => {}
            }

            if let Some(height) = transfer.height {
                highest_height = Some(highest_height.map_or(height, |h| h.max(height)));
            }
        }

        // Clean cycle: advance the cursor, but keep it a full confirmation
        // depth behind the chain tip we saw so transfers still maturing stay
        // inside the query window.
        if let Some(height) = highest_height {
            let floor = height.saturating_sub(self.handle.config().required_confirmations);
            let cursor = self.cursor.map_or(floor, |cursor| cursor.max(floor));
            self.cursor = Some(cursor);
            self.engine.prune_below(cursor);
        }
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_cycle().await,
                _ = shutdown.recv() => {
                    info!(network = %self.handle.network(), "payment listener shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::pool::Backoff;
    use crate::reconciler::PaymentPrompt;
    use crate::rpc::testing::ScriptedTransport;
    use crate::rpc::RpcClientError;
    use serde_json::json;

    fn network_config() -> NetworkConfig {
        toml::from_str(
            r#"
                crypto_code = "ZANO"
                daemon_uri = "http://127.0.0.1:11211"
                wallet_daemon_uri = "http://127.0.0.1:11233"
                required_confirmations = 10
            "#,
        )
        .unwrap()
    }

    fn listener_with(
        transport: ScriptedTransport,
    ) -> (
        PaymentListener<ScriptedTransport>,
        Arc<PromptRegistry>,
        mpsc::Receiver<PaymentEvent>,
    ) {
        let handle = Arc::new(NetworkHandle::new(
            network_config(),
            transport.clone(),
            transport,
            None,
            Backoff {
                base: Duration::ZERO,
                cap: Duration::ZERO,
            },
        ));
        let prompts = Arc::new(PromptRegistry::new());
        let (tx, rx) = mpsc::channel(16);
        let listener =
            PaymentListener::new(handle, prompts.clone(), tx, Duration::from_secs(5));
        (listener, prompts, rx)
    }

    fn incoming(entries: serde_json::Value) -> crate::rpc::RpcResult<serde_json::Value> {
        Ok(json!({ "in": entries }))
    }

    fn deposit_entry(confirmations: u64, height: u64) -> serde_json::Value {
        json!({
            "txid": "aa11",
            "address": "iZxdeposit",
            "amount": 500000000000u64,
            "confirmations": confirmations,
            "height": height,
            "payment_id": "deadbeef01020304"
        })
    }

    async fn register_deposit_prompt(prompts: &PromptRegistry) {
        prompts
            .register(PaymentPrompt {
                network: "ZANO".to_string(),
                address: "iZxdeposit".to_string(),
                payment_id: "deadbeef01020304".to_string(),
                account_index: 0,
                expected_amount: 500_000_000_000,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn matched_transfers_are_reported_and_orphans_discarded() {
        let transport = ScriptedTransport::new(vec![
            Ok(json!({})), // open_wallet
            incoming(json!([
                deposit_entry(3, 120),
                {
                    "txid": "bb22",
                    "address": "Zxchange",
                    "amount": 42,
                    "confirmations": 1,
                    "height": 121
                }
            ])),
        ]);
        let (mut listener, prompts, mut rx) = listener_with(transport);
        register_deposit_prompt(&prompts).await;

        listener.run_cycle().await;

        let event = rx.try_recv().unwrap();
        assert_eq!(event.txid, "aa11");
        assert_eq!(event.result, ReconciliationResult::PendingConfirmation(3));
        // the unmatched change transfer produced no event
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn confirmed_is_reported_once_across_cycles() {
        let transport = ScriptedTransport::new(vec![
            Ok(json!({})),
            incoming(json!([deposit_entry(10, 120)])),
            incoming(json!([deposit_entry(11, 120)])),
        ]);
        let (mut listener, prompts, mut rx) = listener_with(transport);
        register_deposit_prompt(&prompts).await;

        listener.run_cycle().await;
        listener.run_cycle().await;

        let event = rx.try_recv().unwrap();
        assert_eq!(event.result, ReconciliationResult::Confirmed);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cursor_advances_only_after_clean_cycles() {
        let transport = ScriptedTransport::new(vec![
            Ok(json!({})),
            incoming(json!([deposit_entry(12, 120)])),
            Err(RpcClientError::Transport("connect timeout".to_string())),
        ]);
        let (mut listener, prompts, _rx) = listener_with(transport.clone());
        register_deposit_prompt(&prompts).await;

        listener.run_cycle().await;
        // window stays required_confirmations behind the observed tip
        assert_eq!(listener.cursor, Some(110));

        listener.run_cycle().await;
        assert_eq!(listener.cursor, Some(110));

        // the floor is forwarded to the daemon on the next poll
        transport.push(incoming(json!([])));
        listener.run_cycle().await;
        let calls = transport.calls();
        let last = calls.last().unwrap();
        assert_eq!(last.0, "get_transfers");
        assert_eq!(last.1["min_height"], 110);
    }

    #[tokio::test]
    async fn amount_mismatch_is_reported_not_swallowed() {
        let transport = ScriptedTransport::new(vec![
            Ok(json!({})),
            incoming(json!([{
                "txid": "cc33",
                "address": "iZxdeposit",
                "amount": 499999999999u64,
                "confirmations": 2,
                "height": 130,
                "payment_id": "deadbeef01020304"
            }])),
        ]);
        let (mut listener, prompts, mut rx) = listener_with(transport);
        register_deposit_prompt(&prompts).await;

        listener.run_cycle().await;

        let event = rx.try_recv().unwrap();
        assert_eq!(event.result, ReconciliationResult::AmountMismatch);
        assert_eq!(event.amount, 499_999_999_999);
    }
}
