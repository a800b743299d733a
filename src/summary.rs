//! Per-network balance and sync snapshot publisher
//!
//! A recurring task that refreshes `{balance, unlocked_balance, sync_height,
//! daemon_reachable}` for dashboards and health checks. On failure the last
//! good numbers are retained with `daemon_reachable` cleared; stale data is
//! more useful to an operator than no data.

use crate::pool::NetworkHandle;
use crate::rpc::RpcTransport;
use crate::wallet::WalletError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::interval;
use tracing::{debug, info};

/// Snapshot of one network's wallet and chain state
#[derive(Debug, Clone, Serialize)]
pub struct WalletSummary {
    pub network: String,
    pub balance: u64,
    pub unlocked_balance: u64,
    pub sync_height: u64,
    pub daemon_reachable: bool,
    /// When the numeric values were last refreshed from the daemon
    pub updated_at: DateTime<Utc>,
}

/// Written only by each network's publisher task, read by API consumers
pub type SummaryMap = Arc<RwLock<HashMap<String, WalletSummary>>>;

pub struct SummaryPublisher<T: RpcTransport> {
    handle: Arc<NetworkHandle<T>>,
    summaries: SummaryMap,
    refresh_interval: Duration,
}

impl<T: RpcTransport> SummaryPublisher<T> {
    pub fn new(
        handle: Arc<NetworkHandle<T>>,
        summaries: SummaryMap,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            handle,
            summaries,
            refresh_interval,
        }
    }

    /// Refresh the snapshot once
    pub async fn run_cycle(&self) {
        let network = self.handle.network().to_string();

        let refreshed = async {
            let balance = self.handle.wallet().get_balance(None).await?;
            let height = self.handle.sync_height().await?;
            Ok::<_, WalletError>((balance, height))
        }
        .await;

        let mut summaries = self.summaries.write().await;
        match refreshed {
            Ok((balance, height)) => {
                summaries.insert(
                    network.clone(),
                    WalletSummary {
                        network,
                        balance: balance.balance,
                        unlocked_balance: balance.unlocked_balance,
                        sync_height: height,
                        daemon_reachable: true,
                        updated_at: Utc::now(),
                    },
                );
            }
            Err(err) => {
                debug!(network = %network, error = %err, "summary refresh failed");
                match summaries.get_mut(&network) {
                    Some(summary) => summary.daemon_reachable = false,
                    None => {
                        // Never had a good snapshot; publish whatever the
                        // session last knew so the network is still visible.
                        let session = self.handle.wallet().session().await;
                        summaries.insert(
                            network.clone(),
                            WalletSummary {
                                network,
                                balance: session.as_ref().map_or(0, |s| s.balance),
                                unlocked_balance: session
                                    .as_ref()
                                    .map_or(0, |s| s.unlocked_balance),
                                sync_height: session.as_ref().map_or(0, |s| s.sync_height),
                                daemon_reachable: false,
                                updated_at: Utc::now(),
                            },
                        );
                    }
                }
            }
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.refresh_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_cycle().await,
                _ = shutdown.recv() => {
                    info!(network = %self.handle.network(), "summary publisher shutting down");
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
    use crate::pool::{Backoff, SessionState};
    use crate::rpc::testing::ScriptedTransport;
    use crate::rpc::RpcClientError;
    use serde_json::json;

    fn network_config() -> NetworkConfig {
        toml::from_str(
            r#"
                crypto_code = "ZANO"
                daemon_uri = "http://127.0.0.1:11211"
                wallet_daemon_uri = "http://127.0.0.1:11233"
            "#,
        )
        .unwrap()
    }

    fn publisher_with(
        transport: ScriptedTransport,
    ) -> (
        SummaryPublisher<ScriptedTransport>,
        Arc<NetworkHandle<ScriptedTransport>>,
        SummaryMap,
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
        let summaries: SummaryMap = Arc::new(RwLock::new(HashMap::new()));
        let publisher =
            SummaryPublisher::new(handle.clone(), summaries.clone(), Duration::from_secs(30));
        (publisher, handle, summaries)
    }

    fn transport_err() -> crate::rpc::RpcResult<serde_json::Value> {
        Err(RpcClientError::Transport("connect timeout".to_string()))
    }

    #[tokio::test]
    async fn publishes_fresh_snapshot_on_success() {
        let transport = ScriptedTransport::new(vec![
            Ok(json!({})), // open_wallet
            Ok(json!({"balance": 700, "unlocked_balance": 500})),
            Ok(json!({"height": 4242, "status": "OK"})),
        ]);
        let (publisher, _handle, summaries) = publisher_with(transport);

        publisher.run_cycle().await;

        let summaries = summaries.read().await;
        let summary = summaries.get("ZANO").unwrap();
        assert_eq!(summary.balance, 700);
        assert_eq!(summary.unlocked_balance, 500);
        assert_eq!(summary.sync_height, 4242);
        assert!(summary.daemon_reachable);
    }

    #[tokio::test]
    async fn repeated_timeouts_degrade_session_but_keep_last_good_numbers() {
        let transport = ScriptedTransport::new(vec![
            Ok(json!({})),
            Ok(json!({"balance": 700, "unlocked_balance": 500})),
            Ok(json!({"height": 4242, "status": "OK"})),
        ]);
        let (publisher, handle, summaries) = publisher_with(transport.clone());

        publisher.run_cycle().await;

        for _ in 0..3 {
            transport.push(transport_err());
            publisher.run_cycle().await;
        }

        assert_eq!(handle.wallet().state().await, SessionState::Degraded);

        let summaries = summaries.read().await;
        let summary = summaries.get("ZANO").unwrap();
        assert_eq!(summary.balance, 700);
        assert_eq!(summary.unlocked_balance, 500);
        assert_eq!(summary.sync_height, 4242);
        assert!(!summary.daemon_reachable);
    }

    #[tokio::test]
    async fn unreachable_daemon_before_first_snapshot_is_still_visible() {
        let transport = ScriptedTransport::new(vec![transport_err()]);
        let (publisher, _handle, summaries) = publisher_with(transport);

        publisher.run_cycle().await;

        let summaries = summaries.read().await;
        let summary = summaries.get("ZANO").unwrap();
        assert_eq!(summary.balance, 0);
        assert!(!summary.daemon_reachable);
    }
}
