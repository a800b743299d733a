//! Wallet daemon session pool
//!
//! Tracks one open wallet session per configured network (plus an optional
//! cash-cow session for operator float) through an explicit per-network
//! state machine. Opens are serialized per network, transport failures move
//! a session to degraded with bounded exponential backoff, and the
//! last-known-good balance/height snapshot keeps serving read-only status
//! queries while the daemon is unreachable.

use crate::config::{Config, NetworkConfig};
use crate::rpc::{DaemonRpc, RpcTransport};
use crate::wallet::{
    Balance, CreatedAccount, DetectedTransfer, IntegratedAddress, NodeRpcClient,
    TransferDestination, WalletError, WalletResult, WalletRpcClient,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Seed phrase language passed to create_wallet
const WALLET_LANGUAGE: &str = "English";

/// Lifecycle of one wallet daemon session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unconfigured,
    Configuring,
    Opening,
    Ready,
    Degraded,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Unconfigured => "unconfigured",
            SessionState::Configuring => "configuring",
            SessionState::Opening => "opening",
            SessionState::Ready => "ready",
            SessionState::Degraded => "degraded",
            SessionState::Closed => "closed",
        };
        write!(f, "{name}")
    }
}

/// Last-known state of one opened wallet file
#[derive(Debug, Clone, Serialize)]
pub struct WalletSession {
    pub network: String,
    pub wallet_file: String,
    pub balance: u64,
    pub unlocked_balance: u64,
    pub sync_height: u64,
}

/// Bounded exponential backoff applied to a failing daemon
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(60),
        }
    }
}

impl Backoff {
    fn delay(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1).min(5);
        let delay = self.base.saturating_mul(2u32.saturating_pow(exponent));
        delay.min(self.cap)
    }
}

struct SlotState {
    state: SessionState,
    session: Option<WalletSession>,
    consecutive_failures: u32,
    next_attempt: Option<Instant>,
}

/// One wallet daemon session.
///
/// All state transitions happen under the slot mutex, so at most one
/// open_wallet/create_wallet call is ever in flight per slot; concurrent
/// callers wait for it instead of issuing a second open.
pub struct WalletSlot<T: RpcTransport> {
    network: String,
    filename: String,
    password: String,
    client: WalletRpcClient<T>,
    backoff: Backoff,
    slot: Mutex<SlotState>,
}

impl<T: RpcTransport> WalletSlot<T> {
    fn new(
        network: String,
        filename: String,
        password: String,
        client: WalletRpcClient<T>,
        backoff: Backoff,
    ) -> Self {
        Self {
            network,
            filename,
            password,
            client,
            backoff,
            slot: Mutex::new(SlotState {
                state: SessionState::Configuring,
                session: None,
                consecutive_failures: 0,
                next_attempt: None,
            }),
        }
    }

    pub async fn state(&self) -> SessionState {
        self.slot.lock().await.state
    }

    /// Last-known-good session snapshot, served even while degraded
    pub async fn session(&self) -> Option<WalletSession> {
        self.slot.lock().await.session.clone()
    }

    /// Release the session. Closed slots are not reopened.
    pub async fn close(&self) {
        let mut slot = self.slot.lock().await;
        slot.state = SessionState::Closed;
        slot.session = None;
        info!(network = %self.network, wallet = %self.filename, "wallet session closed");
    }

    fn attempt_due(slot: &SlotState) -> bool {
        slot.next_attempt.map_or(true, |at| Instant::now() >= at)
    }

    /// Ensure the wallet is open, opening or creating the wallet file on
    /// first use. A failed or timed-out open counts as a failure and is
    /// retried from scratch on the next due attempt.
    async fn ensure_ready(&self) -> WalletResult<()> {
        let mut slot = self.slot.lock().await;

        match slot.state {
            SessionState::Ready => Ok(()),
            SessionState::Closed => Err(WalletError::SessionClosed),
            SessionState::Degraded => {
                // The daemon still holds the open wallet; the next due call
                // probes it and a success restores the session.
                if Self::attempt_due(&slot) {
                    Ok(())
                } else {
                    Err(WalletError::Transport(format!(
                        "daemon for {} in retry backoff",
                        self.network
                    )))
                }
            }
            SessionState::Unconfigured => Err(WalletError::SessionClosed),
            SessionState::Configuring | SessionState::Opening => {
                if !Self::attempt_due(&slot) {
                    return Err(WalletError::Transport(format!(
                        "daemon for {} in retry backoff",
                        self.network
                    )));
                }

                slot.state = SessionState::Opening;
                match self.open_or_create().await {
                    Ok(()) => {
                        slot.state = SessionState::Ready;
                        slot.session = Some(WalletSession {
                            network: self.network.clone(),
                            wallet_file: self.filename.clone(),
                            balance: 0,
                            unlocked_balance: 0,
                            sync_height: 0,
                        });
                        slot.consecutive_failures = 0;
                        slot.next_attempt = None;
                        info!(network = %self.network, wallet = %self.filename, "wallet session ready");
                        Ok(())
                    }
                    Err(err) => {
                        slot.state = SessionState::Configuring;
                        slot.consecutive_failures += 1;
                        let delay = self.backoff.delay(slot.consecutive_failures);
                        slot.next_attempt = Some(Instant::now() + delay);
                        warn!(
                            network = %self.network,
                            wallet = %self.filename,
                            error = %err,
                            retry_in_secs = delay.as_secs(),
                            "failed to open wallet"
                        );
                        Err(err)
                    }
                }
            }
        }
    }

    async fn open_or_create(&self) -> WalletResult<()> {
        match self.client.open_wallet(&self.filename, &self.password).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_missing_wallet_file() => {
                info!(network = %self.network, wallet = %self.filename, "wallet file missing, creating it");
                match self
                    .client
                    .create_wallet(&self.filename, &self.password, WALLET_LANGUAGE)
                    .await
                {
                    Ok(account) => {
                        debug!(network = %self.network, address = %account.address, "wallet created");
                        Ok(())
                    }
                    Err(WalletError::WalletExists(_)) => {
                        // Raced an external create of the same file; opening
                        // again settles it.
                        self.client.open_wallet(&self.filename, &self.password).await
                    }
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn note_success(&self) {
        let mut slot = self.slot.lock().await;
        if slot.state == SessionState::Degraded {
            info!(network = %self.network, wallet = %self.filename, "wallet session recovered");
            slot.state = SessionState::Ready;
        }
        slot.consecutive_failures = 0;
        slot.next_attempt = None;
    }

    async fn note_failure(&self, err: &WalletError) {
        let mut slot = self.slot.lock().await;
        if slot.state == SessionState::Ready {
            warn!(network = %self.network, wallet = %self.filename, error = %err, "wallet session degraded");
        }
        if matches!(slot.state, SessionState::Ready | SessionState::Degraded) {
            slot.state = SessionState::Degraded;
        }
        slot.consecutive_failures += 1;
        slot.next_attempt = Some(Instant::now() + self.backoff.delay(slot.consecutive_failures));
    }

    /// Record the call outcome for the state machine. Daemon-reported
    /// semantic errors do not degrade the session.
    async fn track<R>(&self, result: WalletResult<R>) -> WalletResult<R> {
        match &result {
            Ok(_) => self.note_success().await,
            Err(err) if err.is_retryable() => self.note_failure(err).await,
            Err(_) => {}
        }
        result
    }

    pub async fn get_balance(&self, account_index: Option<u64>) -> WalletResult<Balance> {
        self.ensure_ready().await?;
        let result = self.track(self.client.get_balance(account_index).await).await;

        if let Ok(balance) = &result {
            let mut slot = self.slot.lock().await;
            if let Some(session) = slot.session.as_mut() {
                session.balance = balance.balance;
                session.unlocked_balance = balance.unlocked_balance;
            }
        }

        result
    }

    pub async fn create_account(&self) -> WalletResult<CreatedAccount> {
        self.ensure_ready().await?;
        self.track(self.client.create_account().await).await
    }

    pub async fn create_address(&self) -> WalletResult<IntegratedAddress> {
        self.ensure_ready().await?;
        self.track(self.client.create_address().await).await
    }

    pub async fn get_transfer_by_txid(
        &self,
        txid: &str,
        account_index: Option<u64>,
    ) -> WalletResult<DetectedTransfer> {
        self.ensure_ready().await?;
        self.track(self.client.get_transfer_by_txid(txid, account_index).await)
            .await
    }

    pub async fn list_incoming_transfers(
        &self,
        account_index: Option<u64>,
        min_height: Option<u64>,
    ) -> WalletResult<Vec<DetectedTransfer>> {
        self.ensure_ready().await?;
        self.track(
            self.client
                .list_incoming_transfers(account_index, min_height)
                .await,
        )
        .await
    }

    pub async fn transfer(&self, destinations: &[TransferDestination]) -> WalletResult<String> {
        self.ensure_ready().await?;
        self.track(self.client.transfer(destinations).await).await
    }

    async fn record_height(&self, height: u64) {
        let mut slot = self.slot.lock().await;
        if let Some(session) = slot.session.as_mut() {
            session.sync_height = height;
        }
    }
}

/// All daemon endpoints for one network
pub struct NetworkHandle<T: RpcTransport> {
    config: NetworkConfig,
    primary: WalletSlot<T>,
    cashcow: Option<WalletSlot<T>>,
    node: NodeRpcClient<T>,
}

impl<T: RpcTransport> NetworkHandle<T> {
    pub fn new(
        config: NetworkConfig,
        wallet_transport: T,
        node_transport: T,
        cashcow_transport: Option<T>,
        backoff: Backoff,
    ) -> Self {
        let network = config.crypto_code.clone();
        let filename = config.wallet_filename();
        let password = config.wallet_password.clone();

        let primary = WalletSlot::new(
            network.clone(),
            filename.clone(),
            password.clone(),
            WalletRpcClient::new(wallet_transport),
            backoff,
        );
        let cashcow = cashcow_transport.map(|transport| {
            WalletSlot::new(
                network.clone(),
                format!("{filename}-cashcow"),
                password,
                WalletRpcClient::new(transport),
                backoff,
            )
        });

        Self {
            config,
            primary,
            cashcow,
            node: NodeRpcClient::new(node_transport),
        }
    }

    pub fn network(&self) -> &str {
        &self.config.crypto_code
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn wallet(&self) -> &WalletSlot<T> {
        &self.primary
    }

    pub fn cashcow(&self) -> Option<&WalletSlot<T>> {
        self.cashcow.as_ref()
    }

    /// Chain height as the node daemon sees it, recorded on the session
    /// snapshot for status queries
    pub async fn sync_height(&self) -> WalletResult<u64> {
        let info = self.node.get_info().await?;
        self.primary.record_height(info.height).await;
        Ok(info.height)
    }

    /// Mine blocks to an address. Refused on mainnet networks.
    pub async fn generate_blocks(&self, wallet_address: &str, blocks: u64) -> anyhow::Result<()> {
        if self.config.mainnet {
            anyhow::bail!(
                "refusing to generate blocks on mainnet network {}",
                self.config.crypto_code
            );
        }
        self.node.generate_blocks(wallet_address, blocks).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.primary.close().await;
        if let Some(cashcow) = &self.cashcow {
            cashcow.close().await;
        }
    }
}

/// One handle per fully configured network
pub struct WalletPool<T: RpcTransport> {
    handles: HashMap<String, Arc<NetworkHandle<T>>>,
    unconfigured: Vec<String>,
}

impl WalletPool<DaemonRpc> {
    /// Build daemon clients for every fully configured network. A network
    /// missing either daemon URI is disabled with a startup warning and
    /// excluded entirely.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut handles = HashMap::new();
        let mut unconfigured = Vec::new();

        for network in &config.networks {
            let code = network.crypto_code.to_uppercase();

            let (Some(daemon_uri), Some(wallet_daemon_uri)) =
                (&network.daemon_uri, &network.wallet_daemon_uri)
            else {
                if network.daemon_uri.is_none() {
                    warn!(network = %code, "daemon URI is not configured");
                }
                if network.wallet_daemon_uri.is_none() {
                    warn!(network = %code, "wallet daemon URI is not configured");
                }
                warn!(network = %code, "network disabled as it is not fully configured");
                unconfigured.push(code);
                continue;
            };

            let timeout = Duration::from_secs(network.rpc_timeout_secs);
            let auth = network.rpc_auth();

            let node = DaemonRpc::new(daemon_uri, auth.clone(), timeout)?;
            let wallet = DaemonRpc::new(wallet_daemon_uri, auth.clone(), timeout)?;
            let cashcow = match &network.cashcow_wallet_daemon_uri {
                Some(uri) => Some(DaemonRpc::new(uri, auth.clone(), timeout)?),
                None => None,
            };

            let mut network = network.clone();
            network.crypto_code = code.clone();
            let handle = NetworkHandle::new(network, wallet, node, cashcow, Backoff::default());

            info!(network = %code, "network enabled");
            handles.insert(code, Arc::new(handle));
        }

        Ok(Self {
            handles,
            unconfigured,
        })
    }
}

impl<T: RpcTransport> WalletPool<T> {
    pub fn handle(&self, network: &str) -> Option<Arc<NetworkHandle<T>>> {
        self.handles.get(&network.to_uppercase()).cloned()
    }

    /// Session state for any configured or disabled network
    pub async fn session_state(&self, network: &str) -> SessionState {
        let code = network.to_uppercase();
        match self.handles.get(&code) {
            Some(handle) => handle.wallet().state().await,
            None => SessionState::Unconfigured,
        }
    }

    pub fn handles(&self) -> impl Iterator<Item = &Arc<NetworkHandle<T>>> {
        self.handles.values()
    }

    pub fn unconfigured(&self) -> &[String] {
        &self.unconfigured
    }

    pub async fn close_all(&self) {
        for handle in self.handles.values() {
            handle.close().await;
        }
    }
}
