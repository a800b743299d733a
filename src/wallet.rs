//! Typed wallet and node daemon RPC operations
//!
//! Wraps the JSON-RPC transport with the wallet daemon surface used by the
//! watcher: wallet open/create, account and integrated-address creation,
//! balance queries, transfer lookup/listing, and transfer submission. The
//! node daemon side covers sync height and dev-only block generation.

use crate::rpc::{RpcClientError, RpcTransport};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WalletError {
    /// Network-level failure talking to the daemon. Retryable.
    #[error("transport error: {0}")]
    Transport(String),

    /// The wallet file already exists on the daemon
    #[error("wallet file already exists: {0}")]
    WalletExists(String),

    /// The daemon refused to open the wallet (wrong password, missing file).
    /// Actionable by an operator, so kept distinct from transport failures.
    #[error("open wallet failed ({code}): {message}")]
    OpenWallet { code: i64, message: String },

    /// Transfer rejected for lack of unlocked funds
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    /// Transfer rejected because a destination address did not parse
    #[error("invalid destination: {0}")]
    InvalidDestination(String),

    /// The session was closed by shutdown and is not reopened
    #[error("wallet session closed")]
    SessionClosed,

    /// Any other daemon-reported error, surfaced unmodified
    #[error("wallet rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
}

impl From<RpcClientError> for WalletError {
    fn from(err: RpcClientError) -> Self {
        match err {
            RpcClientError::Transport(msg) => WalletError::Transport(msg),
            RpcClientError::Rpc { code, message } => WalletError::Rpc { code, message },
        }
    }
}

impl WalletError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, WalletError::Transport(_))
    }

    /// True when an open failed because the wallet file does not exist yet,
    /// which callers answer by creating the wallet.
    pub fn is_missing_wallet_file(&self) -> bool {
        match self {
            WalletError::OpenWallet { message, .. } => {
                let message = message.to_lowercase();
                message.contains("not found")
                    || message.contains("no such file")
                    || message.contains("failed to open")
            }
            _ => false,
        }
    }
}

pub type WalletResult<T> = Result<T, WalletError>;

// Daemon error codes observed from Monero-lineage wallet daemons
const DAEMON_CODE_INVALID_ADDRESS: i64 = -2;
const DAEMON_CODE_NOT_ENOUGH_MONEY: i64 = -17;

// Wire models. Field names follow the daemon payloads exactly.

#[derive(Debug, Clone, Serialize)]
struct CreateWalletRequest<'a> {
    filename: &'a str,
    password: &'a str,
    language: &'a str,
}

#[derive(Debug, Clone, Serialize)]
struct OpenWalletRequest<'a> {
    filename: &'a str,
    password: &'a str,
}

/// Response of both create_wallet and create_account
#[derive(Debug, Clone, Deserialize)]
pub struct CreatedAccount {
    pub account_index: u64,
    pub address: String,
}

/// A deposit address embedding a daemon-chosen payment identifier.
/// The identifier is opaque; it is never re-derived locally.
#[derive(Debug, Clone, Deserialize)]
pub struct IntegratedAddress {
    pub integrated_address: String,
    pub payment_id: String,
}

#[derive(Debug, Clone, Serialize)]
struct GetBalanceRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    account_index: Option<u64>,
}

/// Balance snapshot in atomic units
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Balance {
    pub balance: u64,
    pub unlocked_balance: u64,
}

impl Balance {
    /// Unlocked funds can never exceed the total
    pub fn is_consistent(&self) -> bool {
        self.unlocked_balance <= self.balance
    }
}

#[derive(Debug, Clone, Serialize)]
struct GetTransferByTxidRequest<'a> {
    txid: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    account_index: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
struct GetTransfersRequest {
    #[serde(rename = "in")]
    incoming: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    account_index: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    min_height: Option<u64>,
}

/// One incoming transfer as the daemon reports it
#[derive(Debug, Clone, Deserialize)]
pub struct TransferDetail {
    pub txid: String,
    #[serde(default)]
    pub address: String,
    pub amount: u64,
    #[serde(default)]
    pub confirmations: u64,
    #[serde(default)]
    pub height: Option<u64>,
    #[serde(default)]
    pub payment_id: Option<String>,
    #[serde(default)]
    pub account_index: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct GetTransfersResponse {
    #[serde(rename = "in", default)]
    incoming: Vec<TransferDetail>,
}

#[derive(Debug, Clone, Deserialize)]
struct GetTransferByTxidResponse {
    transfer: TransferDetail,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferDestination {
    pub address: String,
    pub amount: u64,
}

#[derive(Debug, Clone, Serialize)]
struct TransferRequest<'a> {
    destinations: &'a [TransferDestination],
}

#[derive(Debug, Clone, Deserialize)]
struct TransferResponse {
    tx_hash: String,
}

#[derive(Debug, Clone, Serialize)]
struct GenerateBlocksRequest<'a> {
    wallet_address: &'a str,
    amount_of_blocks: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeInfo {
    pub height: u64,
}

/// One incoming transfer normalized for matching.
///
/// Re-derived on every poll and compared across polls for confirmation-count
/// changes; never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectedTransfer {
    pub txid: String,
    pub address: String,
    pub account_index: u64,
    pub amount: u64,
    pub confirmations: u64,
    pub height: Option<u64>,
    pub payment_id: Option<String>,
}

impl From<TransferDetail> for DetectedTransfer {
    fn from(detail: TransferDetail) -> Self {
        // Daemons report "no payment id" as an empty or all-zero string and
        // "not yet mined" as height 0.
        let payment_id = detail
            .payment_id
            .filter(|id| !id.is_empty() && !id.chars().all(|c| c == '0'));
        let height = detail.height.filter(|h| *h > 0);

        Self {
            txid: detail.txid,
            address: detail.address,
            account_index: detail.account_index,
            amount: detail.amount,
            confirmations: detail.confirmations,
            height,
            payment_id,
        }
    }
}

/// Typed operations against one wallet daemon endpoint
pub struct WalletRpcClient<T: RpcTransport> {
    transport: T,
}

impl<T: RpcTransport> WalletRpcClient<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    async fn call<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: &P,
    ) -> WalletResult<R> {
        let params = serde_json::to_value(params)
            .map_err(|e| WalletError::Transport(format!("encode {method}: {e}")))?;
        let value = self.transport.call(method, params).await?;
        serde_json::from_value(value)
            .map_err(|e| WalletError::Transport(format!("decode {method}: {e}")))
    }

    /// Create a new wallet file on the daemon
    pub async fn create_wallet(
        &self,
        filename: &str,
        password: &str,
        language: &str,
    ) -> WalletResult<CreatedAccount> {
        let request = CreateWalletRequest {
            filename,
            password,
            language,
        };

        match self.call("create_wallet", &request).await {
            Err(WalletError::Rpc { message, .. })
                if message.to_lowercase().contains("already exists") =>
            {
                Err(WalletError::WalletExists(filename.to_string()))
            }
            other => other,
        }
    }

    /// Open an existing wallet file
    pub async fn open_wallet(&self, filename: &str, password: &str) -> WalletResult<()> {
        let request = OpenWalletRequest { filename, password };

        match self
            .call::<_, serde_json::Value>("open_wallet", &request)
            .await
        {
            Ok(_) => Ok(()),
            Err(WalletError::Rpc { code, message }) => {
                Err(WalletError::OpenWallet { code, message })
            }
            Err(other) => Err(other),
        }
    }

    /// Create a new account in the open wallet
    pub async fn create_account(&self) -> WalletResult<CreatedAccount> {
        self.call("create_account", &serde_json::json!({})).await
    }

    /// Create an integrated address with a daemon-chosen payment identifier
    pub async fn create_address(&self) -> WalletResult<IntegratedAddress> {
        self.call("create_address", &serde_json::json!({})).await
    }

    /// Query total and unlocked balance in atomic units
    pub async fn get_balance(&self, account_index: Option<u64>) -> WalletResult<Balance> {
        let request = GetBalanceRequest { account_index };
        let balance: Balance = self.call("get_balance", &request).await?;

        if !balance.is_consistent() {
            return Err(WalletError::Transport(format!(
                "daemon reported unlocked balance {} above total {}",
                balance.unlocked_balance, balance.balance
            )));
        }

        Ok(balance)
    }

    /// Look up a single transfer by transaction id
    pub async fn get_transfer_by_txid(
        &self,
        txid: &str,
        account_index: Option<u64>,
    ) -> WalletResult<DetectedTransfer> {
        let request = GetTransferByTxidRequest {
            txid,
            account_index,
        };
        let response: GetTransferByTxidResponse =
            self.call("get_transfer_by_txid", &request).await?;
        Ok(response.transfer.into())
    }

    /// List incoming transfers, optionally from a height onward.
    /// Daemon-reported order is preserved.
    pub async fn list_incoming_transfers(
        &self,
        account_index: Option<u64>,
        min_height: Option<u64>,
    ) -> WalletResult<Vec<DetectedTransfer>> {
        let request = GetTransfersRequest {
            incoming: true,
            account_index,
            min_height,
        };
        let response: GetTransfersResponse = self.call("get_transfers", &request).await?;
        Ok(response.incoming.into_iter().map(Into::into).collect())
    }

    /// Submit a transfer to one or more destinations, returning the tx hash
    pub async fn transfer(&self, destinations: &[TransferDestination]) -> WalletResult<String> {
        if destinations.is_empty() {
            return Err(WalletError::InvalidDestination(
                "no destinations given".to_string(),
            ));
        }

        let request = TransferRequest { destinations };

        match self
            .call::<_, TransferResponse>("transfer", &request)
            .await
        {
            Ok(response) => Ok(response.tx_hash),
            Err(WalletError::Rpc { code, message }) => Err(classify_transfer_error(code, message)),
            Err(other) => Err(other),
        }
    }
}

fn classify_transfer_error(code: i64, message: String) -> WalletError {
    let lowered = message.to_lowercase();
    if code == DAEMON_CODE_NOT_ENOUGH_MONEY
        || lowered.contains("not enough money")
        || lowered.contains("insufficient")
    {
        WalletError::InsufficientFunds(message)
    } else if code == DAEMON_CODE_INVALID_ADDRESS
        || lowered.contains("invalid address")
        || lowered.contains("wrong address")
    {
        WalletError::InvalidDestination(message)
    } else {
        WalletError::Rpc { code, message }
    }
}

/// Typed operations against one node daemon endpoint
pub struct NodeRpcClient<T: RpcTransport> {
    transport: T,
}

impl<T: RpcTransport> NodeRpcClient<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Current chain height as the node sees it
    pub async fn get_info(&self) -> WalletResult<NodeInfo> {
        let value = self
            .transport
            .call("get_info", serde_json::json!({}))
            .await?;
        serde_json::from_value(value)
            .map_err(|e| WalletError::Transport(format!("decode get_info: {e}")))
    }

    /// Mine blocks to an address. Test networks only; callers enforce the guard.
    pub async fn generate_blocks(
        &self,
        wallet_address: &str,
        amount_of_blocks: u64,
    ) -> WalletResult<()> {
        let request = GenerateBlocksRequest {
            wallet_address,
            amount_of_blocks,
        };
        let params = serde_json::to_value(&request)
            .map_err(|e| WalletError::Transport(format!("encode generateblocks: {e}")))?;
        self.transport.call("generateblocks", params).await?;
        Ok(())
    }
}
