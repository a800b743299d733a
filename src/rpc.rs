//! JSON-RPC transport for daemon endpoints
//!
//! One `DaemonRpc` per configured endpoint (node daemon, wallet daemon,
//! cash-cow wallet daemon). Distinguishes network-level failures from
//! daemon-reported error envelopes so callers can decide retry eligibility.
//! No retries happen at this layer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcClientError {
    /// Network failure, timeout, non-2xx status, or malformed body. Retryable.
    #[error("transport error: {0}")]
    Transport(String),

    /// Error envelope reported by the daemon. Not retryable without a state change.
    #[error("daemon error {code}: {message}")]
    Rpc { code: i64, message: String },
}

impl RpcClientError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RpcClientError::Transport(_))
    }
}

pub type RpcResult<T> = Result<T, RpcClientError>;

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: &'static str,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    result: Option<serde_json::Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// Raw JSON-RPC exchange against one endpoint.
///
/// The seam the typed clients sit on; tests script this with fakes.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn call(&self, method: &str, params: serde_json::Value) -> RpcResult<serde_json::Value>;
}

/// HTTP JSON-RPC client for one daemon endpoint
pub struct DaemonRpc {
    url: String,
    client: reqwest::Client,
    auth: Option<(String, String)>,
}

impl DaemonRpc {
    /// Create a client for `url` (e.g. "http://127.0.0.1:11233").
    /// Optional basic auth via (user, pass).
    pub fn new(url: &str, auth: Option<(String, String)>, timeout: Duration) -> RpcResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcClientError::Transport(e.to_string()))?;

        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            client,
            auth,
        })
    }
}

#[async_trait]
impl RpcTransport for DaemonRpc {
    async fn call(&self, method: &str, params: serde_json::Value) -> RpcResult<serde_json::Value> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: "0",
            method,
            params,
        };

        let mut builder = self
            .client
            .post(format!("{}/json_rpc", self.url))
            .json(&request);

        if let Some((user, pass)) = &self.auth {
            builder = builder.basic_auth(user, Some(pass));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| RpcClientError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RpcClientError::Transport(format!(
                "http status {status} from {method}"
            )));
        }

        let body: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| RpcClientError::Transport(format!("decode {method}: {e}")))?;

        if let Some(error) = body.error {
            return Err(RpcClientError::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        body.result
            .ok_or_else(|| RpcClientError::Transport(format!("missing result for {method}")))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn client(server: &MockServer) -> DaemonRpc {
        DaemonRpc::new(&server.base_url(), None, Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn request_envelope_matches_daemon_payload() {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: "0",
            method: "get_balance",
            params: json!({"account_index": 0}),
        };

        let serialized = serde_json::to_value(&request).unwrap();
        assert_eq!(
            serialized,
            json!({
                "jsonrpc": "2.0",
                "id": "0",
                "method": "get_balance",
                "params": {"account_index": 0}
            })
        );
    }

    #[tokio::test]
    async fn returns_result_field_on_success() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/json_rpc");
                then.status(200).json_body(json!({
                    "jsonrpc": "2.0",
                    "id": "0",
                    "result": {"balance": 7, "unlocked_balance": 5}
                }));
            })
            .await;

        let rpc = client(&server);
        let result = rpc.call("get_balance", json!({})).await.unwrap();
        mock.assert_async().await;
        assert_eq!(result["balance"], 7);
    }

    #[tokio::test]
    async fn maps_error_envelope_to_rpc_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/json_rpc");
                then.status(200).json_body(json!({
                    "jsonrpc": "2.0",
                    "id": "0",
                    "error": {"code": -17, "message": "not enough money"}
                }));
            })
            .await;

        let rpc = client(&server);
        let err = rpc.call("transfer", json!({})).await.unwrap_err();
        match err {
            RpcClientError::Rpc { code, message } => {
                assert_eq!(code, -17);
                assert_eq!(message, "not enough money");
                assert!(!RpcClientError::Rpc { code, message }.is_retryable());
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn maps_http_failure_to_transport_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/json_rpc");
                then.status(502);
            })
            .await;

        let rpc = client(&server);
        let err = rpc.call("get_balance", json!({})).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, RpcClientError::Transport(_)));
    }

    #[tokio::test]
    async fn missing_result_is_a_transport_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/json_rpc");
                then.status(200).json_body(json!({"jsonrpc": "2.0", "id": "0"}));
            })
            .await;

        let rpc = client(&server);
        let err = rpc.call("open_wallet", json!({})).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
