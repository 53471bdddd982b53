//! Loopback RPC transports for wallet engines
//!
//! Two request/response shapes are spoken:
//! - JSON-RPC 2.0 over HTTP (Electrum, monero-wallet-rpc, Ethereum nodes)
//! - plain JSON POSTs to `/<endpoint>` (monerod's daemon endpoints)
//!
//! Both sit behind [`RpcTransport`] so backends never see reqwest directly.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::Secret;
use crate::error::{Error, Result};

/// A request/response channel to one engine endpoint
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Invoke `method` with `params` and return the engine's result value
    async fn call(&self, method: &str, params: Value) -> Result<Value>;

    /// Where requests go (for logs)
    fn endpoint(&self) -> &str;
}

/// `http://127.0.0.1:<port>/<path>`; engines only ever listen on loopback
pub fn loopback_url(port: u16, path: &str) -> Result<String> {
    let base = Url::parse(&format!("http://127.0.0.1:{}/", port))
        .map_err(|e| Error::Config(format!("bad port {}: {}", port, e)))?;
    let url = base
        .join(path)
        .map_err(|e| Error::Config(format!("bad RPC path {:?}: {}", path, e)))?;
    Ok(url.to_string())
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

/// JSON-RPC 2.0 client over HTTP
pub struct JsonRpcClient {
    client: Client,
    url: String,
    credentials: Option<(String, Secret)>,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    /// Create a client for `url` with a per-request timeout
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
            credentials: None,
            next_id: AtomicU64::new(1),
        })
    }

    /// Authenticate every request with HTTP basic auth
    pub fn with_basic_auth(mut self, user: impl Into<String>, password: Secret) -> Self {
        self.credentials = Some((user.into(), password));
        self
    }
}

#[async_trait]
impl RpcTransport for JsonRpcClient {
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        debug!("RPC {} -> {}", method, self.url);

        let mut builder = self.client.post(&self.url).json(&request);
        if let Some((user, password)) = &self.credentials {
            builder = builder.basic_auth(user, Some(password.expose()));
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;

        let parsed: JsonRpcResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(_) if !status.is_success() => {
                return Err(Error::Rpc(format!("{} returned HTTP {}", method, status)));
            }
            Err(e) => {
                return Err(Error::MalformedResponse(format!(
                    "{} returned non JSON-RPC body: {}",
                    method, e
                )));
            }
        };

        if let Some(error) = parsed.error {
            let detail = error
                .data
                .map(|d| format!(" ({})", d))
                .unwrap_or_default();
            return Err(Error::Rpc(format!(
                "{} failed with code {}: {}{}",
                method, error.code, error.message, detail
            )));
        }

        Ok(parsed.result.unwrap_or(Value::Null))
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}

/// Plain JSON-over-HTTP client: `call("getheight", body)` posts to `<base>/getheight`
pub struct EndpointClient {
    client: Client,
    base_url: String,
}

impl EndpointClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl RpcTransport for EndpointClient {
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let url = format!("{}/{}", self.base_url, method);
        debug!("POST {}", url);

        let response = self.client.post(&url).json(&params).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(Error::Rpc(format!(
                "{} returned HTTP {}: {}",
                method, status, body
            )));
        }

        if body.trim().is_empty() {
            return Ok(Value::Null);
        }

        Ok(serde_json::from_str(&body)?)
    }

    fn endpoint(&self) -> &str {
        &self.base_url
    }
}
