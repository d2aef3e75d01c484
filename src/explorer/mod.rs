//! Etherscan-compatible explorer client (Polygonscan, Etherscan/Sepolia).
//!
//! The reconciliation core only needs three calls, captured by the
//! `ExplorerApi` trait: normal transactions of an address, a transaction
//! by hash, and NFT transfers of an address. `ExplorerClient` implements
//! them over the REST API and owns the plumbing:
//! - response envelope interpretation (`OK` / "No transactions found" /
//!   rate-limit text / proxy `result: null`)
//! - page/offset pagination for list endpoints
//! - retry with exponential backoff on timeouts, 429/5xx and rate-limit
//!   answers, surfacing `ExplorerError::Exhausted` when attempts run out
//! - local call throttling (`throttle::CallThrottle`)

pub mod throttle;
pub mod types;

use crate::config::{ExplorerConfig, NetworkConfig};
use alloy::primitives::{Address, TxHash, U256};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use self::throttle::CallThrottle;
use self::types::{to_hex, RawBalance, RawTokenTransfer, RawTransaction, TokenStandard};

/// Rate-limit answers come back as HTTP 200 with one of these in `result`.
const RATE_LIMIT_MARKERS: [&str; 2] = ["Max rate", "Max calls"];

/// Non-OK `message`s that just mean "nothing here".
const EMPTY_MARKERS: [&str; 2] = ["No transactions found", "No records found"];

/// Pause after a rate-limit answer before retrying.
const RATE_LIMIT_PAUSE: Duration = Duration::from_millis(50);

/// `balancemulti` accepts at most 20 addresses per call.
const BALANCE_BATCH: usize = 20;

const END_BLOCK: &str = "99999999";

#[derive(Error, Debug)]
pub enum ExplorerError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("explorer returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected explorer payload: {0}")]
    UnexpectedPayload(String),
    #[error("{action} listing refused at page {page}, earlier pages would be incomplete: {reason}")]
    Truncated {
        action: String,
        page: usize,
        reason: String,
    },
    #[error("{action} gave up after {attempts} attempts: {last_error}")]
    Exhausted {
        action: String,
        attempts: u32,
        last_error: String,
    },
}

/// The slice of the explorer API the reconciliation core consumes.
/// Empty vectors / `None` mean the explorer has no data, not an error.
#[async_trait]
pub trait ExplorerApi: Send + Sync {
    async fn normal_transactions(&self, address: Address)
        -> Result<Vec<RawTransaction>, ExplorerError>;

    async fn transaction_by_hash(&self, hash: TxHash)
        -> Result<Option<RawTransaction>, ExplorerError>;

    async fn token_transfers(
        &self,
        standard: TokenStandard,
        address: Address,
    ) -> Result<Vec<RawTokenTransfer>, ExplorerError>;
}

/// How a single explorer response should be treated.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Data(Value),
    Empty,
    RateLimited(String),
    /// Explorer-level refusal (bad parameters, unknown action, ...).
    Rejected(String),
}

/// Classify an explorer JSON response.
///
/// Account endpoints answer `{"status","message","result"}`; proxy
/// endpoints answer JSON-RPC style `{"jsonrpc","id","result"|"error"}`.
pub fn interpret_payload(payload: Value) -> Result<Envelope, ExplorerError> {
    let obj = match payload {
        Value::Object(obj) => obj,
        other => return Err(ExplorerError::UnexpectedPayload(other.to_string())),
    };

    if let Some(message) = obj.get("message").and_then(Value::as_str) {
        if message != "OK" {
            if EMPTY_MARKERS.iter().any(|m| message.starts_with(m)) {
                return Ok(Envelope::Empty);
            }
            let result = match obj.get("result") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            if RATE_LIMIT_MARKERS.iter().any(|m| result.contains(m)) {
                return Ok(Envelope::RateLimited(result));
            }
            return Ok(Envelope::Rejected(format!("{message}: {result}")));
        }
    }

    match obj.get("result") {
        Some(Value::Null) => Ok(Envelope::Empty),
        Some(result) => Ok(Envelope::Data(result.clone())),
        None => match obj.get("error") {
            Some(error) => Ok(Envelope::Rejected(error.to_string())),
            None => Err(ExplorerError::UnexpectedPayload(Value::Object(obj).to_string())),
        },
    }
}

/// Native balance of one account, in wei.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountBalance {
    pub account: Address,
    pub balance: U256,
}

/// REST client for one explorer network.
pub struct ExplorerClient {
    network: String,
    endpoint: String,
    api_key: String,
    http: reqwest::Client,
    throttle: Mutex<CallThrottle>,
    page_size: usize,
    max_attempts: u32,
    retry_backoff: Duration,
}

impl ExplorerClient {
    pub fn new(
        network: &str,
        net: &NetworkConfig,
        settings: &ExplorerConfig,
    ) -> Result<Self, ExplorerError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;

        Ok(Self {
            network: network.to_string(),
            endpoint: net.endpoint.clone(),
            api_key: net.api_key.clone(),
            http,
            throttle: Mutex::new(CallThrottle::new(net.calls_per_sec)),
            page_size: settings.page_size.max(1),
            max_attempts: settings.max_attempts.max(1),
            retry_backoff: Duration::from_millis(settings.retry_backoff_ms),
        })
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    /// Issue one GET with throttling and retries. `Ok(None)` is an empty
    /// or refused answer.
    async fn call(&self, params: &[(&str, String)]) -> Result<Option<Value>, ExplorerError> {
        match self.call_envelope(params).await? {
            Envelope::Data(value) => Ok(Some(value)),
            Envelope::Rejected(reason) => {
                warn!(
                    network = %self.network,
                    action = %action_of(params),
                    reason = %reason,
                    "explorer refused request"
                );
                Ok(None)
            }
            Envelope::Empty | Envelope::RateLimited(_) => Ok(None),
        }
    }

    /// Like `call`, but hands refusals back to the caller. Rate-limit
    /// answers are retried here and never returned.
    async fn call_envelope(&self, params: &[(&str, String)]) -> Result<Envelope, ExplorerError> {
        let action = action_of(params);
        let mut delay = self.retry_backoff;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.throttle.lock().await.acquire().await;

            let outcome = self
                .http
                .get(&self.endpoint)
                .query(params)
                .query(&[("apikey", &self.api_key)])
                .send()
                .await;

            let last_error = match outcome {
                Ok(resp) => {
                    let status = resp.status();
                    if status.as_u16() == 429 || status.is_server_error() {
                        format!("HTTP {status}")
                    } else if !status.is_success() {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(ExplorerError::Status {
                            status: status.as_u16(),
                            body,
                        });
                    } else {
                        let payload: Value = resp.json().await?;
                        match interpret_payload(payload)? {
                            Envelope::RateLimited(reason) => {
                                debug!(network = %self.network, reason = %reason, "rate limited by explorer");
                                tokio::time::sleep(RATE_LIMIT_PAUSE).await;
                                reason
                            }
                            envelope => return Ok(envelope),
                        }
                    }
                }
                Err(e) if e.is_timeout() || e.is_connect() => e.to_string(),
                Err(e) => return Err(ExplorerError::Request(e)),
            };

            if attempt >= self.max_attempts {
                return Err(ExplorerError::Exhausted {
                    action,
                    attempts: attempt,
                    last_error,
                });
            }

            warn!(
                network = %self.network,
                action = %action,
                attempt = attempt,
                error = %last_error,
                "explorer call failed, retrying"
            );
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }

    /// Walk a paginated list endpoint until a short or empty page.
    async fn call_paginated(&self, params: &[(&str, String)]) -> Result<Vec<Value>, ExplorerError> {
        let mut results = Vec::new();
        let mut page = 1usize;

        loop {
            let mut page_params = params.to_vec();
            page_params.push(("page", page.to_string()));
            page_params.push(("offset", self.page_size.to_string()));
            page_params.push(("startblock", "0".to_string()));
            page_params.push(("endblock", END_BLOCK.to_string()));

            let batch = match self.call_envelope(&page_params).await? {
                Envelope::Data(Value::Array(items)) => items,
                Envelope::Data(other) => return Err(ExplorerError::UnexpectedPayload(other.to_string())),
                Envelope::Empty | Envelope::RateLimited(_) => break,
                Envelope::Rejected(reason) if page == 1 => {
                    warn!(
                        network = %self.network,
                        action = %action_of(params),
                        reason = %reason,
                        "explorer refused request"
                    );
                    break;
                }
                Envelope::Rejected(reason) => {
                    return Err(ExplorerError::Truncated {
                        action: action_of(params),
                        page,
                        reason,
                    });
                }
            };

            let len = batch.len();
            results.extend(batch);
            if len < self.page_size {
                break;
            }
            page += 1;
            debug!(network = %self.network, page = page, "fetching next page");
        }

        Ok(results)
    }

    /// Native balances for `addresses`, batched through `balancemulti`.
    pub async fn balances(&self, addresses: &[Address]) -> Result<Vec<AccountBalance>, ExplorerError> {
        let mut balances = Vec::with_capacity(addresses.len());

        for chunk in addresses.chunks(BALANCE_BATCH) {
            if let [single] = chunk {
                let params = [
                    ("module", "account".to_string()),
                    ("action", "balance".to_string()),
                    ("address", to_hex(single)),
                    ("tag", "latest".to_string()),
                ];
                if let Some(value) = self.call(&params).await? {
                    let balance = types::parse_value(&value)
                        .map_err(|e| ExplorerError::UnexpectedPayload(e.to_string()))?;
                    balances.push(AccountBalance {
                        account: *single,
                        balance,
                    });
                }
                continue;
            }

            let joined = chunk.iter().map(to_hex).collect::<Vec<_>>().join(",");
            let params = [
                ("module", "account".to_string()),
                ("action", "balancemulti".to_string()),
                ("address", joined),
                ("tag", "latest".to_string()),
            ];
            let Some(value) = self.call(&params).await? else {
                continue;
            };
            let entries: Vec<RawBalance> = serde_json::from_value(value)
                .map_err(|e| ExplorerError::UnexpectedPayload(e.to_string()))?;
            for entry in entries {
                let account = entry
                    .account
                    .as_deref()
                    .and_then(|a| types::parse_address("account", a).ok().flatten());
                let balance = entry
                    .balance
                    .as_deref()
                    .and_then(|b| types::parse_value(&Value::String(b.to_string())).ok());
                match (account, balance) {
                    (Some(account), Some(balance)) => balances.push(AccountBalance { account, balance }),
                    _ => warn!(network = %self.network, entry = ?entry, "skipping malformed balance entry"),
                }
            }
        }

        Ok(balances)
    }
}

fn action_of(params: &[(&str, String)]) -> String {
    params
        .iter()
        .find(|(k, _)| *k == "action")
        .map(|(_, v)| v.clone())
        .unwrap_or_default()
}

/// Deserialize list items one by one so a single odd record does not
/// sink the batch.
fn decode_items<T: serde::de::DeserializeOwned>(network: &str, items: Vec<Value>) -> Vec<T> {
    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value(item) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(network = %network, error = %e, "skipping malformed explorer record");
                None
            }
        })
        .collect()
}

#[async_trait]
impl ExplorerApi for ExplorerClient {
    async fn normal_transactions(&self, address: Address) -> Result<Vec<RawTransaction>, ExplorerError> {
        let params = [
            ("module", "account".to_string()),
            ("action", "txlist".to_string()),
            ("address", to_hex(address)),
            ("sort", "asc".to_string()),
        ];
        let items = self.call_paginated(&params).await?;
        info!(
            network = %self.network,
            address = %to_hex(address),
            count = items.len(),
            "normal transactions fetched"
        );
        Ok(decode_items(&self.network, items))
    }

    async fn transaction_by_hash(&self, hash: TxHash) -> Result<Option<RawTransaction>, ExplorerError> {
        let params = [
            ("module", "proxy".to_string()),
            ("action", "eth_getTransactionByHash".to_string()),
            ("txhash", to_hex(hash)),
        ];
        match self.call(&params).await? {
            Some(value @ Value::Object(_)) => Ok(decode_items(&self.network, vec![value]).pop()),
            Some(other) => Err(ExplorerError::UnexpectedPayload(other.to_string())),
            None => Ok(None),
        }
    }

    async fn token_transfers(
        &self,
        standard: TokenStandard,
        address: Address,
    ) -> Result<Vec<RawTokenTransfer>, ExplorerError> {
        let params = [
            ("module", "account".to_string()),
            ("action", standard.action().to_string()),
            ("address", to_hex(address)),
            ("sort", "asc".to_string()),
        ];
        let items = self.call_paginated(&params).await?;
        info!(
            network = %self.network,
            address = %to_hex(address),
            standard = %standard,
            count = items.len(),
            "token transfers fetched"
        );
        Ok(decode_items(&self.network, items))
    }
}
