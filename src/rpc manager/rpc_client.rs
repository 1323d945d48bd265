//! JSON-RPC 2.0 endpoint over HTTP

use super::endpoint::RpcEndpoint;
use super::rpc_errors::{RpcError, RpcResult};
use crate::metrics::metrics;
use crate::types::{Address, Block, BlockTransaction, Receipt, TxHash};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

/// HTTP JSON-RPC endpoint
#[derive(Debug)]
pub struct JsonRpcEndpoint {
    name: String,
    url: String,
    client: reqwest::Client,
    timeout: Duration,
    request_id: AtomicU64,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBlock {
    number: String,
    hash: TxHash,
    parent_hash: TxHash,
    #[serde(default)]
    transactions: Vec<RawTransaction>,
}

#[derive(Deserialize)]
struct RawTransaction {
    hash: TxHash,
    from: Address,
    #[serde(default)]
    to: Option<Address>,
    nonce: String,
    #[serde(default)]
    value: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    transaction_hash: TxHash,
    block_number: String,
    block_hash: TxHash,
    #[serde(default)]
    status: Option<String>,
    gas_used: String,
    #[serde(default)]
    effective_gas_price: Option<String>,
    #[serde(default)]
    blob_gas_used: Option<String>,
    #[serde(default)]
    blob_gas_price: Option<String>,
    #[serde(default)]
    logs: Vec<Value>,
}

/// Parse a `0x`-prefixed hex quantity, saturating at `u128::MAX`
pub fn parse_quantity(value: &str) -> Option<u128> {
    let digits = value.strip_prefix("0x")?;
    if digits.is_empty() {
        return Some(0);
    }
    let trimmed = digits.trim_start_matches('0');
    if trimmed.len() > 32 {
        return trimmed
            .chars()
            .all(|c| c.is_ascii_hexdigit())
            .then_some(u128::MAX);
    }
    if trimmed.is_empty() {
        return Some(0);
    }
    u128::from_str_radix(trimmed, 16).ok()
}

fn quantity_u64(value: &str) -> Option<u64> {
    parse_quantity(value).and_then(|v| u64::try_from(v).ok())
}

impl JsonRpcEndpoint {
    pub fn new(url: impl Into<String>, timeout: Duration) -> RpcResult<Self> {
        let url = url.into();
        let name = reqwest::Url::parse(&url)
            .ok()
            .and_then(|u| u.host_str().map(|h| match u.port() {
                Some(port) => format!("{}:{}", h, port),
                None => h.to_string(),
            }))
            .unwrap_or_else(|| url.clone());
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::Transport {
                endpoint: name.clone(),
                message: e.to_string(),
            })?;
        Ok(Self {
            name,
            url,
            client,
            timeout,
            request_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> RpcResult<T> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let start = Instant::now();
        let result = self.client.post(&self.url).json(&body).send().await;
        metrics()
            .rpc_latency
            .observe(start.elapsed().as_secs_f64());

        let response = result.map_err(|e| self.map_transport(e))?;
        let decoded: RpcResponse = response.json().await.map_err(|e| self.map_transport(e))?;

        trace!(endpoint = %self.name, method, id, "RPC call completed");

        if let Some(err) = decoded.error {
            return Err(RpcError::from_response(&self.name, err.code, &err.message));
        }
        serde_json::from_value(decoded.result.unwrap_or(Value::Null)).map_err(|e| {
            RpcError::Decode {
                endpoint: self.name.clone(),
                message: format!("{}: {}", method, e),
            }
        })
    }

    fn map_transport(&self, err: reqwest::Error) -> RpcError {
        if err.is_timeout() {
            RpcError::Timeout {
                endpoint: self.name.clone(),
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else if err.is_decode() {
            RpcError::Decode {
                endpoint: self.name.clone(),
                message: err.to_string(),
            }
        } else {
            RpcError::Transport {
                endpoint: self.name.clone(),
                message: err.to_string(),
            }
        }
    }

    fn decode_error(&self, what: &str, value: &str) -> RpcError {
        RpcError::Decode {
            endpoint: self.name.clone(),
            message: format!("invalid {} quantity {:?}", what, value),
        }
    }

    fn quantity(&self, what: &str, value: &str) -> RpcResult<u128> {
        parse_quantity(value).ok_or_else(|| self.decode_error(what, value))
    }

    fn quantity64(&self, what: &str, value: &str) -> RpcResult<u64> {
        quantity_u64(value).ok_or_else(|| self.decode_error(what, value))
    }

    fn optional_quantity(&self, what: &str, value: Option<&String>) -> RpcResult<u128> {
        value.map_or(Ok(0), |v| self.quantity(what, v))
    }

    fn convert_receipt(&self, raw: RawReceipt) -> RpcResult<Receipt> {
        Ok(Receipt {
            tx_hash: raw.transaction_hash,
            block_number: self.quantity64("blockNumber", &raw.block_number)?,
            block_hash: raw.block_hash,
            success: raw.status.as_deref() != Some("0x0"),
            gas_used: self.quantity64("gasUsed", &raw.gas_used)?,
            effective_gas_price: self
                .optional_quantity("effectiveGasPrice", raw.effective_gas_price.as_ref())?,
            blob_gas_used: self
                .optional_quantity("blobGasUsed", raw.blob_gas_used.as_ref())?
                .min(u64::MAX as u128) as u64,
            blob_gas_price: self.optional_quantity("blobGasPrice", raw.blob_gas_price.as_ref())?,
            logs: raw.logs.len(),
        })
    }
}

fn block_tag(block: Option<u64>) -> Value {
    match block {
        Some(n) => Value::String(format!("0x{:x}", n)),
        None => Value::String("latest".to_string()),
    }
}

#[async_trait]
impl RpcEndpoint for JsonRpcEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    async fn block_number(&self) -> RpcResult<u64> {
        let raw: String = self.call("eth_blockNumber", json!([])).await?;
        self.quantity64("blockNumber", &raw)
    }

    async fn block_by_number(&self, number: u64) -> RpcResult<Option<Block>> {
        let raw: Option<RawBlock> = self
            .call("eth_getBlockByNumber", json!([block_tag(Some(number)), true]))
            .await?;
        let Some(raw) = raw else {
            return Ok(None);
        };

        let mut transactions = Vec::with_capacity(raw.transactions.len());
        for tx in raw.transactions {
            transactions.push(BlockTransaction {
                hash: tx.hash,
                from: tx.from,
                to: tx.to,
                nonce: self.quantity64("nonce", &tx.nonce)?,
                value: self.optional_quantity("value", tx.value.as_ref())?,
            });
        }

        Ok(Some(Block {
            number: self.quantity64("number", &raw.number)?,
            hash: raw.hash,
            parent_hash: raw.parent_hash,
            transactions,
        }))
    }

    async fn block_receipts(&self, number: u64) -> RpcResult<Vec<Receipt>> {
        let raw: Option<Vec<RawReceipt>> = self
            .call("eth_getBlockReceipts", json!([block_tag(Some(number))]))
            .await?;
        raw.unwrap_or_default()
            .into_iter()
            .map(|r| self.convert_receipt(r))
            .collect()
    }

    async fn transaction_receipt(&self, hash: TxHash) -> RpcResult<Option<Receipt>> {
        let raw: Option<RawReceipt> = self
            .call("eth_getTransactionReceipt", json!([hash.to_string()]))
            .await?;
        raw.map(|r| self.convert_receipt(r)).transpose()
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> RpcResult<TxHash> {
        let encoded = format!("0x{}", hex::encode(raw));
        self.call("eth_sendRawTransaction", json!([encoded])).await
    }

    async fn nonce_at(&self, address: Address, block: Option<u64>) -> RpcResult<u64> {
        let raw: String = self
            .call(
                "eth_getTransactionCount",
                json!([address.to_string(), block_tag(block)]),
            )
            .await?;
        self.quantity64("nonce", &raw)
    }

    async fn balance_at(&self, address: Address) -> RpcResult<u128> {
        let raw: String = self
            .call("eth_getBalance", json!([address.to_string(), "latest"]))
            .await?;
        self.quantity("balance", &raw)
    }

    async fn chain_id(&self) -> RpcResult<u64> {
        let raw: String = self.call("eth_chainId", json!([])).await?;
        self.quantity64("chainId", &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("0x0"), Some(0));
        assert_eq!(parse_quantity("0x"), Some(0));
        assert_eq!(parse_quantity("0x1a"), Some(26));
        assert_eq!(parse_quantity("1a"), None);
        assert_eq!(parse_quantity("0xzz"), None);
        // Larger than u128 saturates instead of failing
        assert_eq!(parse_quantity(&format!("0x1{}", "0".repeat(40))), Some(u128::MAX));
    }

    #[tokio::test]
    async fn test_block_number_against_mock_server() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"jsonrpc":"2.0","id":1,"result":"0x10"}"#)
            .create_async()
            .await;

        let endpoint = JsonRpcEndpoint::new(server.url(), Duration::from_secs(2)).unwrap();
        assert_eq!(endpoint.block_number().await.unwrap(), 16);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_raw_transaction_already_known() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"already known"}}"#,
            )
            .create_async()
            .await;

        let endpoint = JsonRpcEndpoint::new(server.url(), Duration::from_secs(2)).unwrap();
        let err = endpoint.send_raw_transaction(&[0x02, 0x01]).await.unwrap_err();
        assert!(err.is_already_known());
    }

    #[tokio::test]
    async fn test_block_with_transactions_and_receipts() {
        let mut server = mockito::Server::new_async().await;
        let from = format!("0x{}", "11".repeat(20));
        let to = format!("0x{}", "22".repeat(20));
        let tx_hash = format!("0x{}", "33".repeat(32));
        let block_hash = format!("0x{}", "44".repeat(32));
        let parent_hash = format!("0x{}", "55".repeat(32));

        server
            .mock("POST", "/")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"method":"eth_getBlockByNumber"}"#.to_string(),
            ))
            .with_header("content-type", "application/json")
            .with_body(format!(
                r#"{{"jsonrpc":"2.0","id":1,"result":{{"number":"0x2a","hash":"{}","parentHash":"{}","transactions":[{{"hash":"{}","from":"{}","to":"{}","nonce":"0x5","value":"0xde0b6b3a7640000"}}]}}}}"#,
                block_hash, parent_hash, tx_hash, from, to
            ))
            .create_async()
            .await;
        server
            .mock("POST", "/")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"method":"eth_getBlockReceipts"}"#.to_string(),
            ))
            .with_header("content-type", "application/json")
            .with_body(format!(
                r#"{{"jsonrpc":"2.0","id":2,"result":[{{"transactionHash":"{}","blockNumber":"0x2a","blockHash":"{}","status":"0x1","gasUsed":"0x5208","effectiveGasPrice":"0x3b9aca00","logs":[]}}]}}"#,
                tx_hash, block_hash
            ))
            .create_async()
            .await;

        let endpoint = JsonRpcEndpoint::new(server.url(), Duration::from_secs(2)).unwrap();
        let block = endpoint.block_by_number(42).await.unwrap().unwrap();
        assert_eq!(block.number, 42);
        assert_eq!(block.transactions.len(), 1);
        assert_eq!(block.transactions[0].nonce, 5);
        assert_eq!(block.transactions[0].value, 1_000_000_000_000_000_000);

        let receipts = endpoint.block_receipts(42).await.unwrap();
        assert_eq!(receipts.len(), 1);
        assert!(receipts[0].success);
        assert_eq!(receipts[0].gas_used, 21_000);
        assert_eq!(receipts[0].effective_gas_price, 1_000_000_000);
    }
}
