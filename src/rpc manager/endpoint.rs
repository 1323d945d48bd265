//! Endpoint capability consumed by the dispatch core
//!
//! The core only ever asks for "the endpoint at rotation index i" or "any
//! endpoint"; how many endpoints exist and how they are balanced is left to
//! the provider.

use super::rpc_errors::RpcResult;
use crate::types::{Address, Block, Receipt, TxHash};
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;

/// A single node speaking the JSON-RPC blockchain API
#[async_trait]
pub trait RpcEndpoint: Send + Sync + Debug {
    /// Short human-readable name used in logs
    fn name(&self) -> &str;

    async fn block_number(&self) -> RpcResult<u64>;

    /// Full block body, `None` if the node does not have it yet
    async fn block_by_number(&self, number: u64) -> RpcResult<Option<Block>>;

    /// All receipts of a block, in transaction order
    async fn block_receipts(&self, number: u64) -> RpcResult<Vec<Receipt>>;

    async fn transaction_receipt(&self, hash: TxHash) -> RpcResult<Option<Receipt>>;

    async fn send_raw_transaction(&self, raw: &[u8]) -> RpcResult<TxHash>;

    /// Account nonce as of `block`, or the latest block when `None`
    async fn nonce_at(&self, address: Address, block: Option<u64>) -> RpcResult<u64>;

    async fn balance_at(&self, address: Address) -> RpcResult<u128>;

    async fn chain_id(&self) -> RpcResult<u64>;
}

/// Capability handing out endpoints by rotation index
pub trait EndpointProvider: Send + Sync {
    /// Endpoint at position `index` of the current rotation, `None` once the
    /// rotation is exhausted
    fn endpoint(&self, index: usize) -> Option<Arc<dyn RpcEndpoint>>;

    /// Any usable endpoint
    fn random_endpoint(&self) -> Option<Arc<dyn RpcEndpoint>> {
        self.endpoint(0)
    }
}

/// Fixed list of endpoints without health tracking
#[derive(Debug, Clone, Default)]
pub struct StaticEndpoints {
    endpoints: Vec<Arc<dyn RpcEndpoint>>,
}

impl StaticEndpoints {
    pub fn new(endpoints: Vec<Arc<dyn RpcEndpoint>>) -> Self {
        Self { endpoints }
    }
}

impl EndpointProvider for StaticEndpoints {
    fn endpoint(&self, index: usize) -> Option<Arc<dyn RpcEndpoint>> {
        self.endpoints.get(index).cloned()
    }

    fn random_endpoint(&self) -> Option<Arc<dyn RpcEndpoint>> {
        if self.endpoints.is_empty() {
            return None;
        }
        let idx = fastrand::usize(..self.endpoints.len());
        self.endpoints.get(idx).cloned()
    }
}

/// Iterate the provider's rotation from `start`, stopping at the first gap
pub fn rotation(
    provider: &dyn EndpointProvider,
    start: usize,
) -> impl Iterator<Item = Arc<dyn RpcEndpoint>> + '_ {
    (start..).map_while(move |i| provider.endpoint(i))
}
