//! In-process chain double shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use txflood::rpc_manager::{RpcEndpoint, RpcError, RpcResult};
use txflood::types::{Address, Block, BlockTransaction, Receipt, SignedTransaction, TxHash};

pub fn address(seed: u8) -> Address {
    Address::new([seed; 20])
}

/// Signed transaction whose raw bytes carry its own routing fields
pub fn signed_tx(from: Address, nonce: u64) -> SignedTransaction {
    let mut hash = [0u8; 32];
    hash[..20].copy_from_slice(from.as_bytes());
    hash[20..28].copy_from_slice(&nonce.to_be_bytes());
    let hash = TxHash::new(hash);

    let mut raw = Vec::with_capacity(60);
    raw.extend_from_slice(from.as_bytes());
    raw.extend_from_slice(&nonce.to_be_bytes());
    raw.extend_from_slice(hash.as_bytes());
    SignedTransaction {
        from,
        nonce,
        hash,
        raw,
        value: 0,
    }
}

#[derive(Debug, Default)]
struct Chain {
    blocks: Vec<(Block, Vec<Receipt>)>,
    receipts: HashMap<TxHash, Receipt>,
    nonces: HashMap<Address, u64>,
    mempool: Vec<(Address, u64, TxHash)>,
}

/// Single node that mines its mempool on demand
#[derive(Debug, Default)]
pub struct DevNode {
    chain: Mutex<Chain>,
}

impl DevNode {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mine everything in the mempool into one block
    pub fn mine(&self) -> u64 {
        let mut chain = self.chain.lock();
        let mut pending = std::mem::take(&mut chain.mempool);
        pending.sort_by_key(|(from, nonce, _)| (*from, *nonce));
        pending.dedup_by_key(|(_, _, hash)| *hash);

        let number = chain.blocks.len() as u64 + 1;
        let mut hash = [0xcc; 32];
        hash[..8].copy_from_slice(&number.to_be_bytes());
        let hash = TxHash::new(hash);
        let parent_hash = chain.blocks.last().map(|(b, _)| b.hash).unwrap_or_default();

        let mut transactions = Vec::new();
        let mut receipts = Vec::new();
        for (from, nonce, tx_hash) in pending {
            let expected = chain.nonces.get(&from).copied().unwrap_or_default();
            if nonce != expected {
                // Gapped or stale nonce stays out of the block
                if nonce > expected {
                    chain.mempool.push((from, nonce, tx_hash));
                }
                continue;
            }
            chain.nonces.insert(from, nonce + 1);
            transactions.push(BlockTransaction {
                hash: tx_hash,
                from,
                to: None,
                nonce,
                value: 0,
            });
            let receipt = Receipt {
                tx_hash,
                block_number: number,
                block_hash: hash,
                success: true,
                gas_used: 21_000,
                effective_gas_price: 1,
                blob_gas_used: 0,
                blob_gas_price: 0,
                logs: 0,
            };
            chain.receipts.insert(tx_hash, receipt.clone());
            receipts.push(receipt);
        }

        chain.blocks.push((
            Block {
                number,
                hash,
                parent_hash,
                transactions,
            },
            receipts,
        ));
        number
    }

    pub fn nonce(&self, address: &Address) -> u64 {
        self.chain.lock().nonces.get(address).copied().unwrap_or_default()
    }
}

#[async_trait]
impl RpcEndpoint for DevNode {
    fn name(&self) -> &str {
        "devnode"
    }

    async fn block_number(&self) -> RpcResult<u64> {
        Ok(self.chain.lock().blocks.len() as u64)
    }

    async fn block_by_number(&self, number: u64) -> RpcResult<Option<Block>> {
        let chain = self.chain.lock();
        Ok(number
            .checked_sub(1)
            .and_then(|i| chain.blocks.get(i as usize))
            .map(|(b, _)| b.clone()))
    }

    async fn block_receipts(&self, number: u64) -> RpcResult<Vec<Receipt>> {
        let chain = self.chain.lock();
        Ok(number
            .checked_sub(1)
            .and_then(|i| chain.blocks.get(i as usize))
            .map(|(_, r)| r.clone())
            .unwrap_or_default())
    }

    async fn transaction_receipt(&self, hash: TxHash) -> RpcResult<Option<Receipt>> {
        Ok(self.chain.lock().receipts.get(&hash).cloned())
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> RpcResult<TxHash> {
        if raw.len() != 60 {
            return Err(RpcError::from_response("devnode", -32602, "invalid raw transaction"));
        }
        let from = Address::new(raw[..20].try_into().unwrap());
        let nonce = u64::from_be_bytes(raw[20..28].try_into().unwrap());
        let hash = TxHash::new(raw[28..].try_into().unwrap());
        self.chain.lock().mempool.push((from, nonce, hash));
        Ok(hash)
    }

    async fn nonce_at(&self, address: Address, _block: Option<u64>) -> RpcResult<u64> {
        Ok(self.nonce(&address))
    }

    async fn balance_at(&self, _address: Address) -> RpcResult<u128> {
        Ok(1_000_000_000)
    }

    async fn chain_id(&self) -> RpcResult<u64> {
        Ok(31337)
    }
}
