//! Test Utilities Module
//!
//! In-memory chain and endpoint doubles for deterministic tests of the
//! ledger, confirmation engine, submitter and scheduler.
//!
//! These utilities are only compiled when running tests or when the
//! `test_utils` feature is enabled.

#![cfg(any(test, feature = "test_utils"))]

use crate::rpc_manager::{RpcEndpoint, RpcError, RpcResult};
use crate::types::{Address, Block, BlockTransaction, Receipt, SignedTransaction, TxHash};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Gas used by every mock receipt
pub const MOCK_GAS_USED: u64 = 21_000;
/// Effective gas price of every mock receipt
pub const MOCK_GAS_PRICE: u128 = 2;

const RAW_LEN: usize = 20 + 8 + 32;

/// Deterministic transaction hash for (`from`, `nonce`, `salt`)
pub fn mock_hash(from: Address, nonce: u64, salt: u8) -> TxHash {
    let mut bytes = [0u8; 32];
    bytes[..20].copy_from_slice(from.as_bytes());
    bytes[20..28].copy_from_slice(&nonce.to_be_bytes());
    bytes[31] = salt;
    TxHash::new(bytes)
}

/// Signed transaction whose raw bytes the mock can decode again
pub fn mock_tx(from: Address, nonce: u64) -> SignedTransaction {
    mock_tx_salted(from, nonce, 0)
}

/// Like [`mock_tx`] but with a distinct hash, e.g. for a replacement
pub fn mock_tx_salted(from: Address, nonce: u64, salt: u8) -> SignedTransaction {
    let hash = mock_hash(from, nonce, salt);
    let mut raw = Vec::with_capacity(RAW_LEN);
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

fn decode_raw(raw: &[u8]) -> Option<(Address, u64, TxHash)> {
    if raw.len() != RAW_LEN {
        return None;
    }
    let from = Address::new(raw[..20].try_into().ok()?);
    let nonce = u64::from_be_bytes(raw[20..28].try_into().ok()?);
    let hash = TxHash::new(raw[28..].try_into().ok()?);
    Some((from, nonce, hash))
}

fn block_hash(number: u64, fork: u8) -> TxHash {
    let mut bytes = [0xbb; 32];
    bytes[..8].copy_from_slice(&number.to_be_bytes());
    bytes[8] = fork;
    TxHash::new(bytes)
}

/// Shared in-memory chain state
#[derive(Debug, Default)]
pub struct MockChain {
    height: u64,
    fork: u8,
    blocks: HashMap<u64, (Block, Vec<Receipt>)>,
    receipts: HashMap<TxHash, Receipt>,
    /// Per account: block height -> nonce from that height on
    nonces: HashMap<Address, BTreeMap<u64, u64>>,
    balances: HashMap<Address, u128>,
    mempool: Vec<(Address, u64, TxHash)>,
}

impl MockChain {
    fn nonce_at(&self, address: &Address, block: Option<u64>) -> u64 {
        let Some(history) = self.nonces.get(address) else {
            return 0;
        };
        let upto = block.unwrap_or(u64::MAX);
        history.range(..=upto).next_back().map_or(0, |(_, n)| *n)
    }

    fn include(&mut self, txs: &[(Address, u64, TxHash)]) -> u64 {
        let number = self.height + 1;
        let hash = block_hash(number, self.fork);
        let parent_hash = self
            .blocks
            .get(&self.height)
            .map_or_else(|| block_hash(self.height, self.fork), |(b, _)| b.hash);

        let mut transactions = Vec::with_capacity(txs.len());
        let mut receipts = Vec::with_capacity(txs.len());
        for &(from, nonce, tx_hash) in txs {
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
                gas_used: MOCK_GAS_USED,
                effective_gas_price: MOCK_GAS_PRICE,
                blob_gas_used: 0,
                blob_gas_price: 0,
                logs: 0,
            };
            self.receipts.insert(tx_hash, receipt.clone());
            receipts.push(receipt);

            let current = self.nonce_at(&from, None);
            self.nonces
                .entry(from)
                .or_default()
                .insert(number, current.max(nonce + 1));
        }

        self.blocks.insert(
            number,
            (
                Block {
                    number,
                    hash,
                    parent_hash,
                    transactions,
                },
                receipts,
            ),
        );
        self.height = number;
        number
    }
}

/// In-memory [`RpcEndpoint`] with failure injection
#[derive(Debug)]
pub struct MockEndpoint {
    name: String,
    chain: Arc<Mutex<MockChain>>,
    fail_sends: AtomicBool,
    fail_block_number: AtomicBool,
    fail_blocks: AtomicBool,
    already_known: AtomicBool,
    send_delay: Mutex<Option<Duration>>,
    send_attempts: AtomicUsize,
    receipt_queries: AtomicUsize,
    accepted: Mutex<Vec<TxHash>>,
}

impl MockEndpoint {
    pub fn new(name: &str) -> Arc<Self> {
        Self::with_chain(name, Arc::new(Mutex::new(MockChain::default())))
    }

    pub fn with_chain(name: &str, chain: Arc<Mutex<MockChain>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            chain,
            fail_sends: AtomicBool::new(false),
            fail_block_number: AtomicBool::new(false),
            fail_blocks: AtomicBool::new(false),
            already_known: AtomicBool::new(false),
            send_delay: Mutex::new(None),
            send_attempts: AtomicUsize::new(0),
            receipt_queries: AtomicUsize::new(0),
            accepted: Mutex::new(Vec::new()),
        })
    }

    /// Another endpoint looking at the same chain
    pub fn sibling(&self, name: &str) -> Arc<Self> {
        Self::with_chain(name, self.chain.clone())
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn fail_block_number(&self, fail: bool) {
        self.fail_block_number.store(fail, Ordering::SeqCst);
    }

    /// Fail block body and receipt queries
    pub fn fail_blocks(&self, fail: bool) {
        self.fail_blocks.store(fail, Ordering::SeqCst);
    }

    /// Answer every send with "already known"
    pub fn answer_already_known(&self, on: bool) {
        self.already_known.store(on, Ordering::SeqCst);
    }

    pub fn set_send_delay(&self, delay: Option<Duration>) {
        *self.send_delay.lock() = delay;
    }

    pub fn send_attempts(&self) -> usize {
        self.send_attempts.load(Ordering::SeqCst)
    }

    /// Receipt-by-hash queries served so far
    pub fn receipt_queries(&self) -> usize {
        self.receipt_queries.load(Ordering::SeqCst)
    }

    /// Hashes this endpoint accepted, in order
    pub fn accepted(&self) -> Vec<TxHash> {
        self.accepted.lock().clone()
    }

    pub fn height(&self) -> u64 {
        self.chain.lock().height
    }

    /// Advance the chain with empty blocks
    pub fn advance(&self, blocks: u64) -> u64 {
        let mut chain = self.chain.lock();
        for _ in 0..blocks {
            chain.include(&[]);
        }
        chain.height
    }

    /// Mine one block holding `txs`. Returns its number.
    pub fn include(&self, txs: &[SignedTransaction]) -> u64 {
        let txs: Vec<_> = txs.iter().map(|t| (t.from, t.nonce, t.hash)).collect();
        self.chain.lock().include(&txs)
    }

    /// Mine one block from everything accepted since the last call
    pub fn mine_pending(&self) -> u64 {
        let mut chain = self.chain.lock();
        let mut pending = std::mem::take(&mut chain.mempool);
        pending.sort_by_key(|(from, nonce, _)| (*from, *nonce));
        pending.dedup_by_key(|(_, _, hash)| *hash);
        chain.include(&pending)
    }

    /// Replace the block at the current height with one on a new fork.
    /// The replaced block's transactions are dropped.
    pub fn reorg_head(&self) -> u64 {
        let mut chain = self.chain.lock();
        let height = chain.height;
        if let Some((old, _)) = chain.blocks.remove(&height) {
            for tx in old.transactions {
                chain.receipts.remove(&tx.hash);
                if let Some(history) = chain.nonces.get_mut(&tx.from) {
                    history.remove(&height);
                }
            }
        }
        chain.height = height.saturating_sub(1);
        chain.fork = chain.fork.wrapping_add(1);
        chain.include(&[])
    }

    /// Record an on-chain nonce without a visible transaction
    pub fn set_nonce(&self, address: Address, nonce: u64) {
        let mut chain = self.chain.lock();
        let height = chain.height;
        chain.nonces.entry(address).or_default().insert(height, nonce);
    }

    pub fn set_balance(&self, address: Address, balance: u128) {
        self.chain.lock().balances.insert(address, balance);
    }
}

#[async_trait]
impl RpcEndpoint for MockEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    async fn block_number(&self) -> RpcResult<u64> {
        if self.fail_block_number.load(Ordering::SeqCst) {
            return Err(RpcError::Transport {
                endpoint: self.name.clone(),
                message: "connection refused".into(),
            });
        }
        Ok(self.chain.lock().height)
    }

    async fn block_by_number(&self, number: u64) -> RpcResult<Option<Block>> {
        if self.fail_blocks.load(Ordering::SeqCst) {
            return Err(RpcError::Timeout {
                endpoint: self.name.clone(),
                timeout_ms: 5_000,
            });
        }
        Ok(self.chain.lock().blocks.get(&number).map(|(b, _)| b.clone()))
    }

    async fn block_receipts(&self, number: u64) -> RpcResult<Vec<Receipt>> {
        if self.fail_blocks.load(Ordering::SeqCst) {
            return Err(RpcError::Timeout {
                endpoint: self.name.clone(),
                timeout_ms: 5_000,
            });
        }
        Ok(self
            .chain
            .lock()
            .blocks
            .get(&number)
            .map(|(_, r)| r.clone())
            .unwrap_or_default())
    }

    async fn transaction_receipt(&self, hash: TxHash) -> RpcResult<Option<Receipt>> {
        self.receipt_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.chain.lock().receipts.get(&hash).cloned())
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> RpcResult<TxHash> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.send_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(RpcError::Transport {
                endpoint: self.name.clone(),
                message: "connection reset".into(),
            });
        }
        let decoded = decode_raw(raw).ok_or_else(|| {
            RpcError::from_response(&self.name, -32602, "invalid raw transaction")
        })?;
        self.chain.lock().mempool.push(decoded);
        if self.already_known.load(Ordering::SeqCst) {
            return Err(RpcError::AlreadyKnown {
                endpoint: self.name.clone(),
            });
        }
        self.accepted.lock().push(decoded.2);
        Ok(decoded.2)
    }

    async fn nonce_at(&self, address: Address, block: Option<u64>) -> RpcResult<u64> {
        Ok(self.chain.lock().nonce_at(&address, block))
    }

    async fn balance_at(&self, address: Address) -> RpcResult<u128> {
        Ok(self
            .chain
            .lock()
            .balances
            .get(&address)
            .copied()
            .unwrap_or_default())
    }

    async fn chain_id(&self) -> RpcResult<u64> {
        Ok(1337)
    }
}
