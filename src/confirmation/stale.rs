//! Stale-wait recovery

use super::ConfirmationEngine;
use crate::metrics::metrics;
use crate::nonce_manager::{retry_with_backoff, NonceError, NonceResult, RetryConfig};
use crate::types::Address;
use tracing::{debug, info, warn};

impl ConfirmationEngine {
    /// Release waits of accounts that saw no inclusion for more than
    /// `stale_blocks` blocks, using the account nonce as of `height`.
    /// Returns the number of waiters released.
    pub async fn run_stale_pass(&self, height: u64) -> usize {
        let ledgers: Vec<_> = self.ledgers.read().values().cloned().collect();
        let mut released = 0;

        for ledger in ledgers {
            if self.cancel.is_cancelled() {
                break;
            }
            if !ledger.take_stale_check(height, self.config.stale_blocks) {
                continue;
            }

            match self.nonce_at_height(ledger.address(), height).await {
                Ok(on_chain) => {
                    let count = ledger.release_below(on_chain);
                    if count > 0 {
                        info!(
                            address = %ledger.address(),
                            block = height,
                            on_chain_nonce = on_chain,
                            released = count,
                            "Released stale nonce waits"
                        );
                        metrics().stale_releases.inc_by(count as u64);
                    } else {
                        debug!(
                            address = %ledger.address(),
                            on_chain_nonce = on_chain,
                            "Stale check found nothing to release"
                        );
                    }
                    released += count;
                }
                Err(e) => {
                    warn!(
                        address = %ledger.address(),
                        block = height,
                        error = %e,
                        "Stale nonce query failed"
                    );
                }
            }
        }

        self.prune_settled();
        released
    }

    async fn nonce_at_height(&self, address: Address, height: u64) -> NonceResult<u64> {
        let retry = RetryConfig {
            max_attempts: self.config.stale_nonce_attempts.max(1),
            ..RetryConfig::default()
        };
        retry_with_backoff("stale_nonce_query", &retry, |_| async move {
            let endpoint = self
                .provider
                .random_endpoint()
                .ok_or(NonceError::NoEndpoint("stale nonce query"))?;
            Ok(endpoint.nonce_at(address, Some(height)).await?)
        })
        .await
    }

    /// Stop tracking ledgers with nothing outstanding
    fn prune_settled(&self) {
        let mut ledgers = self.ledgers.write();
        let before = ledgers.len();
        ledgers.retain(|_, ledger| !ledger.is_settled());
        if ledgers.len() != before {
            debug!(removed = before - ledgers.len(), "Pruned settled ledgers");
            metrics().tracked_ledgers.set(ledgers.len() as i64);
        }
    }
}
