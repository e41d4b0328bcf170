//! Retiring/retired pool alerts.
//!
//! Cross-references every stake subscription's delegated pool against a
//! batch-fetched set of pools whose status is no longer "registered". All
//! affected pools for one subscriber go into a single message. Instead of a
//! watermark this domain uses a per-(subscriber, pool) notification budget:
//! 5 alerts per pool, decremented on each send, then silence.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::chain::{ChainApi, PoolInfo};
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::render::{self, MessageBuilder};
use crate::store::{AddressKind, Subscription, SubscriptionStore};

use super::{batch::batch, CheckerConfig};

pub struct PoolChecker {
    chain: Arc<dyn ChainApi>,
    store: Arc<dyn SubscriptionStore>,
    dispatcher: Dispatcher,
    config: CheckerConfig,
}

impl PoolChecker {
    pub fn new(
        chain: Arc<dyn ChainApi>,
        store: Arc<dyn SubscriptionStore>,
        dispatcher: Dispatcher,
        config: CheckerConfig,
    ) -> Self {
        Self {
            chain,
            store,
            dispatcher,
            config,
        }
    }

    pub async fn run_once(&self) -> anyhow::Result<()> {
        let subs: Vec<Subscription> = self
            .store
            .get_all()
            .await?
            .into_iter()
            .filter(|s| s.address_kind == AddressKind::Stake)
            .collect();
        if subs.is_empty() {
            return Ok(());
        }

        // Phase 1: collect affected pools per subscriber across all batches,
        // so each subscriber gets one aggregated message per pass.
        let mut affected: HashMap<i64, HashMap<String, PoolInfo>> = HashMap::new();

        for group in batch(subs, self.config.batch_size)? {
            let addresses: Vec<String> = group.iter().map(|s| s.address.clone()).collect();
            let accounts = match self.chain.account_info(&addresses).await {
                Ok(accounts) => accounts,
                Err(e) => {
                    warn!(batch = group.len(), error = %e, "account lookup failed, skipping batch");
                    continue;
                }
            };
            let delegated: HashMap<String, String> = accounts
                .into_iter()
                .filter_map(|a| a.delegated_pool.map(|p| (a.stake_address, p)))
                .collect();

            let pool_ids: Vec<String> = delegated
                .values()
                .cloned()
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();
            if pool_ids.is_empty() {
                continue;
            }

            let flagged = match self.chain.pools_not_registered(&pool_ids).await {
                Ok(pools) => pools,
                Err(e) => {
                    warn!(pools = pool_ids.len(), error = %e, "pool status lookup failed, skipping batch");
                    continue;
                }
            };
            if flagged.is_empty() {
                continue;
            }
            let flagged: HashMap<String, PoolInfo> = flagged
                .into_iter()
                .map(|p| (p.pool_id.clone(), p))
                .collect();

            for sub in &group {
                let Some(pool_id) = delegated.get(&sub.address) else {
                    continue;
                };
                if let Some(pool) = flagged.get(pool_id) {
                    affected
                        .entry(sub.subscriber_id)
                        .or_default()
                        .insert(pool.pool_id.clone(), pool.clone());
                }
            }
        }

        // Phase 2: one message per subscriber, budget-gated per pool.
        for (subscriber, pools) in affected {
            let mut notifiable: Vec<&PoolInfo> = Vec::new();
            for pool in pools.values() {
                if self.store.pool_budget(subscriber, &pool.pool_id).await? > 0 {
                    notifiable.push(pool);
                } else {
                    debug!(
                        subscriber = subscriber,
                        pool = %pool.pool_id,
                        "retirement alert budget exhausted"
                    );
                }
            }
            if notifiable.is_empty() {
                continue;
            }

            let mut builder =
                MessageBuilder::new(self.config.allow_oversized).header("Stake pool alert");
            let total = notifiable.len();
            for pool in &notifiable {
                if !builder.push(&render::pool_block(pool)) {
                    break;
                }
            }
            let message = builder.finish(total);

            let outcome = self
                .dispatcher
                .send_notification("pool-notify", self.config.send_timeout, subscriber, message)
                .await;
            if outcome == DispatchOutcome::Done {
                for pool in &notifiable {
                    self.store
                        .decrement_pool_budget(subscriber, &pool.pool_id)
                        .await?;
                }
            } else {
                warn!(
                    subscriber = subscriber,
                    outcome = ?outcome,
                    "pool alert not confirmed, budget left untouched"
                );
            }
        }
        Ok(())
    }
}
