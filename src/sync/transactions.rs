//! New-transaction notifications.
//!
//! Stake and base subscriptions fetch through different upstream calls, so
//! the pass partitions by address kind first. Each batch fetches one delta
//! past its lowest cursor; records for other members are filtered out per
//! subscription before rendering.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, error};

use crate::assets::{asset_display_name, format_quantity, DecimalsCache};
use crate::chain::{ChainApi, TxRecord};
use crate::classify::{classify_tx, shorten_pool_id, touches};
use crate::dispatch::Dispatcher;
use crate::render::{self, MessageBuilder};
use crate::store::{AddressKind, Subscription, SubscriptionStore, WatermarkField};

use super::{batch::batch, deliver_and_advance, pager::fetch_paged, CheckerConfig};

pub struct TransactionChecker {
    chain: Arc<dyn ChainApi>,
    store: Arc<dyn SubscriptionStore>,
    dispatcher: Dispatcher,
    decimals: Arc<DecimalsCache>,
    config: CheckerConfig,
}

impl TransactionChecker {
    pub fn new(
        chain: Arc<dyn ChainApi>,
        store: Arc<dyn SubscriptionStore>,
        dispatcher: Dispatcher,
        decimals: Arc<DecimalsCache>,
        config: CheckerConfig,
    ) -> Self {
        Self {
            chain,
            store,
            dispatcher,
            decimals,
            config,
        }
    }

    pub async fn run_once(&self) -> anyhow::Result<()> {
        let subs = self.store.get_all().await?;
        if subs.is_empty() {
            return Ok(());
        }
        let (stake, base): (Vec<_>, Vec<_>) = subs
            .into_iter()
            .partition(|s| s.address_kind == AddressKind::Stake);
        self.process_kind(stake, AddressKind::Stake).await?;
        self.process_kind(base, AddressKind::Base).await?;
        Ok(())
    }

    async fn process_kind(
        &self,
        subs: Vec<Subscription>,
        kind: AddressKind,
    ) -> anyhow::Result<()> {
        if subs.is_empty() {
            return Ok(());
        }

        for group in batch(subs, self.config.batch_size)? {
            // Cursors hold the first unseen height; the upstream filter is
            // strictly greater-than, so query past cursor - 1.
            let after = group
                .iter()
                .map(|s| s.last_block_height)
                .min()
                .unwrap_or(0)
                .saturating_sub(1);
            let addresses: Vec<String> = group.iter().map(|s| s.address.clone()).collect();

            let chain = self.chain.clone();
            let limit = self.config.page_limit;
            let mut txs = fetch_paged(limit, |offset| {
                let chain = chain.clone();
                let addresses = addresses.clone();
                async move {
                    match kind {
                        AddressKind::Stake => {
                            chain
                                .account_transactions(&addresses, after, offset, limit)
                                .await
                        }
                        AddressKind::Base => {
                            chain
                                .address_transactions(&addresses, after, offset, limit)
                                .await
                        }
                    }
                }
            })
            .await;

            if txs.is_empty() {
                continue;
            }
            // Render newest-first.
            txs.sort_by(|a, b| b.block_height.cmp(&a.block_height));
            debug!(batch = group.len(), txs = txs.len(), kind = ?kind, "transaction delta fetched");

            for sub in &group {
                if let Err(e) = self.process_subscription(sub, &txs).await {
                    error!(
                        subscriber = sub.subscriber_id,
                        address = %sub.address,
                        error = %e,
                        "transaction processing failed for subscription"
                    );
                }
            }
        }
        Ok(())
    }

    async fn process_subscription(
        &self,
        sub: &Subscription,
        txs: &[TxRecord],
    ) -> anyhow::Result<()> {
        let watched: HashSet<String> = std::iter::once(sub.address.clone()).collect();
        let relevant: Vec<&TxRecord> = txs
            .iter()
            .filter(|t| t.block_height >= sub.last_block_height && touches(&watched, t))
            .collect();
        if relevant.is_empty() {
            return Ok(());
        }

        let mut builder = MessageBuilder::new(self.config.allow_oversized)
            .header(&format!("Activity on <code>{}</code>", sub.address));
        for tx in &relevant {
            let activity = classify_tx(&watched, tx);

            let pool_name = match &activity.delegation {
                Some(pool_id) => Some(self.resolve_pool_name(pool_id).await),
                None => None,
            };

            let mut assets = Vec::with_capacity(activity.assets.len());
            for asset in &activity.assets {
                let decimals = self
                    .decimals
                    .decimals(self.chain.as_ref(), &asset.policy_id, &asset.asset_name)
                    .await;
                assets.push((
                    asset_display_name(&asset.policy_id, &asset.asset_name),
                    format_quantity(asset.quantity, decimals),
                ));
            }

            let event = render::tx_block(tx, &activity, pool_name.as_deref(), &assets);
            if !builder.push(&event) {
                break;
            }
        }

        let highest = relevant
            .iter()
            .map(|t| t.block_height)
            .max()
            .unwrap_or(sub.last_block_height);
        let message = builder.finish(relevant.len());
        deliver_and_advance(
            &self.dispatcher,
            self.store.as_ref(),
            "tx-notify",
            self.config.send_timeout,
            sub,
            message,
            Some((WatermarkField::BlockHeight, (highest + 1) as i64)),
        )
        .await?;
        Ok(())
    }

    async fn resolve_pool_name(&self, pool_id: &str) -> String {
        match self.chain.pool_info(pool_id).await {
            Ok(Some(info)) => info
                .name
                .or(info.ticker)
                .unwrap_or_else(|| shorten_pool_id(pool_id)),
            Ok(None) => shorten_pool_id(pool_id),
            Err(e) => {
                debug!(pool = pool_id, error = %e, "pool lookup failed, using shortened id");
                shorten_pool_id(pool_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::TxIo;
    use crate::store::MemoryStore;
    use crate::testutil::{FakeChain, RecordingSink};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn tx(height: u64, from: &str, to: &str, value: u64) -> TxRecord {
        TxRecord {
            tx_hash: format!("hash{}", height),
            block_height: height,
            block_time: 0,
            fee: 170_000,
            inputs: vec![TxIo {
                address: from.to_string(),
                value: value + 170_000,
                assets: Vec::new(),
            }],
            outputs: vec![TxIo {
                address: to.to_string(),
                value,
                assets: Vec::new(),
            }],
            delegation: None,
        }
    }

    fn checker(
        chain: Arc<FakeChain>,
        store: Arc<MemoryStore>,
        sink: Arc<RecordingSink>,
    ) -> TransactionChecker {
        TransactionChecker::new(
            chain,
            store,
            Dispatcher::new(4, sink),
            Arc::new(DecimalsCache::new()),
            CheckerConfig {
                batch_size: 50,
                page_limit: 100,
                send_timeout: Duration::from_secs(1),
                allow_oversized: false,
            },
        )
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent_and_watermark_monotonic() {
        let chain = Arc::new(FakeChain::with_tip(200, 10));
        chain.txs.lock().unwrap().extend(vec![
            tx(101, "addr1other", "addr1me", 3_000_000),
            tx(102, "addr1me", "addr1other", 1_000_000),
        ]);

        let store = Arc::new(MemoryStore::new());
        let mut sub = Subscription::new(7, "addr1me".to_string(), AddressKind::Base);
        sub.last_block_height = 101;
        store.insert(&sub).await.unwrap();

        let sink = Arc::new(RecordingSink::default());
        let checker = checker(chain.clone(), store.clone(), sink.clone());

        checker.run_once().await.unwrap();
        assert_eq!(sink.messages().len(), 1);
        let after_first = store.for_subscriber(7).await.unwrap()[0].last_block_height;
        assert_eq!(after_first, 103);

        // No new upstream data: no additional notifications, same watermark.
        checker.run_once().await.unwrap();
        checker.run_once().await.unwrap();
        assert_eq!(sink.messages().len(), 1);
        let after_rerun = store.for_subscriber(7).await.unwrap()[0].last_block_height;
        assert_eq!(after_rerun, after_first);
    }

    #[tokio::test]
    async fn test_failed_dispatch_leaves_watermark_for_retry() {
        let chain = Arc::new(FakeChain::with_tip(200, 10));
        chain
            .txs
            .lock()
            .unwrap()
            .push(tx(150, "addr1other", "addr1me", 2_000_000));

        let store = Arc::new(MemoryStore::new());
        let mut sub = Subscription::new(7, "addr1me".to_string(), AddressKind::Base);
        sub.last_block_height = 100;
        store.insert(&sub).await.unwrap();

        let sink = Arc::new(RecordingSink::default());
        sink.fail_sends.store(true, Ordering::SeqCst);
        let checker = checker(chain.clone(), store.clone(), sink.clone());

        checker.run_once().await.unwrap();
        assert!(sink.messages().is_empty());
        assert_eq!(
            store.for_subscriber(7).await.unwrap()[0].last_block_height,
            100
        );

        // Next cycle reprocesses the same delta once the sink recovers.
        sink.fail_sends.store(false, Ordering::SeqCst);
        checker.run_once().await.unwrap();
        assert_eq!(sink.messages().len(), 1);
        assert_eq!(
            store.for_subscriber(7).await.unwrap()[0].last_block_height,
            151
        );
    }

    #[tokio::test]
    async fn test_upstream_failure_skips_batch_without_error() {
        let chain = Arc::new(FakeChain::with_tip(200, 10));
        chain.fail_tx_queries.store(true, Ordering::SeqCst);
        chain
            .txs
            .lock()
            .unwrap()
            .push(tx(150, "addr1other", "addr1me", 2_000_000));

        let store = Arc::new(MemoryStore::new());
        store
            .insert(&Subscription::new(7, "addr1me".to_string(), AddressKind::Base))
            .await
            .unwrap();

        let sink = Arc::new(RecordingSink::default());
        let checker = checker(chain.clone(), store.clone(), sink.clone());

        // The pass completes; the failed batch is simply retried next cycle.
        checker.run_once().await.unwrap();
        assert!(sink.messages().is_empty());
    }

    #[tokio::test]
    async fn test_other_members_records_filtered_out() {
        let chain = Arc::new(FakeChain::with_tip(200, 10));
        chain.txs.lock().unwrap().extend(vec![
            tx(120, "addr1other", "addr1me", 1_000_000),
            tx(130, "addr1other", "addr1friend", 9_000_000),
        ]);

        let store = Arc::new(MemoryStore::new());
        let mut a = Subscription::new(1, "addr1me".to_string(), AddressKind::Base);
        a.last_block_height = 100;
        // Fresher cursor: the shared fetch uses 100, but this member must
        // only see records past its own cursor.
        let mut b = Subscription::new(2, "addr1friend".to_string(), AddressKind::Base);
        b.last_block_height = 140;
        store.insert(&a).await.unwrap();
        store.insert(&b).await.unwrap();

        let sink = Arc::new(RecordingSink::default());
        let checker = checker(chain.clone(), store.clone(), sink.clone());
        checker.run_once().await.unwrap();

        let messages = sink.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, 1);
    }
}
