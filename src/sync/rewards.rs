//! Staking-reward notifications.
//!
//! Epoch cursors hold the last notified epoch: the upstream filter and the
//! per-subscription filter are both strictly greater-than, and advancement
//! is to the highest epoch observed. A cursor ahead of the chain's current
//! epoch is a logic error: logged, never corrected automatically.

use std::sync::Arc;

use tracing::{debug, error};

use crate::chain::{ChainApi, RewardRecord};
use crate::dispatch::Dispatcher;
use crate::render::{self, MessageBuilder};
use crate::store::{AddressKind, Subscription, SubscriptionStore, WatermarkField};

use super::{batch::batch, deliver_and_advance, pager::fetch_paged, CheckerConfig};

pub struct RewardChecker {
    chain: Arc<dyn ChainApi>,
    store: Arc<dyn SubscriptionStore>,
    dispatcher: Dispatcher,
    config: CheckerConfig,
}

impl RewardChecker {
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

        let current_epoch = self.chain.tip().await?.epoch;

        for group in batch(subs, self.config.batch_size)? {
            for sub in &group {
                if sub.last_epoch_number > current_epoch {
                    error!(
                        subscriber = sub.subscriber_id,
                        address = %sub.address,
                        cursor = sub.last_epoch_number,
                        current_epoch = current_epoch,
                        "epoch cursor ahead of chain tip, logic error"
                    );
                }
            }

            let after = group
                .iter()
                .map(|s| i64::from(s.last_epoch_number))
                .min()
                .unwrap_or(0) as u32;
            let addresses: Vec<String> = group.iter().map(|s| s.address.clone()).collect();

            let chain = self.chain.clone();
            let limit = self.config.page_limit;
            let rewards = fetch_paged(limit, |offset| {
                let chain = chain.clone();
                let addresses = addresses.clone();
                async move {
                    chain
                        .account_rewards(&addresses, after, offset, limit)
                        .await
                }
            })
            .await;

            if rewards.is_empty() {
                continue;
            }
            debug!(batch = group.len(), rewards = rewards.len(), "reward delta fetched");

            for sub in &group {
                if let Err(e) = self.process_subscription(sub, &rewards).await {
                    error!(
                        subscriber = sub.subscriber_id,
                        address = %sub.address,
                        error = %e,
                        "reward processing failed for subscription"
                    );
                }
            }
        }
        Ok(())
    }

    async fn process_subscription(
        &self,
        sub: &Subscription,
        rewards: &[RewardRecord],
    ) -> anyhow::Result<()> {
        let mut mine: Vec<&RewardRecord> = rewards
            .iter()
            .filter(|r| r.stake_address == sub.address && r.epoch > sub.last_epoch_number)
            .collect();
        if mine.is_empty() {
            return Ok(());
        }
        mine.sort_by(|a, b| b.epoch.cmp(&a.epoch));

        let mut builder = MessageBuilder::new(self.config.allow_oversized)
            .header(&format!("Rewards for <code>{}</code>", sub.address));
        for reward in &mine {
            if !builder.push(&render::reward_block(reward)) {
                break;
            }
        }

        let highest = mine.iter().map(|r| r.epoch).max().unwrap_or(0);
        let message = builder.finish(mine.len());
        deliver_and_advance(
            &self.dispatcher,
            self.store.as_ref(),
            "reward-notify",
            self.config.send_timeout,
            sub,
            message,
            Some((WatermarkField::EpochNumber, i64::from(highest))),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testutil::{FakeChain, RecordingSink};
    use std::time::Duration;

    fn reward(stake: &str, epoch: u32, amount: u64) -> RewardRecord {
        RewardRecord {
            stake_address: stake.to_string(),
            epoch,
            amount,
            pool_id: Some("pool1abc".to_string()),
            reward_type: "member".to_string(),
        }
    }

    fn checker(
        chain: Arc<FakeChain>,
        store: Arc<MemoryStore>,
        sink: Arc<RecordingSink>,
    ) -> RewardChecker {
        RewardChecker::new(
            chain,
            store,
            Dispatcher::new(4, sink),
            CheckerConfig {
                batch_size: 50,
                page_limit: 100,
                send_timeout: Duration::from_secs(1),
                allow_oversized: false,
            },
        )
    }

    #[tokio::test]
    async fn test_new_epochs_notify_once_and_advance() {
        let chain = Arc::new(FakeChain::with_tip(1000, 500));
        chain.rewards.lock().unwrap().extend(vec![
            reward("stake1me", 499, 2_000_000),
            reward("stake1me", 500, 3_000_000),
        ]);

        let store = Arc::new(MemoryStore::new());
        let mut sub = Subscription::new(3, "stake1me".to_string(), AddressKind::Stake);
        sub.last_epoch_number = 498;
        store.insert(&sub).await.unwrap();

        let sink = Arc::new(RecordingSink::default());
        let checker = checker(chain.clone(), store.clone(), sink.clone());

        checker.run_once().await.unwrap();
        assert_eq!(sink.messages().len(), 1);
        assert_eq!(
            store.for_subscriber(3).await.unwrap()[0].last_epoch_number,
            500
        );

        checker.run_once().await.unwrap();
        assert_eq!(sink.messages().len(), 1, "re-run produced a duplicate");
    }

    #[tokio::test]
    async fn test_base_subscriptions_are_skipped() {
        let chain = Arc::new(FakeChain::with_tip(1000, 500));
        chain
            .rewards
            .lock()
            .unwrap()
            .push(reward("addr1me", 500, 1_000_000));

        let store = Arc::new(MemoryStore::new());
        store
            .insert(&Subscription::new(3, "addr1me".to_string(), AddressKind::Base))
            .await
            .unwrap();

        let sink = Arc::new(RecordingSink::default());
        checker(chain, store, sink.clone()).run_once().await.unwrap();
        assert!(sink.messages().is_empty());
    }

    #[tokio::test]
    async fn test_cursor_ahead_of_tip_is_logged_not_corrected() {
        let chain = Arc::new(FakeChain::with_tip(1000, 500));
        let store = Arc::new(MemoryStore::new());
        let mut sub = Subscription::new(3, "stake1me".to_string(), AddressKind::Stake);
        sub.last_epoch_number = 502;
        store.insert(&sub).await.unwrap();
        chain
            .rewards
            .lock()
            .unwrap()
            .push(reward("stake1me", 500, 1_000_000));

        let sink = Arc::new(RecordingSink::default());
        checker(chain, store.clone(), sink.clone())
            .run_once()
            .await
            .unwrap();

        // Cursor untouched: not corrected, and no stale notification went out.
        assert_eq!(
            store.for_subscriber(3).await.unwrap()[0].last_epoch_number,
            502
        );
        assert!(sink.messages().is_empty());
    }
}
