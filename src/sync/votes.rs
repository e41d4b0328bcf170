//! Governance vote notifications.
//!
//! Each subscriber's delegated representative is resolved first
//! (undelegated subscribers are skipped), then that representative's votes
//! past the subscriber's own watermark are fetched independently per
//! subscriber. No cross-subscriber caching of representative votes: the
//! per-subscriber watermarks stay correct that way. The account lookup is
//! still batched.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::chain::{ChainApi, GovVote};
use crate::dispatch::Dispatcher;
use crate::render::{self, MessageBuilder};
use crate::store::{AddressKind, Subscription, SubscriptionStore, WatermarkField};

use super::{batch::batch, deliver_and_advance, now_ts, pager::fetch_paged, CheckerConfig};

pub struct VoteChecker {
    chain: Arc<dyn ChainApi>,
    store: Arc<dyn SubscriptionStore>,
    dispatcher: Dispatcher,
    config: CheckerConfig,
}

impl VoteChecker {
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

        for group in batch(subs, self.config.batch_size)? {
            let addresses: Vec<String> = group.iter().map(|s| s.address.clone()).collect();
            let accounts = match self.chain.account_info(&addresses).await {
                Ok(accounts) => accounts,
                Err(e) => {
                    warn!(batch = group.len(), error = %e, "account lookup failed, skipping batch");
                    continue;
                }
            };
            let dreps: HashMap<String, String> = accounts
                .into_iter()
                .filter_map(|a| a.delegated_drep.map(|d| (a.stake_address, d)))
                .collect();

            for sub in &group {
                let Some(drep) = dreps.get(&sub.address) else {
                    debug!(
                        subscriber = sub.subscriber_id,
                        address = %sub.address,
                        "no representative delegation, skipping"
                    );
                    continue;
                };
                if let Err(e) = self.process_subscription(sub, drep).await {
                    error!(
                        subscriber = sub.subscriber_id,
                        address = %sub.address,
                        error = %e,
                        "vote processing failed for subscription"
                    );
                }
            }
        }
        Ok(())
    }

    async fn process_subscription(&self, sub: &Subscription, drep: &str) -> anyhow::Result<()> {
        let after = sub.last_gov_votes_watermark;
        let chain = self.chain.clone();
        let limit = self.config.page_limit;
        let drep_owned = drep.to_string();
        let mut votes: Vec<GovVote> = fetch_paged(limit, |offset| {
            let chain = chain.clone();
            let drep = drep_owned.clone();
            async move { chain.drep_votes(&drep, after, offset, limit).await }
        })
        .await
        .into_iter()
        .filter(|v| v.cast_at > after)
        .collect();
        if votes.is_empty() {
            return Ok(());
        }
        votes.sort_by(|a, b| b.cast_at.cmp(&a.cast_at));

        let mut builder = MessageBuilder::new(self.config.allow_oversized).header(&format!(
            "Governance activity for <code>{}</code>",
            sub.address
        ));
        for vote in &votes {
            if !builder.push(&render::vote_block(vote)) {
                break;
            }
        }

        let message = builder.finish(votes.len());
        deliver_and_advance(
            &self.dispatcher,
            self.store.as_ref(),
            "vote-notify",
            self.config.send_timeout,
            sub,
            message,
            Some((WatermarkField::GovVotes, now_ts())),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{AccountInfo, VoteChoice};
    use crate::store::MemoryStore;
    use crate::testutil::{FakeChain, RecordingSink};
    use std::time::Duration;

    fn vote(drep: &str, cast_at: i64) -> GovVote {
        GovVote {
            drep_id: drep.to_string(),
            proposal_id: format!("gov_action{}", cast_at),
            proposal_title: Some("Increase treasury cut".to_string()),
            vote: VoteChoice::Yes,
            cast_at,
            tx_hash: "votehash".to_string(),
        }
    }

    fn checker(
        chain: Arc<FakeChain>,
        store: Arc<MemoryStore>,
        sink: Arc<RecordingSink>,
    ) -> VoteChecker {
        VoteChecker::new(
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
    async fn test_new_votes_notify_and_advance_to_now() {
        let chain = Arc::new(FakeChain::with_tip(1000, 500));
        chain.accounts.lock().unwrap().insert(
            "stake1me".to_string(),
            AccountInfo {
                stake_address: "stake1me".to_string(),
                delegated_pool: None,
                delegated_drep: Some("drep1rep".to_string()),
                total_balance: 0,
            },
        );
        chain.votes.lock().unwrap().push(vote("drep1rep", 1_000));

        let store = Arc::new(MemoryStore::new());
        let mut sub = Subscription::new(5, "stake1me".to_string(), AddressKind::Stake);
        sub.last_gov_votes_watermark = 500;
        store.insert(&sub).await.unwrap();

        let sink = Arc::new(RecordingSink::default());
        let checker = checker(chain.clone(), store.clone(), sink.clone());
        checker.run_once().await.unwrap();

        let messages = sink.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].1.contains("Increase treasury cut"));
        let advanced = store.for_subscriber(5).await.unwrap()[0].last_gov_votes_watermark;
        assert!(advanced >= 1_000, "watermark did not advance to now");

        // Re-run: the old vote is behind the new watermark.
        checker.run_once().await.unwrap();
        assert_eq!(sink.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_undelegated_subscriber_is_skipped() {
        let chain = Arc::new(FakeChain::with_tip(1000, 500));
        chain.accounts.lock().unwrap().insert(
            "stake1me".to_string(),
            AccountInfo {
                stake_address: "stake1me".to_string(),
                delegated_pool: Some("pool1abc".to_string()),
                delegated_drep: None,
                total_balance: 0,
            },
        );
        chain.votes.lock().unwrap().push(vote("drep1rep", 1_000));

        let store = Arc::new(MemoryStore::new());
        store
            .insert(&Subscription::new(5, "stake1me".to_string(), AddressKind::Stake))
            .await
            .unwrap();

        let sink = Arc::new(RecordingSink::default());
        checker(chain, store, sink.clone()).run_once().await.unwrap();
        assert!(sink.messages().is_empty());
    }
}
