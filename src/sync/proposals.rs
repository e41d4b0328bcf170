//! New governance-action notifications.
//!
//! Proposals are chain-global, so one fetch bounded by the lowest
//! gov-action watermark across all subscribers serves everyone; the result
//! is filtered per subscriber against their own watermark. Each subscriber
//! gets one message per pass and all of their subscription records advance
//! to "now" after a confirmed send.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::chain::{ChainApi, GovProposal};
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::render::{self, MessageBuilder};
use crate::store::{Subscription, SubscriptionStore, WatermarkField};

use super::{min_watermark, now_ts, pager::fetch_paged, CheckerConfig};

pub struct ProposalChecker {
    chain: Arc<dyn ChainApi>,
    store: Arc<dyn SubscriptionStore>,
    dispatcher: Dispatcher,
    config: CheckerConfig,
}

impl ProposalChecker {
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
        let subs = self.store.get_all().await?;
        if subs.is_empty() {
            return Ok(());
        }

        // The most permissive bound across everyone keeps this at one fetch.
        let global_after = min_watermark(&subs, WatermarkField::GovAction);

        let mut per_subscriber: HashMap<i64, Vec<Subscription>> = HashMap::new();
        for sub in subs {
            per_subscriber.entry(sub.subscriber_id).or_default().push(sub);
        }

        let chain = self.chain.clone();
        let limit = self.config.page_limit;
        let mut proposals: Vec<GovProposal> = fetch_paged(limit, |offset| {
            let chain = chain.clone();
            async move { chain.gov_proposals(global_after, offset, limit).await }
        })
        .await;
        if proposals.is_empty() {
            return Ok(());
        }
        proposals.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        debug!(proposals = proposals.len(), "proposal delta fetched");

        for (subscriber, subs) in per_subscriber {
            if let Err(e) = self.notify_subscriber(subscriber, &subs, &proposals).await {
                error!(
                    subscriber = subscriber,
                    error = %e,
                    "proposal processing failed for subscriber"
                );
            }
        }
        Ok(())
    }

    async fn notify_subscriber(
        &self,
        subscriber: i64,
        subs: &[Subscription],
        proposals: &[GovProposal],
    ) -> anyhow::Result<()> {
        let watermark = subs
            .iter()
            .map(|s| s.last_gov_action_watermark)
            .min()
            .unwrap_or(0);
        let fresh: Vec<&GovProposal> = proposals
            .iter()
            .filter(|p| p.submitted_at > watermark)
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }

        let mut builder =
            MessageBuilder::new(self.config.allow_oversized).header("Governance actions");
        for proposal in &fresh {
            if !builder.push(&render::proposal_block(proposal)) {
                break;
            }
        }
        let message = builder.finish(fresh.len());

        let outcome = self
            .dispatcher
            .send_notification(
                "proposal-notify",
                self.config.send_timeout,
                subscriber,
                message,
            )
            .await;
        if outcome != DispatchOutcome::Done {
            warn!(
                subscriber = subscriber,
                outcome = ?outcome,
                "proposal alert not confirmed, watermark left untouched"
            );
            return Ok(());
        }

        let now = now_ts();
        for sub in subs {
            self.store
                .update_watermark(
                    sub.subscriber_id,
                    &sub.address,
                    WatermarkField::GovAction,
                    now,
                )
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AddressKind, MemoryStore};
    use crate::testutil::{FakeChain, RecordingSink};
    use std::time::Duration;

    fn proposal(id: &str, submitted_at: i64) -> GovProposal {
        GovProposal {
            proposal_id: id.to_string(),
            title: Some(format!("Action {}", id)),
            proposal_type: "ParameterChange".to_string(),
            submitted_at,
            expires_epoch: Some(520),
        }
    }

    fn checker(
        chain: Arc<FakeChain>,
        store: Arc<MemoryStore>,
        sink: Arc<RecordingSink>,
    ) -> ProposalChecker {
        ProposalChecker::new(
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
    async fn test_per_subscriber_fanout_respects_individual_watermarks() {
        let chain = Arc::new(FakeChain::with_tip(1000, 500));
        chain
            .proposals
            .lock()
            .unwrap()
            .push(proposal("gov_action1", 2_000));

        let store = Arc::new(MemoryStore::new());
        // Subscriber 1 has not seen the action; subscriber 2 already has.
        let mut early = Subscription::new(1, "addr1me".to_string(), AddressKind::Base);
        early.last_gov_action_watermark = 1_000;
        let mut late = Subscription::new(2, "stake1you".to_string(), AddressKind::Stake);
        late.last_gov_action_watermark = 3_000;
        store.insert(&early).await.unwrap();
        store.insert(&late).await.unwrap();

        let sink = Arc::new(RecordingSink::default());
        let checker = checker(chain.clone(), store.clone(), sink.clone());
        checker.run_once().await.unwrap();

        let messages = sink.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, 1);

        let advanced = store.for_subscriber(1).await.unwrap()[0].last_gov_action_watermark;
        assert!(advanced >= 2_000);

        // Idempotent re-run.
        checker.run_once().await.unwrap();
        assert_eq!(sink.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_all_subscriber_records_advance_together() {
        let chain = Arc::new(FakeChain::with_tip(1000, 500));
        chain
            .proposals
            .lock()
            .unwrap()
            .push(proposal("gov_action2", 2_000));

        let store = Arc::new(MemoryStore::new());
        store
            .insert(&Subscription::new(1, "addr1a".to_string(), AddressKind::Base))
            .await
            .unwrap();
        store
            .insert(&Subscription::new(1, "stake1b".to_string(), AddressKind::Stake))
            .await
            .unwrap();

        let sink = Arc::new(RecordingSink::default());
        checker(chain, store.clone(), sink.clone())
            .run_once()
            .await
            .unwrap();

        assert_eq!(sink.messages().len(), 1, "one message per subscriber");
        for sub in store.for_subscriber(1).await.unwrap() {
            assert!(sub.last_gov_action_watermark > 0);
        }
    }
}
