//! Scheduled synchronization engines, one per notification domain.
//!
//! Every checker runs the same pass: load subscriptions, batch them, fetch
//! the delta past the batch's most permissive watermark, classify and
//! render per subscription, dispatch, then advance that subscription's
//! watermark, only after the send was confirmed. A failed send leaves the
//! watermark untouched, so the next pass reprocesses the same delta:
//! duplicates are possible on transient failure, silent loss is not.
//!
//! Height cursors hold the first unseen height (strictly-greater-than
//! fetch on `cursor - 1`, advance to highest observed + 1). Epoch cursors
//! hold the last notified epoch (strictly-greater-than fetch on the
//! cursor itself). Time cursors advance to "now".

pub mod batch;
pub mod pager;
pub mod pools;
pub mod proposals;
pub mod rewards;
pub mod transactions;
pub mod votes;

use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

use crate::config::Config;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::store::{Subscription, SubscriptionStore, WatermarkField};

pub use pools::PoolChecker;
pub use proposals::ProposalChecker;
pub use rewards::RewardChecker;
pub use transactions::TransactionChecker;
pub use votes::VoteChecker;

/// Settings shared by every domain checker.
#[derive(Debug, Clone)]
pub struct CheckerConfig {
    pub batch_size: usize,
    pub page_limit: usize,
    pub send_timeout: Duration,
    pub allow_oversized: bool,
}

impl CheckerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: config.sync.batch_size,
            page_limit: config.chain.page_limit,
            send_timeout: Duration::from_secs(config.dispatch.send_timeout_secs),
            allow_oversized: config.render.allow_oversized,
        }
    }
}

pub(crate) fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Lowest watermark among the batch members: the most permissive fetch
/// bound, so no member's unseen data is skipped. Over-fetched records are
/// filtered out client-side per subscription.
pub(crate) fn min_watermark(subs: &[Subscription], field: WatermarkField) -> i64 {
    subs.iter().map(|s| s.watermark(field)).min().unwrap_or(0)
}

/// Send one notification through the dispatch pool; advance the watermark
/// only when the send was confirmed within its soft deadline.
pub(crate) async fn deliver_and_advance(
    dispatcher: &Dispatcher,
    store: &dyn SubscriptionStore,
    label: &str,
    timeout: Duration,
    sub: &Subscription,
    message: String,
    advance: Option<(WatermarkField, i64)>,
) -> anyhow::Result<bool> {
    let outcome = dispatcher
        .send_notification(label, timeout, sub.subscriber_id, message)
        .await;
    if outcome != DispatchOutcome::Done {
        warn!(
            subscriber = sub.subscriber_id,
            address = %sub.address,
            outcome = ?outcome,
            "notification not confirmed, watermark left untouched"
        );
        return Ok(false);
    }
    if let Some((field, value)) = advance {
        store
            .update_watermark(sub.subscriber_id, &sub.address, field, value)
            .await?;
    }
    Ok(true)
}

/// Run one checker on a fixed cadence. Pass failures are logged and the
/// schedule keeps going; nothing here is process-fatal.
pub fn spawn_schedule<F, Fut>(domain: &'static str, period: Duration, mut run: F)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            if let Err(e) = run().await {
                error!(domain = domain, error = %e, "sync pass failed");
            }
        }
    });
}
