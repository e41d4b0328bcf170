//! Notification rendering.
//!
//! One message per subscription, one block per event, in fetch order.
//! Messages are bounded by the platform limit minus a safety margin; when
//! the next block would cross the budget the builder stops and a
//! "N more…" marker replaces the tail. HTML-subset formatting only.

use crate::assets::{format_lovelace, format_lovelace_signed};
use crate::chain::{GovProposal, GovVote, PoolInfo, PoolStatus, RewardRecord, TxRecord};
use crate::classify::{Category, TxActivity};

/// Platform message size limit.
pub const MESSAGE_LIMIT: usize = 4096;
/// Headroom kept free for the truncation marker and platform overhead.
pub const SAFETY_MARGIN: usize = 512;
/// Hard per-message payload budget.
pub const PAYLOAD_BUDGET: usize = MESSAGE_LIMIT - SAFETY_MARGIN;

const BLOCK_SEPARATOR: &str = "\n\n";

/// One classified, rendered event. Lives only for the duration of a pass.
#[derive(Debug, Clone)]
pub struct NotificationEvent {
    pub category: Category,
    pub text: String,
}

/// Accumulates one outbound message under the payload budget.
pub struct MessageBuilder {
    text: String,
    budget: usize,
    rendered: usize,
}

impl MessageBuilder {
    pub fn new(allow_oversized: bool) -> Self {
        Self {
            text: String::new(),
            budget: if allow_oversized {
                usize::MAX
            } else {
                PAYLOAD_BUDGET
            },
            rendered: 0,
        }
    }

    /// Prepend a header line. Counts toward the budget, not the event count.
    pub fn header(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    /// Append one event block. Returns false (and appends nothing) once the
    /// budget would be exceeded; the caller should stop and call `finish`.
    pub fn push(&mut self, event: &NotificationEvent) -> bool {
        let sep = if self.text.is_empty() { 0 } else { BLOCK_SEPARATOR.len() };
        if self.text.len() + sep + event.text.len() > self.budget {
            return false;
        }
        if sep > 0 {
            self.text.push_str(BLOCK_SEPARATOR);
        }
        self.text.push_str(&event.text);
        self.rendered += 1;
        true
    }

    pub fn rendered(&self) -> usize {
        self.rendered
    }

    /// Finalise the message, appending the truncation marker when events
    /// were left out.
    pub fn finish(mut self, total_events: usize) -> String {
        if total_events > self.rendered {
            let remaining = total_events - self.rendered;
            if !self.text.is_empty() {
                self.text.push_str(BLOCK_SEPARATOR);
            }
            self.text.push_str(&format!("{} more…", remaining));
        }
        self.text
    }
}

/// Escape the characters Telegram's HTML parse mode treats specially.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn short_hash(hash: &str) -> String {
    if hash.len() <= 8 {
        hash.to_string()
    } else {
        format!("{}…", &hash[..8])
    }
}

/// Render one classified transaction.
///
/// `pool_name` is the resolved display name for an Internal delegation
/// certificate. `assets` are (display name, formatted quantity) pairs for
/// the outputs relevant to the category.
pub fn tx_block(
    tx: &TxRecord,
    activity: &TxActivity,
    pool_name: Option<&str>,
    assets: &[(String, String)],
) -> NotificationEvent {
    let mut text = match activity.category {
        Category::Received => format!(
            "📥 <b>Received</b> {} ADA",
            format_lovelace_signed(activity.net_value)
        ),
        Category::Sent => format!(
            "📤 <b>Sent</b> {} ADA",
            format_lovelace_signed(activity.net_value)
        ),
        _ => "🔁 <b>Internal</b> transaction".to_string(),
    };
    text.push_str(&format!(
        "\nTx <code>{}</code>, fee {} ADA",
        short_hash(&tx.tx_hash),
        format_lovelace(tx.fee)
    ));
    if let Some(name) = pool_name {
        text.push_str(&format!("\nDelegated to <b>{}</b>", escape_html(name)));
    }
    for (name, quantity) in assets {
        text.push_str(&format!("\n{} {}", quantity, escape_html(name)));
    }
    NotificationEvent {
        category: activity.category,
        text,
    }
}

pub fn reward_block(reward: &RewardRecord) -> NotificationEvent {
    let mut text = format!(
        "🎁 <b>Reward</b> {} ADA for epoch {}",
        format_lovelace(reward.amount),
        reward.epoch
    );
    if let Some(pool) = &reward.pool_id {
        text.push_str(&format!("\nFrom pool <code>{}</code>", escape_html(pool)));
    }
    if !reward.reward_type.is_empty() && reward.reward_type != "member" {
        text.push_str(&format!(" ({})", escape_html(&reward.reward_type)));
    }
    NotificationEvent {
        category: Category::Reward,
        text,
    }
}

pub fn vote_block(vote: &GovVote) -> NotificationEvent {
    let subject = vote
        .proposal_title
        .clone()
        .unwrap_or_else(|| short_hash(&vote.proposal_id));
    NotificationEvent {
        category: Category::VoteCast,
        text: format!(
            "🗳 <b>Vote</b>: your representative voted <b>{}</b> on {}",
            vote.vote,
            escape_html(&subject)
        ),
    }
}

pub fn pool_block(pool: &PoolInfo) -> NotificationEvent {
    let display = pool
        .name
        .clone()
        .or_else(|| pool.ticker.clone())
        .unwrap_or_else(|| pool.pool_id.clone());
    let (category, mut text) = match pool.status {
        PoolStatus::Retired => (
            Category::PoolRetired,
            format!("❌ <b>Pool retired</b>: {}", escape_html(&display)),
        ),
        _ => (
            Category::PoolRetiring,
            format!("⚠️ <b>Pool retiring</b>: {}", escape_html(&display)),
        ),
    };
    if let Some(epoch) = pool.retiring_epoch {
        text.push_str(&format!(" (epoch {})", epoch));
    }
    text.push_str("\nConsider re-delegating to keep earning rewards.");
    NotificationEvent { category, text }
}

pub fn proposal_block(proposal: &GovProposal) -> NotificationEvent {
    let subject = proposal
        .title
        .clone()
        .unwrap_or_else(|| short_hash(&proposal.proposal_id));
    let mut text = format!("📜 <b>New proposal</b>: {}", escape_html(&subject));
    if !proposal.proposal_type.is_empty() {
        text.push_str(&format!(" ({})", escape_html(&proposal.proposal_type)));
    }
    NotificationEvent {
        category: Category::NewProposal,
        text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(size: usize) -> NotificationEvent {
        NotificationEvent {
            category: Category::Received,
            text: "x".repeat(size),
        }
    }

    #[test]
    fn test_truncation_marker_counts_remaining_events() {
        // 100-byte blocks + 2-byte separators: 35 fit in 3584, the 36th won't.
        let events: Vec<_> = (0..50).map(|_| event(100)).collect();
        let mut builder = MessageBuilder::new(false);
        let mut rendered = 0;
        for e in &events {
            if !builder.push(e) {
                break;
            }
            rendered += 1;
        }
        let message = builder.finish(events.len());
        assert_eq!(rendered, 35);
        assert!(message.ends_with("15 more…"));
        assert!(message.len() <= MESSAGE_LIMIT);
    }

    #[test]
    fn test_no_marker_when_everything_fits() {
        let events: Vec<_> = (0..3).map(|_| event(100)).collect();
        let mut builder = MessageBuilder::new(false);
        for e in &events {
            assert!(builder.push(e));
        }
        let message = builder.finish(events.len());
        assert!(!message.contains("more…"));
    }

    #[test]
    fn test_allow_oversized_skips_the_budget() {
        let events: Vec<_> = (0..50).map(|_| event(100)).collect();
        let mut builder = MessageBuilder::new(true);
        for e in &events {
            assert!(builder.push(e));
        }
        let message = builder.finish(events.len());
        assert!(message.len() > PAYLOAD_BUDGET);
        assert!(!message.contains("more…"));
    }

    #[test]
    fn test_header_counts_toward_budget_but_not_events() {
        let mut builder = MessageBuilder::new(false).header("watching addr1xyz");
        assert!(builder.push(&event(10)));
        assert_eq!(builder.rendered(), 1);
        let message = builder.finish(1);
        assert!(message.starts_with("watching addr1xyz"));
    }

    #[test]
    fn test_html_escaping() {
        assert_eq!(escape_html("a <b> & c"), "a &lt;b&gt; &amp; c");
    }
}
