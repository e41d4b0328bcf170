//! Valkey (Redis-compatible) subscription and cursor store.
//!
//! Data model:
//!   sub:{subscriber_id}:{address}      → JSON Subscription
//!   budget:{subscriber_id}:{pool_id}   → remaining retirement notifications
//!
//! Watermark fields are monotonically non-decreasing: an update below the
//! stored value is refused and logged, never written. All durable state
//! lives here; the sync engines keep nothing across passes, which is what
//! makes them restartable.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Retirement notifications granted per (subscriber, pool) before alerts stop.
pub const DEFAULT_POOL_BUDGET: u32 = 5;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(#[from] redis::RedisError),
    #[error("store record corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressKind {
    /// `stake1…`, aggregating all base addresses delegated under it.
    Stake,
    /// `addr1…`, a single payment address.
    Base,
}

/// One watched address for one subscriber. Unique on (subscriber_id, address).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub subscriber_id: i64,
    pub address: String,
    pub address_kind: AddressKind,
    /// Last block height whose transactions were notified.
    pub last_block_height: u64,
    /// Last epoch whose rewards were notified.
    pub last_epoch_number: u32,
    /// Unix timestamp up to which governance votes were notified.
    pub last_gov_votes_watermark: i64,
    /// Unix timestamp up to which governance actions were notified.
    pub last_gov_action_watermark: i64,
}

impl Subscription {
    pub fn new(subscriber_id: i64, address: String, kind: AddressKind) -> Self {
        Self {
            subscriber_id,
            address,
            address_kind: kind,
            last_block_height: 0,
            last_epoch_number: 0,
            last_gov_votes_watermark: 0,
            last_gov_action_watermark: 0,
        }
    }

    pub fn watermark(&self, field: WatermarkField) -> i64 {
        match field {
            WatermarkField::BlockHeight => self.last_block_height as i64,
            WatermarkField::EpochNumber => i64::from(self.last_epoch_number),
            WatermarkField::GovVotes => self.last_gov_votes_watermark,
            WatermarkField::GovAction => self.last_gov_action_watermark,
        }
    }

    fn set_watermark(&mut self, field: WatermarkField, value: i64) {
        match field {
            WatermarkField::BlockHeight => self.last_block_height = value.max(0) as u64,
            WatermarkField::EpochNumber => {
                self.last_epoch_number = u32::try_from(value.max(0)).unwrap_or(u32::MAX)
            }
            WatermarkField::GovVotes => self.last_gov_votes_watermark = value,
            WatermarkField::GovAction => self.last_gov_action_watermark = value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkField {
    BlockHeight,
    EpochNumber,
    GovVotes,
    GovAction,
}

impl std::fmt::Display for WatermarkField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatermarkField::BlockHeight => write!(f, "block_height"),
            WatermarkField::EpochNumber => write!(f, "epoch_number"),
            WatermarkField::GovVotes => write!(f, "gov_votes"),
            WatermarkField::GovAction => write!(f, "gov_action"),
        }
    }
}

/// Durable subscription/cursor store contract.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get_all(&self) -> Result<Vec<Subscription>, StoreError>;

    async fn for_subscriber(&self, subscriber_id: i64) -> Result<Vec<Subscription>, StoreError>;

    /// Insert or replace the record for (subscriber_id, address).
    async fn insert(&self, sub: &Subscription) -> Result<(), StoreError>;

    /// Returns whether a record was actually removed.
    async fn remove(&self, subscriber_id: i64, address: &str) -> Result<bool, StoreError>;

    /// Advance one watermark field. Regressions are refused and logged.
    async fn update_watermark(
        &self,
        subscriber_id: i64,
        address: &str,
        field: WatermarkField,
        value: i64,
    ) -> Result<(), StoreError>;

    /// Remaining retirement notifications for (subscriber, pool), lazily
    /// initialised to [`DEFAULT_POOL_BUDGET`] on first query.
    async fn pool_budget(&self, subscriber_id: i64, pool_id: &str) -> Result<u32, StoreError>;

    /// Decrement the retirement budget, floor 0.
    async fn decrement_pool_budget(
        &self,
        subscriber_id: i64,
        pool_id: &str,
    ) -> Result<(), StoreError>;
}

fn apply_watermark(sub: &mut Subscription, field: WatermarkField, value: i64) -> bool {
    let current = sub.watermark(field);
    if value < current {
        warn!(
            subscriber = sub.subscriber_id,
            address = %sub.address,
            field = %field,
            current = current,
            incoming = value,
            "refusing watermark regression"
        );
        return false;
    }
    sub.set_watermark(field, value);
    true
}

// --- In-memory store ---

/// In-memory store used by tests and local development.
#[derive(Default)]
pub struct MemoryStore {
    subs: RwLock<Vec<Subscription>>,
    budgets: RwLock<std::collections::HashMap<(i64, String), u32>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn get_all(&self) -> Result<Vec<Subscription>, StoreError> {
        Ok(self.subs.read().await.clone())
    }

    async fn for_subscriber(&self, subscriber_id: i64) -> Result<Vec<Subscription>, StoreError> {
        Ok(self
            .subs
            .read()
            .await
            .iter()
            .filter(|s| s.subscriber_id == subscriber_id)
            .cloned()
            .collect())
    }

    async fn insert(&self, sub: &Subscription) -> Result<(), StoreError> {
        let mut subs = self.subs.write().await;
        subs.retain(|s| !(s.subscriber_id == sub.subscriber_id && s.address == sub.address));
        subs.push(sub.clone());
        Ok(())
    }

    async fn remove(&self, subscriber_id: i64, address: &str) -> Result<bool, StoreError> {
        let mut subs = self.subs.write().await;
        let before = subs.len();
        subs.retain(|s| !(s.subscriber_id == subscriber_id && s.address == address));
        Ok(subs.len() < before)
    }

    async fn update_watermark(
        &self,
        subscriber_id: i64,
        address: &str,
        field: WatermarkField,
        value: i64,
    ) -> Result<(), StoreError> {
        let mut subs = self.subs.write().await;
        if let Some(sub) = subs
            .iter_mut()
            .find(|s| s.subscriber_id == subscriber_id && s.address == address)
        {
            apply_watermark(sub, field, value);
        }
        Ok(())
    }

    async fn pool_budget(&self, subscriber_id: i64, pool_id: &str) -> Result<u32, StoreError> {
        let mut budgets = self.budgets.write().await;
        Ok(*budgets
            .entry((subscriber_id, pool_id.to_string()))
            .or_insert(DEFAULT_POOL_BUDGET))
    }

    async fn decrement_pool_budget(
        &self,
        subscriber_id: i64,
        pool_id: &str,
    ) -> Result<(), StoreError> {
        let mut budgets = self.budgets.write().await;
        let entry = budgets
            .entry((subscriber_id, pool_id.to_string()))
            .or_insert(DEFAULT_POOL_BUDGET);
        *entry = entry.saturating_sub(1);
        Ok(())
    }
}

// --- Valkey store ---

/// Valkey-backed store.
///
/// All keys are namespaced under a configurable prefix to allow multiple
/// instances to share a single Valkey without collisions. Default prefix:
/// "stakewatch" → keys like "stakewatch:sub:{id}:{address}".
#[derive(Clone)]
pub struct ValkeyStore {
    conn: MultiplexedConnection,
    prefix: String,
}

impl ValkeyStore {
    /// Connect to Valkey/Redis.
    pub async fn connect(url: &str, prefix: &str) -> anyhow::Result<Self> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(url = url, prefix = prefix, "connected to Valkey");
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
        })
    }

    /// Build a namespaced key: "{prefix}:{suffix}"
    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    fn sub_key(&self, subscriber_id: i64, address: &str) -> String {
        self.key(&format!("sub:{}:{}", subscriber_id, address))
    }

    fn budget_key(&self, subscriber_id: i64, pool_id: &str) -> String {
        self.key(&format!("budget:{}:{}", subscriber_id, pool_id))
    }

    /// Test connectivity.
    pub async fn ping(&self) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!(response = %pong, "Valkey ping");
        Ok(())
    }

    async fn scan_subs(&self, pattern: &str) -> Result<Vec<Subscription>, StoreError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = redis::cmd("KEYS").arg(pattern).query_async(&mut conn).await?;

        let mut subs = Vec::new();
        for key in keys {
            let json: Option<String> = conn.get(&key).await?;
            if let Some(j) = json {
                match serde_json::from_str::<Subscription>(&j) {
                    Ok(sub) => subs.push(sub),
                    Err(e) => warn!(key = %key, error = %e, "skipping corrupt subscription record"),
                }
            }
        }
        Ok(subs)
    }
}

#[async_trait]
impl SubscriptionStore for ValkeyStore {
    async fn get_all(&self) -> Result<Vec<Subscription>, StoreError> {
        self.scan_subs(&self.key("sub:*")).await
    }

    async fn for_subscriber(&self, subscriber_id: i64) -> Result<Vec<Subscription>, StoreError> {
        self.scan_subs(&self.key(&format!("sub:{}:*", subscriber_id)))
            .await
    }

    async fn insert(&self, sub: &Subscription) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = self.sub_key(sub.subscriber_id, &sub.address);
        let json = serde_json::to_string(sub)?;
        conn.set::<_, _, ()>(&key, &json).await?;
        debug!(subscriber = sub.subscriber_id, address = %sub.address, "stored subscription");
        Ok(())
    }

    async fn remove(&self, subscriber_id: i64, address: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(self.sub_key(subscriber_id, address)).await?;
        Ok(removed > 0)
    }

    async fn update_watermark(
        &self,
        subscriber_id: i64,
        address: &str,
        field: WatermarkField,
        value: i64,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = self.sub_key(subscriber_id, address);
        let json: Option<String> = conn.get(&key).await?;
        let Some(j) = json else {
            // Subscription was removed mid-pass; nothing to advance.
            return Ok(());
        };
        let mut sub: Subscription = serde_json::from_str(&j)?;
        if apply_watermark(&mut sub, field, value) {
            conn.set::<_, _, ()>(&key, serde_json::to_string(&sub)?).await?;
        }
        Ok(())
    }

    async fn pool_budget(&self, subscriber_id: i64, pool_id: &str) -> Result<u32, StoreError> {
        let mut conn = self.conn.clone();
        let key = self.budget_key(subscriber_id, pool_id);
        let current: Option<u32> = conn.get(&key).await?;
        match current {
            Some(v) => Ok(v),
            None => {
                conn.set::<_, _, ()>(&key, DEFAULT_POOL_BUDGET).await?;
                Ok(DEFAULT_POOL_BUDGET)
            }
        }
    }

    async fn decrement_pool_budget(
        &self,
        subscriber_id: i64,
        pool_id: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = self.budget_key(subscriber_id, pool_id);
        let current: Option<u32> = conn.get(&key).await?;
        let next = current.unwrap_or(DEFAULT_POOL_BUDGET).saturating_sub(1);
        conn.set::<_, _, ()>(&key, next).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(id: i64, address: &str) -> Subscription {
        Subscription::new(id, address.to_string(), AddressKind::Stake)
    }

    #[tokio::test]
    async fn test_insert_is_unique_per_subscriber_address() {
        let store = MemoryStore::new();
        store.insert(&sub(1, "stake1aaa")).await.unwrap();
        store.insert(&sub(1, "stake1aaa")).await.unwrap();
        store.insert(&sub(2, "stake1aaa")).await.unwrap();
        assert_eq!(store.get_all().await.unwrap().len(), 2);
        assert_eq!(store.for_subscriber(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_watermark_never_regresses() {
        let store = MemoryStore::new();
        store.insert(&sub(1, "stake1aaa")).await.unwrap();

        store
            .update_watermark(1, "stake1aaa", WatermarkField::BlockHeight, 500)
            .await
            .unwrap();
        store
            .update_watermark(1, "stake1aaa", WatermarkField::BlockHeight, 400)
            .await
            .unwrap();

        let subs = store.for_subscriber(1).await.unwrap();
        assert_eq!(subs[0].last_block_height, 500);
    }

    #[tokio::test]
    async fn test_remove_reports_whether_anything_was_removed() {
        let store = MemoryStore::new();
        store.insert(&sub(1, "stake1aaa")).await.unwrap();
        assert!(store.remove(1, "stake1aaa").await.unwrap());
        assert!(!store.remove(1, "stake1aaa").await.unwrap());
    }

    #[tokio::test]
    async fn test_pool_budget_defaults_and_floors_at_zero() {
        let store = MemoryStore::new();
        assert_eq!(store.pool_budget(1, "pool1xyz").await.unwrap(), 5);
        for _ in 0..7 {
            store.decrement_pool_budget(1, "pool1xyz").await.unwrap();
        }
        assert_eq!(store.pool_budget(1, "pool1xyz").await.unwrap(), 0);
    }
}
