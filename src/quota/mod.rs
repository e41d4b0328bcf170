//! Subscription quota engine.
//!
//! Gate-keeps the subscribe workflow: every subscriber gets one free slot
//! plus one per qualifying token held across all of their watched addresses
//! including the candidate. Stake addresses delegated to the operator's own
//! pool bypass the quota entirely and don't count against it. Claiming an
//! address another subscriber already watches is refused when that address
//! itself holds qualifying tokens.
//!
//! Everything is recomputed from live upstream asset queries on every
//! attempt: token transfers count immediately on the next subscribe call,
//! but never revoke slots already granted.

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::chain::{ChainApi, UpstreamError};
use crate::config::QuotaConfig;
use crate::store::{AddressKind, StoreError, SubscriptionStore};

#[derive(Error, Debug)]
pub enum QuotaError {
    #[error(
        "no free subscription slots: {tokens} granted, {used} in use; hold another qualifying token to watch {address}"
    )]
    SlotsExceeded {
        tokens: i64,
        used: i64,
        address: String,
    },
    #[error("{address} is already monitored by another subscriber and holds qualifying tokens")]
    AddressAlreadyOwned { address: String },
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub struct QuotaEngine {
    chain: Arc<dyn ChainApi>,
    store: Arc<dyn SubscriptionStore>,
    config: QuotaConfig,
}

impl QuotaEngine {
    pub fn new(
        chain: Arc<dyn ChainApi>,
        store: Arc<dyn SubscriptionStore>,
        config: QuotaConfig,
    ) -> Self {
        Self {
            chain,
            store,
            config,
        }
    }

    /// Decide whether `subscriber_id` may add `address`.
    pub async fn verify(
        &self,
        address: &str,
        kind: AddressKind,
        subscriber_id: i64,
    ) -> Result<(), QuotaError> {
        // Delegators to the operator's own pool are always welcome.
        if kind == AddressKind::Stake && self.delegated_to_operator(address).await? {
            info!(
                subscriber = subscriber_id,
                address = address,
                "operator-pool delegator, quota waived"
            );
            return Ok(());
        }

        let existing = self.store.for_subscriber(subscriber_id).await?;
        let exempt = self.exempt_addresses(&existing).await?;
        let used = existing
            .iter()
            .filter(|s| !exempt.contains(&s.address))
            .count() as i64;

        let mut tokens: i64 = 1; // the free slot
        for sub in &existing {
            tokens += self.qualifying_tokens(&sub.address, sub.address_kind).await?;
        }
        let already_subscribed = existing.iter().any(|s| s.address == address);
        if !already_subscribed {
            tokens += self.qualifying_tokens(address, kind).await?;
        }

        debug!(
            subscriber = subscriber_id,
            address = address,
            tokens = tokens,
            used = used,
            "quota evaluated"
        );
        if tokens - used <= 0 {
            return Err(QuotaError::SlotsExceeded {
                tokens,
                used,
                address: address.to_string(),
            });
        }

        // Theft check: a valuable address someone else already claimed can't
        // be hijacked by merely attempting to subscribe to it.
        let owned_by_other = self
            .store
            .get_all()
            .await?
            .iter()
            .any(|s| s.address == address && s.subscriber_id != subscriber_id);
        if owned_by_other && self.qualifying_tokens(address, kind).await? >= 1 {
            return Err(QuotaError::AddressAlreadyOwned {
                address: address.to_string(),
            });
        }

        Ok(())
    }

    /// Quota tokens held by one address: units of the configured policy.
    async fn qualifying_tokens(
        &self,
        address: &str,
        kind: AddressKind,
    ) -> Result<i64, QuotaError> {
        if self.config.token_policy_id.is_empty() {
            return Ok(0);
        }
        let assets = match kind {
            AddressKind::Stake => self.chain.account_assets(address).await?,
            AddressKind::Base => self.chain.address_assets(address).await?,
        };
        Ok(assets
            .iter()
            .filter(|a| a.policy_id == self.config.token_policy_id)
            .filter(|a| {
                self.config.token_asset_name.is_empty()
                    || a.asset_name == self.config.token_asset_name
            })
            .map(|a| a.quantity as i64)
            .sum())
    }

    async fn delegated_to_operator(&self, stake_address: &str) -> Result<bool, QuotaError> {
        if self.config.operator_pool_id.is_empty() {
            return Ok(false);
        }
        let accounts = self
            .chain
            .account_info(&[stake_address.to_string()])
            .await?;
        Ok(accounts
            .first()
            .and_then(|a| a.delegated_pool.as_deref())
            .map(|pool| pool == self.config.operator_pool_id)
            .unwrap_or(false))
    }

    /// Existing subscriptions that rule 1 exempts from the used count.
    async fn exempt_addresses(
        &self,
        existing: &[crate::store::Subscription],
    ) -> Result<HashSet<String>, QuotaError> {
        if self.config.operator_pool_id.is_empty() {
            return Ok(HashSet::new());
        }
        let stake_addresses: Vec<String> = existing
            .iter()
            .filter(|s| s.address_kind == AddressKind::Stake)
            .map(|s| s.address.clone())
            .collect();
        if stake_addresses.is_empty() {
            return Ok(HashSet::new());
        }
        let accounts = self.chain.account_info(&stake_addresses).await?;
        Ok(accounts
            .into_iter()
            .filter(|a| a.delegated_pool.as_deref() == Some(self.config.operator_pool_id.as_str()))
            .map(|a| a.stake_address)
            .collect())
    }
}
