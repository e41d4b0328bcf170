//! HTTP client for the chain-data API.
//!
//! Bulk queries post a JSON body with the address/pool-id set and take
//! `limit`/`offset` plus the greater-than watermark filter as query
//! parameters. Non-2xx responses become [`UpstreamError::Api`] with the
//! status and the response body, so callers can log and skip the batch.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::types::*;

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("upstream API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("upstream data missing: {0}")]
    MissingData(String),
}

/// The upstream query surface the sync engines and the quota engine run
/// against. Implemented by [`ChainClient`] in production and by in-memory
/// fakes in tests.
#[async_trait]
pub trait ChainApi: Send + Sync {
    async fn tip(&self) -> Result<ChainTip, UpstreamError>;

    /// Transactions touching any of the base addresses, strictly newer than
    /// `after_height`.
    async fn address_transactions(
        &self,
        addresses: &[String],
        after_height: u64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<TxRecord>, UpstreamError>;

    /// Transactions touching any of the stake addresses, strictly newer than
    /// `after_height`. IO entries come back stake-attributed.
    async fn account_transactions(
        &self,
        stake_addresses: &[String],
        after_height: u64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<TxRecord>, UpstreamError>;

    /// Rewards paid to the stake addresses for epochs strictly newer than
    /// `after_epoch`.
    async fn account_rewards(
        &self,
        stake_addresses: &[String],
        after_epoch: u32,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<RewardRecord>, UpstreamError>;

    async fn account_info(
        &self,
        stake_addresses: &[String],
    ) -> Result<Vec<AccountInfo>, UpstreamError>;

    async fn pool_info(&self, pool_id: &str) -> Result<Option<PoolInfo>, UpstreamError>;

    /// Status records for the given pools, restricted to pools whose status
    /// is no longer `registered`.
    async fn pools_not_registered(
        &self,
        pool_ids: &[String],
    ) -> Result<Vec<PoolInfo>, UpstreamError>;

    /// Votes cast by one representative strictly after `after_time`.
    async fn drep_votes(
        &self,
        drep_id: &str,
        after_time: i64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<GovVote>, UpstreamError>;

    /// Governance actions submitted strictly after `after_time`.
    async fn gov_proposals(
        &self,
        after_time: i64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<GovProposal>, UpstreamError>;

    /// Native assets held by one base address.
    async fn address_assets(&self, address: &str) -> Result<Vec<AssetAmount>, UpstreamError>;

    /// Native assets held across one stake account.
    async fn account_assets(
        &self,
        stake_address: &str,
    ) -> Result<Vec<AssetAmount>, UpstreamError>;

    /// Token-registry decimals for an asset, `None` when the registry has no
    /// metadata for it.
    async fn asset_decimals(
        &self,
        policy_id: &str,
        asset_name: &str,
    ) -> Result<Option<u8>, UpstreamError>;
}

pub struct ChainClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl ChainClient {
    pub fn new(base_url: String, api_key: String, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url,
            api_key,
            client,
        }
    }

    /// POST a bulk query and decode the JSON page.
    async fn post_page<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, UpstreamError> {
        let url = format!("{}/{}", self.base_url, path);
        let mut req = self.client.post(&url).query(query).json(&body);
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }
        let resp = req.send().await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::Api { status, message });
        }

        let page: Vec<T> = resp.json().await?;
        debug!(path = path, items = page.len(), "chain page fetched");
        Ok(page)
    }

    /// GET a list endpoint and decode the JSON page.
    async fn get_page<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, UpstreamError> {
        let url = format!("{}/{}", self.base_url, path);
        let mut req = self.client.get(&url).query(query);
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }
        let resp = req.send().await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::Api { status, message });
        }

        let page: Vec<T> = resp.json().await?;
        debug!(path = path, items = page.len(), "chain page fetched");
        Ok(page)
    }

    fn paging(offset: usize, limit: usize) -> [(&'static str, String); 2] {
        [("offset", offset.to_string()), ("limit", limit.to_string())]
    }
}

#[async_trait]
impl ChainApi for ChainClient {
    async fn tip(&self) -> Result<ChainTip, UpstreamError> {
        let tips: Vec<ChainTip> = self.get_page("tip", &[]).await?;
        tips.into_iter()
            .next()
            .ok_or_else(|| UpstreamError::MissingData("empty tip response".to_string()))
    }

    async fn address_transactions(
        &self,
        addresses: &[String],
        after_height: u64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<TxRecord>, UpstreamError> {
        let [o, l] = Self::paging(offset, limit);
        self.post_page(
            "address_txs",
            json!({ "_addresses": addresses, "_after_block_height": after_height }),
            &[o, l],
        )
        .await
    }

    async fn account_transactions(
        &self,
        stake_addresses: &[String],
        after_height: u64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<TxRecord>, UpstreamError> {
        let [o, l] = Self::paging(offset, limit);
        self.post_page(
            "account_txs",
            json!({ "_stake_addresses": stake_addresses, "_after_block_height": after_height }),
            &[o, l],
        )
        .await
    }

    async fn account_rewards(
        &self,
        stake_addresses: &[String],
        after_epoch: u32,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<RewardRecord>, UpstreamError> {
        let [o, l] = Self::paging(offset, limit);
        self.post_page(
            "account_rewards",
            json!({ "_stake_addresses": stake_addresses, "_after_epoch": after_epoch }),
            &[o, l],
        )
        .await
    }

    async fn account_info(
        &self,
        stake_addresses: &[String],
    ) -> Result<Vec<AccountInfo>, UpstreamError> {
        self.post_page(
            "account_info",
            json!({ "_stake_addresses": stake_addresses }),
            &[],
        )
        .await
    }

    async fn pool_info(&self, pool_id: &str) -> Result<Option<PoolInfo>, UpstreamError> {
        let pools: Vec<PoolInfo> = self
            .post_page("pool_info", json!({ "_pool_ids": [pool_id] }), &[])
            .await?;
        Ok(pools.into_iter().next())
    }

    async fn pools_not_registered(
        &self,
        pool_ids: &[String],
    ) -> Result<Vec<PoolInfo>, UpstreamError> {
        self.post_page(
            "pool_info",
            json!({ "_pool_ids": pool_ids }),
            &[("status", "neq.registered".to_string())],
        )
        .await
    }

    async fn drep_votes(
        &self,
        drep_id: &str,
        after_time: i64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<GovVote>, UpstreamError> {
        let [o, l] = Self::paging(offset, limit);
        self.get_page(
            "drep_votes",
            &[
                ("_drep_id", drep_id.to_string()),
                ("_after_time", after_time.to_string()),
                o,
                l,
            ],
        )
        .await
    }

    async fn gov_proposals(
        &self,
        after_time: i64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<GovProposal>, UpstreamError> {
        let [o, l] = Self::paging(offset, limit);
        self.get_page(
            "proposal_list",
            &[("_after_time", after_time.to_string()), o, l],
        )
        .await
    }

    async fn address_assets(&self, address: &str) -> Result<Vec<AssetAmount>, UpstreamError> {
        self.post_page(
            "address_assets",
            json!({ "_addresses": [address] }),
            &[],
        )
        .await
    }

    async fn account_assets(
        &self,
        stake_address: &str,
    ) -> Result<Vec<AssetAmount>, UpstreamError> {
        self.post_page(
            "account_assets",
            json!({ "_stake_addresses": [stake_address] }),
            &[],
        )
        .await
    }

    async fn asset_decimals(
        &self,
        policy_id: &str,
        asset_name: &str,
    ) -> Result<Option<u8>, UpstreamError> {
        let meta: Vec<AssetMetadata> = self
            .get_page(
                "asset_token_registry",
                &[
                    ("_asset_policy", policy_id.to_string()),
                    ("_asset_name", asset_name.to_string()),
                ],
            )
            .await?;
        Ok(meta.into_iter().next().and_then(|m| m.decimals))
    }
}
