//! In-memory fakes shared by the module tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::chain::{
    AccountInfo, AssetAmount, ChainApi, ChainTip, GovProposal, GovVote, PoolInfo, PoolStatus,
    RewardRecord, TxRecord, UpstreamError,
};
use crate::telegram::MessageSink;

/// Records every outbound message instead of delivering it.
#[derive(Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<(i64, String)>>,
    pub fail_sends: std::sync::atomic::AtomicBool,
}

impl RecordingSink {
    pub fn messages(&self) -> Vec<(i64, String)> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageSink for RecordingSink {
    async fn send_message(&self, chat_id: i64, text: &str) -> anyhow::Result<()> {
        if self.fail_sends.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("send refused by test sink");
        }
        self.messages
            .lock()
            .unwrap()
            .push((chat_id, text.to_string()));
        Ok(())
    }
}

/// Static chain-data fake with offset/limit slicing, so the pager sees
/// realistic page boundaries.
#[derive(Default)]
pub struct FakeChain {
    pub tip: Mutex<ChainTip>,
    pub txs: Mutex<Vec<TxRecord>>,
    pub rewards: Mutex<Vec<RewardRecord>>,
    pub accounts: Mutex<HashMap<String, AccountInfo>>,
    pub pools: Mutex<HashMap<String, PoolInfo>>,
    pub votes: Mutex<Vec<GovVote>>,
    pub proposals: Mutex<Vec<GovProposal>>,
    pub assets: Mutex<HashMap<String, Vec<AssetAmount>>>,
    pub decimals: Mutex<HashMap<(String, String), u8>>,
    pub fail_tx_queries: std::sync::atomic::AtomicBool,
}

fn slice<T: Clone>(items: Vec<T>, offset: usize, limit: usize) -> Vec<T> {
    items.into_iter().skip(offset).take(limit).collect()
}

impl FakeChain {
    pub fn with_tip(height: u64, epoch: u32) -> Self {
        let chain = Self::default();
        *chain.tip.lock().unwrap() = ChainTip {
            block_height: height,
            epoch,
        };
        chain
    }

    fn matching_txs(&self, addresses: &[String], after_height: u64) -> Vec<TxRecord> {
        let mut txs: Vec<TxRecord> = self
            .txs
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.block_height > after_height)
            .filter(|t| {
                t.inputs.iter().any(|io| addresses.contains(&io.address))
                    || t.outputs.iter().any(|io| addresses.contains(&io.address))
            })
            .cloned()
            .collect();
        txs.sort_by_key(|t| t.block_height);
        txs
    }
}

#[async_trait]
impl ChainApi for FakeChain {
    async fn tip(&self) -> Result<ChainTip, UpstreamError> {
        Ok(self.tip.lock().unwrap().clone())
    }

    async fn address_transactions(
        &self,
        addresses: &[String],
        after_height: u64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<TxRecord>, UpstreamError> {
        if self.fail_tx_queries.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(UpstreamError::Api {
                status: 503,
                message: "unavailable".to_string(),
            });
        }
        Ok(slice(self.matching_txs(addresses, after_height), offset, limit))
    }

    async fn account_transactions(
        &self,
        stake_addresses: &[String],
        after_height: u64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<TxRecord>, UpstreamError> {
        self.address_transactions(stake_addresses, after_height, offset, limit)
            .await
    }

    async fn account_rewards(
        &self,
        stake_addresses: &[String],
        after_epoch: u32,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<RewardRecord>, UpstreamError> {
        let rewards: Vec<RewardRecord> = self
            .rewards
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.epoch > after_epoch && stake_addresses.contains(&r.stake_address))
            .cloned()
            .collect();
        Ok(slice(rewards, offset, limit))
    }

    async fn account_info(
        &self,
        stake_addresses: &[String],
    ) -> Result<Vec<AccountInfo>, UpstreamError> {
        let accounts = self.accounts.lock().unwrap();
        Ok(stake_addresses
            .iter()
            .filter_map(|a| accounts.get(a).cloned())
            .collect())
    }

    async fn pool_info(&self, pool_id: &str) -> Result<Option<PoolInfo>, UpstreamError> {
        Ok(self.pools.lock().unwrap().get(pool_id).cloned())
    }

    async fn pools_not_registered(
        &self,
        pool_ids: &[String],
    ) -> Result<Vec<PoolInfo>, UpstreamError> {
        let pools = self.pools.lock().unwrap();
        Ok(pool_ids
            .iter()
            .filter_map(|id| pools.get(id).cloned())
            .filter(|p| p.status != PoolStatus::Registered)
            .collect())
    }

    async fn drep_votes(
        &self,
        drep_id: &str,
        after_time: i64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<GovVote>, UpstreamError> {
        let votes: Vec<GovVote> = self
            .votes
            .lock()
            .unwrap()
            .iter()
            .filter(|v| v.drep_id == drep_id && v.cast_at > after_time)
            .cloned()
            .collect();
        Ok(slice(votes, offset, limit))
    }

    async fn gov_proposals(
        &self,
        after_time: i64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<GovProposal>, UpstreamError> {
        let proposals: Vec<GovProposal> = self
            .proposals
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.submitted_at > after_time)
            .cloned()
            .collect();
        Ok(slice(proposals, offset, limit))
    }

    async fn address_assets(&self, address: &str) -> Result<Vec<AssetAmount>, UpstreamError> {
        Ok(self
            .assets
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .unwrap_or_default())
    }

    async fn account_assets(
        &self,
        stake_address: &str,
    ) -> Result<Vec<AssetAmount>, UpstreamError> {
        self.address_assets(stake_address).await
    }

    async fn asset_decimals(
        &self,
        policy_id: &str,
        asset_name: &str,
    ) -> Result<Option<u8>, UpstreamError> {
        Ok(self
            .decimals
            .lock()
            .unwrap()
            .get(&(policy_id.to_string(), asset_name.to_string()))
            .copied())
    }
}
