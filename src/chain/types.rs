//! Wire types for the chain-data API.
//!
//! Input/output addresses come back in the same form the query was made
//! with: account queries attribute IO entries to stake addresses, address
//! queries to base addresses. Downstream classification relies on that.

use serde::Deserialize;

/// One transaction touching at least one queried address.
#[derive(Debug, Clone, Deserialize)]
pub struct TxRecord {
    pub tx_hash: String,
    pub block_height: u64,
    #[serde(default)]
    pub block_time: i64,
    /// Fee in lovelace.
    #[serde(default)]
    pub fee: u64,
    #[serde(default)]
    pub inputs: Vec<TxIo>,
    #[serde(default)]
    pub outputs: Vec<TxIo>,
    /// Stake delegation certificate included in the transaction, if any.
    #[serde(default)]
    pub delegation: Option<DelegationCert>,
}

/// A single input or output of a transaction.
#[derive(Debug, Clone, Deserialize)]
pub struct TxIo {
    pub address: String,
    /// Value in lovelace.
    pub value: u64,
    #[serde(default)]
    pub assets: Vec<AssetAmount>,
}

/// A native-asset quantity attached to an output or held by an account.
#[derive(Debug, Clone, Deserialize)]
pub struct AssetAmount {
    pub policy_id: String,
    #[serde(default)]
    pub asset_name: String,
    pub quantity: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DelegationCert {
    pub pool_id: String,
}

/// A staking reward paid to a stake address for one epoch.
#[derive(Debug, Clone, Deserialize)]
pub struct RewardRecord {
    pub stake_address: String,
    pub epoch: u32,
    /// Amount in lovelace.
    pub amount: u64,
    #[serde(default)]
    pub pool_id: Option<String>,
    #[serde(default)]
    pub reward_type: String,
}

/// Account-level view of a stake address.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountInfo {
    pub stake_address: String,
    #[serde(default)]
    pub delegated_pool: Option<String>,
    #[serde(default)]
    pub delegated_drep: Option<String>,
    /// Total balance in lovelace.
    #[serde(default)]
    pub total_balance: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolStatus {
    Registered,
    Retiring,
    Retired,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolInfo {
    pub pool_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub ticker: Option<String>,
    pub status: PoolStatus,
    /// Epoch at which a retiring pool leaves the registry.
    #[serde(default)]
    pub retiring_epoch: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteChoice {
    Yes,
    No,
    Abstain,
}

impl std::fmt::Display for VoteChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VoteChoice::Yes => write!(f, "Yes"),
            VoteChoice::No => write!(f, "No"),
            VoteChoice::Abstain => write!(f, "Abstain"),
        }
    }
}

/// A governance vote cast by a delegated representative.
#[derive(Debug, Clone, Deserialize)]
pub struct GovVote {
    pub drep_id: String,
    pub proposal_id: String,
    #[serde(default)]
    pub proposal_title: Option<String>,
    pub vote: VoteChoice,
    /// Unix timestamp at which the vote was cast.
    pub cast_at: i64,
    #[serde(default)]
    pub tx_hash: String,
}

/// A governance action submitted on chain.
#[derive(Debug, Clone, Deserialize)]
pub struct GovProposal {
    pub proposal_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub proposal_type: String,
    /// Unix timestamp of submission.
    pub submitted_at: i64,
    #[serde(default)]
    pub expires_epoch: Option<u32>,
}

/// Token-registry metadata for one asset (subset we need).
#[derive(Debug, Clone, Deserialize)]
pub struct AssetMetadata {
    #[serde(default)]
    pub decimals: Option<u8>,
}

/// Current chain tip.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChainTip {
    pub block_height: u64,
    pub epoch: u32,
}
