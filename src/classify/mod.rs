//! Activity classification.
//!
//! Partitions every transaction against a subscription's watched address
//! set into exactly one of Internal / Received / Sent and computes the net
//! value crossing the monitored footprint. Net value is zero for Internal,
//! non-negative for Received, non-positive for Sent.

use std::collections::HashSet;

use crate::chain::{AssetAmount, TxRecord};

/// What a notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Received,
    Sent,
    Internal,
    Reward,
    VoteCast,
    PoolRetiring,
    PoolRetired,
    NewProposal,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::Received => write!(f, "received"),
            Category::Sent => write!(f, "sent"),
            Category::Internal => write!(f, "internal"),
            Category::Reward => write!(f, "reward"),
            Category::VoteCast => write!(f, "vote_cast"),
            Category::PoolRetiring => write!(f, "pool_retiring"),
            Category::PoolRetired => write!(f, "pool_retired"),
            Category::NewProposal => write!(f, "new_proposal"),
        }
    }
}

/// Classification result for one transaction.
#[derive(Debug, Clone)]
pub struct TxActivity {
    pub category: Category,
    /// Net lovelace crossing the watched footprint, sign per category.
    pub net_value: i128,
    /// Delegation certificate target, surfaced for Internal transactions.
    pub delegation: Option<String>,
    /// Assets attached to the outputs relevant for this category.
    pub assets: Vec<AssetAmount>,
}

/// Whether the transaction touches the watched set at all.
pub fn touches(watched: &HashSet<String>, tx: &TxRecord) -> bool {
    tx.inputs.iter().any(|io| watched.contains(&io.address))
        || tx.outputs.iter().any(|io| watched.contains(&io.address))
}

/// Classify one transaction against the watched address set.
pub fn classify_tx(watched: &HashSet<String>, tx: &TxRecord) -> TxActivity {
    let inputs_all_watched = tx.inputs.iter().all(|io| watched.contains(&io.address));
    let outputs_all_watched = tx.outputs.iter().all(|io| watched.contains(&io.address));
    let any_input_watched = tx.inputs.iter().any(|io| watched.contains(&io.address));

    let inputs_from_watched: i128 = tx
        .inputs
        .iter()
        .filter(|io| watched.contains(&io.address))
        .map(|io| i128::from(io.value))
        .sum();
    let outputs_to_watched: i128 = tx
        .outputs
        .iter()
        .filter(|io| watched.contains(&io.address))
        .map(|io| i128::from(io.value))
        .sum();

    if inputs_all_watched && outputs_all_watched {
        return TxActivity {
            category: Category::Internal,
            net_value: 0,
            delegation: tx.delegation.as_ref().map(|d| d.pool_id.clone()),
            assets: Vec::new(),
        };
    }

    if !any_input_watched {
        let assets = tx
            .outputs
            .iter()
            .filter(|io| watched.contains(&io.address))
            .flat_map(|io| io.assets.iter().cloned())
            .collect();
        return TxActivity {
            category: Category::Received,
            net_value: outputs_to_watched,
            delegation: None,
            assets,
        };
    }

    // Part of the inputs is ours and something leaves the footprint: report
    // the portion that actually left as a negative quantity.
    let assets = tx
        .outputs
        .iter()
        .filter(|io| !watched.contains(&io.address))
        .flat_map(|io| io.assets.iter().cloned())
        .collect();
    TxActivity {
        category: Category::Sent,
        net_value: -(inputs_from_watched - outputs_to_watched),
        delegation: None,
        assets,
    }
}

/// Fallback display form for an unresolvable pool id: `pool1...<last 8>`.
pub fn shorten_pool_id(pool_id: &str) -> String {
    if pool_id.len() <= 8 {
        return pool_id.to_string();
    }
    format!("pool1...{}", &pool_id[pool_id.len() - 8..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{DelegationCert, TxIo};

    fn io(address: &str, value: u64) -> TxIo {
        TxIo {
            address: address.to_string(),
            value,
            assets: Vec::new(),
        }
    }

    fn tx(inputs: Vec<TxIo>, outputs: Vec<TxIo>) -> TxRecord {
        TxRecord {
            tx_hash: "deadbeef".to_string(),
            block_height: 100,
            block_time: 0,
            fee: 170_000,
            inputs,
            outputs,
            delegation: None,
        }
    }

    fn watched(addrs: &[&str]) -> HashSet<String> {
        addrs.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn test_received_when_no_watched_inputs() {
        let w = watched(&["addr1me"]);
        let t = tx(
            vec![io("addr1other", 5_000_000)],
            vec![io("addr1me", 3_000_000), io("addr1other", 1_830_000)],
        );
        let a = classify_tx(&w, &t);
        assert_eq!(a.category, Category::Received);
        assert_eq!(a.net_value, 3_000_000);
    }

    #[test]
    fn test_sent_reports_portion_that_left_as_negative() {
        let w = watched(&["addr1me"]);
        // 10 in from us, 6 change back, 3.83 to someone else + fee
        let t = tx(
            vec![io("addr1me", 10_000_000)],
            vec![io("addr1me", 6_000_000), io("addr1them", 3_830_000)],
        );
        let a = classify_tx(&w, &t);
        assert_eq!(a.category, Category::Sent);
        assert_eq!(a.net_value, -4_000_000);
    }

    #[test]
    fn test_internal_when_everything_stays_inside() {
        let w = watched(&["addr1me", "addr1mine2"]);
        let t = tx(
            vec![io("addr1me", 10_000_000)],
            vec![io("addr1mine2", 9_830_000)],
        );
        let a = classify_tx(&w, &t);
        assert_eq!(a.category, Category::Internal);
        assert_eq!(a.net_value, 0);
    }

    #[test]
    fn test_internal_surfaces_delegation_target() {
        let w = watched(&["addr1me"]);
        let mut t = tx(vec![io("addr1me", 3_000_000)], vec![io("addr1me", 2_830_000)]);
        t.delegation = Some(DelegationCert {
            pool_id: "pool1qzlw7z5mutmd39ldyjnp8n650weqe55z5p8dl3fagac3ge0nx8l".to_string(),
        });
        let a = classify_tx(&w, &t);
        assert_eq!(a.category, Category::Internal);
        assert_eq!(
            a.delegation.as_deref(),
            Some("pool1qzlw7z5mutmd39ldyjnp8n650weqe55z5p8dl3fagac3ge0nx8l")
        );
    }

    #[test]
    fn test_partition_is_exhaustive_and_signs_match() {
        let w = watched(&["addr1me"]);
        let cases = vec![
            tx(vec![io("addr1x", 5)], vec![io("addr1me", 5)]),
            tx(vec![io("addr1me", 5)], vec![io("addr1y", 4)]),
            tx(vec![io("addr1me", 5)], vec![io("addr1me", 4)]),
            tx(
                vec![io("addr1me", 5), io("addr1x", 5)],
                vec![io("addr1y", 9)],
            ),
        ];
        for t in &cases {
            let a = classify_tx(&w, t);
            match a.category {
                Category::Received => assert!(a.net_value >= 0),
                Category::Sent => assert!(a.net_value <= 0),
                Category::Internal => assert_eq!(a.net_value, 0),
                other => panic!("transaction classified as {}", other),
            }
        }
    }

    #[test]
    fn test_pool_id_fallback() {
        assert_eq!(
            shorten_pool_id("pool1qzlw7z5mutmd39ldyjnp8n650weqe55z5p8dl3fagac3ge0nx8l"),
            "pool1...3ge0nx8l"
        );
        assert_eq!(shorten_pool_id("pool1"), "pool1");
    }
}
