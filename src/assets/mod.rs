//! Asset decimals cache and quantity formatting.
//!
//! Registry decimals are memoized write-once per (policy_id, asset_name).
//! `-1` is the sentinel for "no registry metadata found": the asset exists
//! but nobody registered display decimals, so quantities render as raw
//! integers. An upstream failure is NOT memoized; the next pass retries.

use dashmap::DashMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::warn;

use crate::chain::ChainApi;

/// Sentinel for assets with no registry metadata.
pub const NO_DECIMALS: i32 = -1;

#[derive(Default)]
pub struct DecimalsCache {
    inner: DashMap<(String, String), i32>,
}

impl DecimalsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve display decimals for an asset, consulting the token registry
    /// at most once per asset for the lifetime of the cache.
    pub async fn decimals(&self, chain: &dyn ChainApi, policy_id: &str, asset_name: &str) -> i32 {
        let key = (policy_id.to_string(), asset_name.to_string());
        if let Some(entry) = self.inner.get(&key) {
            return *entry;
        }

        match chain.asset_decimals(policy_id, asset_name).await {
            Ok(found) => {
                let decimals = found.map_or(NO_DECIMALS, i32::from);
                self.inner.entry(key).or_insert(decimals);
                decimals
            }
            Err(e) => {
                warn!(
                    policy = policy_id,
                    asset = asset_name,
                    error = %e,
                    "registry lookup failed, rendering raw quantity"
                );
                NO_DECIMALS
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Format an asset quantity for display.
///
/// Unknown decimals (sentinel −1) show the raw integer. Known decimals
/// scale by 10^decimals, group the integer part, and keep two fraction
/// digits when the scaled value is fractional.
pub fn format_quantity(quantity: u64, decimals: i32) -> String {
    if decimals < 0 {
        return quantity.to_string();
    }

    // 10^19 overflows u64; no registered asset carries more than 18 decimals.
    let scaled = Decimal::from(quantity) / Decimal::from(10u64.pow(decimals.min(18) as u32));
    if scaled.fract().is_zero() {
        group_thousands(&scaled.trunc().to_string())
    } else {
        let cents = (scaled * Decimal::from(100)).round();
        let whole = (cents / Decimal::from(100)).trunc();
        let fract = (cents % Decimal::from(100)).abs().to_u32().unwrap_or(0);
        format!("{}.{:02}", group_thousands(&whole.to_string()), fract)
    }
}

/// Convert a lovelace amount to display units (1,000,000 lovelace per unit).
pub fn format_lovelace(amount: u64) -> String {
    let scaled = (Decimal::from(amount) / Decimal::from(1_000_000u64)).normalize();
    let text = scaled.to_string();
    match text.split_once('.') {
        Some((whole, fract)) => format!("{}.{}", group_thousands(whole), fract),
        None => group_thousands(&text),
    }
}

/// Signed variant for net transaction values.
pub fn format_lovelace_signed(amount: i128) -> String {
    let magnitude = format_lovelace(amount.unsigned_abs() as u64);
    if amount < 0 {
        format!("-{}", magnitude)
    } else {
        magnitude
    }
}

/// Human-readable asset name: the hex-encoded on-chain name decoded as
/// UTF-8 when printable, otherwise a shortened policy-qualified form.
pub fn asset_display_name(policy_id: &str, asset_name_hex: &str) -> String {
    if let Some(bytes) = decode_hex(asset_name_hex) {
        if let Ok(name) = String::from_utf8(bytes) {
            if !name.is_empty() && name.chars().all(|c| !c.is_control()) {
                return name;
            }
        }
    }
    let policy_short = &policy_id[..policy_id.len().min(8)];
    if asset_name_hex.is_empty() {
        policy_short.to_string()
    } else {
        format!("{}.{}", policy_short, asset_name_hex)
    }
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

fn group_thousands(digits: &str) -> String {
    let (sign, digits) = match digits.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", digits),
    };
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    format!("{}{}", sign, grouped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_quantity_when_no_registry_metadata() {
        assert_eq!(format_quantity(1234567, NO_DECIMALS), "1234567");
    }

    #[test]
    fn test_scaled_quantity_with_grouping() {
        // 6 decimals: 1,234,567,890 units → 1,234.56789 → "1,234.57"
        assert_eq!(format_quantity(1_234_567_890, 6), "1,234.57");
        // Whole value keeps no fraction digits
        assert_eq!(format_quantity(5_000_000, 6), "5");
        assert_eq!(format_quantity(12_000_000_000, 6), "12,000");
    }

    #[test]
    fn test_asset_display_name() {
        // "HOSKY" in hex
        assert_eq!(asset_display_name("policyabc123", "484f534b59"), "HOSKY");
        // Non-UTF8 name falls back to policy-qualified hex
        assert_eq!(asset_display_name("policyabc123", "ff00"), "policyab.ff00");
    }

    #[test]
    fn test_lovelace_display() {
        assert_eq!(format_lovelace(1_500_000), "1.5");
        assert_eq!(format_lovelace(2_000_000_000), "2,000");
        assert_eq!(format_lovelace_signed(-1_500_000), "-1.5");
    }
}
