//! Upstream chain-data API: typed records and the HTTP client.
//!
//! Every list query supports `limit`/`offset` pagination, a greater-than
//! filter on its watermark field (block height, epoch, or timestamp) and
//! bulk address/pool-id set filters, so one round trip can serve a whole
//! subscriber batch.

pub mod client;
pub mod types;

pub use client::{ChainApi, ChainClient, UpstreamError};
pub use types::*;
