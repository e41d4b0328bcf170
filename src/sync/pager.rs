//! Generic offset/limit paginator for upstream collections.
//!
//! Walks pages until the upstream returns an empty one. A mid-walk failure
//! keeps the pages accumulated so far: a temporarily failing upstream must
//! not block fresh subscriptions in the same batch, and the schedule
//! retries the whole delta on the next cycle anyway. No in-pass retry.

use std::future::Future;

use tracing::warn;

use crate::chain::UpstreamError;

pub async fn fetch_paged<T, F, Fut>(limit: usize, mut fetch: F) -> Vec<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<Vec<T>, UpstreamError>>,
{
    let mut all = Vec::new();
    let mut offset = 0usize;

    loop {
        match fetch(offset).await {
            Ok(page) => {
                if page.is_empty() {
                    break;
                }
                offset += page.len();
                all.extend(page);
            }
            Err(e) => {
                warn!(
                    offset = offset,
                    limit = limit,
                    collected = all.len(),
                    error = %e,
                    "page walk aborted, keeping partial result"
                );
                break;
            }
        }
    }

    all
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_walks_until_empty_page() {
        let pages = vec![vec![1, 2, 3], vec![4, 5], vec![]];
        let collected = fetch_paged(3, |offset| {
            let page = match offset {
                0 => pages[0].clone(),
                3 => pages[1].clone(),
                _ => Vec::new(),
            };
            async move { Ok(page) }
        })
        .await;
        assert_eq!(collected, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_failure_mid_walk_keeps_partial_result() {
        let collected = fetch_paged(2, |offset| async move {
            match offset {
                0 => Ok(vec![10, 20]),
                _ => Err(UpstreamError::Api {
                    status: 503,
                    message: "unavailable".to_string(),
                }),
            }
        })
        .await;
        assert_eq!(collected, vec![10, 20]);
    }

    #[tokio::test]
    async fn test_empty_collection() {
        let collected: Vec<i32> = fetch_paged(5, |_| async { Ok(Vec::new()) }).await;
        assert!(collected.is_empty());
    }
}
