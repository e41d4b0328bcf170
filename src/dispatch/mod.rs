//! Bounded dispatch of commands and outbound notifications.
//!
//! A fixed pool of permits caps concurrent units; excess submissions queue
//! on the semaphore. Every unit gets a soft deadline at submission time:
//! when the result is not in by then the supervisor counts a timeout (and
//! can tell the user), but the unit keeps running: cancellation is
//! cooperative only, so a timed-out unit still completes its side effects.
//! Exactly one of success / application-error / timeout is tallied per unit.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, error, info, warn};

use crate::telegram::MessageSink;

const TIMEOUT_NOTICE: &str = "⏱ That took too long. Still working on it in the background.";

/// Process-wide outcome counters.
#[derive(Default)]
pub struct DispatchStats {
    success: AtomicU64,
    app_error: AtomicU64,
    timeout: AtomicU64,
}

impl DispatchStats {
    pub fn success(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
    }

    pub fn app_error(&self) -> u64 {
        self.app_error.load(Ordering::Relaxed)
    }

    pub fn timeout(&self) -> u64 {
        self.timeout.load(Ordering::Relaxed)
    }

    /// Log a counter summary (called periodically).
    pub fn log_summary(&self) {
        info!(
            success = self.success(),
            app_error = self.app_error(),
            timeout = self.timeout(),
            "dispatch counters"
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Done,
    Failed,
    TimedOut,
}

#[derive(Clone)]
pub struct Dispatcher {
    semaphore: Arc<Semaphore>,
    stats: Arc<DispatchStats>,
    sink: Arc<dyn MessageSink>,
}

impl Dispatcher {
    pub fn new(pool_size: usize, sink: Arc<dyn MessageSink>) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(pool_size.max(1))),
            stats: Arc::new(DispatchStats::default()),
            sink,
        }
    }

    pub fn stats(&self) -> Arc<DispatchStats> {
        self.stats.clone()
    }

    /// Run one unit through the pool and wait for its result up to `timeout`.
    ///
    /// On timeout the unit is left running (its eventual result is logged
    /// and discarded) and `TimedOut` is returned immediately.
    pub async fn execute<F>(&self, label: &str, timeout: Duration, unit: F) -> DispatchOutcome
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel::<bool>();
        // Whichever side claims this first owns the unit's counted outcome.
        let reported = Arc::new(AtomicBool::new(false));

        let semaphore = self.semaphore.clone();
        let stats = self.stats.clone();
        let worker_reported = reported.clone();
        let worker_label = label.to_string();
        tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };
            let result = unit.await;
            let claimed = worker_reported
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok();
            match &result {
                Ok(()) => {
                    if claimed {
                        stats.success.fetch_add(1, Ordering::Relaxed);
                    } else {
                        debug!(unit = %worker_label, "unit completed after its timeout was reported");
                    }
                }
                Err(e) => {
                    error!(unit = %worker_label, error = %e, "unit failed");
                    if claimed {
                        stats.app_error.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            let _ = done_tx.send(result.is_ok());
        });

        match tokio::time::timeout(timeout, done_rx).await {
            Ok(Ok(true)) => DispatchOutcome::Done,
            Ok(Ok(false)) => DispatchOutcome::Failed,
            Ok(Err(_)) => {
                // Worker died without reporting (e.g. a panic in the unit).
                if reported
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    self.stats.app_error.fetch_add(1, Ordering::Relaxed);
                }
                error!(unit = %label, "unit vanished without reporting a result");
                DispatchOutcome::Failed
            }
            Err(_) => {
                if reported
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    self.stats.timeout.fetch_add(1, Ordering::Relaxed);
                }
                warn!(
                    unit = %label,
                    timeout_ms = timeout.as_millis() as u64,
                    "unit missed its soft deadline, leaving it to finish"
                );
                DispatchOutcome::TimedOut
            }
        }
    }

    /// Send one outbound notification through the pool.
    pub async fn send_notification(
        &self,
        label: &str,
        timeout: Duration,
        chat_id: i64,
        text: String,
    ) -> DispatchOutcome {
        let sink = self.sink.clone();
        self.execute(label, timeout, async move {
            sink.send_message(chat_id, &text).await
        })
        .await
    }

    /// Fire-and-forget submission. The supervisor runs detached so the
    /// ingestion path never blocks; on timeout the chat gets a notice.
    pub fn submit<F>(&self, label: &str, timeout: Duration, notify_chat: Option<i64>, unit: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let this = self.clone();
        let label = label.to_string();
        tokio::spawn(async move {
            let outcome = this.execute(&label, timeout, unit).await;
            if outcome == DispatchOutcome::TimedOut {
                if let Some(chat) = notify_chat {
                    if let Err(e) = this.sink.send_message(chat, TIMEOUT_NOTICE).await {
                        warn!(chat = chat, error = %e, "failed to deliver timeout notice");
                    }
                }
            }
        });
    }
}

/// Periodically log the dispatch counters.
pub fn spawn_stats_logger(stats: Arc<DispatchStats>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // skip the immediate first tick
        loop {
            ticker.tick().await;
            stats.log_summary();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::RecordingSink;

    #[tokio::test]
    async fn test_timeout_isolation() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = Dispatcher::new(4, sink.clone());

        let slow_finished = Arc::new(AtomicBool::new(false));
        let flag = slow_finished.clone();
        dispatcher.submit(
            "slow",
            Duration::from_millis(50),
            Some(1),
            async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            },
        );

        let fast = dispatcher
            .execute("fast", Duration::from_secs(5), async { Ok(()) })
            .await;
        assert_eq!(fast, DispatchOutcome::Done);

        // Let the slow unit run past its deadline and complete.
        tokio::time::sleep(Duration::from_millis(500)).await;

        let stats = dispatcher.stats();
        assert_eq!(stats.timeout(), 1);
        assert_eq!(stats.success(), 1, "timed-out unit's late success is discarded");
        assert!(slow_finished.load(Ordering::SeqCst), "unit was not interrupted");

        let notices = sink.messages();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].0, 1);
        assert!(notices[0].1.contains("too long"));
    }

    #[tokio::test]
    async fn test_failed_unit_counts_application_error() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = Dispatcher::new(2, sink);

        let outcome = dispatcher
            .execute("broken", Duration::from_secs(1), async {
                anyhow::bail!("boom")
            })
            .await;
        assert_eq!(outcome, DispatchOutcome::Failed);
        assert_eq!(dispatcher.stats().app_error(), 1);
        assert_eq!(dispatcher.stats().success(), 0);
    }

    #[tokio::test]
    async fn test_excess_units_queue_behind_the_pool() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = Dispatcher::new(1, sink);

        let (a, b) = tokio::join!(
            dispatcher.execute("one", Duration::from_secs(5), async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(())
            }),
            dispatcher.execute("two", Duration::from_secs(5), async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(())
            }),
        );
        assert_eq!(a, DispatchOutcome::Done);
        assert_eq!(b, DispatchOutcome::Done);
        assert_eq!(dispatcher.stats().success(), 2);
    }
}
