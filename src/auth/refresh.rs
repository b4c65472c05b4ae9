use parking_lot::Mutex;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::manager::AccountManager;
use super::oauth::TokenResult;
use super::{HttpClient, now_ms};

/// Background refresh is pointless for tokens this close to expiry; the
/// synchronous path will beat it.
const MIN_LEAD_MS: u64 = 5_000;

/// Scheduler tick interval
const TICK_INTERVAL: Duration = Duration::from_secs(1);

type RefreshFuture = Pin<Box<dyn Future<Output = TokenResult> + Send>>;
type RefreshJobFn = Box<dyn FnOnce() -> RefreshFuture + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Already expired or expiring too soon for a background refresh
    Skipped,
    /// A refresh for this key is already pending
    Duplicate,
}

struct RefreshJob {
    key: String,
    run: RefreshJobFn,
}

/// Single-consumer proactive refresh queue. Refreshes execute strictly one
/// at a time, FIFO, so duplicate refresh requests never pile up on the
/// vendor's token endpoint.
pub struct RefreshQueue {
    tx: mpsc::UnboundedSender<RefreshJob>,
    pending: Arc<Mutex<HashSet<String>>>,
    cancel: CancellationToken,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RefreshQueue {
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<RefreshJob>();
        let pending = Arc::new(Mutex::new(HashSet::new()));
        let cancel = CancellationToken::new();

        let worker_pending = pending.clone();
        let worker_cancel = cancel.clone();
        let worker = tokio::spawn(async move {
            loop {
                let job = tokio::select! {
                    job = rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                    _ = worker_cancel.cancelled() => break,
                };

                tracing::debug!(key = %job.key, "running proactive token refresh");
                let result = (job.run)().await;
                if let TokenResult::Failed { reason } = &result {
                    tracing::debug!(key = %job.key, reason = %reason, "proactive refresh failed");
                }
                worker_pending.lock().remove(&job.key);

                if worker_cancel.is_cancelled() {
                    break;
                }
            }
        });

        Self {
            tx,
            pending,
            cancel,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue a refresh for a token expiring at `expires` (epoch ms).
    pub fn enqueue<F>(&self, key: &str, expires: u64, refresh: F) -> EnqueueOutcome
    where
        F: FnOnce() -> RefreshFuture + Send + 'static,
    {
        let now = now_ms();
        if expires <= now + MIN_LEAD_MS {
            return EnqueueOutcome::Skipped;
        }

        {
            let mut pending = self.pending.lock();
            if !pending.insert(key.to_string()) {
                return EnqueueOutcome::Duplicate;
            }
        }

        let job = RefreshJob {
            key: key.to_string(),
            run: Box::new(refresh),
        };
        if self.tx.send(job).is_err() {
            self.pending.lock().remove(key);
            return EnqueueOutcome::Skipped;
        }
        EnqueueOutcome::Queued
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Stop accepting work and let any in-flight refresh complete.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Default for RefreshQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodic scheduler walking the live pool and queueing refreshes for
/// accounts whose token expires within `buffer_ms`.
pub struct RefreshScheduler {
    cancel: CancellationToken,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RefreshScheduler {
    pub fn start(
        manager: Arc<AccountManager>,
        queue: Arc<RefreshQueue>,
        http_client: Arc<HttpClient>,
        buffer_ms: u64,
        skew_ms: u64,
    ) -> Self {
        let cancel = CancellationToken::new();
        let tick_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            // Tokens were just loaded; skip the immediate first tick
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = tick_cancel.cancelled() => break,
                }

                let now = now_ms();
                for account in manager.accounts_snapshot() {
                    if !account.record.is_enabled() {
                        continue;
                    }
                    let Some(expires) = account.expires else {
                        continue;
                    };
                    if account.access.is_none() || expires > now + buffer_ms {
                        continue;
                    }

                    let key = account.key();
                    let index = account.index;
                    let manager = manager.clone();
                    let http_client = http_client.clone();
                    let outcome = queue.enqueue(&key, expires, move || {
                        Box::pin(async move {
                            manager
                                .refresh_with_fallback(index, skew_ms, move |token| {
                                    let http_client = http_client.clone();
                                    async move {
                                        super::oauth::refresh_access_token(&http_client, &token)
                                            .await
                                    }
                                })
                                .await
                        })
                    });
                    if outcome == EnqueueOutcome::Queued {
                        tracing::debug!(
                            index = index,
                            pending = queue.pending_count(),
                            "queued proactive refresh"
                        );
                    }
                }
            }
        });

        Self {
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_enqueue_skips_expired_and_imminent_tokens() {
        let queue = RefreshQueue::new();

        let outcome = queue.enqueue("k", now_ms().saturating_sub(1_000), || {
            Box::pin(async {
                TokenResult::Failed {
                    reason: "should not run".into(),
                }
            })
        });
        assert_eq!(outcome, EnqueueOutcome::Skipped);

        // Inside the minimum lead window
        let outcome = queue.enqueue("k", now_ms() + 1_000, || {
            Box::pin(async {
                TokenResult::Failed {
                    reason: "should not run".into(),
                }
            })
        });
        assert_eq!(outcome, EnqueueOutcome::Skipped);
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_dedups_pending_keys() {
        let queue = RefreshQueue::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let expires = now_ms() + 3_600_000;
        for expected in [EnqueueOutcome::Queued, EnqueueOutcome::Duplicate] {
            let ran = ran.clone();
            let outcome = queue.enqueue("same-key", expires, move || {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    ran.fetch_add(1, Ordering::SeqCst);
                    TokenResult::Success {
                        access: "a".into(),
                        refresh: "r".into(),
                        id_token: None,
                        expires: 0,
                    }
                })
            });
            assert_eq!(outcome, expected);
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_refreshes_run_serially_fifo() {
        let queue = RefreshQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let expires = now_ms() + 3_600_000;

        for n in 0..3 {
            let order = order.clone();
            queue.enqueue(&format!("key-{n}"), expires, move || {
                Box::pin(async move {
                    order.lock().push(format!("start-{n}"));
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    order.lock().push(format!("end-{n}"));
                    TokenResult::Success {
                        access: "a".into(),
                        refresh: "r".into(),
                        id_token: None,
                        expires: 0,
                    }
                })
            });
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        let order = order.lock().clone();
        assert_eq!(
            order,
            vec!["start-0", "end-0", "start-1", "end-1", "start-2", "end-2"],
            "refreshes overlapped: {order:?}"
        );
    }

    #[tokio::test]
    async fn test_stop_lets_in_flight_refresh_complete() {
        let queue = Arc::new(RefreshQueue::new());
        let finished = Arc::new(AtomicUsize::new(0));

        {
            let finished = finished.clone();
            queue.enqueue("k", now_ms() + 3_600_000, move || {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(80)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    TokenResult::Success {
                        access: "a".into(),
                        refresh: "r".into(),
                        id_token: None,
                        expires: 0,
                    }
                })
            });
        }

        // Give the worker time to pick the job up, then stop
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.stop().await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}
