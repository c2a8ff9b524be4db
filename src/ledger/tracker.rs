use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{AppResult, SubmissionError};
use crate::network::NetworkClient;
use crate::shutdown::{deadline, ShutdownSignal};

/// A ledger number plus whether it may be behind the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerReading {
    pub ledger: u32,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackerStatus {
    pub latest_ledger: Option<u32>,
    pub stale: bool,
    pub refreshed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
struct Snapshot {
    ledger: u32,
    fetched: Instant,
    refreshed_at: DateTime<Utc>,
    /// Set when the most recent refresh failed.
    failed: bool,
    last_error: Option<String>,
}

/// Cached view of the network's latest ledger.
///
/// Owned and injected; every component that needs the current ledger holds
/// an `Arc` to the same tracker.
pub struct LedgerTracker {
    network: Arc<dyn NetworkClient>,
    snapshot: RwLock<Option<Snapshot>>,
    first_refresh: Mutex<()>,
    attempted: AtomicBool,
    ttl: Duration,
    refresh_interval: Duration,
    timeout: Duration,
}

impl LedgerTracker {
    pub fn new(network: Arc<dyn NetworkClient>, ttl: Duration, refresh_interval: Duration, timeout: Duration) -> Self {
        Self {
            network,
            snapshot: RwLock::new(None),
            first_refresh: Mutex::new(()),
            attempted: AtomicBool::new(false),
            ttl,
            refresh_interval,
            timeout,
        }
    }

    /// Queries the network once. On failure the previous value is kept and
    /// flagged stale.
    pub async fn refresh(&self) -> AppResult<u32> {
        let shutdown = ShutdownSignal::never();
        let result = deadline(&shutdown, self.timeout, self.network.latest_ledger()).await;
        self.attempted.store(true, Ordering::SeqCst);

        let mut snapshot = self.snapshot.write().await;
        match result {
            Ok(ledger) => {
                *snapshot = Some(Snapshot {
                    ledger,
                    fetched: Instant::now(),
                    refreshed_at: Utc::now(),
                    failed: false,
                    last_error: None,
                });
                debug!(ledger, "ledger refreshed");
                Ok(ledger)
            }
            Err(e) => {
                if let Some(previous) = snapshot.as_mut() {
                    previous.failed = true;
                    previous.last_error = Some(e.to_string());
                    warn!(ledger = previous.ledger, error = %e, "⚠️ ledger refresh failed, serving last known value");
                } else {
                    error!(error = %e, "ledger refresh failed and no ledger is known yet");
                }
                Err(e)
            }
        }
    }

    fn reading(&self, snapshot: &Snapshot) -> LedgerReading {
        LedgerReading {
            ledger: snapshot.ledger,
            stale: snapshot.failed || snapshot.fetched.elapsed() > self.ttl,
        }
    }

    /// Blocks for the first refresh only. Later calls read the cache.
    ///
    /// Fails with `LedgerUnavailable` when no refresh has ever succeeded.
    pub async fn current_ledger(&self) -> AppResult<LedgerReading> {
        if let Some(snapshot) = self.snapshot.read().await.as_ref() {
            return Ok(self.reading(snapshot));
        }

        let _guard = self.first_refresh.lock().await;
        if let Some(snapshot) = self.snapshot.read().await.as_ref() {
            return Ok(self.reading(snapshot));
        }
        if self.attempted.load(Ordering::SeqCst) {
            return Err(SubmissionError::LedgerUnavailable.into());
        }

        self.refresh()
            .await
            .map(|ledger| LedgerReading { ledger, stale: false })
            .map_err(|_| SubmissionError::LedgerUnavailable.into())
    }

    pub async fn status(&self) -> TrackerStatus {
        match self.snapshot.read().await.as_ref() {
            Some(snapshot) => TrackerStatus {
                latest_ledger: Some(snapshot.ledger),
                stale: self.reading(snapshot).stale,
                refreshed_at: Some(snapshot.refreshed_at),
                last_error: snapshot.last_error.clone(),
            },
            None => TrackerStatus {
                latest_ledger: None,
                stale: true,
                refreshed_at: None,
                last_error: None,
            },
        }
    }

    /// Background refresh, ahead of the TTL.
    pub fn start(self: Arc<Self>, shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_ms = self.refresh_interval.as_millis() as u64, "📒 ledger tracker started");
            loop {
                if !shutdown.sleep(self.refresh_interval).await {
                    break;
                }
                // failures are already logged and flagged
                let _ = self.refresh().await;
            }
            info!("ledger tracker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::network::mock::MockNetwork;

    fn tracker(network: Arc<MockNetwork>, ttl_ms: u64) -> LedgerTracker {
        LedgerTracker::new(
            network,
            Duration::from_millis(ttl_ms),
            Duration::from_millis(10),
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn test_first_call_refreshes_then_reads_cache() {
        let network = Arc::new(MockNetwork::at_ledger(12_345));
        let tracker = tracker(network.clone(), 5_000);

        assert_eq!(
            tracker.current_ledger().await.unwrap(),
            LedgerReading { ledger: 12_345, stale: false }
        );
        tracker.current_ledger().await.unwrap();
        assert_eq!(network.ledger_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_serves_stale_value() {
        let network = Arc::new(MockNetwork::at_ledger(100));
        let tracker = tracker(network.clone(), 5_000);
        tracker.refresh().await.unwrap();

        network.set_ledger(None);
        assert!(tracker.refresh().await.is_err());

        let reading = tracker.current_ledger().await.unwrap();
        assert_eq!(reading, LedgerReading { ledger: 100, stale: true });
        let status = tracker.status().await;
        assert!(status.stale);
        assert!(status.last_error.is_some());

        network.set_ledger(Some(101));
        tracker.refresh().await.unwrap();
        assert_eq!(tracker.current_ledger().await.unwrap(), LedgerReading { ledger: 101, stale: false });
    }

    #[tokio::test]
    async fn test_expired_ttl_is_stale() {
        let network = Arc::new(MockNetwork::at_ledger(100));
        let tracker = tracker(network, 10);
        tracker.refresh().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(tracker.current_ledger().await.unwrap().stale);
    }

    #[tokio::test]
    async fn test_never_refreshed_is_unavailable() {
        let network = Arc::new(MockNetwork::default());
        let tracker = tracker(network.clone(), 5_000);

        for _ in 0..2 {
            assert!(matches!(
                tracker.current_ledger().await,
                Err(AppError::Submission(SubmissionError::LedgerUnavailable))
            ));
        }
        // only the first call blocks on the network
        assert_eq!(network.ledger_calls(), 1);
        assert_eq!(tracker.status().await.latest_ledger, None);
    }

    #[tokio::test]
    async fn test_background_refresh_stops_on_shutdown() {
        let network = Arc::new(MockNetwork::at_ledger(7));
        let tracker = Arc::new(tracker(network.clone(), 5_000));
        let (trigger, shutdown) = crate::shutdown::channel();

        let handle = tracker.clone().start(shutdown);
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.trigger();
        handle.await.unwrap();

        assert!(network.ledger_calls() >= 2);
        assert_eq!(tracker.status().await.latest_ledger, Some(7));
    }
}
