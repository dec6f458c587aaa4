use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Time-windowed set of event identifiers already forwarded to the intake.
///
/// Upstream sources redeliver the same events across polling windows and
/// across content blobs, so admission is checked per event. An identifier is
/// refused while its entry is younger than the retention window. Past the
/// window the same identifier is admitted again: duplicates are suppressed
/// at most once per window, not exactly once.
///
/// The cache is a cheap handle: clones share the same entries. It is passed
/// to the supervisor that admits events and to the sweeper task that evicts
/// stale entries.
#[derive(Clone, Debug)]
pub struct DedupCache {
    entries: Arc<Mutex<HashMap<String, Instant>>>,
    retention: Duration,
}

impl DedupCache {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: Default::default(),
            retention,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        // Entries stay consistent even if a holder panicked: every critical section
        // is a single map operation.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `event_id` and return true if it was not seen within the retention window.
    pub fn admit(&self, event_id: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.lock();

        match entries.get_mut(event_id) {
            Some(inserted_at) if now.duration_since(*inserted_at) < self.retention => false,
            Some(inserted_at) => {
                // Expired but not swept yet.
                *inserted_at = now;
                true
            }
            None => {
                entries.insert(event_id.to_owned(), now);
                true
            }
        }
    }

    /// Forget identifiers admitted by a cycle that failed to forward them.
    pub fn release<I, S>(&self, event_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut entries = self.lock();
        for event_id in event_ids {
            entries.remove(event_id.as_ref());
        }
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.lock().contains_key(event_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Evict every entry inserted `retention` ago or earlier. Returns the number of evicted entries.
    pub fn sweep(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();

        entries.retain(|_, inserted_at| now.duration_since(*inserted_at) < retention);

        let evicted = before - entries.len();
        metrics::gauge!("relay_dedup_cache_entries").set(entries.len() as f64);
        metrics::counter!("relay_dedup_evicted_total").increment(evicted as u64);
        evicted
    }

    /// Spawn a task sweeping the cache every `interval` until `shutdown` is cancelled.
    pub fn spawn_sweeper(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = cache.sweep(cache.retention);
                        debug!(evicted, remaining = cache.len(), "swept dedup cache");
                    }
                }
            }

            info!("dedup cache sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RETENTION: Duration = Duration::from_secs(6 * 60 * 60);

    #[tokio::test(start_paused = true)]
    async fn test_admit_twice_within_window() {
        let cache = DedupCache::new(RETENTION);

        assert!(cache.admit("1"));
        assert!(!cache.admit("1"));

        tokio::time::advance(Duration::from_secs(60 * 60)).await;
        assert!(!cache.admit("1"));
        assert!(cache.admit("2"));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admit_again_after_window() {
        let cache = DedupCache::new(Duration::from_secs(10));

        assert!(cache.admit("1"));
        tokio::time::advance(Duration::from_secs(11)).await;

        // Not swept yet, but expired entries do not block admission.
        assert!(cache.admit("1"));
        assert!(!cache.admit("1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_retention_boundary() {
        let cache = DedupCache::new(RETENTION);
        let retention = Duration::from_secs(100);

        cache.admit("old");
        tokio::time::advance(Duration::from_secs(150)).await;
        cache.admit("young");
        tokio::time::advance(Duration::from_secs(60)).await;

        assert_eq!(cache.sweep(retention), 1);
        assert!(!cache.contains("old"));
        assert!(cache.contains("young"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_allows_readmission() {
        let cache = DedupCache::new(RETENTION);

        assert!(cache.admit("1"));
        assert!(cache.admit("2"));
        cache.release(["1"]);

        assert!(cache.admit("1"));
        assert!(!cache.admit("2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_evicts_and_stops() {
        let cache = DedupCache::new(Duration::from_secs(30));
        let shutdown = CancellationToken::new();
        let sweeper = cache.spawn_sweeper(Duration::from_secs(10), shutdown.clone());

        cache.admit("1");
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert!(cache.is_empty());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), sweeper)
            .await
            .expect("sweeper did not stop")
            .expect("sweeper panicked");
    }
}
