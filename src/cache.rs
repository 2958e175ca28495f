use crate::collectors::fleet::Collect;
use crate::metrics::Metrics;
use crate::state::{SharedSnapshot, Snapshot};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::debug;

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn unix_millis(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

struct CacheEntry {
    snapshot: SharedSnapshot,
    stored_at: Instant,
}

pub struct SnapshotCache {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entry: Option<CacheEntry>,
}

impl SnapshotCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            entry: None,
        }
    }

    /// Fresh entry only; stale entries read as a miss.
    pub fn get(&self) -> Option<SharedSnapshot> {
        match (&self.entry, self.age()) {
            (Some(entry), Some(age)) if age < self.ttl => Some(entry.snapshot.clone()),
            _ => None,
        }
    }

    /// Returns false when a refresh that started later is already stored.
    pub fn set(&mut self, snapshot: SharedSnapshot, stored_at: Instant) -> bool {
        if matches!(&self.entry, Some(current) if current.stored_at > stored_at) {
            return false;
        }
        self.entry = Some(CacheEntry {
            snapshot,
            stored_at,
        });
        true
    }

    pub fn age(&self) -> Option<Duration> {
        self.entry
            .as_ref()
            .map(|e| self.clock.now().saturating_duration_since(e.stored_at))
    }
}

pub struct CachedCollector {
    cache: Mutex<SnapshotCache>,
    source: Arc<dyn Collect>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    dedup_refresh: bool,
}

impl CachedCollector {
    pub fn new(
        source: Arc<dyn Collect>,
        ttl: Duration,
        dedup_refresh: bool,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            cache: Mutex::new(SnapshotCache::new(ttl, clock.clone())),
            source,
            clock,
            metrics,
            dedup_refresh,
        }
    }

    pub async fn get_servers_metrics(&self) -> SharedSnapshot {
        let mut cache = self.cache.lock().await;
        if let Some(snapshot) = cache.get() {
            debug!(age = ?cache.age(), "snapshot served from cache");
            self.metrics.inc_cache_hit();
            return snapshot;
        }

        if self.dedup_refresh {
            let (snapshot, started) = self.refresh().await;
            cache.set(snapshot.clone(), started);
            return snapshot;
        }

        drop(cache);
        let (snapshot, started) = self.refresh().await;
        if !self.cache.lock().await.set(snapshot.clone(), started) {
            debug!("newer snapshot already cached, keeping it");
        }
        snapshot
    }

    async fn refresh(&self) -> (SharedSnapshot, Instant) {
        let started = self.clock.now();
        let servers = self.source.collect().await;
        let snapshot = Arc::new(Snapshot {
            servers,
            timestamp: self.clock.unix_millis(),
        });
        (snapshot, started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_host;
    use crate::state::ServerMetrics;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ManualClock {
        base: Instant,
        offset: std::sync::Mutex<Duration>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self {
                base: Instant::now(),
                offset: std::sync::Mutex::new(Duration::ZERO),
            }
        }

        fn advance(&self, by: Duration) {
            *self.offset.lock().unwrap() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.base + *self.offset.lock().unwrap()
        }

        fn unix_millis(&self) -> i64 {
            1_700_000_000_000 + self.offset.lock().unwrap().as_millis() as i64
        }
    }

    struct CountingSource {
        runs: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl Collect for CountingSource {
        async fn collect(&self) -> Vec<ServerMetrics> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            vec![
                ServerMetrics::offline(&test_host("aiko", "10.0.0.1")),
                ServerMetrics::offline(&test_host("proxy", "10.0.0.2")),
            ]
        }
    }

    fn setup(
        dedup_refresh: bool,
        delay: Duration,
    ) -> (Arc<CachedCollector>, Arc<CountingSource>, Arc<ManualClock>) {
        let source = Arc::new(CountingSource {
            runs: AtomicUsize::new(0),
            delay,
        });
        let clock = Arc::new(ManualClock::new());
        let cached = CachedCollector::new(
            source.clone(),
            Duration::from_secs(15),
            dedup_refresh,
            clock.clone(),
            Metrics::new().expect("инициализация метрик"),
        );
        (Arc::new(cached), source, clock)
    }

    #[test]
    fn empty_cache_has_no_age() {
        let cache = SnapshotCache::new(Duration::from_secs(15), Arc::new(ManualClock::new()));
        assert!(cache.get().is_none());
        assert!(cache.age().is_none());
    }

    #[test]
    fn entry_expires_at_ttl() {
        let clock = Arc::new(ManualClock::new());
        let mut cache = SnapshotCache::new(Duration::from_secs(15), clock.clone());
        let snapshot = Arc::new(Snapshot {
            servers: vec![],
            timestamp: 1,
        });
        cache.set(snapshot, clock.now());

        clock.advance(Duration::from_millis(14_999));
        assert!(cache.get().is_some());
        clock.advance(Duration::from_millis(1));
        assert!(cache.get().is_none());
        assert_eq!(cache.age(), Some(Duration::from_secs(15)));
    }

    #[test]
    fn older_refresh_does_not_replace_newer_entry() {
        let clock = Arc::new(ManualClock::new());
        let mut cache = SnapshotCache::new(Duration::from_secs(15), clock.clone());
        let older_start = clock.now();
        clock.advance(Duration::from_secs(1));
        let newer_start = clock.now();

        let newer = Arc::new(Snapshot {
            servers: vec![],
            timestamp: 2,
        });
        let older = Arc::new(Snapshot {
            servers: vec![],
            timestamp: 1,
        });
        assert!(cache.set(newer.clone(), newer_start));
        assert!(!cache.set(older, older_start));

        let cached = cache.get().expect("свежая запись");
        assert!(Arc::ptr_eq(&cached, &newer));
        assert_eq!(cache.age(), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn reads_within_ttl_reuse_the_same_snapshot() {
        let (cached, source, clock) = setup(true, Duration::ZERO);

        let first = cached.get_servers_metrics().await;
        clock.advance(Duration::from_secs(10));
        let second = cached.get_servers_metrics().await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.timestamp, second.timestamp);
        assert_eq!(first.servers.len(), 2);
        assert_eq!(source.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn read_after_ttl_triggers_exactly_one_refresh() {
        let (cached, source, clock) = setup(true, Duration::ZERO);

        let first = cached.get_servers_metrics().await;
        clock.advance(Duration::from_secs(16));
        let second = cached.get_servers_metrics().await;
        let third = cached.get_servers_metrics().await;

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&second, &third));
        assert!(second.timestamp > first.timestamp);
        assert_eq!(source.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn overlapping_misses_share_one_collection() {
        let (cached, source, _clock) = setup(true, Duration::from_millis(50));

        let a = tokio::spawn({
            let cached = cached.clone();
            async move { cached.get_servers_metrics().await }
        });
        let b = tokio::spawn({
            let cached = cached.clone();
            async move { cached.get_servers_metrics().await }
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(source.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn without_dedup_overlapping_misses_collect_independently() {
        let (cached, source, _clock) = setup(false, Duration::from_millis(50));

        let a = tokio::spawn({
            let cached = cached.clone();
            async move { cached.get_servers_metrics().await }
        });
        let b = tokio::spawn({
            let cached = cached.clone();
            async move { cached.get_servers_metrics().await }
        });
        let _ = (a.await.unwrap(), b.await.unwrap());

        assert_eq!(source.runs.load(Ordering::SeqCst), 2);
    }
}
