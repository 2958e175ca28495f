use crate::state::ServerMetrics;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub struct Metrics {
    registry: Registry,
    started_at_unix: i64,
    pub monitor_host_up: GaugeVec,
    pub monitor_host_cpu_percent: GaugeVec,
    pub monitor_host_ram_percent: GaugeVec,
    pub monitor_host_disk_percent: GaugeVec,
    pub monitor_hosts_total: Gauge,
    pub monitor_hosts_online: Gauge,
    pub monitor_collect_errors_total: CounterVec,
    pub monitor_collections_total: Counter,
    pub monitor_cache_hits_total: Counter,
    pub monitor_collect_duration_seconds: Gauge,
    pub monitor_last_collect_timestamp_seconds: Gauge,
    pub monitor_scrape_count_total: Counter,
    pub monitor_uptime_seconds: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let monitor_host_up = GaugeVec::new(
            opts!("monitor_host_up", "Host reachable and reporting 0/1"),
            &["host"],
        )?;
        let monitor_host_cpu_percent = GaugeVec::new(
            opts!("monitor_host_cpu_percent", "Host CPU usage in percent (0..100)"),
            &["host"],
        )?;
        let monitor_host_ram_percent = GaugeVec::new(
            opts!("monitor_host_ram_percent", "Host RAM usage in percent"),
            &["host"],
        )?;
        let monitor_host_disk_percent = GaugeVec::new(
            opts!(
                "monitor_host_disk_percent",
                "Root filesystem usage in percent as reported by df"
            ),
            &["host"],
        )?;
        let monitor_hosts_total =
            Gauge::with_opts(opts!("monitor_hosts_total", "Configured hosts"))?;
        let monitor_hosts_online = Gauge::with_opts(opts!(
            "monitor_hosts_online",
            "Hosts online in the last collection"
        ))?;
        let monitor_collect_errors_total = CounterVec::new(
            opts!(
                "monitor_collect_errors_total",
                "Per-host collection failures by kind"
            ),
            &["kind"],
        )?;
        let monitor_collections_total = Counter::with_opts(opts!(
            "monitor_collections_total",
            "Completed fleet collection cycles"
        ))?;
        let monitor_cache_hits_total = Counter::with_opts(opts!(
            "monitor_cache_hits_total",
            "Snapshot requests served from cache"
        ))?;
        let monitor_collect_duration_seconds = Gauge::with_opts(opts!(
            "monitor_collect_duration_seconds",
            "Wall-clock duration of the last collection cycle"
        ))?;
        let monitor_last_collect_timestamp_seconds = Gauge::with_opts(opts!(
            "monitor_last_collect_timestamp_seconds",
            "Unix timestamp of the last collection"
        ))?;
        let monitor_scrape_count_total = Counter::with_opts(opts!(
            "monitor_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;
        let monitor_uptime_seconds =
            Gauge::with_opts(opts!("monitor_uptime_seconds", "Daemon uptime in seconds"))?;

        register(&registry, &monitor_host_up)?;
        register(&registry, &monitor_host_cpu_percent)?;
        register(&registry, &monitor_host_ram_percent)?;
        register(&registry, &monitor_host_disk_percent)?;
        register(&registry, &monitor_hosts_total)?;
        register(&registry, &monitor_hosts_online)?;
        register(&registry, &monitor_collect_errors_total)?;
        register(&registry, &monitor_collections_total)?;
        register(&registry, &monitor_cache_hits_total)?;
        register(&registry, &monitor_collect_duration_seconds)?;
        register(&registry, &monitor_last_collect_timestamp_seconds)?;
        register(&registry, &monitor_scrape_count_total)?;
        register(&registry, &monitor_uptime_seconds)?;

        Ok(Arc::new(Self {
            registry,
            started_at_unix: now_unix(),
            monitor_host_up,
            monitor_host_cpu_percent,
            monitor_host_ram_percent,
            monitor_host_disk_percent,
            monitor_hosts_total,
            monitor_hosts_online,
            monitor_collect_errors_total,
            monitor_collections_total,
            monitor_cache_hits_total,
            monitor_collect_duration_seconds,
            monitor_last_collect_timestamp_seconds,
            monitor_scrape_count_total,
            monitor_uptime_seconds,
        }))
    }

    pub fn observe_collection(&self, servers: &[ServerMetrics], elapsed: Duration) {
        self.monitor_host_up.reset();
        self.monitor_host_cpu_percent.reset();
        self.monitor_host_ram_percent.reset();
        self.monitor_host_disk_percent.reset();

        for s in servers {
            self.monitor_host_up
                .with_label_values(&[&s.id])
                .set(if s.online { 1.0 } else { 0.0 });
            self.monitor_host_cpu_percent
                .with_label_values(&[&s.id])
                .set(s.cpu);
            self.monitor_host_ram_percent
                .with_label_values(&[&s.id])
                .set(s.ram_percent);
            self.monitor_host_disk_percent
                .with_label_values(&[&s.id])
                .set(s.disk_percent as f64);
        }

        let online = servers.iter().filter(|s| s.online).count();
        self.monitor_hosts_total.set(servers.len() as f64);
        self.monitor_hosts_online.set(online as f64);
        self.monitor_collections_total.inc();
        self.monitor_collect_duration_seconds
            .set(elapsed.as_secs_f64());
        self.monitor_last_collect_timestamp_seconds
            .set(now_unix() as f64);
    }

    pub fn inc_scrape_count(&self) {
        self.monitor_scrape_count_total.inc();
    }

    pub fn inc_cache_hit(&self) {
        self.monitor_cache_hits_total.inc();
    }

    pub fn inc_collect_error(&self, kind: &str) {
        self.monitor_collect_errors_total
            .with_label_values(&[kind])
            .inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let uptime = now_unix().saturating_sub(self.started_at_unix) as f64;
        self.monitor_uptime_seconds.set(uptime);

        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
