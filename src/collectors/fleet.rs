use crate::collectors::exec::Runner;
use crate::collectors::parse::parse_output;
use crate::collectors::probe::Probe;
use crate::config::HostConfig;
use crate::metrics::Metrics;
use crate::state::ServerMetrics;
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Source of a full, registry-ordered metrics list.
#[async_trait]
pub trait Collect: Send + Sync {
    async fn collect(&self) -> Vec<ServerMetrics>;
}

#[derive(Clone)]
pub struct FleetCollector {
    hosts: Arc<[HostConfig]>,
    probe: Arc<dyn Probe>,
    runner: Arc<dyn Runner>,
    metrics: Arc<Metrics>,
    limit: Option<Arc<Semaphore>>,
}

impl FleetCollector {
    pub fn new(
        hosts: Vec<HostConfig>,
        probe: Arc<dyn Probe>,
        runner: Arc<dyn Runner>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            hosts: hosts.into(),
            probe,
            runner,
            metrics,
            limit: None,
        }
    }

    pub fn with_max_concurrency(mut self, max: Option<usize>) -> Self {
        self.limit = max.filter(|n| *n > 0).map(|n| Arc::new(Semaphore::new(n)));
        self
    }

    pub fn hosts(&self) -> &[HostConfig] {
        &self.hosts
    }

    /// Probe, run and parse one host. Every failure ends as the offline record.
    pub async fn collect_host(&self, host: &HostConfig) -> ServerMetrics {
        let _permit = match &self.limit {
            Some(limit) => limit.acquire().await.ok(),
            None => None,
        };

        if !self.probe.is_reachable(&host.address).await {
            debug!(host = %host.id, address = %host.address, "host unreachable");
            self.metrics.inc_collect_error("unreachable");
            return ServerMetrics::offline(host);
        }

        let stdout = match self.runner.run(host).await {
            Ok(stdout) => stdout,
            Err(err) => {
                warn!(
                    host = %host.id,
                    address = %host.address,
                    error = %err,
                    "failed to collect metrics"
                );
                self.metrics.inc_collect_error(err.kind());
                return ServerMetrics::offline(host);
            }
        };

        match parse_output(&stdout, host) {
            Ok(metrics) => metrics,
            Err(err) => {
                warn!(host = %host.id, address = %host.address, error = %err, "malformed metrics output");
                self.metrics.inc_collect_error("malformed");
                ServerMetrics::offline(host)
            }
        }
    }
}

#[async_trait]
impl Collect for FleetCollector {
    async fn collect(&self) -> Vec<ServerMetrics> {
        let started = Instant::now();
        let handles: Vec<_> = self
            .hosts
            .iter()
            .cloned()
            .map(|host| {
                let collector = self.clone();
                tokio::spawn(async move { collector.collect_host(&host).await })
            })
            .collect();

        // Joined in spawn order, so the result follows the registry.
        let servers: Vec<ServerMetrics> = join_all(handles)
            .await
            .into_iter()
            .zip(self.hosts.iter())
            .map(|(joined, host)| match joined {
                Ok(metrics) => metrics,
                Err(err) => {
                    warn!(host = %host.id, error = %err, "collection task failed");
                    self.metrics.inc_collect_error("task");
                    ServerMetrics::offline(host)
                }
            })
            .collect();

        let elapsed = started.elapsed();
        self.metrics.observe_collection(&servers, elapsed);
        debug!(
            hosts = servers.len(),
            online = servers.iter().filter(|s| s.online).count(),
            elapsed = %humantime::format_duration(elapsed),
            "collection cycle finished"
        );
        servers
    }
}
