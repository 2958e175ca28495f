pub mod exec;
pub mod fleet;
pub mod parse;
pub mod probe;

use crate::config::Config;
use crate::metrics::Metrics;
use std::sync::Arc;

pub fn build_fleet(cfg: &Config, metrics: Arc<Metrics>) -> fleet::FleetCollector {
    let probe: Arc<dyn probe::Probe> = Arc::from(probe::from_config(&cfg.probe));
    let runner = Arc::new(exec::CommandExecutor::from_config(cfg));
    fleet::FleetCollector::new(cfg.hosts.clone(), probe, runner, metrics)
        .with_max_concurrency(cfg.collector.max_concurrent_hosts)
}
