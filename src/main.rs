mod cache;
mod collectors;
mod config;
mod http;
mod metrics;
mod state;

use axum::serve;
use cache::{CachedCollector, Clock, SystemClock};
use clap::Parser;
use collectors::fleet::Collect;
use config::Config;
use metrics::Metrics;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fleet-monitord")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    /// Collect once, print the snapshot as JSON and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(1);
        }
    };

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "не удалось инициализировать метрики");
            std::process::exit(1);
        }
    };

    let fleet = collectors::build_fleet(&cfg, metrics.clone());

    if cli.once {
        let servers = fleet.collect().await;
        let snapshot = state::Snapshot {
            servers,
            timestamp: SystemClock.unix_millis(),
        };
        match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => println!("{json}"),
            Err(err) => {
                error!(error = %err, "не удалось сериализовать снимок");
                std::process::exit(1);
            }
        }
        return;
    }

    info!(
        listen = %cfg.listen,
        hosts = fleet.hosts().len(),
        local_address = %cfg.local_address,
        cache_ttl = %humantime::format_duration(cfg.cache.ttl()),
        exec_timeout = %humantime::format_duration(cfg.collector.exec_timeout()),
        started_at = %humantime::format_rfc3339_seconds(SystemTime::now()),
        "запуск fleet-monitord"
    );

    let snapshots = Arc::new(CachedCollector::new(
        Arc::new(fleet),
        cfg.cache.ttl(),
        cfg.cache.dedup_refresh,
        Arc::new(SystemClock),
        metrics.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let cfg = cfg.clone();
        let metrics = metrics.clone();
        let snapshots = snapshots.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(metrics, snapshots);
            let addr: SocketAddr = match cfg.listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %cfg.listen, "некорректный адрес listen");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "не удалось запустить HTTP-сервер");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "ошибка HTTP-сервера");
            }
        })
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "не удалось дождаться Ctrl+C");
    }
    info!("получен Ctrl+C, выполняется остановка");

    let _ = shutdown_tx.send(true);
    drop(shutdown_rx);
    let _ = http_task.await;
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
