use crate::config::{ProbeConfig, ProbeMethod};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time;
use tracing::debug;

#[async_trait]
pub trait Probe: Send + Sync {
    async fn is_reachable(&self, address: &str) -> bool;
}

pub fn from_config(cfg: &ProbeConfig) -> Box<dyn Probe> {
    match cfg.method {
        ProbeMethod::Ping => Box::new(PingProbe {
            timeout: cfg.timeout(),
            wait_secs: cfg.wait_secs,
        }),
        ProbeMethod::Tcp => Box::new(TcpProbe {
            timeout: cfg.timeout(),
            port: cfg.tcp_port,
        }),
    }
}

/// Single ICMP echo via the system `ping`.
pub struct PingProbe {
    pub timeout: Duration,
    pub wait_secs: u64,
}

#[async_trait]
impl Probe for PingProbe {
    async fn is_reachable(&self, address: &str) -> bool {
        let mut cmd = Command::new("ping");
        cmd.arg("-c")
            .arg("1")
            .arg("-W")
            .arg(self.wait_secs.max(1).to_string())
            .arg(address)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match time::timeout(self.timeout, cmd.status()).await {
            Ok(Ok(status)) => {
                if !status.success() {
                    debug!(address, %status, "ping probe failed");
                }
                status.success()
            }
            Ok(Err(err)) => {
                debug!(address, error = %err, "ping probe could not start");
                false
            }
            Err(_elapsed) => {
                debug!(address, "ping probe timeout");
                false
            }
        }
    }
}

/// TCP connect to a fixed port, for networks that drop ICMP.
pub struct TcpProbe {
    pub timeout: Duration,
    pub port: u16,
}

#[async_trait]
impl Probe for TcpProbe {
    async fn is_reachable(&self, address: &str) -> bool {
        let addr = format!("{}:{}", address, self.port);
        match time::timeout(self.timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(err)) => {
                debug!(address = %addr, error = %err, "tcp probe failed");
                false
            }
            Err(_elapsed) => {
                debug!(address = %addr, "tcp probe timeout");
                false
            }
        }
    }
}
