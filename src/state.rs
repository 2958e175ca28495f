use crate::config::HostConfig;
use std::sync::Arc;

pub const UPTIME_UNKNOWN: &str = "N/A";

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ServerMetrics {
    pub id: String,
    pub name: String,
    pub ip: String,
    pub role: String,
    pub icon: String,
    pub online: bool,
    pub cpu: f64,
    pub ram_percent: f64,
    pub ram_used: f64,
    pub ram_total: f64,
    pub disk_percent: u32,
    pub disk_used: f64,
    pub disk_total: f64,
    pub uptime: String,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Snapshot {
    pub servers: Vec<ServerMetrics>,
    // unix ms
    pub timestamp: i64,
}

pub type SharedSnapshot = Arc<Snapshot>;

impl ServerMetrics {
    pub fn offline(host: &HostConfig) -> Self {
        Self {
            id: host.id.clone(),
            name: host.name.clone(),
            ip: host.address.clone(),
            role: host.role.clone(),
            icon: host.icon.clone(),
            online: false,
            cpu: 0.0,
            ram_percent: 0.0,
            ram_used: 0.0,
            ram_total: 0.0,
            disk_percent: 0,
            disk_used: 0.0,
            disk_total: 0.0,
            uptime: UPTIME_UNKNOWN.to_string(),
        }
    }

    #[cfg(test)]
    pub fn is_offline_record(&self) -> bool {
        !self.online
            && self.cpu == 0.0
            && self.ram_percent == 0.0
            && self.ram_used == 0.0
            && self.ram_total == 0.0
            && self.disk_percent == 0
            && self.disk_used == 0.0
            && self.disk_total == 0.0
            && self.uptime == UPTIME_UNKNOWN
    }
}
