use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_METRICS_COMMAND: &str = "top -bn1 | grep 'Cpu(s)' | awk '{print $2}'; free -b | awk '/Mem/{print $2, $3}'; df -B1 / | awk 'NR==2{print $2, $3, $5}'; uptime -p";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: String,
    pub local_address: String,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    pub hosts: Vec<HostConfig>,
}

/// One monitored machine. The registry is read-only once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HostConfig {
    pub id: String,
    #[serde(rename = "ip")]
    pub address: String,
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub ssh_user: Option<String>,
    #[serde(default)]
    pub identity_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CollectorConfig {
    #[serde(default = "default_exec_timeout_ms")]
    pub exec_timeout_ms: u64,
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    #[serde(default)]
    pub max_concurrent_hosts: Option<usize>,
    #[serde(default = "default_command")]
    pub command: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMethod {
    Ping,
    Tcp,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProbeConfig {
    #[serde(default = "default_probe_method")]
    pub method: ProbeMethod,
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_probe_wait_secs")]
    pub wait_secs: u64,
    #[serde(default = "default_probe_tcp_port")]
    pub tcp_port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SshConfig {
    #[serde(default = "default_ssh_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_ssh_user")]
    pub default_user: String,
    #[serde(default)]
    pub default_identity_file: Option<String>,
    #[serde(default)]
    pub strict_host_key_checking: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_dedup_refresh")]
    pub dedup_refresh: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            exec_timeout_ms: default_exec_timeout_ms(),
            kill_grace_ms: default_kill_grace_ms(),
            max_concurrent_hosts: None,
            command: default_command(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            method: default_probe_method(),
            timeout_ms: default_probe_timeout_ms(),
            wait_secs: default_probe_wait_secs(),
            tcp_port: default_probe_tcp_port(),
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_ssh_connect_timeout_secs(),
            default_user: default_ssh_user(),
            default_identity_file: None,
            strict_host_key_checking: false,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
            dedup_refresh: default_dedup_refresh(),
        }
    }
}

impl CollectorConfig {
    pub fn exec_timeout(&self) -> Duration {
        Duration::from_millis(self.exec_timeout_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation(
                "поле listen обязательно".to_string(),
            ));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "поле listen должно быть корректным адресом host:port".to_string(),
            ));
        }
        if self.local_address.trim().is_empty() {
            return Err(ConfigError::Validation(
                "поле local_address обязательно".to_string(),
            ));
        }

        validate_hosts(&self.hosts)?;
        validate_timeouts(self)?;

        if self.cache.ttl_secs < 1 {
            return Err(ConfigError::Validation(
                "cache.ttl_secs должно быть >= 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_hosts(hosts: &[HostConfig]) -> Result<(), ConfigError> {
    if hosts.is_empty() {
        return Err(ConfigError::Validation(
            "список hosts не должен быть пустым".to_string(),
        ));
    }

    let mut ids = HashSet::new();
    for host in hosts {
        if host.id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "hosts[*].id не должен быть пустым".to_string(),
            ));
        }
        if !ids.insert(host.id.clone()) {
            return Err(ConfigError::Validation(format!(
                "идентификатор хоста '{}' должен быть уникальным",
                host.id
            )));
        }
        if host.address.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "hosts '{}' ip не должен быть пустым",
                host.id
            )));
        }
        if host.name.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "hosts '{}' name не должен быть пустым",
                host.id
            )));
        }
    }
    Ok(())
}

fn validate_timeouts(cfg: &Config) -> Result<(), ConfigError> {
    let exec_ms = cfg.collector.exec_timeout_ms;
    if exec_ms == 0 {
        return Err(ConfigError::Validation(
            "collector.exec_timeout_ms должен быть > 0".to_string(),
        ));
    }
    if cfg.collector.command.trim().is_empty() {
        return Err(ConfigError::Validation(
            "collector.command не должен быть пустым".to_string(),
        ));
    }
    if cfg.collector.max_concurrent_hosts == Some(0) {
        return Err(ConfigError::Validation(
            "collector.max_concurrent_hosts должно быть >= 1".to_string(),
        ));
    }
    if cfg.probe.timeout_ms == 0 || cfg.probe.timeout_ms >= exec_ms {
        return Err(ConfigError::Validation(
            "probe.timeout_ms должен быть > 0 и меньше collector.exec_timeout_ms".to_string(),
        ));
    }
    if cfg.probe.wait_secs.saturating_mul(1000) > cfg.probe.timeout_ms {
        return Err(ConfigError::Validation(
            "probe.wait_secs не должен превышать probe.timeout_ms".to_string(),
        ));
    }
    if cfg.probe.method == ProbeMethod::Tcp && cfg.probe.tcp_port == 0 {
        return Err(ConfigError::Validation(
            "probe.tcp_port должен быть в диапазоне 1..65535".to_string(),
        ));
    }
    if cfg.ssh.connect_timeout_secs.saturating_mul(1000) >= exec_ms {
        return Err(ConfigError::Validation(
            "ssh.connect_timeout_secs должен быть меньше collector.exec_timeout_ms".to_string(),
        ));
    }
    if cfg.ssh.default_user.trim().is_empty() {
        return Err(ConfigError::Validation(
            "ssh.default_user не должен быть пустым".to_string(),
        ));
    }
    Ok(())
}

const fn default_exec_timeout_ms() -> u64 {
    12_000
}

const fn default_kill_grace_ms() -> u64 {
    1_000
}

fn default_command() -> String {
    DEFAULT_METRICS_COMMAND.to_string()
}

const fn default_probe_method() -> ProbeMethod {
    ProbeMethod::Ping
}

const fn default_probe_timeout_ms() -> u64 {
    4_000
}

const fn default_probe_wait_secs() -> u64 {
    2
}

const fn default_probe_tcp_port() -> u16 {
    22
}

const fn default_ssh_connect_timeout_secs() -> u64 {
    5
}

fn default_ssh_user() -> String {
    "aiko".to_string()
}

const fn default_cache_ttl_secs() -> u64 {
    15
}

const fn default_dedup_refresh() -> bool {
    true
}

#[cfg(test)]
pub(crate) fn test_host(id: &str, address: &str) -> HostConfig {
    HostConfig {
        id: id.to_string(),
        address: address.to_string(),
        name: format!("{id} server"),
        role: "test role".to_string(),
        icon: "cpu".to_string(),
        ssh_user: None,
        identity_file: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            listen: "127.0.0.1:9109".to_string(),
            local_address: "10.0.0.1".to_string(),
            collector: CollectorConfig::default(),
            probe: ProbeConfig::default(),
            ssh: SshConfig::default(),
            cache: CacheConfig::default(),
            hosts: vec![test_host("brain", "10.0.0.1"), test_host("proxy", "10.0.0.2")],
        }
    }

    #[test]
    fn example_config_is_valid() {
        let cfg: Config =
            serde_yaml::from_str(Config::example_yaml()).expect("пример должен разбираться");
        cfg.validate().expect("пример должен проходить валидацию");
        assert_eq!(cfg.hosts.len(), 5);
        assert_eq!(cfg.hosts[0].id, "aiko");
        assert_eq!(cfg.hosts[4].ssh_user.as_deref(), Some("root"));
        assert_eq!(cfg.collector.command, DEFAULT_METRICS_COMMAND);
    }

    #[test]
    fn minimal_yaml_gets_defaults() {
        let yaml = r#"
listen: "127.0.0.1:9109"
local_address: "10.0.0.1"
hosts:
  - { id: a, ip: 10.0.0.1, name: A }
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.collector.exec_timeout_ms, 12_000);
        assert_eq!(cfg.collector.kill_grace_ms, 1_000);
        assert_eq!(cfg.probe.method, ProbeMethod::Ping);
        assert_eq!(cfg.probe.timeout_ms, 4_000);
        assert_eq!(cfg.ssh.connect_timeout_secs, 5);
        assert!(!cfg.ssh.strict_host_key_checking);
        assert_eq!(cfg.cache.ttl_secs, 15);
        assert!(cfg.cache.dedup_refresh);
        assert_eq!(cfg.hosts[0].role, "");
    }

    #[test]
    fn duplicate_host_ids_are_rejected() {
        let mut cfg = valid_config();
        cfg.hosts.push(test_host("brain", "10.0.0.9"));
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("brain"));
    }

    #[test]
    fn empty_registry_is_rejected() {
        let mut cfg = valid_config();
        cfg.hosts.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn probe_budget_must_be_below_exec_budget() {
        let mut cfg = valid_config();
        cfg.probe.timeout_ms = cfg.collector.exec_timeout_ms;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn ssh_connect_timeout_must_be_below_exec_budget() {
        let mut cfg = valid_config();
        cfg.ssh.connect_timeout_secs = 12;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_concurrency_cap_is_rejected() {
        let mut cfg = valid_config();
        cfg.collector.max_concurrent_hosts = Some(0);
        assert!(cfg.validate().is_err());
        cfg.collector.max_concurrent_hosts = Some(2);
        cfg.validate().expect("ограничение 2 допустимо");
    }
}
