use serde::{Deserialize, Serialize};
use std::time::Duration;

use anyhow::Context;

/// 顶层配置
///
/// 由外部配置加载器解析后直接传给各组件的构造函数
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub balancer: BalancerConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    pub fn load_from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path))?;
        Self::from_toml(&content).with_context(|| format!("failed to parse config file {}", path))
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }
}

/// 注册中心类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryKind {
    #[default]
    Etcdv3,
    Local,
}

impl RegistryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistryKind::Etcdv3 => "etcdv3",
            RegistryKind::Local => "local",
        }
    }
}

impl std::str::FromStr for RegistryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "etcdv3" | "etcd" => Ok(RegistryKind::Etcdv3),
            "local" => Ok(RegistryKind::Local),
            _ => Err(format!("Unknown registry kind: {}", s)),
        }
    }
}

/// 注册中心配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// 底层注册器类型: etcdv3, local
    pub kind: RegistryKind,
    /// etcd 地址列表
    pub endpoints: Vec<String>,
    /// 键前缀（命名空间）
    pub prefix: String,
    /// 前台读写超时（毫秒）
    pub read_timeout_ms: u64,
    /// 服务租约 TTL（秒）
    pub service_ttl_secs: u64,
    /// 连接 etcd 的超时（毫秒）
    pub connect_timeout_ms: u64,
    /// 监听通道容量，满了之后丢弃中间状态
    pub watch_buffer: usize,
    /// 后台任务重试间隔（毫秒）
    pub retry_backoff_ms: u64,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            kind: RegistryKind::Etcdv3,
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            prefix: "wsd-reg".to_string(),
            read_timeout_ms: 3_000,
            service_ttl_secs: 60,
            connect_timeout_ms: 5_000,
            watch_buffer: 10,
            retry_backoff_ms: 1_000,
            username: None,
            password: None,
        }
    }
}

impl RegistryConfig {
    pub fn with_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_service_ttl(mut self, ttl: Duration) -> Self {
        self.service_ttl_secs = ttl.as_secs().max(1);
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn service_ttl(&self) -> Duration {
        Duration::from_secs(self.service_ttl_secs.max(1))
    }

    /// 续约间隔，TTL 的三分之一
    pub fn keepalive_interval(&self) -> Duration {
        self.service_ttl() / 3
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// 负载均衡策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PickPolicy {
    #[default]
    RoundRobin,
    Weighted,
}

impl std::str::FromStr for PickPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "round_robin" | "roundrobin" => Ok(PickPolicy::RoundRobin),
            "weighted" | "weighted_random" => Ok(PickPolicy::Weighted),
            _ => Err(format!("Unknown pick policy: {}", s)),
        }
    }
}

/// 负载均衡配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub policy: PickPolicy,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// 连接失败后重新进入 Idle 之前的等待时间（毫秒）
    pub reconnect_backoff_ms: u64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            policy: PickPolicy::RoundRobin,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 30_000,
            reconnect_backoff_ms: 1_000,
        }
    }
}

impl BalancerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
}

/// 日志配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// 日志级别，`RUST_LOG` 优先
    pub level: String,
    /// 是否输出 JSON 格式
    pub json: bool,
    /// 是否输出 target
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            with_target: true,
        }
    }
}
