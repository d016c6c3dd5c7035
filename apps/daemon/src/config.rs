//! 守护进程配置
//!
//! TOML 文件（`--config`）提供默认值，命令行参数覆盖文件中的值。
//!
//! ```toml
//! stats_interval_secs = 30
//!
//! [queue]
//! capacity = 512
//! overflow = "drop-oldest"
//! retry_backoff_ms = 2
//! retry_max_attempts = 50
//!
//! [bridge]
//! rules = "/etc/canbridge/bridge.rules"
//! buses = ["can0", "can1"]
//!
//! [gateway]
//! bus = "can0"
//! connect = "10.1.1.80:32123"
//! ```

use anyhow::{Context, Result, bail};
use canbridge_driver::{OverflowPolicy, QueueConfig, RetryPolicy};
use clap::ValueEnum;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 队列满时的策略（配置文件 / 命令行写法）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowSetting {
    #[default]
    Block,
    Reject,
    DropOldest,
}

impl From<OverflowSetting> for OverflowPolicy {
    fn from(setting: OverflowSetting) -> Self {
        match setting {
            OverflowSetting::Block => OverflowPolicy::Block,
            OverflowSetting::Reject => OverflowPolicy::Reject,
            OverflowSetting::DropOldest => OverflowPolicy::DropOldest,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueSection {
    pub capacity: usize,
    pub overflow: OverflowSetting,
    pub retry_backoff_ms: u64,
    /// 0 表示不限次数
    pub retry_max_attempts: u32,
}

impl Default for QueueSection {
    fn default() -> Self {
        let defaults = QueueConfig::default();
        Self {
            capacity: defaults.capacity,
            overflow: OverflowSetting::Block,
            retry_backoff_ms: defaults.retry.backoff.as_millis() as u64,
            retry_max_attempts: defaults.retry.max_attempts,
        }
    }
}

impl QueueSection {
    pub fn to_queue_config(&self) -> QueueConfig {
        QueueConfig {
            capacity: self.capacity,
            overflow: self.overflow.into(),
            retry: RetryPolicy {
                backoff: Duration::from_millis(self.retry_backoff_ms),
                max_attempts: self.retry_max_attempts,
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeSection {
    pub rules: Option<PathBuf>,
    /// 顺序即规则文件中的连接号 1..=n
    pub buses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewaySection {
    pub bus: Option<String>,
    /// 客户端模式：连接到 hub
    pub connect: Option<String>,
    /// 服务端模式：监听，一次服务一个客户端
    pub listen: Option<String>,
    pub rules: Option<PathBuf>,
    /// TCP 侧在规则矩阵中的连接号（从 1 开始）
    pub tcp_conn: usize,
    /// 总线侧在规则矩阵中的连接号（从 1 开始）
    pub bus_conn: usize,
    /// 客户端模式断线重连间隔
    pub reconnect_secs: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            bus: None,
            connect: None,
            listen: None,
            rules: None,
            tcp_conn: 1,
            bus_conn: 2,
            reconnect_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// 周期性统计日志间隔，0 关闭
    pub stats_interval_secs: u64,
    /// 总线接收超时（决定停止响应速度）
    pub receive_timeout_ms: u64,
    pub queue: QueueSection,
    pub bridge: BridgeSection,
    pub gateway: GatewaySection,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            stats_interval_secs: 60,
            receive_timeout_ms: 50,
            queue: QueueSection::default(),
            bridge: BridgeSection::default(),
            gateway: GatewaySection::default(),
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue.capacity == 0 {
            bail!("queue.capacity must be at least 1");
        }
        if self.receive_timeout_ms == 0 {
            bail!("receive_timeout_ms must be at least 1");
        }
        if self.gateway.tcp_conn == 0 || self.gateway.bus_conn == 0 {
            bail!("gateway connection numbers start at 1");
        }
        Ok(())
    }

    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_secs > 0).then(|| Duration::from_secs(self.stats_interval_secs))
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }
}
