//! 日志初始化
//!
//! 核心组件只通过 `tracing` 宏输出日志，进程入口调用 [`init_tracing`] 安装订阅者。

use crate::config::LogConfig;
use tracing_subscriber::EnvFilter;

/// 安装全局 tracing 订阅者
///
/// `RUST_LOG` 存在时覆盖配置中的级别；重复初始化会返回错误。
pub fn init_tracing(config: &LogConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| anyhow::anyhow!("invalid log level {}: {}", config.level, e))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.with_target);

    if config.json {
        builder
            .json()
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to init tracing: {}", e))?;
    } else {
        builder
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to init tracing: {}", e))?;
    }

    Ok(())
}
