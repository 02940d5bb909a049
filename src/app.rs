//! 进程身份
//!
//! 默认的 [`ServiceInfo`](crate::types::ServiceInfo) 由进程身份派生。
//! 身份通过 [`AppIdentity::from_env`] 显式构造后传递，不使用全局变量。

use serde::{Deserialize, Serialize};

/// 进程身份信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppIdentity {
    pub name: String,
    pub app_id: String,
    pub region: String,
    pub zone: String,
    pub mode: String,
    pub hostname: String,
    pub app_version: String,
    pub start_time: String,
    pub build_time: String,
}

impl AppIdentity {
    /// 从环境变量读取进程身份
    ///
    /// 支持 `APP_NAME`、`APP_ID`、`APP_REGION`、`APP_ZONE`、`APP_MODE`、`APP_VERSION`、`HOSTNAME`，
    /// 构建时间取编译期的 `BUILD_TIME`。
    pub fn from_env() -> Self {
        let name = env_or("APP_NAME", || {
            std::env::current_exe()
                .ok()
                .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
                .unwrap_or_else(|| "unknown".to_string())
        });

        Self {
            app_id: env_or("APP_ID", || name.clone()),
            name,
            region: env_or("APP_REGION", || "default".to_string()),
            zone: env_or("APP_ZONE", || "default".to_string()),
            mode: env_or("APP_MODE", || "dev".to_string()),
            hostname: env_or("HOSTNAME", || "localhost".to_string()),
            app_version: env_or("APP_VERSION", || "unknown".to_string()),
            start_time: chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            build_time: option_env!("BUILD_TIME").unwrap_or("unknown").to_string(),
        }
    }

    /// 进程内唯一的实例 ID
    pub fn instance_id(&self) -> String {
        format!("{}-{}", self.hostname, uuid::Uuid::new_v4().simple())
    }
}

fn env_or(key: &str, default: impl FnOnce() -> String) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(default)
}
