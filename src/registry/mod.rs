//! 服务注册发现模块
//!
//! 基于带租约的一致性 KV 存储实现服务注册、列举和监听：
//! - [`EtcdRegistry`]：租约注册、自愈续约、前缀监听
//! - [`LocalRegistry`]：不做任何事的本地注册器

pub mod endpoints;
pub mod etcd;
pub mod key;
mod lease;
pub mod local;
pub mod route;
pub mod target;
mod watch;

pub use endpoints::Endpoints;
pub use etcd::EtcdRegistry;
pub use key::{RecordKey, route_key};
pub use local::LocalRegistry;
pub use route::{Configuration, Route, RouteConfig, Upstream, WeightGroup};
pub use target::Target;

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{RegistryConfig, RegistryKind};
use crate::error::Result;
use crate::types::ServiceInfo;

/// 服务注册发现 trait
#[async_trait]
pub trait Registry: Send + Sync {
    /// 注册服务实例，键的生命周期绑定到注册中心的租约
    async fn register_service(&self, info: &ServiceInfo) -> Result<()>;

    /// 注销服务实例，重复调用不会报错
    async fn unregister_service(&self, info: &ServiceInfo) -> Result<()>;

    /// 列举目标下的服务提供者，目标格式为 `scheme:name[:version[:deployment]]`
    async fn list_services(&self, target: &str) -> Result<Vec<ServiceInfo>>;

    /// 监听目标下的端点变化
    ///
    /// 返回的通道先收到当前快照，之后每次变化收到完整快照。
    /// `cancel` 被取消、注册中心关闭或接收方被丢弃时监听结束。
    async fn watch_services(
        &self,
        cancel: &CancellationToken,
        target: &str,
    ) -> Result<mpsc::Receiver<Endpoints>>;

    /// 注册中心类型
    fn kind(&self) -> &'static str;

    /// 停止所有后台任务并释放租约，可以重复调用
    async fn close(&self) -> Result<()>;
}

/// 按配置创建注册中心
pub async fn create_registry(config: RegistryConfig) -> Result<Arc<dyn Registry>> {
    match config.kind {
        RegistryKind::Etcdv3 => {
            let registry = EtcdRegistry::new(config).await?;
            Ok(Arc::new(registry))
        }
        RegistryKind::Local => Ok(Arc::new(LocalRegistry::new())),
    }
}

/// 给存储请求加上超时，超时映射为 `StoreUnavailable`
pub(crate) async fn with_timeout<T>(
    timeout: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(timeout, fut).await?
}
