//! 注册中心解析器
//!
//! 消费 [`Registry::watch_services`] 输出的端点快照，转换为均衡器的地址更新。

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Address, Attributes, BaseBalancer, ResolverState};
use crate::error::Result;
use crate::registry::{Endpoints, Registry};

pub struct RegistryResolver {
    balancer: Arc<BaseBalancer>,
}

impl RegistryResolver {
    pub fn new(balancer: Arc<BaseBalancer>) -> Self {
        Self { balancer }
    }

    /// 快照转换为解析器状态：只保留启用且健康的提供者，路由配置作为属性传递
    pub fn resolver_state(endpoints: &Endpoints) -> ResolverState {
        let addresses = endpoints
            .serving_nodes()
            .into_iter()
            .map(|info| Address::new(info.address.clone()).with_info(info.clone()))
            .collect();

        ResolverState {
            addresses,
            attributes: Attributes {
                route_configs: endpoints.route_configs.clone(),
            },
        }
    }

    /// 应用一个快照
    pub fn apply(&self, endpoints: &Endpoints) -> Result<()> {
        let state = Self::resolver_state(endpoints);
        debug!(
            revision = endpoints.revision,
            addresses = state.addresses.len(),
            routes = state.attributes.route_configs.len(),
            "Resolved endpoints"
        );
        self.balancer.update_client_conn_state(state)
    }

    /// 持续消费快照，直到通道关闭或被取消
    pub async fn run(self, mut rx: mpsc::Receiver<Endpoints>, cancel: CancellationToken) {
        loop {
            let endpoints = tokio::select! {
                _ = cancel.cancelled() => break,
                endpoints = rx.recv() => match endpoints {
                    Some(endpoints) => endpoints,
                    None => break,
                },
            };

            if let Err(e) = self.apply(&endpoints) {
                warn!(revision = endpoints.revision, error = %e, "Failed to apply resolved endpoints");
            }
        }
        debug!("Registry resolver stopped");
    }

    pub fn spawn(self, rx: mpsc::Receiver<Endpoints>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(rx, cancel))
    }

    /// 监听目标并把结果喂给均衡器
    pub async fn watch(
        registry: &dyn Registry,
        target: &str,
        balancer: Arc<BaseBalancer>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        let rx = registry.watch_services(&cancel, target).await?;
        info!(target, registry = registry.kind(), "Resolving target from registry");
        Ok(Self::new(balancer).spawn(rx, cancel))
    }
}
