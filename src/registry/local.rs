//! 本地注册器
//!
//! 不连接任何存储，注册和注销只记录日志。未配置注册中心时作为默认实现。

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Endpoints, Registry, Target};
use crate::error::Result;
use crate::types::ServiceInfo;

#[derive(Debug, Default)]
pub struct LocalRegistry {
    cancel: CancellationToken,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Registry for LocalRegistry {
    async fn register_service(&self, info: &ServiceInfo) -> Result<()> {
        debug!(service = %info.name, address = %info.label(), "Local registry: register");
        Ok(())
    }

    async fn unregister_service(&self, info: &ServiceInfo) -> Result<()> {
        debug!(service = %info.name, address = %info.label(), "Local registry: unregister");
        Ok(())
    }

    async fn list_services(&self, target: &str) -> Result<Vec<ServiceInfo>> {
        target.parse::<Target>()?;
        Ok(Vec::new())
    }

    async fn watch_services(
        &self,
        cancel: &CancellationToken,
        target: &str,
    ) -> Result<mpsc::Receiver<Endpoints>> {
        target.parse::<Target>()?;
        let (tx, rx) = mpsc::channel(1);
        let caller = cancel.clone();
        let root = self.cancel.clone();
        // 发送端保持到取消为止，接收方不会提前看到通道关闭
        tokio::spawn(async move {
            tokio::select! {
                _ = caller.cancelled() => {}
                _ = root.cancelled() => {}
                _ = tx.closed() => {}
            }
        });
        Ok(rx)
    }

    fn kind(&self) -> &'static str {
        "local"
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        Ok(())
    }
}
