//! etcd 服务注册发现实现

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::lease::LeaseSession;
use super::watch::ServiceWatcher;
use super::{Endpoints, Registry, Target, with_timeout};
use crate::config::RegistryConfig;
use crate::error::{Error, Result};
use crate::kv::{EtcdKv, KvClient, LeaseId};
use crate::types::{ServiceInfo, ServiceKind};

/// etcd 服务注册发现
///
/// 持有唯一的租约会话和根取消令牌；[`Registry::close`] 取消所有后台任务并撤销租约。
pub struct EtcdRegistry {
    kv: Arc<dyn KvClient>,
    config: RegistryConfig,
    session: Arc<LeaseSession>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl EtcdRegistry {
    /// 连接 etcd 并创建注册中心
    pub async fn new(config: RegistryConfig) -> Result<Self> {
        let kv = EtcdKv::connect(&config).await?;
        Ok(Self::with_client(Arc::new(kv), config))
    }

    /// 使用已有的 KV 客户端创建注册中心
    pub fn with_client(kv: Arc<dyn KvClient>, config: RegistryConfig) -> Self {
        let cancel = CancellationToken::new();
        let session = Arc::new(LeaseSession::new(kv.clone(), &config, cancel.child_token()));
        Self {
            kv,
            config,
            session,
            cancel,
            closed: AtomicBool::new(false),
        }
    }

    /// 当前租约 ID，尚未注册任何服务时为 0
    pub fn lease_id(&self) -> LeaseId {
        self.session.lease_id()
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed("registry".to_string()));
        }
        Ok(())
    }
}

fn validate(info: &ServiceInfo) -> Result<()> {
    if info.name.is_empty() || info.scheme.is_empty() || info.address.is_empty() {
        return Err(Error::InvalidService(format!(
            "name, scheme and address are required: {}/{}",
            info.name,
            info.label()
        )));
    }
    // 非有限权重会被编码为 null，读回时无法解码
    if !info.weight.is_finite() {
        return Err(Error::Serialization(format!(
            "weight must be finite: {} ({})",
            info.weight,
            info.label()
        )));
    }
    Ok(())
}

#[async_trait]
impl Registry for EtcdRegistry {
    async fn register_service(&self, info: &ServiceInfo) -> Result<()> {
        self.ensure_open()?;
        validate(info)?;

        let key = info.registry_key(&self.config.prefix);
        let value = serde_json::to_vec(info)?;
        let lease = self.session.put(&key, value).await?;

        info!(key = %key, lease_id = lease, "Service registered: {}", info.name);
        Ok(())
    }

    async fn unregister_service(&self, info: &ServiceInfo) -> Result<()> {
        self.ensure_open()?;
        validate(info)?;

        let key = info.registry_key(&self.config.prefix);
        let deleted = self.session.remove(&key).await?;

        if deleted > 0 {
            info!(key = %key, "Service unregistered: {}", info.name);
        }
        Ok(())
    }

    async fn list_services(&self, target: &str) -> Result<Vec<ServiceInfo>> {
        let target: Target = target.parse()?;
        let prefix = target.kind_prefix(&self.config.prefix, ServiceKind::Provider);
        let resp = with_timeout(self.config.read_timeout(), self.kv.get_prefix(&prefix)).await?;

        let mut services = Vec::with_capacity(resp.kvs.len());
        for kv in resp.kvs {
            match serde_json::from_slice::<ServiceInfo>(&kv.value) {
                Ok(info) if target.matches(&info) => services.push(info),
                Ok(_) => {}
                Err(e) => warn!(key = %kv.key, error = %e, "Skipping malformed registry entry"),
            }
        }
        Ok(services)
    }

    async fn watch_services(
        &self,
        cancel: &CancellationToken,
        target: &str,
    ) -> Result<mpsc::Receiver<Endpoints>> {
        self.ensure_open()?;
        let target: Target = target.parse()?;
        let prefix = target.service_prefix(&self.config.prefix);
        let (tx, rx) = mpsc::channel(self.config.watch_buffer.max(1));

        let mut watcher = ServiceWatcher::new(
            self.kv.clone(),
            target,
            prefix,
            tx,
            cancel.clone(),
            self.cancel.child_token(),
            self.config.read_timeout(),
            self.config.retry_backoff(),
        );
        watcher.resync().await?;
        tokio::spawn(watcher.run());

        Ok(rx)
    }

    fn kind(&self) -> &'static str {
        "etcdv3"
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.cancel.cancel();
        self.session.revoke().await;
        info!(prefix = %self.config.prefix, "Registry closed");
        Ok(())
    }
}

impl Drop for EtcdRegistry {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
