//! etcd v3 KV 客户端

use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, EventType, GetOptions, LeaseKeepAliveStream, PutOptions, WatchOptions,
};
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, info};

use super::{GetResponse, KeyValue, KvClient, LeaseId, LeaseKeeper, WatchBatch, WatchEvent, WatchStream};
use crate::config::RegistryConfig;
use crate::error::{Error, Result};

/// etcd KV 客户端
#[derive(Clone)]
pub struct EtcdKv {
    client: Client,
}

impl EtcdKv {
    /// 按注册中心配置连接 etcd
    pub async fn connect(config: &RegistryConfig) -> Result<Self> {
        let mut options = ConnectOptions::new()
            .with_connect_timeout(config.connect_timeout())
            .with_keep_alive(Duration::from_secs(30), Duration::from_secs(10));
        if let (Some(user), Some(password)) = (&config.username, &config.password) {
            options = options.with_user(user.clone(), password.clone());
        }

        let client = Client::connect(&config.endpoints, Some(options))
            .await
            .map_err(|e| Error::store_unavailable(format!("Failed to connect to etcd: {}", e)))?;

        info!(endpoints = ?config.endpoints, "Connected to etcd");
        Ok(Self { client })
    }

    /// 使用已有的 etcd 客户端
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

fn convert_kv(kv: &etcd_client::KeyValue) -> KeyValue {
    KeyValue {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: kv.value().to_vec(),
        mod_revision: kv.mod_revision(),
        lease: kv.lease(),
    }
}

fn convert_get(resp: etcd_client::GetResponse) -> GetResponse {
    GetResponse {
        revision: resp.header().map(|h| h.revision()).unwrap_or_default(),
        kvs: resp.kvs().iter().map(convert_kv).collect(),
    }
}

fn convert_watch(resp: etcd_client::WatchResponse) -> WatchBatch {
    let events = resp
        .events()
        .iter()
        .filter_map(|event| {
            let kv = event.kv()?;
            let key = String::from_utf8_lossy(kv.key()).into_owned();
            Some(match event.event_type() {
                EventType::Put => WatchEvent::Put {
                    key,
                    value: kv.value().to_vec(),
                    mod_revision: kv.mod_revision(),
                },
                EventType::Delete => WatchEvent::Delete {
                    key,
                    mod_revision: kv.mod_revision(),
                },
            })
        })
        .collect();

    WatchBatch {
        revision: resp.header().map(|h| h.revision()).unwrap_or_default(),
        compact_revision: resp.compact_revision(),
        canceled: resp.canceled(),
        events,
    }
}

/// etcd 对绑定不存在租约的写入返回 "lease not found"
fn map_put_error(err: etcd_client::Error, lease: Option<LeaseId>) -> Error {
    match lease {
        Some(id) if err.to_string().contains("lease not found") => Error::LeaseExpired(id),
        _ => err.into(),
    }
}

#[async_trait]
impl KvClient for EtcdKv {
    async fn get(&self, key: &str) -> Result<GetResponse> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await?;
        Ok(convert_get(resp))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<GetResponse> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;
        Ok(convert_get(resp))
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<i64> {
        let mut client = self.client.clone();
        let mut opts = PutOptions::new();
        if let Some(id) = lease {
            opts = opts.with_lease(id);
        }
        let resp = client
            .put(key, value, Some(opts))
            .await
            .map_err(|e| map_put_error(e, lease))?;
        Ok(resp.header().map(|h| h.revision()).unwrap_or_default())
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let mut client = self.client.clone();
        let resp = client.delete(key, None).await?;
        Ok(resp.deleted().max(0) as u64)
    }

    async fn watch(&self, prefix: &str, from_revision: i64) -> Result<WatchStream> {
        let mut client = self.client.clone();
        let mut opts = WatchOptions::new().with_prefix();
        if from_revision > 0 {
            opts = opts.with_start_revision(from_revision);
        }
        let (watcher, stream) = client.watch(prefix, Some(opts)).await?;
        debug!(prefix, from_revision, "etcd watch opened");

        // watcher 必须与流一起存活，否则 etcd 端的监听会被取消
        let stream = futures::stream::unfold(Some((watcher, stream)), |state| async move {
            let (watcher, mut stream) = state?;
            match stream.message().await {
                Ok(Some(resp)) => Some((Ok(convert_watch(resp)), Some((watcher, stream)))),
                Ok(None) => None,
                Err(e) => Some((Err(Error::from(e)), None)),
            }
        });

        Ok(stream.boxed())
    }

    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId> {
        let mut client = self.client.clone();
        let resp = client.lease_grant(ttl_secs, None).await?;
        Ok(resp.id())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<Box<dyn LeaseKeeper>> {
        let mut client = self.client.clone();
        let (keeper, stream) = client.lease_keep_alive(lease).await?;
        Ok(Box::new(EtcdLeaseKeeper { keeper, stream }))
    }

    async fn revoke(&self, lease: LeaseId) -> Result<()> {
        let mut client = self.client.clone();
        client.lease_revoke(lease).await?;
        Ok(())
    }

    async fn time_to_live(&self, lease: LeaseId) -> Result<Option<i64>> {
        let mut client = self.client.clone();
        let resp = client.lease_time_to_live(lease, None).await?;
        // 租约不存在时 etcd 返回 TTL -1
        if resp.ttl() < 0 {
            Ok(None)
        } else {
            Ok(Some(resp.ttl()))
        }
    }
}

/// etcd 续约句柄
struct EtcdLeaseKeeper {
    keeper: etcd_client::LeaseKeeper,
    stream: LeaseKeepAliveStream,
}

#[async_trait]
impl LeaseKeeper for EtcdLeaseKeeper {
    async fn keep_alive(&mut self) -> Result<i64> {
        self.keeper.keep_alive().await?;
        match self.stream.message().await? {
            Some(resp) => Ok(resp.ttl()),
            None => Err(Error::store_unavailable("lease keep-alive stream closed")),
        }
    }
}
