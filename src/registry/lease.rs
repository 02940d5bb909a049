//! 租约会话
//!
//! 每个注册中心实例只持有一个租约，所有注册的键共享这个租约。
//! 后台任务按 TTL/3 的间隔续约；一旦存储报告租约不存在，就申请新租约并把记住的键全部重新写入。
//! 注册与自愈通过同一把异步锁串行化，保证不会有键被写到已经被替换掉的租约上。

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::with_timeout;
use crate::config::RegistryConfig;
use crate::error::{Error, Result};
use crate::kv::{KvClient, LeaseId, LeaseKeeper};

pub(crate) struct LeaseSession {
    kv: Arc<dyn KvClient>,
    ttl: Duration,
    keepalive_interval: Duration,
    read_timeout: Duration,
    retry_backoff: Duration,
    lease_id: AtomicI64,
    /// 已注册的键及其值，自愈时重新写入
    keys: Mutex<HashMap<String, Vec<u8>>>,
    /// 串行化注册、注销与自愈
    write_lock: tokio::sync::Mutex<()>,
    keeper_started: AtomicBool,
    cancel: CancellationToken,
}

impl LeaseSession {
    pub(crate) fn new(
        kv: Arc<dyn KvClient>,
        config: &RegistryConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            kv,
            ttl: config.service_ttl(),
            keepalive_interval: config.keepalive_interval(),
            read_timeout: config.read_timeout(),
            retry_backoff: config.retry_backoff(),
            lease_id: AtomicI64::new(0),
            keys: Mutex::new(HashMap::new()),
            write_lock: tokio::sync::Mutex::new(()),
            keeper_started: AtomicBool::new(false),
            cancel,
        }
    }

    pub(crate) fn lease_id(&self) -> LeaseId {
        self.lease_id.load(Ordering::SeqCst)
    }

    /// 带租约写入，没有租约时先申请并启动续约任务
    pub(crate) async fn put(self: &Arc<Self>, key: &str, value: Vec<u8>) -> Result<LeaseId> {
        let _guard = self.write_lock.lock().await;
        if self.cancel.is_cancelled() {
            return Err(Error::Closed("lease session".to_string()));
        }

        let mut lease = self.lease_id();
        if lease == 0 {
            lease = self.renew_locked().await?;
            self.spawn_keeper();
        }

        match with_timeout(self.read_timeout, self.kv.put(key, value.clone(), Some(lease))).await {
            Ok(_) => {}
            Err(Error::LeaseExpired(expired)) => {
                // 租约在两次续约之间失效，就地自愈后重试
                warn!(lease_id = expired, key, "Lease lost before put, renewing");
                lease = self.renew_locked().await?;
                with_timeout(self.read_timeout, self.kv.put(key, value.clone(), Some(lease))).await?;
            }
            Err(e) => return Err(e),
        }

        self.keys.lock().insert(key.to_string(), value);
        Ok(lease)
    }

    /// 删除键并忘记它，自愈时不会再写回
    pub(crate) async fn remove(&self, key: &str) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        self.keys.lock().remove(key);
        with_timeout(self.read_timeout, self.kv.delete(key)).await
    }

    /// 撤销租约，绑定的键随之删除
    pub(crate) async fn revoke(&self) {
        let _guard = self.write_lock.lock().await;
        self.keys.lock().clear();
        let lease = self.lease_id.swap(0, Ordering::SeqCst);
        if lease == 0 {
            return;
        }

        match with_timeout(self.read_timeout, self.kv.revoke(lease)).await {
            Ok(()) => info!(lease_id = lease, "Lease revoked"),
            Err(e) => warn!(lease_id = lease, error = %e, "Failed to revoke lease"),
        }
    }

    /// 申请新租约并重新写入所有记住的键；调用方必须持有 `write_lock`
    ///
    /// 全部写入成功后才发布新的租约 ID，失败时旧 ID 保持不变，下一轮续约会再次触发自愈。
    async fn renew_locked(&self) -> Result<LeaseId> {
        let ttl = self.ttl.as_secs() as i64;
        let lease = with_timeout(self.read_timeout, self.kv.grant_lease(ttl)).await?;

        let keys: Vec<(String, Vec<u8>)> = self
            .keys
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for (key, value) in &keys {
            if let Err(e) =
                with_timeout(self.read_timeout, self.kv.put(key, value.clone(), Some(lease))).await
            {
                if let Err(revoke_err) =
                    with_timeout(self.read_timeout, self.kv.revoke(lease)).await
                {
                    warn!(lease_id = lease, error = %revoke_err, "Failed to revoke abandoned lease");
                }
                return Err(e);
            }
        }

        let previous = self.lease_id.swap(lease, Ordering::SeqCst);
        if previous == 0 {
            info!(lease_id = lease, ttl, "Lease granted");
        } else {
            info!(
                lease_id = lease,
                previous_lease_id = previous,
                keys = keys.len(),
                "Lease renewed, services re-registered"
            );
        }
        Ok(lease)
    }

    /// 续约失效的租约；其他任务已经完成自愈时直接返回当前租约
    async fn heal(&self, expired: LeaseId) -> Result<LeaseId> {
        let _guard = self.write_lock.lock().await;
        let current = self.lease_id();
        if current != expired || self.cancel.is_cancelled() {
            return Ok(current);
        }
        self.renew_locked().await
    }

    fn spawn_keeper(self: &Arc<Self>) {
        if self.keeper_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let session = Arc::clone(self);
        tokio::spawn(async move { session.keep_alive_loop().await });
    }

    async fn keep_alive_loop(&self) {
        let mut keeper: Option<(LeaseId, Box<dyn LeaseKeeper>)> = None;
        let mut ticker = tokio::time::interval(self.keepalive_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.keep_alive_once(&mut keeper).await {
                warn!(lease_id = self.lease_id(), error = %e, "Lease keepalive failed, retrying");
                keeper = None;
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.retry_backoff) => {}
                }
            }
        }

        debug!("Lease keeper stopped");
    }

    async fn keep_alive_once(&self, keeper: &mut Option<(LeaseId, Box<dyn LeaseKeeper>)>) -> Result<()> {
        let lease = self.lease_id();
        if lease == 0 {
            return Ok(());
        }

        if keeper.as_ref().is_none_or(|(id, _)| *id != lease) {
            let opened = with_timeout(self.read_timeout, self.kv.keep_alive(lease)).await?;
            *keeper = Some((lease, opened));
        }
        let Some((_, handle)) = keeper.as_mut() else {
            return Ok(());
        };

        let alive = match with_timeout(self.read_timeout, handle.keep_alive()).await {
            Ok(ttl) => ttl > 0,
            // 续约流异常时以 TTL 查询为准
            Err(e) => match with_timeout(self.read_timeout, self.kv.time_to_live(lease)).await? {
                Some(_) => return Err(e),
                None => false,
            },
        };

        if alive {
            trace!(lease_id = lease, "Lease kept alive");
            return Ok(());
        }

        warn!(lease_id = lease, "Lease expired, re-registering services");
        *keeper = None;
        self.heal(lease).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn session(kv: &MemoryKv, ttl: Duration) -> Arc<LeaseSession> {
        let config = RegistryConfig::default()
            .with_service_ttl(ttl)
            .with_retry_backoff(Duration::from_millis(50));
        Arc::new(LeaseSession::new(
            Arc::new(kv.clone()),
            &config,
            CancellationToken::new(),
        ))
    }

    #[tokio::test]
    async fn keys_share_one_lease() {
        let kv = MemoryKv::new();
        let session = session(&kv, Duration::from_secs(10));

        let first = session.put("/p/a", b"1".to_vec()).await.unwrap();
        let second = session.put("/p/b", b"2".to_vec()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(kv.lease_count(), 1);
        let resp = kv.get_prefix("/p/").await.unwrap();
        assert!(resp.kvs.iter().all(|kv| kv.lease == first));
        session.cancel.cancel();
    }

    #[tokio::test]
    async fn put_after_out_of_band_revoke_renews_inline() {
        let kv = MemoryKv::new();
        let session = session(&kv, Duration::from_secs(10));
        let first = session.put("/p/a", b"1".to_vec()).await.unwrap();

        kv.revoke(first).await.unwrap();
        let second = session.put("/p/b", b"2".to_vec()).await.unwrap();

        assert_ne!(first, second);
        assert_eq!(session.lease_id(), second);
        // 之前注册的键随自愈一起写回
        assert_eq!(kv.get_prefix("/p/").await.unwrap().kvs.len(), 2);
        session.cancel.cancel();
    }

    #[tokio::test]
    async fn removed_keys_are_not_resurrected() {
        let kv = MemoryKv::new();
        let session = session(&kv, Duration::from_secs(10));
        let lease = session.put("/p/a", b"1".to_vec()).await.unwrap();
        session.put("/p/b", b"2".to_vec()).await.unwrap();

        assert_eq!(session.remove("/p/a").await.unwrap(), 1);
        assert_eq!(session.remove("/p/a").await.unwrap(), 0);

        kv.revoke(lease).await.unwrap();
        session.heal(lease).await.unwrap();
        let keys: Vec<_> = kv
            .get_prefix("/p/")
            .await
            .unwrap()
            .kvs
            .into_iter()
            .map(|kv| kv.key)
            .collect();
        assert_eq!(keys, vec!["/p/b".to_string()]);
        session.cancel.cancel();
    }

    #[tokio::test]
    async fn revoke_forgets_lease_and_keys() {
        let kv = MemoryKv::new();
        let session = session(&kv, Duration::from_secs(10));
        session.put("/p/a", b"1".to_vec()).await.unwrap();

        session.cancel.cancel();
        session.revoke().await;
        session.revoke().await;

        assert_eq!(session.lease_id(), 0);
        assert!(kv.get_prefix("/p/").await.unwrap().kvs.is_empty());
    }

    #[tokio::test]
    async fn put_after_cancel_is_rejected() {
        let kv = MemoryKv::new();
        let session = session(&kv, Duration::from_secs(10));
        session.put("/p/a", b"1".to_vec()).await.unwrap();

        session.cancel.cancel();
        session.revoke().await;
        let err = session.put("/p/b", b"2".to_vec()).await.unwrap_err();

        assert!(matches!(err, Error::Closed(_)));
        assert_eq!(session.lease_id(), 0);
        assert_eq!(kv.lease_count(), 0);
        assert!(kv.get_prefix("/p/").await.unwrap().kvs.is_empty());
    }
}
