//! 进程内 MVCC KV 存储
//!
//! 行为与 etcd 保持一致：每次写入递增全局版本，租约到期后删除绑定的键，
//! 监听可以从历史版本回放，回放起点早于压缩版本时返回取消响应。
//! 另外提供 [`MemoryKv::compact`] 和 [`MemoryKv::disconnect_watchers`]，用于模拟存储侧故障。
//! 历史事件数量有上限，超出时自动压缩最早的版本，与 etcd 的自动压缩一致。

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::debug;

use super::{GetResponse, KeyValue, KvClient, LeaseId, LeaseKeeper, WatchBatch, WatchEvent, WatchStream};
use crate::error::{Error, Result};

const REAP_INTERVAL: Duration = Duration::from_millis(100);
const NOTICE_CAPACITY: usize = 1024;
const DEFAULT_HISTORY_LIMIT: usize = 10_000;

#[derive(Debug, Clone)]
enum Notice {
    Events { revision: i64, events: Vec<WatchEvent> },
    Disconnect,
}

struct Stored {
    value: Vec<u8>,
    mod_revision: i64,
    lease: LeaseId,
}

struct Lease {
    ttl: i64,
    deadline: Instant,
    keys: BTreeSet<String>,
}

#[derive(Default)]
struct State {
    revision: i64,
    compacted: i64,
    next_lease: LeaseId,
    kvs: BTreeMap<String, Stored>,
    leases: HashMap<LeaseId, Lease>,
    history: Vec<WatchEvent>,
    history_limit: usize,
}

struct Inner {
    state: Mutex<State>,
    notices: broadcast::Sender<Notice>,
}

impl Inner {
    fn publish(&self, revision: i64, events: Vec<WatchEvent>) {
        if events.is_empty() {
            return;
        }
        // 没有订阅者时发送失败，忽略即可
        let _ = self.notices.send(Notice::Events { revision, events });
    }

    /// 删除所有到期租约及其绑定的键
    fn expire_leases(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let expired: Vec<LeaseId> = state
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            debug!(lease = id, "memory lease expired");
            if let Some((revision, events)) = state.drop_lease(id) {
                self.publish(revision, events);
            }
        }
    }
}

impl State {
    fn kv(&self, key: &str) -> Option<KeyValue> {
        self.kvs.get(key).map(|stored| KeyValue {
            key: key.to_string(),
            value: stored.value.clone(),
            mod_revision: stored.mod_revision,
            lease: stored.lease,
        })
    }

    /// 追加历史事件，超出上限时压缩最早的版本
    fn record(&mut self, events: impl IntoIterator<Item = WatchEvent>) {
        self.history.extend(events);
        if self.history.len() <= self.history_limit {
            return;
        }

        let excess = self.history.len() - self.history_limit;
        let compacted = self.history[excess - 1].mod_revision();
        self.compacted = self.compacted.max(compacted);
        let compacted = self.compacted;
        self.history.retain(|event| event.mod_revision() > compacted);
        debug!(revision = compacted, "memory store auto-compacted");
    }

    fn detach(&mut self, key: &str, lease: LeaseId) {
        if let Some(lease) = self.leases.get_mut(&lease) {
            lease.keys.remove(key);
        }
    }

    /// 撤销租约，所有键的删除落在同一个版本上
    fn drop_lease(&mut self, id: LeaseId) -> Option<(i64, Vec<WatchEvent>)> {
        let lease = self.leases.remove(&id)?;
        if lease.keys.is_empty() {
            return None;
        }

        self.revision += 1;
        let revision = self.revision;
        let mut events = Vec::with_capacity(lease.keys.len());
        for key in lease.keys {
            if self.kvs.remove(&key).is_some() {
                events.push(WatchEvent::Delete {
                    key,
                    mod_revision: revision,
                });
            }
        }
        self.record(events.iter().cloned());
        Some((revision, events))
    }
}

/// 进程内 KV 存储，克隆后共享同一份数据
#[derive(Clone)]
pub struct MemoryKv {
    inner: Arc<Inner>,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    /// 创建存储；在 tokio 运行时内会同时启动租约回收任务
    pub fn new() -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                history_limit: DEFAULT_HISTORY_LIMIT,
                ..Default::default()
            }),
            notices,
        });

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let weak: Weak<Inner> = Arc::downgrade(&inner);
            handle.spawn(async move {
                let mut ticker = tokio::time::interval(REAP_INTERVAL);
                loop {
                    ticker.tick().await;
                    match weak.upgrade() {
                        Some(inner) => inner.expire_leases(),
                        None => break,
                    }
                }
            });
        }

        Self { inner }
    }

    /// 设置保留的历史事件数量上限
    pub fn with_history_limit(self, limit: usize) -> Self {
        self.inner.state.lock().history_limit = limit.max(1);
        self
    }

    /// 当前版本
    pub fn revision(&self) -> i64 {
        self.inner.state.lock().revision
    }

    /// 存活的租约数量
    pub fn lease_count(&self) -> usize {
        self.inner.expire_leases();
        self.inner.state.lock().leases.len()
    }

    /// 压缩历史，早于等于 `revision` 的事件不再可回放
    pub fn compact(&self, revision: i64) {
        let mut state = self.inner.state.lock();
        let revision = revision.min(state.revision);
        state.compacted = state.compacted.max(revision);
        let compacted = state.compacted;
        state.history.retain(|event| event.mod_revision() > compacted);
        debug!(revision = compacted, "memory store compacted");
    }

    /// 断开所有监听流，模拟连接中断
    pub fn disconnect_watchers(&self) {
        let _ = self.inner.notices.send(Notice::Disconnect);
    }
}

#[async_trait]
impl KvClient for MemoryKv {
    async fn get(&self, key: &str) -> Result<GetResponse> {
        self.inner.expire_leases();
        let state = self.inner.state.lock();
        Ok(GetResponse {
            kvs: state.kv(key).into_iter().collect(),
            revision: state.revision,
        })
    }

    async fn get_prefix(&self, prefix: &str) -> Result<GetResponse> {
        self.inner.expire_leases();
        let state = self.inner.state.lock();
        let kvs = state
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter_map(|(key, _)| state.kv(key))
            .collect();
        Ok(GetResponse {
            kvs,
            revision: state.revision,
        })
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<i64> {
        self.inner.expire_leases();
        let mut state = self.inner.state.lock();
        let lease_id = lease.unwrap_or(0);
        if lease_id != 0 {
            match state.leases.get_mut(&lease_id) {
                Some(lease) => {
                    lease.keys.insert(key.to_string());
                }
                None => return Err(Error::LeaseExpired(lease_id)),
            }
        }

        if let Some(previous) = state.kvs.get(key).map(|stored| stored.lease)
            && previous != lease_id
        {
            state.detach(key, previous);
        }

        state.revision += 1;
        let revision = state.revision;
        state.kvs.insert(
            key.to_string(),
            Stored {
                value: value.clone(),
                mod_revision: revision,
                lease: lease_id,
            },
        );

        let event = WatchEvent::Put {
            key: key.to_string(),
            value,
            mod_revision: revision,
        };
        state.record([event.clone()]);
        self.inner.publish(revision, vec![event]);
        Ok(revision)
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        self.inner.expire_leases();
        let mut state = self.inner.state.lock();
        let Some(stored) = state.kvs.remove(key) else {
            return Ok(0);
        };
        state.detach(key, stored.lease);

        state.revision += 1;
        let revision = state.revision;
        let event = WatchEvent::Delete {
            key: key.to_string(),
            mod_revision: revision,
        };
        state.record([event.clone()]);
        self.inner.publish(revision, vec![event]);
        Ok(1)
    }

    async fn watch(&self, prefix: &str, from_revision: i64) -> Result<WatchStream> {
        self.inner.expire_leases();
        // 在锁内订阅，保证回放与实时事件之间没有缺口
        let (backlog, receiver, revision) = {
            let state = self.inner.state.lock();
            if from_revision > 0 && from_revision <= state.compacted {
                let canceled = WatchBatch {
                    revision: state.revision,
                    compact_revision: state.compacted,
                    canceled: true,
                    events: Vec::new(),
                };
                return Ok(futures::stream::iter(vec![Ok(canceled)]).boxed());
            }

            let backlog: Vec<WatchEvent> = if from_revision > 0 {
                state
                    .history
                    .iter()
                    .filter(|e| e.mod_revision() >= from_revision && e.key().starts_with(prefix))
                    .cloned()
                    .collect()
            } else {
                Vec::new()
            };
            (backlog, self.inner.notices.subscribe(), state.revision)
        };

        let replay = (!backlog.is_empty()).then(|| {
            Ok(WatchBatch {
                revision,
                events: backlog,
                ..Default::default()
            })
        });

        let prefix = prefix.to_string();
        let live = BroadcastStream::new(receiver).filter_map(move |notice| {
            let prefix = prefix.clone();
            async move {
                match notice {
                    Ok(Notice::Events { revision, events }) => {
                        let events: Vec<WatchEvent> = events
                            .into_iter()
                            .filter(|e| e.key().starts_with(&prefix))
                            .collect();
                        (!events.is_empty()).then(|| {
                            Ok(WatchBatch {
                                revision,
                                events,
                                ..Default::default()
                            })
                        })
                    }
                    Ok(Notice::Disconnect) => {
                        Some(Err(Error::store_unavailable("watch stream disconnected")))
                    }
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => Some(Err(
                        Error::store_unavailable(format!("watcher lagged by {} notices", skipped)),
                    )),
                }
            }
        });

        Ok(futures::stream::iter(replay).chain(live).boxed())
    }

    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId> {
        let ttl = ttl_secs.max(1);
        let mut state = self.inner.state.lock();
        state.next_lease += 1;
        let id = state.next_lease;
        state.leases.insert(
            id,
            Lease {
                ttl,
                deadline: Instant::now() + Duration::from_secs(ttl as u64),
                keys: BTreeSet::new(),
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<Box<dyn LeaseKeeper>> {
        Ok(Box::new(MemoryLeaseKeeper {
            inner: self.inner.clone(),
            lease,
        }))
    }

    async fn revoke(&self, lease: LeaseId) -> Result<()> {
        let mut state = self.inner.state.lock();
        if !state.leases.contains_key(&lease) {
            return Err(Error::LeaseExpired(lease));
        }
        if let Some((revision, events)) = state.drop_lease(lease) {
            self.inner.publish(revision, events);
        }
        Ok(())
    }

    async fn time_to_live(&self, lease: LeaseId) -> Result<Option<i64>> {
        self.inner.expire_leases();
        let state = self.inner.state.lock();
        Ok(state.leases.get(&lease).map(|lease| {
            let remaining = lease.deadline.saturating_duration_since(Instant::now());
            remaining.as_secs_f64().ceil() as i64
        }))
    }
}

struct MemoryLeaseKeeper {
    inner: Arc<Inner>,
    lease: LeaseId,
}

#[async_trait]
impl LeaseKeeper for MemoryLeaseKeeper {
    async fn keep_alive(&mut self) -> Result<i64> {
        self.inner.expire_leases();
        let mut state = self.inner.state.lock();
        Ok(match state.leases.get_mut(&self.lease) {
            Some(lease) => {
                lease.deadline = Instant::now() + Duration::from_secs(lease.ttl as u64);
                lease.ttl
            }
            None => 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prefix_reads_are_ordered_and_bounded() {
        let kv = MemoryKv::new();
        kv.put("/p/b", b"2".to_vec(), None).await.unwrap();
        kv.put("/p/a", b"1".to_vec(), None).await.unwrap();
        kv.put("/q/a", b"3".to_vec(), None).await.unwrap();

        let resp = kv.get_prefix("/p/").await.unwrap();
        let keys: Vec<_> = resp.kvs.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["/p/a", "/p/b"]);
        assert_eq!(resp.revision, 3);
    }

    #[tokio::test]
    async fn revoke_deletes_bound_keys() {
        let kv = MemoryKv::new();
        let lease = kv.grant_lease(30).await.unwrap();
        kv.put("/p/a", b"1".to_vec(), Some(lease)).await.unwrap();
        kv.put("/p/b", b"2".to_vec(), None).await.unwrap();

        kv.revoke(lease).await.unwrap();

        let resp = kv.get_prefix("/p/").await.unwrap();
        assert_eq!(resp.kvs.len(), 1);
        assert_eq!(kv.time_to_live(lease).await.unwrap(), None);
        assert!(matches!(
            kv.put("/p/c", vec![], Some(lease)).await,
            Err(Error::LeaseExpired(id)) if id == lease
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn lease_expires_without_keepalive() {
        let kv = MemoryKv::new();
        let lease = kv.grant_lease(1).await.unwrap();
        kv.put("/p/a", b"1".to_vec(), Some(lease)).await.unwrap();

        let mut keeper = kv.keep_alive(lease).await.unwrap();
        tokio::time::advance(Duration::from_millis(800)).await;
        assert_eq!(keeper.keep_alive().await.unwrap(), 1);

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(keeper.keep_alive().await.unwrap(), 0);
        assert!(kv.get("/p/a").await.unwrap().kvs.is_empty());
    }

    #[tokio::test]
    async fn watch_replays_from_revision() {
        let kv = MemoryKv::new();
        kv.put("/p/a", b"1".to_vec(), None).await.unwrap();
        let rev = kv.put("/p/b", b"2".to_vec(), None).await.unwrap();
        kv.delete("/p/a").await.unwrap();

        let mut stream = kv.watch("/p/", rev).await.unwrap();
        let batch = stream.next().await.unwrap().unwrap();
        assert_eq!(batch.events.len(), 2);
        assert_eq!(batch.events[0].key(), "/p/b");
        assert!(matches!(batch.events[1], WatchEvent::Delete { .. }));

        kv.put("/other", vec![], None).await.unwrap();
        kv.put("/p/c", vec![], None).await.unwrap();
        let batch = stream.next().await.unwrap().unwrap();
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.events[0].key(), "/p/c");
    }

    #[tokio::test]
    async fn watch_before_compaction_is_canceled() {
        let kv = MemoryKv::new();
        kv.put("/p/a", b"1".to_vec(), None).await.unwrap();
        kv.put("/p/a", b"2".to_vec(), None).await.unwrap();
        kv.compact(2);

        let mut stream = kv.watch("/p/", 1).await.unwrap();
        let batch = stream.next().await.unwrap().unwrap();
        assert!(batch.canceled);
        assert_eq!(batch.compact_revision, 2);
    }

    #[tokio::test]
    async fn history_limit_compacts_oldest_revisions() {
        let kv = MemoryKv::new().with_history_limit(2);
        for value in ["1", "2", "3"] {
            kv.put("/p/a", value.as_bytes().to_vec(), None).await.unwrap();
        }

        let mut stream = kv.watch("/p/", 1).await.unwrap();
        let batch = stream.next().await.unwrap().unwrap();
        assert!(batch.canceled);
        assert_eq!(batch.compact_revision, 1);

        let mut stream = kv.watch("/p/", 2).await.unwrap();
        let batch = stream.next().await.unwrap().unwrap();
        assert!(!batch.canceled);
        assert_eq!(batch.events.len(), 2);
    }

    #[tokio::test]
    async fn disconnect_surfaces_as_stream_error() {
        let kv = MemoryKv::new();
        let mut stream = kv.watch("/p/", 0).await.unwrap();
        kv.disconnect_watchers();
        assert!(stream.next().await.unwrap().is_err());
    }
}
