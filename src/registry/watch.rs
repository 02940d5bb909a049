//! 服务监听任务
//!
//! 先全量读取并发送一次快照，再从读取版本 +1 开始监听。每批事件应用后发送完整快照。
//! 监听流出错时从最后见到的版本 +1 重新订阅；版本被压缩或尚无版本时重新全量读取。

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::endpoints::Endpoints;
use super::key::RecordKey;
use super::target::Target;
use super::with_timeout;
use crate::error::Result;
use crate::kv::{KvClient, WatchBatch, WatchEvent};

enum Step {
    Stop,
    Resubscribe,
    Resync,
}

pub(crate) struct ServiceWatcher {
    kv: Arc<dyn KvClient>,
    target: Target,
    prefix: String,
    tx: mpsc::Sender<Endpoints>,
    caller: CancellationToken,
    root: CancellationToken,
    read_timeout: Duration,
    backoff: Duration,
    endpoints: Endpoints,
    revision: i64,
    /// 通道满时暂存的最新快照，消费方腾出空间后发送
    pending: Option<Endpoints>,
}

impl ServiceWatcher {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        kv: Arc<dyn KvClient>,
        target: Target,
        prefix: String,
        tx: mpsc::Sender<Endpoints>,
        caller: CancellationToken,
        root: CancellationToken,
        read_timeout: Duration,
        backoff: Duration,
    ) -> Self {
        Self {
            kv,
            target,
            prefix,
            tx,
            caller,
            root,
            read_timeout,
            backoff,
            endpoints: Endpoints::default(),
            revision: 0,
            pending: None,
        }
    }

    /// 全量读取并发送快照
    pub(crate) async fn resync(&mut self) -> Result<()> {
        let resp = with_timeout(self.read_timeout, self.kv.get_prefix(&self.prefix)).await?;

        let mut endpoints = Endpoints::default();
        for kv in resp.kvs {
            self.apply_put(&mut endpoints, &kv.key, &kv.value);
        }
        endpoints.revision = resp.revision;

        self.revision = resp.revision;
        self.endpoints = endpoints;
        debug!(
            target = %self.target,
            revision = self.revision,
            nodes = self.endpoints.nodes.len(),
            "Services resynced"
        );
        self.emit();
        Ok(())
    }

    pub(crate) async fn run(mut self) {
        info!(target = %self.target, prefix = %self.prefix, "Watching services");

        loop {
            let step = self.follow().await;
            let resync = match step {
                Step::Stop => break,
                Step::Resync => true,
                Step::Resubscribe => self.revision <= 0,
            };

            if !self.pause().await {
                break;
            }

            if resync {
                while let Err(e) = self.resync().await {
                    warn!(target = %self.target, error = %e, "Failed to resync services, retrying");
                    if !self.pause().await {
                        info!(target = %self.target, "Stopped watching services");
                        return;
                    }
                }
            }
        }

        info!(target = %self.target, "Stopped watching services");
    }

    /// 订阅并消费监听流，返回下一步动作
    async fn follow(&mut self) -> Step {
        let from = self.revision + 1;
        let mut stream =
            match with_timeout(self.read_timeout, self.kv.watch(&self.prefix, from)).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(target = %self.target, error = %e, "Failed to open watch, retrying");
                    return Step::Resubscribe;
                }
            };

        loop {
            let item = tokio::select! {
                _ = self.caller.cancelled() => return Step::Stop,
                _ = self.root.cancelled() => return Step::Stop,
                _ = self.tx.closed(), if self.pending.is_none() => return Step::Stop,
                permit = self.tx.reserve(), if self.pending.is_some() => {
                    match permit {
                        Ok(permit) => {
                            if let Some(snapshot) = self.pending.take() {
                                permit.send(snapshot);
                            }
                            continue;
                        }
                        Err(_) => return Step::Stop,
                    }
                }
                item = stream.next() => item,
            };

            match item {
                None => {
                    debug!(target = %self.target, "Watch stream ended, resubscribing");
                    return Step::Resubscribe;
                }
                Some(Err(e)) => {
                    warn!(
                        target = %self.target,
                        revision = self.revision,
                        error = %e,
                        "Watch stream failed, resubscribing"
                    );
                    return Step::Resubscribe;
                }
                Some(Ok(batch)) if batch.canceled || batch.compact_revision > 0 => {
                    warn!(
                        target = %self.target,
                        compact_revision = batch.compact_revision,
                        "Watch revision compacted, resyncing"
                    );
                    return Step::Resync;
                }
                Some(Ok(batch)) => self.apply_batch(batch),
            }
        }
    }

    fn apply_batch(&mut self, batch: WatchBatch) {
        if batch.events.is_empty() {
            return;
        }

        let mut endpoints = std::mem::take(&mut self.endpoints);
        for event in batch.events {
            self.revision = self.revision.max(event.mod_revision());
            match event {
                WatchEvent::Put { key, value, .. } => self.apply_put(&mut endpoints, &key, &value),
                WatchEvent::Delete { key, .. } => {
                    if let Some(record) = RecordKey::parse(&self.prefix, &key) {
                        endpoints.apply_delete(&record);
                    }
                }
            }
        }
        endpoints.revision = self.revision;
        self.endpoints = endpoints;
        self.emit();
    }

    fn apply_put(&self, endpoints: &mut Endpoints, key: &str, value: &[u8]) {
        let Some(record) = RecordKey::parse(&self.prefix, key) else {
            debug!(key, "Ignoring unrecognized key");
            return;
        };
        if let Err(e) = endpoints.apply_put(&self.target, record, value) {
            warn!(key, error = %e, "Skipping malformed registry entry");
        }
    }

    /// 非阻塞发送；通道满时只保留最新快照
    fn emit(&mut self) {
        match self.tx.try_send(self.endpoints.clone()) {
            Ok(()) => self.pending = None,
            Err(TrySendError::Full(snapshot)) => {
                debug!(target = %self.target, "Watch channel full, holding latest snapshot");
                self.pending = Some(snapshot);
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// 退避等待，被取消或接收方关闭时返回 false
    async fn pause(&self) -> bool {
        tokio::select! {
            _ = self.caller.cancelled() => false,
            _ = self.root.cancelled() => false,
            _ = self.tx.closed() => false,
            _ = tokio::time::sleep(self.backoff) => true,
        }
    }
}
