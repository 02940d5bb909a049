//! 基于 tonic 的连接池
//!
//! [`ChannelPool`] 实现 [`ClientConn`]：每个子连接在独立任务中建立 tonic `Channel`，
//! 状态变更经由单个驱动任务串行地交给 [`BaseBalancer`]。
//! [`BalancedChannel`] 实现 `tower::Service`，可以直接交给 tonic 生成的客户端使用。

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::body::Body;
use tonic::transport::{Channel, Endpoint};
use tower::{Service, ServiceExt};
use tracing::{debug, info, warn};

use super::{
    Address, BalancerState, BaseBalancer, ClientConn, ConnectivityState, PickInfo, Picker,
    RegistryResolver, SubConn, SubConnId, SubConnState, picker::ErrPicker, picker_builder,
};
use crate::config::BalancerConfig;
use crate::error::{Error, Result};
use crate::registry::Registry;

type StateEvent = (Arc<dyn SubConn>, SubConnState);

/// 连接池中的子连接
#[derive(Debug)]
struct PooledSubConn {
    id: SubConnId,
    addr: String,
    endpoint: Endpoint,
    me: Weak<PooledSubConn>,
    channel: Mutex<Option<Channel>>,
    connecting: AtomicBool,
    reconnect_backoff: Duration,
    events: mpsc::UnboundedSender<StateEvent>,
    cancel: CancellationToken,
}

impl PooledSubConn {
    fn report(self: &Arc<Self>, state: SubConnState) {
        let sub_conn: Arc<dyn SubConn> = self.clone();
        let _ = self.events.send((sub_conn, state));
    }

    fn channel(&self) -> Option<Channel> {
        self.channel.lock().clone()
    }

    async fn establish(self: Arc<Self>) {
        self.report(SubConnState::new(ConnectivityState::Connecting));

        let result = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = self.endpoint.connect() => result,
        };

        match result {
            Ok(channel) => {
                *self.channel.lock() = Some(channel);
                self.connecting.store(false, Ordering::SeqCst);
                debug!(address = %self.addr, id = %self.id, "Sub connection ready");
                self.report(SubConnState::new(ConnectivityState::Ready));
            }
            Err(e) => {
                warn!(address = %self.addr, error = %e, "Failed to connect");
                self.report(SubConnState::failed(Error::ConnectionFailed(format!(
                    "{}: {}",
                    self.addr, e
                ))));
                self.back_off_to_idle().await;
            }
        }
    }

    /// 等待退避时间后报告 Idle，由均衡器触发重连
    async fn back_off_to_idle(self: Arc<Self>) {
        tokio::select! {
            _ = self.cancel.cancelled() => return,
            _ = tokio::time::sleep(self.reconnect_backoff) => {}
        }
        self.connecting.store(false, Ordering::SeqCst);
        self.report(SubConnState::new(ConnectivityState::Idle));
    }

    /// 传输层错误后丢弃连接
    fn mark_broken(self: &Arc<Self>, reason: String) {
        if self.channel.lock().take().is_none() {
            return;
        }
        warn!(address = %self.addr, error = %reason, "Connection broken");
        self.connecting.store(true, Ordering::SeqCst);
        self.report(SubConnState::failed(Error::ConnectionFailed(reason)));
        tokio::spawn(self.clone().back_off_to_idle());
    }

    fn shutdown(self: &Arc<Self>) {
        self.cancel.cancel();
        self.channel.lock().take();
        self.report(SubConnState::new(ConnectivityState::Shutdown));
    }
}

impl SubConn for PooledSubConn {
    fn id(&self) -> SubConnId {
        self.id
    }

    fn addr(&self) -> &str {
        &self.addr
    }

    fn connect(&self) {
        if self.cancel.is_cancelled() || self.connecting.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(this) = self.me.upgrade() {
            tokio::spawn(this.establish());
        }
    }
}

/// tonic 连接池
pub struct ChannelPool {
    scheme: String,
    config: BalancerConfig,
    next_id: AtomicU64,
    sub_conns: Mutex<HashMap<SubConnId, Arc<PooledSubConn>>>,
    current: RwLock<BalancerState>,
    events: mpsc::UnboundedSender<StateEvent>,
    cancel: CancellationToken,
}

impl ChannelPool {
    /// 创建连接池与均衡器，并启动状态驱动任务；必须在 tokio 运行时内调用
    pub fn start(config: BalancerConfig) -> (Arc<ChannelPool>, Arc<BaseBalancer>) {
        Self::start_with_scheme("http", config)
    }

    pub fn start_with_scheme(
        scheme: impl Into<String>,
        config: BalancerConfig,
    ) -> (Arc<ChannelPool>, Arc<BaseBalancer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = Arc::new(ChannelPool {
            scheme: scheme.into(),
            config: config.clone(),
            next_id: AtomicU64::new(1),
            sub_conns: Mutex::new(HashMap::new()),
            current: RwLock::new(BalancerState {
                state: ConnectivityState::Idle,
                picker: Arc::new(ErrPicker::new(Error::no_addresses(
                    "no sub connection available",
                ))),
            }),
            events: tx,
            cancel: CancellationToken::new(),
        });

        let balancer = Arc::new(BaseBalancer::new(
            pool.clone(),
            picker_builder(config.policy),
            config,
        ));
        tokio::spawn(drive(rx, balancer.clone(), pool.cancel.clone()));

        (pool, balancer)
    }

    /// 聚合连接状态
    pub fn state(&self) -> ConnectivityState {
        self.current.read().state
    }

    /// 可交给 tonic 客户端使用的通道
    pub fn channel(self: &Arc<Self>) -> BalancedChannel {
        BalancedChannel {
            pool: self.clone(),
        }
    }

    /// 关闭所有连接并停止驱动任务
    pub fn close(&self) {
        self.cancel.cancel();
        let sub_conns: Vec<_> = self.sub_conns.lock().drain().map(|(_, sc)| sc).collect();
        for sub_conn in sub_conns {
            sub_conn.shutdown();
        }
        info!("Channel pool closed");
    }

    fn pick(&self, method: &str) -> Result<(Arc<PooledSubConn>, Channel)> {
        let picker: Arc<dyn Picker> = self.current.read().picker.clone();
        let picked = picker.pick(&PickInfo { method })?;
        let sub_conn = self
            .sub_conns
            .lock()
            .get(&picked.sub_conn.id())
            .cloned()
            .ok_or_else(|| Error::no_addresses("picked connection was removed"))?;
        let channel = sub_conn
            .channel()
            .ok_or_else(|| Error::no_addresses(format!("{} is not ready", sub_conn.addr)))?;
        Ok((sub_conn, channel))
    }
}

impl ClientConn for ChannelPool {
    fn new_sub_conn(&self, address: &Address) -> Result<Arc<dyn SubConn>> {
        let uri = format!("{}://{}", self.scheme, address.addr);
        let endpoint = Endpoint::from_shared(uri)
            .map_err(|e| Error::ConnectionFailed(format!("invalid address {}: {}", address.addr, e)))?
            .connect_timeout(self.config.connect_timeout())
            .timeout(self.config.request_timeout());

        let id = SubConnId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let sub_conn = Arc::new_cyclic(|me| PooledSubConn {
            id,
            addr: address.addr.clone(),
            endpoint,
            me: me.clone(),
            channel: Mutex::new(None),
            connecting: AtomicBool::new(false),
            reconnect_backoff: self.config.reconnect_backoff(),
            events: self.events.clone(),
            cancel: self.cancel.child_token(),
        });
        self.sub_conns.lock().insert(id, sub_conn.clone());
        Ok(sub_conn)
    }

    fn remove_sub_conn(&self, sub_conn: &Arc<dyn SubConn>) {
        let removed = self.sub_conns.lock().remove(&sub_conn.id());
        if let Some(pooled) = removed {
            pooled.shutdown();
        }
    }

    fn update_state(&self, state: BalancerState) {
        *self.current.write() = state;
    }
}

/// 把子连接状态变更串行地交给均衡器
async fn drive(
    mut rx: mpsc::UnboundedReceiver<StateEvent>,
    balancer: Arc<BaseBalancer>,
    cancel: CancellationToken,
) {
    loop {
        let (sub_conn, state) = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        balancer.update_sub_conn_state(&sub_conn, state);
    }
    balancer.close();
    debug!("Channel pool driver stopped");
}

/// 负载均衡的 tonic 通道
///
/// 每个请求以路径作为方法名选址，没有 Ready 连接时立即失败。
#[derive(Clone)]
pub struct BalancedChannel {
    pool: Arc<ChannelPool>,
}

impl BalancedChannel {
    /// 监听注册中心中的目标并返回可用的通道
    pub async fn from_registry(
        registry: &dyn Registry,
        target: &str,
        config: BalancerConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let (pool, balancer) = ChannelPool::start(config);
        let resolver_cancel = cancel.child_token();
        if let Err(e) = RegistryResolver::watch(registry, target, balancer, resolver_cancel.clone()).await {
            pool.close();
            return Err(e);
        }

        let shutdown = pool.clone();
        tokio::spawn(async move {
            resolver_cancel.cancelled().await;
            shutdown.close();
        });
        Ok(pool.channel())
    }

    pub fn pool(&self) -> &Arc<ChannelPool> {
        &self.pool
    }

    pub fn state(&self) -> ConnectivityState {
        self.pool.state()
    }
}

impl Service<http::Request<Body>> for BalancedChannel {
    type Response = http::Response<Body>;
    type Error = tower::BoxError;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<Body>) -> Self::Future {
        let picked = self.pool.pick(req.uri().path());
        Box::pin(async move {
            let (sub_conn, mut channel) = picked?;
            match channel.ready().await {
                Ok(ready) => match ready.call(req).await {
                    Ok(resp) => Ok(resp),
                    Err(e) => {
                        sub_conn.mark_broken(e.to_string());
                        Err(e.into())
                    }
                },
                Err(e) => {
                    sub_conn.mark_broken(e.to_string());
                    Err(e.into())
                }
            }
        })
    }
}
