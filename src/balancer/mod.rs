//! 客户端负载均衡模块
//!
//! 把不断变化的地址集合转换为连接生命周期决策和请求选址器：
//! - [`BaseBalancer`]：地址差量、子连接状态聚合、picker 重建
//! - [`picker`]：轮询与按路由权重的 picker
//! - [`RegistryResolver`]：把注册中心的端点快照喂给均衡器
//! - [`ChannelPool`] / [`BalancedChannel`]：基于 tonic 的连接池，可直接作为 tonic 传输层

pub mod base;
pub mod channel;
pub mod picker;
pub mod resolver;

pub use base::BaseBalancer;
pub use channel::{BalancedChannel, ChannelPool};
pub use picker::{ErrPicker, RoundRobinPickerBuilder, WeightedRoutePickerBuilder};
pub use resolver::RegistryResolver;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::PickPolicy;
use crate::error::{Error, Result};
use crate::registry::RouteConfig;
use crate::types::ServiceInfo;

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl ConnectivityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectivityState::Idle => "IDLE",
            ConnectivityState::Connecting => "CONNECTING",
            ConnectivityState::Ready => "READY",
            ConnectivityState::TransientFailure => "TRANSIENT_FAILURE",
            ConnectivityState::Shutdown => "SHUTDOWN",
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 把多个子连接状态汇总为一个聚合状态
///
/// 优先级：Ready > Connecting > Idle > TransientFailure。Shutdown 不计数。
#[derive(Debug, Default, Clone)]
pub struct ConnectivityStateEvaluator {
    num_ready: i64,
    num_connecting: i64,
    num_idle: i64,
    num_transient_failure: i64,
}

impl ConnectivityStateEvaluator {
    /// 记录一次状态迁移并返回新的聚合状态
    pub fn record_transition(
        &mut self,
        old: ConnectivityState,
        new: ConnectivityState,
    ) -> ConnectivityState {
        for (state, delta) in [(old, -1), (new, 1)] {
            match state {
                ConnectivityState::Ready => self.num_ready += delta,
                ConnectivityState::Connecting => self.num_connecting += delta,
                ConnectivityState::Idle => self.num_idle += delta,
                ConnectivityState::TransientFailure => self.num_transient_failure += delta,
                ConnectivityState::Shutdown => {}
            }
        }
        self.current_state()
    }

    pub fn current_state(&self) -> ConnectivityState {
        if self.num_ready > 0 {
            ConnectivityState::Ready
        } else if self.num_connecting > 0 {
            ConnectivityState::Connecting
        } else if self.num_idle > 0 {
            ConnectivityState::Idle
        } else {
            ConnectivityState::TransientFailure
        }
    }
}

/// 解析出的后端地址
#[derive(Debug, Clone, PartialEq)]
pub struct Address {
    /// `host:port`
    pub addr: String,
    /// 注册中心中的实例信息
    pub info: Option<ServiceInfo>,
}

impl Address {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            info: None,
        }
    }

    pub fn with_info(mut self, info: ServiceInfo) -> Self {
        self.info = Some(info);
        self
    }

    /// 实例权重，没有实例信息时为 0
    pub fn weight(&self) -> f64 {
        self.info.as_ref().map(|i| i.weight).unwrap_or_default()
    }
}

/// 解析器附带的路由属性
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes {
    /// 路由 ID -> 路由配置
    pub route_configs: HashMap<String, RouteConfig>,
}

impl Attributes {
    /// 查找 URI 与方法一致的路由
    pub fn route_for(&self, method: &str) -> Option<&RouteConfig> {
        self.route_configs.values().find(|route| route.uri == method)
    }
}

/// 解析器状态
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolverState {
    pub addresses: Vec<Address>,
    pub attributes: Attributes,
}

/// 子连接标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubConnId(pub u64);

impl fmt::Display for SubConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subconn-{}", self.0)
    }
}

/// 到单个后端的连接
pub trait SubConn: Send + Sync + fmt::Debug {
    fn id(&self) -> SubConnId;

    fn addr(&self) -> &str;

    /// 请求建立连接，结果通过状态变更异步通知
    fn connect(&self);
}

/// 子连接状态变更
#[derive(Debug, Clone)]
pub struct SubConnState {
    pub state: ConnectivityState,
    pub connection_error: Option<Error>,
}

impl SubConnState {
    pub fn new(state: ConnectivityState) -> Self {
        Self {
            state,
            connection_error: None,
        }
    }

    pub fn failed(error: Error) -> Self {
        Self {
            state: ConnectivityState::TransientFailure,
            connection_error: Some(error),
        }
    }
}

/// 均衡器发布的状态
#[derive(Clone)]
pub struct BalancerState {
    pub state: ConnectivityState,
    pub picker: Arc<dyn Picker>,
}

/// 连接管理方，负责真正的连接创建与回收
pub trait ClientConn: Send + Sync {
    fn new_sub_conn(&self, address: &Address) -> Result<Arc<dyn SubConn>>;

    fn remove_sub_conn(&self, sub_conn: &Arc<dyn SubConn>);

    fn update_state(&self, state: BalancerState);
}

/// 单次选址信息
#[derive(Debug, Clone, Copy)]
pub struct PickInfo<'a> {
    /// 完整方法路径，例如 `/helloworld.Greeter/SayHello`
    pub method: &'a str,
}

/// 选址结果
#[derive(Debug, Clone)]
pub struct PickResult {
    pub sub_conn: Arc<dyn SubConn>,
}

/// 请求选址器，每次调用都会使用，必须无锁或只持有短锁
pub trait Picker: Send + Sync {
    fn pick(&self, info: &PickInfo<'_>) -> Result<PickResult>;
}

/// 就绪子连接
#[derive(Debug, Clone)]
pub struct ReadySubConn {
    pub sub_conn: Arc<dyn SubConn>,
    pub address: Address,
}

/// 构建 picker 所需的信息
#[derive(Debug, Clone, Default)]
pub struct PickerBuildInfo {
    /// 当前所有 Ready 的子连接
    pub ready: Vec<ReadySubConn>,
    pub attributes: Arc<Attributes>,
}

pub trait PickerBuilder: Send + Sync {
    fn build(&self, info: PickerBuildInfo) -> Arc<dyn Picker>;
}

/// 按策略创建 picker 构建器
pub fn picker_builder(policy: PickPolicy) -> Arc<dyn PickerBuilder> {
    match policy {
        PickPolicy::RoundRobin => Arc::new(RoundRobinPickerBuilder),
        PickPolicy::Weighted => Arc::new(WeightedRoutePickerBuilder),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectivityState::*;

    #[test]
    fn evaluator_precedence() {
        let mut eval = ConnectivityStateEvaluator::default();
        assert_eq!(eval.record_transition(Shutdown, Idle), Idle);
        assert_eq!(eval.record_transition(Shutdown, Idle), Idle);
        assert_eq!(eval.record_transition(Idle, Connecting), Connecting);
        assert_eq!(eval.record_transition(Idle, TransientFailure), Connecting);
        assert_eq!(eval.record_transition(Connecting, Ready), Ready);
        assert_eq!(eval.record_transition(Ready, TransientFailure), TransientFailure);
        assert_eq!(eval.record_transition(TransientFailure, Shutdown), TransientFailure);
        assert_eq!(eval.record_transition(TransientFailure, Shutdown), TransientFailure);
    }

    #[test]
    fn route_lookup_by_method() {
        let mut attributes = Attributes::default();
        attributes.route_configs.insert(
            "1".to_string(),
            RouteConfig {
                id: "1".to_string(),
                uri: "/hello".to_string(),
                ..Default::default()
            },
        );
        assert_eq!(attributes.route_for("/hello").map(|r| r.id.as_str()), Some("1"));
        assert!(attributes.route_for("/bye").is_none());
    }
}
