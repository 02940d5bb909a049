//! 基础均衡器
//!
//! 所有入口由同一把互斥锁串行化；当前 picker 通过替换 `Arc` 发布，选址路径不接触状态锁。

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::picker::ErrPicker;
use super::{
    Address, Attributes, BalancerState, ClientConn, ConnectivityState, ConnectivityStateEvaluator,
    PickInfo, PickResult, Picker, PickerBuildInfo, PickerBuilder, ReadySubConn, ResolverState,
    SubConn, SubConnId, SubConnState,
};
use crate::config::BalancerConfig;
use crate::error::{Error, Result};

struct Tracked {
    sub_conn: Arc<dyn SubConn>,
    address: Address,
}

struct State {
    /// 地址 -> 子连接
    sub_conns: HashMap<String, Tracked>,
    /// 子连接状态；被移除的子连接保留到报告 Shutdown 为止
    sc_states: HashMap<SubConnId, ConnectivityState>,
    evaluator: ConnectivityStateEvaluator,
    state: ConnectivityState,
    attributes: Arc<Attributes>,
    conn_err: Option<Error>,
}

pub struct BaseBalancer {
    cc: Arc<dyn ClientConn>,
    builder: Arc<dyn PickerBuilder>,
    config: BalancerConfig,
    inner: Mutex<State>,
    picker: RwLock<Arc<dyn Picker>>,
}

impl BaseBalancer {
    /// 创建均衡器，初始 picker 始终返回无可用连接
    pub fn new(
        cc: Arc<dyn ClientConn>,
        builder: Arc<dyn PickerBuilder>,
        config: BalancerConfig,
    ) -> Self {
        Self {
            cc,
            builder,
            config,
            inner: Mutex::new(State {
                sub_conns: HashMap::new(),
                sc_states: HashMap::new(),
                evaluator: ConnectivityStateEvaluator::default(),
                state: ConnectivityState::Idle,
                attributes: Arc::new(Attributes::default()),
                conn_err: None,
            }),
            picker: RwLock::new(Arc::new(ErrPicker::new(Error::no_addresses(
                "no sub connection available",
            )))),
        }
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    /// 当前聚合状态
    pub fn state(&self) -> ConnectivityState {
        self.inner.lock().state
    }

    /// 当前 picker
    pub fn picker(&self) -> Arc<dyn Picker> {
        self.picker.read().clone()
    }

    /// 使用当前 picker 选址
    pub fn pick(&self, info: &PickInfo<'_>) -> Result<PickResult> {
        self.picker().pick(info)
    }

    /// 当前跟踪的地址，按字典序排序
    pub fn addresses(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self.inner.lock().sub_conns.keys().cloned().collect();
        addrs.sort();
        addrs
    }

    /// 应用新的地址集合
    ///
    /// 新地址创建子连接并立即连接，消失的地址移除子连接，保留的地址只刷新属性。
    /// 空地址列表按解析器错误处理，不会移除任何已有连接。
    pub fn update_client_conn_state(&self, resolver_state: ResolverState) -> Result<()> {
        let mut inner = self.inner.lock();

        if resolver_state.addresses.is_empty() {
            let err = Error::no_addresses("resolver produced zero addresses");
            self.on_resolver_error(&mut inner, err.clone());
            return Err(err);
        }

        inner.attributes = Arc::new(resolver_state.attributes);

        let mut seen = HashSet::with_capacity(resolver_state.addresses.len());
        for address in resolver_state.addresses {
            seen.insert(address.addr.clone());
            if let Some(tracked) = inner.sub_conns.get_mut(&address.addr) {
                tracked.address = address;
                continue;
            }

            let sub_conn = match self.cc.new_sub_conn(&address) {
                Ok(sc) => sc,
                Err(e) => {
                    warn!(address = %address.addr, error = %e, "Failed to create sub connection");
                    continue;
                }
            };
            debug!(address = %address.addr, id = %sub_conn.id(), "Sub connection created");

            inner.sc_states.insert(sub_conn.id(), ConnectivityState::Idle);
            inner.state = inner
                .evaluator
                .record_transition(ConnectivityState::Shutdown, ConnectivityState::Idle);
            inner.sub_conns.insert(
                address.addr.clone(),
                Tracked {
                    sub_conn: sub_conn.clone(),
                    address,
                },
            );
            sub_conn.connect();
        }

        let removed: Vec<String> = inner
            .sub_conns
            .keys()
            .filter(|addr| !seen.contains(*addr))
            .cloned()
            .collect();
        for addr in removed {
            if let Some(tracked) = inner.sub_conns.remove(&addr) {
                debug!(address = %addr, id = %tracked.sub_conn.id(), "Sub connection removed");
                self.cc.remove_sub_conn(&tracked.sub_conn);
            }
        }

        self.regenerate_picker(&mut inner, None);
        self.publish(&inner);
        Ok(())
    }

    /// 应用子连接状态变更
    pub fn update_sub_conn_state(&self, sub_conn: &Arc<dyn SubConn>, update: SubConnState) {
        let mut inner = self.inner.lock();
        let id = sub_conn.id();
        let new = update.state;
        let Some(old) = inner.sc_states.get(&id).copied() else {
            debug!(id = %id, state = %new, "State change for unknown sub connection");
            return;
        };

        debug!(id = %id, address = sub_conn.addr(), from = %old, to = %new, "Sub connection state changed");
        inner.sc_states.insert(id, new);
        match new {
            ConnectivityState::Idle => sub_conn.connect(),
            ConnectivityState::Shutdown => {
                inner.sc_states.remove(&id);
            }
            ConnectivityState::TransientFailure => {
                if let Some(err) = &update.connection_error {
                    inner.conn_err = Some(err.clone());
                }
            }
            _ => {}
        }

        let old_aggregate = inner.state;
        inner.state = inner.evaluator.record_transition(old, new);

        let readiness_flipped =
            (new == ConnectivityState::Ready) != (old == ConnectivityState::Ready);
        let failure_crossed = (inner.state == ConnectivityState::TransientFailure)
            != (old_aggregate == ConnectivityState::TransientFailure);
        if readiness_flipped || failure_crossed {
            self.regenerate_picker(&mut inner, update.connection_error);
        }

        if inner.state != old_aggregate {
            info!(from = %old_aggregate, to = %inner.state, "Balancer state changed");
        }
        self.publish(&inner);
    }

    /// 解析器报错；已有 Ready 连接时忽略
    pub fn resolver_error(&self, err: Error) {
        let mut inner = self.inner.lock();
        self.on_resolver_error(&mut inner, err);
    }

    /// 只释放自身的簿记，连接回收由连接管理方负责
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.sub_conns.clear();
        inner.sc_states.clear();
        inner.evaluator = ConnectivityStateEvaluator::default();
        debug!("Balancer closed");
    }

    fn on_resolver_error(&self, inner: &mut State, err: Error) {
        if inner.sub_conns.is_empty() {
            inner.state = ConnectivityState::TransientFailure;
        }
        match inner.state {
            ConnectivityState::Ready | ConnectivityState::Shutdown => {
                debug!(error = %err, "Ignoring resolver error while ready");
            }
            _ => {
                warn!(error = %err, state = %inner.state, "Resolver error");
                *self.picker.write() = Arc::new(ErrPicker::new(err));
                self.publish(inner);
            }
        }
    }

    fn regenerate_picker(&self, inner: &mut State, err: Option<Error>) {
        let picker: Arc<dyn Picker> = if inner.state == ConnectivityState::TransientFailure {
            let err = err.or_else(|| inner.conn_err.clone()).unwrap_or_else(|| {
                Error::no_addresses("resolver returned no addresses")
            });
            Arc::new(ErrPicker::new(err))
        } else {
            let mut ready: Vec<ReadySubConn> = inner
                .sub_conns
                .values()
                .filter(|t| inner.sc_states.get(&t.sub_conn.id()) == Some(&ConnectivityState::Ready))
                .map(|t| ReadySubConn {
                    sub_conn: t.sub_conn.clone(),
                    address: t.address.clone(),
                })
                .collect();
            ready.sort_by(|a, b| a.address.addr.cmp(&b.address.addr));
            self.builder.build(PickerBuildInfo {
                ready,
                attributes: inner.attributes.clone(),
            })
        };
        *self.picker.write() = picker;
    }

    fn publish(&self, inner: &State) {
        self.cc.update_state(BalancerState {
            state: inner.state,
            picker: self.picker(),
        });
    }
}
