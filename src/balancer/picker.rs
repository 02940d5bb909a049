//! 选址器实现

use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{PickInfo, PickResult, Picker, PickerBuildInfo, PickerBuilder, ReadySubConn, SubConn};
use crate::error::{Error, Result};

/// 每次选址都返回同一个错误
#[derive(Debug, Clone)]
pub struct ErrPicker {
    err: Error,
}

impl ErrPicker {
    pub fn new(err: Error) -> Self {
        Self { err }
    }
}

impl Picker for ErrPicker {
    fn pick(&self, _info: &PickInfo<'_>) -> Result<PickResult> {
        Err(self.err.clone())
    }
}

fn no_ready() -> Error {
    Error::no_addresses("no ready sub connection")
}

/// 轮询选址，起点随机，避免所有客户端同时打到第一个后端
#[derive(Debug)]
pub struct RoundRobinPicker {
    sub_conns: Vec<Arc<dyn SubConn>>,
    next: AtomicUsize,
}

impl RoundRobinPicker {
    pub fn new(sub_conns: Vec<Arc<dyn SubConn>>) -> Self {
        let start = if sub_conns.is_empty() {
            0
        } else {
            rand::thread_rng().gen_range(0..sub_conns.len())
        };
        Self {
            sub_conns,
            next: AtomicUsize::new(start),
        }
    }
}

impl Picker for RoundRobinPicker {
    fn pick(&self, _info: &PickInfo<'_>) -> Result<PickResult> {
        if self.sub_conns.is_empty() {
            return Err(no_ready());
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.sub_conns.len();
        Ok(PickResult {
            sub_conn: self.sub_conns[idx].clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobinPickerBuilder;

impl PickerBuilder for RoundRobinPickerBuilder {
    fn build(&self, info: PickerBuildInfo) -> Arc<dyn Picker> {
        let sub_conns = info.ready.into_iter().map(|r| r.sub_conn).collect();
        Arc::new(RoundRobinPicker::new(sub_conns))
    }
}

/// 路由内的候选连接及其权重分布
struct RouteTable {
    candidates: Vec<usize>,
    weights: WeightedIndex<i32>,
}

/// 按权重选址
///
/// 方法命中路由配置时，只在该路由上游节点中按节点权重选择；
/// 否则按实例权重在所有 Ready 连接中选择；权重全部无效时退化为轮询。
pub struct WeightedRoutePicker {
    ready: Vec<ReadySubConn>,
    routes: HashMap<String, RouteTable>,
    weights: Option<WeightedIndex<f64>>,
    fallback: RoundRobinPicker,
}

impl WeightedRoutePicker {
    pub fn new(info: PickerBuildInfo) -> Self {
        let mut routes = HashMap::new();
        for route in info.attributes.route_configs.values() {
            let (candidates, weights): (Vec<usize>, Vec<i32>) = info
                .ready
                .iter()
                .enumerate()
                .filter_map(|(idx, r)| {
                    route
                        .weight_of(&r.address.addr)
                        .filter(|w| *w > 0)
                        .map(|w| (idx, w))
                })
                .unzip();
            if let Ok(weights) = WeightedIndex::new(weights) {
                routes.insert(route.uri.clone(), RouteTable { candidates, weights });
            }
        }

        let instance_weights: Vec<f64> = info
            .ready
            .iter()
            .map(|r| {
                let w = r.address.weight();
                if w.is_finite() && w > 0.0 { w } else { 0.0 }
            })
            .collect();
        let weights = WeightedIndex::new(instance_weights).ok();

        let fallback = RoundRobinPicker::new(info.ready.iter().map(|r| r.sub_conn.clone()).collect());
        Self {
            ready: info.ready,
            routes,
            weights,
            fallback,
        }
    }
}

impl Picker for WeightedRoutePicker {
    fn pick(&self, info: &PickInfo<'_>) -> Result<PickResult> {
        if self.ready.is_empty() {
            return Err(no_ready());
        }

        let mut rng = rand::thread_rng();
        let idx = if let Some(table) = self.routes.get(info.method) {
            table.candidates[table.weights.sample(&mut rng)]
        } else if let Some(weights) = &self.weights {
            weights.sample(&mut rng)
        } else {
            return self.fallback.pick(info);
        };

        Ok(PickResult {
            sub_conn: self.ready[idx].sub_conn.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WeightedRoutePickerBuilder;

impl PickerBuilder for WeightedRoutePickerBuilder {
    fn build(&self, info: PickerBuildInfo) -> Arc<dyn Picker> {
        Arc::new(WeightedRoutePicker::new(info))
    }
}
