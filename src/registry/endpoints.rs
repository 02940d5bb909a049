//! 服务端点快照

use serde::Serialize;
use std::collections::HashMap;

use super::key::RecordKey;
use super::route::{Configuration, RouteConfig};
use super::target::Target;
use crate::error::Result;
use crate::types::ServiceInfo;

/// 一个逻辑服务的完整端点快照
///
/// 每批监听事件之后重建并整体发送，消费方直接替换旧快照即可。
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Endpoints {
    /// 服务提供者，按地址索引
    pub nodes: HashMap<String, ServiceInfo>,
    /// 路由配置，按路由 ID 索引
    pub route_configs: HashMap<String, RouteConfig>,
    /// 客户端配置，按地址索引
    pub configurations: HashMap<String, Configuration>,
    /// 服务消费者，按地址索引
    pub consumers: HashMap<String, ServiceInfo>,
    /// 快照对应的存储版本
    pub revision: i64,
}

impl Endpoints {
    /// 应用一次写入；与目标协议不符的记录被忽略，版本或部署组不匹配的节点被移出快照
    pub fn apply_put(&mut self, target: &Target, record: RecordKey, value: &[u8]) -> Result<()> {
        if record.scheme() != target.scheme {
            return Ok(());
        }

        match record {
            RecordKey::Provider { address, .. } => {
                let info: ServiceInfo = serde_json::from_slice(value)?;
                if target.matches(&info) {
                    self.nodes.insert(address, info);
                } else {
                    self.nodes.remove(&address);
                }
            }
            RecordKey::Consumer { address, .. } => {
                let info: ServiceInfo = serde_json::from_slice(value)?;
                self.consumers.insert(address, info);
            }
            RecordKey::Configuration { address, .. } => {
                let config: Configuration = serde_json::from_slice(value)?;
                self.configurations.insert(address, config);
            }
            RecordKey::Route { id, .. } => {
                let route: RouteConfig = serde_json::from_slice(value)?;
                self.route_configs.insert(id, route);
            }
        }
        Ok(())
    }

    /// 应用一次删除
    pub fn apply_delete(&mut self, record: &RecordKey) {
        match record {
            RecordKey::Provider { address, .. } => {
                self.nodes.remove(address);
            }
            RecordKey::Consumer { address, .. } => {
                self.consumers.remove(address);
            }
            RecordKey::Configuration { address, .. } => {
                self.configurations.remove(address);
            }
            RecordKey::Route { id, .. } => {
                self.route_configs.remove(id);
            }
        }
    }

    /// 可以接收流量的节点，按地址排序
    pub fn serving_nodes(&self) -> Vec<&ServiceInfo> {
        let mut nodes: Vec<&ServiceInfo> = self.nodes.values().filter(|n| n.is_serving()).collect();
        nodes.sort_by(|a, b| a.address.cmp(&b.address));
        nodes
    }

    /// 所有节点地址，按字典序排序
    pub fn addresses(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self.nodes.keys().cloned().collect();
        addrs.sort();
        addrs
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(address: &str) -> RecordKey {
        RecordKey::Provider {
            scheme: "grpc".to_string(),
            address: address.to_string(),
        }
    }

    #[test]
    fn put_and_delete_providers() {
        let target = Target::new("grpc", "svc");
        let mut endpoints = Endpoints::default();
        let info = ServiceInfo::new("svc", "grpc", "10.0.0.1:80");
        let value = serde_json::to_vec(&info).unwrap();

        endpoints.apply_put(&target, provider("10.0.0.1:80"), &value).unwrap();
        assert_eq!(endpoints.addresses(), vec!["10.0.0.1:80".to_string()]);

        endpoints.apply_delete(&provider("10.0.0.1:80"));
        assert!(endpoints.is_empty());
    }

    #[test]
    fn version_change_moves_node_out_of_target() {
        let target: Target = "grpc:svc:v1".parse().unwrap();
        let mut endpoints = Endpoints::default();
        let info = ServiceInfo::new("svc", "grpc", "10.0.0.1:80");
        endpoints
            .apply_put(&target, provider("10.0.0.1:80"), &serde_json::to_vec(&info).unwrap())
            .unwrap();

        let upgraded = info.with_version("v2");
        endpoints
            .apply_put(&target, provider("10.0.0.1:80"), &serde_json::to_vec(&upgraded).unwrap())
            .unwrap();
        assert!(endpoints.is_empty());
    }

    #[test]
    fn malformed_value_is_an_error_without_side_effects() {
        let target = Target::new("grpc", "svc");
        let mut endpoints = Endpoints::default();
        assert!(endpoints.apply_put(&target, provider("10.0.0.1:80"), b"{oops").is_err());
        assert!(endpoints.is_empty());
    }

    #[test]
    fn other_schemes_are_ignored() {
        let target = Target::new("http", "svc");
        let mut endpoints = Endpoints::default();
        endpoints.apply_put(&target, provider("10.0.0.1:80"), b"{oops").unwrap();
        assert!(endpoints.is_empty());
    }

    #[test]
    fn serving_nodes_skip_disabled_instances() {
        let target = Target::new("grpc", "svc");
        let mut endpoints = Endpoints::default();
        let mut down = ServiceInfo::new("svc", "grpc", "10.0.0.2:80");
        down.healthy = false;
        for info in [ServiceInfo::new("svc", "grpc", "10.0.0.1:80"), down] {
            let record = provider(&info.address);
            endpoints
                .apply_put(&target, record, &serde_json::to_vec(&info).unwrap())
                .unwrap();
        }
        let serving: Vec<_> = endpoints.serving_nodes().iter().map(|n| n.address.clone()).collect();
        assert_eq!(serving, vec!["10.0.0.1:80".to_string()]);
    }
}
