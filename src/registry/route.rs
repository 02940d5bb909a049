//! 配置者记录：路由配置与客户端配置

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 路由配置，把一条路由映射到节点权重表，用于按比例引流（灰度）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    pub id: String,
    pub scheme: String,
    pub host: String,
    pub deployment: String,
    /// 匹配的方法路径，例如 `/hello`
    pub uri: String,
    pub upstream: Upstream,
}

/// 上游节点权重表
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Upstream {
    pub nodes: HashMap<String, i32>,
}

impl RouteConfig {
    /// 节点在该路由下的权重，未出现的节点返回 `None`
    pub fn weight_of(&self, address: &str) -> Option<i32> {
        self.upstream.nodes.get(address).copied()
    }
}

/// 客户端配置：路由策略与服务端标签
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub routes: Vec<Route>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Route {
    /// 路由方法名
    pub method: String,
    /// 按比率在各个权重组中分配流量
    pub weight_groups: Vec<WeightGroup>,
    /// 将流量导入的部署组
    pub deployment: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightGroup {
    pub group: String,
    pub weight: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_route_value() {
        let raw = r#"{"id":"1","scheme":"grpc","host":"","deployment":"openapi","uri":"/hello",
            "upstream":{"nodes":{"10.10.10.1:9091":1,"10.10.10.1:9092":10}}}"#;
        let route: RouteConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(route.uri, "/hello");
        assert_eq!(route.weight_of("10.10.10.1:9092"), Some(10));
        assert_eq!(route.weight_of("10.10.10.1:9093"), None);
    }

    #[test]
    fn decodes_configuration_value() {
        let raw = r#"{"routes":[{"method":"/hello","weightGroups":[{"group":"red","weight":3}],
            "deployment":"canary"}],"labels":{"group":"red"}}"#;
        let config: Configuration = serde_json::from_str(raw).unwrap();
        assert_eq!(config.routes[0].weight_groups[0].weight, 3);
        assert_eq!(config.labels["group"], "red");
    }
}
