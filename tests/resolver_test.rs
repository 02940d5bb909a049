//! 解析器测试
//!
//! 端点快照到解析器状态的转换，以及注册中心 -> 解析器 -> 均衡器的完整链路。

mod common;

use common::{MockClientConn, eventually};
use flare_registry::balancer::{
    BaseBalancer, ConnectivityState, PickInfo, RegistryResolver, SubConnState,
    WeightedRoutePickerBuilder,
};
use flare_registry::kv::{KvClient, MemoryKv};
use flare_registry::registry::{Endpoints, EtcdRegistry, Registry, RouteConfig, Upstream, route_key};
use flare_registry::{BalancerConfig, RegistryConfig, ServiceInfo};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn hello_route(nodes: &[(&str, i32)]) -> RouteConfig {
    RouteConfig {
        id: "1".to_string(),
        scheme: "grpc".to_string(),
        uri: "/hello".to_string(),
        upstream: Upstream {
            nodes: nodes.iter().map(|(a, w)| (a.to_string(), *w)).collect(),
        },
        ..Default::default()
    }
}

#[test]
fn resolver_state_keeps_serving_nodes_only() {
    let mut endpoints = Endpoints::default();
    let mut disabled = ServiceInfo::new("svc", "grpc", "10.0.0.3:1");
    disabled.enable = false;
    let mut unhealthy = ServiceInfo::new("svc", "grpc", "10.0.0.4:1");
    unhealthy.healthy = false;
    for info in [
        ServiceInfo::new("svc", "grpc", "10.0.0.2:1"),
        ServiceInfo::new("svc", "grpc", "10.0.0.1:1").with_weight(7.0),
        disabled,
        unhealthy,
    ] {
        endpoints.nodes.insert(info.address.clone(), info);
    }
    endpoints
        .route_configs
        .insert("1".to_string(), hello_route(&[("10.0.0.1:1", 5)]));

    let state = RegistryResolver::resolver_state(&endpoints);

    let addrs: Vec<&str> = state.addresses.iter().map(|a| a.addr.as_str()).collect();
    assert_eq!(addrs, vec!["10.0.0.1:1", "10.0.0.2:1"]);
    assert_eq!(state.addresses[0].weight(), 7.0);
    assert_eq!(
        state.attributes.route_for("/hello").map(|r| r.id.as_str()),
        Some("1")
    );
    assert!(state.attributes.route_for("/other").is_none());
}

#[tokio::test]
async fn registry_changes_drive_the_balancer() {
    let kv = MemoryKv::new();
    let config = RegistryConfig::default()
        .with_prefix("jupiter")
        .with_retry_backoff(Duration::from_millis(100));
    let registry = EtcdRegistry::with_client(Arc::new(kv.clone()), config);

    let cc = MockClientConn::new();
    let balancer = Arc::new(BaseBalancer::new(
        cc.clone(),
        Arc::new(WeightedRoutePickerBuilder),
        BalancerConfig::default(),
    ));

    let a = ServiceInfo::new("service_1", "grpc", "10.10.10.1:9091");
    let b = ServiceInfo::new("service_1", "grpc", "10.10.10.1:9092");
    let mut sick = ServiceInfo::new("service_1", "grpc", "10.10.10.1:9093");
    sick.healthy = false;
    registry.register_service(&a).await.unwrap();
    registry.register_service(&sick).await.unwrap();

    let cancel = CancellationToken::new();
    let handle = RegistryResolver::watch(&registry, "grpc:service_1", balancer.clone(), cancel.clone())
        .await
        .unwrap();

    assert!(
        eventually(Duration::from_secs(3), || cc.created_addrs() == vec!["10.10.10.1:9091"]).await
    );

    registry.register_service(&b).await.unwrap();
    assert!(
        eventually(Duration::from_secs(3), || {
            balancer.addresses() == vec!["10.10.10.1:9091", "10.10.10.1:9092"]
        })
        .await
    );

    for addr in ["10.10.10.1:9091", "10.10.10.1:9092"] {
        balancer.update_sub_conn_state(
            &cc.sub_conn(addr),
            SubConnState::new(ConnectivityState::Ready),
        );
    }
    assert_eq!(balancer.state(), ConnectivityState::Ready);

    let key = route_key("jupiter", "service_1", "grpc", "1");
    let route = hello_route(&[("10.10.10.1:9092", 10)]);
    kv.put(&key, serde_json::to_vec(&route).unwrap(), None)
        .await
        .unwrap();

    let routed = eventually(Duration::from_secs(3), || {
        (0..20).all(|_| {
            balancer
                .pick(&PickInfo { method: "/hello" })
                .map(|r| r.sub_conn.addr() == "10.10.10.1:9092")
                .unwrap_or(false)
        })
    })
    .await;
    assert!(routed, "route config did not reach the picker");

    registry.unregister_service(&a).await.unwrap();
    assert!(eventually(Duration::from_secs(3), || cc.removed_addrs() == vec!["10.10.10.1:9091"]).await);

    registry.unregister_service(&b).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(balancer.addresses(), vec!["10.10.10.1:9092"]);
    assert_eq!(balancer.state(), ConnectivityState::Ready);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
    registry.close().await.unwrap();
}
