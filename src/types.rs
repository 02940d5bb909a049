//! 服务实例数据模型

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::app::AppIdentity;

/// 服务记录类型
///
/// 同一个逻辑服务按用途拆分为提供者、配置者、消费者三类记录，分别写在不同的键子前缀下。
/// JSON 中以数字表示，同时兼容子前缀名称。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "KindRepr", into = "u8")]
pub enum ServiceKind {
    #[default]
    Unknown,
    Provider,
    Configurator,
    Consumer,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum KindRepr {
    Code(u8),
    Name(String),
}

impl TryFrom<KindRepr> for ServiceKind {
    type Error = String;

    fn try_from(repr: KindRepr) -> Result<Self, Self::Error> {
        match repr {
            KindRepr::Code(0) => Ok(ServiceKind::Unknown),
            KindRepr::Code(1) => Ok(ServiceKind::Provider),
            KindRepr::Code(2) => Ok(ServiceKind::Configurator),
            KindRepr::Code(3) => Ok(ServiceKind::Consumer),
            KindRepr::Code(code) => Err(format!("unknown service kind code {}", code)),
            KindRepr::Name(name) => Ok(ServiceKind::from_segment(&name)),
        }
    }
}

impl From<ServiceKind> for u8 {
    fn from(kind: ServiceKind) -> Self {
        match kind {
            ServiceKind::Unknown => 0,
            ServiceKind::Provider => 1,
            ServiceKind::Configurator => 2,
            ServiceKind::Consumer => 3,
        }
    }
}

impl ServiceKind {
    /// 键中的子前缀名称
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Provider => "providers",
            ServiceKind::Configurator => "configurators",
            ServiceKind::Consumer => "consumers",
            ServiceKind::Unknown => "unknown",
        }
    }

    /// 解析键中的子前缀名称，无法识别时返回 `Unknown`
    pub fn from_segment(segment: &str) -> Self {
        match segment {
            "providers" => ServiceKind::Provider,
            "configurators" => ServiceKind::Configurator,
            "consumers" => ServiceKind::Consumer,
            _ => ServiceKind::Unknown,
        }
    }

    /// 注册时使用的子前缀；未声明类型的实例按提供者注册
    pub fn registry_segment(&self) -> &'static str {
        match self {
            ServiceKind::Unknown => ServiceKind::Provider.as_str(),
            kind => kind.as_str(),
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 服务实例信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub name: String,
    #[serde(default)]
    pub app_id: String,
    pub scheme: String,
    pub address: String,
    #[serde(default)]
    pub weight: f64,
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub healthy: bool,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub kind: ServiceKind,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub hostname: String,
    /// 部署组：不同组之间流量隔离
    #[serde(default)]
    pub deployment: String,
    /// 流量组：流量在组之间进行负载均衡
    #[serde(default)]
    pub group: String,
}

impl ServiceInfo {
    /// 创建只包含必要字段的服务信息
    pub fn new(
        name: impl Into<String>,
        scheme: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            app_id: String::new(),
            scheme: scheme.into(),
            address: address.into(),
            weight: 100.0,
            enable: true,
            healthy: true,
            metadata: HashMap::new(),
            region: String::new(),
            zone: String::new(),
            kind: ServiceKind::Provider,
            version: "v1".to_string(),
            mode: String::new(),
            hostname: String::new(),
            deployment: String::new(),
            group: String::new(),
        }
    }

    /// 基于进程身份构造默认服务信息
    ///
    /// 启动时间、构建时间、应用版本和实例 ID 作为元数据注入。
    pub fn from_identity(identity: &AppIdentity) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("startTime".to_string(), identity.start_time.clone());
        metadata.insert("buildTime".to_string(), identity.build_time.clone());
        metadata.insert("appVersion".to_string(), identity.app_version.clone());
        metadata.insert("instanceId".to_string(), identity.instance_id());
        metadata.insert(
            "registryVersion".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        );

        Self {
            name: identity.name.clone(),
            app_id: identity.app_id.clone(),
            scheme: String::new(),
            address: String::new(),
            weight: 100.0,
            enable: true,
            healthy: true,
            metadata,
            region: identity.region.clone(),
            zone: identity.zone.clone(),
            kind: ServiceKind::Unknown,
            version: "v1".to_string(),
            mode: identity.mode.clone(),
            hostname: identity.hostname.clone(),
            deployment: String::new(),
            group: String::new(),
        }
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_kind(mut self, kind: ServiceKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_deployment(mut self, deployment: impl Into<String>) -> Self {
        self.deployment = deployment.into();
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// `scheme://address`
    pub fn label(&self) -> String {
        format!("{}://{}", self.scheme, self.address)
    }

    /// 存储中的键：`/<prefix>/<name>/<kind>/<scheme>://<address>`
    pub fn registry_key(&self, prefix: &str) -> String {
        format!(
            "/{}/{}/{}/{}://{}",
            prefix.trim_matches('/'),
            self.name,
            self.kind.registry_segment(),
            self.scheme,
            self.address
        )
    }

    /// 是否可以接收流量
    pub fn is_serving(&self) -> bool {
        self.enable && self.healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_key_layout() {
        let info = ServiceInfo::new("service_1", "grpc", "10.10.10.1:9091");
        assert_eq!(
            info.registry_key("jupiter"),
            "/jupiter/service_1/providers/grpc://10.10.10.1:9091"
        );

        let consumer = info.clone().with_kind(ServiceKind::Consumer);
        assert_eq!(
            consumer.registry_key("/jupiter/"),
            "/jupiter/service_1/consumers/grpc://10.10.10.1:9091"
        );
    }

    #[test]
    fn unknown_kind_registers_as_provider() {
        let info = ServiceInfo::new("svc", "grpc", "127.0.0.1:1").with_kind(ServiceKind::Unknown);
        assert_eq!(info.registry_key("p"), "/p/svc/providers/grpc://127.0.0.1:1");
    }

    #[test]
    fn kind_accepts_codes_and_names() {
        let kind: ServiceKind = serde_json::from_str("2").unwrap();
        assert_eq!(kind, ServiceKind::Configurator);
        let kind: ServiceKind = serde_json::from_str("\"consumers\"").unwrap();
        assert_eq!(kind, ServiceKind::Consumer);
        assert_eq!(serde_json::to_string(&ServiceKind::Provider).unwrap(), "1");
        assert!(serde_json::from_str::<ServiceKind>("9").is_err());
    }

    #[test]
    fn empty_metadata_survives_json() {
        let info = ServiceInfo::new("svc", "grpc", "127.0.0.1:1");
        let encoded = serde_json::to_string(&info).unwrap();
        assert!(encoded.contains("\"metadata\":{}"));
        assert!(encoded.contains("\"appId\""));
        let decoded: ServiceInfo = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, info);
    }
}
