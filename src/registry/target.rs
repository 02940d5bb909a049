//! 服务目标解析

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::types::{ServiceInfo, ServiceKind};

/// 服务目标：`scheme:name[:version[:deployment]]`
///
/// 例如 `grpc:service_1`、`grpc:e2e.test:v1:dev`。版本和部署组为空时不参与过滤。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: String,
    pub name: String,
    pub version: Option<String>,
    pub deployment: Option<String>,
}

impl Target {
    pub fn new(scheme: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            name: name.into(),
            version: None,
            deployment: None,
        }
    }

    /// 服务下所有记录的前缀：`/<prefix>/<name>/`
    pub fn service_prefix(&self, prefix: &str) -> String {
        format!("/{}/{}/", prefix.trim_matches('/'), self.name)
    }

    /// 某一类记录的前缀：`/<prefix>/<name>/<kind>/<scheme>://`
    pub fn kind_prefix(&self, prefix: &str, kind: ServiceKind) -> String {
        format!(
            "{}{}/{}://",
            self.service_prefix(prefix),
            kind.registry_segment(),
            self.scheme
        )
    }

    /// 判断服务实例是否落在目标范围内
    pub fn matches(&self, info: &ServiceInfo) -> bool {
        info.scheme == self.scheme
            && self.version.as_ref().is_none_or(|v| *v == info.version)
            && self.deployment.as_ref().is_none_or(|d| *d == info.deployment)
    }
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if !(2..=4).contains(&parts.len()) || parts[0].is_empty() || parts[1].is_empty() {
            return Err(Error::InvalidTarget(s.to_string()));
        }

        let optional = |idx: usize| {
            parts
                .get(idx)
                .filter(|part| !part.is_empty())
                .map(|part| part.to_string())
        };

        Ok(Self {
            scheme: parts[0].to_string(),
            name: parts[1].to_string(),
            version: optional(2),
            deployment: optional(3),
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme, self.name)?;
        match (&self.version, &self.deployment) {
            (Some(v), Some(d)) => write!(f, ":{}:{}", v, d),
            (Some(v), None) => write!(f, ":{}", v),
            (None, Some(d)) => write!(f, "::{}", d),
            (None, None) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_short_and_full_targets() {
        let target: Target = "grpc:service_1".parse().unwrap();
        assert_eq!(target, Target::new("grpc", "service_1"));

        let target: Target = "grpc:e2e.test:v1:dev".parse().unwrap();
        assert_eq!(target.version.as_deref(), Some("v1"));
        assert_eq!(target.deployment.as_deref(), Some("dev"));
        assert_eq!(target.to_string(), "grpc:e2e.test:v1:dev");

        let target: Target = "grpc:svc::canary".parse().unwrap();
        assert_eq!(target.version, None);
        assert_eq!(target.to_string(), "grpc:svc::canary");
    }

    #[test]
    fn rejects_malformed_targets() {
        for raw in ["", "grpc", ":svc", "grpc:", "a:b:c:d:e"] {
            assert!(
                matches!(raw.parse::<Target>(), Err(Error::InvalidTarget(_))),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn prefixes_follow_key_layout() {
        let target = Target::new("grpc", "service_1");
        assert_eq!(target.service_prefix("/jupiter/"), "/jupiter/service_1/");
        assert_eq!(
            target.kind_prefix("jupiter", ServiceKind::Provider),
            "/jupiter/service_1/providers/grpc://"
        );
    }

    #[test]
    fn filters_on_version_and_deployment() {
        let info = ServiceInfo::new("svc", "grpc", "127.0.0.1:1").with_deployment("dev");
        assert!("grpc:svc".parse::<Target>().unwrap().matches(&info));
        assert!("grpc:svc:v1:dev".parse::<Target>().unwrap().matches(&info));
        assert!(!"grpc:svc:v2".parse::<Target>().unwrap().matches(&info));
        assert!(!"grpc:svc::prod".parse::<Target>().unwrap().matches(&info));
        assert!(!"http:svc".parse::<Target>().unwrap().matches(&info));
    }
}
