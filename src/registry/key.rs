//! 存储键解析
//!
//! 服务下的记录键形如：
//! - `/<prefix>/<name>/providers/<scheme>://<address>`
//! - `/<prefix>/<name>/consumers/<scheme>://<address>`
//! - `/<prefix>/<name>/configurators/<scheme>://<address>`
//! - `/<prefix>/<name>/configurators/<scheme>:///routes/<id>`
//!
//! 写入时地址前只有两个斜杠；解析时也接受 `<scheme>:///<address>`。

/// 解析后的记录键
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordKey {
    Provider { scheme: String, address: String },
    Consumer { scheme: String, address: String },
    Configuration { scheme: String, address: String },
    Route { scheme: String, id: String },
}

impl RecordKey {
    /// 在服务前缀 `/<prefix>/<name>/` 下解析键，无法识别时返回 `None`
    pub fn parse(service_prefix: &str, key: &str) -> Option<Self> {
        let rest = key.strip_prefix(service_prefix)?;
        let (kind, tail) = rest.split_once('/')?;
        let (scheme, locator) = tail.split_once("://")?;
        if scheme.is_empty() {
            return None;
        }
        let scheme = scheme.to_string();

        if kind == "configurators"
            && let Some(id) = locator.strip_prefix("/routes/")
        {
            if id.is_empty() {
                return None;
            }
            return Some(RecordKey::Route {
                scheme,
                id: id.to_string(),
            });
        }

        // 同时接受 `scheme:///address` 形式
        let address = locator.trim_start_matches('/');
        if address.is_empty() {
            return None;
        }
        let address = address.to_string();
        match kind {
            "providers" => Some(RecordKey::Provider { scheme, address }),
            "consumers" => Some(RecordKey::Consumer { scheme, address }),
            "configurators" => Some(RecordKey::Configuration { scheme, address }),
            _ => None,
        }
    }

    pub fn scheme(&self) -> &str {
        match self {
            RecordKey::Provider { scheme, .. }
            | RecordKey::Consumer { scheme, .. }
            | RecordKey::Configuration { scheme, .. }
            | RecordKey::Route { scheme, .. } => scheme,
        }
    }
}

/// 路由配置的存储键
pub fn route_key(prefix: &str, name: &str, scheme: &str, id: &str) -> String {
    format!(
        "/{}/{}/configurators/{}:///routes/{}",
        prefix.trim_matches('/'),
        name,
        scheme,
        id
    )
}
