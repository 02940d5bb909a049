//! 注册中心与负载均衡统一错误处理
//!
//! 后台任务（续约、监听）中的可重试错误只记录日志并重试，
//! 前台调用（注册、注销、列举、选址）中的错误直接返回给调用方。

pub mod code;

pub use code::{ErrorCategory, ErrorCode};

use thiserror::Error;

/// 统一错误类型
///
/// 所有变体只携带字符串描述，保证 `Clone`，便于错误 picker 在每次选址时重复返回同一个错误。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// 存储不可达或请求超时
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// 服务信息编解码失败
    #[error("serialization error: {0}")]
    Serialization(String),

    /// 租约已过期或被撤销（内部信号，驱动自愈重注册）
    #[error("lease {0} expired")]
    LeaseExpired(i64),

    /// 没有可用的连接
    #[error("no addresses available: {0}")]
    NoAddressesAvailable(String),

    /// 解析器提供的信息已过期
    #[error("resolver stale: {0}")]
    ResolverStale(String),

    /// 连接建立失败
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// 服务信息不完整
    #[error("invalid service: {0}")]
    InvalidService(String),

    /// 目标格式错误，期望 `scheme:name[:version[:deployment]]`
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// 配置错误
    #[error("configuration error: {0}")]
    Configuration(String),

    /// 组件已关闭
    #[error("{0} is closed")]
    Closed(String),
}

impl Error {
    /// 获取错误代码
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::StoreUnavailable(_) => ErrorCode::StoreUnavailable,
            Error::Serialization(_) => ErrorCode::SerializationError,
            Error::LeaseExpired(_) => ErrorCode::LeaseExpired,
            Error::NoAddressesAvailable(_) => ErrorCode::NoAddressesAvailable,
            Error::ResolverStale(_) => ErrorCode::ResolverStale,
            Error::ConnectionFailed(_) => ErrorCode::ConnectionFailed,
            Error::InvalidService(_) => ErrorCode::InvalidParameter,
            Error::InvalidTarget(_) => ErrorCode::InvalidTarget,
            Error::Configuration(_) => ErrorCode::ConfigurationError,
            Error::Closed(_) => ErrorCode::ConnectionClosed,
        }
    }

    /// 判断是否为可重试的错误
    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }

    /// 创建存储不可用错误
    pub fn store_unavailable(reason: impl Into<String>) -> Self {
        Error::StoreUnavailable(reason.into())
    }

    /// 创建无可用地址错误
    pub fn no_addresses(reason: impl Into<String>) -> Self {
        Error::NoAddressesAvailable(reason.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<etcd_client::Error> for Error {
    fn from(err: etcd_client::Error) -> Self {
        Error::StoreUnavailable(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::StoreUnavailable("operation timed out".to_string())
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_failures_map_to_serialization() {
        let err: Error = serde_json::from_str::<u32>("not-a-number").unwrap_err().into();
        assert_eq!(err.code(), ErrorCode::SerializationError);
        assert!(!err.is_retryable());
    }

    #[test]
    fn store_errors_are_retryable() {
        let err = Error::store_unavailable("connection refused");
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "store unavailable: connection refused");
    }
}
