//! 一致性 KV 存储抽象
//!
//! 注册中心只依赖这里定义的契约：读取、带租约写入、删除、从指定版本开始的前缀监听，
//! 以及租约的授予、续约、撤销和 TTL 查询。
//!
//! - [`EtcdKv`]：基于 etcd v3 的实现
//! - [`MemoryKv`]：进程内的 MVCC 实现，用于测试和本地开发

pub mod etcd;
pub mod memory;

pub use etcd::EtcdKv;
pub use memory::MemoryKv;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;

/// 租约 ID，0 表示没有租约
pub type LeaseId = i64;

/// 存储中的一条记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub mod_revision: i64,
    pub lease: LeaseId,
}

/// 读取结果以及读取时的存储版本
#[derive(Debug, Clone, Default)]
pub struct GetResponse {
    pub kvs: Vec<KeyValue>,
    pub revision: i64,
}

/// 监听事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put {
        key: String,
        value: Vec<u8>,
        mod_revision: i64,
    },
    Delete {
        key: String,
        mod_revision: i64,
    },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put { key, .. } | WatchEvent::Delete { key, .. } => key,
        }
    }

    pub fn mod_revision(&self) -> i64 {
        match self {
            WatchEvent::Put { mod_revision, .. } | WatchEvent::Delete { mod_revision, .. } => {
                *mod_revision
            }
        }
    }
}

/// 一次监听响应
///
/// `compact_revision > 0` 表示请求的起始版本已被压缩，此时 `canceled` 为 true，
/// 监听方需要重新全量读取。
#[derive(Debug, Clone, Default)]
pub struct WatchBatch {
    pub revision: i64,
    pub compact_revision: i64,
    pub canceled: bool,
    pub events: Vec<WatchEvent>,
}

/// 监听流，流结束或返回错误都表示需要重新订阅
pub type WatchStream = BoxStream<'static, Result<WatchBatch>>;

/// 租约续约句柄
#[async_trait]
pub trait LeaseKeeper: Send {
    /// 发送一次续约，返回剩余 TTL（秒）；`<= 0` 表示租约已不存在
    async fn keep_alive(&mut self) -> Result<i64>;
}

/// KV 客户端契约
#[async_trait]
pub trait KvClient: Send + Sync {
    /// 读取单个键
    async fn get(&self, key: &str) -> Result<GetResponse>;

    /// 按前缀读取
    async fn get_prefix(&self, prefix: &str) -> Result<GetResponse>;

    /// 写入，`lease` 不为空时绑定租约；返回写入后的版本
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<i64>;

    /// 删除单个键，返回删除的数量
    async fn delete(&self, key: &str) -> Result<u64>;

    /// 监听前缀，`from_revision <= 0` 表示从当前开始
    async fn watch(&self, prefix: &str, from_revision: i64) -> Result<WatchStream>;

    /// 授予租约
    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId>;

    /// 打开续约通道
    async fn keep_alive(&self, lease: LeaseId) -> Result<Box<dyn LeaseKeeper>>;

    /// 撤销租约，绑定的键随之删除
    async fn revoke(&self, lease: LeaseId) -> Result<()>;

    /// 查询租约剩余 TTL，租约不存在时返回 `None`
    async fn time_to_live(&self, lease: LeaseId) -> Result<Option<i64>>;
}
